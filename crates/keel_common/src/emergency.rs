//! Emergency restart for the stack-down window
//!
//! Update, rollback and restore stop every service before relaunching. A
//! `StackDownGuard` is armed right before the first stop and disarmed once
//! the relaunch returned. If the guard is dropped while still armed (early
//! return, panic) or the process receives SIGINT/SIGTERM in between, every
//! cataloged service is started again from whatever configuration is on disk.

use crate::catalog::ServiceCatalog;
use crate::ops_log::OpsLog;
use crate::paths::KeelPaths;
use crate::runtime::ContainerRuntime;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

struct ArmedTarget {
    id: u64,
    runtime: Arc<dyn ContainerRuntime>,
    paths: KeelPaths,
    operation: String,
}

static ARMED: Mutex<Vec<ArmedTarget>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn armed() -> MutexGuard<'static, Vec<ArmedTarget>> {
    ARMED.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Scoped "services are down" marker
#[must_use = "dropping the guard immediately restarts the stack"]
pub struct StackDownGuard {
    id: u64,
    disarmed: bool,
}

impl StackDownGuard {
    /// Register the emergency restart; call right before stopping services
    pub fn arm(runtime: Arc<dyn ContainerRuntime>, paths: &KeelPaths, operation: &str) -> Self {
        let id = NEXT_ID.fetch_add(1, Ordering::SeqCst);
        armed().push(ArmedTarget {
            id,
            runtime,
            paths: paths.clone(),
            operation: operation.to_string(),
        });
        info!("Emergency restart armed for {}", operation);
        Self { id, disarmed: false }
    }

    /// Services were relaunched (successfully or not); no emergency restart
    pub fn disarm(mut self) {
        self.disarmed = true;
        take(self.id);
    }
}

impl Drop for StackDownGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        if let Some(target) = take(self.id) {
            warn!("{} ended while the stack was down", target.operation);
            restart(&target);
        }
    }
}

fn take(id: u64) -> Option<ArmedTarget> {
    let mut targets = armed();
    let index = targets.iter().position(|t| t.id == id)?;
    Some(targets.remove(index))
}

/// Restart every armed target. Called from the signal watcher; returns how many were restarted.
pub fn restart_if_armed() -> usize {
    let targets: Vec<ArmedTarget> = armed().drain(..).collect();
    for target in &targets {
        restart(target);
    }
    targets.len()
}

/// Whether any operation currently has the stack down
pub fn is_armed() -> bool {
    !armed().is_empty()
}

fn restart(target: &ArmedTarget) {
    let ops = OpsLog::start(&target.paths.logs_dir(), "emergency-restart");
    ops.record("interrupted", &target.operation);

    let catalog = match ServiceCatalog::load(&target.paths.services_file()) {
        Ok(catalog) => catalog,
        Err(e) => {
            error!("Emergency restart impossible, no usable service catalog: {}", e);
            ops.record("failed", &e.to_string());
            return;
        }
    };

    // Best effort: start everything in tier order, no health gating
    for (_, services) in catalog.tiers() {
        for service in services {
            match target.runtime.start(&service.name) {
                Ok(()) => ops.record("started", &service.name),
                Err(e) => {
                    error!("Emergency start of {} failed: {}", service.name, e);
                    ops.record("start_failed", &format!("{}: {}", service.name, e));
                }
            }
        }
    }
    warn!(
        "Emergency restart issued for {} service(s); check `keelctl health-check`",
        catalog.services.len()
    );
}
