//! Checkpoint rollback
//!
//! Everything that can reject a rollback runs before the first service is
//! stopped: lock, checkpoint lookup, checksum verification, the restored
//! service catalog and the secret fingerprints. Key material is never copied
//! back; a recorded fingerprint whose file is gone aborts the rollback, a
//! changed one is reported as a warning.

use crate::catalog::ServiceCatalog;
use crate::checkpoint::{Checkpoint, CheckpointManifest, CheckpointStore};
use crate::context::StackContext;
use crate::emergency::StackDownGuard;
use crate::error::{KeelError, Result};
use crate::health::{probe_all, HealthReport};
use crate::launcher::LaunchReport;
use crate::lock::{LockHandle, MUTATION_LOCK};
use crate::ops_log::OpsLog;
use crate::paths::SERVICES_FILE;
use crate::secrets::{compare_fingerprints, fingerprints};
use crate::side_archive::SideArchive;
use crate::state::VersionPointer;
use serde::Serialize;
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct RollbackReport {
    pub checkpoint: String,
    pub restored_version: Option<String>,
    pub files_restored: usize,
    pub side_archive_reverted: bool,
    pub warnings: Vec<String>,
    pub launch: LaunchReport,
    pub health: HealthReport,
    pub ok: bool,
    pub diagnostics: Option<PathBuf>,
    pub ops_log: PathBuf,
}

impl RollbackReport {
    pub fn exit_code(&self) -> i32 {
        if self.ok {
            0
        } else {
            2
        }
    }
}

/// Result of the settle-and-recheck mode
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AutoRollbackOutcome {
    /// Critical services came up during the settle delay
    NotNeeded { health: HealthReport },
    RolledBack { report: RollbackReport },
}

pub struct RollbackController<'a> {
    ctx: &'a StackContext,
}

impl<'a> RollbackController<'a> {
    pub fn new(ctx: &'a StackContext) -> Self {
        Self { ctx }
    }

    fn store(&self) -> CheckpointStore {
        CheckpointStore::new(&self.ctx.paths.checkpoints_dir())
    }

    /// Checkpoint manifests, newest first. Read-only.
    pub fn list(&self) -> Result<Vec<CheckpointManifest>> {
        Ok(self.store().list()?.into_iter().map(|c| c.manifest).collect())
    }

    /// Re-hash a checkpoint against its manifest. Read-only.
    pub fn verify(&self, checkpoint: Option<&str>) -> Result<CheckpointManifest> {
        let store = self.store();
        let checkpoint = store.resolve(checkpoint)?;
        store.verify(&checkpoint)?;
        Ok(checkpoint.manifest)
    }

    /// Restore `checkpoint` (default: newest) and relaunch under the restored
    /// version. A caller already holding the mutation lock passes it in.
    pub fn rollback(&self, checkpoint: Option<&str>, held: Option<&LockHandle>) -> Result<RollbackReport> {
        let ctx = self.ctx;
        let paths = &ctx.paths;

        // Step 1: lock
        let _own_lock = match held {
            Some(handle) if handle.is_valid() => None,
            Some(_) => {
                return Err(KeelError::conflict(
                    "The held lifecycle lock is no longer valid",
                    "Run `keelctl rollback` manually",
                ))
            }
            None => Some(ctx.locks().acquire(MUTATION_LOCK, "rollback")?),
        };
        let ops = OpsLog::start(&paths.logs_dir(), "rollback");

        // Step 2: checkpoint and restored catalog, validated before anything stops
        let store = self.store();
        let checkpoint = store.resolve(checkpoint)?;
        store.verify(&checkpoint)?;
        let restored_catalog = ServiceCatalog::load(&checkpoint.captured(SERVICES_FILE))?;
        ops.record(
            "checkpoint",
            &format!(
                "{} version={}",
                checkpoint.name(),
                checkpoint.manifest.source_version.as_deref().unwrap_or("none")
            ),
        );

        // Step 3: secrets by fingerprint
        let mut warnings = self.check_secrets(&checkpoint, &ops)?;

        let live_catalog = match ctx.catalog() {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("Live service catalog unusable ({}), stopping the checkpoint's services", e);
                restored_catalog.clone()
            }
        };

        // Step 4: stop everything
        let guard = StackDownGuard::arm(ctx.runtime.clone(), paths, "rollback");
        let launcher = ctx.launcher();
        for failure in launcher.stop_all(&live_catalog) {
            ops.record("stop_failed", &format!("{}: {}", failure.service, failure.error));
            warnings.push(format!("{} did not stop cleanly: {}", failure.service, failure.error));
        }

        // Step 5: files, side archive, version pointer
        let side_archive_reverted = match SideArchive::load(paths, checkpoint.name())? {
            Some(side) => {
                side.revert(&paths.deploy_dir)?;
                SideArchive::discard(paths, checkpoint.name())?;
                ops.record(
                    "side_archive_reverted",
                    &format!("replaced={} added={}", side.manifest.replaced.len(), side.manifest.added.len()),
                );
                true
            }
            None => false,
        };
        let files_restored = checkpoint.restore_into(&paths.deploy_dir)?;
        ops.record("files_restored", &files_restored.to_string());

        let restored_version = checkpoint.manifest.source_version.clone();
        match &restored_version {
            Some(version) => VersionPointer::write(&paths.version_file(), version)?,
            None => warnings.push("checkpoint records no version, version pointer left as is".to_string()),
        }

        // Step 6: relaunch the restored service set
        let launch = launcher.launch_all(&restored_catalog.services);
        guard.disarm();
        for warning in launch.warnings() {
            warnings.push(format!("{} did not become healthy (non-critical)", warning.name));
        }

        // Step 7: aggregate verification
        let health = probe_all(ctx.runtime.as_ref(), &restored_catalog);
        let ok = launch.overall_ok && health.critical_ok();

        let diagnostics = if ok {
            info!(
                "Rolled back to {} ({})",
                restored_version.as_deref().unwrap_or("unknown version"),
                checkpoint.name()
            );
            ops.record("success", restored_version.as_deref().unwrap_or(""));
            None
        } else {
            let cause = launch
                .failure()
                .or_else(|| health.failure())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "rollback verification failed".to_string());
            error!("Rollback to {} did not come up healthy: {}", checkpoint.name(), cause);
            ops.record("failed", &cause);
            ops.capture_diagnostics(
                ctx.runtime.as_ref(),
                &restored_catalog.service_names(),
                ctx.config.update.diagnostic_log_lines,
                &cause,
            )
        };

        Ok(RollbackReport {
            checkpoint: checkpoint.manifest.name.clone(),
            restored_version,
            files_restored,
            side_archive_reverted,
            warnings,
            launch,
            health,
            ok,
            diagnostics,
            ops_log: ops.path().to_path_buf(),
        })
    }

    /// Wait for the settle delay, re-check health once, and roll back only if
    /// a critical service is still not healthy
    pub fn auto_rollback(&self, checkpoint: Option<&str>, held: Option<&LockHandle>) -> Result<AutoRollbackOutcome> {
        let settle = self.ctx.config.update.settle_delay();
        if !settle.is_zero() {
            info!("Waiting {}s before re-checking health", settle.as_secs());
            thread::sleep(settle);
        }

        let health = probe_all(self.ctx.runtime.as_ref(), &self.ctx.catalog()?);
        if health.critical_ok() {
            info!("Critical services are healthy after the settle delay, no rollback needed");
            return Ok(AutoRollbackOutcome::NotNeeded { health });
        }

        for problem in health.critical_problems() {
            warn!("{} is still {}", problem.name, problem.status.as_str());
        }
        let report = self.rollback(checkpoint, held)?;
        Ok(AutoRollbackOutcome::RolledBack { report })
    }

    fn check_secrets(&self, checkpoint: &Checkpoint, ops: &OpsLog) -> Result<Vec<String>> {
        let current = fingerprints(&self.ctx.paths)?;
        let drift = compare_fingerprints(&checkpoint.manifest.secret_fingerprints, &current);
        if !drift.missing.is_empty() {
            ops.record("secrets_missing", &drift.missing.join(","));
            return Err(KeelError::conflict(
                format!(
                    "Secret material recorded in checkpoint {} is missing: {}",
                    checkpoint.name(),
                    drift.missing.join(", ")
                ),
                "Put the missing key material back in place (it is never stored in checkpoints) and re-run the rollback",
            ));
        }
        Ok(drift
            .changed
            .iter()
            .map(|name| {
                warn!("{} changed since checkpoint {}", name, checkpoint.name());
                ops.record("secret_changed", name);
                format!("{} changed since the checkpoint was taken; the current file is kept", name)
            })
            .collect())
    }
}
