//! Version update
//!
//! Steps, in order:
//! 1. mutation lock
//! 2. checkpoint of the current deployment state
//! 3. pre-update backup (abort on failure, nothing is mutated yet)
//! 4. deployment-file copy with side archive
//! 5. environment merge
//! 6. version pointer
//! 7. image fetch with backoff (exhaustion reverts 4-6, services untouched)
//! 8. graceful stop of the old service set
//! 9. tiered launch of the new service set
//! 10. data migrations
//! 11. aggregate verification
//!
//! A failure in 8-11 is past the point of no return: with auto-rollback the
//! checkpoint from step 2 is restored, otherwise the stack stays on the new
//! version and the report carries remediation commands.

use crate::backup::{BackupManager, RetentionClass};
use crate::catalog::ServiceCatalog;
use crate::checkpoint::{Checkpoint, CheckpointRequest, CheckpointStore};
use crate::config::BackupKind;
use crate::context::StackContext;
use crate::emergency::StackDownGuard;
use crate::env_merge::{merge_files, EnvironmentFile};
use crate::error::{KeelError, Result};
use crate::health::{probe_all, run_migrations, HealthReport};
use crate::launcher::LaunchReport;
use crate::lock::{LockHandle, MUTATION_LOCK};
use crate::ops_log::OpsLog;
use crate::paths::SERVICES_FILE;
use crate::retry::retry;
use crate::rollback::{AutoRollbackOutcome, RollbackController, RollbackReport};
use crate::side_archive::SideArchive;
use crate::state::{validate_version, VersionPointer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

const ENV_TEMPLATE_NAME: &str = "env.template";

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub target_version: String,
    pub skip_backup: bool,
    /// `None` follows `[update] auto_rollback`
    pub auto_rollback: Option<bool>,
    /// Cap on every service's health timeout
    pub timeout: Option<Duration>,
    /// New deployment files to copy over the live directory
    pub source: Option<PathBuf>,
}

impl UpdateOptions {
    pub fn new(target_version: &str) -> Self {
        Self {
            target_version: target_version.to_string(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Succeeded,
    /// Failed past the point of no return, previous version is back
    RolledBack,
    /// Failed and the automatic rollback did not come up healthy
    RollbackFailed,
    /// Failed, left on the new version
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub from_version: String,
    pub to_version: String,
    pub status: UpdateStatus,
    pub checkpoint: String,
    pub backup: Option<PathBuf>,
    pub files_replaced: usize,
    pub files_added: usize,
    pub env_keys_added: usize,
    pub stop_warnings: Vec<String>,
    pub launch: Option<LaunchReport>,
    pub health: Option<HealthReport>,
    pub rollback: Option<RollbackReport>,
    pub failure: Option<String>,
    pub remediation: Vec<String>,
    pub diagnostics: Option<PathBuf>,
    pub ops_log: PathBuf,
}

impl UpdateReport {
    /// 0 success, 1 recovered by rollback, 2 anything worse
    pub fn exit_code(&self) -> i32 {
        match self.status {
            UpdateStatus::Succeeded => 0,
            UpdateStatus::RolledBack => 1,
            UpdateStatus::RollbackFailed | UpdateStatus::Failed => 2,
        }
    }
}

/// What an update would do; produced without the lock and without side effects
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePlan {
    pub from_version: String,
    pub to_version: String,
    pub backup: Option<BackupKind>,
    pub source: Option<PathBuf>,
    pub env_keys_to_add: Vec<String>,
    pub stop_order: Vec<String>,
    pub launch_tiers: Vec<(u32, Vec<String>)>,
    pub migrations: Vec<String>,
    pub auto_rollback: bool,
    pub health_timeout_cap_secs: Option<u64>,
    /// Operation currently holding the mutation lock
    pub blocked_by: Option<String>,
}

struct Validated {
    from_version: String,
    old_catalog: ServiceCatalog,
    target_catalog: ServiceCatalog,
}

struct Prepared {
    files_replaced: usize,
    files_added: usize,
    env_keys_added: usize,
    catalog: ServiceCatalog,
}

enum Recovery {
    /// Re-check found the stack healthy, carry on
    Continue,
    Finished,
}

pub struct UpdateController<'a> {
    ctx: &'a StackContext,
}

impl<'a> UpdateController<'a> {
    pub fn new(ctx: &'a StackContext) -> Self {
        Self { ctx }
    }

    fn auto_rollback_enabled(&self, options: &UpdateOptions) -> bool {
        options.auto_rollback.unwrap_or(self.ctx.config.update.auto_rollback)
    }

    fn validate(&self, options: &UpdateOptions) -> Result<Validated> {
        validate_version(&options.target_version)?;
        let from_version = self.ctx.current_version()?.ok_or_else(|| {
            KeelError::conflict("No installed version found", "Run `keelctl install <version>` first")
        })?;
        if from_version == options.target_version && options.source.is_none() {
            return Err(KeelError::validation(format!(
                "version {} is already deployed",
                from_version
            )));
        }

        let old_catalog = self.ctx.catalog()?;
        let target_catalog = match &options.source {
            Some(source) => {
                if !source.is_dir() {
                    return Err(KeelError::validation(format!(
                        "deployment source {} is not a directory",
                        source.display()
                    )));
                }
                let candidate = source.join(SERVICES_FILE);
                if candidate.exists() {
                    ServiceCatalog::load(&candidate)?
                } else {
                    old_catalog.clone()
                }
            }
            None => old_catalog.clone(),
        };

        Ok(Validated {
            from_version,
            old_catalog,
            target_catalog,
        })
    }

    /// Dry run
    pub fn plan(&self, options: &UpdateOptions) -> Result<UpdatePlan> {
        let validated = self.validate(options)?;
        let paths = &self.ctx.paths;

        let template_path = options
            .source
            .as_ref()
            .map(|source| source.join(ENV_TEMPLATE_NAME))
            .filter(|path| path.exists())
            .unwrap_or_else(|| paths.env_template.clone());
        let template = EnvironmentFile::load(&template_path)?;
        let live = EnvironmentFile::load(&paths.env_file)?;
        let env_keys_to_add = template
            .keys()
            .into_iter()
            .filter(|key| !live.contains(key))
            .map(str::to_string)
            .collect();

        let (non_critical, critical) = validated.old_catalog.stop_order();
        Ok(UpdatePlan {
            from_version: validated.from_version,
            to_version: options.target_version.clone(),
            backup: (!options.skip_backup).then_some(self.ctx.config.update.pre_update_backup),
            source: options.source.clone(),
            env_keys_to_add,
            stop_order: non_critical.iter().chain(critical.iter()).map(|s| s.name.clone()).collect(),
            launch_tiers: validated
                .target_catalog
                .tiers()
                .into_iter()
                .map(|(tier, services)| (tier, services.into_iter().map(|s| s.name).collect()))
                .collect(),
            migrations: validated.target_catalog.migrations.iter().map(|m| m.name.clone()).collect(),
            auto_rollback: self.auto_rollback_enabled(options),
            health_timeout_cap_secs: options.timeout.map(|t| t.as_secs()),
            blocked_by: self
                .ctx
                .locks()
                .holder(MUTATION_LOCK)
                .map(|holder| format!("{} (pid {})", holder.operation, holder.pid)),
        })
    }

    /// Run the update. `Err` means the update stopped before any service was
    /// touched; once services were stopped the outcome is in the report.
    pub fn update(&self, options: &UpdateOptions) -> Result<UpdateReport> {
        let ctx = self.ctx;
        let paths = &ctx.paths;
        let validated = self.validate(options)?;
        let auto_rollback = self.auto_rollback_enabled(options);

        // Step 1: lock
        let lock = ctx.locks().acquire(MUTATION_LOCK, "update")?;
        let ops = OpsLog::start(&paths.logs_dir(), "update");
        ops.record(
            "begin",
            &format!("{} -> {}", validated.from_version, options.target_version),
        );
        info!("Updating {} -> {}", validated.from_version, options.target_version);

        // Step 2: checkpoint
        let image_ids = ctx
            .runtime
            .image_ids(&validated.old_catalog.service_names())
            .unwrap_or_else(|e| {
                warn!("Could not read image ids for the checkpoint: {}", e);
                BTreeMap::new()
            });
        let store = CheckpointStore::new(&paths.checkpoints_dir());
        let checkpoint = store.create(
            paths,
            CheckpointRequest {
                kind: "update",
                target_version: Some(&options.target_version),
                image_ids,
                exclude: &ctx.config.backup.asset_dirs,
            },
        )?;
        ops.record("checkpoint", checkpoint.name());
        for pruned in store.prune(ctx.config.update.effective_checkpoint_retention())? {
            SideArchive::discard(paths, &pruned)?;
            ops.record("checkpoint_pruned", &pruned);
        }

        // Step 3: pre-update backup
        let backup = if options.skip_backup {
            warn!("Skipping the pre-update backup");
            ops.record("backup_skipped", "");
            None
        } else {
            let kind = ctx.config.update.pre_update_backup;
            match BackupManager::new(ctx).create(kind, RetentionClass::PreUpdate, Some(&lock)) {
                Ok(record) => {
                    ops.record("backup", &record.path.display().to_string());
                    Some(record.path)
                }
                Err(e) => {
                    error!("Pre-update backup failed, nothing was changed: {}", e);
                    ops.record("backup_failed", &e.to_string());
                    return Err(e);
                }
            }
        };

        // Steps 4-6: files, environment, version pointer
        let prepared = match self.prepare(options, &checkpoint, &ops) {
            Ok(prepared) => prepared,
            Err(e) => {
                ops.record("prepare_failed", &e.to_string());
                self.revert_prepared(&checkpoint, &validated.from_version, &ops);
                return Err(e);
            }
        };

        // Step 7: image fetch
        let policy = ctx.config.fetch.retry_policy();
        let services = prepared.catalog.service_names();
        if let Err(e) = retry(&policy, "image fetch", |attempt| {
            ops.record("pull", &format!("attempt={}", attempt));
            ctx.runtime.pull(&services)
        }) {
            error!("Image fetch failed, reverting (no service was touched): {}", e);
            ops.record("fetch_failed", &e.to_string());
            self.revert_prepared(&checkpoint, &validated.from_version, &ops);
            return Err(e);
        }

        let mut report = UpdateReport {
            from_version: validated.from_version.clone(),
            to_version: options.target_version.clone(),
            status: UpdateStatus::Succeeded,
            checkpoint: checkpoint.name().to_string(),
            backup,
            files_replaced: prepared.files_replaced,
            files_added: prepared.files_added,
            env_keys_added: prepared.env_keys_added,
            stop_warnings: Vec::new(),
            launch: None,
            health: None,
            rollback: None,
            failure: None,
            remediation: Vec::new(),
            diagnostics: None,
            ops_log: ops.path().to_path_buf(),
        };

        // Step 8: stop (point of no return)
        let guard = StackDownGuard::arm(ctx.runtime.clone(), paths, "update");
        let launcher = ctx.launcher();
        for failure in launcher.stop_all(&validated.old_catalog) {
            ops.record("stop_failed", &format!("{}: {}", failure.service, failure.error));
            report
                .stop_warnings
                .push(format!("{}: {}", failure.service, failure.error));
        }

        // Step 9: launch
        let launch = launcher.launch_all(&prepared.catalog.services);
        guard.disarm();
        let launch_failure = launch.failure();
        report.launch = Some(launch);
        if let Some(cause) = launch_failure {
            ops.record("launch_failed", &cause.to_string());
            if let Recovery::Finished =
                self.recover(&mut report, cause, true, auto_rollback, &lock, &ops, &prepared.catalog)
            {
                return Ok(report);
            }
        }

        // Step 10: migrations
        if let Err(cause) = run_migrations(ctx.runtime.as_ref(), &prepared.catalog.migrations, &ops) {
            // A failed migration does not heal by waiting
            if let Recovery::Finished =
                self.recover(&mut report, cause, false, auto_rollback, &lock, &ops, &prepared.catalog)
            {
                return Ok(report);
            }
        }

        // Step 11: verify
        let health = probe_all(ctx.runtime.as_ref(), &prepared.catalog);
        let verify_failure = health.failure();
        report.health = Some(health);
        if let Some(cause) = verify_failure {
            ops.record("verify_failed", &cause.to_string());
            if let Recovery::Finished =
                self.recover(&mut report, cause, true, auto_rollback, &lock, &ops, &prepared.catalog)
            {
                return Ok(report);
            }
        }

        // Step 12: done, the lock is released on return
        ops.record("success", &options.target_version);
        info!("Update to {} complete", options.target_version);
        Ok(report)
    }

    fn prepare(&self, options: &UpdateOptions, checkpoint: &Checkpoint, ops: &OpsLog) -> Result<Prepared> {
        let paths = &self.ctx.paths;

        // Step 4: deployment files
        let (files_replaced, files_added) = match &options.source {
            Some(source) => {
                let side = SideArchive::apply_source(paths, checkpoint.name(), source)?;
                ops.record(
                    "files_copied",
                    &format!("replaced={} added={}", side.manifest.replaced.len(), side.manifest.added.len()),
                );
                (side.manifest.replaced.len(), side.manifest.added.len())
            }
            None => (0, 0),
        };

        // Step 5: environment merge
        let env_keys_added = if paths.env_template.exists() {
            merge_files(&paths.env_template, &paths.env_file)?
        } else {
            0
        };
        ops.record("env_merge", &format!("added={}", env_keys_added));

        // Step 6: version pointer
        VersionPointer::write(&paths.version_file(), &options.target_version)?;
        ops.record("version_pointer", &options.target_version);

        let mut catalog = self.ctx.catalog()?;
        if let Some(cap) = options.timeout {
            catalog.cap_health_timeouts(cap);
        }

        Ok(Prepared {
            files_replaced,
            files_added,
            env_keys_added,
            catalog,
        })
    }

    /// Undo steps 4-6; best effort, the original failure is what gets reported
    fn revert_prepared(&self, checkpoint: &Checkpoint, from_version: &str, ops: &OpsLog) {
        let paths = &self.ctx.paths;
        match SideArchive::load(paths, checkpoint.name()) {
            Ok(Some(side)) => {
                if let Err(e) = side.revert(&paths.deploy_dir) {
                    error!("Failed to revert replaced deployment files: {}", e);
                }
                if let Err(e) = SideArchive::discard(paths, checkpoint.name()) {
                    warn!("Failed to discard side archive: {}", e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Side archive unreadable: {}", e),
        }
        if let Err(e) = checkpoint.restore_into(&paths.deploy_dir) {
            error!("Failed to restore deployment files from {}: {}", checkpoint.name(), e);
        }
        if let Err(e) = VersionPointer::write(&paths.version_file(), from_version) {
            error!("Failed to revert the version pointer to {}: {}", from_version, e);
        }
        ops.record("reverted", from_version);
    }

    #[allow(clippy::too_many_arguments)]
    fn recover(
        &self,
        report: &mut UpdateReport,
        cause: KeelError,
        recheck: bool,
        auto_rollback: bool,
        lock: &LockHandle,
        ops: &OpsLog,
        catalog: &ServiceCatalog,
    ) -> Recovery {
        let ctx = self.ctx;
        error!("Update to {} failed: {}", report.to_version, cause);
        if report.diagnostics.is_none() {
            report.diagnostics = ops.capture_diagnostics(
                ctx.runtime.as_ref(),
                &catalog.service_names(),
                ctx.config.update.diagnostic_log_lines,
                &cause.to_string(),
            );
        }
        report.failure = Some(cause.to_string());

        if !auto_rollback {
            report.status = UpdateStatus::Failed;
            report.remediation = remediation(&report.checkpoint, report.backup.as_deref());
            ops.record("failed_no_rollback", &cause.to_string());
            return Recovery::Finished;
        }

        let controller = RollbackController::new(ctx);
        let outcome = if recheck {
            controller.auto_rollback(Some(report.checkpoint.as_str()), Some(lock))
        } else {
            controller
                .rollback(Some(report.checkpoint.as_str()), Some(lock))
                .map(|report| AutoRollbackOutcome::RolledBack { report })
        };

        match outcome {
            Ok(AutoRollbackOutcome::NotNeeded { health }) => {
                warn!("Services recovered during the settle delay, continuing the update");
                ops.record("rollback_not_needed", "");
                report.failure = None;
                report.health = Some(health);
                Recovery::Continue
            }
            Ok(AutoRollbackOutcome::RolledBack { report: rollback }) => {
                if rollback.ok {
                    report.status = UpdateStatus::RolledBack;
                    ops.record("rolled_back", rollback.restored_version.as_deref().unwrap_or(""));
                } else {
                    report.status = UpdateStatus::RollbackFailed;
                    report.remediation = remediation(&report.checkpoint, report.backup.as_deref());
                    ops.record("rollback_unhealthy", &rollback.checkpoint);
                }
                report.rollback = Some(rollback);
                Recovery::Finished
            }
            Err(e) => {
                error!("Automatic rollback failed: {}", e);
                ops.record("rollback_failed", &e.to_string());
                report.status = UpdateStatus::RollbackFailed;
                report.failure = Some(format!("{}; rollback failed: {}", cause, e));
                report.remediation = remediation(&report.checkpoint, report.backup.as_deref());
                if let Some(text) = e.remediation() {
                    report.remediation.insert(0, text.to_string());
                }
                Recovery::Finished
            }
        }
    }
}

fn remediation(checkpoint: &str, backup: Option<&Path>) -> Vec<String> {
    let mut steps = vec![format!("keelctl rollback --checkpoint {}", checkpoint)];
    match backup {
        Some(path) => steps.push(format!("keelctl restore {}", path.display())),
        None => steps.push("keelctl restore <archive>  (see `keelctl backup --list`)".to_string()),
    }
    steps
}
