//! Restore from a backup archive
//!
//! The archive is verified and fully staged before anything is stopped. A
//! restore never applies part of an archive: if verification, staging or the
//! staged service catalog is rejected, the running stack is left alone.
//!
//! Once services are stopped, dumps go in first with only the datastore
//! services running. Deployment files are replaced only after every dump
//! restored, through a side archive that puts the live files back if any
//! copy fails. The staging directory is removed on every exit path.

use crate::backup::{dump_entry, BackupManifest, ASSETS_PREFIX, CONFIG_PREFIX};
use crate::catalog::{ServiceCatalog, ServiceDescriptor};
use crate::config::BackupKind;
use crate::context::StackContext;
use crate::datastore::DatastoreCli;
use crate::emergency::StackDownGuard;
use crate::error::{KeelError, Result};
use crate::health::{probe_all, HealthReport};
use crate::integrity::{extract, IntegrityVerifier, VerifyReport};
use crate::launcher::LaunchReport;
use crate::lock::MUTATION_LOCK;
use crate::ops_log::{OpsLog, FILE_STAMP_FORMAT};
use crate::paths::{KeelPaths, SERVICES_FILE};
use crate::side_archive::SideArchive;
use crate::state::{remove_tree, VersionPointer};
use chrono::Utc;
use serde::Serialize;
use std::fs;
use std::path::{Component, Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Restrict to what this kind covers; defaults to the archive's kind
    pub kind: Option<BackupKind>,
    /// Delete the archive after a healthy restore
    pub discard: bool,
    /// Also restore every dump into an ephemeral instance first
    pub test_restore: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub kind: BackupKind,
    pub verify: VerifyReport,
    pub config_files: usize,
    pub components: Vec<String>,
    pub assets: usize,
    pub restored_version: Option<String>,
    pub warnings: Vec<String>,
    pub launch: LaunchReport,
    pub health: HealthReport,
    pub ok: bool,
    pub discarded: bool,
    pub ops_log: PathBuf,
}

impl RestoreReport {
    pub fn exit_code(&self) -> i32 {
        if self.ok {
            0
        } else {
            2
        }
    }
}

/// Extracted archive contents; removed when dropped
struct StagingDir(PathBuf);

impl StagingDir {
    fn join(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.0.join(rel)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = remove_tree(&self.0) {
            warn!("Failed to clean staging dir {}: {}", self.0.display(), e);
        }
    }
}

/// Everything from the archive, on local disk, ready to apply
struct Staged {
    dir: StagingDir,
    config: Vec<PathBuf>,
    assets: Vec<PathBuf>,
    catalog: ServiceCatalog,
}

pub struct RestoreManager<'a> {
    ctx: &'a StackContext,
}

impl<'a> RestoreManager<'a> {
    pub fn new(ctx: &'a StackContext) -> Self {
        Self { ctx }
    }

    pub fn restore(&self, archive: &Path, options: &RestoreOptions) -> Result<RestoreReport> {
        let ctx = self.ctx;
        let paths = &ctx.paths;
        if !archive.is_file() {
            return Err(KeelError::validation(format!("archive {} not found", archive.display())));
        }

        let _lock = ctx.locks().acquire(MUTATION_LOCK, "restore")?;
        let ops = OpsLog::start(&paths.logs_dir(), "restore");
        ops.record("archive", &archive.display().to_string());

        // Step 1: verify
        let verifier = IntegrityVerifier::new(ctx.config.backup.test_restore_policy);
        let verify = if options.test_restore {
            let catalog = ctx.catalog()?;
            verifier.verify_with_test_restore(archive, ctx.runtime.as_ref(), &catalog)?
        } else {
            verifier.verify(archive)?
        };
        let manifest = verify.manifest.clone();
        let kind = options.kind.unwrap_or(manifest.kind);
        check_kind(&manifest, kind)?;
        ops.record("verified", &format!("kind={} entries={}", kind.as_str(), verify.entries));

        // Step 2: stage
        let staged = self.stage(archive, &manifest, kind)?;
        let mut warnings: Vec<String> = verify
            .test_restore_failures()
            .iter()
            .map(|f| format!("test restore of {} failed (advisory)", f.component))
            .collect();

        let live_catalog = ctx.catalog().unwrap_or_else(|e| {
            warn!("Live service catalog unusable ({}), stopping the archived service set", e);
            staged.catalog.clone()
        });

        // Step 3: stop
        let guard = StackDownGuard::arm(ctx.runtime.clone(), paths, "restore");
        let launcher = ctx.launcher();
        for failure in launcher.stop_all(&live_catalog) {
            ops.record("stop_failed", &format!("{}: {}", failure.service, failure.error));
            warnings.push(format!("{} did not stop cleanly: {}", failure.service, failure.error));
        }

        // Step 4: datastore dumps, with only the datastore services up and
        // before any deployment file is touched
        let mut components = Vec::new();
        if kind.includes_dumps() && !manifest.components.is_empty() {
            let hosts = staged.catalog.datastore_services();
            let datastores: Vec<ServiceDescriptor> = staged
                .catalog
                .services
                .iter()
                .filter(|s| hosts.contains(s.name.as_str()))
                .cloned()
                .collect();
            let report = launcher.launch_all(&datastores);
            if let Some(e) = report.failure() {
                ops.record("datastore_launch_failed", &e.to_string());
                return Err(e);
            }

            let cli = DatastoreCli::new(ctx.runtime.as_ref());
            for name in &manifest.components {
                let Some(component) = staged.catalog.datastores.iter().find(|d| &d.name == name) else {
                    continue;
                };
                let restored = fs::read(staged.dir.join(dump_entry(name)))
                    .map_err(KeelError::from)
                    .and_then(|dump| cli.restore(component, &dump));
                if let Err(e) = restored {
                    ops.record("dump_restore_failed", &format!("{}: {}", name, e));
                    if !components.is_empty() {
                        error!("Restore of {} failed after {:?} were already restored", name, components);
                    }
                    return Err(e);
                }
                ops.record("dump_restored", name);
                components.push(name.clone());
            }
        }

        // Step 5: configuration and assets, reverted as a whole on failure
        let mut files: Vec<(PathBuf, PathBuf)> = Vec::new();
        if kind.includes_config() {
            files.extend(staged.config.iter().map(|rel| (staged.dir.join(CONFIG_PREFIX).join(rel), rel.clone())));
        }
        if kind.includes_assets() {
            files.extend(staged.assets.iter().map(|rel| (staged.dir.join(ASSETS_PREFIX).join(rel), rel.clone())));
        }
        let side_key = format!("restore-{}", Utc::now().format(FILE_STAMP_FORMAT));
        let side = SideArchive::apply_files(paths, &side_key, &files).map_err(|e| {
            ops.record("files_failed", &e.to_string());
            discard_side_archive(paths, &side_key);
            e
        })?;

        let mut restored_version = None;
        if kind.includes_config() {
            if let Some(version) = &manifest.version {
                if let Err(e) = VersionPointer::write(&paths.version_file(), version) {
                    ops.record("version_failed", &e.to_string());
                    if let Err(revert) = side.revert(&paths.deploy_dir) {
                        error!("Could not revert restored files: {}", revert);
                    }
                    discard_side_archive(paths, &side_key);
                    return Err(e.into());
                }
                restored_version = Some(version.clone());
            }
            ops.record("config_restored", &staged.config.len().to_string());
        }
        if kind.includes_assets() {
            ops.record("assets_restored", &staged.assets.len().to_string());
        }
        discard_side_archive(paths, &side_key);

        // Step 6: relaunch and verify
        let launch = launcher.launch_all(&staged.catalog.services);
        guard.disarm();
        let health = probe_all(ctx.runtime.as_ref(), &staged.catalog);
        let ok = launch.overall_ok && health.critical_ok();

        let mut discarded = false;
        if ok {
            ops.record("success", "");
            info!("Restore from {} complete", archive.display());
            if options.discard {
                fs::remove_file(archive)?;
                ops.record("discarded", &archive.display().to_string());
                discarded = true;
            }
        } else {
            let cause = launch
                .failure()
                .or_else(|| health.failure())
                .map(|e| e.to_string())
                .unwrap_or_else(|| "restore verification failed".to_string());
            error!("Stack did not come up healthy after restore: {}", cause);
            ops.record("failed", &cause);
            ops.capture_diagnostics(
                ctx.runtime.as_ref(),
                &staged.catalog.service_names(),
                ctx.config.update.diagnostic_log_lines,
                &cause,
            );
            if options.discard {
                warnings.push("archive kept because the restore did not verify".to_string());
            }
        }

        Ok(RestoreReport {
            archive: archive.to_path_buf(),
            kind,
            verify,
            config_files: if kind.includes_config() { staged.config.len() } else { 0 },
            components,
            assets: if kind.includes_assets() { staged.assets.len() } else { 0 },
            restored_version,
            warnings,
            launch,
            health,
            ok,
            discarded,
            ops_log: ops.path().to_path_buf(),
        })
    }

    fn stage(&self, archive: &Path, manifest: &BackupManifest, kind: BackupKind) -> Result<Staged> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_string());
        let path = self.ctx.paths.staging_dir().join(name);
        remove_tree(&path)?;
        let dir = StagingDir(path);
        extract(archive, &dir.0)?;

        let mut config = Vec::new();
        let mut assets = Vec::new();
        for entry in &manifest.contents {
            if let Some(rel) = entry.path.strip_prefix(CONFIG_PREFIX) {
                config.push(safe_relative(rel)?);
            } else if let Some(rel) = entry.path.strip_prefix(ASSETS_PREFIX) {
                assets.push(safe_relative(rel)?);
            }
        }

        let catalog = if kind.includes_config() && config.iter().any(|p| p == Path::new(SERVICES_FILE)) {
            ServiceCatalog::load(&dir.join(CONFIG_PREFIX).join(SERVICES_FILE))?
        } else {
            self.ctx.catalog()?
        };
        for component in &manifest.components {
            if kind.includes_dumps() && !catalog.datastores.iter().any(|d| &d.name == component) {
                return Err(KeelError::validation(format!(
                    "archive holds a dump for {} but the service catalog has no such datastore",
                    component
                )));
            }
        }

        Ok(Staged {
            dir,
            config,
            assets,
            catalog,
        })
    }
}

/// A restore may only ask for what the archive holds
fn check_kind(manifest: &BackupManifest, requested: BackupKind) -> Result<()> {
    let held = manifest.kind;
    let covered = (!requested.includes_config() || held.includes_config())
        && (!requested.includes_dumps() || held.includes_dumps())
        && (!requested.includes_assets() || held.includes_assets());
    if covered {
        Ok(())
    } else {
        Err(KeelError::validation(format!(
            "a {} restore needs a {} archive or larger, this one is {}",
            requested.as_str(),
            requested.as_str(),
            held.as_str()
        )))
    }
}

fn discard_side_archive(paths: &KeelPaths, key: &str) {
    if let Err(e) = SideArchive::discard(paths, key) {
        warn!("Failed to remove restore side archive {}: {}", key, e);
    }
}

fn safe_relative(rel: &str) -> Result<PathBuf> {
    let path = PathBuf::from(rel);
    if path.components().all(|c| matches!(c, Component::Normal(_))) {
        Ok(path)
    } else {
        Err(KeelError::validation(format!("archive entry {} escapes its directory", rel)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupManager, RetentionClass};
    use crate::config::KeelConfig;
    use crate::paths::KeelPaths;
    use crate::runtime::ExecOutput;
    use crate::testing::ScriptedRuntime;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    const CATALOG: &str = r#"
        [[service]]
        name = "db"
        tier = 0

        [[service]]
        name = "api"
        tier = 1

        [[datastore]]
        name = "main"
        service = "db"
        dump_command = ["pg_dump"]
        restore_command = ["psql"]
    "#;

    fn setup() -> (TempDir, StackContext, Arc<ScriptedRuntime>) {
        let temp = TempDir::new().unwrap();
        let paths = KeelPaths::with_root(temp.path());
        fs::create_dir_all(paths.deploy_dir.join("uploads")).unwrap();
        fs::write(paths.services_file(), CATALOG).unwrap();
        fs::write(&paths.env_file, "A=1\n").unwrap();
        fs::write(paths.deploy_dir.join("uploads/a.bin"), [7u8; 16]).unwrap();
        VersionPointer::write(&paths.version_file(), "1.0.0").unwrap();

        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.mark_running(&["db", "api"]);
        runtime.set_exec_output(
            "db",
            "pg_dump",
            ExecOutput {
                stdout: b"DUMP-1".to_vec(),
                ..Default::default()
            },
        );
        let mut config = KeelConfig::default();
        config.backup.asset_dirs = vec![PathBuf::from("uploads")];
        let ctx = StackContext::new(paths, config, runtime.clone()).with_poll_interval(Duration::from_millis(5));
        (temp, ctx, runtime)
    }

    fn full_backup(ctx: &StackContext) -> PathBuf {
        BackupManager::new(ctx)
            .create(BackupKind::Full, RetentionClass::Regular, None)
            .unwrap()
            .path
    }

    #[test]
    fn test_full_restore() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        fs::write(&ctx.paths.env_file, "A=changed\n").unwrap();
        fs::remove_file(ctx.paths.deploy_dir.join("uploads/a.bin")).unwrap();
        VersionPointer::write(&ctx.paths.version_file(), "2.0.0").unwrap();

        let report = RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).unwrap();

        assert!(report.ok);
        assert_eq!(report.components, vec!["main"]);
        assert_eq!(fs::read_to_string(&ctx.paths.env_file).unwrap(), "A=1\n");
        assert!(ctx.paths.deploy_dir.join("uploads/a.bin").exists());
        assert_eq!(ctx.current_version().unwrap().as_deref(), Some("1.0.0"));
        let fed = runtime.exec_stdin();
        assert_eq!(fed.last().unwrap().2, b"DUMP-1");
        assert!(archive.exists());
        assert!(!ctx.locks().is_locked(MUTATION_LOCK));
    }

    #[test]
    fn test_corrupt_archive_stops_nothing() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        let mut bytes = fs::read(&archive).unwrap();
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0xff;
        fs::write(&archive, bytes).unwrap();

        let err = RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).unwrap_err();
        assert!(matches!(err, KeelError::Integrity { .. }));
        assert!(runtime.stops().is_empty());
    }

    #[test]
    fn test_kind_larger_than_archive_is_invalid() {
        let (_temp, ctx, runtime) = setup();
        let archive = BackupManager::new(&ctx)
            .create(BackupKind::Metadata, RetentionClass::Regular, None)
            .unwrap()
            .path;
        let options = RestoreOptions {
            kind: Some(BackupKind::Full),
            ..Default::default()
        };
        let err = RestoreManager::new(&ctx).restore(&archive, &options).unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert!(runtime.stops().is_empty());
    }

    #[test]
    fn test_metadata_restore_from_full_archive_skips_dumps() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        let options = RestoreOptions {
            kind: Some(BackupKind::Metadata),
            discard: true,
            ..Default::default()
        };
        let report = RestoreManager::new(&ctx).restore(&archive, &options).unwrap();
        assert!(report.components.is_empty());
        assert!(runtime.exec_stdin().is_empty());
        assert!(report.discarded);
        assert!(!archive.exists());
    }

    #[test]
    fn test_restore_blocked_by_lock() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        let _held = ctx.locks().acquire(MUTATION_LOCK, "update").unwrap();
        let err = RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).unwrap_err();
        assert!(matches!(err, KeelError::StateConflict { .. }));
        assert!(runtime.stops().is_empty());
    }

    fn staging_is_empty(ctx: &StackContext) -> bool {
        fs::read_dir(ctx.paths.staging_dir())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    fn drift_live_state(ctx: &StackContext) {
        fs::write(&ctx.paths.env_file, "A=changed\n").unwrap();
        VersionPointer::write(&ctx.paths.version_file(), "2.0.0").unwrap();
    }

    #[test]
    fn test_datastore_launch_failure_touches_no_files() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        drift_live_state(&ctx);
        runtime.fail_start("db");

        let err = RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).unwrap_err();

        assert!(!matches!(err, KeelError::Validation(_)));
        assert_eq!(fs::read_to_string(&ctx.paths.env_file).unwrap(), "A=changed\n");
        assert_eq!(ctx.current_version().unwrap().as_deref(), Some("2.0.0"));
        assert!(runtime.exec_stdin().is_empty());
        assert!(staging_is_empty(&ctx));
        // Emergency restart brought the rest of the stack back
        assert!(runtime.is_running("api"));
        assert!(!ctx.locks().is_locked(MUTATION_LOCK));
    }

    #[test]
    fn test_dump_restore_failure_keeps_live_files() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        drift_live_state(&ctx);
        runtime.set_exec_output(
            "db",
            "psql",
            ExecOutput {
                exit_code: 1,
                stderr: b"permission denied".to_vec(),
                ..Default::default()
            },
        );

        assert!(RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).is_err());
        assert_eq!(fs::read_to_string(&ctx.paths.env_file).unwrap(), "A=changed\n");
        assert_eq!(ctx.current_version().unwrap().as_deref(), Some("2.0.0"));
        assert!(staging_is_empty(&ctx));
    }

    #[test]
    fn test_failed_asset_copy_reverts_restored_config() {
        let (_temp, ctx, runtime) = setup();
        let archive = full_backup(&ctx);
        drift_live_state(&ctx);
        // A plain file where the asset directory should be
        let uploads = ctx.paths.deploy_dir.join("uploads");
        fs::remove_dir_all(&uploads).unwrap();
        fs::write(&uploads, "not a directory").unwrap();

        assert!(RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).is_err());

        assert_eq!(fs::read_to_string(&ctx.paths.env_file).unwrap(), "A=changed\n");
        assert_eq!(ctx.current_version().unwrap().as_deref(), Some("2.0.0"));
        assert_eq!(runtime.exec_stdin().len(), 1);
        assert!(staging_is_empty(&ctx));
        let leftovers = fs::read_dir(ctx.paths.side_archives_dir())
            .map(|entries| entries.count())
            .unwrap_or(0);
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_successful_restore_cleans_staging() {
        let (_temp, ctx, _runtime) = setup();
        let archive = full_backup(&ctx);
        let report = RestoreManager::new(&ctx).restore(&archive, &RestoreOptions::default()).unwrap();
        assert!(report.ok);
        assert!(staging_is_empty(&ctx));
    }

    #[test]
    fn test_safe_relative_rejects_parent() {
        assert!(safe_relative("../etc/passwd").is_err());
        assert!(safe_relative("conf/app.conf").is_ok());
    }
}
