//! End-to-end lifecycle scenarios against the scripted runtime
//!
//! A: install interrupted during image_fetch resumes at image_fetch
//! B: update whose critical service never gets healthy rolls back
//! C: one corrupted byte fails verification at decompression
//! D: update while a rollback holds the lock fails fast

use keel_common::backup::{BackupManager, RetentionClass};
use keel_common::config::BackupKind;
use keel_common::error::{IntegrityCheck, KeelError, Result};
use keel_common::install::{run_install, InstallContext, INSTALL_STEPS};
use keel_common::install_state::{InstallState, StepStatus};
use keel_common::integrity::IntegrityVerifier;
use keel_common::lock::MUTATION_LOCK;
use keel_common::runtime::{ContainerRuntime, ExecOutput, HealthStatus};
use keel_common::secrets::RandomSecrets;
use keel_common::testing::{Call, ScriptedRuntime, StaticCertificates};
use keel_common::update::{UpdateController, UpdateOptions, UpdateStatus};
use keel_common::{KeelConfig, KeelPaths, StackContext};
use std::collections::BTreeMap;
use std::fs;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const CATALOG: &str = r#"
[[service]]
name = "db"
tier = 0
health_timeout_secs = 1

[[service]]
name = "api"
tier = 1
health_timeout_secs = 1

[[service]]
name = "worker"
tier = 2
critical = false
health_timeout_secs = 1
stop_grace_secs = 2

[[datastore]]
name = "main"
service = "db"
dump_command = ["pg_dump"]
restore_command = ["psql"]
"#;

fn test_config() -> KeelConfig {
    let mut config = KeelConfig::default();
    config.fetch.base_delay_secs = 0;
    config.update.settle_delay_secs = 0;
    config
}

fn deployment(temp: &TempDir) -> KeelPaths {
    let paths = KeelPaths::with_root(temp.path());
    fs::create_dir_all(&paths.deploy_dir).unwrap();
    fs::write(paths.services_file(), CATALOG).unwrap();
    paths
}

fn context(paths: &KeelPaths, runtime: Arc<dyn ContainerRuntime>) -> StackContext {
    StackContext::new(paths.clone(), test_config(), runtime).with_poll_interval(Duration::from_millis(5))
}

/// Delegates to the scripted runtime but dies in the middle of an image pull
struct DiesDuringPull {
    inner: Arc<ScriptedRuntime>,
}

impl ContainerRuntime for DiesDuringPull {
    fn available(&self) -> Result<()> {
        self.inner.available()
    }
    fn start(&self, service: &str) -> Result<()> {
        self.inner.start(service)
    }
    fn stop(&self, service: &str, grace: Duration) -> Result<()> {
        self.inner.stop(service, grace)
    }
    fn health(&self, service: &str) -> Result<HealthStatus> {
        self.inner.health(service)
    }
    fn exec(&self, service: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        self.inner.exec(service, command, stdin)
    }
    fn logs(&self, service: &str, tail: usize) -> Result<String> {
        self.inner.logs(service, tail)
    }
    fn pull(&self, _services: &[String]) -> Result<()> {
        panic!("process killed during image pull");
    }
    fn image_ids(&self, services: &[String]) -> Result<BTreeMap<String, String>> {
        self.inner.image_ids(services)
    }
    fn run_ephemeral(&self, image: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        self.inner.run_ephemeral(image, command, stdin)
    }
}

#[test]
fn scenario_a_install_resumes_at_interrupted_step() {
    let temp = TempDir::new().unwrap();
    let paths = deployment(&temp);
    fs::write(&paths.env_template, "DB_PASSWORD=__GENERATE__\n").unwrap();
    let scripted = Arc::new(ScriptedRuntime::new());

    // First run dies inside image_fetch
    let dying = context(&paths, Arc::new(DiesDuringPull { inner: scripted.clone() }));
    let first = InstallContext::new(
        dying,
        Arc::new(StaticCertificates::valid()),
        Arc::new(RandomSecrets::default()),
        "1.0.0",
    );
    let outcome = catch_unwind(AssertUnwindSafe(|| run_install(&first, false)));
    assert!(outcome.is_err());

    let state = InstallState::load(&paths.install_state_file()).unwrap().unwrap();
    assert_eq!(state.current_step.as_deref(), Some("image_fetch"));
    assert_eq!(state.status, StepStatus::InProgress);
    let secrets_before = fs::read_to_string(&paths.env_file).unwrap();

    // Re-invoked with resume
    let resumed = InstallContext::new(
        context(&paths, scripted.clone()),
        Arc::new(StaticCertificates::valid()),
        Arc::new(RandomSecrets::default()),
        "1.0.0",
    );
    let report = run_install(&resumed, true).unwrap();

    let fetch_index = INSTALL_STEPS.iter().position(|s| *s == "image_fetch").unwrap();
    assert_eq!(report.skipped, INSTALL_STEPS[..fetch_index].to_vec());
    assert_eq!(report.executed, INSTALL_STEPS[fetch_index..].to_vec());
    assert_eq!(fs::read_to_string(&paths.env_file).unwrap(), secrets_before);
    assert!(InstallState::load(&paths.install_state_file()).unwrap().unwrap().is_complete());
}

#[test]
fn scenario_b_unhealthy_update_rolls_back_to_previous_version() {
    let temp = TempDir::new().unwrap();
    let paths = deployment(&temp);
    fs::write(&paths.env_file, "# live\nDB_PASSWORD=s3cret\nPORT=8080\n").unwrap();
    fs::write(&paths.env_template, "DB_PASSWORD=\nPORT=80\nNEW_FLAG=on\n").unwrap();
    keel_common::state::VersionPointer::write(&paths.version_file(), "1.0.0").unwrap();
    let env_before = fs::read(&paths.env_file).unwrap();

    let runtime = Arc::new(ScriptedRuntime::with_version_file(paths.version_file()));
    runtime.mark_running(&["db", "api", "worker"]);
    runtime.script_health_for_version("api", "2.0.0", &[HealthStatus::Starting]);
    let ctx = context(&paths, runtime.clone());

    let mut options = UpdateOptions::new("2.0.0");
    options.skip_backup = true;
    let report = UpdateController::new(&ctx).update(&options).unwrap();

    assert_eq!(report.status, UpdateStatus::RolledBack);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(report.env_keys_added, 1);
    let rollback = report.rollback.as_ref().unwrap();
    assert!(rollback.ok);
    assert_eq!(rollback.checkpoint, report.checkpoint);

    assert_eq!(ctx.current_version().unwrap().as_deref(), Some("1.0.0"));
    assert_eq!(fs::read(&paths.env_file).unwrap(), env_before);
    assert!(report.diagnostics.is_some());
    assert!(!ctx.locks().is_locked(MUTATION_LOCK));
}

#[test]
fn scenario_c_corrupt_byte_fails_at_decompression() {
    let temp = TempDir::new().unwrap();
    let paths = deployment(&temp);
    fs::write(&paths.env_file, "PORT=8080\n").unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    runtime.mark_running(&["db"]);
    runtime.set_exec_output(
        "db",
        "pg_dump",
        ExecOutput {
            stdout: b"CREATE TABLE t (id int);\nCOPY t FROM stdin;\n1\n2\n\\.\n".repeat(64),
            ..Default::default()
        },
    );
    let ctx = context(&paths, runtime);

    let archive = BackupManager::new(&ctx)
        .create(BackupKind::Full, RetentionClass::Regular, None)
        .unwrap()
        .path;
    IntegrityVerifier::default().verify(&archive).unwrap();

    let mut bytes = fs::read(&archive).unwrap();
    let target = bytes.len() / 2;
    bytes[target] = !bytes[target];
    fs::write(&archive, bytes).unwrap();

    match IntegrityVerifier::default().verify(&archive).unwrap_err() {
        KeelError::Integrity { check, .. } => assert_eq!(check, IntegrityCheck::Decompression),
        other => panic!("expected an integrity failure, got {}", other),
    }
}

#[test]
fn scenario_d_update_blocked_by_running_rollback() {
    let temp = TempDir::new().unwrap();
    let paths = deployment(&temp);
    fs::write(&paths.env_file, "PORT=8080\n").unwrap();
    keel_common::state::VersionPointer::write(&paths.version_file(), "1.0.0").unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    runtime.mark_running(&["db", "api", "worker"]);
    let ctx = context(&paths, runtime.clone());

    let rollback_lock = ctx.locks().acquire(MUTATION_LOCK, "rollback").unwrap();

    let started = Instant::now();
    let err = UpdateController::new(&ctx)
        .update(&UpdateOptions::new("2.0.0"))
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(matches!(err, KeelError::StateConflict { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(err.to_string().contains("rollback"));
    assert!(!runtime
        .calls()
        .iter()
        .any(|c| matches!(c, Call::Stop(..) | Call::Pull(_) | Call::Start(_))));
    assert_eq!(ctx.current_version().unwrap().as_deref(), Some("1.0.0"));
    assert!(fs::read_dir(paths.checkpoints_dir()).map(|d| d.count() == 0).unwrap_or(true));
    drop(rollback_lock);
}
