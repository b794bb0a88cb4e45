//! Cross-module guarantees of the lifecycle core

use keel_common::catalog::ServiceDescriptor;
use keel_common::env_merge::{merge_files, EnvironmentFile};
use keel_common::error::KeelError;
use keel_common::launcher::{ServiceLauncher, ServiceOutcome};
use keel_common::lock::MUTATION_LOCK;
use keel_common::rollback::RollbackController;
use keel_common::runtime::{ExecOutput, HealthStatus};
use keel_common::state::VersionPointer;
use keel_common::testing::{Call, ScriptedRuntime};
use keel_common::update::{UpdateController, UpdateOptions, UpdateStatus};
use keel_common::{KeelConfig, KeelPaths, StackContext};
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const CATALOG: &str = r#"
[[service]]
name = "db"
tier = 0
health_timeout_secs = 5

[[service]]
name = "api"
tier = 1
health_timeout_secs = 5

[[migration]]
name = "schema"
service = "db"
command = ["migrate", "up"]
"#;

fn stack(temp: &TempDir) -> (KeelPaths, StackContext, Arc<ScriptedRuntime>) {
    let paths = KeelPaths::with_root(temp.path());
    fs::create_dir_all(&paths.deploy_dir).unwrap();
    fs::write(paths.services_file(), CATALOG).unwrap();
    fs::write(paths.deploy_dir.join("compose.yml"), "services: {}\n").unwrap();
    fs::write(&paths.env_file, "# production\nDB_PASSWORD=hunter2\n\nPORT=8443\n").unwrap();
    VersionPointer::write(&paths.version_file(), "1.0.0").unwrap();

    let runtime = Arc::new(ScriptedRuntime::with_version_file(paths.version_file()));
    runtime.mark_running(&["db", "api"]);
    let mut config = KeelConfig::default();
    config.fetch.base_delay_secs = 0;
    config.update.settle_delay_secs = 0;
    let ctx = StackContext::new(paths.clone(), config, runtime.clone()).with_poll_interval(Duration::from_millis(5));
    (paths, ctx, runtime)
}

#[test]
fn rollback_restores_environment_byte_for_byte() {
    let temp = TempDir::new().unwrap();
    let (paths, ctx, runtime) = stack(&temp);
    let env_before = fs::read(&paths.env_file).unwrap();
    let compose_before = fs::read(paths.deploy_dir.join("compose.yml")).unwrap();

    let source = temp.path().join("release-2.0.0");
    fs::create_dir_all(&source).unwrap();
    fs::write(source.join("compose.yml"), "services: {api: {}}\n").unwrap();
    fs::write(source.join("worker.yml"), "replicas: 2\n").unwrap();
    fs::write(source.join("env.template"), "PORT=80\nFEATURE_X=off\n").unwrap();
    runtime.set_exec_output(
        "db",
        "migrate",
        ExecOutput {
            exit_code: 1,
            stderr: b"relation already exists".to_vec(),
            ..Default::default()
        },
    );

    let mut options = UpdateOptions::new("2.0.0");
    options.skip_backup = true;
    options.source = Some(source);
    let report = UpdateController::new(&ctx).update(&options).unwrap();

    assert_eq!(report.status, UpdateStatus::RolledBack);
    assert_eq!(report.files_replaced, 1);
    assert_eq!(report.files_added, 2);
    assert_eq!(fs::read(&paths.env_file).unwrap(), env_before);
    assert_eq!(fs::read(paths.deploy_dir.join("compose.yml")).unwrap(), compose_before);
    assert!(!paths.deploy_dir.join("worker.yml").exists());
    assert_eq!(ctx.current_version().unwrap().as_deref(), Some("1.0.0"));
}

#[test]
fn merge_adds_missing_keys_and_keeps_existing_values() {
    let temp = TempDir::new().unwrap();
    let template = temp.path().join("env.template");
    let live = temp.path().join(".env");
    fs::write(&template, "A=default-a\nB=default-b\nC=default-c\nD=default-d\nE=default-e\n").unwrap();
    fs::write(&live, "A=live-a\n# keep me\nC=live-c\nE=live-e\n").unwrap();

    assert_eq!(merge_files(&template, &live).unwrap(), 2);

    let merged = EnvironmentFile::load(&live).unwrap();
    assert_eq!(merged.get("A"), Some("live-a"));
    assert_eq!(merged.get("C"), Some("live-c"));
    assert_eq!(merged.get("E"), Some("live-e"));
    assert_eq!(merged.get("B"), Some("default-b"));
    assert_eq!(merged.get("D"), Some("default-d"));
    assert!(fs::read_to_string(&live).unwrap().starts_with("A=live-a\n# keep me\nC=live-c\nE=live-e\n"));

    assert_eq!(merge_files(&template, &live).unwrap(), 0);
}

#[test]
fn critical_service_holds_back_next_tier_for_its_whole_timeout() {
    let runtime = Arc::new(ScriptedRuntime::new());
    runtime.script_health("db", &[HealthStatus::Starting]);
    runtime.script_health("cache", &[HealthStatus::Starting]);
    let launcher = ServiceLauncher::new(runtime.clone(), Duration::from_millis(10));

    let db = ServiceDescriptor::new("db", 0, true).with_timeout(Duration::from_millis(300));
    let api = ServiceDescriptor::new("api", 1, true);
    let report = launcher.launch_all(&[db, api]);

    assert!(!report.overall_ok);
    let db = report.service("db").unwrap();
    assert!(db.timed_out);
    assert!(db.waited >= Duration::from_millis(300));
    assert_eq!(report.service("api").unwrap().outcome, ServiceOutcome::NotStarted);
    assert!(!runtime.calls().contains(&Call::Start("api".to_string())));

    // A non-critical service timing out does not block promotion
    runtime.clear_journal();
    let cache = ServiceDescriptor::new("cache", 0, false).with_timeout(Duration::from_millis(100));
    let api = ServiceDescriptor::new("api", 1, true);
    let report = launcher.launch_all(&[cache, api]);
    assert!(report.overall_ok);
    assert!(matches!(report.service("cache").unwrap().outcome, ServiceOutcome::Warning(_)));
    assert_eq!(report.service("api").unwrap().outcome, ServiceOutcome::Healthy);
}

#[test]
fn concurrent_mutations_never_interleave() {
    let temp = TempDir::new().unwrap();
    let (_paths, ctx, runtime) = stack(&temp);

    // A checkpoint for the rollback to use
    let mut first = UpdateOptions::new("1.1.0");
    first.skip_backup = true;
    assert_eq!(
        UpdateController::new(&ctx).update(&first).unwrap().status,
        UpdateStatus::Succeeded
    );

    // Keep whichever operation wins busy for a while
    let mut warming_up = vec![HealthStatus::Starting; 60];
    warming_up.push(HealthStatus::Healthy);
    runtime.script_health("db", &warming_up);

    let barrier = Arc::new(Barrier::new(2));
    let update = {
        let (ctx, barrier) = (ctx.clone(), barrier.clone());
        thread::spawn(move || {
            let mut options = UpdateOptions::new("1.2.0");
            options.skip_backup = true;
            barrier.wait();
            UpdateController::new(&ctx).update(&options).map(|_| ())
        })
    };
    let rollback = {
        let (ctx, barrier) = (ctx.clone(), barrier.clone());
        thread::spawn(move || {
            barrier.wait();
            RollbackController::new(&ctx).rollback(None, None).map(|_| ())
        })
    };

    let results = [update.join().unwrap(), rollback.join().unwrap()];
    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(KeelError::StateConflict { .. }))));
    assert!(!ctx.locks().is_locked(MUTATION_LOCK));
}
