//! Aggregate verification: one probe per cataloged service

use crate::catalog::{MigrationHook, ServiceCatalog};
use crate::error::{KeelError, Result};
use crate::ops_log::OpsLog;
use crate::runtime::{ContainerRuntime, HealthStatus};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub critical: bool,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthReport {
    pub services: Vec<ServiceHealth>,
}

impl HealthReport {
    /// Critical services that are not healthy
    pub fn critical_problems(&self) -> Vec<&ServiceHealth> {
        self.services
            .iter()
            .filter(|s| s.critical && s.status != HealthStatus::Healthy)
            .collect()
    }

    pub fn non_critical_problems(&self) -> Vec<&ServiceHealth> {
        self.services
            .iter()
            .filter(|s| !s.critical && s.status != HealthStatus::Healthy)
            .collect()
    }

    pub fn critical_ok(&self) -> bool {
        self.critical_problems().is_empty()
    }

    pub fn all_healthy(&self) -> bool {
        self.services.iter().all(|s| s.status == HealthStatus::Healthy)
    }

    /// 0 all healthy, 1 only non-critical problems, 2 any critical problem
    pub fn exit_code(&self) -> i32 {
        if !self.critical_ok() {
            2
        } else if !self.all_healthy() {
            1
        } else {
            0
        }
    }

    /// Error naming the unhealthy critical services
    pub fn failure(&self) -> Option<KeelError> {
        let problems = self.critical_problems();
        if problems.is_empty() {
            return None;
        }
        Some(KeelError::runtime(format!(
            "verification failed: {}",
            problems
                .iter()
                .map(|s| format!("{} is {}", s.name, s.status.as_str()))
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

/// Probe every service once
pub fn probe_all(runtime: &dyn ContainerRuntime, catalog: &ServiceCatalog) -> HealthReport {
    let services = catalog
        .services
        .iter()
        .map(|service| {
            let status = runtime.health(&service.name).unwrap_or_else(|e| {
                warn!("Health probe for {} failed: {}", service.name, e);
                HealthStatus::NotFound
            });
            ServiceHealth {
                name: service.name.clone(),
                critical: service.critical,
                status,
            }
        })
        .collect();
    HealthReport { services }
}

/// Run data-migration hooks in catalog order; the first failure stops the run
pub fn run_migrations(runtime: &dyn ContainerRuntime, hooks: &[MigrationHook], ops: &OpsLog) -> Result<()> {
    for hook in hooks {
        info!("Running migration {} in {}", hook.name, hook.service);
        ops.record("migration", &hook.name);
        let output = runtime.exec(&hook.service, &hook.command, None)?;
        if !output.success() {
            ops.record("migration_failed", &format!("{} exit={}", hook.name, output.exit_code));
            return Err(KeelError::runtime(format!(
                "migration {} failed ({}): {}",
                hook.name,
                output.exit_code,
                output.stderr_lossy()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServiceDescriptor;
    use crate::runtime::ExecOutput;
    use crate::testing::ScriptedRuntime;
    use tempfile::TempDir;

    fn catalog() -> ServiceCatalog {
        ServiceCatalog::from_services(vec![
            ServiceDescriptor::new("db", 0, true),
            ServiceDescriptor::new("worker", 1, false),
        ])
    }

    #[test]
    fn test_exit_codes() {
        let runtime = ScriptedRuntime::new();
        runtime.mark_running(&["db", "worker"]);
        assert_eq!(probe_all(&runtime, &catalog()).exit_code(), 0);

        runtime.script_health("worker", &[HealthStatus::Unhealthy]);
        let report = probe_all(&runtime, &catalog());
        assert_eq!(report.exit_code(), 1);
        assert!(report.failure().is_none());

        runtime.script_health("db", &[HealthStatus::Starting]);
        let report = probe_all(&runtime, &catalog());
        assert_eq!(report.exit_code(), 2);
        assert!(report.failure().unwrap().to_string().contains("db is starting"));
    }

    #[test]
    fn test_stopped_service_is_not_found() {
        let runtime = ScriptedRuntime::new();
        let report = probe_all(&runtime, &catalog());
        assert!(report.services.iter().all(|s| s.status == HealthStatus::NotFound));
    }

    #[test]
    fn test_failing_migration_stops_the_run() {
        let temp = TempDir::new().unwrap();
        let ops = OpsLog::start(temp.path(), "install");
        let runtime = ScriptedRuntime::new();
        runtime.mark_running(&["api"]);
        runtime.set_exec_output(
            "api",
            "migrate",
            ExecOutput {
                exit_code: 1,
                stdout: Vec::new(),
                stderr: b"schema lock".to_vec(),
            },
        );
        let hooks = vec![
            MigrationHook {
                name: "schema".to_string(),
                service: "api".to_string(),
                command: vec!["migrate".to_string()],
            },
            MigrationHook {
                name: "reindex".to_string(),
                service: "api".to_string(),
                command: vec!["reindex".to_string()],
            },
        ];

        let err = run_migrations(&runtime, &hooks, &ops).unwrap_err();
        assert!(err.to_string().contains("schema lock"));
        assert_eq!(
            runtime
                .calls()
                .iter()
                .filter(|c| matches!(c, crate::testing::Call::Exec(..)))
                .count(),
            1
        );
    }
}
