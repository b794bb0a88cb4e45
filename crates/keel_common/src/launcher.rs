//! Tiered, health-gated service startup
//!
//! Services start tier by tier, lowest first. Inside a tier every service is
//! started concurrently and then polled until it is healthy, reports
//! unhealthy, or its timeout runs out. The next tier starts only when every
//! critical service of the current tier is healthy.

use crate::catalog::{partition_tiers, ServiceCatalog, ServiceDescriptor};
use crate::error::KeelError;
use crate::runtime::{ContainerRuntime, HealthStatus};
use serde::Serialize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Terminal result of one service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ServiceOutcome {
    Healthy,
    /// Non-critical service that did not make it
    Warning(String),
    /// Critical service that did not make it
    Failed(String),
    /// Never started because an earlier tier failed
    NotStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceLaunch {
    pub name: String,
    pub tier: u32,
    pub critical: bool,
    pub outcome: ServiceOutcome,
    /// Last probe answer
    pub last_status: Option<HealthStatus>,
    #[serde(with = "duration_secs")]
    pub waited: Duration,
    /// Gave up because the health timeout ran out
    pub timed_out: bool,
}

/// Aggregate result of `launch_all`
#[derive(Debug, Clone, Default, Serialize)]
pub struct LaunchReport {
    pub services: Vec<ServiceLaunch>,
    pub overall_ok: bool,
    /// Tier whose hard failure aborted the launch
    pub aborted_at_tier: Option<u32>,
}

impl LaunchReport {
    pub fn hard_failures(&self) -> Vec<&ServiceLaunch> {
        self.services
            .iter()
            .filter(|s| matches!(s.outcome, ServiceOutcome::Failed(_)))
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ServiceLaunch> {
        self.services
            .iter()
            .filter(|s| matches!(s.outcome, ServiceOutcome::Warning(_)))
            .collect()
    }

    pub fn service(&self, name: &str) -> Option<&ServiceLaunch> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Error describing the first hard failure
    pub fn failure(&self) -> Option<KeelError> {
        let first = self.hard_failures().into_iter().next()?;
        Some(match &first.outcome {
            _ if first.timed_out => KeelError::HealthGateTimeout {
                service: first.name.clone(),
                waited: first.waited,
            },
            ServiceOutcome::Failed(reason) => {
                KeelError::runtime(format!("service {} failed: {}", first.name, reason))
            }
            _ => KeelError::runtime(format!("service {} failed", first.name)),
        })
    }
}

pub struct ServiceLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    poll_interval: Duration,
}

impl ServiceLauncher {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, poll_interval: Duration) -> Self {
        Self {
            runtime,
            poll_interval,
        }
    }

    /// Start every service tier by tier and wait for each to reach a terminal status
    pub fn launch_all(&self, descriptors: &[ServiceDescriptor]) -> LaunchReport {
        let mut report = LaunchReport {
            overall_ok: true,
            ..Default::default()
        };

        for (tier, services) in partition_tiers(descriptors) {
            if report.aborted_at_tier.is_some() {
                report.services.extend(services.iter().map(|s| ServiceLaunch {
                    name: s.name.clone(),
                    tier,
                    critical: s.critical,
                    outcome: ServiceOutcome::NotStarted,
                    last_status: None,
                    waited: Duration::ZERO,
                    timed_out: false,
                }));
                continue;
            }

            info!(
                "Starting tier {}: {}",
                tier,
                services.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
            );

            let results: Vec<ServiceLaunch> = thread::scope(|scope| {
                let handles: Vec<_> = services
                    .iter()
                    .map(|service| scope.spawn(move || self.start_and_wait(service)))
                    .collect();
                handles
                    .into_iter()
                    .zip(services.iter())
                    .map(|(handle, service)| {
                        handle.join().unwrap_or_else(|_| ServiceLaunch {
                            name: service.name.clone(),
                            tier,
                            critical: service.critical,
                            outcome: failed_or_warning(service, "health poller panicked".to_string()),
                            last_status: None,
                            waited: Duration::ZERO,
                            timed_out: false,
                        })
                    })
                    .collect()
            });

            if results.iter().any(|r| matches!(r.outcome, ServiceOutcome::Failed(_))) {
                error!("Tier {} has a failed critical service, not starting later tiers", tier);
                report.overall_ok = false;
                report.aborted_at_tier = Some(tier);
            }
            report.services.extend(results);
        }

        report
    }

    fn start_and_wait(&self, service: &ServiceDescriptor) -> ServiceLaunch {
        let started = Instant::now();
        let finish = |outcome: ServiceOutcome, last_status: Option<HealthStatus>, timed_out: bool| {
            ServiceLaunch {
                name: service.name.clone(),
                tier: service.tier,
                critical: service.critical,
                outcome,
                last_status,
                waited: started.elapsed(),
                timed_out,
            }
        };

        if let Err(e) = self.runtime.start(&service.name) {
            warn!("Failed to start {}: {}", service.name, e);
            return finish(failed_or_warning(service, format!("start failed: {}", e)), None, false);
        }

        let deadline = started + service.health_timeout;
        let mut last_status = None;
        loop {
            match self.runtime.health(&service.name) {
                Ok(HealthStatus::Healthy) => {
                    info!("{} is healthy after {:?}", service.name, started.elapsed());
                    return finish(ServiceOutcome::Healthy, Some(HealthStatus::Healthy), false);
                }
                Ok(HealthStatus::Unhealthy) => {
                    warn!("{} reports unhealthy", service.name);
                    return finish(
                        failed_or_warning(service, "health probe reports unhealthy".to_string()),
                        Some(HealthStatus::Unhealthy),
                        false,
                    );
                }
                Ok(status) => {
                    debug!("{} is {}", service.name, status.as_str());
                    last_status = Some(status);
                }
                Err(e) => debug!("Health probe for {} failed: {}", service.name, e),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "{} did not become healthy within {}s",
                    service.name,
                    service.health_timeout.as_secs()
                );
                return finish(
                    failed_or_warning(
                        service,
                        format!("not healthy within {}s", service.health_timeout.as_secs()),
                    ),
                    last_status,
                    true,
                );
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    /// Graceful stop: non-critical services first, then the rest, each within
    /// its own grace period. Failures are collected, not fatal.
    pub fn stop_all(&self, catalog: &ServiceCatalog) -> Vec<StopFailure> {
        let (non_critical, critical) = catalog.stop_order();
        let mut failures = Vec::new();
        for service in non_critical.iter().chain(critical.iter()) {
            info!("Stopping {} (grace {}s)", service.name, service.stop_grace.as_secs());
            if let Err(e) = self.runtime.stop(&service.name, service.stop_grace) {
                warn!("Failed to stop {}: {}", service.name, e);
                failures.push(StopFailure {
                    service: service.name.clone(),
                    error: e.to_string(),
                });
            }
        }
        failures
    }
}

/// A service that did not stop cleanly
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopFailure {
    pub service: String,
    pub error: String,
}

fn failed_or_warning(service: &ServiceDescriptor, reason: String) -> ServiceOutcome {
    if service.critical {
        ServiceOutcome::Failed(reason)
    } else {
        ServiceOutcome::Warning(reason)
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, ScriptedRuntime};

    fn launcher(runtime: &Arc<ScriptedRuntime>) -> ServiceLauncher {
        ServiceLauncher::new(runtime.clone(), Duration::from_millis(5))
    }

    fn fast(name: &str, tier: u32, critical: bool) -> ServiceDescriptor {
        ServiceDescriptor::new(name, tier, critical).with_timeout(Duration::from_millis(100))
    }

    #[test]
    fn test_all_healthy() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script_health("api", &[HealthStatus::Starting, HealthStatus::Starting, HealthStatus::Healthy]);

        let report = launcher(&runtime).launch_all(&[fast("db", 0, true), fast("api", 1, true)]);

        assert!(report.overall_ok);
        assert!(report.hard_failures().is_empty());
        assert_eq!(report.service("api").unwrap().outcome, ServiceOutcome::Healthy);
        assert_eq!(runtime.starts(), vec!["db", "api"]);
    }

    #[test]
    fn test_critical_timeout_aborts_later_tiers() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script_health("db", &[HealthStatus::Starting]);

        let report = launcher(&runtime).launch_all(&[fast("db", 0, true), fast("api", 1, true)]);

        assert!(!report.overall_ok);
        assert_eq!(report.aborted_at_tier, Some(0));
        assert_eq!(report.service("api").unwrap().outcome, ServiceOutcome::NotStarted);
        assert_eq!(runtime.starts(), vec!["db"]);
        assert!(matches!(
            report.failure(),
            Some(KeelError::HealthGateTimeout { ref service, .. }) if service == "db"
        ));
    }

    #[test]
    fn test_non_critical_timeout_is_warning() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script_health("worker", &[HealthStatus::Starting]);

        let report = launcher(&runtime).launch_all(&[
            fast("db", 0, true),
            fast("worker", 0, false),
            fast("api", 1, true),
        ]);

        assert!(report.overall_ok);
        assert_eq!(report.warnings().len(), 1);
        assert!(runtime.starts().contains(&"api".to_string()));
    }

    #[test]
    fn test_unhealthy_critical_fails_without_waiting_for_timeout() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script_health("db", &[HealthStatus::Unhealthy]);
        let slow = ServiceDescriptor::new("db", 0, true).with_timeout(Duration::from_secs(30));

        let started = Instant::now();
        let report = launcher(&runtime).launch_all(&[slow]);

        assert!(!report.overall_ok);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(report.failure(), Some(KeelError::Runtime(_))));
    }

    #[test]
    fn test_start_failure_of_critical_is_hard_failure() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.fail_start("db");

        let report = launcher(&runtime).launch_all(&[fast("db", 0, true), fast("api", 1, true)]);
        assert!(!report.overall_ok);
        assert_eq!(runtime.starts(), vec!["db"]);
    }

    #[test]
    fn test_next_tier_starts_after_critical_healthy() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.script_health(
            "db",
            &[HealthStatus::Starting, HealthStatus::Starting, HealthStatus::Healthy],
        );

        launcher(&runtime).launch_all(&[fast("db", 0, true), fast("api", 1, true)]);

        let calls = runtime.calls();
        let db_healthy = calls
            .iter()
            .position(|c| *c == Call::Health("db".to_string(), HealthStatus::Healthy))
            .unwrap();
        let api_start = calls
            .iter()
            .position(|c| *c == Call::Start("api".to_string()))
            .unwrap();
        assert!(db_healthy < api_start);
    }

    #[test]
    fn test_stop_all_stops_workers_first_with_grace() {
        let runtime = Arc::new(ScriptedRuntime::new());
        runtime.mark_running(&["db", "api", "worker"]);
        runtime.fail_stop("api");
        let catalog = ServiceCatalog::from_services(vec![
            ServiceDescriptor::new("db", 0, true),
            ServiceDescriptor::new("api", 1, true),
            ServiceDescriptor::new("worker", 1, false).with_stop_grace(Duration::from_secs(45)),
        ]);

        let failures = launcher(&runtime).stop_all(&catalog);

        assert_eq!(runtime.stops(), vec!["worker", "api", "db"]);
        assert!(runtime
            .calls()
            .contains(&Call::Stop("worker".to_string(), Duration::from_secs(45))));
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].service, "api");
    }
}
