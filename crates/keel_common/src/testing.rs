//! Scripted container runtime for tests
//!
//! Health answers are scripted per service (optionally per version), the last
//! scripted answer repeats. Every call is journaled so tests can assert on
//! ordering.

use crate::certs::CertificateProvider;
use crate::error::{KeelError, Result};
use crate::runtime::{ContainerRuntime, ExecOutput, HealthStatus};
use crate::state::VersionPointer;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// One recorded runtime call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Start(String),
    Stop(String, Duration),
    Health(String, HealthStatus),
    Exec(String, Vec<String>),
    Pull(Vec<String>),
    Ephemeral(String),
}

#[derive(Default)]
struct Inner {
    journal: Vec<(Instant, Call)>,
    running: HashSet<String>,
    health: HashMap<(String, Option<String>), VecDeque<HealthStatus>>,
    failing_starts: HashSet<String>,
    failing_stops: HashSet<String>,
    pull_failures: u32,
    exec_outputs: HashMap<(String, String), ExecOutput>,
    exec_stdin: Vec<(String, Vec<String>, Vec<u8>)>,
    ephemeral_outputs: HashMap<String, ExecOutput>,
    unavailable: bool,
}

#[derive(Default)]
pub struct ScriptedRuntime {
    inner: Mutex<Inner>,
    version_file: Option<PathBuf>,
}

impl ScriptedRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the version pointer so health scripts can depend on the deployed version
    pub fn with_version_file(path: PathBuf) -> Self {
        Self {
            inner: Mutex::default(),
            version_file: Some(path),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn current_version(&self) -> Option<String> {
        self.version_file
            .as_ref()
            .and_then(|path| VersionPointer::read(path).ok().flatten())
    }

    /// Script health answers for a service under any version
    pub fn script_health(&self, service: &str, answers: &[HealthStatus]) {
        self.lock()
            .health
            .insert((service.to_string(), None), answers.iter().copied().collect());
    }

    /// Script health answers for a service while `version` is deployed
    pub fn script_health_for_version(&self, service: &str, version: &str, answers: &[HealthStatus]) {
        self.lock().health.insert(
            (service.to_string(), Some(version.to_string())),
            answers.iter().copied().collect(),
        );
    }

    pub fn fail_start(&self, service: &str) {
        self.lock().failing_starts.insert(service.to_string());
    }

    pub fn fail_stop(&self, service: &str) {
        self.lock().failing_stops.insert(service.to_string());
    }

    /// Fail the next `count` pulls
    pub fn fail_pulls(&self, count: u32) {
        self.lock().pull_failures = count;
    }

    pub fn set_unavailable(&self) {
        self.lock().unavailable = true;
    }

    /// Output for commands whose first word is `program` inside `service`
    pub fn set_exec_output(&self, service: &str, program: &str, output: ExecOutput) {
        self.lock()
            .exec_outputs
            .insert((service.to_string(), program.to_string()), output);
    }

    pub fn set_ephemeral_output(&self, program: &str, output: ExecOutput) {
        self.lock().ephemeral_outputs.insert(program.to_string(), output);
    }

    pub fn mark_running(&self, services: &[&str]) {
        let mut inner = self.lock();
        for service in services {
            inner.running.insert(service.to_string());
        }
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.lock().running.contains(service)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().journal.iter().map(|(_, call)| call.clone()).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.lock().journal.clone()
    }

    pub fn starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Start(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    pub fn stops(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Stop(name, _) => Some(name),
                _ => None,
            })
            .collect()
    }

    /// Stdin payloads received by exec, in order
    pub fn exec_stdin(&self) -> Vec<(String, Vec<String>, Vec<u8>)> {
        self.lock().exec_stdin.clone()
    }

    pub fn clear_journal(&self) {
        self.lock().journal.clear();
    }

    fn record(inner: &mut Inner, call: Call) {
        inner.journal.push((Instant::now(), call));
    }
}

impl ContainerRuntime for ScriptedRuntime {
    fn available(&self) -> Result<()> {
        if self.lock().unavailable {
            return Err(KeelError::runtime("container engine not reachable"));
        }
        Ok(())
    }

    fn start(&self, service: &str) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Start(service.to_string()));
        if inner.failing_starts.contains(service) {
            return Err(KeelError::runtime(format!("start {} failed", service)));
        }
        inner.running.insert(service.to_string());
        Ok(())
    }

    fn stop(&self, service: &str, grace: Duration) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Stop(service.to_string(), grace));
        if inner.failing_stops.contains(service) {
            return Err(KeelError::runtime(format!("stop {} failed", service)));
        }
        inner.running.remove(service);
        Ok(())
    }

    fn health(&self, service: &str) -> Result<HealthStatus> {
        let version = self.current_version();
        let mut inner = self.lock();

        let status = if !inner.running.contains(service) {
            HealthStatus::NotFound
        } else {
            let versioned = version.map(|v| (service.to_string(), Some(v)));
            let key = match versioned {
                Some(key) if inner.health.contains_key(&key) => Some(key),
                _ => Some((service.to_string(), None)).filter(|k| inner.health.contains_key(k)),
            };
            match key.and_then(|k| inner.health.get_mut(&k)) {
                Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(HealthStatus::Healthy),
                Some(queue) => queue.front().copied().unwrap_or(HealthStatus::Healthy),
                None => HealthStatus::Healthy,
            }
        };

        Self::record(&mut inner, Call::Health(service.to_string(), status));
        Ok(status)
    }

    fn exec(&self, service: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Exec(service.to_string(), command.to_vec()));
        if !inner.running.contains(service) {
            return Err(KeelError::runtime(format!("service {} is not running", service)));
        }
        if let Some(input) = stdin {
            inner
                .exec_stdin
                .push((service.to_string(), command.to_vec(), input.to_vec()));
        }
        let program = command.first().cloned().unwrap_or_default();
        Ok(inner
            .exec_outputs
            .get(&(service.to_string(), program))
            .cloned()
            .unwrap_or_default())
    }

    fn logs(&self, service: &str, tail: usize) -> Result<String> {
        Ok(format!("[{}] last {} lines\n", service, tail))
    }

    fn pull(&self, services: &[String]) -> Result<()> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Pull(services.to_vec()));
        if inner.pull_failures > 0 {
            inner.pull_failures -= 1;
            return Err(KeelError::runtime("registry unreachable"));
        }
        Ok(())
    }

    fn image_ids(&self, services: &[String]) -> Result<BTreeMap<String, String>> {
        let version = self.current_version().unwrap_or_else(|| "none".to_string());
        Ok(services
            .iter()
            .map(|s| (s.clone(), format!("sha256:{}-{}", s, version)))
            .collect())
    }

    fn run_ephemeral(&self, image: &str, command: &[String], _stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let mut inner = self.lock();
        Self::record(&mut inner, Call::Ephemeral(image.to_string()));
        let program = command.first().cloned().unwrap_or_default();
        Ok(inner.ephemeral_outputs.get(&program).cloned().unwrap_or_default())
    }
}

/// Certificate provider with fixed answers
#[derive(Debug, Clone)]
pub struct StaticCertificates {
    pub expired: bool,
    pub expiring_soon: bool,
    pub key_matches: bool,
}

impl StaticCertificates {
    pub fn valid() -> Self {
        Self {
            expired: false,
            expiring_soon: false,
            key_matches: true,
        }
    }
}

impl CertificateProvider for StaticCertificates {
    fn provide(&self, _cert: &Path, _key: &Path) -> Result<()> {
        Ok(())
    }

    fn expires_within(&self, _cert: &Path, window: Duration) -> Result<bool> {
        Ok(if window.is_zero() {
            self.expired
        } else {
            self.expired || self.expiring_soon
        })
    }

    fn key_matches(&self, _cert: &Path, _key: &Path) -> Result<bool> {
        Ok(self.key_matches)
    }
}
