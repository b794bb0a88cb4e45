//! Container orchestration interface
//!
//! The lifecycle core only talks to containers through `ContainerRuntime`.
//! `ComposeRuntime` drives `docker compose` for the deployment directory:
//! - project dir = deploy dir, env file = live `.env`
//! - image tags come from the version pointer via `KEEL_VERSION`

use crate::error::{KeelError, Result};
use crate::paths::KeelPaths;
use crate::state::VersionPointer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Per-service health as reported by the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Starting,
    NotFound,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Starting => "starting",
            HealthStatus::NotFound => "not-found",
        }
    }
}

/// Output of a command run inside a service
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Start/stop/probe/exec surface of the container engine
pub trait ContainerRuntime: Send + Sync {
    /// Whether the engine is reachable at all
    fn available(&self) -> Result<()>;

    fn start(&self, service: &str) -> Result<()>;

    /// Ask the service to stop; forced termination after `grace`
    fn stop(&self, service: &str, grace: Duration) -> Result<()>;

    fn health(&self, service: &str) -> Result<HealthStatus>;

    fn exec(&self, service: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput>;

    /// Last `tail` lines of a service's log
    fn logs(&self, service: &str, tail: usize) -> Result<String>;

    /// Fetch images for the given services at the current version pointer
    fn pull(&self, services: &[String]) -> Result<()>;

    /// Image identifier per service
    fn image_ids(&self, services: &[String]) -> Result<BTreeMap<String, String>>;

    /// Run a throwaway container, removed on exit
    fn run_ephemeral(&self, image: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput>;
}

/// `docker compose` backed runtime
pub struct ComposeRuntime {
    paths: KeelPaths,
    binary: String,
}

impl ComposeRuntime {
    pub fn new(paths: &KeelPaths) -> Self {
        Self {
            paths: paths.clone(),
            binary: "docker".to_string(),
        }
    }

    fn compose(&self) -> Result<Command> {
        let version = VersionPointer::read(&self.paths.version_file())?.ok_or_else(|| {
            KeelError::conflict(
                "No version pointer found",
                "Run `keelctl install` before managing services",
            )
        })?;
        let mut cmd = Command::new(&self.binary);
        cmd.arg("compose")
            .arg("--project-directory")
            .arg(&self.paths.deploy_dir)
            .arg("--env-file")
            .arg(&self.paths.env_file)
            .env("KEEL_VERSION", version);
        Ok(cmd)
    }

    fn run(&self, mut cmd: Command, stdin: Option<&[u8]>, what: &str) -> Result<ExecOutput> {
        debug!("runtime: {:?}", cmd);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });

        let mut child = cmd
            .spawn()
            .map_err(|e| KeelError::runtime(format!("failed to execute {}: {}", what, e)))?;

        // Feed stdin from a separate thread so a chatty child cannot fill its
        // stdout pipe while we are still writing
        let feeder = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_vec();
                Some(thread::spawn(move || pipe.write_all(&input)))
            }
            _ => None,
        };

        let output = child
            .wait_with_output()
            .map_err(|e| KeelError::runtime(format!("failed to wait for {}: {}", what, e)))?;

        if let Some(feeder) = feeder {
            match feeder.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    return Err(KeelError::runtime(format!("failed to feed {}: {}", what, e)));
                }
                Err(_) => return Err(KeelError::runtime(format!("stdin feeder for {} panicked", what))),
            }
        }

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn run_checked(&self, cmd: Command, what: &str) -> Result<ExecOutput> {
        let output = self.run(cmd, None, what)?;
        if !output.success() {
            return Err(KeelError::runtime(format!(
                "{} failed ({}): {}",
                what,
                output.exit_code,
                output.stderr_lossy()
            )));
        }
        Ok(output)
    }

    fn container_id(&self, service: &str) -> Result<Option<String>> {
        let mut cmd = self.compose()?;
        cmd.args(["ps", "-q", service]);
        let output = self.run_checked(cmd, &format!("compose ps {}", service))?;
        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((!id.is_empty()).then_some(id))
    }
}

impl ContainerRuntime for ComposeRuntime {
    fn available(&self) -> Result<()> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["compose", "version"]);
        self.run_checked(cmd, "docker compose version").map(|_| ())
    }

    fn start(&self, service: &str) -> Result<()> {
        let mut cmd = self.compose()?;
        cmd.args(["up", "-d", "--no-deps", service]);
        self.run_checked(cmd, &format!("start {}", service)).map(|_| ())
    }

    fn stop(&self, service: &str, grace: Duration) -> Result<()> {
        let mut cmd = self.compose()?;
        let timeout = grace.as_secs().to_string();
        cmd.args(["stop", "--timeout", timeout.as_str(), service]);
        self.run_checked(cmd, &format!("stop {}", service)).map(|_| ())
    }

    fn health(&self, service: &str) -> Result<HealthStatus> {
        let Some(id) = self.container_id(service)? else {
            return Ok(HealthStatus::NotFound);
        };

        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "inspect",
            "--format",
            "{{.State.Status}} {{if .State.Health}}{{.State.Health.Status}}{{else}}none{{end}}",
            id.as_str(),
        ]);
        let output = self.run(cmd, None, &format!("inspect {}", service))?;
        if !output.success() {
            return Ok(HealthStatus::NotFound);
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let mut parts = text.split_whitespace();
        let state = parts.next().unwrap_or("");
        let health = parts.next().unwrap_or("none");

        Ok(match (state, health) {
            ("running", "healthy") => HealthStatus::Healthy,
            // No healthcheck declared: running is as good as it gets
            ("running", "none") => HealthStatus::Healthy,
            (_, "unhealthy") => HealthStatus::Unhealthy,
            ("running", _) | ("created", _) | ("restarting", _) => HealthStatus::Starting,
            ("exited", _) | ("dead", _) => HealthStatus::Unhealthy,
            _ => HealthStatus::NotFound,
        })
    }

    fn exec(&self, service: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let mut cmd = self.compose()?;
        cmd.args(["exec", "-T", service]).args(command);
        self.run(cmd, stdin, &format!("exec in {}", service))
    }

    fn logs(&self, service: &str, tail: usize) -> Result<String> {
        let mut cmd = self.compose()?;
        let tail = tail.to_string();
        cmd.args(["logs", "--no-color", "--tail", tail.as_str(), service]);
        let output = self.run(cmd, None, &format!("logs {}", service))?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }

    fn pull(&self, services: &[String]) -> Result<()> {
        let mut cmd = self.compose()?;
        cmd.args(["pull", "--quiet"]).args(services);
        self.run_checked(cmd, "image pull").map(|_| ())
    }

    fn image_ids(&self, services: &[String]) -> Result<BTreeMap<String, String>> {
        let mut ids = BTreeMap::new();
        for service in services {
            let mut cmd = self.compose()?;
            cmd.args(["images", "-q", service]);
            let output = self.run(cmd, None, &format!("images {}", service))?;
            let id = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if !id.is_empty() {
                ids.insert(service.clone(), id);
            }
        }
        Ok(ids)
    }

    fn run_ephemeral(&self, image: &str, command: &[String], stdin: Option<&[u8]>) -> Result<ExecOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["run", "--rm", "-i", image]).args(command);
        self.run(cmd, stdin, &format!("ephemeral {}", image))
    }
}
