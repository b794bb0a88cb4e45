//! Resumable step sequencer
//!
//! Drives a fixed, ordered list of named steps. Status is persisted
//! immediately before and after every step body, so an interrupted run can be
//! resumed at the step that did not finish. Step bodies are responsible for
//! their own idempotency.

use crate::error::{KeelError, Result};
use crate::install_state::{InstallParams, InstallState, StepStatus};
use crate::ops_log::OpsLog;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info};

type StepBody<C> = Box<dyn Fn(&C) -> Result<()> + Send + Sync>;

/// One named step; its ordinal is its position in the sequence
pub struct StepDefinition<C> {
    pub name: &'static str,
    body: StepBody<C>,
}

impl<C> StepDefinition<C> {
    pub fn new<F>(name: &'static str, body: F) -> Self
    where
        F: Fn(&C) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name,
            body: Box::new(body),
        }
    }
}

/// What one `run` did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceReport {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
}

pub struct StepSequencer {
    state_path: PathBuf,
    logs_dir: PathBuf,
    operation: String,
}

impl StepSequencer {
    pub fn new(state_path: &Path, logs_dir: &Path, operation: &str) -> Self {
        Self {
            state_path: state_path.to_path_buf(),
            logs_dir: logs_dir.to_path_buf(),
            operation: operation.to_string(),
        }
    }

    /// Persisted state, if any
    pub fn state(&self) -> Result<Option<InstallState>> {
        InstallState::load(&self.state_path)
    }

    /// Run `steps` in order against `ctx`.
    ///
    /// With `resume`, steps the persisted state shows as completed are skipped
    /// and the sequence continues at the first step that is not. Without it,
    /// the persisted state is overwritten and every step runs.
    pub fn run<C>(
        &self,
        steps: &[StepDefinition<C>],
        ctx: &C,
        params: InstallParams,
        resume: bool,
    ) -> Result<SequenceReport> {
        validate_steps(steps)?;

        let mut state = match (resume, self.state()?) {
            (true, Some(previous)) => {
                if previous.params.version != params.version {
                    return Err(KeelError::validation(format!(
                        "cannot resume an install of {} as {}; start over without --resume",
                        previous.params.version, params.version
                    )));
                }
                info!(
                    "Resuming {} at step '{}' ({})",
                    self.operation,
                    previous.current_step.as_deref().unwrap_or("-"),
                    previous.status
                );
                previous
            }
            (true, None) => {
                info!("No persisted {} state, starting from the first step", self.operation);
                InstallState::new(params)
            }
            (false, _) => InstallState::new(params),
        };
        state.finished = false;
        state.save(&self.state_path)?;

        let ops = OpsLog::start(&self.logs_dir, &self.operation);
        let mut report = SequenceReport::default();

        for (index, step) in steps.iter().enumerate() {
            if resume && state.can_skip(index, step.name) {
                info!("[{}/{}] {} already completed, skipping", index + 1, steps.len(), step.name);
                ops.record("skip", step.name);
                report.skipped.push(step.name.to_string());
                continue;
            }

            info!("[{}/{}] {}", index + 1, steps.len(), step.name);
            state.transition(index, step.name, StepStatus::InProgress);
            state.save(&self.state_path)?;
            ops.record("step_started", step.name);

            if let Err(e) = (step.body)(ctx) {
                error!("Step '{}' failed: {}", step.name, e);
                let diagnostics = ops.write_diagnostics(&format!(
                    "step: {}\nerror: {}\nremediation: {}\nops log: {}\n",
                    step.name,
                    e,
                    e.remediation()
                        .unwrap_or("Fix the cause and re-run with --resume"),
                    ops.path().display()
                ));

                state.transition(index, step.name, StepStatus::Failed);
                state.diagnostic_log = diagnostics.or_else(|| Some(ops.path().to_path_buf()));
                state.save(&self.state_path)?;
                ops.record("step_failed", &format!("{}: {}", step.name, e));
                return Err(e);
            }

            state.transition(index, step.name, StepStatus::Completed);
            state.save(&self.state_path)?;
            ops.record("step_completed", step.name);
            report.executed.push(step.name.to_string());
        }

        state.finished = true;
        state.diagnostic_log = None;
        state.save(&self.state_path)?;
        ops.record("done", &format!("{} executed, {} skipped", report.executed.len(), report.skipped.len()));
        Ok(report)
    }
}

fn validate_steps<C>(steps: &[StepDefinition<C>]) -> Result<()> {
    let mut names = HashSet::new();
    for step in steps {
        if !names.insert(step.name) {
            return Err(KeelError::validation(format!("step '{}' defined twice", step.name)));
        }
    }
    Ok(())
}
