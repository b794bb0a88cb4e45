//! Install State for Keel
//!
//! Single persisted record of the installation state machine:
//! - Current step (name + ordinal) and its status
//! - Target parameters (version, options)
//! - Per-step history
//! - Pointer to diagnostic output of the last failure
//!
//! Written by the step sequencer before and after every step. Never deleted,
//! a fresh install overwrites it.

use crate::error::Result;
use crate::state::{load_json, save_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Current schema version
pub const INSTALL_STATE_SCHEMA: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepStatus::Pending => "pending",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What the install was asked to do
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallParams {
    pub version: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl InstallParams {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            options: BTreeMap::new(),
        }
    }
}

/// One status transition of one step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: String,
    pub index: usize,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallState {
    pub schema_version: u32,
    /// Name of the step the machine is at
    pub current_step: Option<String>,
    /// Ordinal of `current_step`
    pub step_index: usize,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    pub params: InstallParams,
    #[serde(default)]
    pub history: Vec<StepRecord>,
    /// Diagnostic output of the last failure
    #[serde(default)]
    pub diagnostic_log: Option<PathBuf>,
    /// Set once every step has completed
    #[serde(default)]
    pub finished: bool,
}

impl InstallState {
    pub fn new(params: InstallParams) -> Self {
        Self {
            schema_version: INSTALL_STATE_SCHEMA,
            current_step: None,
            step_index: 0,
            status: StepStatus::Pending,
            timestamp: Utc::now(),
            params,
            history: Vec::new(),
            diagnostic_log: None,
            finished: false,
        }
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, self)
    }

    /// Move to `step` with `status` and record the transition
    pub fn transition(&mut self, index: usize, step: &str, status: StepStatus) {
        let now = Utc::now();
        self.current_step = Some(step.to_string());
        self.step_index = index;
        self.status = status;
        self.timestamp = now;
        self.history.push(StepRecord {
            step: step.to_string(),
            index,
            status,
            timestamp: now,
        });
    }

    /// Whether a resumed run may skip the step at `index` named `step`.
    ///
    /// Steps before the persisted index completed before the machine moved on.
    /// The persisted step itself is skipped only if it completed.
    pub fn can_skip(&self, index: usize, step: &str) -> bool {
        if self.current_step.is_none() {
            return false;
        }
        if index < self.step_index {
            return self.last_status_of(step) == Some(StepStatus::Completed);
        }
        index == self.step_index
            && self.current_step.as_deref() == Some(step)
            && self.status == StepStatus::Completed
    }

    fn last_status_of(&self, step: &str) -> Option<StepStatus> {
        self.history
            .iter()
            .rev()
            .find(|record| record.step == step)
            .map(|record| record.status)
    }

    pub fn is_complete(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state_at(index: usize, step: &str, status: StepStatus) -> InstallState {
        let mut state = InstallState::new(InstallParams::new("1.0.0"));
        for (i, name) in ["preflight", "directories", "certificates"].iter().enumerate().take(index) {
            state.transition(i, name, StepStatus::InProgress);
            state.transition(i, name, StepStatus::Completed);
        }
        state.transition(index, step, status);
        state
    }

    #[test]
    fn test_fresh_state_skips_nothing() {
        let state = InstallState::new(InstallParams::new("1.0.0"));
        assert!(!state.can_skip(0, "preflight"));
    }

    #[test]
    fn test_failed_step_is_rerun_earlier_are_skipped() {
        let state = state_at(2, "certificates", StepStatus::Failed);
        assert!(state.can_skip(0, "preflight"));
        assert!(state.can_skip(1, "directories"));
        assert!(!state.can_skip(2, "certificates"));
        assert!(!state.can_skip(3, "environment"));
    }

    #[test]
    fn test_interrupted_step_is_rerun() {
        let state = state_at(2, "certificates", StepStatus::InProgress);
        assert!(!state.can_skip(2, "certificates"));
        assert!(state.can_skip(1, "directories"));
    }

    #[test]
    fn test_completed_step_is_skipped() {
        let state = state_at(2, "certificates", StepStatus::Completed);
        assert!(state.can_skip(2, "certificates"));
    }

    #[test]
    fn test_renamed_step_is_not_skipped() {
        let state = state_at(2, "certificates", StepStatus::Completed);
        assert!(!state.can_skip(2, "tls"));
        assert!(!state.can_skip(1, "dirs"));
    }

    #[test]
    fn test_save_and_load() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("install_state.json");
        assert!(InstallState::load(&path).unwrap().is_none());

        let state = state_at(1, "directories", StepStatus::Failed);
        state.save(&path).unwrap();

        let loaded = InstallState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.status, StepStatus::Failed);
        assert_eq!(loaded.current_step.as_deref(), Some("directories"));
        assert_eq!(loaded.history.len(), state.history.len());
        assert_eq!(loaded.params.version, "1.0.0");
    }
}
