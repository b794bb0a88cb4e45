//! Keel operator configuration
//!
//! Lives in /etc/keel/config.toml. Every field has a default, so a missing
//! file or a partial file is valid.

use crate::error::{KeelError, Result};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Backup archive kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Configuration and deployment files only
    Metadata,
    /// Datastore dumps only
    #[default]
    Data,
    /// Configuration, dumps and large assets
    Full,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Metadata => "metadata",
            BackupKind::Data => "data",
            BackupKind::Full => "full",
        }
    }

    pub fn includes_config(&self) -> bool {
        matches!(self, BackupKind::Metadata | BackupKind::Full)
    }

    pub fn includes_dumps(&self) -> bool {
        matches!(self, BackupKind::Data | BackupKind::Full)
    }

    pub fn includes_assets(&self) -> bool {
        matches!(self, BackupKind::Full)
    }
}

impl std::str::FromStr for BackupKind {
    type Err = KeelError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "metadata" => Ok(BackupKind::Metadata),
            "data" => Ok(BackupKind::Data),
            "full" => Ok(BackupKind::Full),
            other => Err(KeelError::validation(format!(
                "unknown backup kind '{}' (expected metadata, data or full)",
                other
            ))),
        }
    }
}

/// What a failed ephemeral test restore means for verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TestRestorePolicy {
    /// Report the failure, verification still passes
    #[default]
    Advisory,
    /// Treat the failure as an integrity failure
    Enforce,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Health probe polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Image fetch retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    10
}

fn default_max_delay() -> u64 {
    60
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            multiplier: default_multiplier(),
        }
    }
}

impl FetchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            multiplier: self.multiplier.max(1.0),
        }
    }
}

/// Update behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Roll back automatically when an update fails past the point of no return
    #[serde(default = "default_true")]
    pub auto_rollback: bool,

    /// Grace time before the auto-rollback health re-check
    #[serde(default = "default_settle_delay")]
    pub settle_delay_secs: u64,

    /// Archive kind produced before an update
    #[serde(default)]
    pub pre_update_backup: BackupKind,

    /// Checkpoints to keep
    #[serde(default = "default_checkpoint_retention")]
    pub checkpoint_retention: usize,

    /// Log lines captured per service on failure
    #[serde(default = "default_diagnostic_lines")]
    pub diagnostic_log_lines: usize,
}

fn default_true() -> bool {
    true
}

fn default_settle_delay() -> u64 {
    15
}

fn default_checkpoint_retention() -> usize {
    5
}

fn default_diagnostic_lines() -> usize {
    200
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_rollback: default_true(),
            settle_delay_secs: default_settle_delay(),
            pre_update_backup: BackupKind::default(),
            checkpoint_retention: default_checkpoint_retention(),
            diagnostic_log_lines: default_diagnostic_lines(),
        }
    }
}

impl UpdateConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_delay_secs)
    }

    /// Never prune below one, rollback needs the newest checkpoint
    pub fn effective_checkpoint_retention(&self) -> usize {
        self.checkpoint_retention.max(1)
    }
}

/// Backup retention and verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_retention_small")]
    pub retention_metadata: usize,
    #[serde(default = "default_retention_small")]
    pub retention_data: usize,
    #[serde(default = "default_retention_large")]
    pub retention_full: usize,
    #[serde(default = "default_retention_large")]
    pub retention_pre_update: usize,
    #[serde(default)]
    pub test_restore_policy: TestRestorePolicy,
    /// Directories (relative to the deployment dir) archived by full backups
    #[serde(default)]
    pub asset_dirs: Vec<PathBuf>,
}

fn default_retention_small() -> usize {
    7
}

fn default_retention_large() -> usize {
    3
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention_metadata: default_retention_small(),
            retention_data: default_retention_small(),
            retention_full: default_retention_large(),
            retention_pre_update: default_retention_large(),
            test_restore_policy: TestRestorePolicy::default(),
            asset_dirs: Vec::new(),
        }
    }
}

/// Complete operator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeelConfig {
    #[serde(default)]
    pub logging: LogConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub backup: BackupConfig,
}

impl KeelConfig {
    /// Load from a path, defaults when the file is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: KeelConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for dir in &self.backup.asset_dirs {
            if dir.is_absolute() || dir.components().any(|c| c.as_os_str() == "..") {
                return Err(KeelError::validation(format!(
                    "asset dir '{}' must be relative to the deployment directory",
                    dir.display()
                )));
            }
        }
        Ok(())
    }
}
