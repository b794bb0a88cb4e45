//! Error types for Keel lifecycle operations.
//!
//! The variants follow the operator-facing taxonomy:
//! - Validation: malformed input or reference, never retried
//! - TransientInfrastructure: artifact fetch exhausted its retries
//! - StateConflict: lock held, checkpoint missing; carries remediation text
//! - HealthGateTimeout: a service never reached healthy
//! - Integrity: corrupt archive or checkpoint, raised before anything destructive

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, KeelError>;

/// Which escalating integrity check rejected an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityCheck {
    /// The compressed stream does not decompress cleanly
    Decompression,
    /// The container listing cannot be read
    Listing,
    /// Manifest missing or a declared component has no dump
    Completeness,
    /// Restore into an ephemeral instance failed (enforce policy only)
    TestRestore,
    /// A captured file no longer matches its recorded checksum
    Checksum,
}

impl fmt::Display for IntegrityCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrityCheck::Decompression => "decompression",
            IntegrityCheck::Listing => "listing",
            IntegrityCheck::Completeness => "completeness",
            IntegrityCheck::TestRestore => "test-restore",
            IntegrityCheck::Checksum => "checksum",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("{operation} failed after {attempts} attempt(s): {last_error}")]
    TransientInfrastructure {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{message}")]
    StateConflict {
        message: String,
        remediation: String,
    },

    #[error("Service {service} did not become healthy within {}s", .waited.as_secs())]
    HealthGateTimeout { service: String, waited: Duration },

    #[error("Integrity check '{check}' failed for {archive}: {detail}")]
    Integrity {
        archive: String,
        check: IntegrityCheck,
        detail: String,
    },

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}

impl KeelError {
    pub fn validation(msg: impl Into<String>) -> Self {
        KeelError::Validation(msg.into())
    }

    pub fn conflict(message: impl Into<String>, remediation: impl Into<String>) -> Self {
        KeelError::StateConflict {
            message: message.into(),
            remediation: remediation.into(),
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        KeelError::Runtime(msg.into())
    }

    pub fn integrity(archive: impl Into<String>, check: IntegrityCheck, detail: impl Into<String>) -> Self {
        KeelError::Integrity {
            archive: archive.into(),
            check,
            detail: detail.into(),
        }
    }

    /// Process exit code: 1 recoverable, 2 critical, 3 invalid invocation
    pub fn exit_code(&self) -> i32 {
        match self {
            KeelError::Validation(_) => 3,
            KeelError::StateConflict { .. } | KeelError::TransientInfrastructure { .. } => 1,
            KeelError::HealthGateTimeout { .. }
            | KeelError::Integrity { .. }
            | KeelError::Runtime(_)
            | KeelError::Io(_)
            | KeelError::Json(_)
            | KeelError::Config(_) => 2,
        }
    }

    /// Operator instructions attached to the error, if any
    pub fn remediation(&self) -> Option<&str> {
        match self {
            KeelError::StateConflict { remediation, .. } => Some(remediation.as_str()),
            KeelError::Integrity { .. } => {
                Some("Pick another archive with `keelctl backup --verify <archive>` before restoring")
            }
            _ => None,
        }
    }

    /// Whether a retry combinator may try again
    pub fn is_transient(&self) -> bool {
        matches!(self, KeelError::TransientInfrastructure { .. } | KeelError::Runtime(_))
    }
}
