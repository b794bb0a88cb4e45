//! Keel Common - lifecycle orchestration core
//!
//! Install, update, rollback, backup and restore of a tiered container stack
//! on a single host. The `keelctl` binary is a thin shell around this crate.

pub mod backup;
pub mod catalog;
pub mod certs;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod datastore;
pub mod emergency;
pub mod env_merge;
pub mod error;
pub mod health;
pub mod install;
pub mod install_state;
pub mod integrity;
pub mod launcher;
pub mod lock;
pub mod ops_log;
pub mod paths;
pub mod restore;
pub mod retry;
pub mod rollback;
pub mod runtime;
pub mod secrets;
pub mod sequencer;
pub mod side_archive;
pub mod state;
pub mod update;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::KeelConfig;
pub use context::StackContext;
pub use error::{KeelError, Result};
pub use paths::KeelPaths;
