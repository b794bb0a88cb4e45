//! Command-line surface

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_common::config::BackupKind;
use keel_common::KeelPaths;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "keelctl")]
#[command(about = "Keel - lifecycle orchestrator for a single-host container stack", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Re-root every Keel path under this directory
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Operator configuration file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Machine-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn paths(&self) -> KeelPaths {
        match &self.root {
            Some(root) => KeelPaths::with_root(root),
            None => KeelPaths::new(),
        }
    }

    pub fn config_path(&self, paths: &KeelPaths) -> PathBuf {
        self.config.clone().unwrap_or_else(|| paths.config_file.clone())
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// First-time installation
    Install {
        /// Version to install (taken from the unfinished install with --resume)
        version: Option<String>,

        /// Continue from the step that failed last time
        #[arg(long)]
        resume: bool,
    },

    /// Move the stack to another version
    Update {
        version: String,

        /// Do not take a pre-update backup
        #[arg(long)]
        skip_backup: bool,

        /// Leave the new version in place on failure
        #[arg(long)]
        no_rollback: bool,

        /// Print the plan without changing anything
        #[arg(long)]
        dry_run: bool,

        /// Cap every service's health timeout (seconds)
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        /// Directory with the new deployment files
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,
    },

    /// Restore a checkpoint
    Rollback {
        /// Checkpoint name (default: newest)
        #[arg(long, value_name = "NAME", conflicts_with = "list")]
        checkpoint: Option<String>,

        /// List checkpoints
        #[arg(long)]
        list: bool,

        /// Re-hash a checkpoint without restoring it
        #[arg(long, conflicts_with_all = ["list", "auto"])]
        verify: bool,

        /// Roll back only if critical services are still unhealthy after the settle delay
        #[arg(long, conflicts_with = "list")]
        auto: bool,
    },

    /// Create, list or verify backup archives
    Backup {
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Verify an archive instead of creating one
        #[arg(long, value_name = "ARCHIVE", conflicts_with_all = ["kind", "list"])]
        verify: Option<PathBuf>,

        /// With --verify, also restore every dump into an ephemeral instance
        #[arg(long, requires = "verify")]
        test_restore: bool,

        /// List archives
        #[arg(long, conflicts_with = "kind")]
        list: bool,
    },

    /// Restore from a backup archive
    Restore {
        archive: PathBuf,

        /// Restore only what this kind covers
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        /// Delete the archive after a healthy restore
        #[arg(long)]
        discard: bool,

        /// Test-restore every dump before touching the stack
        #[arg(long)]
        test_restore: bool,
    },

    /// Probe every service and the TLS certificate
    HealthCheck,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindArg {
    Metadata,
    Data,
    Full,
}

impl From<KindArg> for BackupKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Metadata => BackupKind::Metadata,
            KindArg::Data => BackupKind::Data,
            KindArg::Full => BackupKind::Full,
        }
    }
}
