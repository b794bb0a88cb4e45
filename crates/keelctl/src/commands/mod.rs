//! Command handlers
//!
//! Every handler is synchronous and returns the process exit code. Errors
//! escaping a handler are mapped by `errors::exit_code_for`.

pub mod backup;
pub mod health;
pub mod install;
pub mod restore;
pub mod rollback;
pub mod update;

use crate::cli::Commands;
use anyhow::Result;
use keel_common::certs::{CertificateProvider, OpensslCertificates};
use keel_common::runtime::ComposeRuntime;
use keel_common::{KeelConfig, KeelPaths, StackContext};
use std::sync::Arc;

/// What a handler works with
pub struct Session {
    pub stack: StackContext,
    pub certs: Arc<dyn CertificateProvider>,
    pub json: bool,
}

impl Session {
    /// Production wiring: docker compose runtime and openssl checks
    pub fn system(paths: KeelPaths, config: KeelConfig, json: bool) -> Self {
        let runtime = Arc::new(ComposeRuntime::new(&paths));
        Self {
            stack: StackContext::new(paths, config, runtime),
            certs: Arc::new(OpensslCertificates),
            json,
        }
    }
}

pub fn dispatch(command: &Commands, session: &Session) -> Result<i32> {
    match command {
        Commands::Install { version, resume } => install::run(session, version.as_deref(), *resume),
        Commands::Update {
            version,
            skip_backup,
            no_rollback,
            dry_run,
            timeout,
            source,
        } => update::run(
            session,
            update::UpdateArgs {
                version,
                skip_backup: *skip_backup,
                no_rollback: *no_rollback,
                dry_run: *dry_run,
                timeout: *timeout,
                source: source.as_deref(),
            },
        ),
        Commands::Rollback {
            checkpoint,
            list,
            verify,
            auto,
        } => rollback::run(session, checkpoint.as_deref(), *list, *verify, *auto),
        Commands::Backup {
            kind,
            verify,
            test_restore,
            list,
        } => backup::run(session, kind.map(Into::into), verify.as_deref(), *test_restore, *list),
        Commands::Restore {
            archive,
            kind,
            discard,
            test_restore,
        } => restore::run(session, archive, kind.map(Into::into), *discard, *test_restore),
        Commands::HealthCheck => health::run(session),
    }
}
