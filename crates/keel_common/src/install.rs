//! First-time installation
//!
//! Nine fixed steps driven by the resumable `StepSequencer`:
//! preflight, directories, certificates, environment, secrets, image_fetch,
//! launch, migrations, verify. Every body is safe to run again on resume.

use crate::catalog::ServiceCatalog;
use crate::certs::{check_certificate, CertificateProvider};
use crate::context::StackContext;
use crate::env_merge::merge_files;
use crate::error::Result;
use crate::health::{probe_all, run_migrations};
use crate::install_state::{InstallParams, InstallState};
use crate::lock::MUTATION_LOCK;
use crate::ops_log::OpsLog;
use crate::retry::retry;
use crate::secrets::{fill_placeholders, SecretGenerator};
use crate::sequencer::{SequenceReport, StepDefinition, StepSequencer};
use crate::state::{validate_version, VersionPointer};
use std::fs;
use std::sync::Arc;
use tracing::{info, warn};

pub const INSTALL_STEPS: &[&str] = &[
    "preflight",
    "directories",
    "certificates",
    "environment",
    "secrets",
    "image_fetch",
    "launch",
    "migrations",
    "verify",
];

/// Everything the step bodies need
pub struct InstallContext {
    pub stack: StackContext,
    pub certs: Arc<dyn CertificateProvider>,
    pub secrets: Arc<dyn SecretGenerator>,
    pub version: String,
    ops: OpsLog,
}

impl InstallContext {
    pub fn new(
        stack: StackContext,
        certs: Arc<dyn CertificateProvider>,
        secrets: Arc<dyn SecretGenerator>,
        version: &str,
    ) -> Self {
        let ops = OpsLog::start(&stack.paths.logs_dir(), "install-steps");
        Self {
            stack,
            certs,
            secrets,
            version: version.to_string(),
            ops,
        }
    }

    fn catalog(&self) -> Result<ServiceCatalog> {
        self.stack.catalog()
    }
}

/// The fixed install sequence
pub fn install_steps() -> Vec<StepDefinition<InstallContext>> {
    vec![
        StepDefinition::new("preflight", preflight),
        StepDefinition::new("directories", directories),
        StepDefinition::new("certificates", certificates),
        StepDefinition::new("environment", environment),
        StepDefinition::new("secrets", secrets),
        StepDefinition::new("image_fetch", image_fetch),
        StepDefinition::new("launch", launch),
        StepDefinition::new("migrations", migrations),
        StepDefinition::new("verify", verify),
    ]
}

/// Run (or resume) the install under the mutation lock
pub fn run_install(ctx: &InstallContext, resume: bool) -> Result<SequenceReport> {
    let _lock = ctx.stack.locks().acquire(MUTATION_LOCK, "install")?;
    let sequencer = StepSequencer::new(
        &ctx.stack.paths.install_state_file(),
        &ctx.stack.paths.logs_dir(),
        "install",
    );
    let report = sequencer.run(&install_steps(), ctx, InstallParams::new(&ctx.version), resume)?;
    info!(
        "Install of {} complete ({} step(s) run, {} skipped)",
        ctx.version,
        report.executed.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// Version recorded by an earlier, unfinished install
pub fn resumable_version(ctx: &StackContext) -> Result<Option<String>> {
    Ok(InstallState::load(&ctx.paths.install_state_file())?
        .filter(|state| !state.is_complete())
        .map(|state| state.params.version))
}

// ============================================================================
// Step bodies
// ============================================================================

fn preflight(ctx: &InstallContext) -> Result<()> {
    validate_version(&ctx.version)?;
    ctx.stack.runtime.available()?;
    let catalog = ctx.catalog()?;
    info!(
        "Preflight ok: {} service(s) in {} tier(s)",
        catalog.services.len(),
        catalog.tiers().len()
    );
    Ok(())
}

fn directories(ctx: &InstallContext) -> Result<()> {
    for dir in ctx.stack.paths.managed_dirs() {
        fs::create_dir_all(&dir)?;
    }
    Ok(())
}

fn certificates(ctx: &InstallContext) -> Result<()> {
    let paths = &ctx.stack.paths;
    let (cert, key) = (paths.tls_cert(), paths.tls_key());
    ctx.certs.provide(&cert, &key)?;
    let check = check_certificate(ctx.certs.as_ref(), &cert, &key)?;
    match check.failure(&cert) {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn environment(ctx: &InstallContext) -> Result<()> {
    let paths = &ctx.stack.paths;
    if !paths.env_template.exists() {
        warn!("No environment template at {}", paths.env_template.display());
        return Ok(());
    }
    let added = merge_files(&paths.env_template, &paths.env_file)?;
    ctx.ops.record("env_merge", &format!("added={}", added));
    Ok(())
}

fn secrets(ctx: &InstallContext) -> Result<()> {
    let filled = fill_placeholders(&ctx.stack.paths.env_file, ctx.secrets.as_ref())?;
    ctx.ops.record("secrets", &format!("generated={}", filled));
    Ok(())
}

fn image_fetch(ctx: &InstallContext) -> Result<()> {
    // Step 1: the runtime resolves image tags through the version pointer
    VersionPointer::write(&ctx.stack.paths.version_file(), &ctx.version)?;

    // Step 2: pull with backoff
    let services = ctx.catalog()?.service_names();
    let policy = ctx.stack.config.fetch.retry_policy();
    retry(&policy, "image fetch", |attempt| {
        ctx.ops.record("pull", &format!("attempt={}", attempt));
        ctx.stack.runtime.pull(&services)
    })
}

fn launch(ctx: &InstallContext) -> Result<()> {
    let catalog = ctx.catalog()?;
    let report = ctx.stack.launcher().launch_all(&catalog.services);
    for warning in report.warnings() {
        ctx.ops.record("launch_warning", &warning.name);
    }
    match report.failure() {
        None => Ok(()),
        Some(e) => {
            ctx.ops.capture_diagnostics(
                ctx.stack.runtime.as_ref(),
                &catalog.service_names(),
                ctx.stack.config.update.diagnostic_log_lines,
                &e.to_string(),
            );
            Err(e)
        }
    }
}

fn migrations(ctx: &InstallContext) -> Result<()> {
    let catalog = ctx.catalog()?;
    run_migrations(ctx.stack.runtime.as_ref(), &catalog.migrations, &ctx.ops)
}

fn verify(ctx: &InstallContext) -> Result<()> {
    let report = probe_all(ctx.stack.runtime.as_ref(), &ctx.catalog()?);
    for problem in report.non_critical_problems() {
        warn!("{} is {} (non-critical)", problem.name, problem.status.as_str());
    }
    match report.failure() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
