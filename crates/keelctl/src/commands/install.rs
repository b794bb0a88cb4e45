//! keelctl install

use super::Session;
use crate::errors::EXIT_SUCCESS;
use crate::output;
use anyhow::Result;
use keel_common::install::{resumable_version, run_install, InstallContext};
use keel_common::secrets::RandomSecrets;
use keel_common::KeelError;
use std::sync::Arc;

pub fn run(session: &Session, version: Option<&str>, resume: bool) -> Result<i32> {
    let version = match (version, resume) {
        (Some(v), _) => v.to_string(),
        (None, true) => resumable_version(&session.stack)?.ok_or_else(|| {
            KeelError::validation("no unfinished install to resume; pass a version")
        })?,
        (None, false) => return Err(KeelError::validation("a version is required").into()),
    };

    let ctx = InstallContext::new(
        session.stack.clone(),
        session.certs.clone(),
        Arc::new(RandomSecrets::default()),
        &version,
    );
    let report = run_install(&ctx, resume)?;

    if session.json {
        output::print_json(&serde_json::json!({
            "version": version,
            "executed": report.executed,
            "skipped": report.skipped,
        }))?;
    } else {
        for step in &report.skipped {
            output::display_info(&format!("{} (already done)", step));
        }
        for step in &report.executed {
            output::display_success(step);
        }
        output::display_success(&format!("Version {} installed", version));
    }
    Ok(EXIT_SUCCESS)
}
