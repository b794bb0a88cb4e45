//! keelctl backup

use super::Session;
use crate::errors::EXIT_SUCCESS;
use crate::output;
use anyhow::Result;
use keel_common::backup::{BackupManager, RetentionClass};
use keel_common::config::BackupKind;
use keel_common::integrity::{IntegrityVerifier, TestRestoreOutcome};
use std::path::Path;

pub fn run(
    session: &Session,
    kind: Option<BackupKind>,
    verify: Option<&Path>,
    test_restore: bool,
    list: bool,
) -> Result<i32> {
    let stack = &session.stack;
    let manager = BackupManager::new(stack);

    if list {
        let archives = manager.list()?;
        if session.json {
            output::print_json(&archives)?;
        } else if archives.is_empty() {
            output::display_info("No backup archives");
        } else {
            output::header("Backup archives (newest first)");
            for archive in &archives {
                println!("  {:<9} {}", archive.kind.as_str(), archive.name);
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    if let Some(archive) = verify {
        let verifier = IntegrityVerifier::new(stack.config.backup.test_restore_policy);
        let report = if test_restore {
            verifier.verify_with_test_restore(archive, stack.runtime.as_ref(), &stack.catalog()?)?
        } else {
            verifier.verify(archive)?
        };
        if session.json {
            output::print_json(&report)?;
            return Ok(EXIT_SUCCESS);
        }
        output::display_success(&format!(
            "{} passed integrity checks ({} entries, {} component dump(s))",
            archive.display(),
            report.entries,
            report.manifest.components.len()
        ));
        for result in &report.test_restore {
            match &result.outcome {
                TestRestoreOutcome::Restored { records } => {
                    output::display_success(&format!("{}: test restore ok, {} record(s)", result.component, records))
                }
                TestRestoreOutcome::Failed { reason } => {
                    output::display_warning(&format!("{}: test restore failed: {}", result.component, reason))
                }
                TestRestoreOutcome::Skipped => {
                    output::display_info(&format!("{}: no ephemeral instance configured", result.component))
                }
            }
        }
        return Ok(EXIT_SUCCESS);
    }

    let kind = kind.unwrap_or_default();
    let record = manager.create(kind, RetentionClass::Regular, None)?;
    if session.json {
        output::print_json(&serde_json::json!({
            "path": record.path,
            "manifest": record.manifest,
            "pruned": record.pruned,
        }))?;
    } else {
        output::display_success(&format!("{} backup written to {}", kind.as_str(), record.path.display()));
        for pruned in &record.pruned {
            output::display_info(&format!("pruned {}", pruned.display()));
        }
    }
    Ok(EXIT_SUCCESS)
}
