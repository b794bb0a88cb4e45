//! keelctl rollback

use super::Session;
use crate::errors::EXIT_SUCCESS;
use crate::output;
use anyhow::Result;
use keel_common::checkpoint::CheckpointManifest;
use keel_common::rollback::{AutoRollbackOutcome, RollbackController, RollbackReport};

pub fn run(session: &Session, checkpoint: Option<&str>, list: bool, verify: bool, auto: bool) -> Result<i32> {
    let controller = RollbackController::new(&session.stack);

    if list {
        let manifests = controller.list()?;
        if session.json {
            output::print_json(&manifests)?;
        } else {
            display_list(&manifests);
        }
        return Ok(EXIT_SUCCESS);
    }

    if verify {
        let manifest = controller.verify(checkpoint)?;
        if session.json {
            output::print_json(&manifest)?;
        } else {
            output::display_success(&format!(
                "Checkpoint {} intact ({} file(s))",
                manifest.name,
                manifest.files.len()
            ));
        }
        return Ok(EXIT_SUCCESS);
    }

    if auto {
        let outcome = controller.auto_rollback(checkpoint, None)?;
        if session.json {
            output::print_json(&outcome)?;
        }
        return Ok(match outcome {
            AutoRollbackOutcome::NotNeeded { health } => {
                if !session.json {
                    output::display_health(&health);
                    output::display_success("Critical services healthy, no rollback needed");
                }
                EXIT_SUCCESS
            }
            AutoRollbackOutcome::RolledBack { report } => {
                if !session.json {
                    display_report(&report);
                }
                report.exit_code()
            }
        });
    }

    let report = controller.rollback(checkpoint, None)?;
    if session.json {
        output::print_json(&report)?;
    } else {
        display_report(&report);
    }
    Ok(report.exit_code())
}

fn display_list(manifests: &[CheckpointManifest]) {
    if manifests.is_empty() {
        output::display_info("No checkpoints");
        return;
    }
    output::header("Checkpoints (newest first)");
    for manifest in manifests {
        println!(
            "  {:<36} {:<8} {}  {} -> {}",
            manifest.name,
            manifest.kind,
            manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
            manifest.source_version.as_deref().unwrap_or("-"),
            manifest.target_version.as_deref().unwrap_or("-")
        );
    }
}

fn display_report(report: &RollbackReport) {
    output::header(&format!("Rollback to checkpoint {}", report.checkpoint));
    println!("  {} file(s) restored", report.files_restored);
    if report.side_archive_reverted {
        println!("  replaced deployment files reverted");
    }
    for warning in &report.warnings {
        output::display_warning(warning);
    }
    output::display_launch(&report.launch);
    if let Some(diagnostics) = &report.diagnostics {
        output::display_info(&format!("diagnostics: {}", diagnostics.display()));
    }
    if report.ok {
        output::display_success(&format!(
            "Running {}",
            report.restored_version.as_deref().unwrap_or("the restored configuration")
        ));
    } else {
        output::display_error("Services did not come up healthy after the rollback");
    }
    println!("  log: {}", report.ops_log.display());
}
