//! keelctl restore

use super::Session;
use crate::output;
use anyhow::Result;
use keel_common::config::BackupKind;
use keel_common::restore::{RestoreManager, RestoreOptions};
use std::path::Path;

pub fn run(
    session: &Session,
    archive: &Path,
    kind: Option<BackupKind>,
    discard: bool,
    test_restore: bool,
) -> Result<i32> {
    let options = RestoreOptions {
        kind,
        discard,
        test_restore,
    };
    let report = RestoreManager::new(&session.stack).restore(archive, &options)?;

    if session.json {
        output::print_json(&report)?;
        return Ok(report.exit_code());
    }

    output::header(&format!("Restore ({}) from {}", report.kind.as_str(), archive.display()));
    if report.config_files > 0 {
        println!("  {} configuration file(s) restored", report.config_files);
    }
    if !report.components.is_empty() {
        println!("  datastores restored: {}", report.components.join(", "));
    }
    if report.assets > 0 {
        println!("  {} asset file(s) restored", report.assets);
    }
    for warning in &report.warnings {
        output::display_warning(warning);
    }
    output::display_launch(&report.launch);
    if report.ok {
        output::display_success(&match &report.restored_version {
            Some(version) => format!("Restore complete, running {}", version),
            None => "Restore complete".to_string(),
        });
        if report.discarded {
            output::display_info("archive discarded");
        }
    } else {
        output::display_error("Services did not come up healthy after the restore");
    }
    println!("  log: {}", report.ops_log.display());
    Ok(report.exit_code())
}
