//! keelctl update

use super::Session;
use crate::errors::EXIT_SUCCESS;
use crate::output;
use anyhow::Result;
use keel_common::update::{UpdateController, UpdateOptions, UpdatePlan, UpdateReport, UpdateStatus};
use std::path::Path;
use std::time::Duration;

pub struct UpdateArgs<'a> {
    pub version: &'a str,
    pub skip_backup: bool,
    pub no_rollback: bool,
    pub dry_run: bool,
    pub timeout: Option<u64>,
    pub source: Option<&'a Path>,
}

impl UpdateArgs<'_> {
    fn options(&self) -> UpdateOptions {
        let mut options = UpdateOptions::new(self.version);
        options.skip_backup = self.skip_backup;
        if self.no_rollback {
            options.auto_rollback = Some(false);
        }
        options.timeout = self.timeout.map(Duration::from_secs);
        options.source = self.source.map(Path::to_path_buf);
        options
    }
}

pub fn run(session: &Session, args: UpdateArgs<'_>) -> Result<i32> {
    let options = args.options();
    let controller = UpdateController::new(&session.stack);

    if args.dry_run {
        let plan = controller.plan(&options)?;
        if session.json {
            output::print_json(&plan)?;
        } else {
            display_plan(&plan);
        }
        return Ok(EXIT_SUCCESS);
    }

    let report = controller.update(&options)?;
    if session.json {
        output::print_json(&report)?;
    } else {
        display_report(&report);
    }
    Ok(report.exit_code())
}

fn display_plan(plan: &UpdatePlan) {
    output::header(&format!("Update plan {} -> {}", plan.from_version, plan.to_version));
    if let Some(holder) = &plan.blocked_by {
        output::display_warning(&format!("lifecycle lock currently held by {}", holder));
    }
    match plan.backup {
        Some(kind) => println!("  backup:        pre-update {}", kind.as_str()),
        None => println!("  backup:        skipped"),
    }
    if let Some(source) = &plan.source {
        println!("  source:        {}", source.display());
    }
    if !plan.env_keys_to_add.is_empty() {
        println!("  new env keys:  {}", plan.env_keys_to_add.join(", "));
    }
    println!("  stop order:    {}", plan.stop_order.join(", "));
    for (tier, services) in &plan.launch_tiers {
        println!("  launch tier {}: {}", tier, services.join(", "));
    }
    if !plan.migrations.is_empty() {
        println!("  migrations:    {}", plan.migrations.join(", "));
    }
    if let Some(cap) = plan.health_timeout_cap_secs {
        println!("  health cap:    {}s", cap);
    }
    println!("  auto rollback: {}", if plan.auto_rollback { "yes" } else { "no" });
}

fn display_report(report: &UpdateReport) {
    output::header(&format!("Update {} -> {}", report.from_version, report.to_version));
    println!("  checkpoint: {}", report.checkpoint);
    if let Some(backup) = &report.backup {
        println!("  backup:     {}", backup.display());
    }
    println!(
        "  files:      {} replaced, {} added; {} env key(s) added",
        report.files_replaced, report.files_added, report.env_keys_added
    );
    for warning in &report.stop_warnings {
        output::display_warning(warning);
    }
    if let Some(launch) = &report.launch {
        output::display_launch(launch);
    }
    if let Some(rollback) = &report.rollback {
        output::display_info(&format!("rolled back to checkpoint {}", rollback.checkpoint));
        output::display_launch(&rollback.launch);
    }
    if let Some(diagnostics) = &report.diagnostics {
        output::display_info(&format!("diagnostics: {}", diagnostics.display()));
    }

    match report.status {
        UpdateStatus::Succeeded => output::display_success(&format!("Now running {}", report.to_version)),
        UpdateStatus::RolledBack => output::display_warning(&format!(
            "Update failed ({}); previous version {} restored",
            report.failure.as_deref().unwrap_or("unknown"),
            report.from_version
        )),
        UpdateStatus::RollbackFailed | UpdateStatus::Failed => {
            output::display_error(&format!(
                "Update failed: {}",
                report.failure.as_deref().unwrap_or("unknown")
            ));
            for step in &report.remediation {
                output::display_remediation(step);
            }
        }
    }
    println!("  log: {}", report.ops_log.display());
}
