//! Terminal output - ASCII status markers, colored with owo-colors
//!
//! Human output goes to stdout, errors to stderr. `--json` bypasses all of
//! this and prints the typed report instead.

use anyhow::Result;
use keel_common::health::HealthReport;
use keel_common::launcher::{LaunchReport, ServiceOutcome};
use keel_common::runtime::HealthStatus;
use owo_colors::OwoColorize;
use serde::Serialize;

pub const SEPARATOR: &str = "----------------------------------------";

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn display_error(message: &str) {
    eprintln!("[ERROR] {}", message.red());
}

pub fn display_remediation(message: &str) {
    eprintln!("        {}", message.yellow());
}

pub fn display_success(message: &str) {
    println!("[OK] {}", message.green());
}

pub fn display_info(message: &str) {
    println!("[INFO] {}", message);
}

pub fn display_warning(message: &str) {
    println!("[WARN] {}", message.yellow());
}

pub fn header(title: &str) {
    println!("{}", title.bold());
    println!("{}", SEPARATOR.dimmed());
}

/// Marker for a health probe answer
pub fn status_marker(status: HealthStatus, critical: bool) -> String {
    match status {
        HealthStatus::Healthy => "[OK]  ".green().to_string(),
        _ if critical => "[FAIL]".red().to_string(),
        _ => "[WARN]".yellow().to_string(),
    }
}

pub fn display_health(report: &HealthReport) {
    for service in &report.services {
        let role = if service.critical { "critical" } else { "non-critical" };
        println!(
            "  {} {:<20} {:<10} {}",
            status_marker(service.status, service.critical),
            service.name,
            service.status.as_str(),
            role.dimmed()
        );
    }
}

pub fn display_launch(report: &LaunchReport) {
    for service in &report.services {
        let (marker, detail) = match &service.outcome {
            ServiceOutcome::Healthy => ("[OK]  ".green().to_string(), format!("{}s", service.waited.as_secs())),
            ServiceOutcome::Warning(reason) => ("[WARN]".yellow().to_string(), reason.clone()),
            ServiceOutcome::Failed(reason) => ("[FAIL]".red().to_string(), reason.clone()),
            ServiceOutcome::NotStarted => ("[--]  ".dimmed().to_string(), "not started".to_string()),
        };
        println!("  {} tier {} {:<20} {}", marker, service.tier, service.name, detail);
    }
}
