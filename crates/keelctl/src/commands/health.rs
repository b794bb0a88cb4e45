//! keelctl health-check
//!
//! Read-only: one probe per cataloged service plus the TLS certificate check.

use super::Session;
use crate::errors::{EXIT_CRITICAL, EXIT_RECOVERABLE, EXIT_SUCCESS};
use crate::output;
use anyhow::Result;
use keel_common::certs::{check_certificate, CertificateCheck};
use keel_common::health::{probe_all, HealthReport};
use keel_common::ops_log::read_recent;
use serde::Serialize;

const RECENT_OPERATIONS: usize = 5;

#[derive(Debug, Serialize)]
pub struct HealthCheckReport {
    pub services: HealthReport,
    pub certificate: Option<CertificateCheck>,
    /// Why the certificate could not be checked
    pub certificate_error: Option<String>,
    pub exit_code: i32,
}

pub fn check(session: &Session) -> Result<HealthCheckReport> {
    let stack = &session.stack;
    let services = probe_all(stack.runtime.as_ref(), &stack.catalog()?);

    let (cert, key) = (stack.paths.tls_cert(), stack.paths.tls_key());
    let (certificate, certificate_error) = match check_certificate(session.certs.as_ref(), &cert, &key) {
        Ok(check) => (Some(check), None),
        Err(e) => (None, Some(e.to_string())),
    };

    let cert_code = match &certificate {
        Some(check) if !check.is_usable() => EXIT_CRITICAL,
        Some(check) if check.expiring_soon => EXIT_RECOVERABLE,
        Some(_) => EXIT_SUCCESS,
        None => EXIT_CRITICAL,
    };

    Ok(HealthCheckReport {
        exit_code: services.exit_code().max(cert_code),
        services,
        certificate,
        certificate_error,
    })
}

pub fn run(session: &Session) -> Result<i32> {
    let report = check(session)?;
    if session.json {
        output::print_json(&report)?;
        return Ok(report.exit_code);
    }

    output::header("Services");
    output::display_health(&report.services);

    println!();
    output::header("Certificate");
    match (&report.certificate, &report.certificate_error) {
        (Some(check), _) if check.expired => output::display_error("certificate has expired"),
        (Some(check), _) if !check.key_matches => output::display_error("certificate does not match its key"),
        (Some(check), _) if check.expiring_soon => output::display_warning("certificate expires within 30 days"),
        (Some(_), _) => output::display_success("certificate valid"),
        (None, error) => output::display_error(error.as_deref().unwrap_or("certificate check failed")),
    }

    let recent = read_recent(&session.stack.paths.logs_dir(), RECENT_OPERATIONS);
    if !recent.is_empty() {
        println!();
        output::header("Recent operations");
        for entry in &recent {
            println!("  {}", entry.to_log_line());
        }
    }
    Ok(report.exit_code)
}
