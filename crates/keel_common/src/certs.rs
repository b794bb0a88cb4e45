//! TLS material checks
//!
//! Certificates are supplied by an external provider at known paths. Keel
//! never generates key material; it only checks that the certificate is not
//! expired and that it belongs to the private key next to it.

use crate::error::{KeelError, Result};
use serde::Serialize;
use std::path::Path;
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Warn when the certificate expires within this window
pub const EXPIRY_WARNING_WINDOW: Duration = Duration::from_secs(30 * 24 * 3600);

pub trait CertificateProvider: Send + Sync {
    /// Make sure a certificate and key exist at the given paths
    fn provide(&self, cert: &Path, key: &Path) -> Result<()>;

    /// Whether the certificate expires within `window` (zero = already expired)
    fn expires_within(&self, cert: &Path, window: Duration) -> Result<bool>;

    /// Whether certificate and private key share a public key
    fn key_matches(&self, cert: &Path, key: &Path) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CertificateCheck {
    pub expired: bool,
    pub expiring_soon: bool,
    pub key_matches: bool,
}

impl CertificateCheck {
    pub fn is_usable(&self) -> bool {
        !self.expired && self.key_matches
    }

    /// Error for an unusable certificate
    pub fn failure(&self, cert: &Path) -> Option<KeelError> {
        if self.expired {
            return Some(KeelError::validation(format!("certificate {} has expired", cert.display())));
        }
        if !self.key_matches {
            return Some(KeelError::validation(format!(
                "certificate {} does not match its private key",
                cert.display()
            )));
        }
        None
    }
}

/// Check expiry and certificate/key correspondence
pub fn check_certificate(provider: &dyn CertificateProvider, cert: &Path, key: &Path) -> Result<CertificateCheck> {
    let expired = provider.expires_within(cert, Duration::ZERO)?;
    let expiring_soon = !expired && provider.expires_within(cert, EXPIRY_WARNING_WINDOW)?;
    let key_matches = provider.key_matches(cert, key)?;

    if expiring_soon {
        warn!("Certificate {} expires within 30 days", cert.display());
    }
    Ok(CertificateCheck {
        expired,
        expiring_soon,
        key_matches,
    })
}

/// `openssl` CLI backed checks; material is expected to be placed by the operator
pub struct OpensslCertificates;

impl OpensslCertificates {
    fn openssl(args: &[&str]) -> Result<std::process::Output> {
        debug!("openssl {:?}", args);
        Command::new("openssl")
            .args(args)
            .output()
            .map_err(|e| KeelError::runtime(format!("failed to execute openssl: {}", e)))
    }

    fn public_key(args: &[&str]) -> Result<String> {
        let output = Self::openssl(args)?;
        if !output.status.success() {
            return Err(KeelError::validation(format!(
                "openssl {} failed: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl CertificateProvider for OpensslCertificates {
    fn provide(&self, cert: &Path, key: &Path) -> Result<()> {
        for (what, path) in [("certificate", cert), ("private key", key)] {
            if !path.exists() {
                return Err(KeelError::conflict(
                    format!("TLS {} not found at {}", what, path.display()),
                    format!("Place the {} at {} and re-run with --resume", what, path.display()),
                ));
            }
        }
        Ok(())
    }

    fn expires_within(&self, cert: &Path, window: Duration) -> Result<bool> {
        let cert = cert.to_string_lossy();
        let seconds = window.as_secs().to_string();
        let output = Self::openssl(&["x509", "-in", &cert, "-noout", "-checkend", &seconds])?;
        // -checkend exits 0 when the certificate is still valid after `seconds`
        Ok(!output.status.success())
    }

    fn key_matches(&self, cert: &Path, key: &Path) -> Result<bool> {
        let cert = cert.to_string_lossy();
        let key = key.to_string_lossy();
        let from_cert = Self::public_key(&["x509", "-in", &cert, "-noout", "-pubkey"])?;
        let from_key = Self::public_key(&["pkey", "-in", &key, "-pubout"])?;
        Ok(!from_cert.is_empty() && from_cert == from_key)
    }
}
