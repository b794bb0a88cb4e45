//! Secret generation and fingerprinting
//!
//! Install fills `__GENERATE__` placeholders in the live environment file.
//! Checkpoints never copy key material; they record SHA-256 fingerprints of
//! the TLS key and the secrets directory so rollback can check them.

use crate::env_merge::{EnvironmentFile, SECRET_PLACEHOLDER};
use crate::error::{KeelError, Result};
use crate::paths::KeelPaths;
use crate::state::{list_files, sha256_file};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::info;

pub trait SecretGenerator: Send + Sync {
    /// A fresh secret value for `key`
    fn generate(&self, key: &str) -> Result<String>;
}

/// Hex-encoded random bytes from the OS-seeded thread RNG
pub struct RandomSecrets {
    bytes: usize,
}

impl RandomSecrets {
    pub fn new(bytes: usize) -> Self {
        Self { bytes: bytes.max(16) }
    }
}

impl Default for RandomSecrets {
    fn default() -> Self {
        Self::new(32)
    }
}

impl SecretGenerator for RandomSecrets {
    fn generate(&self, _key: &str) -> Result<String> {
        let mut buf = vec![0u8; self.bytes];
        rand::thread_rng()
            .try_fill_bytes(&mut buf)
            .map_err(|e| KeelError::runtime(format!("random source failed: {}", e)))?;
        Ok(hex::encode(buf))
    }
}

/// Replace every unresolved placeholder in the env file. Returns how many were filled.
pub fn fill_placeholders(env_path: &Path, generator: &dyn SecretGenerator) -> Result<usize> {
    let mut env = EnvironmentFile::load(env_path)?;
    let unresolved = env.unresolved(SECRET_PLACEHOLDER);
    if unresolved.is_empty() {
        return Ok(0);
    }

    let mut values = HashMap::new();
    for key in &unresolved {
        values.insert(key.clone(), generator.generate(key)?);
    }
    let filled = env.resolve_placeholders(SECRET_PLACEHOLDER, |key| {
        values.get(key).cloned().unwrap_or_default()
    });
    env.save(env_path)?;

    info!("Generated {} secret(s): {}", filled, unresolved.join(", "));
    Ok(filled)
}

/// Fingerprints of secret material, keyed by a stable name
pub fn fingerprints(paths: &KeelPaths) -> Result<BTreeMap<String, String>> {
    let mut prints = BTreeMap::new();
    let key = paths.tls_key();
    if key.exists() {
        prints.insert("tls/server.key".to_string(), sha256_file(&key)?);
    }
    for rel in list_files(&paths.secrets_dir)? {
        let name = format!("secrets/{}", rel.to_string_lossy());
        prints.insert(name, sha256_file(&paths.secrets_dir.join(&rel))?);
    }
    Ok(prints)
}

/// Differences between recorded and current fingerprints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintDrift {
    /// Recorded but gone now
    pub missing: Vec<String>,
    /// Present with different content
    pub changed: Vec<String>,
}

impl FingerprintDrift {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.changed.is_empty()
    }
}

pub fn compare_fingerprints(
    recorded: &BTreeMap<String, String>,
    current: &BTreeMap<String, String>,
) -> FingerprintDrift {
    let mut drift = FingerprintDrift::default();
    for (name, print) in recorded {
        match current.get(name) {
            None => drift.missing.push(name.clone()),
            Some(now) if now != print => drift.changed.push(name.clone()),
            Some(_) => {}
        }
    }
    drift
}
