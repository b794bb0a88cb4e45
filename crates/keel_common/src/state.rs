//! Persisted state primitives
//!
//! All writes to Keel-owned state go through these helpers:
//! 1. `atomic_write` - temp file + fsync + rename, never a half-written file
//! 2. Typed JSON load/save
//! 3. `VersionPointer` - the single live version record
//! 4. File hashing and tree copies used by checkpoints and backups

use crate::error::{KeelError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// ============================================================================
// Atomic File Operations
// ============================================================================

/// Write data to a file atomically using temp file + rename
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(".{}.tmp", file_name));

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    file.sync_all()?;

    fs::rename(&temp_path, path)
}

pub fn atomic_write_str(path: &Path, data: &str) -> io::Result<()> {
    atomic_write(path, data.as_bytes())
}

/// Load a JSON document, `None` if the file does not exist
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&content)?))
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    atomic_write_str(path, &content)?;
    Ok(())
}

// ============================================================================
// Version Pointer
// ============================================================================

/// The live version record. Images are tagged from this value.
pub struct VersionPointer;

impl VersionPointer {
    /// Read the live version, `None` before first install
    pub fn read(path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(content) => {
                let version = content.trim().to_string();
                Ok((!version.is_empty()).then_some(version))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(path: &Path, version: &str) -> Result<()> {
        validate_version(version)?;
        atomic_write_str(path, &format!("{}\n", version))?;
        Ok(())
    }
}

/// Version tags end up in image references and file names
pub fn validate_version(version: &str) -> Result<()> {
    let valid = !version.is_empty()
        && version.len() <= 128
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+'));
    if valid {
        Ok(())
    } else {
        Err(KeelError::validation(format!("'{}' is not a valid version tag", version)))
    }
}

// ============================================================================
// Hashing & Tree Helpers
// ============================================================================

/// SHA-256 of a file, hex encoded
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// All regular files below `root`, as sorted paths relative to `root`
pub fn list_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    if !root.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            files.push(rel.to_path_buf());
        }
    }
    Ok(files)
}

/// Copy a file, creating parent directories and replacing read-only targets
pub fn copy_file(from: &Path, to: &Path) -> io::Result<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)?;
    }
    if to.exists() {
        fs::remove_file(to)?;
    }
    fs::copy(from, to)?;
    let mut perms = fs::metadata(to)?.permissions();
    #[allow(clippy::permissions_set_readonly_false)]
    perms.set_readonly(false);
    fs::set_permissions(to, perms)
}

/// Mark a file read-only
pub fn seal_file(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

/// Remove a directory tree, including read-only files inside it
pub fn remove_tree(path: &Path) -> io::Result<()> {
    if !path.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_symlink() {
            continue;
        }
        let mut perms = entry.metadata()?.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            fs::set_permissions(entry.path(), perms)?;
        }
    }
    fs::remove_dir_all(path)
}
