//! Checkpoint store
//!
//! A checkpoint is a by-value copy of the deployment directory (including
//! the live `.env`) plus a manifest: kind, creation time, source and target
//! version, image ids, per-file SHA-256 and secret fingerprints.
//!
//! Checkpoints are written into a hidden `.partial` directory, every file is
//! made read-only, and the directory is renamed into place. Nothing in this
//! module modifies a checkpoint after that rename.

use crate::error::{IntegrityCheck, KeelError, Result};
use crate::ops_log::FILE_STAMP_FORMAT;
use crate::paths::KeelPaths;
use crate::secrets;
use crate::state::{copy_file, list_files, load_json, remove_tree, save_json, seal_file, sha256_file, VersionPointer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const MANIFEST_FILE: &str = "manifest.json";
const DEPLOY_SUBDIR: &str = "deploy";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub name: String,
    /// Operation that created it (update, manual)
    pub kind: String,
    pub created_at: DateTime<Utc>,
    pub source_version: Option<String>,
    pub target_version: Option<String>,
    #[serde(default)]
    pub image_ids: BTreeMap<String, String>,
    /// Captured file (relative to the deployment dir) -> SHA-256
    pub files: BTreeMap<String, String>,
    /// Secret material recorded by fingerprint only
    #[serde(default)]
    pub secret_fingerprints: BTreeMap<String, String>,
}

/// A checkpoint on disk
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub manifest: CheckpointManifest,
    root: PathBuf,
}

impl Checkpoint {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Captured copy of a deployment file
    pub fn captured(&self, rel: &str) -> PathBuf {
        self.root.join(DEPLOY_SUBDIR).join(rel)
    }

    /// Copy every captured file back over the live deployment dir
    pub fn restore_into(&self, deploy_dir: &Path) -> Result<usize> {
        for rel in self.manifest.files.keys() {
            copy_file(&self.captured(rel), &deploy_dir.join(rel))?;
        }
        Ok(self.manifest.files.len())
    }
}

/// What to capture
#[derive(Debug, Clone, Default)]
pub struct CheckpointRequest<'a> {
    pub kind: &'a str,
    pub target_version: Option<&'a str>,
    pub image_ids: BTreeMap<String, String>,
    /// Deployment-relative directories left out (large assets)
    pub exclude: &'a [PathBuf],
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Capture the current deployment state
    pub fn create(&self, paths: &KeelPaths, request: CheckpointRequest<'_>) -> Result<Checkpoint> {
        fs::create_dir_all(&self.dir)?;
        let name = self.unique_name(request.kind);
        let partial = self.dir.join(format!(".{}.partial", name));
        remove_tree(&partial)?;

        let mut files = BTreeMap::new();
        for rel in list_files(&paths.deploy_dir)? {
            if request.exclude.iter().any(|dir| rel.starts_with(dir)) {
                continue;
            }
            let target = partial.join(DEPLOY_SUBDIR).join(&rel);
            copy_file(&paths.deploy_dir.join(&rel), &target)?;
            files.insert(rel.to_string_lossy().into_owned(), sha256_file(&target)?);
            seal_file(&target)?;
        }

        let manifest = CheckpointManifest {
            name: name.clone(),
            kind: request.kind.to_string(),
            created_at: Utc::now(),
            source_version: VersionPointer::read(&paths.version_file())?,
            target_version: request.target_version.map(str::to_string),
            image_ids: request.image_ids,
            files,
            secret_fingerprints: secrets::fingerprints(paths)?,
        };
        let manifest_path = partial.join(MANIFEST_FILE);
        save_json(&manifest_path, &manifest)?;
        seal_file(&manifest_path)?;

        let root = self.dir.join(&name);
        fs::rename(&partial, &root)?;
        info!(
            "Checkpoint {} created ({} files, version {})",
            name,
            manifest.files.len(),
            manifest.source_version.as_deref().unwrap_or("none")
        );
        Ok(Checkpoint { manifest, root })
    }

    fn unique_name(&self, kind: &str) -> String {
        let base = format!("{}-{}", kind, Utc::now().format(FILE_STAMP_FORMAT));
        let mut name = base.clone();
        let mut n = 1;
        while self.dir.join(&name).exists() {
            name = format!("{}-{}", base, n);
            n += 1;
        }
        name
    }

    /// All checkpoints, newest first. Read-only, needs no lock.
    pub fn list(&self) -> Result<Vec<Checkpoint>> {
        let mut checkpoints = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(checkpoints),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            match load_json::<CheckpointManifest>(&entry.path().join(MANIFEST_FILE)) {
                Ok(Some(manifest)) => checkpoints.push(Checkpoint {
                    manifest,
                    root: entry.path(),
                }),
                Ok(None) => warn!("Checkpoint {} has no manifest, ignoring", name),
                Err(e) => warn!("Checkpoint {} has an unreadable manifest: {}", name, e),
            }
        }

        checkpoints.sort_by(|a, b| {
            b.manifest
                .created_at
                .cmp(&a.manifest.created_at)
                .then_with(|| b.manifest.name.cmp(&a.manifest.name))
        });
        Ok(checkpoints)
    }

    pub fn latest(&self) -> Result<Option<Checkpoint>> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn load(&self, name: &str) -> Result<Checkpoint> {
        if name.is_empty() || name.starts_with('.') || name.contains('/') || name.contains("..") {
            return Err(KeelError::validation(format!("'{}' is not a checkpoint name", name)));
        }
        let root = self.dir.join(name);
        match load_json::<CheckpointManifest>(&root.join(MANIFEST_FILE))? {
            Some(manifest) => Ok(Checkpoint { manifest, root }),
            None => Err(KeelError::conflict(
                format!("Checkpoint {} not found", name),
                "List available checkpoints with `keelctl rollback --list`",
            )),
        }
    }

    /// Named checkpoint, or the newest one
    pub fn resolve(&self, name: Option<&str>) -> Result<Checkpoint> {
        match name {
            Some(name) => self.load(name),
            None => self.latest()?.ok_or_else(|| {
                KeelError::conflict(
                    "No checkpoint available to roll back to",
                    "Restore from a backup instead: `keelctl restore <archive>`",
                )
            }),
        }
    }

    /// Re-hash every captured file against the manifest
    pub fn verify(&self, checkpoint: &Checkpoint) -> Result<()> {
        for (rel, expected) in &checkpoint.manifest.files {
            let path = checkpoint.captured(rel);
            let actual = sha256_file(&path).map_err(|e| {
                KeelError::integrity(checkpoint.name(), IntegrityCheck::Checksum, format!("{}: {}", rel, e))
            })?;
            if &actual != expected {
                return Err(KeelError::integrity(
                    checkpoint.name(),
                    IntegrityCheck::Checksum,
                    format!("{} does not match its recorded checksum", rel),
                ));
            }
        }
        debug!("Checkpoint {} verified ({} files)", checkpoint.name(), checkpoint.manifest.files.len());
        Ok(())
    }

    /// Keep the newest `keep` checkpoints; returns the names removed
    pub fn prune(&self, keep: usize) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for checkpoint in self.list()?.into_iter().skip(keep) {
            remove_tree(checkpoint.root())?;
            info!("Pruned checkpoint {}", checkpoint.name());
            removed.push(checkpoint.manifest.name);
        }
        Ok(removed)
    }
}
