//! Update-scoped side archive
//!
//! When an update copies a new deployment-file source over the live
//! directory, the files it replaces are archived first under
//! `<state>/update_side_archives/<checkpoint>/`, together with the list of
//! files the copy added. Reverting puts replaced files back and removes the
//! added ones.

use crate::error::{KeelError, Result};
use crate::paths::KeelPaths;
use crate::state::{copy_file, list_files, load_json, save_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MANIFEST_FILE: &str = "manifest.json";
const FILES_SUBDIR: &str = "files";

/// Files a source copy never overwrites
const PROTECTED_FILES: &[&str] = &[".env"];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SideArchiveManifest {
    pub checkpoint: String,
    pub created_at: Option<DateTime<Utc>>,
    pub replaced: Vec<String>,
    pub added: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SideArchive {
    pub manifest: SideArchiveManifest,
    root: PathBuf,
}

impl SideArchive {
    pub fn dir_for(paths: &KeelPaths, checkpoint: &str) -> PathBuf {
        paths.side_archives_dir().join(checkpoint)
    }

    /// Archive what `source` would replace, then copy `source` over the deployment dir
    pub fn apply_source(paths: &KeelPaths, checkpoint: &str, source: &Path) -> Result<Self> {
        if !source.is_dir() {
            return Err(KeelError::validation(format!(
                "deployment source {} is not a directory",
                source.display()
            )));
        }
        if fs::canonicalize(source)? == fs::canonicalize(&paths.deploy_dir)? {
            return Err(KeelError::validation("deployment source is the live deployment directory"));
        }

        let files: Vec<(PathBuf, PathBuf)> = list_files(source)?
            .into_iter()
            .filter(|rel| {
                let protected = PROTECTED_FILES.iter().any(|p| rel == Path::new(p));
                if protected {
                    warn!("Ignoring {} in deployment source, the live copy is kept", rel.display());
                }
                !protected
            })
            .map(|rel| (source.join(&rel), rel))
            .collect();

        let archive = Self::apply_files(paths, checkpoint, &files)?;
        info!(
            "Deployment files updated from {}: {} replaced, {} added",
            source.display(),
            archive.manifest.replaced.len(),
            archive.manifest.added.len()
        );
        Ok(archive)
    }

    /// Archive the live files that `(from, rel)` pairs would replace, then
    /// copy each `from` to `rel` under the deployment dir. A failed copy
    /// reverts the ones already made.
    pub fn apply_files(paths: &KeelPaths, key: &str, files: &[(PathBuf, PathBuf)]) -> Result<Self> {
        let root = Self::dir_for(paths, key);
        let mut manifest = SideArchiveManifest {
            checkpoint: key.to_string(),
            created_at: Some(Utc::now()),
            ..Default::default()
        };

        for (_, rel) in files {
            let live = paths.deploy_dir.join(rel);
            let name = rel.to_string_lossy().into_owned();
            if live.exists() {
                copy_file(&live, &root.join(FILES_SUBDIR).join(rel))?;
                manifest.replaced.push(name);
            } else {
                manifest.added.push(name);
            }
        }
        save_json(&root.join(MANIFEST_FILE), &manifest)?;
        let archive = Self { manifest, root };

        for (from, rel) in files {
            if let Err(e) = copy_file(from, &paths.deploy_dir.join(rel)) {
                warn!("Copying {} failed ({}), reverting the files already replaced", rel.display(), e);
                if let Err(revert) = archive.revert(&paths.deploy_dir) {
                    warn!("Revert of {} incomplete: {}", archive.root.display(), revert);
                }
                return Err(e.into());
            }
        }
        Ok(archive)
    }

    pub fn load(paths: &KeelPaths, checkpoint: &str) -> Result<Option<Self>> {
        let root = Self::dir_for(paths, checkpoint);
        Ok(load_json::<SideArchiveManifest>(&root.join(MANIFEST_FILE))?.map(|manifest| Self { manifest, root }))
    }

    /// Put replaced files back and remove added ones
    pub fn revert(&self, deploy_dir: &Path) -> Result<()> {
        for rel in &self.manifest.replaced {
            copy_file(&self.root.join(FILES_SUBDIR).join(rel), &deploy_dir.join(rel))?;
        }
        for rel in &self.manifest.added {
            match fs::remove_file(deploy_dir.join(rel)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn discard(paths: &KeelPaths, checkpoint: &str) -> Result<()> {
        let root = Self::dir_for(paths, checkpoint);
        if root.exists() {
            fs::remove_dir_all(root)?;
        }
        Ok(())
    }
}
