//! Backup archives
//!
//! One gzip-compressed tar per invocation:
//!
//! ```text
//! manifest.json            kind, class, timestamp, versions, inventory
//! config/<file>            deployment files incl. .env   (metadata, full)
//! dumps/<component>.dump   datastore dumps               (data, full)
//! assets/<dir>/<file>      large binary assets           (full)
//! ```
//!
//! Archives are written to a hidden partial file, checked, and renamed into
//! place. Retention then prunes the oldest archives of the same category.

use crate::catalog::ServiceCatalog;
use crate::config::BackupKind;
use crate::context::StackContext;
use crate::datastore::DatastoreCli;
use crate::error::{KeelError, Result};
use crate::integrity::IntegrityVerifier;
use crate::lock::{LockHandle, MUTATION_LOCK};
use crate::ops_log::FILE_STAMP_FORMAT;
use crate::state::{list_files, sha256_bytes, sha256_file, VersionPointer};
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MANIFEST_ENTRY: &str = "manifest.json";
pub const CONFIG_PREFIX: &str = "config/";
pub const DUMPS_PREFIX: &str = "dumps/";
pub const ASSETS_PREFIX: &str = "assets/";
pub const DUMP_EXTENSION: &str = ".dump";
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

const ARCHIVE_PREFIX: &str = "keel-";
const PRE_UPDATE_PREFIX: &str = "pre-update-";
const MANIFEST_FORMAT: u32 = 1;

/// Archive path of a component's dump
pub fn dump_entry(component: &str) -> String {
    format!("{}{}{}", DUMPS_PREFIX, component, DUMP_EXTENSION)
}

/// Why an archive was taken; pre-update archives have their own retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionClass {
    Regular,
    PreUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentEntry {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format: u32,
    pub kind: BackupKind,
    pub class: RetentionClass,
    pub created_at: DateTime<Utc>,
    pub version: Option<String>,
    /// Service -> image id at backup time
    #[serde(default)]
    pub component_versions: BTreeMap<String, String>,
    /// Datastore components with a dump in this archive
    #[serde(default)]
    pub components: Vec<String>,
    pub contents: Vec<ContentEntry>,
}

/// An archive on disk, described by its file name
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub path: PathBuf,
    pub name: String,
    pub kind: BackupKind,
    pub class: RetentionClass,
    pub created_at: DateTime<Utc>,
    /// Collision counter for archives named in the same millisecond
    pub sequence: u32,
}

impl ArchiveInfo {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy().into_owned();
        let stem = name.strip_prefix(ARCHIVE_PREFIX)?.strip_suffix(ARCHIVE_EXTENSION)?;
        let (class, rest) = match stem.strip_prefix(PRE_UPDATE_PREFIX) {
            Some(rest) => (RetentionClass::PreUpdate, rest),
            None => (RetentionClass::Regular, stem),
        };
        let (kind, stamp) = rest.split_once('-')?;
        let (stamp, sequence) = match stamp.split_once('-') {
            Some((stamp, n)) => (stamp, n.parse().ok()?),
            None => (stamp, 0),
        };
        Some(Self {
            path: path.to_path_buf(),
            kind: kind.parse().ok()?,
            class,
            created_at: parse_stamp(stamp)?,
            sequence,
            name,
        })
    }

    fn same_category(&self, kind: BackupKind, class: RetentionClass) -> bool {
        match class {
            RetentionClass::PreUpdate => self.class == RetentionClass::PreUpdate,
            RetentionClass::Regular => self.class == RetentionClass::Regular && self.kind == kind,
        }
    }
}

/// Parse a `FILE_STAMP_FORMAT` timestamp (`20260101T000000000Z`)
fn parse_stamp(stamp: &str) -> Option<DateTime<Utc>> {
    let digits = stamp.strip_suffix('Z')?;
    if digits.len() != 18 || !digits.is_char_boundary(15) {
        return None;
    }
    let (seconds, millis) = digits.split_at(15);
    let base = NaiveDateTime::parse_from_str(seconds, "%Y%m%dT%H%M%S").ok()?;
    let millis: i64 = millis.parse().ok()?;
    Some((base + Duration::milliseconds(millis)).and_utc())
}

/// Result of one backup run
#[derive(Debug, Clone, Serialize)]
pub struct BackupRecord {
    pub path: PathBuf,
    pub manifest: BackupManifest,
    pub pruned: Vec<PathBuf>,
}

enum Source {
    Bytes(Vec<u8>),
    File(PathBuf),
}

pub struct BackupManager<'a> {
    ctx: &'a StackContext,
}

impl<'a> BackupManager<'a> {
    pub fn new(ctx: &'a StackContext) -> Self {
        Self { ctx }
    }

    /// Produce one archive. Kinds touching datastore volumes need the
    /// mutation lock; a caller that already holds it passes it in.
    pub fn create(&self, kind: BackupKind, class: RetentionClass, held: Option<&LockHandle>) -> Result<BackupRecord> {
        let _own_lock = match (kind.includes_dumps(), held) {
            (false, _) => None,
            (true, Some(handle)) if handle.is_valid() => None,
            (true, Some(_)) => {
                return Err(KeelError::conflict(
                    "The held lifecycle lock is no longer valid",
                    "Re-run the operation",
                ))
            }
            (true, None) => Some(self.ctx.locks().acquire(MUTATION_LOCK, "backup")?),
        };

        let paths = &self.ctx.paths;
        let catalog = if kind.includes_dumps() {
            self.ctx.catalog()?
        } else {
            ServiceCatalog::load(&paths.services_file()).unwrap_or_default()
        };

        let mut entries: Vec<(String, Source)> = Vec::new();
        let mut components = Vec::new();

        if kind.includes_config() {
            for rel in list_files(&paths.deploy_dir)? {
                if self.is_asset(&rel) {
                    continue;
                }
                entries.push((
                    format!("{}{}", CONFIG_PREFIX, rel.to_string_lossy()),
                    Source::File(paths.deploy_dir.join(&rel)),
                ));
            }
        }

        if kind.includes_dumps() {
            let cli = DatastoreCli::new(self.ctx.runtime.as_ref());
            for component in &catalog.datastores {
                let dump = cli.dump(component)?;
                entries.push((dump_entry(&component.name), Source::Bytes(dump)));
                components.push(component.name.clone());
            }
        }

        if kind.includes_assets() {
            for dir in &self.ctx.config.backup.asset_dirs {
                let root = paths.deploy_dir.join(dir);
                for rel in list_files(&root)? {
                    entries.push((
                        format!("{}{}", ASSETS_PREFIX, dir.join(&rel).to_string_lossy()),
                        Source::File(root.join(&rel)),
                    ));
                }
            }
        }

        let mut contents = Vec::with_capacity(entries.len());
        for (path, source) in &entries {
            let (size, sha256) = match source {
                Source::Bytes(data) => (data.len() as u64, sha256_bytes(data)),
                Source::File(file) => (fs::metadata(file)?.len(), sha256_file(file)?),
            };
            contents.push(ContentEntry {
                path: path.clone(),
                size,
                sha256,
            });
        }

        let component_versions = self
            .ctx
            .runtime
            .image_ids(&catalog.service_names())
            .unwrap_or_else(|e| {
                warn!("Could not read image ids for the backup manifest: {}", e);
                BTreeMap::new()
            });

        let manifest = BackupManifest {
            format: MANIFEST_FORMAT,
            kind,
            class,
            created_at: Utc::now(),
            version: VersionPointer::read(&paths.version_file())?,
            component_versions,
            components,
            contents,
        };

        let dir = paths.backups_dir();
        fs::create_dir_all(&dir)?;
        let name = self.unique_name(&dir, kind, class);
        let partial = dir.join(format!(".{}.partial", name));
        if let Err(e) = write_archive(&partial, &manifest, &entries) {
            discard_partial(&partial);
            return Err(e);
        }

        // Never rotate good archives out in favour of a broken one
        if let Err(e) = IntegrityVerifier::default().verify(&partial) {
            discard_partial(&partial);
            return Err(e);
        }

        let path = dir.join(&name);
        fs::rename(&partial, &path)?;
        info!(
            "Backup {} written ({} entries, {} component dump(s))",
            path.display(),
            manifest.contents.len(),
            manifest.components.len()
        );

        let pruned = self.prune_keeping(kind, class, Some(&path))?;
        Ok(BackupRecord { path, manifest, pruned })
    }

    fn is_asset(&self, rel: &Path) -> bool {
        self.ctx.config.backup.asset_dirs.iter().any(|dir| rel.starts_with(dir))
    }

    fn unique_name(&self, dir: &Path, kind: BackupKind, class: RetentionClass) -> String {
        let class_prefix = match class {
            RetentionClass::PreUpdate => PRE_UPDATE_PREFIX,
            RetentionClass::Regular => "",
        };
        let base = format!(
            "{}{}{}-{}",
            ARCHIVE_PREFIX,
            class_prefix,
            kind.as_str(),
            Utc::now().format(FILE_STAMP_FORMAT)
        );
        let mut name = format!("{}{}", base, ARCHIVE_EXTENSION);
        let mut n = 1;
        while dir.join(&name).exists() {
            name = format!("{}-{}{}", base, n, ARCHIVE_EXTENSION);
            n += 1;
        }
        name
    }

    /// Archives in the backup dir, newest first. Read-only.
    pub fn list(&self) -> Result<Vec<ArchiveInfo>> {
        let dir = self.ctx.paths.backups_dir();
        let mut archives = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(archives),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            if let Some(info) = ArchiveInfo::from_path(&entry?.path()) {
                archives.push(info);
            }
        }
        archives.sort_by(|a, b| {
            (b.created_at, b.sequence)
                .cmp(&(a.created_at, a.sequence))
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(archives)
    }

    fn retention(&self, kind: BackupKind, class: RetentionClass) -> usize {
        let config = &self.ctx.config.backup;
        let keep = match (class, kind) {
            (RetentionClass::PreUpdate, _) => config.retention_pre_update,
            (RetentionClass::Regular, BackupKind::Metadata) => config.retention_metadata,
            (RetentionClass::Regular, BackupKind::Data) => config.retention_data,
            (RetentionClass::Regular, BackupKind::Full) => config.retention_full,
        };
        keep.max(1)
    }

    /// Delete archives of the same category beyond the retention count
    pub fn prune(&self, kind: BackupKind, class: RetentionClass) -> Result<Vec<PathBuf>> {
        self.prune_keeping(kind, class, None)
    }

    /// Prune, counting `newest` as the most recent archive whatever its name says
    fn prune_keeping(&self, kind: BackupKind, class: RetentionClass, newest: Option<&Path>) -> Result<Vec<PathBuf>> {
        let keep = self.retention(kind, class);
        let mut candidates: Vec<ArchiveInfo> = self
            .list()?
            .into_iter()
            .filter(|a| a.same_category(kind, class))
            .collect();
        if let Some(pos) = newest.and_then(|p| candidates.iter().position(|a| a.path == p)) {
            let latest = candidates.remove(pos);
            candidates.insert(0, latest);
        }

        let mut removed = Vec::new();
        for archive in candidates.into_iter().skip(keep) {
            fs::remove_file(&archive.path)?;
            info!("Pruned backup {}", archive.name);
            removed.push(archive.path);
        }
        Ok(removed)
    }
}

fn discard_partial(partial: &Path) {
    match fs::remove_file(partial) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial backup {}: {}", partial.display(), e),
    }
}

fn write_archive(path: &Path, manifest: &BackupManifest, entries: &[(String, Source)]) -> Result<()> {
    let file = File::create(path)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    let mtime = manifest.created_at.timestamp().max(0) as u64;

    let manifest_bytes = serde_json::to_vec_pretty(manifest)?;
    append_bytes(&mut builder, MANIFEST_ENTRY, &manifest_bytes, mtime)?;

    for (name, source) in entries {
        match source {
            Source::Bytes(data) => append_bytes(&mut builder, name, data, mtime)?,
            Source::File(file_path) => {
                let file = File::open(file_path)?;
                let mut header = tar::Header::new_gnu();
                header.set_size(file.metadata()?.len());
                header.set_mode(0o600);
                header.set_mtime(mtime);
                header.set_entry_type(tar::EntryType::Regular);
                builder.append_data(&mut header, name, file)?;
            }
        }
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(())
}

fn append_bytes<W: std::io::Write>(builder: &mut tar::Builder<W>, name: &str, data: &[u8], mtime: u64) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o600);
    header.set_mtime(mtime);
    header.set_entry_type(tar::EntryType::Regular);
    builder.append_data(&mut header, name, data)?;
    Ok(())
}
