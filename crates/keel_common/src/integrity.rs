//! Backup archive verification
//!
//! Three escalating checks, each only run once the previous one passed:
//! 1. Decompression - the gzip stream decodes cleanly to the end
//! 2. Listing - the tar listing can be read entry by entry
//! 3. Completeness - a manifest exists, every declared component has a
//!    non-empty dump, and every inventoried entry is present and intact
//!
//! An opt-in fourth check restores each dump into an ephemeral datastore and
//! counts the records. Whether its failure is fatal is a policy choice.
//! None of this needs the mutation lock.

use crate::backup::{dump_entry, BackupManifest, MANIFEST_ENTRY};
use crate::catalog::ServiceCatalog;
use crate::config::TestRestorePolicy;
use crate::datastore::DatastoreCli;
use crate::error::{IntegrityCheck, KeelError, Result};
use crate::runtime::ContainerRuntime;
use flate2::read::GzDecoder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ListedEntry {
    size: u64,
    sha256: String,
}

/// Outcome of one ephemeral test restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TestRestoreOutcome {
    Restored { records: u64 },
    Failed { reason: String },
    /// No ephemeral configuration for this component
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestRestoreResult {
    pub component: String,
    pub outcome: TestRestoreOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub archive: PathBuf,
    #[serde(skip)]
    pub passed: Vec<IntegrityCheck>,
    pub entries: usize,
    pub manifest: BackupManifest,
    pub test_restore: Vec<TestRestoreResult>,
}

impl VerifyReport {
    /// Test restores that failed (advisory policy reports them here)
    pub fn test_restore_failures(&self) -> Vec<&TestRestoreResult> {
        self.test_restore
            .iter()
            .filter(|r| matches!(r.outcome, TestRestoreOutcome::Failed { .. }))
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct IntegrityVerifier {
    policy: TestRestorePolicy,
}

impl IntegrityVerifier {
    pub fn new(policy: TestRestorePolicy) -> Self {
        Self { policy }
    }

    /// Checks 1-3
    pub fn verify(&self, archive: &Path) -> Result<VerifyReport> {
        let label = archive.display().to_string();

        check_decompression(archive).map_err(|detail| {
            KeelError::integrity(&label, IntegrityCheck::Decompression, detail)
        })?;
        let listed = list_entries(archive)
            .map_err(|detail| KeelError::integrity(&label, IntegrityCheck::Listing, detail))?;
        let manifest = check_completeness(archive, &listed)
            .map_err(|detail| KeelError::integrity(&label, IntegrityCheck::Completeness, detail))?;

        info!("{} verified: {} entries", label, listed.len());
        Ok(VerifyReport {
            archive: archive.to_path_buf(),
            passed: vec![
                IntegrityCheck::Decompression,
                IntegrityCheck::Listing,
                IntegrityCheck::Completeness,
            ],
            entries: listed.len(),
            manifest,
            test_restore: Vec::new(),
        })
    }

    /// Checks 1-3, then a real restore of every dump into an ephemeral instance
    pub fn verify_with_test_restore(
        &self,
        archive: &Path,
        runtime: &dyn ContainerRuntime,
        catalog: &ServiceCatalog,
    ) -> Result<VerifyReport> {
        let mut report = self.verify(archive)?;
        let cli = DatastoreCli::new(runtime);

        for component in &report.manifest.components {
            let outcome = match catalog
                .datastores
                .iter()
                .find(|d| &d.name == component && d.ephemeral.is_some())
            {
                None => {
                    warn!("No ephemeral restore configured for {}, skipping", component);
                    TestRestoreOutcome::Skipped
                }
                Some(datastore) => match read_entry(archive, &dump_entry(component)) {
                    Ok(Some(dump)) => match cli.test_restore(datastore, &dump) {
                        Ok(0) => TestRestoreOutcome::Failed {
                            reason: "restore produced zero records".to_string(),
                        },
                        Ok(records) => TestRestoreOutcome::Restored { records },
                        Err(e) => TestRestoreOutcome::Failed { reason: e.to_string() },
                    },
                    Ok(None) => TestRestoreOutcome::Failed {
                        reason: "dump entry missing".to_string(),
                    },
                    Err(e) => TestRestoreOutcome::Failed { reason: e.to_string() },
                },
            };
            report.test_restore.push(TestRestoreResult {
                component: component.clone(),
                outcome,
            });
        }

        let failures = report.test_restore_failures();
        if !failures.is_empty() {
            let detail = failures
                .iter()
                .map(|f| match &f.outcome {
                    TestRestoreOutcome::Failed { reason } => format!("{}: {}", f.component, reason),
                    _ => f.component.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
            match self.policy {
                TestRestorePolicy::Enforce => {
                    return Err(KeelError::integrity(
                        archive.display().to_string(),
                        IntegrityCheck::TestRestore,
                        detail,
                    ));
                }
                TestRestorePolicy::Advisory => {
                    warn!("Test restore failed (advisory): {}", detail);
                }
            }
        } else if !report.test_restore.is_empty() {
            report.passed.push(IntegrityCheck::TestRestore);
        }
        Ok(report)
    }
}

fn open(archive: &Path) -> std::result::Result<GzDecoder<BufReader<File>>, String> {
    let file = File::open(archive).map_err(|e| format!("cannot open archive: {}", e))?;
    Ok(GzDecoder::new(BufReader::new(file)))
}

fn check_decompression(archive: &Path) -> std::result::Result<(), String> {
    let size = fs::metadata(archive)
        .map_err(|e| format!("cannot stat archive: {}", e))?
        .len();
    if size == 0 {
        return Err("archive is empty".to_string());
    }
    let mut decoder = open(archive)?;
    let decoded = io::copy(&mut decoder, &mut io::sink()).map_err(|e| e.to_string())?;
    if decoded == 0 {
        return Err("archive decompresses to nothing".to_string());
    }
    Ok(())
}

fn list_entries(archive: &Path) -> std::result::Result<BTreeMap<String, ListedEntry>, String> {
    let mut tar = tar::Archive::new(open(archive)?);
    let mut listed = BTreeMap::new();

    for entry in tar.entries().map_err(|e| e.to_string())? {
        let mut entry = entry.map_err(|e| e.to_string())?;
        let path = entry
            .path()
            .map_err(|e| e.to_string())?
            .to_string_lossy()
            .into_owned();

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = entry.read(&mut buf).map_err(|e| format!("{}: {}", path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        listed.insert(
            path,
            ListedEntry {
                size,
                sha256: hex::encode(hasher.finalize()),
            },
        );
    }

    if listed.is_empty() {
        return Err("archive has no entries".to_string());
    }
    Ok(listed)
}

fn check_completeness(
    archive: &Path,
    listed: &BTreeMap<String, ListedEntry>,
) -> std::result::Result<BackupManifest, String> {
    if !listed.contains_key(MANIFEST_ENTRY) {
        return Err("manifest.json missing".to_string());
    }
    let raw = read_entry(archive, MANIFEST_ENTRY)
        .map_err(|e| e.to_string())?
        .ok_or_else(|| "manifest.json missing".to_string())?;
    let manifest: BackupManifest =
        serde_json::from_slice(&raw).map_err(|e| format!("manifest.json unreadable: {}", e))?;

    for component in &manifest.components {
        match listed.get(&dump_entry(component)) {
            Some(entry) if entry.size > 0 => {}
            Some(_) => return Err(format!("dump for component {} is empty", component)),
            None => return Err(format!("no dump for component {}", component)),
        }
    }

    for content in &manifest.contents {
        match listed.get(&content.path) {
            None => return Err(format!("{} listed in manifest but missing", content.path)),
            Some(entry) if entry.sha256 != content.sha256 || entry.size != content.size => {
                return Err(format!("{} does not match the manifest", content.path));
            }
            Some(_) => {}
        }
    }

    Ok(manifest)
}

/// Read one entry from an archive, `None` if absent
pub fn read_entry(archive: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(File::open(archive)?)));
    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_string_lossy() == name {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(Some(data));
        }
    }
    Ok(None)
}

/// Unpack an archive below `dir`; entries escaping `dir` are skipped by `tar`
pub fn extract(archive: &Path, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(File::open(archive)?)));
    tar.unpack(dir)?;
    Ok(())
}

/// Manifest of an archive without running the checks
pub fn read_manifest(archive: &Path) -> Result<BackupManifest> {
    let raw = read_entry(archive, MANIFEST_ENTRY)?.ok_or_else(|| {
        KeelError::integrity(
            archive.display().to_string(),
            IntegrityCheck::Completeness,
            "manifest.json missing",
        )
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{ContentEntry, RetentionClass};
    use crate::catalog::{DatastoreComponent, EphemeralRestore};
    use crate::config::BackupKind;
    use crate::runtime::ExecOutput;
    use crate::state::sha256_bytes;
    use crate::testing::ScriptedRuntime;
    use chrono::Utc;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use tempfile::TempDir;

    fn manifest(components: &[&str], contents: &[(&str, &[u8])]) -> BackupManifest {
        BackupManifest {
            format: 1,
            kind: BackupKind::Data,
            class: RetentionClass::Regular,
            created_at: Utc::now(),
            version: Some("1.0.0".to_string()),
            component_versions: BTreeMap::new(),
            components: components.iter().map(|c| c.to_string()).collect(),
            contents: contents
                .iter()
                .map(|(path, data)| ContentEntry {
                    path: path.to_string(),
                    size: data.len() as u64,
                    sha256: sha256_bytes(data),
                })
                .collect(),
        }
    }

    fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o600);
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn good_archive(dir: &Path) -> PathBuf {
        let dump: &[u8] = b"COPY users FROM stdin;\n1\tada\n\\.\n";
        let manifest = serde_json::to_vec(&manifest(&["main"], &[("dumps/main.dump", dump)])).unwrap();
        let path = dir.join("keel-data-x.tar.gz");
        write_tar_gz(&path, &[("manifest.json", manifest.as_slice()), ("dumps/main.dump", dump)]);
        path
    }

    fn failed_check(err: KeelError) -> IntegrityCheck {
        match err {
            KeelError::Integrity { check, .. } => check,
            other => panic!("expected integrity failure, got {:?}", other),
        }
    }

    #[test]
    fn test_good_archive_passes_all_three() {
        let temp = TempDir::new().unwrap();
        let report = IntegrityVerifier::default().verify(&good_archive(temp.path())).unwrap();
        assert_eq!(report.passed.len(), 3);
        assert_eq!(report.entries, 2);
        assert_eq!(report.manifest.components, vec!["main"]);
    }

    #[test]
    fn test_truncated_archive_fails_decompression() {
        let temp = TempDir::new().unwrap();
        let path = good_archive(temp.path());
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

        let err = IntegrityVerifier::default().verify(&path).unwrap_err();
        assert_eq!(failed_check(err), IntegrityCheck::Decompression);
    }

    #[test]
    fn test_not_a_tar_fails_listing() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("junk.tar.gz");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, &[0x55u8; 700]).unwrap();
        fs::write(&path, encoder.finish().unwrap()).unwrap();

        let err = IntegrityVerifier::default().verify(&path).unwrap_err();
        assert_eq!(failed_check(err), IntegrityCheck::Listing);
    }

    #[test]
    fn test_missing_manifest_fails_completeness() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tar.gz");
        write_tar_gz(&path, &[("dumps/main.dump", &b"data"[..])]);

        let err = IntegrityVerifier::default().verify(&path).unwrap_err();
        assert_eq!(failed_check(err), IntegrityCheck::Completeness);
    }

    #[test]
    fn test_declared_component_without_dump_fails_completeness() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("a.tar.gz");
        let manifest = serde_json::to_vec(&manifest(&["main", "search"], &[])).unwrap();
        write_tar_gz(&path, &[("manifest.json", manifest.as_slice()), ("dumps/main.dump", &b"data"[..])]);

        let err = IntegrityVerifier::default().verify(&path).unwrap_err();
        assert!(err.to_string().contains("search"));
        assert_eq!(failed_check(err), IntegrityCheck::Completeness);
    }

    fn catalog_with_ephemeral() -> ServiceCatalog {
        ServiceCatalog {
            datastores: vec![DatastoreComponent {
                name: "main".to_string(),
                service: "db".to_string(),
                dump_command: vec!["pg_dump".to_string()],
                restore_command: vec!["psql".to_string()],
                ephemeral: Some(EphemeralRestore {
                    image: "postgres:16".to_string(),
                    restore_command: vec!["psql".to_string()],
                    count_command: vec!["count".to_string()],
                }),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_test_restore_counts_records() {
        let temp = TempDir::new().unwrap();
        let runtime = ScriptedRuntime::new();
        runtime.set_ephemeral_output(
            "sh",
            ExecOutput {
                stdout: b"1\n".to_vec(),
                ..Default::default()
            },
        );

        let report = IntegrityVerifier::default()
            .verify_with_test_restore(&good_archive(temp.path()), &runtime, &catalog_with_ephemeral())
            .unwrap();
        assert_eq!(
            report.test_restore[0].outcome,
            TestRestoreOutcome::Restored { records: 1 }
        );
        assert!(report.passed.contains(&IntegrityCheck::TestRestore));
    }

    #[test]
    fn test_test_restore_policy() {
        let temp = TempDir::new().unwrap();
        let archive = good_archive(temp.path());
        let runtime = ScriptedRuntime::new();
        runtime.set_ephemeral_output(
            "sh",
            ExecOutput {
                stdout: b"0\n".to_vec(),
                ..Default::default()
            },
        );

        let advisory = IntegrityVerifier::new(TestRestorePolicy::Advisory)
            .verify_with_test_restore(&archive, &runtime, &catalog_with_ephemeral())
            .unwrap();
        assert_eq!(advisory.test_restore_failures().len(), 1);

        let err = IntegrityVerifier::new(TestRestorePolicy::Enforce)
            .verify_with_test_restore(&archive, &runtime, &catalog_with_ephemeral())
            .unwrap_err();
        assert_eq!(failed_check(err), IntegrityCheck::TestRestore);
    }

    #[test]
    fn test_extract_and_read_manifest() {
        let temp = TempDir::new().unwrap();
        let archive = good_archive(temp.path());
        let out = temp.path().join("out");
        extract(&archive, &out).unwrap();
        assert!(out.join("dumps/main.dump").exists());
        assert_eq!(read_manifest(&archive).unwrap().components, vec!["main"]);
    }
}
