//! Keel Operations Log - append-only audit trail of lifecycle operations
//!
//! Every destructive operation gets its own file under `<state>/logs/` and
//! each line is mirrored into the global `ops.log`.
//!
//! Format: RFC3339 timestamp + operation + event + [detail]
//! Example: 2026-03-01T17:05:23Z update stop worker grace=45s
//!
//! On failure, recent service log output is captured next to the operation
//! log as `<operation>-<ts>-diagnostics.log`.

use crate::runtime::ContainerRuntime;
use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Aggregate log of every operation
pub const GLOBAL_LOG_FILE: &str = "ops.log";

/// Timestamp format used in operation file names
pub const FILE_STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// A single ops log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpsEntry {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub event: String,
    pub detail: String,
}

impl OpsEntry {
    pub fn new(operation: &str, event: &str, detail: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            event: event.to_string(),
            detail: detail.replace('\n', " "),
        }
    }

    /// Format as log line
    pub fn to_log_line(&self) -> String {
        let line = format!(
            "{} {} {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            self.operation,
            self.event
        );
        if self.detail.is_empty() {
            line
        } else {
            format!("{} {}", line, self.detail)
        }
    }

    /// Parse from log line
    pub fn from_log_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.splitn(4, ' ').collect();
        if parts.len() < 3 {
            return None;
        }

        let timestamp = DateTime::parse_from_rfc3339(parts[0])
            .ok()?
            .with_timezone(&Utc);

        Some(Self {
            timestamp,
            operation: parts[1].to_string(),
            event: parts[2].to_string(),
            detail: parts.get(3).unwrap_or(&"").to_string(),
        })
    }
}

/// Writer for one operation's log
#[derive(Debug, Clone)]
pub struct OpsLog {
    dir: PathBuf,
    operation: String,
    stamp: String,
    path: PathBuf,
}

impl OpsLog {
    /// Open a fresh log for `operation` in `dir`
    pub fn start(dir: &Path, operation: &str) -> Self {
        let stamp = Utc::now().format(FILE_STAMP_FORMAT).to_string();
        let path = dir.join(format!("{}-{}.log", operation, stamp));
        let log = Self {
            dir: dir.to_path_buf(),
            operation: operation.to_string(),
            stamp,
            path,
        };
        log.record("start", "");
        log
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Append an event. Log write failures never abort the operation.
    pub fn record(&self, event: &str, detail: &str) {
        let entry = OpsEntry::new(&self.operation, event, detail);
        if let Err(e) = self.append(&entry) {
            warn!("Failed to write ops log {}: {}", self.path.display(), e);
        }
    }

    fn append(&self, entry: &OpsEntry) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let line = entry.to_log_line();
        for path in [self.path.clone(), self.dir.join(GLOBAL_LOG_FILE)] {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

    /// Write a free-form diagnostics file next to the operation log
    pub fn write_diagnostics(&self, content: &str) -> Option<PathBuf> {
        let path = self
            .dir
            .join(format!("{}-{}-diagnostics.log", self.operation, self.stamp));
        let result = fs::create_dir_all(&self.dir).and_then(|_| {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            file.write_all(content.as_bytes())
        });
        match result {
            Ok(()) => {
                self.record("diagnostics", &path.display().to_string());
                Some(path)
            }
            Err(e) => {
                warn!("Failed to write diagnostics {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Capture the tail of every service's log for postmortem
    pub fn capture_diagnostics(
        &self,
        runtime: &dyn ContainerRuntime,
        services: &[String],
        lines: usize,
        cause: &str,
    ) -> Option<PathBuf> {
        let mut content = format!(
            "# {} diagnostics captured {}\n# cause: {}\n",
            self.operation,
            Utc::now().to_rfc3339(),
            cause
        );
        for service in services {
            content.push_str(&format!("\n===== {} =====\n", service));
            match runtime.logs(service, lines) {
                Ok(text) => content.push_str(&text),
                Err(e) => content.push_str(&format!("(logs unavailable: {})\n", e)),
            }
        }
        self.write_diagnostics(&content)
    }
}

/// Last `limit` entries of the global log, oldest first
pub fn read_recent(dir: &Path, limit: usize) -> Vec<OpsEntry> {
    let Ok(file) = fs::File::open(dir.join(GLOBAL_LOG_FILE)) else {
        return Vec::new();
    };
    let entries: Vec<OpsEntry> = BufReader::new(file)
        .lines()
        .map_while(|line| line.ok())
        .filter_map(|line| OpsEntry::from_log_line(&line))
        .collect();
    let skip = entries.len().saturating_sub(limit);
    entries.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRuntime;
    use tempfile::TempDir;

    #[test]
    fn test_entry_line_roundtrip() {
        let entry = OpsEntry::new("update", "stop", "worker grace=45s");
        let parsed = OpsEntry::from_log_line(&entry.to_log_line()).unwrap();
        assert_eq!(parsed.operation, "update");
        assert_eq!(parsed.event, "stop");
        assert_eq!(parsed.detail, "worker grace=45s");
    }

    #[test]
    fn test_entry_without_detail() {
        let parsed = OpsEntry::from_log_line("2026-01-02T03:04:05Z rollback done").unwrap();
        assert_eq!(parsed.event, "done");
        assert!(parsed.detail.is_empty());
        assert!(OpsEntry::from_log_line("garbage").is_none());
    }

    #[test]
    fn test_records_go_to_both_files() {
        let temp = TempDir::new().unwrap();
        let log = OpsLog::start(temp.path(), "update");
        log.record("checkpoint", "update-20260101T000000000Z");

        let own = fs::read_to_string(log.path()).unwrap();
        assert_eq!(own.lines().count(), 2);
        assert!(own.contains("update checkpoint update-2026"));

        let recent = read_recent(temp.path(), 10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].event, "checkpoint");
    }

    #[test]
    fn test_read_recent_limits() {
        let temp = TempDir::new().unwrap();
        let log = OpsLog::start(temp.path(), "backup");
        for i in 0..5 {
            log.record("step", &i.to_string());
        }
        let recent = read_recent(temp.path(), 2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[1].detail, "4");
    }

    #[test]
    fn test_capture_diagnostics_writes_service_logs() {
        let temp = TempDir::new().unwrap();
        let runtime = ScriptedRuntime::new();
        let log = OpsLog::start(temp.path(), "update");

        let path = log
            .capture_diagnostics(&runtime, &["api".to_string(), "db".to_string()], 50, "api timed out")
            .unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("cause: api timed out"));
        assert!(content.contains("===== api ====="));
        assert!(content.contains("[db] last 50 lines"));
        assert!(path.file_name().unwrap().to_string_lossy().ends_with("-diagnostics.log"));
    }
}
