//! Environment file handling
//!
//! The live `.env` is an ordered KEY=value store. Merging a release template
//! into it only appends keys the live file lacks; a value already present is
//! never rewritten, even when the template default differs.

use crate::error::{KeelError, Result};
use crate::state::atomic_write_str;
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::info;

/// Placeholder value left in templates for install-time secrets
pub const SECRET_PLACEHOLDER: &str = "__GENERATE__";

/// One line of an environment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvLine {
    /// KEY=value, `raw` keeps the original text for byte-exact rewrites
    Entry { key: String, value: String, raw: String },
    /// Comments, blank lines, anything that is not an assignment
    Other(String),
}

/// Ordered key/value store with line-level provenance
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentFile {
    lines: Vec<EnvLine>,
    trailing_newline: bool,
}

impl EnvironmentFile {
    pub fn parse(content: &str) -> Result<Self> {
        let mut lines = Vec::new();
        let mut seen = HashSet::new();

        for (idx, raw) in content.lines().enumerate() {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                lines.push(EnvLine::Other(raw.to_string()));
                continue;
            }

            let assignment = trimmed.strip_prefix("export ").unwrap_or(trimmed);
            let Some((key, value)) = assignment.split_once('=') else {
                return Err(KeelError::validation(format!(
                    "line {}: expected KEY=value, got '{}'",
                    idx + 1,
                    raw
                )));
            };

            let key = key.trim();
            if !is_valid_key(key) {
                return Err(KeelError::validation(format!("line {}: invalid key '{}'", idx + 1, key)));
            }
            if !seen.insert(key.to_string()) {
                return Err(KeelError::validation(format!("line {}: duplicate key '{}'", idx + 1, key)));
            }

            lines.push(EnvLine::Entry {
                key: key.to_string(),
                value: unquote(value.trim()).to_string(),
                raw: raw.to_string(),
            });
        }

        Ok(Self {
            lines,
            trailing_newline: content.is_empty() || content.ends_with('\n'),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self {
                lines: Vec::new(),
                trailing_newline: true,
            });
        }
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_str(path, &self.render())?;
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(|line| match line {
                EnvLine::Entry { raw, .. } => raw.as_str(),
                EnvLine::Other(raw) => raw.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n");
        if self.trailing_newline && !self.lines.is_empty() {
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            EnvLine::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Keys in file order
    pub fn keys(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                EnvLine::Entry { key, .. } => Some(key.as_str()),
                EnvLine::Other(_) => None,
            })
            .collect()
    }

    pub fn entries(&self) -> Vec<(&str, &str)> {
        self.lines
            .iter()
            .filter_map(|line| match line {
                EnvLine::Entry { key, value, .. } => Some((key.as_str(), value.as_str())),
                EnvLine::Other(_) => None,
            })
            .collect()
    }

    /// Append a new key; existing keys are refused
    pub fn append(&mut self, key: &str, value: &str, provenance: Option<&str>) -> Result<()> {
        if !is_valid_key(key) {
            return Err(KeelError::validation(format!("invalid key '{}'", key)));
        }
        if self.contains(key) {
            return Err(KeelError::validation(format!(
                "key '{}' already present; existing keys are never overwritten",
                key
            )));
        }
        if let Some(note) = provenance {
            self.lines.push(EnvLine::Other(format!("# {}", note)));
        }
        self.lines.push(EnvLine::Entry {
            key: key.to_string(),
            value: value.to_string(),
            raw: format!("{}={}", key, value),
        });
        self.trailing_newline = true;
        Ok(())
    }

    /// Keys still holding `placeholder`
    pub fn unresolved(&self, placeholder: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(_, value)| *value == placeholder)
            .map(|(key, _)| key.to_string())
            .collect()
    }

    /// Replace values equal to `placeholder`; resolved values are left alone
    pub fn resolve_placeholders<F>(&mut self, placeholder: &str, mut generate: F) -> usize
    where
        F: FnMut(&str) -> String,
    {
        let mut resolved = 0;
        for line in &mut self.lines {
            if let EnvLine::Entry { key, value, raw } = line {
                if value == placeholder {
                    let new_value = generate(key);
                    *raw = format!("{}={}", key, new_value);
                    *value = new_value;
                    resolved += 1;
                }
            }
        }
        resolved
    }
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}

/// Append every template key missing from `live`. Returns the number of keys added.
pub fn merge(template: &EnvironmentFile, live: &mut EnvironmentFile) -> usize {
    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let mut added = 0;

    for (key, value) in template.entries() {
        if live.contains(key) {
            continue;
        }
        let note = format!("added by keel merge {} from template", stamp);
        if live.append(key, value, Some(&note)).is_ok() {
            added += 1;
        }
    }

    added
}

/// Merge a template file into the live file on disk
pub fn merge_files(template_path: &Path, live_path: &Path) -> Result<usize> {
    let template = EnvironmentFile::load(template_path)?;
    let mut live = EnvironmentFile::load(live_path)?;

    let added = merge(&template, &mut live);
    if added > 0 {
        live.save(live_path)?;
    }
    info!(
        "Environment merge: {} key(s) added to {}",
        added,
        live_path.display()
    );
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_skips_comments_and_blanks() {
        let env = EnvironmentFile::parse("# header\n\nA=1\nexport B=\"two\"\nC='3'\n").unwrap();
        assert_eq!(env.keys(), vec!["A", "B", "C"]);
        assert_eq!(env.get("B"), Some("two"));
        assert_eq!(env.get("C"), Some("3"));
    }

    #[test]
    fn test_render_is_byte_exact() {
        let content = "# comment\nA=1\n\nexport  B = spaced \n";
        let env = EnvironmentFile::parse(content).unwrap();
        assert_eq!(env.render(), content);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        assert!(EnvironmentFile::parse("A=1\nA=2\n").is_err());
    }

    #[test]
    fn test_merge_adds_only_missing_keys() {
        let template = EnvironmentFile::parse("A=t1\nB=t2\nC=t3\nD=t4\nE=t5\n").unwrap();
        let mut live = EnvironmentFile::parse("A=live1\nC=live3\nE=live5\n").unwrap();

        let added = merge(&template, &mut live);

        assert_eq!(added, 2);
        assert_eq!(live.get("A"), Some("live1"));
        assert_eq!(live.get("C"), Some("live3"));
        assert_eq!(live.get("E"), Some("live5"));
        assert_eq!(live.get("B"), Some("t2"));
        assert_eq!(live.get("D"), Some("t4"));
        assert!(live.render().contains("# added by keel merge"));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let template = EnvironmentFile::parse("A=1\nB=2\n").unwrap();
        let mut live = EnvironmentFile::parse("A=x\n").unwrap();

        assert_eq!(merge(&template, &mut live), 1);
        let after_first = live.render();
        assert_eq!(merge(&template, &mut live), 0);
        assert_eq!(live.render(), after_first);
    }

    #[test]
    fn test_append_refuses_existing_key() {
        let mut live = EnvironmentFile::parse("A=1\n").unwrap();
        assert!(live.append("A", "2", None).is_err());
        assert_eq!(live.get("A"), Some("1"));
    }

    #[test]
    fn test_resolve_placeholders_only_touches_unresolved() {
        let mut env = EnvironmentFile::parse("DB_PASSWORD=__GENERATE__\nAPI_KEY=kept\nJWT=__GENERATE__\n").unwrap();
        assert_eq!(env.unresolved(SECRET_PLACEHOLDER).len(), 2);

        let resolved = env.resolve_placeholders(SECRET_PLACEHOLDER, |key| format!("gen-{}", key));
        assert_eq!(resolved, 2);
        assert_eq!(env.get("API_KEY"), Some("kept"));
        assert_eq!(env.get("JWT"), Some("gen-JWT"));

        // Second pass is a no-op
        assert_eq!(env.resolve_placeholders(SECRET_PLACEHOLDER, |_| unreachable!()), 0);
    }

    #[test]
    fn test_merge_files_leaves_untouched_file_alone() {
        let temp = TempDir::new().unwrap();
        let template = temp.path().join("env.template");
        let live = temp.path().join(".env");
        fs::write(&template, "A=1\n").unwrap();
        fs::write(&live, "A=custom\n").unwrap();

        assert_eq!(merge_files(&template, &live).unwrap(), 0);
        assert_eq!(fs::read_to_string(&live).unwrap(), "A=custom\n");
    }
}
