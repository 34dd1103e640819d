//! The shared `.env` file: ordered `KEY=value` entries with comments and
//! blank lines kept verbatim.
//!
//! The file on disk is the only source of truth. Callers load it, mutate
//! it, and write it back within one operation; nothing here caches values.

use crate::error::{Result, StackrError};
use crate::io;
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Closes every per-stack section opened by [`section_marker`].
pub const CLOSING_MARKER: &str = "##########################";

/// Variables provided by stackr itself; never required from the env file.
const STORAGE_VARS: &[&str] = &[
    "STACK_STORAGE_HDD",
    "STACK_STORAGE_SSD",
    "STORAGE_HDD",
    "STORAGE_SSD",
];

pub fn section_marker(stack: &str) -> String {
    format!("###### {} vars #####", stack.to_lowercase())
}

pub fn is_storage_var(name: &str) -> bool {
    STORAGE_VARS.contains(&name)
}

// ---------------------------------------------------------------------------
// EnvFile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry { key: String, raw: String },
    Other(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvFile {
    lines: Vec<Line>,
}

impl EnvFile {
    pub fn parse(content: &str) -> Self {
        let normalized = content.replace("\r\n", "\n");
        let mut body = normalized.as_str();
        if let Some(stripped) = body.strip_suffix('\n') {
            body = stripped;
        }
        if body.is_empty() {
            return Self::default();
        }
        let lines = body
            .split('\n')
            .map(|line| match entry_key(line) {
                Some(key) => Line::Entry {
                    key,
                    raw: line.to_string(),
                },
                None => Line::Other(line.to_string()),
            })
            .collect();
        Self { lines }
    }

    /// Load from disk. A missing file is an empty table.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(StackrError::EnvFileUnreadable {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }

    /// Raw (unquoted-as-written) value for `key`, trimmed.
    pub fn get_raw(&self, key: &str) -> Option<&str> {
        self.lines.iter().find_map(|line| match line {
            Line::Entry { key: k, raw } if k == key => Some(raw_value(raw).trim()),
            _ => None,
        })
    }

    /// Parsed value for `key` (quotes stripped).
    pub fn get(&self, key: &str) -> Option<String> {
        self.get_raw(key).map(unquote)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.lines
            .iter()
            .any(|line| matches!(line, Line::Entry { key: k, .. } if k == key))
    }

    /// Set `key` to `value`, returning the previous raw value trimmed (empty
    /// if the key was absent). The first matching line is rewritten in place
    /// and later duplicates dropped; a new key is appended after a blank
    /// separator line.
    pub fn set(&mut self, key: &str, value: &str) -> String {
        let mut previous = None;
        let mut lines = Vec::with_capacity(self.lines.len() + 2);
        for line in self.lines.drain(..) {
            match line {
                Line::Entry { key: k, raw } if k == key => {
                    if previous.is_none() {
                        previous = Some(raw_value(&raw).trim().to_string());
                        let prefix = if raw.trim_start().starts_with("export ") {
                            "export "
                        } else {
                            ""
                        };
                        lines.push(Line::Entry {
                            key: k,
                            raw: format!("{prefix}{key}={value}"),
                        });
                    }
                }
                other => lines.push(other),
            }
        }
        if previous.is_none() {
            if matches!(lines.last(), Some(Line::Other(l)) if !l.trim().is_empty())
                || matches!(lines.last(), Some(Line::Entry { .. }))
            {
                lines.push(Line::Other(String::new()));
            }
            lines.push(Line::Entry {
                key: key.to_string(),
                raw: format!("{key}={value}"),
            });
        }
        self.lines = lines;
        previous.unwrap_or_default()
    }

    /// All entries with quotes stripped. Later duplicates win.
    pub fn values(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for line in &self.lines {
            if let Line::Entry { key, raw } = line {
                out.insert(key.clone(), unquote(raw_value(raw).trim()));
            }
        }
        out
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { raw, .. } | Line::Other(raw) => out.push_str(raw),
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        io::atomic_write(path, self.render().as_bytes())
    }
}

fn entry_key(line: &str) -> Option<String> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, _) = trimmed.split_once('=')?;
    let key = key.trim();
    let key = key.strip_prefix("export ").map(str::trim).unwrap_or(key);
    if key.is_empty() {
        return None;
    }
    Some(key.to_string())
}

fn raw_value(line: &str) -> &str {
    line.split_once('=').map(|(_, v)| v).unwrap_or("")
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    for quote in ['"', '\''] {
        if raw.len() >= 2 && raw.starts_with(quote) && raw.ends_with(quote) {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    // Unquoted values may carry a trailing ` # comment`.
    match raw.find(" #") {
        Some(idx) => raw[..idx].trim_end().to_string(),
        None => raw.to_string(),
    }
}

// ---------------------------------------------------------------------------
// File-level operations
// ---------------------------------------------------------------------------

/// Byte-exact copy of the env file plus its permission bits.
#[derive(Debug, Clone)]
pub struct Snapshot {
    path: PathBuf,
    data: Vec<u8>,
    mode: u32,
}

impl Snapshot {
    /// Fails if the file cannot be read; a deploy must never start without a
    /// restore point.
    pub fn capture(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| StackrError::EnvFileUnreadable {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mode = io::file_mode(path).unwrap_or(io::DEFAULT_FILE_MODE);
        Ok(Self {
            path: path.to_path_buf(),
            data,
            mode,
        })
    }

    pub fn restore(&self) -> Result<()> {
        io::atomic_write_mode(&self.path, &self.data, self.mode)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }
}

/// Set `key=value` in the file at `path` and return the previous value.
pub fn update(path: &Path, key: &str, value: &str) -> Result<String> {
    let content = std::fs::read_to_string(path).map_err(|e| StackrError::EnvFileUnreadable {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut file = EnvFile::parse(&content);
    let previous = file.set(key, value);
    file.save(path)?;
    Ok(previous)
}

/// Parsed values of the file at `path`; a missing file yields no values.
pub fn read_values(path: &Path) -> Result<BTreeMap<String, String>> {
    Ok(EnvFile::load(path)?.values())
}

// ---------------------------------------------------------------------------
// Per-stack sections and variable references
// ---------------------------------------------------------------------------

/// Add `KEY=` lines for `keys` to the stack's section, creating the section
/// at the end of the content if needed. Returns `None` when nothing changed.
pub fn add_stack_vars(content: &str, stack: &str, keys: &[String]) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let marker = section_marker(stack);

    let Some(start) = content.find(&marker) else {
        let mut out = String::new();
        let trimmed = content.trim_end_matches('\n');
        if !trimmed.is_empty() {
            out.push_str(trimmed);
            out.push_str("\n\n");
        }
        out.push_str(&marker);
        out.push('\n');
        for key in dedup(keys) {
            out.push_str(&format!("{key}=\n"));
        }
        out.push_str(CLOSING_MARKER);
        out.push('\n');
        return Some(out);
    };

    let section_start = start + marker.len();
    let remainder = &content[section_start..];
    let end = remainder.find(CLOSING_MARKER)?;
    let body = &remainder[..end];

    let mut existing: HashSet<String> = body.lines().filter_map(entry_key).collect();
    let to_insert: Vec<&String> = keys
        .iter()
        .filter(|k| existing.insert((*k).clone()))
        .collect();
    if to_insert.is_empty() {
        return None;
    }

    let mut out = String::with_capacity(content.len() + to_insert.len() * 16);
    out.push_str(&content[..section_start]);
    out.push('\n');
    out.push_str(body.trim_start_matches('\n'));
    if !out.ends_with('\n') {
        out.push('\n');
    }
    for key in to_insert {
        out.push_str(&format!("{key}=\n"));
    }
    out.push_str(&remainder[end..]);
    Some(out)
}

fn dedup(keys: &[String]) -> Vec<&String> {
    let mut seen = HashSet::new();
    keys.iter().filter(|k| seen.insert(k.as_str())).collect()
}

static VAR_REF_RE: OnceLock<Regex> = OnceLock::new();

fn var_ref_re() -> &'static Regex {
    VAR_REF_RE
        .get_or_init(|| Regex::new(r"(\$+)\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Unique `${NAME}` references in order of first appearance. Escaped
/// `$${NAME}` references are ignored.
pub fn required_vars(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in var_ref_re().captures_iter(text) {
        // `$$` is compose's escape for a literal `$`.
        if caps[1].len() % 2 == 0 {
            continue;
        }
        let name = &caps[2];
        if seen.insert(name.to_string()) {
            out.push(name.to_string());
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "# registry settings\nREGISTRY=ghcr.io\n\nWEB_IMAGE_TAG=v1.0.0\nDB_PASS=\"s3cret\"\n";

    #[test]
    fn parse_render_is_byte_exact() {
        let file = EnvFile::parse(SAMPLE);
        assert_eq!(file.render(), SAMPLE);
    }

    #[test]
    fn set_replaces_in_place_and_returns_previous() {
        let mut file = EnvFile::parse(SAMPLE);
        let prev = file.set("WEB_IMAGE_TAG", "v1.1.0");
        assert_eq!(prev, "v1.0.0");
        assert_eq!(
            file.render(),
            "# registry settings\nREGISTRY=ghcr.io\n\nWEB_IMAGE_TAG=v1.1.0\nDB_PASS=\"s3cret\"\n"
        );
    }

    #[test]
    fn set_appends_new_key_after_blank_line() {
        let mut file = EnvFile::parse("A=1\n");
        let prev = file.set("B", "2");
        assert_eq!(prev, "");
        assert_eq!(file.render(), "A=1\n\nB=2\n");
    }

    #[test]
    fn set_collapses_duplicate_keys() {
        let mut file = EnvFile::parse("A=1\nB=x\nA=2\n");
        assert_eq!(file.set("A", "3"), "1");
        assert_eq!(file.render(), "A=3\nB=x\n");
    }

    #[test]
    fn crlf_is_normalized() {
        let mut file = EnvFile::parse("A=1\r\nB=2\r\n");
        file.set("B", "3");
        assert_eq!(file.render(), "A=1\nB=3\n");
    }

    #[test]
    fn values_strip_quotes_and_export() {
        let file = EnvFile::parse("export A=1\nB='two'\nC=\"three\"\nD=four # note\n# E=no\n");
        let values = file.values();
        assert_eq!(values.get("A").map(String::as_str), Some("1"));
        assert_eq!(values.get("B").map(String::as_str), Some("two"));
        assert_eq!(values.get("C").map(String::as_str), Some("three"));
        assert_eq!(values.get("D").map(String::as_str), Some("four"));
        assert!(!values.contains_key("E"));
    }

    #[test]
    fn update_file_writes_and_returns_previous() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, SAMPLE).unwrap();
        let prev = update(&path, "WEB_IMAGE_TAG", "v2.0.0").unwrap();
        assert_eq!(prev, "v1.0.0");
        let values = read_values(&path).unwrap();
        assert_eq!(values["WEB_IMAGE_TAG"], "v2.0.0");
        assert_eq!(values["DB_PASS"], "s3cret");
    }

    #[test]
    fn update_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        assert!(update(&dir.path().join(".env"), "A", "1").is_err());
    }

    #[test]
    fn snapshot_restore_is_byte_exact() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, SAMPLE).unwrap();

        let snap = Snapshot::capture(&path).unwrap();
        update(&path, "WEB_IMAGE_TAG", "broken").unwrap();
        update(&path, "NEW_KEY", "x").unwrap();
        snap.restore().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), SAMPLE.as_bytes());
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_restores_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(&path, "A=1\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        let snap = Snapshot::capture(&path).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        snap.restore().unwrap();
        assert_eq!(io::file_mode(&path), Some(0o640));
    }

    #[test]
    fn snapshot_of_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let err = Snapshot::capture(&dir.path().join(".env")).unwrap_err();
        assert!(matches!(err, StackrError::EnvFileUnreadable { .. }));
    }

    #[test]
    fn add_stack_vars_creates_section() {
        let out = add_stack_vars("A=1\n", "Web", &["X".into(), "Y".into()]).unwrap();
        assert_eq!(
            out,
            "A=1\n\n###### web vars #####\nX=\nY=\n##########################\n"
        );
    }

    #[test]
    fn add_stack_vars_inserts_only_missing_keys() {
        let content = "###### web vars #####\nX=1\n##########################\nZ=9\n";
        let out = add_stack_vars(content, "web", &["X".into(), "Y".into()]).unwrap();
        assert_eq!(
            out,
            "###### web vars #####\nX=1\nY=\n##########################\nZ=9\n"
        );
        assert!(add_stack_vars(&out, "web", &["X".into(), "Y".into()]).is_none());
    }

    #[test]
    fn required_vars_ignores_escaped_refs() {
        let text = "image: app:${WEB_IMAGE_TAG}\ncmd: echo $${NOT_ME} ${DB_PASS}${WEB_IMAGE_TAG}\n";
        assert_eq!(required_vars(text), vec!["WEB_IMAGE_TAG", "DB_PASS"]);
        assert_eq!(required_vars("${A}${B}"), vec!["A", "B"]);
    }
}
