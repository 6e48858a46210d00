//! In-memory metadata for one tracked file.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::crypto::{FileKey, Identity};

/// One tracked source file and its encrypted mirror.
///
/// Each record owns a freshly generated key, so two records never share a
/// key even when their content is identical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Path in the source tree at time of ingestion
    pub source_path: PathBuf,
    /// Path relative to the source root, `/`-separated
    pub relative_name: String,
    /// hash(relative_name ‖ content)
    pub identity: Identity,
    /// Per-record symmetric key, never persisted
    pub key: FileKey,
    /// Plaintext length in bytes
    pub size: u64,
}

impl FileRecord {
    /// Build a record around a key that was generated for, and has only
    /// ever encrypted, this file's content.
    pub fn new(
        source_path: PathBuf,
        relative_name: String,
        identity: Identity,
        key: FileKey,
        size: u64,
    ) -> Self {
        Self {
            source_path,
            relative_name,
            identity,
            key,
            size,
        }
    }

    /// Last component of the relative name, used as a download filename.
    pub fn file_name(&self) -> &str {
        self.relative_name
            .rsplit('/')
            .next()
            .unwrap_or(&self.relative_name)
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            hash: self.identity.to_string(),
            name: self.relative_name.clone(),
            size: self.size,
            key: self.key.encode(),
        }
    }
}

/// Wire projection of a record as listed over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileSummary {
    pub hash: String,
    pub name: String,
    pub size: u64,
    pub key: String,
}

/// Name of `path` relative to `root`, with `/` separators.
///
/// Returns `None` when `path` is not under `root` or is the root itself.
pub fn relative_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str, content: &[u8]) -> FileRecord {
        let identity = Identity::compute(name, content).unwrap();
        FileRecord::new(
            PathBuf::from("/src").join(name),
            name.to_string(),
            identity,
            FileKey::generate().unwrap(),
            content.len() as u64,
        )
    }

    #[test]
    fn test_records_never_share_keys() {
        let a = record("a.txt", b"same");
        let b = record("a.txt", b"same");
        assert_eq!(a.identity, b.identity);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn test_file_name() {
        assert_eq!(record("a.txt", b"").file_name(), "a.txt");
        assert_eq!(record("docs/notes/b.md", b"").file_name(), "b.md");
    }

    #[test]
    fn test_summary_serialization() {
        let r = record("docs/a.txt", b"hello");
        let json = serde_json::to_value(r.summary()).unwrap();

        assert_eq!(json["hash"], r.identity.as_str());
        assert_eq!(json["name"], "docs/a.txt");
        assert_eq!(json["size"], 5);
        assert_eq!(json["key"], r.key.encode());
    }

    #[test]
    fn test_relative_name() {
        let root = Path::new("/data/src");
        assert_eq!(
            relative_name(root, Path::new("/data/src/a.txt")).as_deref(),
            Some("a.txt")
        );
        assert_eq!(
            relative_name(root, Path::new("/data/src/x/y/z.bin")).as_deref(),
            Some("x/y/z.bin")
        );
        assert_eq!(relative_name(root, Path::new("/data/src")), None);
        assert_eq!(relative_name(root, Path::new("/data/other/a.txt")), None);
    }
}
