//! Full tree walk used to seed the mirror at startup and to pick up
//! directories that appear while running.

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::WalkDir;

/// Everything found under a root.
#[derive(Debug, Default)]
pub struct ScanResult {
    /// Directories, including the root itself
    pub dirs: Vec<PathBuf>,
    /// Regular files (symlinks to files included)
    pub files: Vec<PathBuf>,
}

/// Walk `root` recursively. Unreadable entries are logged and skipped.
pub fn scan(root: &Path) -> ScanResult {
    let mut result = ScanResult::default();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry during scan: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            result.dirs.push(entry.into_path());
        } else if entry.path().is_file() {
            result.files.push(entry.into_path());
        }
    }

    result
}
