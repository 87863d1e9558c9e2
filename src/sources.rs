//! Source image discovery.
//!
//! Walks a directory tree and returns every image file whose extension is in
//! the configured set, in a stable order (file names sorted per directory).
//! Hidden files and directories (leading `.`) are skipped, which also keeps
//! the pipeline's own `.partial` temporaries out of the results.

use crate::naming::relative_posix;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

/// A file under the originals root. Read-only input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub path: PathBuf,
    /// Path relative to the root, `/`-separated. The identity anchor of a record.
    pub relative: String,
    pub modified: SystemTime,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            let ext = ext.to_ascii_lowercase();
            extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(&ext))
        })
        .unwrap_or(false)
}

/// Discover source images under `root`. A missing root yields no sources.
pub fn discover(root: &Path, extensions: &[String]) -> Vec<SourceImage> {
    if !root.is_dir() {
        return Vec::new();
    }
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| has_extension(e.path(), extensions))
        .filter_map(|e| {
            let relative = relative_posix(root, e.path())?;
            let modified = e
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            Some(SourceImage {
                path: e.into_path(),
                relative,
                modified,
            })
        })
        .collect()
}
