//! All-or-nothing file writes.
//!
//! Every artifact the pipeline produces is written to a hidden sibling first
//! and renamed into place once complete, so an interrupted run never leaves a
//! truncated file at a final path.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Hidden temporary sibling: `dir/name.ext` → `dir/.name.ext.partial`.
pub fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}

/// Write `bytes` to `path` via a temporary sibling and a rename.
///
/// Parent directories are created as needed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = partial_path(path);
    let result = fs::write(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
