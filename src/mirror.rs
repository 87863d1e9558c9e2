//! Incremental copy of the output tree into a public directory.
//!
//! A file is copied when the mirror lacks it, its size differs, or the source
//! is newer by more than a millisecond. Files in the mirror with no
//! counterpart in the source tree are removed. Everything here is
//! best-effort: failures are logged and the mirror is left as far as it got.

use crate::naming::relative_posix;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

const TOLERANCE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub copied: usize,
    pub removed: usize,
    pub failed: usize,
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

fn files(root: &Path) -> impl Iterator<Item = DirEntry> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
}

fn is_stale(src: &Path, dst: &Path) -> bool {
    let (Ok(s), Ok(d)) = (fs::metadata(src), fs::metadata(dst)) else {
        return true;
    };
    if s.len() != d.len() {
        return true;
    }
    match (s.modified(), d.modified()) {
        (Ok(src_time), Ok(dst_time)) => src_time > dst_time + TOLERANCE,
        _ => true,
    }
}

/// Bring `dst_root` in line with `src_root`.
pub fn mirror_dir(src_root: &Path, dst_root: &Path) -> MirrorStats {
    let mut stats = MirrorStats::default();
    if let Err(e) = fs::create_dir_all(dst_root) {
        warn!(dir = %dst_root.display(), "could not create mirror directory: {e}");
        stats.failed += 1;
        return stats;
    }

    for entry in files(src_root) {
        let Some(rel) = relative_posix(src_root, entry.path()) else {
            continue;
        };
        let target = dst_root.join(&rel);
        if !is_stale(entry.path(), &target) {
            continue;
        }
        let result = target
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::copy(entry.path(), &target));
        match result {
            Ok(_) => {
                debug!(file = %rel, "mirrored");
                stats.copied += 1;
            }
            Err(e) => {
                warn!(file = %rel, "mirror copy failed: {e}");
                stats.failed += 1;
            }
        }
    }

    for entry in files(dst_root) {
        let Some(rel) = relative_posix(dst_root, entry.path()) else {
            continue;
        };
        if src_root.join(&rel).exists() {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => stats.removed += 1,
            Err(e) => {
                warn!(file = %rel, "could not prune mirrored file: {e}");
                stats.failed += 1;
            }
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn copies_new_and_prunes_stale() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("public");
        write(&src.join("s/a.webp"), "aaa");
        write(&src.join("l/a.webp"), "aaaa");
        write(&dst.join("s/gone.webp"), "x");

        let stats = mirror_dir(&src, &dst);

        assert_eq!(stats.copied, 2);
        assert_eq!(stats.removed, 1);
        assert_eq!(fs::read_to_string(dst.join("l/a.webp")).unwrap(), "aaaa");
        assert!(!dst.join("s/gone.webp").exists());
    }

    #[test]
    fn second_run_copies_nothing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("public");
        write(&src.join("s/a.webp"), "aaa");

        mirror_dir(&src, &dst);
        let stats = mirror_dir(&src, &dst);
        assert_eq!(stats, MirrorStats::default());
    }

    #[test]
    fn size_change_triggers_copy() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("public");
        write(&src.join("s/a.webp"), "aaa");
        write(&dst.join("s/a.webp"), "old content");

        let stats = mirror_dir(&src, &dst);
        assert_eq!(stats.copied, 1);
        assert_eq!(fs::read_to_string(dst.join("s/a.webp")).unwrap(), "aaa");
    }

    #[test]
    fn hidden_partials_are_not_mirrored() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("public");
        write(&src.join("s/.a.webp.partial"), "half");

        mirror_dir(&src, &dst);
        assert!(!dst.join("s/.a.webp.partial").exists());
    }
}
