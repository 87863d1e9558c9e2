//! Index writing and variant garbage collection.
//!
//! The full index is sorted ascending by `sortKey` (legacy records without one
//! fall back to their parsed `createdAt`), ties broken by `id`. The slim
//! public index is the same list projected to [`SlimIndexEntry`] and reversed,
//! newest first.
//!
//! Both files are pretty-printed with a trailing newline and written through
//! [`write_atomic`], so an interrupted run leaves the previous file intact.

use crate::atomic::write_atomic;
use crate::types::{AssetRecord, SlimIndexEntry, Tier};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Malformed index {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Read an index file. A missing file is an empty index.
pub fn load_records(path: &Path) -> Result<Vec<AssetRecord>, IndexError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(IndexError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&content).map_err(|source| IndexError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Stable sort: ascending sort key, then `id`.
pub fn sort_records(records: &mut [AssetRecord]) {
    records.sort_by(|a, b| {
        a.effective_sort_key()
            .cmp(&b.effective_sort_key())
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Slim projection of an already sorted index, newest first.
pub fn slim_entries(sorted: &[AssetRecord]) -> Vec<SlimIndexEntry> {
    sorted.iter().rev().map(SlimIndexEntry::from_record).collect()
}

fn write_json<T: serde::Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), IndexError> {
    let mut json = serde_json::to_string_pretty(value).map_err(|source| IndexError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    json.push('\n');
    write_atomic(path, json.as_bytes()).map_err(|source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn write_index(path: &Path, sorted: &[AssetRecord]) -> Result<(), IndexError> {
    write_json(path, sorted)
}

pub fn write_slim_index(path: &Path, entries: &[SlimIndexEntry]) -> Result<(), IndexError> {
    write_json(path, entries)
}

/// Remove tier files whose stem is not a kept identifier.
///
/// Sweeps only the four tier directories directly under `output_dir`;
/// subdirectories are left alone. Removal failures are logged and skipped.
/// Returns the number of files removed.
pub fn collect_garbage(output_dir: &Path, kept_ids: &HashSet<String>) -> usize {
    let mut removed = 0;
    for tier in Tier::ALL {
        let dir = output_dir.join(tier.dir_name());
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            if kept_ids.contains(&stem) {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {
                    debug!(path = %path.display(), "removed orphaned variant");
                    removed += 1;
                }
                Err(e) => warn!(path = %path.display(), "could not remove orphaned variant: {e}"),
            }
        }
    }
    removed
}
