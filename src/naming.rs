//! File naming and identifier helpers.
//!
//! ## Flat names
//!
//! The upscale stage writes one working copy per source into a single flat
//! directory. Directory separators become underscores:
//! - `booth/cats/neko.png` → `booth_cats_neko.png`
//!
//! ## Stems
//!
//! A file stem is the file name without extension, whitespace replaced by `_`:
//! - `my cat.png` → `my_cat`
//!
//! ## Time-sortable tokens
//!
//! Record identifiers are UUIDv7 values in simple (32 hex digit) form. The
//! first 48 bits are the creation time in milliseconds, so identifiers sort in
//! creation order. Older indexes used 26-character Crockford base32 ULIDs;
//! those are still recognised as stable tokens and kept as-is.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use std::path::{Component, Path};
use std::time::SystemTime;
use uuid::{Builder, Uuid, Version};

/// Relative path from `base` to `full`, joined with `/`.
///
/// Returns `None` when `full` is not under `base`.
pub fn relative_posix(base: &Path, full: &Path) -> Option<String> {
    let rel = full.strip_prefix(base).ok()?;
    let parts: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Flatten a `/`-separated relative path into a single file name.
pub fn flat_name(relative: &str) -> String {
    relative.split('/').collect::<Vec<_>>().join("_")
}

/// File stem with whitespace runs replaced by a single `_`.
pub fn file_stem(path: &str) -> String {
    let name = path.rsplit('/').next().unwrap_or(path);
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    stem.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Insert a suffix before the extension: `a/b.png` + `_tmp1` → `a/b_tmp1.png`.
pub fn with_stem_suffix(path: &Path, suffix: &str) -> std::path::PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{suffix}.{}", ext.to_string_lossy()),
        None => format!("{stem}{suffix}"),
    };
    path.with_file_name(name)
}

const CROCKFORD: &str = "0123456789ABCDEFGHJKMNPQRSTVWXYZ";

fn is_legacy_ulid(s: &str) -> bool {
    s.len() == 26 && s.chars().all(|c| CROCKFORD.contains(c))
}

fn is_uuid_v7(s: &str) -> bool {
    Uuid::try_parse(s).is_ok_and(|u| u.get_version() == Some(Version::SortRand))
}

/// Whether a filename stem already is a stable, time-sortable identifier.
pub fn is_time_sortable_token(s: &str) -> bool {
    is_legacy_ulid(s) || is_uuid_v7(s)
}

/// Mint a time-sortable identifier for `millis` since the Unix epoch.
///
/// The random portion is derived from `seed` (the source path), so minting
/// the same source at the same time always yields the same identifier.
pub fn mint_token(millis: i64, seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    let mut random = [0u8; 10];
    random.copy_from_slice(&digest[..10]);
    let millis = u64::try_from(millis).unwrap_or(0);
    Builder::from_unix_timestamp_millis(millis, &random)
        .into_uuid()
        .simple()
        .to_string()
}

/// ISO-8601 UTC timestamp with millisecond precision (`2024-01-31T09:00:00.000Z`).
pub fn iso_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Milliseconds since the epoch for an RFC 3339 timestamp.
pub fn parse_timestamp_millis(s: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}
