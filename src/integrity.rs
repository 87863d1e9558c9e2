//! Integrity guard for the hand-curated canonical index.
//!
//! The pipeline reads the canonical file and must never change it. A
//! [`Snapshot`] hashes it when the run starts; [`Snapshot::verify`] hashes it
//! again once every output is written and fails if a file that existed at the
//! start now has different bytes (or has disappeared).

use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("canonical metadata {path} changed during the run (sha256 {before} -> {after})")]
    Changed {
        path: PathBuf,
        before: String,
        after: String,
    },
}

/// SHA-256 hash of a file's contents as hex, or `None` when it does not exist.
pub fn hash_file(path: &Path) -> Result<Option<String>, IntegrityError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(format!("{:x}", Sha256::digest(&bytes)))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(IntegrityError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Hash of the canonical file taken at the start of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    path: PathBuf,
    digest: Option<String>,
}

impl Snapshot {
    pub fn take(path: &Path) -> Result<Self, IntegrityError> {
        Ok(Self {
            path: path.to_path_buf(),
            digest: hash_file(path)?,
        })
    }

    pub fn existed(&self) -> bool {
        self.digest.is_some()
    }

    /// Re-hash and compare. A file absent at the start is not checked.
    pub fn verify(&self) -> Result<(), IntegrityError> {
        let Some(before) = &self.digest else {
            return Ok(());
        };
        let after = hash_file(&self.path)?.unwrap_or_else(|| "<missing>".to_string());
        if &after == before {
            Ok(())
        } else {
            Err(IntegrityError::Changed {
                path: self.path.clone(),
                before: before.clone(),
                after,
            })
        }
    }
}
