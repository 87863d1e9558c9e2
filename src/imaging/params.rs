//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the renderer (which decides what variants to create) and
//! the [`backend`](super::backend) (which does the pixel work), so tests can
//! swap in a recording mock without changing rendering logic.

use crate::types::Format;
use std::path::PathBuf;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(80)
    }
}

/// Parameters for a resize-and-encode operation.
///
/// `width` × `height` are the exact output dimensions; the caller has already
/// applied the fit-inside and no-enlargement rules.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeParams {
    pub source: PathBuf,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub quality: Quality,
}

/// Parameters for an in-memory placeholder encode.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderParams {
    pub source: PathBuf,
    /// Longest edge of the placeholder.
    pub size: u32,
    pub format: Format,
    pub quality: Quality,
}
