//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines every pixel operation the pipeline
//! needs: identify, resize-and-encode, placeholder encode, brightness
//! measurement and alpha flattening.
//!
//! The production implementation is
//! [`RustBackend`](super::rust_backend::RustBackend), built on the `image`
//! crate and statically linked into the binary.

use super::params::{PlaceholderParams, ResizeParams};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
}

/// Result of an identify operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn max_edge(self) -> u32 {
        self.width.max(self.height)
    }
}

/// Trait for image processing backends.
///
/// `Sync` so a single backend can be shared across rayon workers.
pub trait ImageBackend: Sync {
    /// Get image dimensions without a full decode where the format allows.
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError>;

    /// Resize and encode. The output file appears only after a complete encode.
    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError>;

    /// Encode a tiny preview in memory and return the encoded bytes.
    fn placeholder(&self, params: &PlaceholderParams) -> Result<Vec<u8>, BackendError>;

    /// Mean luma of the image as a fraction of full brightness (0.0-1.0).
    fn mean_brightness(&self, path: &Path) -> Result<f64, BackendError>;

    /// Composite `source` onto an opaque white background, writing `output`.
    fn flatten_alpha(&self, source: &Path, output: &Path) -> Result<(), BackendError>;
}
