//! High-level image operations.
//!
//! These functions combine calculations with backend execution: the size
//! probe used by the upscale engine and the renderer, placeholder encoding to
//! a data URI, and the black-frame check applied to refinement output.

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::params::{PlaceholderParams, Quality};
use crate::types::Format;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Read the pixel dimensions of a source image.
pub fn probe(backend: &impl ImageBackend, path: &Path) -> Result<Dimensions> {
    backend.identify(path)
}

/// Encode a WebP placeholder and wrap it in a `data:` URI.
pub fn placeholder_data_uri(
    backend: &impl ImageBackend,
    source: &Path,
    size: u32,
    quality: Quality,
) -> Result<String> {
    let format = Format::Webp;
    let bytes = backend.placeholder(&PlaceholderParams {
        source: source.to_path_buf(),
        size,
        format,
        quality,
    })?;
    Ok(format!(
        "data:{};base64,{}",
        format.mime_type(),
        STANDARD.encode(bytes)
    ))
}

/// Whether the image at `path` is near-black: mean luma at or below `threshold`
/// (a fraction of full brightness).
pub fn is_black_frame(backend: &impl ImageBackend, path: &Path, threshold: f64) -> Result<bool> {
    Ok(backend.mean_brightness(path)? <= threshold)
}
