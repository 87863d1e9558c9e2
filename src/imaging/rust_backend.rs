//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, TIFF, WebP) | `image` crate (pure Rust decoders) |
//! | Resize | `image::imageops::resize` with `Lanczos3` filter |
//! | Encode → AVIF | `image::codecs::avif::AvifEncoder` (rav1e, speed 6) |
//! | Encode → WebP | `webp::Encoder` (libwebp, lossy at the tier quality) |
//! | Encode → JPEG / PNG | `JpegEncoder::new_with_quality` / `PngEncoder` |
//! | Placeholder | `DynamicImage::thumbnail` + in-memory encode |
//!
//! The `image` crate only ships a lossless WebP encoder, so WebP goes through
//! libwebp instead.

use super::backend::{BackendError, Dimensions, ImageBackend};
use super::calculations::mean_luma_fraction;
use super::params::{PlaceholderParams, ResizeParams};
use crate::atomic::write_atomic;
use crate::types::Format;
use image::codecs::avif::AvifEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;

/// Extensions whose decoders are compiled in.
///
/// AVIF is excluded: the `image` crate's `"avif"` feature only enables the
/// encoder, while `ImageFormat::reading_enabled()` reports `true` for it.
const INPUT_CANDIDATES: &[(&str, ImageFormat)] = &[
    ("jpg", ImageFormat::Jpeg),
    ("jpeg", ImageFormat::Jpeg),
    ("png", ImageFormat::Png),
    ("tif", ImageFormat::Tiff),
    ("tiff", ImageFormat::Tiff),
    ("webp", ImageFormat::WebP),
];

static SUPPORTED_EXTENSIONS: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    INPUT_CANDIDATES
        .iter()
        .filter(|(_, fmt)| fmt.reading_enabled())
        .map(|(ext, _)| *ext)
        .collect()
});

/// Returns the set of image file extensions that have working decoders compiled in.
pub fn supported_input_extensions() -> &'static [&'static str] {
    &SUPPORTED_EXTENSIONS
}

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and decode an image from disk.
fn load_image(path: &Path) -> Result<DynamicImage, BackendError> {
    ImageReader::open(path)
        .map_err(BackendError::Io)?
        .with_guessed_format()
        .map_err(BackendError::Io)?
        .decode()
        .map_err(|e| {
            BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
        })
}

/// Convert to a pixel layout every encoder for `format` accepts.
fn encodable(img: &DynamicImage, format: Format) -> DynamicImage {
    if format != Format::Jpeg && img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

/// Encode into memory.
fn encode(img: &DynamicImage, format: Format, quality: u32) -> Result<Vec<u8>, BackendError> {
    let img = encodable(img, format);
    let mut buf = Cursor::new(Vec::new());
    let quality = quality.clamp(1, 100) as u8;
    let result = match format {
        // speed 6 keeps rav1e throughput reasonable
        Format::Avif => img.write_with_encoder(AvifEncoder::new_with_speed_quality(
            &mut buf, 6, quality,
        )),
        Format::Webp => return encode_webp(&img, quality),
        Format::Jpeg => img.write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality)),
        Format::Png => img.write_with_encoder(PngEncoder::new(&mut buf)),
    };
    result.map_err(|e| BackendError::ProcessingFailed(format!("{format} encode failed: {e}")))?;
    Ok(buf.into_inner())
}

/// Lossy WebP. `img` must be RGB8 or RGBA8, as produced by [`encodable`].
fn encode_webp(img: &DynamicImage, quality: u8) -> Result<Vec<u8>, BackendError> {
    let encoder = webp::Encoder::from_image(img)
        .map_err(|e| BackendError::ProcessingFailed(format!("webp encode failed: {e}")))?;
    Ok(encoder.encode(f32::from(quality)).to_vec())
}

/// Output format for a path, from its extension.
fn format_for_path(path: &Path) -> Result<Format, BackendError> {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .parse()
        .map_err(BackendError::ProcessingFailed)
}

/// Composite RGBA pixels over white.
fn over_white(img: &DynamicImage) -> RgbImage {
    let rgba = img.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let px = rgba.get_pixel(x, y).0;
        let alpha = px[3] as f32 / 255.0;
        let blend = |c: u8| (c as f32 * alpha + 255.0 * (1.0 - alpha)).round() as u8;
        Rgb([blend(px[0]), blend(px[1]), blend(px[2])])
    })
}

impl ImageBackend for RustBackend {
    fn identify(&self, path: &Path) -> Result<Dimensions, BackendError> {
        let (width, height) = image::image_dimensions(path).map_err(|e| {
            BackendError::ProcessingFailed(format!(
                "Failed to read dimensions of {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Dimensions { width, height })
    }

    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
        let img = load_image(&params.source)?;
        let resized = if (img.width(), img.height()) == (params.width, params.height) {
            img
        } else {
            img.resize_exact(params.width, params.height, FilterType::Lanczos3)
        };
        let bytes = encode(&resized, params.format, params.quality.value())?;
        write_atomic(&params.output, &bytes)?;
        Ok(())
    }

    fn placeholder(&self, params: &PlaceholderParams) -> Result<Vec<u8>, BackendError> {
        let img = load_image(&params.source)?;
        let small = img.thumbnail(params.size, params.size);
        encode(&small, params.format, params.quality.value())
    }

    fn mean_brightness(&self, path: &Path) -> Result<f64, BackendError> {
        let img = load_image(path)?;
        Ok(mean_luma_fraction(img.to_rgb8().as_raw()))
    }

    fn flatten_alpha(&self, source: &Path, output: &Path) -> Result<(), BackendError> {
        let img = load_image(source)?;
        let flat = DynamicImage::ImageRgb8(over_white(&img));
        let bytes = encode(&flat, format_for_path(output)?, 100)?;
        write_atomic(output, &bytes)?;
        Ok(())
    }
}
