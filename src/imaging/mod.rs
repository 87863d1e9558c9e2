//! Image processing, pure Rust.
//!
//! | Operation | Crate / function |
//! |---|---|
//! | **Identify** (size probe) | `image::image_dimensions` |
//! | **Resize → AVIF/WebP/JPEG/PNG** | Lanczos3 + `image` encoders |
//! | **Placeholder** | `thumbnail` + JPEG + `base64` data URI |
//! | **Black-frame check** | mean Rec. 601 luma |
//! | **Alpha flattening** | composite over white |
//!
//! The module is split into:
//! - **Calculations**: Pure functions for dimension and brightness math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`]
//! - **Operations**: High-level functions combining calculations + backend

pub mod backend;
mod calculations;
pub mod operations;
mod params;
pub mod rust_backend;

pub use backend::{BackendError, Dimensions, ImageBackend};
pub use calculations::fit_within;
pub use operations::{is_black_frame, placeholder_data_uri, probe};
pub use params::{PlaceholderParams, Quality, ResizeParams};
pub use rust_backend::{RustBackend, supported_input_extensions};
