//! Pipeline configuration.
//!
//! Loaded from a single TOML file (default `stillpress.toml`). Every key has a
//! stock default, so an empty or missing file is a valid configuration. Unknown
//! keys are rejected to catch typos early.
//!
//! ## Configuration Options
//!
//! ```toml
//! [paths]
//! originals_dir = "originals/originals_lowres"
//! upscaled_dir = "originals/originals_upscaled"
//! output_dir = "src/assets"
//! public_base_path = "/assets"
//! # public_mirror_dir = "public/assets"
//! canonical_index = "src/data/images.json"
//! generated_index = "src/data/images.generated.json"
//! slim_index = "public/data/images.slim.json"
//!
//! [images]
//! small_width = 236          # s2x defaults to 2 × small_width
//! large_width = 1200         # l2x defaults to 2 × large_width
//! quality_small = 72
//! quality_large = 82
//! formats = ["avif", "webp"]
//! rebuild_if_newer = true
//! mtime_tolerance_ms = 1
//!
//! [images.lqip]
//! enabled = false
//! size = 24
//! quality = 50
//!
//! [index]
//! prune_missing_sources = false
//! garbage_collect = false
//!
//! [upscale]
//! enabled = true
//! target = 2000
//! easy_threshold = 700
//! hard_threshold = 250
//!
//! [processing]
//! # max_processes = 4
//! ```
//!
//! See [`stock_config_toml`] for the fully commented file.

use crate::imaging::supported_input_extensions;
use crate::types::{Format, Tier};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stillpress.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Input, intermediate and output locations.
    pub paths: PathsConfig,
    /// Variant rendering settings (tier widths, quality, formats, rebuild policy).
    pub images: ImagesConfig,
    /// Index writing and cleanup policy.
    pub index: IndexConfig,
    /// Upscale decision engine settings.
    pub upscale: UpscaleConfig,
    /// Parallel encoding settings.
    pub processing: ProcessingConfig,
}

impl PipelineConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.images.validate()?;
        self.upscale.validate()?;
        Ok(())
    }
}

/// Filesystem layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    /// Recursively scanned tree of original images.
    pub originals_dir: PathBuf,
    /// Flat directory of pre-processed working copies.
    pub upscaled_dir: PathBuf,
    /// Root of the size-tier directories (`s`, `s2x`, `l`, `l2x`).
    pub output_dir: PathBuf,
    /// URL prefix that maps to `output_dir`.
    pub public_base_path: String,
    /// Optional directory kept as an incremental copy of `output_dir`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_mirror_dir: Option<PathBuf>,
    /// Hand-curated metadata file. Read, never written.
    pub canonical_index: PathBuf,
    /// Generated full index.
    pub generated_index: PathBuf,
    /// Generated slim public index.
    pub slim_index: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            originals_dir: PathBuf::from("originals/originals_lowres"),
            upscaled_dir: PathBuf::from("originals/originals_upscaled"),
            output_dir: PathBuf::from("src/assets"),
            public_base_path: "/assets".to_string(),
            public_mirror_dir: None,
            canonical_index: PathBuf::from("src/data/images.json"),
            generated_index: PathBuf::from("src/data/images.generated.json"),
            slim_index: PathBuf::from("public/data/images.slim.json"),
        }
    }
}

/// Variant rendering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    pub small_width: u32,
    /// Defaults to twice `small_width` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub small_2x: Option<u32>,
    pub large_width: u32,
    /// Defaults to twice `large_width` when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_2x: Option<u32>,
    /// Encode quality for the `s` and `s2x` tiers (1-100).
    pub quality_small: u32,
    /// Encode quality for the `l` and `l2x` tiers (1-100).
    pub quality_large: u32,
    /// Output formats, in the order they are written into `sizes`.
    pub formats: Vec<String>,
    /// Re-encode when the source is newer than an existing variant.
    pub rebuild_if_newer: bool,
    /// Source must be newer than the variant by more than this to count.
    pub mtime_tolerance_ms: u64,
    /// Input extensions picked up by the renderer (lowercase, no dot).
    pub extensions: Vec<String>,
    pub lqip: LqipConfig,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            small_width: 236,
            small_2x: None,
            large_width: 1200,
            large_2x: None,
            quality_small: 72,
            quality_large: 82,
            formats: vec!["avif".to_string(), "webp".to_string()],
            rebuild_if_newer: true,
            mtime_tolerance_ms: 1,
            extensions: ["jpg", "jpeg", "png", "webp", "tif", "tiff"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            lqip: LqipConfig::default(),
        }
    }
}

impl ImagesConfig {
    /// Bounding box edge for a tier.
    pub fn width(&self, tier: Tier) -> u32 {
        match tier {
            Tier::S => self.small_width,
            Tier::S2x => self.small_2x.unwrap_or(self.small_width * 2),
            Tier::L => self.large_width,
            Tier::L2x => self.large_2x.unwrap_or(self.large_width * 2),
        }
    }

    pub fn quality(&self, tier: Tier) -> u32 {
        if tier.is_small() {
            self.quality_small
        } else {
            self.quality_large
        }
    }

    /// Parsed output formats, duplicates removed, config order kept.
    pub fn output_formats(&self) -> Result<Vec<Format>, ConfigError> {
        let mut formats = Vec::new();
        for name in &self.formats {
            let format: Format = name.parse().map_err(ConfigError::Validation)?;
            if !formats.contains(&format) {
                formats.push(format);
            }
        }
        Ok(formats)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, quality) in [
            ("images.quality_small", self.quality_small),
            ("images.quality_large", self.quality_large),
            ("images.lqip.quality", self.lqip.quality),
        ] {
            if !(1..=100).contains(&quality) {
                return Err(ConfigError::Validation(format!("{key} must be 1-100")));
            }
        }
        if Tier::ALL.iter().any(|&tier| self.width(tier) == 0) {
            return Err(ConfigError::Validation(
                "images tier widths must be non-zero".into(),
            ));
        }
        if self.lqip.size == 0 {
            return Err(ConfigError::Validation(
                "images.lqip.size must be non-zero".into(),
            ));
        }
        if self.output_formats()?.is_empty() {
            return Err(ConfigError::Validation(
                "images.formats must not be empty".into(),
            ));
        }
        validate_extensions("images.extensions", &self.extensions)
    }
}

/// Every input extension must have a decoder compiled in.
fn validate_extensions(key: &str, extensions: &[String]) -> Result<(), ConfigError> {
    let supported = supported_input_extensions();
    match extensions
        .iter()
        .find(|ext| !supported.contains(&ext.to_ascii_lowercase().as_str()))
    {
        Some(ext) => Err(ConfigError::Validation(format!(
            "{key}: cannot decode \"{ext}\" (supported: {})",
            supported.join(", ")
        ))),
        None => Ok(()),
    }
}

/// Low-quality placeholder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LqipConfig {
    pub enabled: bool,
    /// Longest edge of the placeholder in pixels.
    pub size: u32,
    pub quality: u32,
}

impl Default for LqipConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size: 24,
            quality: 50,
        }
    }
}

/// Index writing policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexConfig {
    /// Drop records whose source file no longer exists.
    pub prune_missing_sources: bool,
    /// Delete variant files whose identifier is not in the written index.
    pub garbage_collect: bool,
}

/// Upscale decision engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpscaleConfig {
    /// When false the renderer reads straight from `originals_dir`.
    pub enabled: bool,
    /// Longest edge considered large enough; no upscaling at or above it.
    pub target: u32,
    /// At or above this, a single 2× pass suffices.
    pub easy_threshold: u32,
    /// At or below this, two chained 2× passes plus refinement.
    pub hard_threshold: u32,
    /// Source extensions considered (lowercase, no dot).
    pub extensions: Vec<String>,
    /// Append-only TSV audit log.
    pub audit_log: PathBuf,
    pub waifu2x_path: PathBuf,
    pub waifu2x_model: String,
    pub waifu2x_tile: u32,
    pub realesrgan_path: PathBuf,
    /// Reject a refinement pass whose output is near-black.
    pub detect_black: bool,
    /// Mean luma fraction (0-1) at or below which an output counts as black.
    pub black_threshold: f64,
    pub realesrgan: RealEsrganConfig,
    pub debug: UpscaleDebugConfig,
}

impl Default for UpscaleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: 2000,
            easy_threshold: 700,
            hard_threshold: 250,
            extensions: ["jpg", "jpeg", "png", "webp"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            audit_log: PathBuf::from("originals/upscale-report.tsv"),
            waifu2x_path: PathBuf::from("tools/waifu2x/waifu2x-ncnn-vulkan"),
            waifu2x_model: "models-cunet".to_string(),
            waifu2x_tile: 512,
            realesrgan_path: PathBuf::from("tools/realesrgan/realesrgan-ncnn-vulkan"),
            detect_black: true,
            black_threshold: 0.01,
            realesrgan: RealEsrganConfig::default(),
            debug: UpscaleDebugConfig::default(),
        }
    }
}

impl UpscaleConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !(self.hard_threshold < self.easy_threshold && self.easy_threshold < self.target) {
            return Err(ConfigError::Validation(
                "upscale thresholds must satisfy hard_threshold < easy_threshold < target".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.black_threshold) {
            return Err(ConfigError::Validation(
                "upscale.black_threshold must be between 0 and 1".into(),
            ));
        }
        validate_extensions("upscale.extensions", &self.extensions)
    }
}

/// Refinement tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RealEsrganConfig {
    pub model_name: String,
    /// Tile size, 0 = let the tool decide.
    pub tile: u32,
    /// Output format passed as `-f` (e.g. `png`); tool default when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Composite transparent inputs onto white before refining.
    pub flatten_alpha: bool,
}

impl Default for RealEsrganConfig {
    fn default() -> Self {
        Self {
            model_name: "realesr-animevideov3-x2".to_string(),
            tile: 0,
            format: None,
            flatten_alpha: false,
        }
    }
}

/// Intermediate-file inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UpscaleDebugConfig {
    /// Copy every intermediate stage into `dir`.
    pub keep_temp: bool,
    pub dir: PathBuf,
}

impl Default for UpscaleDebugConfig {
    fn default() -> Self {
        Self {
            keep_temp: false,
            dir: PathBuf::from("originals/debug_upscale"),
        }
    }
}

/// Parallel encoding settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Maximum number of parallel encode workers.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config
        .max_processes
        .map(|n| n.clamp(1, cores))
        .unwrap_or(cores)
}

/// Parse and validate a config from TOML text.
pub fn parse_config(content: &str) -> Result<PipelineConfig, ConfigError> {
    let config: PipelineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Load config from `path`.
///
/// A missing file yields the stock defaults; an unreadable or invalid file is
/// an error.
pub fn load_config(path: &Path) -> Result<PipelineConfig, ConfigError> {
    if !path.exists() {
        return Ok(PipelineConfig::default());
    }
    let content = fs::read_to_string(path)?;
    parse_config(&content)
}

/// Returns a fully-commented stock config file with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# stillpress configuration
# ========================
# All settings are optional. Values shown below are the defaults.
# Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Paths
# ---------------------------------------------------------------------------
[paths]
# Tree of original images, scanned recursively.
originals_dir = "originals/originals_lowres"
# Flat directory of upscaled working copies (one file per source).
upscaled_dir = "originals/originals_upscaled"
# Root of the size-tier directories s/, s2x/, l/, l2x/.
output_dir = "src/assets"
# URL prefix under which output_dir is served.
public_base_path = "/assets"
# Optional incremental copy of output_dir (stale files are pruned).
# public_mirror_dir = "public/assets"
# Hand-curated metadata. Read only; the run fails if it changes meanwhile.
canonical_index = "src/data/images.json"
# Generated full index (sorted oldest first).
generated_index = "src/data/images.generated.json"
# Generated slim index for the client (sorted newest first).
slim_index = "public/data/images.slim.json"

# ---------------------------------------------------------------------------
# Variant rendering
# ---------------------------------------------------------------------------
[images]
# Bounding box edge per tier. s2x / l2x default to twice the 1x width.
small_width = 236
# small_2x = 472
large_width = 1200
# large_2x = 2400

# Encode quality (1-100) for s/s2x and l/l2x.
quality_small = 72
quality_large = 82

# Output formats: avif, webp, jpeg, png.
formats = ["avif", "webp"]

# Re-encode a variant when its source is newer (beyond the tolerance).
rebuild_if_newer = true
mtime_tolerance_ms = 1

# Input extensions picked up by the renderer.
extensions = ["jpg", "jpeg", "png", "webp", "tif", "tiff"]

# Tiny inline preview embedded in the index as a data URI.
[images.lqip]
enabled = false
size = 24
quality = 50

# ---------------------------------------------------------------------------
# Index
# ---------------------------------------------------------------------------
[index]
# Drop records whose source image no longer exists.
prune_missing_sources = false
# Delete variant files whose id is not in the written index.
garbage_collect = false

# ---------------------------------------------------------------------------
# Upscaling
# ---------------------------------------------------------------------------
[upscale]
enabled = true
# Longest edge thresholds:
#   >= target          -> copied unchanged
#   >= easy_threshold  -> one 2x pass
#   <= hard_threshold  -> two 2x passes + refinement
#   otherwise          -> one 2x pass + refinement
target = 2000
easy_threshold = 700
hard_threshold = 250
extensions = ["jpg", "jpeg", "png", "webp"]
# Tab-separated audit trail, appended to on every run.
audit_log = "originals/upscale-report.tsv"
waifu2x_path = "tools/waifu2x/waifu2x-ncnn-vulkan"
waifu2x_model = "models-cunet"
waifu2x_tile = 512
# Optional refinement tool. If the executable exists, its model must too.
realesrgan_path = "tools/realesrgan/realesrgan-ncnn-vulkan"
# Reject a refinement output whose mean luma is at or below the threshold.
detect_black = true
black_threshold = 0.01

[upscale.realesrgan]
model_name = "realesr-animevideov3-x2"
tile = 0
# format = "png"
flatten_alpha = false

[upscale.debug]
keep_temp = false
dir = "originals/debug_upscale"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Maximum parallel encode workers per image.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4
"##
}
