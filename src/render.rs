//! Variant renderer.
//!
//! For one pre-processed original and its record identifier, produces the
//! fixed grid of `tiers × formats` encoded files:
//!
//! ```text
//! {output_dir}/s/{id}.avif      → {public_base}/s/{id}.avif
//! {output_dir}/s/{id}.webp      → {public_base}/s/{id}.webp
//! {output_dir}/s2x/{id}.avif    ...
//! {output_dir}/l2x/{id}.webp
//! ```
//!
//! Paths are keyed by the identifier, never by the source file name, so a
//! renamed source keeps its URLs.
//!
//! ## Incremental rebuild
//!
//! A variant is encoded only when [`needs_build`] says so: the destination is
//! missing, or rebuild-if-newer is on and the source is newer than the
//! destination by more than the configured tolerance. Unchanged reruns encode
//! nothing.
//!
//! ## Parallelism
//!
//! The encodes of one image run on the rayon pool; images themselves are
//! rendered one after another by the pipeline.

use crate::config::{ConfigError, PipelineConfig};
use crate::imaging::{
    BackendError, Dimensions, ImageBackend, Quality, ResizeParams, fit_within,
    placeholder_data_uri,
};
use crate::types::{Format, SizeMap, Tier};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Encode of {path} failed: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: BackendError,
    },
    #[error("Placeholder for {path} failed: {source}")]
    Placeholder {
        path: PathBuf,
        #[source]
        source: BackendError,
    },
}

/// One tier's resize policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierSpec {
    pub tier: Tier,
    /// Bounding box edge.
    pub width: u32,
    pub quality: Quality,
}

/// Placeholder settings, present only when enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LqipSpec {
    pub size: u32,
    pub quality: Quality,
}

/// Everything the renderer needs, resolved from config once per run.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub output_dir: PathBuf,
    pub public_base_path: String,
    pub tiers: Vec<TierSpec>,
    pub formats: Vec<Format>,
    pub rebuild_if_newer: bool,
    pub mtime_tolerance: Duration,
    pub lqip: Option<LqipSpec>,
}

impl RenderSettings {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        let images = &config.images;
        Ok(Self {
            output_dir: config.paths.output_dir.clone(),
            public_base_path: config.paths.public_base_path.clone(),
            tiers: Tier::ALL
                .iter()
                .map(|&tier| TierSpec {
                    tier,
                    width: images.width(tier),
                    quality: Quality::new(images.quality(tier)),
                })
                .collect(),
            formats: images.output_formats()?,
            rebuild_if_newer: images.rebuild_if_newer,
            mtime_tolerance: Duration::from_millis(images.mtime_tolerance_ms),
            lqip: images.lqip.enabled.then(|| LqipSpec {
                size: images.lqip.size,
                quality: Quality::new(images.lqip.quality),
            }),
        })
    }

    /// Directory holding one tier's files.
    pub fn tier_dir(&self, tier: Tier) -> PathBuf {
        self.output_dir.join(tier.dir_name())
    }
}

/// One planned (tier × format) output file.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetVariant {
    pub tier: Tier,
    pub format: Format,
    pub path: PathBuf,
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub quality: Quality,
}

/// Public URL for a variant: `/{base}/{tier}/{id}.{ext}`.
///
/// Leading and trailing slashes of `base` are ignored; an empty base falls
/// back to `assets`.
pub fn public_url(base: &str, tier: Tier, id: &str, format: Format) -> String {
    let base = base.trim_matches('/');
    let base = if base.is_empty() { "assets" } else { base };
    format!("/{base}/{}/{id}.{}", tier.dir_name(), format.extension())
}

/// Plan every variant for `id`, in tier order then format order.
pub fn plan_variants(settings: &RenderSettings, id: &str, source: Dimensions) -> Vec<AssetVariant> {
    settings
        .tiers
        .iter()
        .flat_map(|spec| {
            let (width, height) = fit_within((source.width, source.height), spec.width);
            settings.formats.iter().map(move |&format| AssetVariant {
                tier: spec.tier,
                format,
                path: settings
                    .tier_dir(spec.tier)
                    .join(format!("{id}.{}", format.extension())),
                url: public_url(&settings.public_base_path, spec.tier, id, format),
                width,
                height,
                quality: spec.quality,
            })
        })
        .collect()
}

/// URL map for a planned variant list.
pub fn size_map(variants: &[AssetVariant]) -> SizeMap {
    let mut sizes = SizeMap::new();
    for v in variants {
        sizes.entry(v.tier).or_default().insert(v.format, v.url.clone());
    }
    sizes
}

/// Whether `dst` must be (re-)encoded from `src`.
///
/// Any stat failure other than a missing destination counts as "rebuild".
pub fn needs_build(src: &Path, dst: &Path, rebuild_if_newer: bool, tolerance: Duration) -> bool {
    if !dst.exists() {
        return true;
    }
    if !rebuild_if_newer {
        return false;
    }
    let modified = |p: &Path| fs::metadata(p).and_then(|m| m.modified());
    match (modified(src), modified(dst)) {
        (Ok(src_time), Ok(dst_time)) => src_time > dst_time + tolerance,
        _ => true,
    }
}

/// What one image's render produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderOutcome {
    pub sizes: SizeMap,
    pub lqip: Option<String>,
    /// Variants encoded this run.
    pub made: usize,
    /// Variants already up to date.
    pub skipped: usize,
}

/// Render every variant of `source` for record `id`.
///
/// `dims` are the source's probed dimensions. The returned `sizes` always
/// contains the full tier × format grid.
pub fn render_variants(
    backend: &impl ImageBackend,
    source: &Path,
    dims: Dimensions,
    id: &str,
    settings: &RenderSettings,
) -> Result<RenderOutcome, RenderError> {
    let variants = plan_variants(settings, id, dims);

    let built: Vec<bool> = variants
        .par_iter()
        .map(|v| {
            if !needs_build(source, &v.path, settings.rebuild_if_newer, settings.mtime_tolerance) {
                return Ok(false);
            }
            debug!(tier = %v.tier, format = %v.format, path = %v.path.display(), "encoding");
            backend
                .resize(&ResizeParams {
                    source: source.to_path_buf(),
                    output: v.path.clone(),
                    width: v.width,
                    height: v.height,
                    format: v.format,
                    quality: v.quality,
                })
                .map(|()| true)
                .map_err(|e| RenderError::Encode {
                    path: v.path.clone(),
                    source: e,
                })
        })
        .collect::<Result<_, _>>()?;

    let made = built.iter().filter(|&&b| b).count();
    let lqip = settings
        .lqip
        .map(|spec| {
            placeholder_data_uri(backend, source, spec.size, spec.quality).map_err(|e| {
                RenderError::Placeholder {
                    path: source.to_path_buf(),
                    source: e,
                }
            })
        })
        .transpose()?;

    Ok(RenderOutcome {
        sizes: size_map(&variants),
        lqip,
        made,
        skipped: built.len() - made,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::{MockBackend, RecordedOp};
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn settings(output_dir: &Path) -> RenderSettings {
        let mut config = PipelineConfig::default();
        config.paths.output_dir = output_dir.to_path_buf();
        RenderSettings::from_config(&config).unwrap()
    }

    fn touch(path: &Path, time: SystemTime) {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(time)
            .unwrap();
    }

    const DIMS: Dimensions = Dimensions {
        width: 3000,
        height: 2000,
    };

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn public_url_normalizes_base() {
        assert_eq!(
            public_url("/assets", Tier::S2x, "abc", Format::Avif),
            "/assets/s2x/abc.avif"
        );
        assert_eq!(
            public_url("media/", Tier::L, "abc", Format::Webp),
            "/media/l/abc.webp"
        );
        assert_eq!(public_url("", Tier::S, "abc", Format::Webp), "/assets/s/abc.webp");
    }

    #[test]
    fn plan_covers_full_grid_keyed_by_id() {
        let settings = settings(Path::new("/out"));
        let variants = plan_variants(&settings, "id1", DIMS);

        assert_eq!(variants.len(), 8);
        assert_eq!(variants[0].path, PathBuf::from("/out/s/id1.avif"));
        assert_eq!(variants[1].path, PathBuf::from("/out/s/id1.webp"));
        assert_eq!(variants[7].path, PathBuf::from("/out/l2x/id1.webp"));
    }

    #[test]
    fn plan_fits_each_tier_without_enlarging() {
        let settings = settings(Path::new("/out"));
        let variants = plan_variants(&settings, "x", DIMS);
        let dims: Vec<(Tier, u32, u32)> = variants
            .iter()
            .filter(|v| v.format == Format::Webp)
            .map(|v| (v.tier, v.width, v.height))
            .collect();
        assert_eq!(
            dims,
            vec![
                (Tier::S, 236, 157),
                (Tier::S2x, 472, 315),
                (Tier::L, 1200, 800),
                (Tier::L2x, 2400, 1600),
            ]
        );

        let small = plan_variants(&settings, "x", Dimensions { width: 800, height: 600 });
        let l2x = small.iter().find(|v| v.tier == Tier::L2x).unwrap();
        assert_eq!((l2x.width, l2x.height), (800, 600));
    }

    #[test]
    fn plan_uses_tier_quality() {
        let settings = settings(Path::new("/out"));
        let variants = plan_variants(&settings, "x", DIMS);
        assert_eq!(variants[0].quality.value(), 72);
        assert_eq!(variants[7].quality.value(), 82);
    }

    #[test]
    fn size_map_has_every_tier_and_format() {
        let settings = settings(Path::new("/out"));
        let sizes = size_map(&plan_variants(&settings, "x", DIMS));
        assert_eq!(sizes.len(), 4);
        assert!(sizes.values().all(|formats| formats.len() == 2));
        assert_eq!(sizes[&Tier::L][&Format::Avif], "/assets/l/x.avif");
    }

    // =========================================================================
    // needs_build
    // =========================================================================

    #[test]
    fn needs_build_when_destination_missing() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.png");
        fs::write(&src, "x").unwrap();
        assert!(needs_build(&src, &tmp.path().join("none.webp"), false, Duration::ZERO));
    }

    #[test]
    fn needs_build_respects_tolerance() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.png");
        let dst = tmp.path().join("a.webp");
        fs::write(&src, "x").unwrap();
        fs::write(&dst, "y").unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let tolerance = Duration::from_millis(1);

        touch(&dst, base);
        touch(&src, base + Duration::from_millis(1));
        assert!(!needs_build(&src, &dst, true, tolerance));

        touch(&src, base + Duration::from_millis(5));
        assert!(needs_build(&src, &dst, true, tolerance));
        assert!(!needs_build(&src, &dst, false, tolerance));
    }

    #[test]
    fn needs_build_when_source_unreadable() {
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("a.webp");
        fs::write(&dst, "y").unwrap();
        assert!(needs_build(&tmp.path().join("gone.png"), &dst, true, Duration::ZERO));
    }

    // =========================================================================
    // render_variants
    // =========================================================================

    #[test]
    fn first_render_makes_all_second_skips_all() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.png");
        fs::write(&src, "x").unwrap();
        touch(&src, SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        let settings = settings(&tmp.path().join("out"));
        let backend = MockBackend::new();

        let first = render_variants(&backend, &src, DIMS, "id1", &settings).unwrap();
        assert_eq!((first.made, first.skipped), (8, 0));
        assert!(tmp.path().join("out/l2x/id1.webp").exists());

        let second = render_variants(&backend, &src, DIMS, "id1", &settings).unwrap();
        assert_eq!((second.made, second.skipped), (0, 8));
        assert_eq!(first.sizes, second.sizes);
        assert_eq!(backend.resize_count(), 8);
    }

    #[test]
    fn touched_source_rebuilds() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.png");
        fs::write(&src, "x").unwrap();
        touch(&src, SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000));
        let settings = settings(&tmp.path().join("out"));
        let backend = MockBackend::new();
        render_variants(&backend, &src, DIMS, "id1", &settings).unwrap();

        touch(&src, SystemTime::now() + Duration::from_secs(60));
        let again = render_variants(&backend, &src, DIMS, "id1", &settings).unwrap();
        assert_eq!(again.made, 8);
    }

    #[test]
    fn lqip_only_when_enabled() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.png");
        fs::write(&src, "x").unwrap();
        let mut settings = settings(&tmp.path().join("out"));
        let backend = MockBackend::new();

        let without = render_variants(&backend, &src, DIMS, "a", &settings).unwrap();
        assert!(without.lqip.is_none());

        settings.lqip = Some(LqipSpec {
            size: 24,
            quality: Quality::new(50),
        });
        let with = render_variants(&backend, &src, DIMS, "a", &settings).unwrap();
        assert!(with.lqip.unwrap().starts_with("data:image/webp;base64,"));
        assert!(
            backend
                .get_operations()
                .iter()
                .any(|op| matches!(op, RecordedOp::Placeholder { size: 24, .. }))
        );
    }

    #[test]
    fn encode_failure_is_reported() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.png");
        fs::write(&src, "x").unwrap();
        let settings = settings(&tmp.path().join("out"));
        let backend = MockBackend {
            fail_resize: true,
            ..MockBackend::default()
        };

        let result = render_variants(&backend, &src, DIMS, "a", &settings);
        assert!(matches!(result, Err(RenderError::Encode { .. })));
    }
}
