//! Top-level build driver.
//!
//! ```text
//! snapshot canonical ─► upscale (optional) ─► for each source:
//!                                               identify → probe → render → build record
//!                     ─► append orphans ─► sort ─► full + slim index
//!                     ─► GC (opt-in) ─► mirror (optional) ─► verify canonical
//! ```
//!
//! Sources are processed strictly one after another; only the encodes of a
//! single image fan out onto the rayon pool. Records stay keyed to the
//! original's path under `originals_dir`, while the pixels come from its
//! upscaled working copy when one exists.
//!
//! A failure confined to one source keeps that source's previous record (if
//! any) in the index, is counted, and is reported as
//! [`PipelineEvent::FileFailed`]. Everything in [`PipelineError`] aborts.

use crate::config::{ConfigError, PipelineConfig};
use crate::imaging::{ImageBackend, RustBackend, probe};
use crate::index::{self, IndexError};
use crate::integrity::{IntegrityError, Snapshot};
use crate::mirror::{MirrorStats, mirror_dir};
use crate::naming::flat_name;
use crate::reconcile::{Computed, Reconciler};
use crate::render::{RenderSettings, render_variants};
use crate::sources::{self, SourceImage};
use crate::types::{AssetRecord, Format, Tier};
use crate::upscale::plan::UpscaleTier;
use crate::upscale::tools::{ExternalTools, Upscaler};
use crate::upscale::{UpscaleError, UpscaleSettings, UpscaleStats, run_upscale};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Upscale(#[from] UpscaleError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Integrity(#[from] IntegrityError),
}

/// Progress reported to the CLI printer.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    UpscaleSkipped {
        source: String,
        reason: String,
    },
    Upscaled {
        source: String,
        tier: UpscaleTier,
        passes: usize,
        fell_back: bool,
    },
    UpscaleFailed {
        source: String,
        error: String,
    },
    NoSources {
        dir: PathBuf,
    },
    ImageRendered {
        index: usize,
        total: usize,
        source: String,
        id: String,
        is_new: bool,
        made: usize,
        skipped: usize,
    },
    FileFailed {
        source: String,
        error: String,
    },
    IndexWritten {
        path: PathBuf,
        records: usize,
    },
    SlimIndexWritten {
        path: PathBuf,
        entries: usize,
    },
    GarbageCollected {
        removed: usize,
    },
    Mirrored {
        dir: PathBuf,
        stats: MirrorStats,
    },
}

/// Which stages of a build run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    /// Run the upscale stage (still subject to `upscale.enabled`).
    pub upscale: bool,
    /// Garbage-collect orphaned variants regardless of `index.garbage_collect`.
    pub clean: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            upscale: true,
            clean: false,
        }
    }
}

/// Counters for one build, accumulated stage by stage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    /// Sources rendered into a record this run.
    pub processed: usize,
    /// Variants encoded.
    pub made: usize,
    /// Variants already up to date.
    pub skipped: usize,
    /// Sources that failed.
    pub errors: usize,
    /// Records written to the full index, orphans included.
    pub records: usize,
    /// Prior records kept without a source this run.
    pub orphans: usize,
    pub upscale: Option<UpscaleStats>,
    pub gc_removed: Option<usize>,
    pub mirror: Option<MirrorStats>,
    pub elapsed: Duration,
}

fn emit(progress: Option<&Sender<PipelineEvent>>, event: PipelineEvent) {
    if let Some(tx) = progress {
        tx.send(event).ok();
    }
}

/// Run a build with the production backend and the configured tools.
pub fn build(
    config: &PipelineConfig,
    options: BuildOptions,
    progress: Option<&Sender<PipelineEvent>>,
) -> Result<RunStats, PipelineError> {
    let tools = ExternalTools::new(&config.upscale.waifu2x_path, &config.upscale.realesrgan_path);
    build_with(&RustBackend::new(), &tools, config, options, progress)
}

/// Run a build with a specific backend and upscaler (allows testing with mocks).
pub fn build_with(
    backend: &impl ImageBackend,
    tools: &impl Upscaler,
    config: &PipelineConfig,
    options: BuildOptions,
    progress: Option<&Sender<PipelineEvent>>,
) -> Result<RunStats, PipelineError> {
    let started = Instant::now();
    let paths = &config.paths;
    let snapshot = Snapshot::take(&paths.canonical_index)?;
    let mut stats = RunStats::default();

    let inputs = sources::discover(&paths.originals_dir, &config.images.extensions);
    if inputs.is_empty() {
        info!(dir = %paths.originals_dir.display(), "no source images found");
        emit(
            progress,
            PipelineEvent::NoSources {
                dir: paths.originals_dir.clone(),
            },
        );
        snapshot.verify()?;
        stats.elapsed = started.elapsed();
        return Ok(stats);
    }

    let upscaling = options.upscale && config.upscale.enabled;
    if upscaling {
        let settings = UpscaleSettings::from_config(config);
        stats.upscale = Some(run_upscale(tools, backend, &settings, progress)?);
    }

    let render_settings = RenderSettings::from_config(config)?;
    for tier in Tier::ALL {
        fs::create_dir_all(render_settings.tier_dir(tier))?;
    }

    let mut reconciler = Reconciler::new(
        index::load_records(&paths.canonical_index)?,
        index::load_records(&paths.generated_index)?,
    );
    debug!(prior = reconciler.prior_len(), "loaded prior records");

    let mut records: Vec<AssetRecord> = Vec::with_capacity(inputs.len());
    let total = inputs.len();
    for (position, source) in inputs.iter().enumerate() {
        let identity = reconciler.identify(source);
        let input = render_input(config, source, upscaling);

        let rendered = probe(backend, &input)
            .map_err(|e| e.to_string())
            .and_then(|dims| {
                render_variants(backend, &input, dims, &identity.id, &render_settings)
                    .map(|outcome| (dims, outcome))
                    .map_err(|e| e.to_string())
            });

        match rendered {
            Ok((dims, outcome)) => {
                stats.processed += 1;
                stats.made += outcome.made;
                stats.skipped += outcome.skipped;
                emit(
                    progress,
                    PipelineEvent::ImageRendered {
                        index: position + 1,
                        total,
                        source: source.relative.clone(),
                        id: identity.id.clone(),
                        is_new: identity.is_new(),
                        made: outcome.made,
                        skipped: outcome.skipped,
                    },
                );
                records.push(reconciler.build_record(
                    &identity,
                    Computed {
                        relative: source.relative.clone(),
                        width: dims.width,
                        height: dims.height,
                        lqip: outcome.lqip,
                        sizes: outcome.sizes,
                    },
                ));
            }
            Err(error) => {
                warn!(source = %source.relative, "render failed: {error}");
                stats.errors += 1;
                if let Some(prior) = reconciler.prior_record(&identity) {
                    records.push(prior.clone());
                }
                emit(
                    progress,
                    PipelineEvent::FileFailed {
                        source: source.relative.clone(),
                        error,
                    },
                );
            }
        }
    }

    let orphans = reconciler.into_orphans(config.index.prune_missing_sources);
    stats.orphans = orphans.len();
    records.extend(orphans);
    index::sort_records(&mut records);
    stats.records = records.len();

    index::write_index(&paths.generated_index, &records)?;
    emit(
        progress,
        PipelineEvent::IndexWritten {
            path: paths.generated_index.clone(),
            records: records.len(),
        },
    );
    let slim = index::slim_entries(&records);
    index::write_slim_index(&paths.slim_index, &slim)?;
    emit(
        progress,
        PipelineEvent::SlimIndexWritten {
            path: paths.slim_index.clone(),
            entries: slim.len(),
        },
    );

    if options.clean || config.index.garbage_collect {
        let kept: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let removed = index::collect_garbage(&paths.output_dir, &kept);
        stats.gc_removed = Some(removed);
        emit(progress, PipelineEvent::GarbageCollected { removed });
    }

    if let Some(mirror) = &paths.public_mirror_dir {
        let mirrored = mirror_dir(&paths.output_dir, mirror);
        stats.mirror = Some(mirrored);
        emit(
            progress,
            PipelineEvent::Mirrored {
                dir: mirror.clone(),
                stats: mirrored,
            },
        );
    }

    snapshot.verify()?;
    stats.elapsed = started.elapsed();
    Ok(stats)
}

/// Upscaled working copy when the upscale stage is active and produced one.
fn render_input(config: &PipelineConfig, source: &SourceImage, upscaling: bool) -> PathBuf {
    if !upscaling {
        return source.path.clone();
    }
    let working = config.paths.upscaled_dir.join(flat_name(&source.relative));
    if working.is_file() {
        working
    } else {
        debug!(source = %source.relative, "no working copy, rendering the original");
        source.path.clone()
    }
}

/// Run only the upscale stage with the configured tools.
pub fn upscale_only(
    config: &PipelineConfig,
    progress: Option<&Sender<PipelineEvent>>,
) -> Result<UpscaleStats, PipelineError> {
    let tools = ExternalTools::new(&config.upscale.waifu2x_path, &config.upscale.realesrgan_path);
    let settings = UpscaleSettings::from_config(config);
    Ok(run_upscale(&tools, &RustBackend::new(), &settings, progress)?)
}

/// Read-only health check of both index files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VerifyReport {
    pub canonical_records: usize,
    pub generated_records: usize,
    /// Ids appearing more than once in the generated index.
    pub duplicate_ids: Vec<String>,
    /// Generated image records whose `sizes` lack a configured tier × format.
    pub incomplete_sizes: Vec<String>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.duplicate_ids.is_empty() && self.incomplete_sizes.is_empty()
    }
}

/// Parse both index files and check the generated one against the config.
pub fn verify(config: &PipelineConfig) -> Result<VerifyReport, PipelineError> {
    let formats: Vec<Format> = config.images.output_formats()?;
    let canonical = index::load_records(&config.paths.canonical_index)?;
    let generated = index::load_records(&config.paths.generated_index)?;

    let mut seen = HashSet::new();
    let mut duplicate_ids = Vec::new();
    for record in &generated {
        if !seen.insert(record.id.as_str()) && !duplicate_ids.contains(&record.id) {
            duplicate_ids.push(record.id.clone());
        }
    }

    let incomplete_sizes = generated
        .iter()
        .filter(|r| r.is_image() && r.source.is_some())
        .filter(|r| {
            Tier::ALL.iter().any(|tier| {
                formats.iter().any(|format| {
                    r.sizes
                        .get(tier)
                        .and_then(|m| m.get(format))
                        .is_none_or(|url| url.is_empty())
                })
            })
        })
        .map(|r| r.id.clone())
        .collect();

    Ok(VerifyReport {
        canonical_records: canonical.len(),
        generated_records: generated.len(),
        duplicate_ids,
        incomplete_sizes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MockBackend;
    use crate::upscale::tools::Tool;
    use crate::upscale::tools::tests::MockUpscaler;
    use std::path::Path;
    use std::sync::mpsc;
    use tempfile::TempDir;

    fn config(root: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.paths.originals_dir = root.join("originals");
        config.paths.upscaled_dir = root.join("upscaled");
        config.paths.output_dir = root.join("assets");
        config.paths.canonical_index = root.join("data/images.json");
        config.paths.generated_index = root.join("data/images.generated.json");
        config.paths.slim_index = root.join("public/images.slim.json");
        config.upscale.enabled = false;
        config.upscale.audit_log = root.join("report.tsv");
        config
    }

    fn add_source(config: &PipelineConfig, relative: &str) -> PathBuf {
        let path = config.paths.originals_dir.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "pixels").unwrap();
        path
    }

    fn run(backend: &MockBackend, config: &PipelineConfig) -> RunStats {
        build_with(
            backend,
            &MockUpscaler::without(Tool::RealEsrgan),
            config,
            BuildOptions::default(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn empty_originals_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let (tx, rx) = mpsc::channel();

        let stats = build_with(
            &MockBackend::new(),
            &MockUpscaler::new(),
            &config,
            BuildOptions::default(),
            Some(&tx),
        )
        .unwrap();
        drop(tx);

        assert_eq!(stats.records, 0);
        assert!(!config.paths.generated_index.exists());
        assert!(!config.paths.slim_index.exists());
        let events: Vec<_> = rx.iter().collect();
        assert!(matches!(&events[..], [PipelineEvent::NoSources { .. }]));
    }

    #[test]
    fn build_renders_every_variant_and_writes_both_indexes() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        add_source(&config, "a.png");
        add_source(&config, "booth/b.png");
        let backend = MockBackend::with_dimensions(3000, 2000);

        let stats = run(&backend, &config);

        assert_eq!(stats.processed, 2);
        assert_eq!(stats.made, 2 * 4 * 2);
        assert_eq!(stats.records, 2);
        let records = index::load_records(&config.paths.generated_index).unwrap();
        assert_eq!(records.len(), 2);
        for record in &records {
            assert_eq!(record.sizes.len(), 4);
            assert!(record.sizes.values().all(|f| f.len() == 2));
        }
        let slim: Vec<serde_json::Value> =
            serde_json::from_str(&fs::read_to_string(&config.paths.slim_index).unwrap()).unwrap();
        assert_eq!(slim.len(), 2);
        assert_eq!(slim[0]["id"], records[1].id.as_str());
    }

    #[test]
    fn second_run_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        add_source(&config, "a.png");
        let backend = MockBackend::with_dimensions(800, 600);

        run(&backend, &config);
        let first = fs::read(&config.paths.generated_index).unwrap();
        let stats = run(&backend, &config);
        let second = fs::read(&config.paths.generated_index).unwrap();

        assert_eq!(stats.made, 0);
        assert_eq!(stats.skipped, 8);
        assert_eq!(first, second);
    }

    #[test]
    fn failed_source_keeps_prior_record() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let path = add_source(&config, "a.png");
        let backend = MockBackend::with_dimensions(800, 600);
        run(&backend, &config);
        let before = index::load_records(&config.paths.generated_index).unwrap();

        let stats = run(&MockBackend::new(), &config);

        assert_eq!(stats.errors, 1);
        assert!(path.exists());
        assert_eq!(index::load_records(&config.paths.generated_index).unwrap(), before);
    }

    #[test]
    fn clean_removes_orphaned_variants() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        add_source(&config, "a.png");
        let stray = config.paths.output_dir.join("s/stray.webp");
        fs::create_dir_all(stray.parent().unwrap()).unwrap();
        fs::write(&stray, "").unwrap();
        let backend = MockBackend::with_dimensions(800, 600);

        let stats = build_with(
            &backend,
            &MockUpscaler::new(),
            &config,
            BuildOptions {
                upscale: false,
                clean: true,
            },
            None,
        )
        .unwrap();

        assert_eq!(stats.gc_removed, Some(1));
        assert!(!stray.exists());
        assert_eq!(backend.resize_count(), 8);
    }

    #[test]
    fn upscaled_working_copy_feeds_the_renderer() {
        let tmp = TempDir::new().unwrap();
        let mut config = config(tmp.path());
        config.upscale.enabled = true;
        let original = add_source(&config, "booth/a.png");
        let backend = MockBackend::new();
        backend.set_dimensions(&original, 900, 600);
        let working = config.paths.upscaled_dir.join("booth_a.png");
        backend.set_dimensions(&working, 1800, 1200);

        let stats = run(&backend, &config);

        assert_eq!(stats.upscale.map(|u| u.total), Some(1));
        let records = index::load_records(&config.paths.generated_index).unwrap();
        assert_eq!(records[0].source.as_deref(), Some("booth/a.png"));
        assert_eq!(records[0].w, Some(1800));
    }

    #[test]
    fn canonical_change_is_an_integrity_error() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        fs::create_dir_all(config.paths.canonical_index.parent().unwrap()).unwrap();
        fs::write(&config.paths.canonical_index, "[]").unwrap();
        add_source(&config, "a.png");

        struct Tampering(MockBackend, PathBuf);
        impl ImageBackend for Tampering {
            fn identify(&self, path: &Path) -> Result<crate::imaging::Dimensions, crate::imaging::BackendError> {
                fs::write(&self.1, "[ ]").unwrap();
                self.0.identify(path)
            }
            fn resize(&self, params: &crate::imaging::ResizeParams) -> Result<(), crate::imaging::BackendError> {
                self.0.resize(params)
            }
            fn placeholder(&self, params: &crate::imaging::PlaceholderParams) -> Result<Vec<u8>, crate::imaging::BackendError> {
                self.0.placeholder(params)
            }
            fn mean_brightness(&self, path: &Path) -> Result<f64, crate::imaging::BackendError> {
                self.0.mean_brightness(path)
            }
            fn flatten_alpha(&self, source: &Path, output: &Path) -> Result<(), crate::imaging::BackendError> {
                self.0.flatten_alpha(source, output)
            }
        }
        let backend = Tampering(
            MockBackend::with_dimensions(800, 600),
            config.paths.canonical_index.clone(),
        );

        let result = build_with(
            &backend,
            &MockUpscaler::new(),
            &config,
            BuildOptions::default(),
            None,
        );
        assert!(matches!(
            result,
            Err(PipelineError::Integrity(IntegrityError::Changed { .. }))
        ));
    }

    #[test]
    fn verify_reports_duplicates_and_incomplete_sizes() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let mut partial = AssetRecord::new("partial");
        partial.source = Some("a.png".into());
        let records = vec![AssetRecord::new("dup"), AssetRecord::new("dup"), partial];
        index::write_index(&config.paths.generated_index, &records).unwrap();

        let report = verify(&config).unwrap();
        assert_eq!(report.generated_records, 3);
        assert_eq!(report.canonical_records, 0);
        assert_eq!(report.duplicate_ids, vec!["dup"]);
        assert_eq!(report.incomplete_sizes, vec!["partial"]);
        assert!(!report.is_clean());
    }
}
