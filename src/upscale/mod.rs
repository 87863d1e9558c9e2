//! Upscale decision engine.
//!
//! Runs once over the whole originals tree before rendering starts, producing
//! one "pre-processed original" per source in a flat directory
//! (`booth/cats/neko.png` → `booth_cats_neko.png`).
//!
//! For each source:
//!
//! 1. Probe the longest edge and [classify](plan::UpscaleTier::classify) it.
//! 2. Sources already at the target size are logged as `Skip` and copied
//!    through unchanged.
//! 3. An existing output is logged as `Skip` (`exists`) and left alone.
//! 4. Otherwise the tier's [plan](plan::plan) is interpreted step by step.
//!    Intermediates live next to the output as `_tmp1` / `_tmp2` and the
//!    final image is written to a hidden `.partial` name, renamed into place
//!    only after every step succeeded.
//!
//! ## Failure semantics
//!
//! | Failure | Effect |
//! |---|---|
//! | Real-ESRGAN present but its model missing | fatal, checked before any file |
//! | waifu2x missing when a file needs it | fatal |
//! | probe / tool / copy failure for one file | `Error` audit line, counted, next file |
//! | temp cleanup failure | warning only |

pub mod audit;
pub mod plan;
pub mod tools;

use crate::atomic::partial_path;
use crate::config::PipelineConfig;
use crate::imaging::{BackendError, ImageBackend, is_black_frame, probe};
use crate::naming::{flat_name, with_stem_suffix};
use crate::pipeline::PipelineEvent;
use crate::render::needs_build;
use crate::sources::{self, SourceImage};
use audit::{AuditEntry, AuditLog, AuditMethod};
use plan::{Fallback, Stage, Step, Thresholds, UpscaleTier};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::time::Duration;
use thiserror::Error;
use tools::{Tool, ToolError, ToolInvocation, Upscaler};
use tracing::{debug, info, warn};

/// Both tools always run at 2×.
const SCALE: u32 = 2;

#[derive(Error, Debug)]
pub enum UpscaleError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(
        "Real-ESRGAN model '{model}' not found in {searched}/(models|*); available: [{}]",
        .available.join(", ")
    )]
    ModelNotFound {
        model: String,
        searched: PathBuf,
        available: Vec<String>,
    },
    #[error("{tool} is required but was not found at {path}")]
    ToolMissing { tool: Tool, path: PathBuf },
}

/// Why one file failed; never escapes the engine.
#[derive(Error, Debug)]
enum FileError {
    #[error("{0}")]
    Tool(#[from] ToolError),
    #[error("{0}")]
    Backend(#[from] BackendError),
    #[error("{0}")]
    Io(#[from] io::Error),
}

impl FileError {
    fn detail(&self) -> String {
        match self {
            FileError::Tool(e) => e.detail(),
            other => other.to_string(),
        }
    }
}

/// Engine settings resolved from config.
#[derive(Debug, Clone)]
pub struct UpscaleSettings {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub extensions: Vec<String>,
    pub thresholds: Thresholds,
    pub audit_log: PathBuf,
    pub waifu2x_path: PathBuf,
    pub waifu2x_model: String,
    pub waifu2x_tile: u32,
    pub realesrgan_path: PathBuf,
    pub realesrgan_model: String,
    pub realesrgan_tile: u32,
    pub realesrgan_format: Option<String>,
    pub models_env_dir: Option<PathBuf>,
    pub flatten_alpha: bool,
    pub detect_black: bool,
    pub black_threshold: f64,
    pub keep_temp: bool,
    pub debug_dir: PathBuf,
}

impl UpscaleSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        let up = &config.upscale;
        Self {
            source_dir: config.paths.originals_dir.clone(),
            output_dir: config.paths.upscaled_dir.clone(),
            extensions: up.extensions.clone(),
            thresholds: Thresholds {
                target: up.target,
                easy: up.easy_threshold,
                hard: up.hard_threshold,
            },
            audit_log: up.audit_log.clone(),
            waifu2x_path: up.waifu2x_path.clone(),
            waifu2x_model: up.waifu2x_model.clone(),
            waifu2x_tile: up.waifu2x_tile,
            realesrgan_path: up.realesrgan_path.clone(),
            realesrgan_model: up.realesrgan.model_name.clone(),
            realesrgan_tile: up.realesrgan.tile,
            realesrgan_format: up.realesrgan.format.clone(),
            models_env_dir: tools::models_dir_from_env(),
            flatten_alpha: up.realesrgan.flatten_alpha,
            detect_black: up.detect_black,
            black_threshold: up.black_threshold,
            keep_temp: up.debug.keep_temp,
            debug_dir: up.debug.dir.clone(),
        }
    }

    /// Flat working-copy path for a source's relative path.
    pub fn working_copy(&self, relative: &str) -> PathBuf {
        self.output_dir.join(flat_name(relative))
    }
}

/// Counters for one upscale run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpscaleStats {
    /// Files that went through at least one tool.
    pub total: usize,
    pub skipped: usize,
    pub waifu2x_passes: usize,
    pub refined: usize,
    pub fallbacks: usize,
    pub errors: usize,
}

impl UpscaleStats {
    pub fn merge(&mut self, other: &UpscaleStats) {
        self.total += other.total;
        self.skipped += other.skipped;
        self.waifu2x_passes += other.waifu2x_passes;
        self.refined += other.refined;
        self.fallbacks += other.fallbacks;
        self.errors += other.errors;
    }
}

impl fmt::Display for UpscaleStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} upscaled, {} skipped, {} waifu2x passes, {} refined, {} fallbacks, {} errors",
            self.total, self.skipped, self.waifu2x_passes, self.refined, self.fallbacks, self.errors
        )
    }
}

/// Record of one source's trip through the engine. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct UpscaleJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub tier: UpscaleTier,
    /// Tool runs, in execution order.
    pub invocations: Vec<ToolInvocation>,
    /// Black-frame check on the refinement output, when one ran.
    pub black_frame: Option<bool>,
}

impl UpscaleJob {
    pub fn fell_back(&self) -> bool {
        self.black_frame == Some(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// Already at or above the target edge; copied through.
    AlreadyLarge { target: u32 },
    /// Output from an earlier run exists.
    Exists,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::AlreadyLarge { target } => write!(f, "target>={target}"),
            SkipReason::Exists => f.write_str("exists"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpscaleOutcome {
    Skipped(SkipReason),
    Upscaled(UpscaleJob),
    Failed(String),
}

/// Interprets upscale plans against real (or mock) tools.
pub struct UpscaleEngine<'a, U: Upscaler, B: ImageBackend> {
    tools: &'a U,
    backend: &'a B,
    settings: &'a UpscaleSettings,
    audit: AuditLog,
    models_dir: Option<PathBuf>,
    stats: UpscaleStats,
}

impl<'a, U: Upscaler, B: ImageBackend> UpscaleEngine<'a, U, B> {
    /// Open the audit log and resolve the refiner's model directory.
    ///
    /// Fails when Real-ESRGAN is installed but its configured model is not.
    pub fn new(
        tools: &'a U,
        backend: &'a B,
        settings: &'a UpscaleSettings,
    ) -> Result<Self, UpscaleError> {
        let models_dir = if tools.available(Tool::RealEsrgan) {
            let found = tools::find_models_dir(
                &settings.realesrgan_path,
                &settings.realesrgan_model,
                settings.models_env_dir.as_deref(),
            );
            match found {
                Some(dir) => Some(dir),
                None => {
                    return Err(UpscaleError::ModelNotFound {
                        model: settings.realesrgan_model.clone(),
                        searched: settings
                            .realesrgan_path
                            .parent()
                            .map(Path::to_path_buf)
                            .unwrap_or_default(),
                        available: tools::list_available_models(&settings.realesrgan_path),
                    });
                }
            }
        } else {
            info!("Real-ESRGAN not found, refinement disabled");
            None
        };
        let audit = AuditLog::open(&settings.audit_log)?;
        Ok(Self {
            tools,
            backend,
            settings,
            audit,
            models_dir,
            stats: UpscaleStats::default(),
        })
    }

    pub fn refiner_available(&self) -> bool {
        self.models_dir.is_some()
    }

    pub fn stats(&self) -> UpscaleStats {
        self.stats
    }

    fn log(&mut self, entry: AuditEntry) -> Result<(), UpscaleError> {
        self.audit.append(&entry)?;
        Ok(())
    }

    /// Produce the working copy for one source.
    ///
    /// Only fatal conditions are `Err`; a failure confined to this file is
    /// `Ok(UpscaleOutcome::Failed)` after being audited.
    pub fn upscale_file(&mut self, source: &SourceImage) -> Result<UpscaleOutcome, UpscaleError> {
        let dest = self.settings.working_copy(&source.relative);
        let dims = match probe(self.backend, &source.path) {
            Ok(dims) => dims,
            Err(e) => return self.fail(&source.path, &dest, "", &FileError::from(e)),
        };
        let tier = UpscaleTier::classify(dims.max_edge(), &self.settings.thresholds);
        debug!(source = %source.relative, max_edge = dims.max_edge(), %tier, "classified");

        if tier == UpscaleTier::Skip {
            let reason = SkipReason::AlreadyLarge {
                target: self.settings.thresholds.target,
            };
            self.log(
                AuditEntry::new(&source.path, &dest, AuditMethod::Skip).extra(reason.to_string()),
            )?;
            if needs_build(&source.path, &dest, true, Duration::from_millis(1)) {
                if let Err(e) = copy_into_place(&source.path, &dest) {
                    return self.fail(&source.path, &dest, "", &FileError::from(e));
                }
            }
            self.stats.skipped += 1;
            return Ok(UpscaleOutcome::Skipped(reason));
        }

        if dest.exists() {
            self.log(
                AuditEntry::new(&source.path, &dest, AuditMethod::Skip)
                    .extra(SkipReason::Exists.to_string()),
            )?;
            self.stats.skipped += 1;
            return Ok(UpscaleOutcome::Skipped(SkipReason::Exists));
        }

        if !self.tools.available(Tool::Waifu2x) {
            return Err(UpscaleError::ToolMissing {
                tool: Tool::Waifu2x,
                path: self.settings.waifu2x_path.clone(),
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        self.stats.total += 1;
        info!(source = %source.relative, max_edge = dims.max_edge(), %tier, "upscaling");

        let mut job = UpscaleJob {
            source: source.path.clone(),
            destination: dest.clone(),
            tier,
            invocations: Vec::new(),
            black_frame: None,
        };
        let steps = plan::plan(tier, self.refiner_available());
        let result = self.execute(&mut job, &steps);
        let partial = self.stage_path(&job, Stage::Output);
        let result = result.and_then(|()| fs::rename(&partial, &dest).map_err(FileError::from));
        self.cleanup(&job, result.is_err());

        match result {
            Ok(()) => {
                self.dump(&dest, &format!("{tier}_final"));
                Ok(UpscaleOutcome::Upscaled(job))
            }
            Err(e) => {
                let model = match &e {
                    FileError::Tool(ToolError::Failed { tool: Tool::RealEsrgan, .. }) => {
                        self.settings.realesrgan_model.clone()
                    }
                    _ => String::new(),
                };
                self.fail(&source.path, &dest, &model, &e)
            }
        }
    }

    fn fail(
        &mut self,
        src: &Path,
        dest: &Path,
        model: &str,
        error: &FileError,
    ) -> Result<UpscaleOutcome, UpscaleError> {
        warn!(source = %src.display(), "upscale failed: {error}");
        self.stats.errors += 1;
        self.log(
            AuditEntry::new(src, dest, AuditMethod::Error)
                .model(model)
                .extra(error.detail()),
        )?;
        Ok(UpscaleOutcome::Failed(error.detail()))
    }

    fn stage_path(&self, job: &UpscaleJob, stage: Stage) -> PathBuf {
        match stage {
            Stage::Source => job.source.clone(),
            Stage::Temp(n) => with_stem_suffix(&job.destination, &format!("_tmp{n}")),
            Stage::Output => hidden_partial(&job.destination),
        }
    }

    /// Path shown in the audit log: the final name for the output stage.
    fn audit_path(&self, job: &UpscaleJob, stage: Stage) -> PathBuf {
        match stage {
            Stage::Output => job.destination.clone(),
            other => self.stage_path(job, other),
        }
    }

    fn execute(&mut self, job: &mut UpscaleJob, steps: &[Step]) -> Result<(), FileError> {
        for step in steps {
            match *step {
                Step::Waifu2x { from, to, noise } => {
                    self.waifu2x(job, from, to, noise)?;
                }
                Step::Refine { from, fallback } => {
                    self.refine(job, from)?;
                    let black = self.settings.detect_black
                        && is_black_frame(
                            self.backend,
                            &self.stage_path(job, Stage::Output),
                            self.settings.black_threshold,
                        )?;
                    if self.settings.detect_black {
                        job.black_frame = Some(black);
                    }
                    if black {
                        self.fall_back(job, from, fallback)?;
                    }
                }
                Step::Promote { from } => {
                    fs::rename(self.stage_path(job, from), self.stage_path(job, Stage::Output))?;
                }
            }
        }
        Ok(())
    }

    fn waifu2x(
        &mut self,
        job: &mut UpscaleJob,
        from: Stage,
        to: Stage,
        noise: u8,
    ) -> Result<(), FileError> {
        let invocation = ToolInvocation {
            tool: Tool::Waifu2x,
            input: self.stage_path(job, from),
            output: self.stage_path(job, to),
            scale: SCALE,
            noise,
            tile: self.settings.waifu2x_tile,
            model: self.settings.waifu2x_model.clone(),
            models_dir: None,
            format: None,
        };
        self.tools.run(&invocation)?;
        self.stats.waifu2x_passes += 1;
        self.log(
            AuditEntry::new(&self.audit_path(job, from), &self.audit_path(job, to), AuditMethod::Waifu2x)
                .model(&self.settings.waifu2x_model)
                .scale(SCALE)
                .extra(format!("tier={} noise={noise}", job.tier)),
        )
        .map_err(upscale_io)?;
        if let Stage::Temp(n) = to {
            self.dump(&invocation.output, &format!("{}_tmp{n}", job.tier));
        }
        job.invocations.push(invocation);
        Ok(())
    }

    fn refine(&mut self, job: &mut UpscaleJob, from: Stage) -> Result<(), FileError> {
        let original_input = self.stage_path(job, from);
        let flattened = self
            .settings
            .flatten_alpha
            .then(|| with_stem_suffix(&original_input, "_flat"));
        if let Some(flat) = &flattened {
            self.backend.flatten_alpha(&original_input, flat)?;
            self.dump(flat, "flatten");
        }

        let invocation = ToolInvocation {
            tool: Tool::RealEsrgan,
            input: flattened.clone().unwrap_or_else(|| original_input.clone()),
            output: self.stage_path(job, Stage::Output),
            scale: SCALE,
            noise: 0,
            tile: self.settings.realesrgan_tile,
            model: self.settings.realesrgan_model.clone(),
            models_dir: self.models_dir.clone(),
            format: self.settings.realesrgan_format.clone(),
        };
        let result = self.tools.run(&invocation);
        if let Some(flat) = &flattened {
            remove_best_effort(flat);
        }
        result?;

        self.stats.refined += 1;
        self.log(
            AuditEntry::new(
                &self.audit_path(job, from),
                &job.destination,
                AuditMethod::RealEsrgan,
            )
            .model(&self.settings.realesrgan_model)
            .scale(SCALE)
            .extra(format!("tier={}", job.tier)),
        )
        .map_err(upscale_io)?;
        self.dump(&invocation.output, &format!("{}_refine", job.tier));
        job.invocations.push(invocation);
        Ok(())
    }

    fn fall_back(
        &mut self,
        job: &mut UpscaleJob,
        refined_from: Stage,
        fallback: Fallback,
    ) -> Result<(), FileError> {
        warn!(
            source = %job.source.display(),
            "refinement output is near-black, falling back"
        );
        self.stats.fallbacks += 1;
        self.log(
            AuditEntry::new(
                &self.audit_path(job, refined_from),
                &job.destination,
                AuditMethod::Fallback,
            )
            .model("Waifu2x")
            .extra(format!("tier={} black_detected_after_refine", job.tier)),
        )
        .map_err(upscale_io)?;

        match fallback {
            Fallback::Promote(stage) => {
                fs::copy(self.stage_path(job, stage), self.stage_path(job, Stage::Output))?;
            }
            Fallback::Waifu2x { from, noise } => {
                self.waifu2x(job, from, Stage::Output, noise)?;
            }
        }
        self.dump(
            &self.stage_path(job, Stage::Output),
            &format!("{}_fallback", job.tier),
        );
        Ok(())
    }

    /// Remove intermediates; on failure also the partial output.
    fn cleanup(&self, job: &UpscaleJob, failed: bool) {
        let mut stale = vec![
            self.stage_path(job, Stage::Temp(1)),
            self.stage_path(job, Stage::Temp(2)),
        ];
        if failed {
            stale.push(self.stage_path(job, Stage::Output));
        }
        for path in &stale {
            remove_best_effort(path);
        }
    }

    /// Copy an intermediate into the debug directory when enabled.
    fn dump(&self, path: &Path, tag: &str) {
        if !self.settings.keep_temp {
            return;
        }
        let name = match (path.file_stem(), path.extension()) {
            (Some(stem), Some(ext)) => format!(
                "{}_{tag}.{}",
                stem.to_string_lossy(),
                ext.to_string_lossy()
            ),
            _ => return,
        };
        let target = self.settings.debug_dir.join(name);
        let result =
            fs::create_dir_all(&self.settings.debug_dir).and_then(|()| fs::copy(path, &target));
        if let Err(e) = result {
            warn!(path = %target.display(), "could not keep intermediate: {e}");
        }
    }
}

fn upscale_io(e: UpscaleError) -> FileError {
    match e {
        UpscaleError::Io(io) => FileError::Io(io),
        other => FileError::Io(io::Error::other(other.to_string())),
    }
}

/// `dir/a.png` → `dir/.a.partial.png`; keeps the extension the tools key on
/// and stays invisible to source discovery.
fn hidden_partial(dest: &Path) -> PathBuf {
    let partial = with_stem_suffix(dest, ".partial");
    let name = partial
        .file_name()
        .map(|n| format!(".{}", n.to_string_lossy()))
        .unwrap_or_default();
    partial.with_file_name(name)
}

fn copy_into_place(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let partial = partial_path(dest);
    fs::copy(src, &partial)?;
    fs::rename(&partial, dest)
}

fn remove_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "could not remove temporary file: {e}"),
    }
}

/// Run the engine over every source under the configured originals directory.
///
/// Returns the run's counters; only fatal conditions are errors.
pub fn run_upscale<U: Upscaler, B: ImageBackend>(
    tools: &U,
    backend: &B,
    settings: &UpscaleSettings,
    progress: Option<&Sender<PipelineEvent>>,
) -> Result<UpscaleStats, UpscaleError> {
    let inputs = sources::discover(&settings.source_dir, &settings.extensions);
    fs::create_dir_all(&settings.output_dir)?;
    let mut engine = UpscaleEngine::new(tools, backend, settings)?;

    for source in &inputs {
        let outcome = engine.upscale_file(source)?;
        if let Some(tx) = progress {
            let event = match outcome {
                UpscaleOutcome::Skipped(reason) => PipelineEvent::UpscaleSkipped {
                    source: source.relative.clone(),
                    reason: reason.to_string(),
                },
                UpscaleOutcome::Upscaled(job) => PipelineEvent::Upscaled {
                    source: source.relative.clone(),
                    tier: job.tier,
                    passes: job.invocations.len(),
                    fell_back: job.fell_back(),
                },
                UpscaleOutcome::Failed(error) => PipelineEvent::UpscaleFailed {
                    source: source.relative.clone(),
                    error,
                },
            };
            tx.send(event).ok();
        }
    }
    Ok(engine.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MockBackend;
    use tempfile::TempDir;
    use tools::tests::MockUpscaler;

    struct Fixture {
        tmp: TempDir,
        settings: UpscaleSettings,
    }

    impl Fixture {
        /// Fixture with the refiner's model installed.
        fn new() -> Self {
            Self::bare().with_model()
        }

        fn bare() -> Self {
            let tmp = TempDir::new().unwrap();
            let mut config = PipelineConfig::default();
            config.paths.originals_dir = tmp.path().join("lowres");
            config.paths.upscaled_dir = tmp.path().join("upscaled");
            config.upscale.audit_log = tmp.path().join("report.tsv");
            config.upscale.debug.dir = tmp.path().join("debug");
            config.upscale.realesrgan_path = tmp.path().join("realesrgan/realesrgan-ncnn-vulkan");
            let mut settings = UpscaleSettings::from_config(&config);
            settings.models_env_dir = None;
            Self { tmp, settings }
        }

        fn with_model(self) -> Self {
            let models = self.tmp.path().join("realesrgan/models");
            fs::create_dir_all(&models).unwrap();
            fs::write(models.join("realesr-animevideov3-x2.param"), "").unwrap();
            fs::write(models.join("realesr-animevideov3-x2.bin"), "").unwrap();
            self
        }

        fn source(&self, relative: &str) -> SourceImage {
            let path = self.settings.source_dir.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "pixels").unwrap();
            SourceImage {
                path,
                relative: relative.to_string(),
                modified: std::time::SystemTime::now(),
            }
        }

        fn audit_lines(&self) -> Vec<Vec<String>> {
            fs::read_to_string(&self.settings.audit_log)
                .unwrap()
                .lines()
                .skip(1)
                .map(|l| l.split('\t').map(String::from).collect())
                .collect()
        }
    }

    fn methods(lines: &[Vec<String>]) -> Vec<&str> {
        lines.iter().map(|l| l[3].as_str()).collect()
    }

    // =========================================================================
    // Skips
    // =========================================================================

    #[test]
    fn large_source_is_skipped_and_copied_through() {
        let fx = Fixture::new();
        let src = fx.source("big.jpg");
        let backend = MockBackend::with_dimensions(2200, 1600);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let outcome = engine.upscale_file(&src).unwrap();

        assert_eq!(
            outcome,
            UpscaleOutcome::Skipped(SkipReason::AlreadyLarge { target: 2000 })
        );
        assert!(tools.get_invocations().is_empty());
        assert!(fx.settings.output_dir.join("big.jpg").exists());
        let lines = fx.audit_lines();
        assert_eq!(methods(&lines), vec!["Skip"]);
        assert_eq!(lines[0][6], "target>=2000");
    }

    #[test]
    fn existing_output_is_skipped() {
        let fx = Fixture::new();
        let src = fx.source("booth/small.png");
        let dest = fx.settings.output_dir.join("booth_small.png");
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, "done").unwrap();
        let backend = MockBackend::with_dimensions(400, 300);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let outcome = engine.upscale_file(&src).unwrap();

        assert_eq!(outcome, UpscaleOutcome::Skipped(SkipReason::Exists));
        assert!(tools.get_invocations().is_empty());
        assert_eq!(fx.audit_lines()[0][6], "exists");
    }

    // =========================================================================
    // Tiers
    // =========================================================================

    #[test]
    fn easy_tier_runs_one_waifu2x_pass() {
        let fx = Fixture::new();
        let src = fx.source("a.png");
        let backend = MockBackend::with_dimensions(900, 600);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };

        assert_eq!(job.tier, UpscaleTier::Easy);
        assert_eq!(job.invocations.len(), 1);
        assert_eq!(job.invocations[0].noise, 1);
        assert!(fx.settings.output_dir.join("a.png").exists());
        assert!(!fx.settings.output_dir.join(".a.partial.png").exists());
    }

    #[test]
    fn hard_tier_chains_two_passes_and_refines() {
        let fx = Fixture::new();
        let src = fx.source("tiny.png");
        let backend = MockBackend::with_dimensions(180, 240);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();
        assert!(engine.refiner_available());

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };

        let tools_run: Vec<Tool> = job.invocations.iter().map(|i| i.tool).collect();
        assert_eq!(tools_run, vec![Tool::Waifu2x, Tool::Waifu2x, Tool::RealEsrgan]);
        assert_eq!(job.black_frame, Some(false));
        assert_eq!(
            job.invocations[2].models_dir,
            Some(fx.tmp.path().join("realesrgan/models"))
        );

        let lines = fx.audit_lines();
        assert_eq!(methods(&lines), vec!["Waifu2x", "Waifu2x", "RealESRGAN"]);
        assert!(lines.iter().all(|l| l[6].contains("tier=hard")));
        assert!(lines.iter().all(|l| l[5] == "2x"));

        let out = &fx.settings.output_dir;
        assert!(out.join("tiny.png").exists());
        assert!(!out.join("tiny_tmp1.png").exists());
        assert!(!out.join("tiny_tmp2.png").exists());
    }

    #[test]
    fn hard_tier_black_refinement_falls_back_to_two_pass_result() {
        let fx = Fixture::new();
        let src = fx.source("tiny.png");
        let backend = MockBackend::with_dimensions(180, 240);
        backend.set_brightness(&fx.settings.output_dir.join(".tiny.partial.png"), 0.0);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };

        assert!(job.fell_back());
        assert_eq!(job.invocations.len(), 3);
        assert_eq!(methods(&fx.audit_lines()).last(), Some(&"Fallback"));
        assert_eq!(engine.stats().fallbacks, 1);
        assert!(fx.settings.output_dir.join("tiny.png").exists());
    }

    #[test]
    fn mid_tier_black_refinement_reruns_waifu2x() {
        let fx = Fixture::new();
        let src = fx.source("mid.png");
        let backend = MockBackend::with_dimensions(500, 400);
        backend.set_brightness(&fx.settings.output_dir.join(".mid.partial.png"), 0.005);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };

        let tools_run: Vec<Tool> = job.invocations.iter().map(|i| i.tool).collect();
        assert_eq!(tools_run, vec![Tool::Waifu2x, Tool::RealEsrgan, Tool::Waifu2x]);
        assert_eq!(job.invocations[2].noise, 0);
        assert_eq!(
            methods(&fx.audit_lines()),
            vec!["Waifu2x", "RealESRGAN", "Fallback", "Waifu2x"]
        );
    }

    #[test]
    fn mid_tier_without_refiner_runs_second_waifu2x() {
        let fx = Fixture::new();
        let src = fx.source("mid.png");
        let backend = MockBackend::with_dimensions(500, 400);
        let tools = MockUpscaler::without(Tool::RealEsrgan);
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };
        assert_eq!(job.invocations.len(), 2);
        assert!(job.invocations.iter().all(|i| i.tool == Tool::Waifu2x));
        assert_eq!(job.black_frame, None);
    }

    #[test]
    fn black_detection_can_be_disabled() {
        let mut fx = Fixture::new();
        fx.settings.detect_black = false;
        let src = fx.source("tiny.png");
        let backend = MockBackend::with_dimensions(100, 100);
        backend.set_brightness(&fx.settings.output_dir.join(".tiny.partial.png"), 0.0);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };
        assert_eq!(job.black_frame, None);
        assert_eq!(engine.stats().fallbacks, 0);
    }

    #[test]
    fn flatten_alpha_feeds_refiner_a_flattened_copy() {
        let mut fx = Fixture::new();
        fx.settings.flatten_alpha = true;
        let src = fx.source("tiny.png");
        let backend = MockBackend::with_dimensions(100, 100);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let UpscaleOutcome::Upscaled(job) = engine.upscale_file(&src).unwrap() else {
            panic!("expected upscale");
        };
        let refine = &job.invocations[2];
        assert!(refine.input.ends_with("tiny_tmp2_flat.png"));
        assert!(!refine.input.exists());
    }

    #[test]
    fn keep_temp_dumps_intermediates() {
        let mut fx = Fixture::new();
        fx.settings.keep_temp = true;
        let src = fx.source("tiny.png");
        let backend = MockBackend::with_dimensions(100, 100);
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();
        engine.upscale_file(&src).unwrap();

        let debug = &fx.settings.debug_dir;
        assert!(debug.join("tiny_tmp1_hard_tmp1.png").exists());
        assert!(debug.join("tiny_tmp2_hard_tmp2.png").exists());
        assert!(debug.join("tiny_hard_final.png").exists());
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn tool_failure_is_logged_and_not_fatal() {
        let fx = Fixture::new();
        let src = fx.source("tiny.png");
        let backend = MockBackend::with_dimensions(100, 100);
        let tools = MockUpscaler::failing(Tool::RealEsrgan, "vkCreateDevice failed");
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let outcome = engine.upscale_file(&src).unwrap();

        assert_eq!(outcome, UpscaleOutcome::Failed("vkCreateDevice failed".into()));
        assert_eq!(engine.stats().errors, 1);
        let lines = fx.audit_lines();
        let last = lines.last().unwrap();
        assert_eq!(last[3], "Error");
        assert_eq!(last[4], "realesr-animevideov3-x2");
        assert_eq!(last[6], "vkCreateDevice failed");
        let out = &fx.settings.output_dir;
        assert!(!out.join("tiny.png").exists());
        assert!(!out.join("tiny_tmp1.png").exists());
        assert!(!out.join("tiny_tmp2.png").exists());
        assert!(!out.join(".tiny.partial.png").exists());
    }

    #[cfg(unix)]
    #[test]
    fn real_tool_stderr_reaches_the_audit_log() {
        use tools::tests::{COPY_SCRIPT, write_script};

        let fx = Fixture::new();
        let src = fx.source("tiny.png");
        let waifu2x = fx.tmp.path().join("waifu2x/waifu2x-ncnn-vulkan");
        write_script(&waifu2x, COPY_SCRIPT);
        write_script(
            &fx.settings.realesrgan_path,
            "echo \"vkCreateDevice failed\" >&2\nexit 1\n",
        );
        let external = tools::ExternalTools::new(&waifu2x, &fx.settings.realesrgan_path);
        let backend = MockBackend::with_dimensions(100, 100);
        let mut engine = UpscaleEngine::new(&external, &backend, &fx.settings).unwrap();

        let outcome = engine.upscale_file(&src).unwrap();

        assert_eq!(outcome, UpscaleOutcome::Failed("vkCreateDevice failed".into()));
        let lines = fx.audit_lines();
        let last = lines.last().unwrap();
        assert_eq!(last[3], "Error");
        assert_eq!(last[6], "vkCreateDevice failed");
        assert!(!fx.settings.output_dir.join("tiny.png").exists());
    }

    #[test]
    fn probe_failure_is_logged_and_not_fatal() {
        let fx = Fixture::new();
        let src = fx.source("broken.png");
        let backend = MockBackend::new();
        let tools = MockUpscaler::new();
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        let outcome = engine.upscale_file(&src).unwrap();
        assert!(matches!(outcome, UpscaleOutcome::Failed(_)));
        assert_eq!(methods(&fx.audit_lines()), vec!["Error"]);
    }

    #[test]
    fn missing_model_is_fatal_and_lists_available() {
        let fx = Fixture::bare();
        let models = fx.tmp.path().join("realesrgan/models");
        fs::create_dir_all(&models).unwrap();
        fs::write(models.join("realesrgan-x4plus.param"), "").unwrap();
        let backend = MockBackend::new();
        let tools = MockUpscaler::new();

        let Err(err) = UpscaleEngine::new(&tools, &backend, &fx.settings) else {
            panic!("expected a fatal error");
        };
        match &err {
            UpscaleError::ModelNotFound { available, .. } => {
                assert_eq!(available, &vec!["realesrgan-x4plus".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("realesr-animevideov3-x2"));
    }

    #[test]
    fn missing_waifu2x_is_fatal_when_needed() {
        let fx = Fixture::new();
        let src = fx.source("a.png");
        let backend = MockBackend::with_dimensions(900, 600);
        let tools = MockUpscaler {
            missing: [Tool::Waifu2x, Tool::RealEsrgan].into(),
            ..MockUpscaler::default()
        };
        let mut engine = UpscaleEngine::new(&tools, &backend, &fx.settings).unwrap();

        assert!(matches!(
            engine.upscale_file(&src),
            Err(UpscaleError::ToolMissing { tool: Tool::Waifu2x, .. })
        ));
    }

    // =========================================================================
    // run_upscale
    // =========================================================================

    #[test]
    fn run_reports_events_and_stats() {
        let fx = Fixture::new();
        let big = fx.source("big.jpg");
        let small = fx.source("nested/small.png");
        let backend = MockBackend::new();
        backend.set_dimensions(&big.path, 2400, 1800);
        backend.set_dimensions(&small.path, 800, 600);
        let tools = MockUpscaler::without(Tool::RealEsrgan);
        let (tx, rx) = std::sync::mpsc::channel();

        let stats = run_upscale(&tools, &backend, &fx.settings, Some(&tx)).unwrap();
        drop(tx);

        assert_eq!(stats.total, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.waifu2x_passes, 1);
        assert!(fx.settings.output_dir.join("nested_small.png").exists());
        let events: Vec<PipelineEvent> = rx.iter().collect();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[1], PipelineEvent::Upscaled { source, tier: UpscaleTier::Easy, .. } if source == "nested/small.png"));
    }

    #[test]
    fn stats_merge_and_display() {
        let mut a = UpscaleStats {
            total: 1,
            errors: 1,
            ..UpscaleStats::default()
        };
        a.merge(&UpscaleStats {
            total: 2,
            refined: 1,
            ..UpscaleStats::default()
        });
        assert_eq!(a.total, 3);
        assert_eq!(
            a.to_string(),
            "3 upscaled, 0 skipped, 0 waifu2x passes, 1 refined, 0 fallbacks, 1 errors"
        );
    }
}
