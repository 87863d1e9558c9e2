//! External upscaler invocation.
//!
//! Two executables are driven through the [`Upscaler`] trait:
//!
//! | Tool | Role | Arguments |
//! |---|---|---|
//! | waifu2x-ncnn-vulkan | noise-reducing 2× | `-i in -o out -s scale -n noise -t tile -m model` |
//! | realesrgan-ncnn-vulkan | refinement | `-i in -o out -s scale -t tile -m models_dir -n model [-f fmt]` |
//!
//! Both run with their own directory as the working directory, since they
//! resolve bundled models relative to it. The executable and every path
//! argument are made absolute first, so relative config paths still point
//! where the user meant. A non-zero exit or a spawn failure is an error
//! carrying the captured standard error.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::debug;

/// Environment variables checked, in order, for a Real-ESRGAN model directory.
pub const MODEL_DIR_ENV_VARS: [&str; 2] = ["REALESRGAN_MODELS", "REAL_ESRGAN_MODELS"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Waifu2x,
    RealEsrgan,
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tool::Waifu2x => "waifu2x",
            Tool::RealEsrgan => "Real-ESRGAN",
        })
    }
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} executable not found at {path}")]
    NotFound { tool: Tool, path: PathBuf },
    #[error("failed to start {tool}: {source}")]
    Spawn {
        tool: Tool,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with status {status}: {stderr}")]
    Failed {
        tool: Tool,
        status: String,
        stderr: String,
    },
}

impl ToolError {
    /// Text suitable for the audit log's free-text column.
    pub fn detail(&self) -> String {
        match self {
            ToolError::Failed { stderr, status, .. } if stderr.trim().is_empty() => {
                format!("exit status {status}")
            }
            ToolError::Failed { stderr, .. } => stderr.trim().to_string(),
            other => other.to_string(),
        }
    }
}

/// One fully-specified tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: Tool,
    pub input: PathBuf,
    pub output: PathBuf,
    pub scale: u32,
    /// waifu2x noise level; unused by Real-ESRGAN.
    pub noise: u8,
    pub tile: u32,
    /// waifu2x model directory name or Real-ESRGAN model name.
    pub model: String,
    /// Real-ESRGAN model directory.
    pub models_dir: Option<PathBuf>,
    /// Real-ESRGAN output format.
    pub format: Option<String>,
}

impl ToolInvocation {
    pub fn to_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-i".into(),
            self.input.clone().into(),
            "-o".into(),
            self.output.clone().into(),
            "-s".into(),
            self.scale.to_string().into(),
        ];
        match self.tool {
            Tool::Waifu2x => {
                args.extend([
                    "-n".into(),
                    self.noise.to_string().into(),
                    "-t".into(),
                    self.tile.to_string().into(),
                    "-m".into(),
                    self.model.clone().into(),
                ]);
            }
            Tool::RealEsrgan => {
                args.extend(["-t".into(), self.tile.to_string().into()]);
                if let Some(dir) = &self.models_dir {
                    args.extend(["-m".into(), dir.clone().into()]);
                }
                args.extend(["-n".into(), self.model.clone().into()]);
                if let Some(format) = &self.format {
                    args.extend(["-f".into(), format.clone().into()]);
                }
            }
        }
        args
    }
}

/// Seam between the decision engine and the actual executables.
pub trait Upscaler {
    /// Whether the tool's executable is present.
    fn available(&self, tool: Tool) -> bool;

    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError>;
}

/// Runs the real executables with [`Command`].
#[derive(Debug, Clone)]
pub struct ExternalTools {
    pub waifu2x: PathBuf,
    pub realesrgan: PathBuf,
    /// Relative paths are taken from here; the working directory when unset.
    pub base_dir: Option<PathBuf>,
}

impl ExternalTools {
    pub fn new(waifu2x: impl Into<PathBuf>, realesrgan: impl Into<PathBuf>) -> Self {
        Self {
            waifu2x: waifu2x.into(),
            realesrgan: realesrgan.into(),
            base_dir: None,
        }
    }

    /// Resolve relative executable and argument paths against `dir`.
    pub fn relative_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match &self.base_dir {
            Some(base) => base.join(path),
            None => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
        }
    }

    fn path(&self, tool: Tool) -> PathBuf {
        self.resolve(match tool {
            Tool::Waifu2x => &self.waifu2x,
            Tool::RealEsrgan => &self.realesrgan,
        })
    }
}

impl Upscaler for ExternalTools {
    fn available(&self, tool: Tool) -> bool {
        self.path(tool).is_file()
    }

    fn run(&self, invocation: &ToolInvocation) -> Result<(), ToolError> {
        let exe = self.path(invocation.tool);
        if !exe.is_file() {
            return Err(ToolError::NotFound {
                tool: invocation.tool,
                path: exe,
            });
        }
        // The tool runs from its own directory.
        let resolved = ToolInvocation {
            input: self.resolve(&invocation.input),
            output: self.resolve(&invocation.output),
            models_dir: invocation.models_dir.as_deref().map(|d| self.resolve(d)),
            ..invocation.clone()
        };
        let args = resolved.to_args();
        debug!(tool = %invocation.tool, exe = %exe.display(), ?args, "running upscaler");

        let mut command = Command::new(&exe);
        command.args(&args);
        if let Some(dir) = exe.parent().filter(|d| !d.as_os_str().is_empty()) {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|e| ToolError::Spawn {
            tool: invocation.tool,
            source: e,
        })?;

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: invocation.tool,
                status: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

/// First configured model directory from the environment.
pub fn models_dir_from_env() -> Option<PathBuf> {
    MODEL_DIR_ENV_VARS
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .find(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn has_model(dir: &Path, model: &str) -> bool {
    dir.join(format!("{model}.param")).is_file() && dir.join(format!("{model}.bin")).is_file()
}

fn subdirectories(dir: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs
}

fn tool_dir(tool_path: &Path) -> PathBuf {
    tool_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Locate the directory holding `<model>.param` and `<model>.bin`.
///
/// Search order: `env_dir`, then `<tool dir>/models`, then every direct
/// subdirectory of the tool directory (alphabetical).
pub fn find_models_dir(tool_path: &Path, model: &str, env_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = env_dir.filter(|d| has_model(d, model)) {
        return Some(dir.to_path_buf());
    }
    let base = tool_dir(tool_path);
    let direct = base.join("models");
    if has_model(&direct, model) {
        return Some(direct);
    }
    subdirectories(&base)
        .into_iter()
        .find(|dir| has_model(dir, model))
}

/// Every model name (`*.param` stem) found next to the tool, sorted.
pub fn list_available_models(tool_path: &Path) -> Vec<String> {
    let base = tool_dir(tool_path);
    let mut dirs = vec![base.join("models")];
    dirs.extend(subdirectories(&base));

    let names: BTreeSet<String> = dirs
        .iter()
        .flat_map(|dir| fs::read_dir(dir).into_iter().flatten().filter_map(Result::ok))
        .map(|entry| entry.path())
        .filter(|p| p.extension().is_some_and(|e| e == "param"))
        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .collect();
    names.into_iter().collect()
}
