//! Append-only TSV audit trail of every upscale decision.
//!
//! ```text
//! timestamp	src	out	method	model	scale	extra
//! 2024-02-01T10:00:00.000Z	originals/a.png	upscaled/a.png	Waifu2x	models-cunet	2x	tier=easy
//! ```
//!
//! The header is written once when the file is created; existing files are
//! only ever appended to.

use crate::naming::iso_timestamp;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const HEADER: &str = "timestamp\tsrc\tout\tmethod\tmodel\tscale\textra";

/// What happened to a file, as recorded in the `method` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditMethod {
    Waifu2x,
    RealEsrgan,
    Skip,
    Error,
    Fallback,
}

impl fmt::Display for AuditMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AuditMethod::Waifu2x => "Waifu2x",
            AuditMethod::RealEsrgan => "RealESRGAN",
            AuditMethod::Skip => "Skip",
            AuditMethod::Error => "Error",
            AuditMethod::Fallback => "Fallback",
        })
    }
}

/// One audit line. The timestamp is taken when the line is written.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub src: PathBuf,
    pub out: PathBuf,
    pub method: AuditMethod,
    pub model: String,
    pub scale: String,
    pub extra: String,
}

impl AuditEntry {
    pub fn new(src: &Path, out: &Path, method: AuditMethod) -> Self {
        Self {
            src: src.to_path_buf(),
            out: out.to_path_buf(),
            method,
            model: String::new(),
            scale: String::new(),
            extra: String::new(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Nominal scale factor, rendered as `2x`.
    pub fn scale(mut self, factor: u32) -> Self {
        self.scale = format!("{factor}x");
        self
    }

    pub fn extra(mut self, extra: impl Into<String>) -> Self {
        self.extra = extra.into();
        self
    }

    /// Tab-separated line without the trailing newline.
    pub fn to_line(&self, timestamp: &str) -> String {
        [
            timestamp.to_string(),
            self.src.display().to_string(),
            self.out.display().to_string(),
            self.method.to_string(),
            self.model.clone(),
            self.scale.clone(),
            self.extra.clone(),
        ]
        .iter()
        .map(|field| sanitize(field))
        .collect::<Vec<_>>()
        .join("\t")
    }
}

/// Tabs and line breaks would corrupt the row structure.
fn sanitize(field: &str) -> String {
    field
        .split(['\t', '\r', '\n'])
        .filter(|part| !part.trim().is_empty())
        .map(str::trim)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Single-writer handle on the audit file.
pub struct AuditLog {
    path: PathBuf,
    file: File,
}

impl AuditLog {
    /// Open `path` for appending, writing the header if the file is new.
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let is_new = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if is_new {
            writeln!(file, "{HEADER}")?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &AuditEntry) -> io::Result<()> {
        let line = entry.to_line(&iso_timestamp(SystemTime::now()));
        writeln!(self.file, "{line}")
    }
}
