//! # stillpress
//!
//! A media asset pipeline for an image gallery. Low-resolution originals go in;
//! upscaled working copies, responsive variants at four size tiers and two
//! JSON indexes come out.
//!
//! # Architecture: Staged Pipeline
//!
//! ```text
//! 1. Upscale    originals/  →  upscaled/          (waifu2x / Real-ESRGAN, tiered)
//! 2. Render     upscaled/   →  assets/{s,s2x,l,l2x}/<id>.<fmt>
//! 3. Reconcile  canonical + generated index + fresh data  →  records
//! 4. Index      records     →  images.generated.json + images.slim.json
//! 5. Guard      canonical index hashed before and after; any change fails the run
//! ```
//!
//! Every stage is restartable. Variants are encoded only when missing or older
//! than their input, record identifiers are stable across runs, and all index
//! files are written atomically.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`upscale`] | Tier decision, external tool invocation, black-frame fallback, audit log |
//! | [`render`] | Variant planning and incremental encoding, LQIP placeholders |
//! | [`reconcile`] | Matching prior records, identity minting, field ownership merge |
//! | [`index`] | Sorting, full and slim index writing, variant garbage collection |
//! | [`integrity`] | SHA-256 guard around the canonical index |
//! | [`pipeline`] | Orchestration of a full run, progress events, run statistics |
//! | [`config`] | `stillpress.toml` loading, validation and stock defaults |
//! | [`imaging`] | Pure-Rust image operations behind the [`imaging::ImageBackend`] trait |
//! | [`sources`] | Source discovery under the originals directory |
//! | [`mirror`] | Incremental copy of the output tree into a public directory |
//! | [`types`] | Record and index types shared across stages |
//! | [`naming`] | Path, file-name and identifier helpers |
//! | [`atomic`] | Write-to-sibling-then-rename file replacement |
//! | [`output`] | CLI output formatting |
//!
//! # Field Ownership
//!
//! Records carry two kinds of fields. Human-authored ones (`title`, `alt`,
//! `tags`, `links`, unknown keys) are only ever copied forward from the prior
//! record. Pipeline-derived ones (`w`, `h`, `sizes`, `lqip`, `src`) are
//! recomputed on every successful run. The canonical index is read, never
//! written; [`integrity`] enforces that.

pub mod atomic;
pub mod config;
pub mod imaging;
pub mod index;
pub mod integrity;
pub mod mirror;
pub mod naming;
pub mod output;
pub mod pipeline;
pub mod reconcile;
pub mod render;
pub mod sources;
pub mod types;
pub mod upscale;
