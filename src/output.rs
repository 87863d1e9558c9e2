//! CLI output formatting for all pipeline stages.
//!
//! # Information-First Display
//!
//! Every source is shown by its relative path under the originals tree, the
//! identity anchor of its record. The record id and per-variant counts are
//! secondary context on the same line or an indented line below.
//!
//! # Output Format
//!
//! ## Upscale
//!
//! ```text
//! Upscale
//!     tiny.png: hard, 3 passes
//!     mid.png: mid, 3 passes (black frame, fell back)
//!     big.jpg: skipped (target>=2000)
//!     broken.png: FAILED vkCreateDevice failed
//! ```
//!
//! ## Render
//!
//! ```text
//! 001/003 booth/neko.png → 0190a1b2c3d4... (new)
//!     8 encoded, 0 up to date
//! ```
//!
//! ## Summary
//!
//! ```text
//! Wrote 3 records → src/data/images.generated.json
//! Wrote 3 slim entries → public/data/images.slim.json
//! processed=3 made=16 skipped=8 errors=0 time=1.2s
//! upscale: 1 upscaled, 1 skipped, 2 waifu2x passes, 1 refined, 0 fallbacks, 0 errors
//! ```
//!
//! # Architecture
//!
//! Each stage has a `format_*` function (returns `Vec<String>`) for
//! testability and [`print_lines`] writes them to stdout. Format functions
//! are pure: no I/O, no side effects.

use crate::config::PipelineConfig;
use crate::pipeline::{PipelineEvent, RunStats, VerifyReport};
use crate::upscale::UpscaleStats;
use std::time::Duration;

// ============================================================================
// Shared helpers
// ============================================================================

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// `850ms` below a second, `1.2s` above.
pub fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms >= 1000 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        format!("{ms}ms")
    }
}

pub fn print_lines(lines: &[String]) {
    for line in lines {
        println!("{}", line);
    }
}

// ============================================================================
// Progress events
// ============================================================================

/// Format a single progress event as display lines.
pub fn format_event(event: &PipelineEvent) -> Vec<String> {
    match event {
        PipelineEvent::UpscaleSkipped { source, reason } => {
            vec![format!("{}{}: skipped ({})", indent(1), source, reason)]
        }
        PipelineEvent::Upscaled {
            source,
            tier,
            passes,
            fell_back,
        } => {
            let plural = if *passes == 1 { "pass" } else { "passes" };
            let mut line = format!("{}{}: {}, {} {}", indent(1), source, tier, passes, plural);
            if *fell_back {
                line.push_str(" (black frame, fell back)");
            }
            vec![line]
        }
        PipelineEvent::UpscaleFailed { source, error } => {
            vec![format!("{}{}: FAILED {}", indent(1), source, error)]
        }
        PipelineEvent::NoSources { dir } => {
            vec![format!("No source images found in {}", dir.display())]
        }
        PipelineEvent::ImageRendered {
            index,
            total,
            source,
            id,
            is_new,
            made,
            skipped,
        } => {
            let marker = if *is_new { " (new)" } else { "" };
            vec![
                format!(
                    "{}/{} {} \u{2192} {}{}",
                    format_index(*index),
                    format_index(*total),
                    source,
                    id,
                    marker
                ),
                format!("{}{} encoded, {} up to date", indent(1), made, skipped),
            ]
        }
        PipelineEvent::FileFailed { source, error } => {
            vec![format!("FAILED {}: {}", source, error)]
        }
        PipelineEvent::IndexWritten { path, records } => {
            vec![format!("Wrote {} records \u{2192} {}", records, path.display())]
        }
        PipelineEvent::SlimIndexWritten { path, entries } => {
            vec![format!("Wrote {} slim entries \u{2192} {}", entries, path.display())]
        }
        PipelineEvent::GarbageCollected { removed } => {
            vec![format!("Removed {} orphaned variant files", removed)]
        }
        PipelineEvent::Mirrored { dir, stats } => {
            let mut line = format!(
                "Mirrored \u{2192} {} ({} copied, {} removed",
                dir.display(),
                stats.copied,
                stats.removed
            );
            if stats.failed > 0 {
                line.push_str(&format!(", {} failed", stats.failed));
            }
            line.push(')');
            vec![line]
        }
    }
}

// ============================================================================
// Summaries
// ============================================================================

pub fn format_upscale_summary(stats: &UpscaleStats) -> Vec<String> {
    vec![format!("upscale: {}", stats)]
}

/// End-of-run summary, printed even when some files failed.
pub fn format_summary(stats: &RunStats) -> Vec<String> {
    let mut lines = vec![format!(
        "processed={} made={} skipped={} errors={} time={}",
        stats.processed,
        stats.made,
        stats.skipped,
        stats.errors,
        format_duration(stats.elapsed)
    )];
    if stats.orphans > 0 {
        lines.push(format!(
            "{}{} records kept without a source this run",
            indent(1),
            stats.orphans
        ));
    }
    if let Some(upscale) = &stats.upscale {
        lines.extend(format_upscale_summary(upscale));
    }
    lines
}

/// Effective configuration as pretty JSON, one line per entry.
pub fn format_effective_config(config: &PipelineConfig) -> Vec<String> {
    let json = serde_json::to_string_pretty(config).unwrap_or_else(|e| format!("<{e}>"));
    std::iter::once("Effective config:".to_string())
        .chain(json.lines().map(String::from))
        .collect()
}

pub fn format_verify_report(report: &VerifyReport) -> Vec<String> {
    let mut lines = vec![
        format!("canonical: {} records", report.canonical_records),
        format!("generated: {} records", report.generated_records),
    ];
    if !report.duplicate_ids.is_empty() {
        lines.push(format!("duplicate ids: {}", report.duplicate_ids.join(", ")));
    }
    if !report.incomplete_sizes.is_empty() {
        lines.push(format!(
            "incomplete sizes: {}",
            report.incomplete_sizes.join(", ")
        ));
    }
    if report.is_clean() {
        lines.push("OK".to_string());
    }
    lines
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::MirrorStats;
    use crate::upscale::plan::UpscaleTier;
    use std::path::PathBuf;

    #[test]
    fn duration_formats() {
        assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
        assert_eq!(format_duration(Duration::from_millis(1234)), "1.2s");
    }

    #[test]
    fn rendered_event_shows_source_then_counts() {
        let lines = format_event(&PipelineEvent::ImageRendered {
            index: 1,
            total: 12,
            source: "booth/neko.png".into(),
            id: "abc".into(),
            is_new: true,
            made: 8,
            skipped: 0,
        });
        assert_eq!(
            lines,
            vec![
                "001/012 booth/neko.png \u{2192} abc (new)",
                "    8 encoded, 0 up to date"
            ]
        );
    }

    #[test]
    fn upscale_events() {
        let done = format_event(&PipelineEvent::Upscaled {
            source: "tiny.png".into(),
            tier: UpscaleTier::Hard,
            passes: 3,
            fell_back: true,
        });
        assert_eq!(done, vec!["    tiny.png: hard, 3 passes (black frame, fell back)"]);

        let one = format_event(&PipelineEvent::Upscaled {
            source: "a.png".into(),
            tier: UpscaleTier::Easy,
            passes: 1,
            fell_back: false,
        });
        assert_eq!(one, vec!["    a.png: easy, 1 pass"]);

        let skipped = format_event(&PipelineEvent::UpscaleSkipped {
            source: "big.jpg".into(),
            reason: "target>=2000".into(),
        });
        assert_eq!(skipped, vec!["    big.jpg: skipped (target>=2000)"]);
    }

    #[test]
    fn no_sources_notice() {
        let lines = format_event(&PipelineEvent::NoSources {
            dir: PathBuf::from("originals/originals_lowres"),
        });
        assert_eq!(lines, vec!["No source images found in originals/originals_lowres"]);
    }

    #[test]
    fn mirror_line_mentions_failures_only_when_present() {
        let clean = format_event(&PipelineEvent::Mirrored {
            dir: PathBuf::from("public/assets"),
            stats: MirrorStats {
                copied: 2,
                removed: 1,
                failed: 0,
            },
        });
        assert_eq!(clean, vec!["Mirrored \u{2192} public/assets (2 copied, 1 removed)"]);
    }

    #[test]
    fn summary_includes_upscale_counters() {
        let stats = RunStats {
            processed: 3,
            made: 16,
            skipped: 8,
            elapsed: Duration::from_millis(1200),
            upscale: Some(UpscaleStats {
                total: 1,
                ..UpscaleStats::default()
            }),
            ..RunStats::default()
        };
        let lines = format_summary(&stats);
        assert_eq!(lines[0], "processed=3 made=16 skipped=8 errors=0 time=1.2s");
        assert!(lines[1].starts_with("upscale: 1 upscaled"));
    }

    #[test]
    fn effective_config_is_json() {
        let lines = format_effective_config(&PipelineConfig::default());
        assert_eq!(lines[0], "Effective config:");
        let json = lines[1..].join("\n");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["images"]["small_width"], 236);
    }

    #[test]
    fn verify_report_ok() {
        let lines = format_verify_report(&VerifyReport {
            canonical_records: 2,
            generated_records: 3,
            ..VerifyReport::default()
        });
        assert_eq!(lines.last().map(String::as_str), Some("OK"));
    }
}
