//! Upscale decision state machine.
//!
//! The tier is a pure function of the source's longest edge `m`:
//!
//! | Condition | Tier | Steps |
//! |---|---|---|
//! | `m >= target` | Skip | none |
//! | `m >= easy` | Easy | waifu2x 2× (noise 1) |
//! | `m <= hard` | Hard | waifu2x 2× (n1) → waifu2x 2× (n0) → refine, fallback to the two-pass result |
//! | otherwise | Mid | waifu2x 2× (n1) → refine, fallback to waifu2x 2× (n0) |
//!
//! Without a refiner the Hard tier promotes its two-pass result and the Mid
//! tier runs the second waifu2x pass instead. Plans are data: the engine in
//! [`super`] interprets them, so the decision can be tested without running
//! any tool.

use std::fmt;

/// Tier thresholds on the longest edge, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub target: u32,
    pub easy: u32,
    pub hard: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            target: 2000,
            easy: 700,
            hard: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpscaleTier {
    Skip,
    Easy,
    Mid,
    Hard,
}

impl UpscaleTier {
    pub fn classify(max_edge: u32, thresholds: &Thresholds) -> Self {
        if max_edge >= thresholds.target {
            UpscaleTier::Skip
        } else if max_edge >= thresholds.easy {
            UpscaleTier::Easy
        } else if max_edge <= thresholds.hard {
            UpscaleTier::Hard
        } else {
            UpscaleTier::Mid
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            UpscaleTier::Skip => "skip",
            UpscaleTier::Easy => "easy",
            UpscaleTier::Mid => "mid",
            UpscaleTier::Hard => "hard",
        }
    }
}

impl fmt::Display for UpscaleTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Where an intermediate image lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Source,
    /// Numbered temporary next to the output (`_tmp1`, `_tmp2`).
    Temp(u8),
    Output,
}

/// What to do when a refinement result is near-black.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    /// Use an earlier stage as the output.
    Promote(Stage),
    /// Rerun waifu2x from `from` into the output.
    Waifu2x { from: Stage, noise: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Waifu2x { from: Stage, to: Stage, noise: u8 },
    /// Real-ESRGAN pass into the output, checked for black frames.
    Refine { from: Stage, fallback: Fallback },
    /// Move `from` into the output unchanged.
    Promote { from: Stage },
}

impl Step {
    /// Upscaler passes this step performs when it succeeds.
    pub fn passes(&self) -> usize {
        match self {
            Step::Waifu2x { .. } | Step::Refine { .. } => 1,
            Step::Promote { .. } => 0,
        }
    }
}

/// Build the step list for a tier.
pub fn plan(tier: UpscaleTier, refiner_available: bool) -> Vec<Step> {
    use Stage::{Output, Source, Temp};
    match (tier, refiner_available) {
        (UpscaleTier::Skip, _) => Vec::new(),
        (UpscaleTier::Easy, _) => vec![Step::Waifu2x {
            from: Source,
            to: Output,
            noise: 1,
        }],
        (UpscaleTier::Hard, refine) => {
            let mut steps = vec![
                Step::Waifu2x {
                    from: Source,
                    to: Temp(1),
                    noise: 1,
                },
                Step::Waifu2x {
                    from: Temp(1),
                    to: Temp(2),
                    noise: 0,
                },
            ];
            steps.push(if refine {
                Step::Refine {
                    from: Temp(2),
                    fallback: Fallback::Promote(Temp(2)),
                }
            } else {
                Step::Promote { from: Temp(2) }
            });
            steps
        }
        (UpscaleTier::Mid, true) => vec![
            Step::Waifu2x {
                from: Source,
                to: Temp(1),
                noise: 1,
            },
            Step::Refine {
                from: Temp(1),
                fallback: Fallback::Waifu2x {
                    from: Temp(1),
                    noise: 0,
                },
            },
        ],
        (UpscaleTier::Mid, false) => vec![
            Step::Waifu2x {
                from: Source,
                to: Temp(1),
                noise: 1,
            },
            Step::Waifu2x {
                from: Temp(1),
                to: Output,
                noise: 0,
            },
        ],
    }
}

/// Total upscaler passes a plan performs when nothing falls back.
pub fn pass_count(steps: &[Step]) -> usize {
    steps.iter().map(Step::passes).sum()
}
