//! Pure calculation functions for image dimensions and brightness.
//!
//! All functions here are pure and testable without any I/O or images.

/// Fit `source` inside a `bound × bound` box, preserving aspect ratio.
///
/// Never enlarges: a source already inside the box is returned unchanged.
/// Output edges are at least 1px.
///
/// # Examples
/// ```
/// # use stillpress::imaging::fit_within;
/// // landscape 3000x2000 into a 1200 box → 1200x800
/// assert_eq!(fit_within((3000, 2000), 1200), (1200, 800));
///
/// // small source is not enlarged
/// assert_eq!(fit_within((640, 480), 1200), (640, 480));
/// ```
pub fn fit_within(source: (u32, u32), bound: u32) -> (u32, u32) {
    let (w, h) = source;
    let longer = w.max(h);
    if longer <= bound || longer == 0 {
        return (w, h);
    }
    let ratio = bound as f64 / longer as f64;
    let scale = |edge: u32| ((edge as f64 * ratio).round() as u32).max(1);
    if w >= h {
        (bound, scale(h))
    } else {
        (scale(w), bound)
    }
}

/// Mean Rec. 601 luma of interleaved RGB8 pixels, as a fraction of full scale.
///
/// Returns 0.0 for an empty buffer.
pub fn mean_luma_fraction(rgb: &[u8]) -> f64 {
    let pixels = rgb.len() / 3;
    if pixels == 0 {
        return 0.0;
    }
    let sum: f64 = rgb
        .chunks_exact(3)
        .map(|px| 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64)
        .sum();
    sum / pixels as f64 / 255.0
}
