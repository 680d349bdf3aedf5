// ============================================================================
// ASPECT-RATIO NORMALISATION
// ============================================================================
//
// Requests that carry reference images must use one of the service's
// supported aspect ratios.  Selections are snapped to the nearest one by
// growing a single axis, never by shrinking.

use crate::canvas::SelectionBounds;

/// Ratio differences at or under this are treated as already matching.
pub const DEFAULT_TOLERANCE: f64 = 0.01;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn value(&self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.width, self.height)
    }
}

/// Supported ratios, widest first.
pub const SUPPORTED_RATIOS: [AspectRatio; 10] = [
    AspectRatio::new(21, 9),
    AspectRatio::new(16, 9),
    AspectRatio::new(5, 4),
    AspectRatio::new(4, 3),
    AspectRatio::new(3, 2),
    AspectRatio::new(1, 1),
    AspectRatio::new(4, 5),
    AspectRatio::new(3, 4),
    AspectRatio::new(2, 3),
    AspectRatio::new(9, 16),
];

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AspectAdjustment {
    pub ratio: AspectRatio,
    pub needs_adjustment: bool,
    /// Dimensions after expansion (equal to the input when no adjustment).
    pub width: u32,
    pub height: u32,
}

/// Supported ratio minimising `|r - ratio|`, with that difference.  Ties go
/// to the earlier entry in [`SUPPORTED_RATIOS`].
pub fn closest_ratio(r: f64) -> (AspectRatio, f64) {
    let mut best = SUPPORTED_RATIOS[0];
    let mut best_diff = (r - best.value()).abs();
    for ratio in &SUPPORTED_RATIOS[1..] {
        let diff = (r - ratio.value()).abs();
        if diff < best_diff {
            best = *ratio;
            best_diff = diff;
        }
    }
    (best, best_diff)
}

/// Grow one axis of `width` x `height` so it matches `ratio`: width when
/// the ratio is wider than the current shape, height otherwise.
pub fn expand_to(width: u32, height: u32, ratio: AspectRatio) -> (u32, u32) {
    let r = width as f64 / height as f64;
    let target = ratio.value();
    if target > r {
        ((height as f64 * target).round() as u32, height)
    } else {
        (width, (width as f64 / target).round() as u32)
    }
}

/// Snap a selection size to the nearest supported ratio.  `None` for a
/// zero-sized selection.
pub fn normalize(width: u32, height: u32, tolerance: f64) -> Option<AspectAdjustment> {
    if width == 0 || height == 0 {
        return None;
    }
    let r = width as f64 / height as f64;
    let (ratio, diff) = closest_ratio(r);
    if diff <= tolerance {
        return Some(AspectAdjustment { ratio, needs_adjustment: false, width, height });
    }
    let (w, h) = expand_to(width, height, ratio);
    Some(AspectAdjustment { ratio, needs_adjustment: true, width: w, height: h })
}

/// Grow `bounds` to `width` x `height` around its centre, shifted and
/// clamped to stay inside the image.  The result may fall short of the
/// requested size when the image itself is smaller.
pub fn expand_bounds(bounds: &SelectionBounds, width: u32, height: u32, image_width: u32, image_height: u32) -> SelectionBounds {
    let (x, w) = expand_axis(bounds.x as i64, bounds.width, width, image_width);
    let (y, h) = expand_axis(bounds.y as i64, bounds.height, height, image_height);
    SelectionBounds::new(x as i32, y as i32, w, h)
}

fn expand_axis(start: i64, len: u32, target: u32, limit: u32) -> (i64, u32) {
    let target = target.max(len).min(limit);
    let grow = target as i64 - len as i64;
    let mut start = start - grow / 2;
    start = start.min(limit as i64 - target as i64).max(0);
    (start, target)
}
