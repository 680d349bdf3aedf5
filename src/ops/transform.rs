// ============================================================================
// COORDINATE TRANSFORM: canvas space <-> source-image pixel space
// ============================================================================
//
// Bounds corners round outward (floor the near corner, ceil the far one) so a
// partially covered boundary pixel is never dropped.  That costs at most one
// extra pixel of context per edge; the masks re-establish the exact edit area.

use crate::canvas::{ImageTransform, PolygonPoint, SelectionBounds};

/// Map canvas-space bounds into image pixels, clamped to the image.
///
/// The near corner is clamped to `[0, dim - 1]` and the far corner to
/// `[0, dim]`.  Returns `None` when the selection lies entirely outside the
/// image or clamping leaves no area: the caller must abort (no mask, no
/// service call).
pub fn to_image_space(
    canvas: &SelectionBounds,
    transform: &ImageTransform,
    image_width: u32,
    image_height: u32,
) -> Option<SelectionBounds> {
    if !transform.is_valid() || image_width == 0 || image_height == 0 {
        return None;
    }

    let x0 = ((canvas.x as f64 - transform.offset_x) / transform.scale_x).floor();
    let y0 = ((canvas.y as f64 - transform.offset_y) / transform.scale_y).floor();
    let x1 = ((canvas.right() as f64 - transform.offset_x) / transform.scale_x).ceil();
    let y1 = ((canvas.bottom() as f64 - transform.offset_y) / transform.scale_y).ceil();

    let (w, h) = (image_width as f64, image_height as f64);
    // Entirely off one side: clamping alone would still leave a 1px sliver.
    if x1 <= 0.0 || y1 <= 0.0 || x0 >= w || y0 >= h {
        return None;
    }

    let cx0 = x0.clamp(0.0, w - 1.0);
    let cy0 = y0.clamp(0.0, h - 1.0);
    let cx1 = x1.clamp(0.0, w);
    let cy1 = y1.clamp(0.0, h);

    let width = cx1 - cx0;
    let height = cy1 - cy0;
    if width <= 0.0 || height <= 0.0 {
        return None;
    }

    Some(SelectionBounds::new(cx0 as i32, cy0 as i32, width as u32, height as u32))
}

/// Inverse of [`to_image_space`] without clamping: image pixels back onto
/// the canvas, rounding outward.
pub fn to_canvas_space(image: &SelectionBounds, transform: &ImageTransform) -> SelectionBounds {
    let x0 = (image.x as f64 * transform.scale_x + transform.offset_x).floor();
    let y0 = (image.y as f64 * transform.scale_y + transform.offset_y).floor();
    let x1 = (image.right() as f64 * transform.scale_x + transform.offset_x).ceil();
    let y1 = (image.bottom() as f64 * transform.scale_y + transform.offset_y).ceil();
    SelectionBounds::new(
        x0 as i32,
        y0 as i32,
        (x1 - x0).max(0.0) as u32,
        (y1 - y0).max(0.0) as u32,
    )
}

pub fn point_to_image_space(p: PolygonPoint, transform: &ImageTransform) -> PolygonPoint {
    PolygonPoint::new(
        (p.x - transform.offset_x) / transform.scale_x,
        (p.y - transform.offset_y) / transform.scale_y,
    )
}

pub fn point_to_canvas_space(p: PolygonPoint, transform: &ImageTransform) -> PolygonPoint {
    PolygonPoint::new(
        p.x * transform.scale_x + transform.offset_x,
        p.y * transform.scale_y + transform.offset_y,
    )
}

/// Per-vertex inverse transform.  No clamping: the consuming mask bounds
/// clip the outline.
pub fn polygon_to_image_space(points: &[PolygonPoint], transform: &ImageTransform) -> Vec<PolygonPoint> {
    points
        .iter()
        .map(|&p| point_to_image_space(p, transform))
        .collect()
}

pub fn polygon_to_canvas_space(points: &[PolygonPoint], transform: &ImageTransform) -> Vec<PolygonPoint> {
    points
        .iter()
        .map(|&p| point_to_canvas_space(p, transform))
        .collect()
}
