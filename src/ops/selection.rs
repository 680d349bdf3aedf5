// ============================================================================
// SELECTION EXTRACTION
// ============================================================================
//
// A user-drawn selection comes off the canvas as either an axis-aligned
// rectangle or a closed lasso polygon, both in canvas space.  This module
// turns it into integer canvas bounds and, for lassos, the vertex list.

use crate::canvas::{PolygonPoint, SelectionBounds};

/// Shape drawn on the canvas.
#[derive(Clone, Debug, PartialEq)]
pub enum Selection {
    /// Width/height may be negative when the drag went up or left.
    Rectangle { x: f64, y: f64, width: f64, height: f64 },
    /// Closed outline; the last vertex connects back to the first.
    Polygon(Vec<PolygonPoint>),
}

impl Selection {
    pub fn rectangle(x: f64, y: f64, width: f64, height: f64) -> Self {
        Selection::Rectangle { x, y, width, height }
    }

    pub fn is_polygon(&self) -> bool {
        matches!(self, Selection::Polygon(_))
    }
}

/// Bounds plus optional outline, both in canvas space.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtractedSelection {
    pub bounds: SelectionBounds,
    pub polygon: Option<Vec<PolygonPoint>>,
}

/// Smallest integer rectangle covering the selection: top-left floored,
/// far corner ceiled.  `None` for zero-area shapes and lassos with fewer
/// than three vertices.
pub fn get_bounds_canvas(selection: &Selection) -> Option<SelectionBounds> {
    match selection {
        Selection::Rectangle { x, y, width, height } => {
            let (x0, x1) = ordered(*x, *x + *width);
            let (y0, y1) = ordered(*y, *y + *height);
            covering_bounds(x0, y0, x1, y1)
        }
        Selection::Polygon(points) => {
            if points.len() < 3 {
                return None;
            }
            let (min, max) = polygon_extent(points)?;
            covering_bounds(min.x, min.y, max.x, max.y)
        }
    }
}

/// Vertex list for lasso selections, `None` for rectangles.  The list is
/// returned as drawn; callers reject anything under three points.
pub fn extract_polygon_points(selection: &Selection) -> Option<Vec<PolygonPoint>> {
    match selection {
        Selection::Rectangle { .. } => None,
        Selection::Polygon(points) => Some(points.clone()),
    }
}

pub fn is_valid_polygon(points: &[PolygonPoint]) -> bool {
    points.len() >= 3 && points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
}

/// Run both extractors.  A missing, zero-area or degenerate selection
/// yields `None` ("no selection processed"), never an error.
pub fn extract(selection: Option<&Selection>) -> Option<ExtractedSelection> {
    let selection = selection?;
    let bounds = get_bounds_canvas(selection)?;
    if bounds.is_degenerate() {
        return None;
    }
    let polygon = extract_polygon_points(selection);
    if let Some(points) = &polygon
        && !is_valid_polygon(points)
    {
        return None;
    }
    Some(ExtractedSelection { bounds, polygon })
}

/// Min and max corners of a point cloud.
pub fn polygon_extent(points: &[PolygonPoint]) -> Option<(PolygonPoint, PolygonPoint)> {
    let first = points.first()?;
    let mut min = *first;
    let mut max = *first;
    for p in &points[1..] {
        min.x = min.x.min(p.x);
        min.y = min.y.min(p.y);
        max.x = max.x.max(p.x);
        max.y = max.y.max(p.y);
    }
    Some((min, max))
}

/// Vertex average.  Used as the anchor when insetting a lasso.
pub fn polygon_centroid(points: &[PolygonPoint]) -> Option<PolygonPoint> {
    if points.is_empty() {
        return None;
    }
    let n = points.len() as f64;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
    Some(PolygonPoint::new(sx / n, sy / n))
}

/// Shift every vertex by `(-dx, -dy)`, i.e. re-express the outline relative
/// to an origin at `(dx, dy)`.
pub fn translate_points(points: &[PolygonPoint], dx: f64, dy: f64) -> Vec<PolygonPoint> {
    points
        .iter()
        .map(|p| PolygonPoint::new(p.x - dx, p.y - dy))
        .collect()
}

/// Scale every vertex toward (ratio < 1) or away from `anchor`.
pub fn scale_points_about(points: &[PolygonPoint], anchor: PolygonPoint, ratio: f64) -> Vec<PolygonPoint> {
    points
        .iter()
        .map(|p| {
            PolygonPoint::new(
                anchor.x + (p.x - anchor.x) * ratio,
                anchor.y + (p.y - anchor.y) * ratio,
            )
        })
        .collect()
}

fn ordered(a: f64, b: f64) -> (f64, f64) {
    if a <= b { (a, b) } else { (b, a) }
}

fn covering_bounds(x0: f64, y0: f64, x1: f64, y1: f64) -> Option<SelectionBounds> {
    if ![x0, y0, x1, y1].iter().all(|v| v.is_finite()) {
        return None;
    }
    let left = x0.floor();
    let top = y0.floor();
    // Measured to the ceiled far corner so the box reaches the true right
    // and bottom edges.
    let width = (x1.ceil() - left).max(0.0);
    let height = (y1.ceil() - top).max(0.0);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(SelectionBounds::new(left as i32, top as i32, width as u32, height as u32))
}
