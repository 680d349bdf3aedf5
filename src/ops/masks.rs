// ============================================================================
// MASK GENERATION
// ============================================================================
//
// Every mask is an 8-bit grayscale raster sized exactly to the processing
// bounds.  Inpainting masks use 255 = regenerate, 0 = keep as context; the
// lasso result masks are alpha channels where 255 = keep the patch pixel.

use image::{GrayImage, Luma, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{PolygonPoint, SelectionBounds};
use crate::ops::filters;
use crate::ops::selection::{polygon_centroid, scale_points_about, translate_points};

/// Smallest hard-edge region a feathered lasso keeps, as a fraction of the
/// drawn outline.
pub const MIN_INSET_RATIO: f64 = 0.1;

/// Entirely white: the whole region is the edit target.
pub fn full_mask(width: u32, height: u32) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([255]))
}

/// Scanline-fill a closed polygon into `mask` with `value`.
///
/// A pixel is inside when its centre is: each row samples at `y + 0.5` and
/// spans between sorted pairs of edge crossings.  Vertices outside the mask
/// are fine; spans are clipped to the raster.
pub fn fill_polygon(mask: &mut GrayImage, points: &[PolygonPoint], value: u8) {
    let w = mask.width();
    let n = points.len();
    if n < 3 || w == 0 {
        return;
    }

    let row_len = w as usize;
    mask.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        let yf = y as f64 + 0.5;
        let mut nodes: Vec<f64> = Vec::new();
        for i in 0..n {
            let j = (i + 1) % n;
            let (yi, yj) = (points[i].y, points[j].y);
            if (yi < yf && yj >= yf) || (yj < yf && yi >= yf) {
                let t = (yf - yi) / (yj - yi);
                nodes.push(points[i].x + t * (points[j].x - points[i].x));
            }
        }
        nodes.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut k = 0;
        while k + 1 < nodes.len() {
            // Pixel x is covered when x + 0.5 lies in [start, end).
            let x_start = (nodes[k] - 0.5).ceil().clamp(0.0, w as f64) as usize;
            let x_end = (nodes[k + 1] - 0.5).ceil().clamp(0.0, w as f64) as usize;
            if x_start < x_end {
                row[x_start..x_end].fill(value);
            }
            k += 2;
        }
    });
}

/// Transparent background, polygon interior opaque.  Cuts a lasso-shaped
/// piece out of a layer when it has no feather.
pub fn sharp_polygon_mask(width: u32, height: u32, points: &[PolygonPoint]) -> GrayImage {
    let mut mask = GrayImage::new(width, height);
    fill_polygon(&mut mask, points, 255);
    mask
}

/// Mask sent to the generation service with the cropped image.
///
/// `polygon` (relative to the processing origin) wins over `embedded`; an
/// embedded selection rectangle marks only that sub-rectangle as the edit
/// area inside a larger context region.  With neither, the whole region is
/// the edit target.
pub fn inpainting_mask(
    width: u32,
    height: u32,
    polygon: Option<&[PolygonPoint]>,
    embedded: Option<SelectionBounds>,
) -> GrayImage {
    if let Some(points) = polygon {
        return sharp_polygon_mask(width, height, points);
    }
    let Some(rect) = embedded.and_then(|r| r.clamp_to(width, height)) else {
        return full_mask(width, height);
    };
    let mut mask = GrayImage::new(width, height);
    for y in rect.y as u32..rect.bottom() as u32 {
        for x in rect.x as u32..rect.right() as u32 {
            mask.put_pixel(x, y, Luma([255]));
        }
    }
    mask
}

/// Polygon fill shrunk toward its centroid, then blurred with a padded
/// Gaussian so the falloff is not clipped at the layer boundary.
///
/// The hard-edge region is scaled by `max(0.1, 1 - 2r / avg_dim)` where
/// `avg_dim` is the mean of the layer's width and height.  At `r = 0` this
/// degenerates to the sharp polygon mask.  The blur radius is capped at
/// `avg_dim`: past that the inset is already at its floor and the falloff
/// covers the whole layer.
pub fn feathered_polygon_mask(width: u32, height: u32, points: &[PolygonPoint], radius: f32) -> GrayImage {
    let radius = if radius.is_finite() { radius.max(0.0) } else { 0.0 };
    if radius == 0.0 || width == 0 || height == 0 {
        return sharp_polygon_mask(width, height, points);
    }

    let avg_dim = (width as f64 + height as f64) / 2.0;
    let inset = (1.0 - 2.0 * radius as f64 / avg_dim).max(MIN_INSET_RATIO);
    let Some(centroid) = polygon_centroid(points) else {
        return GrayImage::new(width, height);
    };
    let inset_points = scale_points_about(points, centroid, inset);

    let blur = radius.min(avg_dim as f32);
    let Some((pad, padded_w, padded_h)) = padded_size(width, height, blur) else {
        crate::log_warn!("Feather padding overflows for {}x{} at radius {}", width, height, blur);
        return sharp_polygon_mask(width, height, &inset_points);
    };
    let padded_points = translate_points(&inset_points, -(pad as f64), -(pad as f64));
    let mut canvas = GrayImage::new(padded_w, padded_h);
    fill_polygon(&mut canvas, &padded_points, 255);

    let blurred = filters::gaussian_blur_gray(&canvas, blur);
    filters::crop_gray(&blurred, pad, pad, width, height)
}

/// Pad of at least 2r on every side, so the blur has room past the layer
/// edge.  `None` when the padded canvas would not fit in `u32`.
fn padded_size(width: u32, height: u32, radius: f32) -> Option<(u32, u32, u32)> {
    let pad = filters::kernel_radius(radius).max((2.0 * radius).ceil() as usize);
    let pad = u32::try_from(pad).ok()?;
    let both = pad.checked_mul(2)?;
    Some((pad, width.checked_add(both)?, height.checked_add(both)?))
}

/// Opaque mask with four linear ramps fading opacity over `radius` pixels
/// from each edge.  The ramps multiply, so corners fade from both sides.
pub fn feathered_rect_mask(width: u32, height: u32, radius: f32) -> GrayImage {
    if radius <= 0.0 || !radius.is_finite() {
        return full_mask(width, height);
    }
    let ramp = |d: u32| -> f32 { ((d as f32 + 0.5) / radius).min(1.0) };

    let mut mask = GrayImage::new(width, height);
    let row_len = width as usize;
    if row_len == 0 {
        return mask;
    }
    mask.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        let y = y as u32;
        let vy = ramp(y) * ramp(height - 1 - y);
        for (x, px) in row.iter_mut().enumerate() {
            let x = x as u32;
            let v = vy * ramp(x) * ramp(width - 1 - x);
            *px = (v * 255.0).round().clamp(0.0, 255.0) as u8;
        }
    });
    mask
}

/// Alpha mask for clipping a returned patch to the drawn lasso.  Produced
/// for every lasso selection, feathered or not.
pub fn result_mask(width: u32, height: u32, points: &[PolygonPoint], feather_radius: f32) -> GrayImage {
    feathered_polygon_mask(width, height, points, feather_radius)
}

/// Multiply an image's alpha by the mask ("keep where the mask is opaque").
/// Returns `None` if the sizes disagree.
pub fn apply_alpha_mask(image: &RgbaImage, mask: &GrayImage) -> Option<RgbaImage> {
    if image.dimensions() != mask.dimensions() {
        return None;
    }
    let mut out = image.clone();
    let row_len = image.width() as usize * 4;
    if row_len == 0 {
        return Some(out);
    }
    let mask_raw = mask.as_raw();
    let mask_w = mask.width() as usize;
    out.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        let mask_row = &mask_raw[y * mask_w..(y + 1) * mask_w];
        for (px, &m) in row.chunks_exact_mut(4).zip(mask_row) {
            px[3] = ((px[3] as u32 * m as u32 + 127) / 255) as u8;
        }
    });
    Some(out)
}

pub fn mask_sum(mask: &GrayImage) -> u64 {
    mask.as_raw().iter().map(|&v| v as u64).sum()
}

/// Mean value in `0.0..=1.0`.
pub fn mean_opacity(mask: &GrayImage) -> f64 {
    let n = mask.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    mask_sum(mask) as f64 / (n as f64 * 255.0)
}
