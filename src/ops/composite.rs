// ============================================================================
// LAYER COMPOSITOR
// ============================================================================
//
// Paints an ordered layer stack bottom-to-top onto a cleared transparent
// canvas.  Rows are blended in parallel; each output row is written by one
// worker only, so two runs over the same stack are byte-identical.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::canvas::{EpochToken, Layer, LayerStack, PolygonPoint};
use crate::io::{self, ExportFormat};
use crate::ops::masks;
use crate::ops::selection::is_valid_polygon;

// ============================================================================
// BLENDING
// ============================================================================

/// Source-over blend of `top` onto `base` with an extra paint alpha.
pub fn blend_normal(base: Rgba<u8>, top: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    if top[3] == 0 || opacity <= 0.0 {
        return base;
    }
    if opacity >= 1.0 && top[3] == 255 {
        return top;
    }

    let base_a = base[3] as f32 / 255.0;
    let top_a = (top[3] as f32 / 255.0) * opacity.min(1.0);
    let out_a = top_a + base_a * (1.0 - top_a);
    if out_a <= 0.0 {
        return Rgba([0, 0, 0, 0]);
    }

    let mut out = [0u8; 4];
    for c in 0..3 {
        let t = top[c] as f32 / 255.0;
        let b = base[c] as f32 / 255.0;
        let v = (t * top_a + b * base_a * (1.0 - top_a)) / out_a;
        out[c] = (v * 255.0).round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round().clamp(0.0, 255.0) as u8;
    Rgba(out)
}

/// Paint `top` onto `canvas` at `(x, y)` with `opacity`, clipping anything
/// that falls outside the canvas.
pub fn draw_layer(canvas: &mut RgbaImage, top: &RgbaImage, x: i64, y: i64, opacity: f32) {
    let (cw, ch) = (canvas.width() as i64, canvas.height() as i64);
    let (tw, th) = (top.width() as i64, top.height() as i64);
    let x0 = x.max(0);
    let y0 = y.max(0);
    let x1 = (x + tw).min(cw);
    let y1 = (y + th).min(ch);
    if x1 <= x0 || y1 <= y0 {
        return;
    }

    let row_len = cw as usize * 4;
    canvas
        .par_chunks_mut(row_len)
        .enumerate()
        .skip(y0 as usize)
        .take((y1 - y0) as usize)
        .for_each(|(cy, row)| {
            let ty = (cy as i64 - y) as u32;
            for cx in x0..x1 {
                let tx = (cx - x) as u32;
                let src = *top.get_pixel(tx, ty);
                let i = cx as usize * 4;
                let dst = Rgba([row[i], row[i + 1], row[i + 2], row[i + 3]]);
                let out = blend_normal(dst, src, opacity);
                row[i..i + 4].copy_from_slice(&out.0);
            }
        });
}

// ============================================================================
// PER-LAYER MASKING
// ============================================================================

/// Re-mask one layer from its clean source with its current feather radius.
///
/// Returns `None` when the radius is zero, the layer has no polygon or
/// placement rectangle to feather, or the source will not decode.  The
/// caller then falls back to the sharp cutout or the unmasked original.
pub fn apply_feathering(layer: &Layer) -> Option<RgbaImage> {
    let radius = layer.feather_radius;
    if radius.is_nan() || radius <= 0.0 {
        return None;
    }

    let source = match layer.source_raster().decode() {
        Ok(img) => img,
        Err(e) => {
            crate::log_warn!("Feathering '{}' failed to decode source: {}", layer.name, e);
            return None;
        }
    };
    let (w, h) = source.dimensions();

    let mask = match &layer.polygon_points {
        Some(points) if is_valid_polygon(points) => {
            let points = points_in_raster_space(layer, points, w, h);
            masks::feathered_polygon_mask(w, h, &points, radius)
        }
        Some(_) => return None,
        None if layer.bounds().is_some() => masks::feathered_rect_mask(w, h, radius),
        None => return None,
    };
    masks::apply_alpha_mask(&source, &mask)
}

/// Lasso cutout with a hard edge.  `None` for layers without a polygon.
pub fn sharp_cutout(layer: &Layer) -> Option<RgbaImage> {
    let points = layer.polygon_points.as_ref().filter(|p| is_valid_polygon(p))?;
    let source = layer.source_raster().decode().ok()?;
    let (w, h) = source.dimensions();
    let points = points_in_raster_space(layer, points, w, h);
    let mask = masks::sharp_polygon_mask(w, h, &points);
    masks::apply_alpha_mask(&source, &mask)
}

/// Polygon points are stored relative to the layer's placement size; map
/// them onto the raster if the two differ.
fn points_in_raster_space(layer: &Layer, points: &[PolygonPoint], w: u32, h: u32) -> Vec<PolygonPoint> {
    let sx = layer.width.filter(|&lw| lw > 0).map_or(1.0, |lw| w as f64 / lw as f64);
    let sy = layer.height.filter(|&lh| lh > 0).map_or(1.0, |lh| h as f64 / lh as f64);
    if sx == 1.0 && sy == 1.0 {
        return points.to_vec();
    }
    points
        .iter()
        .map(|p| PolygonPoint::new(p.x * sx, p.y * sy))
        .collect()
}

/// Pixels to paint for a visible layer, already masked and resized to its
/// placement.  `image_data` already holds the masked result; feathering is
/// only re-run when it is still the untouched original.  Decode failures are
/// logged and the layer is skipped.
fn layer_pixels(layer: &Layer) -> Option<RgbaImage> {
    let remasked = if layer.needs_remask() {
        let feathered = apply_feathering(layer);
        if feathered.is_none() {
            crate::log_warn!("Feathering '{}' not applied; drawing unmasked pixels", layer.name);
        }
        feathered
    } else {
        None
    };

    let pixels = match remasked {
        Some(img) => img,
        None => match layer.image_data.decode() {
            Ok(img) => Arc::unwrap_or_clone(img),
            Err(e) => {
                crate::log_warn!("Skipping layer '{}' in composite: {}", layer.name, e);
                return None;
            }
        },
    };

    let (nw, nh) = pixels.dimensions();
    let tw = layer.width.unwrap_or(nw);
    let th = layer.height.unwrap_or(nh);
    if tw == 0 || th == 0 {
        return None;
    }
    if (tw, th) != (nw, nh) {
        return Some(imageops::resize(&pixels, tw, th, FilterType::Lanczos3));
    }
    Some(pixels)
}

// ============================================================================
// STACK COMPOSITE
// ============================================================================

/// Outcome of a guarded recomposite.
#[derive(Debug)]
pub enum CompositeOutcome {
    Done(RgbaImage),
    /// The base image or canvas was replaced mid-pass; nothing committed.
    Stale,
    /// Another pass was in flight; this trigger was folded into its rerun.
    Queued,
}

/// Flatten `layers` onto a `width` x `height` canvas.
pub fn composite(layers: &[Layer], width: u32, height: u32) -> RgbaImage {
    let mut ordered: Vec<&Layer> = layers.iter().collect();
    ordered.sort_by_key(|l| l.order);

    let mut canvas = RgbaImage::new(width, height);
    for layer in ordered {
        paint_layer(&mut canvas, layer);
    }
    canvas
}

/// [`composite`] that checks `token` before every layer and gives up as
/// soon as the stack it was started for has been reset.
pub fn composite_checked(layers: &[Layer], width: u32, height: u32, token: &EpochToken) -> CompositeOutcome {
    let mut ordered: Vec<&Layer> = layers.iter().collect();
    ordered.sort_by_key(|l| l.order);

    let mut canvas = RgbaImage::new(width, height);
    for layer in ordered {
        if token.is_stale() {
            crate::log_info!("Composite aborted: canvas was reset mid-pass");
            return CompositeOutcome::Stale;
        }
        paint_layer(&mut canvas, layer);
    }
    if token.is_stale() {
        crate::log_info!("Composite aborted: canvas was reset mid-pass");
        return CompositeOutcome::Stale;
    }
    CompositeOutcome::Done(canvas)
}

fn paint_layer(canvas: &mut RgbaImage, layer: &Layer) {
    if !layer.visible {
        return;
    }
    if let Some(pixels) = layer_pixels(layer) {
        let x = layer.x.unwrap_or(0) as i64;
        let y = layer.y.unwrap_or(0) as i64;
        draw_layer(canvas, &pixels, x, y, layer.paint_alpha());
    }
}

/// Flatten a whole stack at its canvas size.
pub fn flatten(stack: &LayerStack) -> RgbaImage {
    composite(stack.layers(), stack.width, stack.height)
}

/// Everything a recomposite pass reads, captured at the moment it starts.
#[derive(Clone, Debug)]
pub struct CompositeInputs {
    pub layers: Arc<Vec<Layer>>,
    pub width: u32,
    pub height: u32,
    pub token: EpochToken,
}

impl CompositeInputs {
    pub fn from_stack(stack: &LayerStack) -> Self {
        Self {
            layers: Arc::new(stack.snapshot_layers()),
            width: stack.width,
            height: stack.height,
            token: stack.epoch_token(),
        }
    }
}

/// Allows one recomposite per target at a time.  A trigger that arrives
/// while a pass is running is coalesced into a single rerun with fresh
/// inputs once the running pass ends.
///
/// Both flags live under one lock: queueing a trigger and ending a pass are
/// each a single transition, so a trigger is never lost between them.
#[derive(Debug, Default)]
pub struct RecompositeGuard {
    state: Mutex<GuardState>,
}

#[derive(Debug, Default)]
struct GuardState {
    in_flight: bool,
    pending: bool,
}

impl RecompositeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.lock().in_flight
    }

    /// Run a pass, pulling inputs from `inputs` each time one starts.
    pub fn run<F>(&self, mut inputs: F) -> CompositeOutcome
    where
        F: FnMut() -> CompositeInputs,
    {
        {
            let mut state = self.lock();
            if state.in_flight {
                state.pending = true;
                return CompositeOutcome::Queued;
            }
            state.in_flight = true;
            state.pending = false;
        }

        loop {
            let inp = inputs();
            let outcome = composite_checked(&inp.layers, inp.width, inp.height, &inp.token);
            let mut state = self.lock();
            if state.pending {
                state.pending = false;
                continue;
            }
            state.in_flight = false;
            return outcome;
        }
    }
}

// ============================================================================
// PATCH COMPOSITE
// ============================================================================

/// Flatten a generated patch straight onto a base image.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeRequest {
    pub base_image_base64: String,
    pub patch_image_base64: String,
    pub x: u32,
    pub y: u32,
    /// Patch is resized to this size when both dimensions are non-zero.
    pub target_width: u32,
    pub target_height: u32,
    /// `png`, `jpg`/`jpeg` or `webp`; anything else means PNG.
    pub format: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompositeResponse {
    pub success: bool,
    pub image_base64: Option<String>,
    pub error: Option<String>,
}

impl CompositeResponse {
    fn failed(error: String) -> Self {
        Self { success: false, image_base64: None, error: Some(error) }
    }
}

pub fn composite_patch(request: &CompositeRequest) -> CompositeResponse {
    let base = match io::decode_base64_image(&request.base_image_base64) {
        Ok(img) => img,
        Err(e) => return CompositeResponse::failed(e.to_string()),
    };
    let patch = match io::decode_base64_image(&request.patch_image_base64) {
        Ok(img) => img,
        Err(e) => return CompositeResponse::failed(e.to_string()),
    };

    match patch_onto(&base, &patch, request) {
        Ok(encoded) => CompositeResponse { success: true, image_base64: Some(encoded), error: None },
        Err(e) => CompositeResponse::failed(e),
    }
}

fn patch_onto(base: &RgbaImage, patch: &RgbaImage, request: &CompositeRequest) -> Result<String, String> {
    let patch = if request.target_width > 0 && request.target_height > 0 {
        crate::log_info!(
            "Resizing patch from {}x{} to {}x{}",
            patch.width(),
            patch.height(),
            request.target_width,
            request.target_height
        );
        Cow::Owned(imageops::resize(patch, request.target_width, request.target_height, FilterType::Lanczos3))
    } else {
        Cow::Borrowed(patch)
    };

    let mut result = base.clone();
    // Straight alpha-over onto the base.  Covered pixels come out opaque;
    // the rest keep the base's alpha.
    for (px, py, src) in patch.enumerate_pixels() {
        let tx = request.x as u64 + px as u64;
        let ty = request.y as u64 + py as u64;
        if tx >= result.width() as u64 || ty >= result.height() as u64 {
            continue;
        }
        let dst = result.get_pixel_mut(tx as u32, ty as u32);
        let a = src[3] as f32 / 255.0;
        for c in 0..3 {
            dst[c] = (src[c] as f32 * a + dst[c] as f32 * (1.0 - a)) as u8;
        }
        dst[3] = 255;
    }

    io::encode_base64_image(&result, ExportFormat::parse(&request.format)).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{LayerKind, SelectionBounds};
    use std::cell::Cell;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::mpsc;
    use std::thread;

    fn solid(w: u32, h: u32, px: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba(px))
    }

    fn edit(name: &str, img: RgbaImage, bounds: SelectionBounds) -> Layer {
        Layer::placed(LayerKind::Edit, name.to_string(), img, bounds)
    }

    fn square_points(size: f64) -> Vec<PolygonPoint> {
        vec![
            PolygonPoint::new(0.0, 0.0),
            PolygonPoint::new(size, 0.0),
            PolygonPoint::new(size, size),
            PolygonPoint::new(0.0, size),
        ]
    }

    #[test]
    fn normal_blend_matches_source_over() {
        let base = Rgba([0, 0, 255, 255]);
        let top = Rgba([255, 0, 0, 255]);
        assert_eq!(blend_normal(base, top, 1.0), top);
        assert_eq!(blend_normal(base, top, 0.0), base);
        let half = blend_normal(base, top, 0.5);
        assert_eq!(half.0, [128, 0, 128, 255]);
        // Onto transparent: colour kept, alpha scaled.
        assert_eq!(blend_normal(Rgba([0, 0, 0, 0]), top, 0.5).0, [255, 0, 0, 128]);
    }

    #[test]
    fn layers_paint_in_order_and_at_their_offset() {
        let mut base = Layer::base(solid(10, 10, [0, 0, 0, 255]));
        base.order = 0;
        let mut red = edit("red", solid(4, 4, [255, 0, 0, 255]), SelectionBounds::new(2, 2, 4, 4));
        red.order = 2;
        let mut green = edit("green", solid(4, 4, [0, 255, 0, 255]), SelectionBounds::new(4, 4, 4, 4));
        green.order = 1;

        let out = composite(&[red, base, green], 10, 10);
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
        // Red has the higher order, so it wins the overlap.
        assert_eq!(out.get_pixel(5, 5).0, [255, 0, 0, 255]);
        assert_eq!(out.get_pixel(7, 7).0, [0, 255, 0, 255]);
    }

    #[test]
    fn hidden_layers_are_skipped_and_opacity_applies() {
        let base = Layer::base(solid(4, 4, [0, 0, 0, 255]));
        let mut hidden = edit("h", solid(4, 4, [255, 255, 255, 255]), SelectionBounds::new(0, 0, 4, 4));
        hidden.order = 1;
        hidden.visible = false;
        let out = composite(&[base.clone(), hidden], 4, 4);
        assert_eq!(out.get_pixel(1, 1).0, [0, 0, 0, 255]);

        let mut faint = edit("f", solid(4, 4, [255, 255, 255, 255]), SelectionBounds::new(0, 0, 4, 4));
        faint.order = 1;
        faint.opacity = 50.0;
        let out = composite(&[base, faint], 4, 4);
        assert_eq!(out.get_pixel(1, 1).0, [128, 128, 128, 255]);
    }

    #[test]
    fn layers_are_resized_to_their_placement() {
        let base = Layer::base(solid(20, 20, [0, 0, 0, 255]));
        let mut big = edit("big", solid(2, 2, [9, 9, 9, 255]), SelectionBounds::new(5, 5, 10, 10));
        big.order = 1;
        let out = composite(&[base, big], 20, 20);
        assert_eq!(out.get_pixel(10, 10).0, [9, 9, 9, 255]);
        assert_eq!(out.get_pixel(16, 16).0, [0, 0, 0, 255]);
    }

    #[test]
    fn composite_is_idempotent() {
        let base = Layer::base(solid(40, 30, [12, 34, 56, 255]));
        let mut soft = edit("soft", solid(20, 20, [200, 100, 50, 255]), SelectionBounds::new(5, 5, 20, 20));
        soft.order = 1;
        soft.opacity = 70.0;
        soft.polygon_points = Some(square_points(20.0));
        soft.feather_radius = 3.0;
        let layers = vec![base, soft];
        let a = composite(&layers, 40, 30);
        let b = composite(&layers, 40, 30);
        assert_eq!(a.as_raw(), b.as_raw());
    }

    #[test]
    fn undecodable_layer_does_not_abort_the_composite() {
        let base = Layer::base(solid(4, 4, [1, 2, 3, 255]));
        let mut broken = edit("broken", solid(4, 4, [255, 0, 0, 255]), SelectionBounds::new(0, 0, 4, 4));
        broken.order = 1;
        broken.image_data = crate::canvas::Raster::from_base64("not an image");
        broken.original_image_data = None;
        let out = composite(&[base, broken], 4, 4);
        assert_eq!(out.get_pixel(2, 2).0, [1, 2, 3, 255]);
    }

    #[test]
    fn triangle_without_feather_is_not_feathered() {
        let mut layer = edit("tri", solid(10, 10, [255, 0, 0, 255]), SelectionBounds::new(0, 0, 10, 10));
        layer.polygon_points = Some(vec![
            PolygonPoint::new(0.0, 0.0),
            PolygonPoint::new(10.0, 0.0),
            PolygonPoint::new(0.0, 10.0),
        ]);
        layer.feather_radius = 0.0;
        assert!(apply_feathering(&layer).is_none());
        // The caller falls back to the sharp cutout.
        let cut = sharp_cutout(&layer).unwrap();
        assert_eq!(cut.get_pixel(1, 1)[3], 255);
        assert_eq!(cut.get_pixel(9, 9)[3], 0);
    }

    #[test]
    fn feathering_works_from_the_clean_original() {
        let mut layer = edit("poly", solid(30, 30, [0, 255, 0, 255]), SelectionBounds::new(0, 0, 30, 30));
        layer.polygon_points = Some(square_points(30.0));
        layer.feather_radius = 3.0;
        // Displayed pixels were already masked down to nothing.
        layer.image_data = crate::canvas::Raster::new(solid(30, 30, [0, 0, 0, 0]));
        let out = apply_feathering(&layer).unwrap();
        assert_eq!(out.get_pixel(15, 15).0, [0, 255, 0, 255]);
        assert!(out.get_pixel(0, 15)[3] < 255);
    }

    #[test]
    fn compositor_draws_the_stored_masked_pixels() {
        let base = Layer::base(solid(30, 30, [0, 0, 0, 255]));
        let mut layer = edit("poly", solid(30, 30, [0, 255, 0, 255]), SelectionBounds::new(0, 0, 30, 30));
        layer.order = 1;
        layer.polygon_points = Some(square_points(30.0));
        layer.feather_radius = 3.0;
        assert!(layer.needs_remask());

        // A masked raster is already in place: it is drawn as-is, not re-blurred.
        layer.image_data = crate::canvas::Raster::new(solid(30, 30, [0, 0, 255, 255]));
        assert!(!layer.needs_remask());
        let out = composite(&[base.clone(), layer.clone()], 30, 30);
        assert_eq!(out.get_pixel(0, 15).0, [0, 0, 255, 255]);

        // Still the untouched original: the compositor masks it on the fly.
        layer.image_data = layer.original_image_data.clone().unwrap();
        let out = composite(&[base, layer], 30, 30);
        assert_eq!(out.get_pixel(15, 15).0, [0, 255, 0, 255]);
        assert_ne!(out.get_pixel(0, 15).0, [0, 255, 0, 255]);
    }

    #[test]
    fn rectangle_layers_feather_with_edge_ramps() {
        let mut layer = edit("rect", solid(20, 20, [0, 0, 255, 255]), SelectionBounds::new(0, 0, 20, 20));
        layer.feather_radius = 5.0;
        let out = apply_feathering(&layer).unwrap();
        assert_eq!(out.get_pixel(10, 10)[3], 255);
        assert!(out.get_pixel(0, 10)[3] < 64);

        let base = Layer::base(solid(4, 4, [0, 0, 0, 255]));
        let mut base_feathered = base.clone();
        base_feathered.feather_radius = 5.0;
        assert!(apply_feathering(&base_feathered).is_none());
    }

    #[test]
    fn stale_token_aborts_without_result() {
        let mut stack = LayerStack::from_image(solid(8, 8, [0, 0, 0, 255]));
        let inputs = CompositeInputs::from_stack(&stack);
        stack.replace_base(solid(4, 4, [9, 9, 9, 255]));
        let outcome = composite_checked(&inputs.layers, inputs.width, inputs.height, &inputs.token);
        assert!(matches!(outcome, CompositeOutcome::Stale));
    }

    #[test]
    fn trigger_while_busy_is_queued_and_rerun_once() {
        let stack = LayerStack::from_image(solid(4, 4, [5, 5, 5, 255]));
        let guard = RecompositeGuard::new();
        let passes = Cell::new(0);

        let outcome = guard.run(|| {
            passes.set(passes.get() + 1);
            if passes.get() == 1 {
                // Two triggers land while the first pass is running.
                let nested = guard.run(|| CompositeInputs::from_stack(&stack));
                assert!(matches!(nested, CompositeOutcome::Queued));
                let nested = guard.run(|| CompositeInputs::from_stack(&stack));
                assert!(matches!(nested, CompositeOutcome::Queued));
            }
            CompositeInputs::from_stack(&stack)
        });

        assert_eq!(passes.get(), 2);
        assert!(!guard.is_busy());
        match outcome {
            CompositeOutcome::Done(img) => assert_eq!(img.get_pixel(0, 0).0, [5, 5, 5, 255]),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn trigger_from_another_thread_reruns_the_pass() {
        let stack = LayerStack::from_image(solid(4, 4, [7, 7, 7, 255]));
        let inputs = CompositeInputs::from_stack(&stack);
        let guard = RecompositeGuard::new();
        let passes = AtomicUsize::new(0);
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        thread::scope(|s| {
            let (guard, passes, inputs) = (&guard, &passes, &inputs);
            let runner = s.spawn(move || {
                guard.run(|| {
                    if passes.fetch_add(1, AtomicOrdering::SeqCst) == 0 {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    }
                    inputs.clone()
                })
            });
            started_rx.recv().unwrap();
            assert!(matches!(guard.run(|| inputs.clone()), CompositeOutcome::Queued));
            release_tx.send(()).unwrap();
            assert!(matches!(runner.join().unwrap(), CompositeOutcome::Done(_)));
        });

        assert_eq!(passes.load(AtomicOrdering::SeqCst), 2);
        assert!(!guard.is_busy());
    }

    #[test]
    fn racing_triggers_leave_nothing_pending() {
        let stack = LayerStack::from_image(solid(4, 4, [1, 1, 1, 255]));
        let inputs = CompositeInputs::from_stack(&stack);
        let guard = RecompositeGuard::new();
        let passes = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..4 {
                let (guard, passes, inputs) = (&guard, &passes, &inputs);
                s.spawn(move || {
                    for _ in 0..200 {
                        guard.run(|| {
                            passes.fetch_add(1, AtomicOrdering::SeqCst);
                            inputs.clone()
                        });
                    }
                });
            }
        });

        // Every queued trigger was folded into a pass that ran after it.
        let state = guard.lock();
        assert!(!state.in_flight);
        assert!(!state.pending);
        assert!(passes.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[test]
    fn patch_is_resized_clipped_and_covered_pixels_opaque() {
        let base = solid(10, 10, [0, 0, 0, 128]);
        let patch = solid(2, 2, [255, 255, 255, 255]);
        let request = CompositeRequest {
            base_image_base64: io::encode_png_base64(&base).unwrap(),
            patch_image_base64: io::encode_png_base64(&patch).unwrap(),
            x: 6,
            y: 6,
            target_width: 6,
            target_height: 6,
            format: "png".into(),
        };
        let response = composite_patch(&request);
        assert!(response.success, "{:?}", response.error);
        let out = io::decode_base64_image(&response.image_base64.unwrap()).unwrap();
        assert_eq!(out.dimensions(), (10, 10));
        assert_eq!(out.get_pixel(9, 9).0, [255, 255, 255, 255]);
        assert_eq!(out.get_pixel(6, 6).0, [255, 255, 255, 255]);
        // Untouched base pixels keep their own alpha.
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 128]);
        assert_eq!(out.get_pixel(5, 9).0, [0, 0, 0, 128]);
    }

    #[test]
    fn patch_with_bad_payload_reports_failure() {
        let request = CompositeRequest {
            base_image_base64: "???".into(),
            patch_image_base64: String::new(),
            x: 0,
            y: 0,
            target_width: 0,
            target_height: 0,
            format: "png".into(),
        };
        let response = composite_patch(&request);
        assert!(!response.success);
        assert!(response.image_base64.is_none());
        assert!(response.error.is_some());
    }
}
