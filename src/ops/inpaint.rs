// ============================================================================
// GENERATIVE FILL: request preparation, service seam, result insertion
// ============================================================================
//
// selection -> canvas bounds -> image bounds -> crop + inpainting mask
//   -> external service -> patch -> clip to lasso -> new edit layer
//
// Transport to the generation backend is not handled here; callers plug in
// a `GenerationService`.

use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use serde::{Deserialize, Serialize};

use crate::canvas::{
    EpochToken, ImageTransform, Layer, LayerId, LayerKind, LayerStack, PolygonPoint, Raster, SelectionBounds,
};
use crate::io::{self, RasterError};
use crate::ops::aspect::{self, AspectAdjustment};
use crate::ops::canvas_ops;
use crate::ops::masks;
use crate::ops::selection::{self, Selection, translate_points};
use crate::ops::transform;

// ============================================================================
// ERRORS
// ============================================================================

/// The one failure type the front end sees from a fill.
#[derive(Debug)]
pub enum PipelineError {
    /// Nothing usable was selected; prompt the user instead of failing.
    NoSelection,
    NoBaseImage,
    /// The selection maps entirely outside the image.
    OutOfBounds {
        bounds: SelectionBounds,
        image_width: u32,
        image_height: u32,
    },
    Raster(RasterError),
    /// The generation service reported a failure.
    Service(String),
    UnknownLayer(LayerId),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::NoSelection => write!(f, "No selection to fill"),
            PipelineError::NoBaseImage => write!(f, "No image loaded"),
            PipelineError::OutOfBounds { bounds, image_width, image_height } => write!(
                f,
                "Selection ({}, {}, {}x{}) lies outside the {}x{} image",
                bounds.x, bounds.y, bounds.width, bounds.height, image_width, image_height
            ),
            PipelineError::Raster(e) => write!(f, "{}", e),
            PipelineError::Service(e) => write!(f, "Generation failed: {}", e),
            PipelineError::UnknownLayer(id) => write!(f, "No layer with id {}", id),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<RasterError> for PipelineError {
    fn from(e: RasterError) -> Self {
        PipelineError::Raster(e)
    }
}

// ============================================================================
// SERVICE CONTRACT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Model {
    #[default]
    NanoBanana,
    NanoBananaPro,
}

impl Model {
    /// Unknown ids fall back to the default model.
    pub fn parse(id: &str) -> Self {
        match id.trim() {
            "nano-banana-pro" => Model::NanoBananaPro,
            _ => Model::NanoBanana,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Model::NanoBanana => "nano-banana",
            Model::NanoBananaPro => "nano-banana-pro",
        }
    }

    /// Model name on the generation backend.
    pub fn backend_model(&self) -> &'static str {
        match self {
            Model::NanoBanana => "gemini-2.5-flash-image",
            Model::NanoBananaPro => "gemini-3-pro-image-preview",
        }
    }
}

/// Requested output resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSize {
    OneK,
    TwoK,
    FourK,
}

impl ImageSize {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "1K" => Some(ImageSize::OneK),
            "2K" => Some(ImageSize::TwoK),
            "4K" => Some(ImageSize::FourK),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSize::OneK => "1K",
            ImageSize::TwoK => "2K",
            ImageSize::FourK => "4K",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    pub image_base64: String,
    pub mask_base64: String,
    #[serde(default)]
    pub reference_images: Vec<String>,
    /// `1K`, `2K` or `4K`.
    #[serde(default)]
    pub image_size: Option<String>,
}

impl GenerateRequest {
    /// The user's prompt wrapped in the mask instructions the model expects.
    pub fn instruction(&self) -> String {
        build_prompt(&self.prompt)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    pub image_base64: Option<String>,
    pub error: Option<String>,
}

impl GenerateResponse {
    pub fn ok(image_base64: String) -> Self {
        Self { success: true, image_base64: Some(image_base64), error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, image_base64: None, error: Some(error.into()) }
    }
}

pub fn build_prompt(prompt: &str) -> String {
    format!(
        "Edit this image. The second image is a mask where white areas should be replaced. \
         In the white masked areas, generate: {}. \
         Keep the black areas unchanged. Match the style and lighting of the original image.",
        prompt.trim()
    )
}

/// External image-fill backend.  May fail; retries and auth are its own
/// business.
pub trait GenerationService {
    fn generate_fill(&self, request: &GenerateRequest) -> GenerateResponse;
}

// ============================================================================
// PREPARATION
// ============================================================================

#[derive(Clone, Debug)]
pub struct FillOptions {
    pub prompt: String,
    pub model: Model,
    /// Send the whole image as context with only the selection marked for
    /// regeneration.
    pub full_image_context: bool,
    pub reference_images: Vec<String>,
    pub feather_radius: f32,
    pub image_size: Option<ImageSize>,
    pub aspect_tolerance: f64,
}

impl Default for FillOptions {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model: Model::default(),
            full_image_context: false,
            reference_images: Vec::new(),
            feather_radius: 0.0,
            image_size: None,
            aspect_tolerance: aspect::DEFAULT_TOLERANCE,
        }
    }
}

/// Everything computed before the service call.
#[derive(Clone, Debug)]
pub struct PreparedFill {
    /// Selection in image space, clamped to the image.  The inserted layer
    /// covers exactly this rectangle.
    pub selection: SelectionBounds,
    /// Region cropped and sent to the service; contains `selection`.
    pub processing: SelectionBounds,
    /// Lasso outline relative to `processing`.
    pub polygon: Option<Vec<PolygonPoint>>,
    pub cropped: RgbaImage,
    /// Inpainting mask at processing size: 255 = regenerate.
    pub mask: GrayImage,
    /// Lasso alpha mask at selection size: 255 = keep patch pixel.
    pub result_mask: Option<GrayImage>,
    pub aspect: Option<AspectAdjustment>,
    /// The image was too small for the aspect expansion, so `processing`
    /// misses the target ratio.
    pub aspect_clamped: bool,
    token: Option<EpochToken>,
}

impl PreparedFill {
    pub fn to_request(&self, options: &FillOptions) -> Result<GenerateRequest, RasterError> {
        Ok(GenerateRequest {
            model: options.model.id().to_string(),
            prompt: options.prompt.clone(),
            image_base64: io::encode_png_base64(&self.cropped)?,
            mask_base64: io::encode_mask_base64(&self.mask)?,
            reference_images: options.reference_images.clone(),
            image_size: options.image_size.map(|s| s.as_str().to_string()),
        })
    }

    /// Lasso outline relative to the selection's own origin.
    pub fn polygon_in_selection(&self) -> Option<Vec<PolygonPoint>> {
        let offset = self.selection.relative_to(&self.processing);
        self.polygon
            .as_ref()
            .map(|p| translate_points(p, offset.x as f64, offset.y as f64))
    }
}

/// Turn a canvas selection into the crop, masks and bounds for a fill.
pub fn prepare_fill(
    base: &RgbaImage,
    transform: &ImageTransform,
    selection: Option<&Selection>,
    options: &FillOptions,
) -> Result<PreparedFill, PipelineError> {
    let (img_w, img_h) = base.dimensions();
    let extracted = selection::extract(selection).ok_or(PipelineError::NoSelection)?;

    let Some(image_bounds) = transform::to_image_space(&extracted.bounds, transform, img_w, img_h) else {
        crate::log_warn!(
            "Selection {:?} maps outside the {}x{} image; fill aborted",
            extracted.bounds,
            img_w,
            img_h
        );
        return Err(PipelineError::OutOfBounds {
            bounds: extracted.bounds,
            image_width: img_w,
            image_height: img_h,
        });
    };

    let mut processing = if options.full_image_context {
        SelectionBounds::new(0, 0, img_w, img_h)
    } else {
        image_bounds
    };

    let mut adjustment = None;
    let mut aspect_clamped = false;
    if !options.reference_images.is_empty()
        && let Some(adj) = aspect::normalize(processing.width, processing.height, options.aspect_tolerance)
    {
        if adj.needs_adjustment {
            processing = aspect::expand_bounds(&processing, adj.width, adj.height, img_w, img_h);
            aspect_clamped = (processing.width, processing.height) != (adj.width, adj.height);
            if aspect_clamped {
                crate::log_warn!(
                    "Aspect {} needs {}x{} but the image only allows {}x{}",
                    adj.ratio.label(),
                    adj.width,
                    adj.height,
                    processing.width,
                    processing.height
                );
            }
        }
        adjustment = Some(adj);
    }

    let cropped = imageops::crop_imm(
        base,
        processing.x as u32,
        processing.y as u32,
        processing.width,
        processing.height,
    )
    .to_image();

    let polygon = extracted.polygon.as_ref().map(|points| {
        let in_image = transform::polygon_to_image_space(points, transform);
        translate_points(&in_image, processing.x as f64, processing.y as f64)
    });

    let embedded = (processing != image_bounds).then(|| image_bounds.relative_to(&processing));
    let mask = masks::inpainting_mask(processing.width, processing.height, polygon.as_deref(), embedded);

    let mut prepared = PreparedFill {
        selection: image_bounds,
        processing,
        polygon,
        cropped,
        mask,
        result_mask: None,
        aspect: adjustment,
        aspect_clamped,
        token: None,
    };
    prepared.result_mask = prepared.polygon_in_selection().map(|points| {
        masks::result_mask(image_bounds.width, image_bounds.height, &points, options.feather_radius)
    });
    Ok(prepared)
}

/// [`prepare_fill`] against a stack's base layer.  The result remembers the
/// stack's epoch so a patch arriving after the image was replaced is
/// dropped instead of inserted.
pub fn prepare_from_stack(
    stack: &LayerStack,
    selection: Option<&Selection>,
    options: &FillOptions,
) -> Result<PreparedFill, PipelineError> {
    let base = stack.base_layer().ok_or(PipelineError::NoBaseImage)?;
    let pixels = base.image_data.decode()?;
    let mut prepared = prepare_fill(&pixels, &stack.transform, selection, options)?;
    prepared.token = Some(stack.epoch_token());
    Ok(prepared)
}

// ============================================================================
// SERVICE CALL + INSERTION
// ============================================================================

/// Send a prepared fill to the service and decode the returned patch.
pub fn request_patch(
    service: &dyn GenerationService,
    prepared: &PreparedFill,
    options: &FillOptions,
) -> Result<RgbaImage, PipelineError> {
    let request = prepared.to_request(options)?;
    crate::log_info!(
        "Requesting fill from {} for {}x{} region",
        options.model.backend_model(),
        prepared.processing.width,
        prepared.processing.height
    );
    let response = service.generate_fill(&request);
    if !response.success {
        return Err(PipelineError::Service(
            response.error.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    let data = response
        .image_base64
        .ok_or_else(|| PipelineError::Service("response carried no image".to_string()))?;
    Ok(io::decode_base64_image(&data)?)
}

/// Insert a returned patch as a new edit layer on top of the stack.
///
/// The patch is resized to the processing bounds, cropped to the selection
/// and, for lassos, clipped to the outline.  Returns `Ok(None)` when the
/// stack was reset since preparation.
pub fn insert_result(
    stack: &mut LayerStack,
    prepared: &PreparedFill,
    patch: &RgbaImage,
    options: &FillOptions,
) -> Result<Option<LayerId>, PipelineError> {
    if prepared.token.as_ref().is_some_and(|t| t.is_stale()) {
        crate::log_info!("Dropping generated patch: image was replaced while generating");
        return Ok(None);
    }

    let processing = prepared.processing;
    let resized = if patch.dimensions() != (processing.width, processing.height) {
        imageops::resize(patch, processing.width, processing.height, FilterType::Lanczos3)
    } else {
        patch.clone()
    };
    let rel = prepared.selection.relative_to(&processing);
    let unclipped = imageops::crop_imm(
        &resized,
        rel.x as u32,
        rel.y as u32,
        prepared.selection.width,
        prepared.selection.height,
    )
    .to_image();

    let name = format!(
        "Fill {}",
        stack.layers().iter().filter(|l| l.kind == LayerKind::Edit).count() + 1
    );
    let mut layer = Layer::placed(LayerKind::Edit, name, unclipped, prepared.selection);
    layer.feather_radius = options.feather_radius.max(0.0);
    layer.polygon_points = prepared.polygon_in_selection();

    match (&prepared.result_mask, layer.original_image_data.clone()) {
        (Some(mask), Some(original)) => {
            let source = original.decode()?;
            match masks::apply_alpha_mask(&source, mask) {
                Some(clipped) => layer.image_data = Raster::new(clipped),
                None => crate::log_warn!("Result mask size mismatch; inserting unclipped patch"),
            }
        }
        _ => layer.image_data = canvas_ops::remask(&layer),
    }

    let id = canvas_ops::add_layer(stack, layer);
    crate::log_info!("Inserted generated layer {}", id);
    Ok(Some(id))
}

/// Prepare, generate and insert in one go.
pub fn run_fill(
    service: &dyn GenerationService,
    stack: &mut LayerStack,
    selection: Option<&Selection>,
    options: &FillOptions,
) -> Result<Option<LayerId>, PipelineError> {
    let prepared = prepare_from_stack(stack, selection, options)?;
    let patch = request_patch(service, &prepared, options)?;
    insert_result(stack, &prepared, &patch, options)
}

/// Encode an existing layer as a reference image for a later request.
pub fn reference_from_layer(stack: &LayerStack, id: LayerId) -> Result<String, PipelineError> {
    let layer = stack.get(id).ok_or(PipelineError::UnknownLayer(id))?;
    Ok(layer.image_data.to_base64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use std::cell::RefCell;

    struct SolidService {
        colour: [u8; 4],
        size: (u32, u32),
        seen: RefCell<Vec<GenerateRequest>>,
    }

    impl SolidService {
        fn new(colour: [u8; 4], size: (u32, u32)) -> Self {
            Self { colour, size, seen: RefCell::new(Vec::new()) }
        }
    }

    impl GenerationService for SolidService {
        fn generate_fill(&self, request: &GenerateRequest) -> GenerateResponse {
            self.seen.borrow_mut().push(request.clone());
            let patch = RgbaImage::from_pixel(self.size.0, self.size.1, Rgba(self.colour));
            match io::encode_png_base64(&patch) {
                Ok(data) => GenerateResponse::ok(data),
                Err(e) => GenerateResponse::failed(e.to_string()),
            }
        }
    }

    struct FailingService;

    impl GenerationService for FailingService {
        fn generate_fill(&self, _: &GenerateRequest) -> GenerateResponse {
            GenerateResponse::failed("API key not configured")
        }
    }

    fn base() -> RgbaImage {
        RgbaImage::from_pixel(200, 150, Rgba([10, 10, 10, 255]))
    }

    fn triangle() -> Selection {
        Selection::Polygon(vec![
            PolygonPoint::new(20.0, 20.0),
            PolygonPoint::new(100.0, 20.0),
            PolygonPoint::new(20.0, 100.0),
        ])
    }

    #[test]
    fn model_ids_and_prompt() {
        assert_eq!(Model::parse("nano-banana-pro"), Model::NanoBananaPro);
        assert_eq!(Model::parse("something-else"), Model::NanoBanana);
        assert_eq!(Model::NanoBanana.backend_model(), "gemini-2.5-flash-image");
        assert_eq!(ImageSize::parse("2k"), Some(ImageSize::TwoK));
        assert_eq!(ImageSize::parse("8K"), None);
        let p = build_prompt("a red balloon");
        assert!(p.contains("generate: a red balloon."));
        assert!(p.contains("Keep the black areas unchanged"));
    }

    #[test]
    fn rectangle_fill_uses_full_mask_at_image_bounds() {
        let sel = Selection::rectangle(10.0, 20.0, 50.0, 50.0);
        let t = ImageTransform::new(0.0, 0.0, 2.0, 2.0).unwrap();
        let prepared = prepare_fill(&base(), &t, Some(&sel), &FillOptions::default()).unwrap();
        assert_eq!(prepared.selection, SelectionBounds::new(5, 10, 25, 25));
        assert_eq!(prepared.processing, prepared.selection);
        assert_eq!(prepared.cropped.dimensions(), (25, 25));
        assert_eq!(masks::mask_sum(&prepared.mask), 25 * 25 * 255);
        assert!(prepared.result_mask.is_none());
    }

    #[test]
    fn missing_or_empty_selection_is_no_selection() {
        let t = ImageTransform::IDENTITY;
        let opts = FillOptions::default();
        assert!(matches!(prepare_fill(&base(), &t, None, &opts), Err(PipelineError::NoSelection)));
        let flat = Selection::rectangle(5.0, 5.0, 0.0, 9.0);
        assert!(matches!(prepare_fill(&base(), &t, Some(&flat), &opts), Err(PipelineError::NoSelection)));
    }

    #[test]
    fn selection_outside_image_is_rejected_before_any_call() {
        let service = SolidService::new([0, 0, 0, 255], (8, 8));
        let mut stack = LayerStack::from_image(base());
        let sel = Selection::rectangle(500.0, 500.0, 20.0, 20.0);
        let err = run_fill(&service, &mut stack, Some(&sel), &FillOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::OutOfBounds { image_width: 200, image_height: 150, .. }));
        assert!(service.seen.borrow().is_empty());
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn context_mode_embeds_the_selection_rectangle() {
        let sel = Selection::rectangle(10.0, 20.0, 30.0, 40.0);
        let opts = FillOptions { full_image_context: true, ..FillOptions::default() };
        let prepared = prepare_fill(&base(), &ImageTransform::IDENTITY, Some(&sel), &opts).unwrap();
        assert_eq!(prepared.processing, SelectionBounds::new(0, 0, 200, 150));
        assert_eq!(masks::mask_sum(&prepared.mask), 30 * 40 * 255);
        assert_eq!(prepared.mask.get_pixel(10, 20).0[0], 255);
        assert_eq!(prepared.mask.get_pixel(9, 20).0[0], 0);
    }

    #[test]
    fn context_mode_places_lasso_at_its_absolute_position() {
        let opts = FillOptions { full_image_context: true, ..FillOptions::default() };
        let prepared = prepare_fill(&base(), &ImageTransform::IDENTITY, Some(&triangle()), &opts).unwrap();
        assert_eq!(prepared.mask.dimensions(), (200, 150));
        assert_eq!(prepared.mask.get_pixel(25, 25).0[0], 255);
        assert_eq!(prepared.mask.get_pixel(5, 5).0[0], 0);
        assert_eq!(prepared.mask.get_pixel(90, 90).0[0], 0);
        let rm = prepared.result_mask.as_ref().unwrap();
        assert_eq!(rm.dimensions(), (80, 80));
    }

    #[test]
    fn reference_images_trigger_aspect_expansion() {
        // 60x20 (3:1) -> nearest 21:9, grow height to 26.
        let sel = Selection::rectangle(50.0, 50.0, 60.0, 20.0);
        let opts = FillOptions { reference_images: vec!["ref".into()], ..FillOptions::default() };
        let prepared = prepare_fill(&base(), &ImageTransform::IDENTITY, Some(&sel), &opts).unwrap();
        let adj = prepared.aspect.unwrap();
        assert!(adj.needs_adjustment);
        assert_eq!((prepared.processing.width, prepared.processing.height), (60, 26));
        assert!(prepared.processing.contains(&prepared.selection));
        // Only the original selection is marked for regeneration.
        assert_eq!(masks::mask_sum(&prepared.mask), 60 * 20 * 255);
        assert!(!prepared.aspect_clamped);
    }

    #[test]
    fn aspect_expansion_past_the_image_is_flagged() {
        // Whole 300x100 image as context: 21:9 wants 300x129, only 100 rows exist.
        let wide = RgbaImage::from_pixel(300, 100, Rgba([1, 2, 3, 255]));
        let sel = Selection::rectangle(10.0, 10.0, 20.0, 20.0);
        let opts = FillOptions {
            full_image_context: true,
            reference_images: vec!["ref".into()],
            ..FillOptions::default()
        };
        let prepared = prepare_fill(&wide, &ImageTransform::IDENTITY, Some(&sel), &opts).unwrap();
        let adj = prepared.aspect.unwrap();
        assert_eq!((adj.width, adj.height), (300, 129));
        assert_eq!(prepared.processing, SelectionBounds::new(0, 0, 300, 100));
        assert!(prepared.aspect_clamped);
    }

    #[test]
    fn lasso_fill_inserts_a_clipped_active_layer() {
        let service = SolidService::new([250, 0, 0, 255], (40, 40));
        let mut stack = LayerStack::from_image(base());
        let opts = FillOptions { prompt: "a cat".into(), ..FillOptions::default() };

        let id = run_fill(&service, &mut stack, Some(&triangle()), &opts).unwrap().unwrap();

        let seen = service.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model, "nano-banana");
        assert_eq!(seen[0].prompt, "a cat");

        let layer = stack.get(id).unwrap();
        assert_eq!(stack.active_layer_id(), Some(id));
        assert_eq!(layer.order, 1);
        assert_eq!(layer.bounds(), Some(SelectionBounds::new(20, 20, 80, 80)));
        assert_eq!(layer.polygon_points.as_ref().unwrap()[0], PolygonPoint::new(0.0, 0.0));

        let shown = layer.image_data.decode().unwrap();
        assert_eq!(shown.dimensions(), (80, 80));
        assert_eq!(shown.get_pixel(5, 5).0, [250, 0, 0, 255]);
        assert_eq!(shown.get_pixel(75, 75)[3], 0);
        // The unclipped patch is kept for re-feathering.
        let original = layer.original_image_data.as_ref().unwrap().decode().unwrap();
        assert_eq!(original.get_pixel(75, 75)[3], 255);
    }

    #[test]
    fn service_failure_is_surfaced() {
        let mut stack = LayerStack::from_image(base());
        let sel = Selection::rectangle(0.0, 0.0, 10.0, 10.0);
        let err = run_fill(&FailingService, &mut stack, Some(&sel), &FillOptions::default()).unwrap_err();
        match err {
            PipelineError::Service(msg) => assert!(msg.contains("API key")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn patch_for_a_replaced_image_is_dropped() {
        let mut stack = LayerStack::from_image(base());
        let sel = Selection::rectangle(0.0, 0.0, 10.0, 10.0);
        let opts = FillOptions::default();
        let prepared = prepare_from_stack(&stack, Some(&sel), &opts).unwrap();
        stack.replace_base(base());
        let patch = RgbaImage::new(10, 10);
        assert_eq!(insert_result(&mut stack, &prepared, &patch, &opts).unwrap(), None);
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn unknown_layer_reference_is_an_error() {
        let stack = LayerStack::from_image(base());
        let id = uuid::Uuid::new_v4();
        assert!(matches!(reference_from_layer(&stack, id), Err(PipelineError::UnknownLayer(x)) if x == id));
        let base_id = stack.layers()[0].id;
        assert!(reference_from_layer(&stack, base_id).is_ok());
    }
}
