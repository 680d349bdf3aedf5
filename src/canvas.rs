use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::io::{self, RasterError};

// ============================================================================
// GEOMETRY
// ============================================================================

/// How the source image sits inside the canvas viewport: an origin offset
/// plus a per-axis scale.  Canvas = image * scale + offset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTransform {
    pub offset_x: f64,
    pub offset_y: f64,
    pub scale_x: f64,
    pub scale_y: f64,
}

impl ImageTransform {
    pub const IDENTITY: ImageTransform = ImageTransform {
        offset_x: 0.0,
        offset_y: 0.0,
        scale_x: 1.0,
        scale_y: 1.0,
    };

    /// Returns `None` unless both scales are finite and strictly positive.
    pub fn new(offset_x: f64, offset_y: f64, scale_x: f64, scale_y: f64) -> Option<Self> {
        let t = Self { offset_x, offset_y, scale_x, scale_y };
        t.is_valid().then_some(t)
    }

    pub fn is_valid(&self) -> bool {
        self.offset_x.is_finite()
            && self.offset_y.is_finite()
            && self.scale_x.is_finite()
            && self.scale_y.is_finite()
            && self.scale_x > 0.0
            && self.scale_y > 0.0
    }
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Integer axis-aligned rectangle.  Canvas space or image space; the caller
/// tracks which.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SelectionBounds {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl SelectionBounds {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// A bounds with no area.  Rejected before any mask work.
    pub fn is_degenerate(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    pub fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Re-express these bounds relative to `origin`'s top-left corner.
    pub fn relative_to(&self, origin: &SelectionBounds) -> SelectionBounds {
        SelectionBounds {
            x: self.x - origin.x,
            y: self.y - origin.y,
            width: self.width,
            height: self.height,
        }
    }

    pub fn contains(&self, other: &SelectionBounds) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    /// Intersect with the `(0, 0, w, h)` image rectangle.
    pub fn clamp_to(&self, w: u32, h: u32) -> Option<SelectionBounds> {
        let x0 = (self.x as i64).clamp(0, w as i64);
        let y0 = (self.y as i64).clamp(0, h as i64);
        let x1 = self.right().clamp(0, w as i64);
        let y1 = self.bottom().clamp(0, h as i64);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(SelectionBounds {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// One vertex of a free-form (lasso) selection.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct PolygonPoint {
    pub x: f64,
    pub y: f64,
}

impl PolygonPoint {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

// ============================================================================
// RASTER PAYLOAD
// ============================================================================

/// Pixel payload of a layer.
///
/// Rasters are immutable once built: edits always produce a new raster, so
/// cloning a layer (for history snapshots) only bumps a reference count.
/// Layers restored from a project keep their encoded form until the first
/// time something needs the pixels; a corrupt payload then fails for that
/// layer alone.
#[derive(Clone)]
pub enum Raster {
    Decoded(Arc<RgbaImage>),
    Encoded(Arc<str>),
}

impl Raster {
    pub fn new(image: RgbaImage) -> Self {
        Raster::Decoded(Arc::new(image))
    }

    pub fn from_base64(data: &str) -> Self {
        Raster::Encoded(Arc::from(data))
    }

    pub fn decode(&self) -> Result<Arc<RgbaImage>, RasterError> {
        match self {
            Raster::Decoded(img) => Ok(Arc::clone(img)),
            Raster::Encoded(data) => io::decode_base64_image(data).map(Arc::new),
        }
    }

    /// Base64 PNG for the wire.  Encoded rasters are passed through untouched
    /// so the base layer keeps its source format.
    pub fn to_base64(&self) -> Result<String, RasterError> {
        match self {
            Raster::Decoded(img) => io::encode_png_base64(img),
            Raster::Encoded(data) => Ok(data.to_string()),
        }
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        match self {
            Raster::Decoded(img) => Some(img.dimensions()),
            Raster::Encoded(_) => None,
        }
    }

    /// Same underlying buffer, without comparing pixels.
    pub fn shares_buffer(&self, other: &Raster) -> bool {
        match (self, other) {
            (Raster::Decoded(a), Raster::Decoded(b)) => Arc::ptr_eq(a, b),
            (Raster::Encoded(a), Raster::Encoded(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn same_pixels(&self, other: &Raster) -> bool {
        match (self, other) {
            (Raster::Decoded(a), Raster::Decoded(b)) => {
                Arc::ptr_eq(a, b) || (a.dimensions() == b.dimensions() && a.as_raw() == b.as_raw())
            }
            (Raster::Encoded(a), Raster::Encoded(b)) => Arc::ptr_eq(a, b) || a == b,
            _ => false,
        }
    }
}

impl PartialEq for Raster {
    fn eq(&self, other: &Self) -> bool {
        self.same_pixels(other)
    }
}

impl fmt::Debug for Raster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Raster::Decoded(img) => write!(f, "Raster::Decoded({}x{})", img.width(), img.height()),
            Raster::Encoded(data) => write!(f, "Raster::Encoded({} bytes)", data.len()),
        }
    }
}

// ============================================================================
// LAYERS
// ============================================================================

pub type LayerId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Base,
    Edit,
    Shape,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Layer {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    /// Currently displayed pixels (post-masking when feathered).
    pub image_data: Raster,
    /// Unmasked source kept so feathering can be re-applied from clean pixels.
    pub original_image_data: Option<Raster>,
    pub visible: bool,
    /// 0..=100
    pub opacity: f32,
    /// Paint order, bottom to top.  Always equals the index in the stack.
    pub order: usize,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Lasso outline, relative to the layer's own `(x, y)`.
    pub polygon_points: Option<Vec<PolygonPoint>>,
    pub feather_radius: f32,
}

impl Layer {
    /// The bottom layer for a freshly loaded image.  Fills the whole canvas.
    pub fn base(image: RgbaImage) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: "Background".to_string(),
            kind: LayerKind::Base,
            image_data: Raster::new(image),
            original_image_data: None,
            visible: true,
            opacity: 100.0,
            order: 0,
            x: None,
            y: None,
            width: None,
            height: None,
            polygon_points: None,
            feather_radius: 0.0,
        }
    }

    /// A positioned layer covering `bounds` in image space.  The raster is
    /// kept as the unmasked original as well.
    pub fn placed(kind: LayerKind, name: String, image: RgbaImage, bounds: SelectionBounds) -> Self {
        let raster = Raster::new(image);
        Self {
            id: Uuid::new_v4(),
            name,
            kind,
            image_data: raster.clone(),
            original_image_data: Some(raster),
            visible: true,
            opacity: 100.0,
            order: 0,
            x: Some(bounds.x),
            y: Some(bounds.y),
            width: Some(bounds.width),
            height: Some(bounds.height),
            polygon_points: None,
            feather_radius: 0.0,
        }
    }

    pub fn is_base(&self) -> bool {
        self.kind == LayerKind::Base
    }

    /// Placement rectangle, when the layer is positioned explicitly.
    pub fn bounds(&self) -> Option<SelectionBounds> {
        match (self.x, self.y, self.width, self.height) {
            (Some(x), Some(y), Some(w), Some(h)) => Some(SelectionBounds::new(x, y, w, h)),
            _ => None,
        }
    }

    /// The clean source for re-masking: the retained original, else the
    /// displayed raster.
    pub fn source_raster(&self) -> &Raster {
        self.original_image_data.as_ref().unwrap_or(&self.image_data)
    }

    /// True when the layer asks for a feathered lasso but its displayed
    /// raster is still the untouched original, so nothing has masked it yet.
    pub fn needs_remask(&self) -> bool {
        self.polygon_points.is_some()
            && self.feather_radius > 0.0
            && self
                .original_image_data
                .as_ref()
                .is_some_and(|original| original.shares_buffer(&self.image_data))
    }

    /// Paint alpha in `0.0..=1.0`.
    pub fn paint_alpha(&self) -> f32 {
        (self.opacity / 100.0).clamp(0.0, 1.0)
    }

    /// Field-by-field comparison used by the history filter.  Polygon and
    /// feather changes always land in `image_data` as well, so they are not
    /// compared separately.
    pub fn differs_from(&self, other: &Layer) -> bool {
        self.id != other.id
            || self.visible != other.visible
            || self.opacity != other.opacity
            || self.order != other.order
            || self.name != other.name
            || self.x != other.x
            || self.y != other.y
            || self.width != other.width
            || self.height != other.height
            || !self.image_data.same_pixels(&other.image_data)
    }
}

// ============================================================================
// LAYER STACK
// ============================================================================

/// Published by a [`LayerStack`] to whoever subscribed (the history recorder).
#[derive(Clone, Debug)]
pub enum LayerStackEvent {
    Changed {
        version: u64,
        layers: Arc<Vec<Layer>>,
        active_layer_id: Option<LayerId>,
    },
    /// A new base image replaced the project.
    Reset,
    /// Stops a recorder thread.
    Shutdown,
}

/// Snapshot of the stack's epoch taken when a long-running pass starts.
#[derive(Clone, Debug)]
pub struct EpochToken {
    epoch: Arc<AtomicU64>,
    seen: u64,
}

impl EpochToken {
    /// True once the base image or canvas was reset after the token was taken.
    pub fn is_stale(&self) -> bool {
        self.epoch.load(Ordering::Acquire) != self.seen
    }
}

/// The composition: an ordered set of layers plus canvas geometry.
///
/// All mutation goes through this type (see `ops::canvas_ops`), which keeps
/// `order` contiguous, bumps `version` and publishes a change event.
/// `epoch` only moves when the base image or canvas is replaced, so in-flight
/// composites can tell they are working on an outdated project.
pub struct LayerStack {
    pub(crate) layers: Vec<Layer>,
    pub(crate) active_layer_id: Option<LayerId>,
    pub width: u32,
    pub height: u32,
    pub transform: ImageTransform,
    version: u64,
    epoch: Arc<AtomicU64>,
    events: Option<Sender<LayerStackEvent>>,
}

impl LayerStack {
    /// An empty canvas with no base layer (a cleared project).
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            layers: Vec::new(),
            active_layer_id: None,
            width,
            height,
            transform: ImageTransform::IDENTITY,
            version: 0,
            epoch: Arc::new(AtomicU64::new(0)),
            events: None,
        }
    }

    pub fn from_image(image: RgbaImage) -> Self {
        let mut stack = Self::new(image.width(), image.height());
        let base = Layer::base(image);
        stack.active_layer_id = Some(base.id);
        stack.layers.push(base);
        stack
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn get(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|l| l.id == id)
    }

    pub fn index_of(&self, id: LayerId) -> Option<usize> {
        self.layers.iter().position(|l| l.id == id)
    }

    pub fn base_layer(&self) -> Option<&Layer> {
        self.layers.first().filter(|l| l.is_base())
    }

    pub fn active_layer_id(&self) -> Option<LayerId> {
        self.active_layer_id
    }

    pub fn active_layer(&self) -> Option<&Layer> {
        self.active_layer_id.and_then(|id| self.get(id))
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn epoch_token(&self) -> EpochToken {
        EpochToken {
            epoch: Arc::clone(&self.epoch),
            seen: self.epoch(),
        }
    }

    /// Route change events to `sender`.  One subscriber at a time.
    pub fn subscribe(&mut self, sender: Sender<LayerStackEvent>) {
        self.events = Some(sender);
    }

    /// True when the `order` values are exactly `0..len` and the base layer,
    /// if any, sits at 0.
    pub fn has_contiguous_order(&self) -> bool {
        let ordered = self.layers.iter().enumerate().all(|(i, l)| l.order == i);
        let base_ok = self
            .layers
            .iter()
            .all(|l| !l.is_base() || l.order == 0);
        ordered && base_ok
    }

    /// Deep copy of the layers for a history snapshot.
    pub fn snapshot_layers(&self) -> Vec<Layer> {
        self.layers.clone()
    }

    /// Replace the whole project with a new base image.
    pub fn replace_base(&mut self, image: RgbaImage) {
        self.width = image.width();
        self.height = image.height();
        let base = Layer::base(image);
        self.active_layer_id = Some(base.id);
        self.layers = vec![base];
        self.bump_epoch();
        self.publish(LayerStackEvent::Reset);
        self.commit();
    }

    /// Resize the canvas without touching layers (e.g. a new viewport after
    /// load).  Invalidates in-flight composites.
    pub fn reset_canvas(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
        self.bump_epoch();
        self.commit();
    }

    /// Replace the layer list wholesale (undo/redo, project load).
    ///
    /// Layers are re-sorted by `order`, base layers first, and renumbered so
    /// the z-order invariant holds even for hand-edited input.  An unknown
    /// `active_layer_id` falls back to the top layer.
    pub fn restore_layers(&mut self, mut layers: Vec<Layer>, active_layer_id: Option<LayerId>) {
        layers.sort_by_key(|l| (!l.is_base(), l.order));
        self.layers = layers;
        self.active_layer_id = active_layer_id
            .filter(|id| self.layers.iter().any(|l| l.id == *id))
            .or_else(|| self.layers.last().map(|l| l.id));
        self.commit();
    }

    pub(crate) fn layers_mut(&mut self) -> &mut Vec<Layer> {
        &mut self.layers
    }

    /// Renumber, bump the version and notify the subscriber.
    pub(crate) fn commit(&mut self) {
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.order = i;
        }
        self.version += 1;
        let event = LayerStackEvent::Changed {
            version: self.version,
            layers: Arc::new(self.layers.clone()),
            active_layer_id: self.active_layer_id,
        };
        self.publish(event);
    }

    fn bump_epoch(&mut self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    fn publish(&mut self, event: LayerStackEvent) {
        let disconnected = match &self.events {
            Some(sender) => sender.send(event).is_err(),
            None => false,
        };
        if disconnected {
            // Receiver went away; stop publishing.
            self.events = None;
        }
    }
}

impl fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStack")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layers", &self.layers.len())
            .field("version", &self.version)
            .field("epoch", &self.epoch())
            .finish()
    }
}
