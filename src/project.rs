use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::canvas::{ImageTransform, Layer, LayerId, LayerKind, LayerStack, PolygonPoint, Raster};
use crate::components::history::HistoryRecorder;
use crate::io::RasterError;
use crate::settings::Settings;

// ============================================================================
// OPEN DOCUMENT
// ============================================================================

/// Single open document: the layer stack plus the recorder watching it.
pub struct Project {
    pub id: Uuid,
    pub stack: LayerStack,
    pub history: HistoryRecorder,
    /// `None` for unsaved/untitled files.
    pub path: Option<PathBuf>,
    pub is_dirty: bool,
    /// Display name (derived from path or "Untitled-X")
    pub name: String,
}

impl Project {
    pub fn from_image(untitled_counter: usize, image: RgbaImage, settings: &Settings) -> Self {
        Self::with_stack(
            LayerStack::from_image(image),
            None,
            format!("Untitled-{}", untitled_counter),
            settings,
        )
    }

    pub fn open(path: &Path, settings: &Settings) -> Result<Self, ProjectError> {
        let stack = load_project(path)?;
        Ok(Self::with_stack(stack, Some(path.to_path_buf()), name_from_path(path), settings))
    }

    fn with_stack(mut stack: LayerStack, path: Option<PathBuf>, name: String, settings: &Settings) -> Self {
        let history = HistoryRecorder::spawn(settings.history_manager());
        history.attach(&mut stack);
        Self {
            id: Uuid::new_v4(),
            stack,
            history,
            path,
            is_dirty: false,
            name,
        }
    }

    /// Save to `path` (or the current path) and remember it.
    pub fn save(&mut self, path: Option<&Path>) -> Result<(), ProjectError> {
        let target = match path.map(Path::to_path_buf).or_else(|| self.path.clone()) {
            Some(p) => p,
            None => return Err(ProjectError::InvalidFormat("Project has no file path".into())),
        };
        save_project(&self.stack, &target)?;
        self.name = name_from_path(&target);
        self.path = Some(target);
        self.mark_clean();
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        let changed = self.history.undo(&mut self.stack);
        if changed {
            self.mark_dirty();
        }
        changed
    }

    pub fn redo(&mut self) -> bool {
        let changed = self.history.redo(&mut self.stack);
        if changed {
            self.mark_dirty();
        }
        changed
    }

    pub fn mark_dirty(&mut self) {
        self.is_dirty = true;
    }

    pub fn mark_clean(&mut self) {
        self.is_dirty = false;
    }

    /// Get the display title (name with dirty indicator)
    pub fn display_title(&self) -> String {
        if self.is_dirty {
            format!("{}*", self.name)
        } else {
            self.name.clone()
        }
    }
}

fn name_from_path(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "Unknown".to_string())
}

// ============================================================================
// BSP PROJECT FILE FORMAT
// ============================================================================

/// Magic header for binary project files.
const BSP_MAGIC: &str = "BSP1";

/// Maximum supported canvas dimension in pixels (per axis).
/// Prevents memory exhaustion from crafted project files.
pub const MAX_CANVAS_DIM: u32 = 32_768;
/// Maximum number of layers in a project file.
pub const MAX_LAYERS: usize = 256;

/// Serializable project.  The same shape is used for `.bsp` (bincode) and
/// the JSON interchange form.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    pub magic: String,
    pub width: u32,
    pub height: u32,
    pub transform: ImageTransform,
    pub active_layer_id: Option<LayerId>,
    pub layers: Vec<LayerRecord>,
}

/// One layer with its rasters as base64 PNG.
#[derive(Serialize, Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct LayerRecord {
    pub id: LayerId,
    pub name: String,
    pub kind: LayerKind,
    pub image_data: String,
    pub original_image_data: Option<String>,
    pub visible: bool,
    pub opacity: f32,
    pub order: usize,
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub polygon_points: Option<Vec<PolygonPoint>>,
    pub feather_radius: f32,
}

impl LayerRecord {
    fn from_layer(layer: &Layer) -> Result<Self, RasterError> {
        Ok(Self {
            id: layer.id,
            name: layer.name.clone(),
            kind: layer.kind,
            image_data: layer.image_data.to_base64()?,
            original_image_data: layer
                .original_image_data
                .as_ref()
                .map(Raster::to_base64)
                .transpose()?,
            visible: layer.visible,
            opacity: layer.opacity,
            order: layer.order,
            x: layer.x,
            y: layer.y,
            width: layer.width,
            height: layer.height,
            polygon_points: layer.polygon_points.clone(),
            feather_radius: layer.feather_radius,
        })
    }

    /// Rasters stay encoded; a corrupt payload only shows up when that
    /// layer is composited.
    fn into_layer(self) -> Layer {
        Layer {
            id: self.id,
            name: self.name,
            kind: self.kind,
            image_data: Raster::from_base64(&self.image_data),
            original_image_data: self.original_image_data.as_deref().map(Raster::from_base64),
            visible: self.visible,
            opacity: if self.opacity.is_finite() { self.opacity.clamp(0.0, 100.0) } else { 100.0 },
            order: self.order,
            x: self.x,
            y: self.y,
            width: self.width,
            height: self.height,
            polygon_points: self.polygon_points,
            feather_radius: if self.feather_radius.is_finite() { self.feather_radius.max(0.0) } else { 0.0 },
        }
    }
}

/// Error type for project file operations
#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Serialize(String),
    InvalidFormat(String),
    Raster(RasterError),
}

impl std::fmt::Display for ProjectError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "I/O error: {}", e),
            ProjectError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ProjectError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
            ProjectError::Raster(e) => write!(f, "Raster error: {}", e),
        }
    }
}

impl std::error::Error for ProjectError {}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<Box<bincode::ErrorKind>> for ProjectError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        ProjectError::Serialize(e.to_string())
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Serialize(e.to_string())
    }
}

impl From<RasterError> for ProjectError {
    fn from(e: RasterError) -> Self {
        ProjectError::Raster(e)
    }
}

/// Build the serializable project from a stack.
pub fn build_project_file(stack: &LayerStack) -> Result<ProjectFile, ProjectError> {
    if stack.base_layer().is_none() {
        return Err(ProjectError::InvalidFormat("Project has no base image".into()));
    }
    let layers = stack
        .layers()
        .iter()
        .map(LayerRecord::from_layer)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ProjectFile {
        magic: BSP_MAGIC.to_string(),
        width: stack.width,
        height: stack.height,
        transform: stack.transform,
        active_layer_id: stack.active_layer_id(),
        layers,
    })
}

/// Validate a deserialized project and turn it into a live stack.
pub fn restore_project(project: ProjectFile) -> Result<LayerStack, ProjectError> {
    if project.magic != BSP_MAGIC {
        return Err(ProjectError::InvalidFormat(format!("Unknown magic '{}'", project.magic)));
    }
    if project.width == 0 || project.height == 0 {
        return Err(ProjectError::InvalidFormat("Canvas has zero size".into()));
    }
    if project.width > MAX_CANVAS_DIM || project.height > MAX_CANVAS_DIM {
        return Err(ProjectError::InvalidFormat(format!(
            "Canvas {}x{} exceeds the {}x{} limit",
            project.width, project.height, MAX_CANVAS_DIM, MAX_CANVAS_DIM
        )));
    }
    if project.layers.is_empty() {
        return Err(ProjectError::InvalidFormat("Project contains no layers".into()));
    }
    if project.layers.len() > MAX_LAYERS {
        return Err(ProjectError::InvalidFormat(format!(
            "Project has {} layers (max {})",
            project.layers.len(),
            MAX_LAYERS
        )));
    }
    let bases = project.layers.iter().filter(|l| l.kind == LayerKind::Base).count();
    if bases != 1 {
        return Err(ProjectError::InvalidFormat(format!(
            "Project must have exactly one base layer, found {}",
            bases
        )));
    }
    for record in &project.layers {
        let too_big = record.width.is_some_and(|w| w > MAX_CANVAS_DIM)
            || record.height.is_some_and(|h| h > MAX_CANVAS_DIM);
        if too_big {
            return Err(ProjectError::InvalidFormat(format!(
                "Layer '{}' exceeds the {}px limit",
                record.name, MAX_CANVAS_DIM
            )));
        }
    }

    let transform = if project.transform.is_valid() {
        project.transform
    } else {
        crate::log_warn!("Project transform {:?} is invalid; using identity", project.transform);
        ImageTransform::IDENTITY
    };

    let mut stack = LayerStack::new(project.width, project.height);
    stack.transform = transform;
    let layers = project.layers.into_iter().map(LayerRecord::into_layer).collect();
    stack.restore_layers(layers, project.active_layer_id);
    Ok(stack)
}

/// Save a stack as `.bsp`, or as JSON when the path ends in `.json`.
pub fn save_project(stack: &LayerStack, path: &Path) -> Result<(), ProjectError> {
    let project = build_project_file(stack)?;
    if is_json_path(path) {
        std::fs::write(path, serde_json::to_vec_pretty(&project)?)?;
    } else {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, &project)?;
    }
    crate::log_info!(
        "Saved project ({} layers, {}x{}) to {}",
        project.layers.len(),
        project.width,
        project.height,
        path.display()
    );
    Ok(())
}

/// Load a `.bsp` or JSON project file.
pub fn load_project(path: &Path) -> Result<LayerStack, ProjectError> {
    let raw = std::fs::read(path)?;
    let stack = if raw.first() == Some(&b'{') || is_json_path(path) {
        from_json(std::str::from_utf8(&raw).map_err(|e| ProjectError::InvalidFormat(e.to_string()))?)?
    } else {
        load_bsp(&raw)?
    };
    crate::log_info!(
        "Loaded project ({} layers, {}x{}) from {}",
        stack.len(),
        stack.width,
        stack.height,
        path.display()
    );
    Ok(stack)
}

fn load_bsp(raw: &[u8]) -> Result<LayerStack, ProjectError> {
    if raw.len() < 12 {
        return Err(ProjectError::InvalidFormat("File too small".into()));
    }
    // bincode encodes a String as an 8-byte length prefix plus UTF-8 data, so
    // bytes 8..12 hold the magic.
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != BSP_MAGIC {
        return Err(ProjectError::InvalidFormat(format!("Unknown magic '{}'", magic)));
    }
    let project: ProjectFile = bincode::deserialize(raw)?;
    restore_project(project)
}

pub fn to_json(stack: &LayerStack) -> Result<String, ProjectError> {
    Ok(serde_json::to_string(&build_project_file(stack)?)?)
}

pub fn from_json(json: &str) -> Result<LayerStack, ProjectError> {
    restore_project(serde_json::from_str(json)?)
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::SelectionBounds;
    use crate::ops::{canvas_ops, composite};
    use image::Rgba;

    fn sample_stack() -> LayerStack {
        let mut stack = LayerStack::from_image(RgbaImage::from_pixel(16, 12, Rgba([10, 20, 30, 255])));
        let mut patch = Layer::placed(
            LayerKind::Edit,
            "Fill 1".into(),
            RgbaImage::from_pixel(4, 4, Rgba([200, 0, 0, 255])),
            SelectionBounds::new(2, 3, 4, 4),
        );
        patch.polygon_points = Some(vec![
            PolygonPoint::new(0.0, 0.0),
            PolygonPoint::new(4.0, 0.0),
            PolygonPoint::new(2.0, 4.0),
        ]);
        patch.opacity = 60.0;
        canvas_ops::add_layer(&mut stack, patch);
        stack
    }

    #[test]
    fn bsp_round_trip_preserves_layers_and_pixels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.bsp");
        let stack = sample_stack();
        save_project(&stack, &path).unwrap();

        let loaded = load_project(&path).unwrap();
        assert_eq!((loaded.width, loaded.height), (16, 12));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.active_layer_id(), stack.active_layer_id());
        assert!(loaded.has_contiguous_order());
        let top = &loaded.layers()[1];
        assert_eq!(top.name, "Fill 1");
        assert_eq!(top.opacity, 60.0);
        assert_eq!(top.polygon_points.as_ref().map(Vec::len), Some(3));
        assert_eq!(composite::flatten(&loaded), composite::flatten(&stack));
    }

    #[test]
    fn json_round_trip_uses_camel_case() {
        let stack = sample_stack();
        let json = to_json(&stack).unwrap();
        assert!(json.contains("\"imageData\""));
        assert!(json.contains("\"featherRadius\""));
        assert!(json.contains("\"kind\":\"edit\""));
        let loaded = from_json(&json).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.layers()[0].kind, LayerKind::Base);
    }

    #[test]
    fn json_extension_selects_json_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scene.json");
        save_project(&sample_stack(), &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.trim_start().starts_with('{'));
        assert_eq!(load_project(&path).unwrap().len(), 2);
    }

    #[test]
    fn rejects_bad_magic_and_tiny_files() {
        let dir = tempfile::tempdir().unwrap();
        let tiny = dir.path().join("tiny.bsp");
        std::fs::write(&tiny, b"BSP").unwrap();
        assert!(matches!(load_project(&tiny), Err(ProjectError::InvalidFormat(_))));

        let wrong = dir.path().join("wrong.bsp");
        let mut bytes = vec![4, 0, 0, 0, 0, 0, 0, 0];
        bytes.extend_from_slice(b"PFE1");
        bytes.extend_from_slice(&[0; 16]);
        std::fs::write(&wrong, bytes).unwrap();
        assert!(matches!(load_project(&wrong), Err(ProjectError::InvalidFormat(_))));
    }

    #[test]
    fn enforces_canvas_and_layer_limits() {
        let stack = sample_stack();
        let mut project = build_project_file(&stack).unwrap();
        project.width = MAX_CANVAS_DIM + 1;
        assert!(matches!(restore_project(project), Err(ProjectError::InvalidFormat(_))));

        let mut project = build_project_file(&stack).unwrap();
        project.layers.retain(|l| l.kind != LayerKind::Base);
        assert!(matches!(restore_project(project), Err(ProjectError::InvalidFormat(_))));
    }

    #[test]
    fn cleared_project_cannot_be_saved() {
        let mut stack = sample_stack();
        canvas_ops::clear_project(&mut stack);
        assert!(matches!(build_project_file(&stack), Err(ProjectError::InvalidFormat(_))));
    }

    #[test]
    fn corrupt_layer_raster_survives_load() {
        let stack = sample_stack();
        let mut project = build_project_file(&stack).unwrap();
        project.layers[1].image_data = "not base64 at all!".into();
        let loaded = restore_project(project).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.layers()[1].image_data.decode().is_err());
        // The base still composites.
        let flat = composite::flatten(&loaded);
        assert_eq!(*flat.get_pixel(0, 0), Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn project_save_updates_name_and_dirty_flag() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let mut project = Project::from_image(1, RgbaImage::new(4, 4), &settings);
        assert_eq!(project.display_title(), "Untitled-1");
        assert!(project.save(None).is_err());

        project.mark_dirty();
        assert_eq!(project.display_title(), "Untitled-1*");
        let path = dir.path().join("mine.bsp");
        project.save(Some(&path)).unwrap();
        assert_eq!(project.display_title(), "mine.bsp");

        let reopened = Project::open(&path, &settings).unwrap();
        assert_eq!(reopened.stack.len(), 1);
        assert_eq!(reopened.name, "mine.bsp");
    }
}
