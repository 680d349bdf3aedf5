// ============================================================================
// LAYER OPERATIONS: add / delete / duplicate / reorder / properties
// ============================================================================
//
// Every mutation of a `LayerStack` goes through here and ends in
// `stack.commit()`, which renumbers `order`, bumps the version and tells the
// history recorder.  Each returns whether anything changed.

use uuid::Uuid;

use crate::canvas::{Layer, LayerId, LayerKind, LayerStack, Raster};
use crate::ops::composite::{apply_feathering, sharp_cutout};

/// Lowest index a non-base layer may occupy.
fn floor_index(stack: &LayerStack) -> usize {
    usize::from(stack.base_layer().is_some())
}

/// Push a layer on top of the stack and make it active.
pub fn add_layer(stack: &mut LayerStack, mut layer: Layer) -> LayerId {
    // A second base layer would break the z-order invariant.
    if layer.is_base() && stack.base_layer().is_some() {
        layer.kind = LayerKind::Edit;
    }
    let id = layer.id;
    if layer.is_base() {
        stack.layers_mut().insert(0, layer);
    } else {
        stack.layers_mut().push(layer);
    }
    stack.active_layer_id = Some(id);
    stack.commit();
    id
}

/// Remove a layer.  The base layer cannot be deleted.  If the deleted layer
/// was active, the one below it becomes active.
pub fn delete_layer(stack: &mut LayerStack, id: LayerId) -> bool {
    let Some(idx) = stack.index_of(id) else {
        return false;
    };
    if stack.layers()[idx].is_base() {
        return false;
    }
    stack.layers_mut().remove(idx);
    if stack.active_layer_id == Some(id) {
        let below = idx.saturating_sub(1).min(stack.len().saturating_sub(1));
        stack.active_layer_id = stack.layers().get(below).map(|l| l.id);
    }
    stack.commit();
    true
}

/// Copy a layer directly above itself as "<name> copy" and make the copy
/// active.  Copies of the base layer become ordinary edit layers.
pub fn duplicate_layer(stack: &mut LayerStack, id: LayerId) -> Option<LayerId> {
    let idx = stack.index_of(id)?;
    let mut dup = stack.layers()[idx].clone();
    dup.id = Uuid::new_v4();
    dup.name = format!("{} copy", dup.name);
    if dup.is_base() {
        dup.kind = LayerKind::Edit;
    }
    let new_id = dup.id;
    stack.layers_mut().insert(idx + 1, dup);
    stack.active_layer_id = Some(new_id);
    stack.commit();
    Some(new_id)
}

pub fn move_layer_up(stack: &mut LayerStack, id: LayerId) -> bool {
    match stack.index_of(id) {
        Some(idx) => move_layer_to(stack, id, idx + 1),
        None => false,
    }
}

pub fn move_layer_down(stack: &mut LayerStack, id: LayerId) -> bool {
    match stack.index_of(id) {
        Some(idx) if idx > 0 => move_layer_to(stack, id, idx - 1),
        _ => false,
    }
}

/// Move a layer to `index` in paint order.  The base layer stays at the
/// bottom and nothing can be moved beneath it.
pub fn move_layer_to(stack: &mut LayerStack, id: LayerId, index: usize) -> bool {
    let Some(from) = stack.index_of(id) else {
        return false;
    };
    if stack.layers()[from].is_base() || stack.len() < 2 {
        return false;
    }
    let to = index.clamp(floor_index(stack), stack.len() - 1);
    if to == from {
        return false;
    }
    let layer = stack.layers_mut().remove(from);
    stack.layers_mut().insert(to, layer);
    stack.commit();
    true
}

pub fn rename_layer(stack: &mut LayerStack, id: LayerId, name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() {
        return false;
    }
    let Some(idx) = stack.index_of(id) else {
        return false;
    };
    if stack.layers()[idx].name == name {
        return false;
    }
    stack.layers_mut()[idx].name = name.to_string();
    stack.commit();
    true
}

/// Show or hide a layer.  The base layer is always visible.
pub fn set_visibility(stack: &mut LayerStack, id: LayerId, visible: bool) -> bool {
    let Some(idx) = stack.index_of(id) else {
        return false;
    };
    let layer = &stack.layers()[idx];
    if layer.visible == visible || (layer.is_base() && !visible) {
        return false;
    }
    stack.layers_mut()[idx].visible = visible;
    stack.commit();
    true
}

pub fn toggle_visibility(stack: &mut LayerStack, id: LayerId) -> bool {
    match stack.get(id) {
        Some(layer) => {
            let visible = !layer.visible;
            set_visibility(stack, id, visible)
        }
        None => false,
    }
}

/// Opacity in percent, clamped to `0..=100`.
pub fn set_opacity(stack: &mut LayerStack, id: LayerId, opacity: f32) -> bool {
    if opacity.is_nan() {
        return false;
    }
    let opacity = opacity.clamp(0.0, 100.0);
    let Some(idx) = stack.index_of(id) else {
        return false;
    };
    if stack.layers()[idx].opacity == opacity {
        return false;
    }
    stack.layers_mut()[idx].opacity = opacity;
    stack.commit();
    true
}

/// Change a layer's feather radius and rebuild its displayed pixels from
/// the clean original.
///
/// Falls back to the hard lasso cutout, then to the unmasked original, when
/// feathering does not apply or fails.  The base layer never feathers.
pub fn set_feather_radius(stack: &mut LayerStack, id: LayerId, radius: f32) -> bool {
    let Some(idx) = stack.index_of(id) else {
        return false;
    };
    if stack.layers()[idx].is_base() {
        return false;
    }
    let radius = if radius.is_finite() { radius.max(0.0) } else { 0.0 };

    let mut layer = stack.layers()[idx].clone();
    layer.feather_radius = radius;
    layer.image_data = remask(&layer);
    stack.layers_mut()[idx] = layer;
    stack.commit();
    true
}

/// Displayed pixels for a layer given its current polygon and feather.
pub fn remask(layer: &Layer) -> Raster {
    if let Some(img) = apply_feathering(layer) {
        return Raster::new(img);
    }
    if layer.feather_radius > 0.0 {
        crate::log_warn!(
            "Feathering not applied to '{}'; falling back to unfeathered pixels",
            layer.name
        );
    }
    match sharp_cutout(layer) {
        Some(img) => Raster::new(img),
        None => layer.source_raster().clone(),
    }
}

pub fn set_active_layer(stack: &mut LayerStack, id: LayerId) -> bool {
    if stack.get(id).is_none() || stack.active_layer_id == Some(id) {
        return false;
    }
    stack.active_layer_id = Some(id);
    true
}

/// Drop every layer, base included.  In-flight composites see the stack as
/// stale.
pub fn clear_project(stack: &mut LayerStack) {
    stack.layers_mut().clear();
    stack.active_layer_id = None;
    let (w, h) = (stack.width, stack.height);
    stack.reset_canvas(w, h);
}
