// ============================================================================
// LAYER OPERATIONS: tool-facing mutations that record undo history
// ============================================================================
//
// Tools call these instead of the raw `LayerStack` methods. Each function
// performs the mutation and, only if it applied, records exactly one history
// step before returning. A failed call leaves both the stack and the history
// untouched.
// ============================================================================

use image::{Rgba, RgbaImage};

use crate::blend::BlendMode;
use crate::error::{CoreError, CoreResult};
use crate::geometry::PixelRect;
use crate::history::{
    ActiveLayerCommand, LayerPixelsCommand, LayerProps, LayerPropsCommand, OperationKind, SelectionCommand,
    SnapshotCommand, TextEditCommand, TransformCommand, UndoHistory,
};
use crate::layer::{Layer, LayerId};
use crate::ops::paint::{self, Filter};
use crate::ops::text::TextContent;
use crate::selection::{SelectionMode, SelectionShape};
use crate::stack::LayerStack;
use crate::tiled::TiledImage;
use crate::transform::LayerTransform;

// ---- helpers ---------------------------------------------------------------

/// Run a structural operation under a whole-stack snapshot.
fn snapshot_op<T, F>(
    stack: &mut LayerStack,
    history: &mut UndoHistory,
    kind: OperationKind,
    description: &str,
    op: F,
) -> CoreResult<T>
where
    F: FnOnce(&mut LayerStack) -> CoreResult<T>,
{
    let mut cmd = SnapshotCommand::new(kind, description, stack);
    let out = op(stack)?;
    cmd.set_after(stack);
    history.record(Box::new(cmd));
    Ok(out)
}

/// Run a content edit on one image layer under a pixel snapshot.
fn pixel_op<F>(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, description: &str, op: F) -> CoreResult<()>
where
    F: FnOnce(&mut LayerStack) -> CoreResult<()>,
{
    stack.check_editable(id)?;
    let mut cmd = LayerPixelsCommand::new(description, stack, id).ok_or(CoreError::NotRaster(id))?;
    op(stack)?;
    cmd.set_after(stack);
    history.record(Box::new(cmd));
    Ok(())
}

/// Apply a bool-returning attribute setter and record it when it took effect.
fn props_op<F>(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, kind: OperationKind, set: F) -> bool
where
    F: FnOnce(&mut LayerStack) -> bool,
{
    let Some(before) = stack.layer(id).map(LayerProps::capture) else {
        return false;
    };
    if !set(stack) {
        return false;
    }
    let Some(after) = stack.layer(id).map(LayerProps::capture) else {
        return false;
    };
    if after != before {
        history.record(Box::new(LayerPropsCommand::new(kind, id, before, after)));
    }
    true
}

fn selection_op<F>(stack: &mut LayerStack, history: &mut UndoHistory, op: F)
where
    F: FnOnce(&mut LayerStack),
{
    let before = stack.selection().clone();
    op(stack);
    let after = stack.selection().clone();
    if after != before {
        history.record(Box::new(SelectionCommand::new(before, after)));
    }
}

/// Where a new layer goes relative to the active one: directly above it in
/// its parent, or on top of the root when the root is active.
fn slot_above_active(stack: &LayerStack) -> (LayerId, usize) {
    stack
        .position_of(stack.active_layer_id())
        .map_or((stack.root_id(), usize::MAX), |(parent, index)| (parent, index + 1))
}

// ---- structure -------------------------------------------------------------

/// Add a new transparent canvas-sized layer above the active layer and make it
/// active.
pub fn add_layer(stack: &mut LayerStack, history: &mut UndoHistory) -> CoreResult<LayerId> {
    let name = format!("Layer {}", stack.layer_count() + 1);
    let layer = Layer::new_image(name, TiledImage::new(stack.width(), stack.height()));
    insert_above_active(stack, history, layer)
}

/// Add an empty group above the active layer and make it active.
pub fn add_group(stack: &mut LayerStack, history: &mut UndoHistory) -> CoreResult<LayerId> {
    let name = format!("Group {}", stack.layer_count() + 1);
    insert_above_active(stack, history, Layer::new_group(name))
}

pub fn insert_above_active(stack: &mut LayerStack, history: &mut UndoHistory, layer: Layer) -> CoreResult<LayerId> {
    let (parent, index) = slot_above_active(stack);
    snapshot_op(stack, history, OperationKind::InsertLayer, "Add Layer", |s| {
        let id = s.insert_layer(parent, index, layer)?;
        s.set_active_layer(id)?;
        Ok(id)
    })
}

pub fn insert_layer(
    stack: &mut LayerStack,
    history: &mut UndoHistory,
    parent: LayerId,
    index: usize,
    layer: Layer,
) -> CoreResult<LayerId> {
    snapshot_op(stack, history, OperationKind::InsertLayer, "Add Layer", |s| s.insert_layer(parent, index, layer))
}

pub fn delete_layer(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<()> {
    snapshot_op(stack, history, OperationKind::DeleteLayer, "Delete Layer", |s| s.delete_layer(id).map(|_| ()))
}

pub fn move_layer(
    stack: &mut LayerStack,
    history: &mut UndoHistory,
    id: LayerId,
    new_parent: LayerId,
    new_index: usize,
) -> CoreResult<()> {
    snapshot_op(stack, history, OperationKind::MoveLayer, "Move Layer", |s| s.move_layer(id, new_parent, new_index))
}

/// Duplicate a layer; the copy becomes active.
pub fn duplicate_layer(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<LayerId> {
    snapshot_op(stack, history, OperationKind::DuplicateLayer, "Duplicate Layer", |s| {
        let copy = s.duplicate_layer(id)?;
        s.set_active_layer(copy)?;
        Ok(copy)
    })
}

pub fn merge_down(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<LayerId> {
    snapshot_op(stack, history, OperationKind::MergeDown, "Merge Down", |s| s.merge_down(id))
}

pub fn flatten_group(stack: &mut LayerStack, history: &mut UndoHistory, group: LayerId) -> CoreResult<LayerId> {
    snapshot_op(stack, history, OperationKind::Flatten, "Flatten Group", |s| s.flatten_group(group))
}

pub fn flatten_image(stack: &mut LayerStack, history: &mut UndoHistory) -> CoreResult<LayerId> {
    snapshot_op(stack, history, OperationKind::Flatten, "Flatten Image", LayerStack::flatten_image)
}

pub fn convert_to_image(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<()> {
    snapshot_op(stack, history, OperationKind::ConvertLayer, "Convert to Image", |s| s.convert_to_image(id))
}

pub fn bake_transform(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<()> {
    snapshot_op(stack, history, OperationKind::Transform, "Apply Transform", |s| s.bake_transform(id))
}

// ---- attributes ------------------------------------------------------------

pub fn set_opacity(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, opacity: f32) -> bool {
    props_op(stack, history, id, OperationKind::Opacity, |s| s.set_opacity(id, opacity))
}

pub fn set_blend_mode(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, mode: BlendMode) -> bool {
    props_op(stack, history, id, OperationKind::BlendMode, |s| s.set_blend_mode(id, mode))
}

pub fn set_visible(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, visible: bool) -> bool {
    props_op(stack, history, id, OperationKind::Visibility, |s| s.set_visible(id, visible))
}

pub fn set_locked(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, locked: bool) -> bool {
    props_op(stack, history, id, OperationKind::Lock, |s| s.set_locked(id, locked))
}

pub fn set_alpha_locked(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, alpha_locked: bool) -> bool {
    props_op(stack, history, id, OperationKind::Lock, |s| s.set_alpha_locked(id, alpha_locked))
}

pub fn rename_layer(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, name: &str) -> bool {
    props_op(stack, history, id, OperationKind::Rename, |s| s.rename_layer(id, name))
}

pub fn set_isolate(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, isolate: bool) -> bool {
    props_op(stack, history, id, OperationKind::BlendMode, |s| s.set_isolate(id, isolate))
}

pub fn set_transform(
    stack: &mut LayerStack,
    history: &mut UndoHistory,
    id: LayerId,
    transform: LayerTransform,
) -> CoreResult<()> {
    let before = placement(stack, id)?;
    stack.set_transform(id, transform)?;
    record_placement(stack, history, id, before)
}

pub fn set_position(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, x: i32, y: i32) -> CoreResult<()> {
    let before = placement(stack, id)?;
    stack.set_position(id, x, y)?;
    record_placement(stack, history, id, before)
}

/// Unchanged placements leave history (and its redo branch) alone.
fn record_placement(
    stack: &LayerStack,
    history: &mut UndoHistory,
    id: LayerId,
    before: ((i32, i32), LayerTransform),
) -> CoreResult<()> {
    let after = placement(stack, id)?;
    if after != before {
        history.record(Box::new(TransformCommand::new(id, before, after)));
    }
    Ok(())
}

fn placement(stack: &LayerStack, id: LayerId) -> CoreResult<((i32, i32), LayerTransform)> {
    let layer = stack.layer(id).ok_or(CoreError::LayerNotFound(id))?;
    Ok((layer.position(), *layer.transform()))
}

pub fn set_text(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, content: TextContent) -> CoreResult<()> {
    let before = stack
        .layer(id)
        .ok_or(CoreError::LayerNotFound(id))?
        .text()
        .ok_or(CoreError::NotText(id))?
        .content()
        .clone();
    stack.set_text(id, content.clone())?;
    history.record(Box::new(TextEditCommand::new(id, before, content)));
    Ok(())
}

pub fn set_active_layer(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<()> {
    let before = stack.active_layer_id();
    stack.set_active_layer(id)?;
    if before != id {
        history.record(Box::new(ActiveLayerCommand::new(before, id)));
    }
    Ok(())
}

// ---- content ---------------------------------------------------------------

pub fn fill_rect(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, rect: PixelRect, color: Rgba<u8>) -> CoreResult<()> {
    pixel_op(stack, history, id, "Fill", |s| paint::fill_rect(s, id, rect, color))
}

pub fn erase_rect(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, rect: PixelRect) -> CoreResult<()> {
    pixel_op(stack, history, id, "Erase", |s| paint::erase_rect(s, id, rect))
}

pub fn fill_selection(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, color: Rgba<u8>) -> CoreResult<()> {
    pixel_op(stack, history, id, "Fill Selection", |s| paint::fill_selection(s, id, color))
}

pub fn delete_selection(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId) -> CoreResult<()> {
    pixel_op(stack, history, id, "Delete Selection", |s| paint::delete_selection(s, id))
}

pub fn apply_filter(stack: &mut LayerStack, history: &mut UndoHistory, id: LayerId, filter: Filter) -> CoreResult<()> {
    pixel_op(stack, history, id, "Filter", |s| paint::apply_filter(s, id, filter))
}

pub fn paint_pixels(
    stack: &mut LayerStack,
    history: &mut UndoHistory,
    id: LayerId,
    origin: (i32, i32),
    src: &RgbaImage,
    mode: BlendMode,
    opacity: f32,
) -> CoreResult<()> {
    pixel_op(stack, history, id, "Paint", |s| paint::paint_pixels(s, id, origin, src, mode, opacity))
}

/// Commit the pending tool preview as one paint step. `Ok(false)` when
/// nothing was pending.
pub fn commit_edit(stack: &mut LayerStack, history: &mut UndoHistory) -> CoreResult<bool> {
    let Some(id) = stack.pending_edit().map(|p| p.layer()) else {
        return Ok(false);
    };
    let mut cmd = LayerPixelsCommand::new("Paint", stack, id).ok_or(CoreError::NotRaster(id))?;
    if !stack.commit_edit()? {
        return Ok(false);
    }
    cmd.set_after(stack);
    history.record(Box::new(cmd));
    Ok(true)
}

// ---- selection -------------------------------------------------------------

pub fn select_all(stack: &mut LayerStack, history: &mut UndoHistory) {
    selection_op(stack, history, LayerStack::select_all);
}

pub fn deselect_all(stack: &mut LayerStack, history: &mut UndoHistory) {
    selection_op(stack, history, LayerStack::deselect_all);
}

pub fn invert_selection(stack: &mut LayerStack, history: &mut UndoHistory) {
    selection_op(stack, history, LayerStack::invert_selection);
}

pub fn grow_selection(stack: &mut LayerStack, history: &mut UndoHistory, n: u32) {
    selection_op(stack, history, |s| s.grow_selection(n));
}

pub fn shrink_selection(stack: &mut LayerStack, history: &mut UndoHistory, n: u32) {
    selection_op(stack, history, |s| s.shrink_selection(n));
}

pub fn combine_selection(stack: &mut LayerStack, history: &mut UndoHistory, shape: &SelectionShape, mode: SelectionMode) {
    selection_op(stack, history, |s| s.combine_selection(shape, mode));
}

pub fn translate_selection(stack: &mut LayerStack, history: &mut UndoHistory, dx: i32, dy: i32) {
    selection_op(stack, history, |s| s.translate_selection(dx, dy));
}

// ---- externally generated pixels --------------------------------------------

/// How an externally produced image enters the document.
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationTarget {
    /// New image layer above the active layer.
    NewLayer { name: String },
    /// Blend onto the active image layer (Normal, full opacity), subject to
    /// its lock, visibility and the selection.
    MergeIntoActive,
}

/// Bring a finished generation result into the stack with `origin` as its
/// canvas top-left. Returns the layer that received the pixels.
pub fn insert_generation_result(
    stack: &mut LayerStack,
    history: &mut UndoHistory,
    result: &RgbaImage,
    origin: (i32, i32),
    target: GenerationTarget,
) -> CoreResult<LayerId> {
    if result.width() == 0 || result.height() == 0 {
        return Err(CoreError::bounds("generation result is empty"));
    }
    match target {
        GenerationTarget::NewLayer { name } => {
            let layer = Layer::new_image(name, TiledImage::from_rgba_image(result)).with_position(origin.0, origin.1);
            let id = insert_above_active(stack, history, layer)?;
            tracing::info!(layer = %id, w = result.width(), h = result.height(), "generation result inserted");
            Ok(id)
        }
        GenerationTarget::MergeIntoActive => {
            let id = stack.active_layer_id();
            paint_pixels(stack, history, id, origin, result, BlendMode::Normal, 1.0)?;
            tracing::info!(layer = %id, "generation result merged");
            Ok(id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor;
    use std::time::Duration;

    fn setup() -> (LayerStack, UndoHistory) {
        let stack = LayerStack::with_background(8, 8, Rgba([255, 255, 255, 255])).unwrap();
        (stack, UndoHistory::new(50, Duration::ZERO))
    }

    #[test]
    fn add_layer_goes_above_active_and_undoes() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        let before = s.describe_tree();
        let id = add_layer(&mut s, &mut h).unwrap();
        assert_eq!(s.active_layer_id(), id);
        assert_eq!(s.position_of(id), Some((s.root_id(), 1)));
        assert_eq!(s.layer(id).unwrap().name, "Layer 2");
        h.undo(&mut s);
        assert_eq!(s.describe_tree(), before);
        assert_eq!(s.active_layer_id(), bg);
    }

    #[test]
    fn unchanged_placement_keeps_redo() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        set_position(&mut s, &mut h, bg, 3, 2).unwrap();
        h.undo(&mut s);
        assert!(h.can_redo());

        set_position(&mut s, &mut h, bg, 0, 0).unwrap();
        set_transform(&mut s, &mut h, bg, LayerTransform::identity()).unwrap();
        assert!(h.can_redo());
        assert!(!h.can_undo());
        assert!(h.redo(&mut s).is_some());
        assert_eq!(s.layer(bg).unwrap().position(), (3, 2));
    }

    #[test]
    fn failed_operation_records_nothing() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        assert!(merge_down(&mut s, &mut h, bg).is_err());
        s.set_locked(bg, true);
        assert!(fill_rect(&mut s, &mut h, bg, PixelRect::new(0, 0, 1, 1), Rgba([0, 0, 0, 255])).is_err());
        assert!(!set_opacity(&mut s, &mut h, bg, 0.5));
        assert_eq!(h.undo_count(), 0);
    }

    #[test]
    fn attribute_change_round_trips() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        assert!(set_blend_mode(&mut s, &mut h, bg, BlendMode::Multiply));
        assert!(rename_layer(&mut s, &mut h, bg, "Paper"));
        h.undo(&mut s);
        assert_eq!(s.layer(bg).unwrap().name, "Background");
        h.undo(&mut s);
        assert_eq!(s.layer(bg).unwrap().blend_mode(), BlendMode::Normal);
        h.redo(&mut s);
        assert_eq!(s.layer(bg).unwrap().blend_mode(), BlendMode::Multiply);
    }

    #[test]
    fn lock_undo_restores_unlocked_state() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        assert!(set_locked(&mut s, &mut h, bg, true));
        h.undo(&mut s);
        assert!(!s.layer(bg).unwrap().is_locked());
    }

    #[test]
    fn fill_is_one_undo_step() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        let before = compositor::composite(&s);
        fill_rect(&mut s, &mut h, bg, PixelRect::new(2, 2, 3, 3), Rgba([0, 0, 0, 255])).unwrap();
        assert_ne!(compositor::composite(&s), before);
        h.undo(&mut s);
        assert_eq!(compositor::composite(&s), before);
    }

    #[test]
    fn commit_edit_records_paint_step() {
        let (mut s, mut h) = setup();
        s.begin_edit().unwrap();
        s.pending_edit_mut().unwrap().put_pixel(0, 0, Rgba([1, 2, 3, 255]));
        assert!(commit_edit(&mut s, &mut h).unwrap());
        assert_eq!(h.undo_description().as_deref(), Some("Paint"));
        assert!(!commit_edit(&mut s, &mut h).unwrap());
        h.undo(&mut s);
        let bg = s.active_layer_id();
        assert_eq!(*s.layer(bg).unwrap().pixels().unwrap().get_pixel(0, 0), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn selection_changes_are_recorded_only_when_they_change() {
        let (mut s, mut h) = setup();
        deselect_all(&mut s, &mut h);
        invert_selection(&mut s, &mut h);
        assert_eq!(h.undo_count(), 0);
        combine_selection(&mut s, &mut h, &SelectionShape::Rectangle(PixelRect::new(1, 1, 2, 2)), SelectionMode::Replace);
        grow_selection(&mut s, &mut h, 1);
        assert_eq!(h.undo_count(), 2);
        h.undo(&mut s);
        assert_eq!(s.selection().bounds(), Some(PixelRect::new(1, 1, 2, 2)));
    }

    #[test]
    fn active_layer_switch_is_undoable() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        let root = s.root_id();
        set_active_layer(&mut s, &mut h, root).unwrap();
        h.undo(&mut s);
        assert_eq!(s.active_layer_id(), bg);
    }

    #[test]
    fn generation_result_as_new_layer_or_merge() {
        let (mut s, mut h) = setup();
        let bg = s.active_layer_id();
        let img = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 255, 255]));
        let id = insert_generation_result(&mut s, &mut h, &img, (3, 3), GenerationTarget::NewLayer { name: "Gen".into() }).unwrap();
        assert_eq!(s.layer(id).unwrap().position(), (3, 3));
        assert_eq!(*compositor::composite(&s).get_pixel(4, 4), Rgba([0, 0, 255, 255]));

        set_active_layer(&mut s, &mut h, bg).unwrap();
        insert_generation_result(&mut s, &mut h, &img, (0, 0), GenerationTarget::MergeIntoActive).unwrap();
        assert_eq!(*s.layer(bg).unwrap().pixels().unwrap().get_pixel(1, 1), Rgba([0, 0, 255, 255]));

        s.set_locked(bg, true);
        assert_eq!(
            insert_generation_result(&mut s, &mut h, &img, (0, 0), GenerationTarget::MergeIntoActive).err(),
            Some(CoreError::LayerLocked(bg))
        );
    }

    #[test]
    fn text_edit_round_trips() {
        let (mut s, mut h) = setup();
        let root = s.root_id();
        let t = insert_layer(&mut s, &mut h, root, 1, Layer::new_text("t", TextContent::default())).unwrap();
        let content = TextContent::new("hello", Default::default());
        set_text(&mut s, &mut h, t, content.clone()).unwrap();
        assert_eq!(s.layer(t).unwrap().text().unwrap().content(), &content);
        h.undo(&mut s);
        assert_eq!(s.layer(t).unwrap().text().unwrap().content(), &TextContent::default());
        assert_eq!(set_text(&mut s, &mut h, root, content).err(), Some(CoreError::NotText(root)));
    }
}
