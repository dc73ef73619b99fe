use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use crate::blend::BlendMode;
use crate::layer::{Layer, LayerContent, LayerId};
use crate::ops::text::TextContent;
use crate::selection::Selection;
use crate::settings::CoreSettings;
use crate::stack::LayerStack;
use crate::tiled::TiledImage;
use crate::transform::LayerTransform;

// ============================================================================
// COMMAND TRAIT
// ============================================================================

/// What a recorded step did. Consecutive records of the same kind inside the
/// merge interval coalesce into one undo step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperationKind {
    InsertLayer,
    DeleteLayer,
    MoveLayer,
    DuplicateLayer,
    MergeDown,
    Flatten,
    ConvertLayer,
    Opacity,
    BlendMode,
    Visibility,
    Lock,
    Rename,
    Transform,
    Paint,
    Selection,
    ActiveLayer,
    Text,
}

impl OperationKind {
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::InsertLayer => "Add Layer",
            OperationKind::DeleteLayer => "Delete Layer",
            OperationKind::MoveLayer => "Move Layer",
            OperationKind::DuplicateLayer => "Duplicate Layer",
            OperationKind::MergeDown => "Merge Down",
            OperationKind::Flatten => "Flatten",
            OperationKind::ConvertLayer => "Convert Layer",
            OperationKind::Opacity => "Layer Opacity",
            OperationKind::BlendMode => "Blend Mode",
            OperationKind::Visibility => "Layer Visibility",
            OperationKind::Lock => "Layer Lock",
            OperationKind::Rename => "Rename Layer",
            OperationKind::Transform => "Transform",
            OperationKind::Paint => "Paint",
            OperationKind::Selection => "Selection",
            OperationKind::ActiveLayer => "Select Layer",
            OperationKind::Text => "Edit Text",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Trait for undoable/redoable commands.
pub trait Command: Send + Sync {
    fn undo(&self, stack: &mut LayerStack);
    fn redo(&self, stack: &mut LayerStack);
    fn description(&self) -> String;
    fn memory_size(&self) -> usize;
    fn kind(&self) -> OperationKind;

    /// Fold a newer command's after-state into this one. Returns `false` when
    /// the two cannot be combined (different target, different type).
    fn absorb(&mut self, _newer: &dyn Command) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any;
}

// ============================================================================
// SNAPSHOT COMMAND: whole-tree undo for structural operations
// ============================================================================

/// Tree, active layer and selection at one point in time. Pixel chunks are
/// shared with the live stack, so capturing is cheap.
#[derive(Clone, Debug)]
pub struct StackState {
    root: Layer,
    active: LayerId,
    selection: Selection,
}

impl StackState {
    pub fn capture(stack: &LayerStack) -> Self {
        Self {
            root: stack.root().clone(),
            active: stack.active_layer_id(),
            selection: stack.selection().clone(),
        }
    }

    pub fn restore_into(&self, stack: &mut LayerStack) {
        stack.restore_tree(self.root.clone(), self.active);
        stack.set_selection(self.selection.clone());
    }

    fn memory_bytes(&self) -> usize {
        self.root.memory_bytes() + self.selection.memory_bytes()
    }
}

/// Before/after capture of the whole stack.
pub struct SnapshotCommand {
    description: String,
    kind: OperationKind,
    before: StackState,
    after: Option<StackState>,
}

impl SnapshotCommand {
    /// Create BEFORE performing the operation; call `set_after()` once done.
    pub fn new(kind: OperationKind, description: impl Into<String>, stack: &LayerStack) -> Self {
        Self {
            description: description.into(),
            kind,
            before: StackState::capture(stack),
            after: None,
        }
    }

    pub fn set_after(&mut self, stack: &LayerStack) {
        self.after = Some(StackState::capture(stack));
    }
}

impl Command for SnapshotCommand {
    fn undo(&self, stack: &mut LayerStack) {
        self.before.restore_into(stack);
    }

    fn redo(&self, stack: &mut LayerStack) {
        if let Some(after) = &self.after {
            after.restore_into(stack);
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_bytes() + self.after.as_ref().map_or(0, StackState::memory_bytes)
    }

    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        let Some(newer) = newer.as_any().downcast_ref::<SnapshotCommand>() else {
            return false;
        };
        self.after = newer.after.clone();
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// LAYER PROPERTY COMMAND: opacity, blend, flags, name
// ============================================================================

/// Non-pixel attributes of one layer.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerProps {
    pub name: String,
    pub opacity: f32,
    pub blend_mode: BlendMode,
    pub visible: bool,
    pub locked: bool,
    pub alpha_locked: bool,
    pub isolate: Option<bool>,
}

impl LayerProps {
    pub fn capture(layer: &Layer) -> Self {
        Self {
            name: layer.name.clone(),
            opacity: layer.opacity(),
            blend_mode: layer.blend_mode(),
            visible: layer.is_visible(),
            locked: layer.is_locked(),
            alpha_locked: layer.is_alpha_locked(),
            isolate: layer.isolate(),
        }
    }

    /// Write back verbatim. Lock state is not consulted: undo must always
    /// restore.
    fn apply(&self, stack: &mut LayerStack, id: LayerId) {
        let Some(layer) = stack.layer_mut(id) else {
            tracing::warn!(layer = %id, "property undo target missing");
            return;
        };
        layer.name.clone_from(&self.name);
        layer.opacity = self.opacity;
        layer.blend_mode = self.blend_mode;
        layer.visible = self.visible;
        layer.locked = self.locked;
        layer.alpha_locked = self.alpha_locked;
        if let (LayerContent::Group(g), Some(isolate)) = (&mut layer.content, self.isolate) {
            g.isolate = isolate;
        }
        stack.mark_dirty(None);
    }
}

pub struct LayerPropsCommand {
    kind: OperationKind,
    layer: LayerId,
    before: LayerProps,
    after: LayerProps,
}

impl LayerPropsCommand {
    pub fn new(kind: OperationKind, layer: LayerId, before: LayerProps, after: LayerProps) -> Self {
        Self { kind, layer, before, after }
    }
}

impl Command for LayerPropsCommand {
    fn undo(&self, stack: &mut LayerStack) {
        self.before.apply(stack, self.layer);
    }

    fn redo(&self, stack: &mut LayerStack) {
        self.after.apply(stack, self.layer);
    }

    fn description(&self) -> String {
        format!("{} ({})", self.kind.label(), self.after.name)
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.before.name.len() + self.after.name.len()
    }

    fn kind(&self) -> OperationKind {
        self.kind
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        match newer.as_any().downcast_ref::<LayerPropsCommand>() {
            Some(n) if n.layer == self.layer => {
                self.after = n.after.clone();
                true
            }
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// TRANSFORM COMMAND
// ============================================================================

pub struct TransformCommand {
    layer: LayerId,
    before: ((i32, i32), LayerTransform),
    after: ((i32, i32), LayerTransform),
}

impl TransformCommand {
    pub fn new(layer: LayerId, before: ((i32, i32), LayerTransform), after: ((i32, i32), LayerTransform)) -> Self {
        Self { layer, before, after }
    }

    fn apply(stack: &mut LayerStack, id: LayerId, (position, transform): ((i32, i32), LayerTransform)) {
        if let Some(layer) = stack.layer_mut(id) {
            layer.position = position;
            layer.transform = transform;
        }
        stack.mark_dirty(None);
    }
}

impl Command for TransformCommand {
    fn undo(&self, stack: &mut LayerStack) {
        Self::apply(stack, self.layer, self.before);
    }

    fn redo(&self, stack: &mut LayerStack) {
        Self::apply(stack, self.layer, self.after);
    }

    fn description(&self) -> String {
        OperationKind::Transform.label().to_string()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Transform
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        match newer.as_any().downcast_ref::<TransformCommand>() {
            Some(n) if n.layer == self.layer => {
                self.after = n.after;
                true
            }
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// LAYER PIXELS COMMAND: single-layer content undo for paint operations
// ============================================================================

/// Captures one image layer's pixels before and after an edit. Chunks the
/// edit never touched stay shared between the two copies.
pub struct LayerPixelsCommand {
    description: String,
    layer: LayerId,
    before: TiledImage,
    after: Option<TiledImage>,
}

impl LayerPixelsCommand {
    /// `None` when `layer` is not an image layer.
    pub fn new(description: impl Into<String>, stack: &LayerStack, layer: LayerId) -> Option<Self> {
        let before = stack.layer(layer)?.pixels()?.clone();
        Some(Self {
            description: description.into(),
            layer,
            before,
            after: None,
        })
    }

    pub fn set_after(&mut self, stack: &LayerStack) {
        self.after = stack.layer(self.layer).and_then(Layer::pixels).cloned();
    }
}

impl Command for LayerPixelsCommand {
    fn undo(&self, stack: &mut LayerStack) {
        stack.replace_layer_content(self.layer, LayerContent::Image(self.before.clone()));
    }

    fn redo(&self, stack: &mut LayerStack) {
        if let Some(after) = &self.after {
            stack.replace_layer_content(self.layer, LayerContent::Image(after.clone()));
        }
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_bytes() + self.after.as_ref().map_or(0, TiledImage::memory_bytes)
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Paint
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        match newer.as_any().downcast_ref::<LayerPixelsCommand>() {
            Some(n) if n.layer == self.layer => {
                self.after = n.after.clone();
                true
            }
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// SELECTION / ACTIVE LAYER / TEXT COMMANDS
// ============================================================================

pub struct SelectionCommand {
    before: Selection,
    after: Selection,
}

impl SelectionCommand {
    pub fn new(before: Selection, after: Selection) -> Self {
        Self { before, after }
    }
}

impl Command for SelectionCommand {
    fn undo(&self, stack: &mut LayerStack) {
        stack.set_selection(self.before.clone());
    }

    fn redo(&self, stack: &mut LayerStack) {
        stack.set_selection(self.after.clone());
    }

    fn description(&self) -> String {
        OperationKind::Selection.label().to_string()
    }

    fn memory_size(&self) -> usize {
        self.before.memory_bytes() + self.after.memory_bytes()
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Selection
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        let Some(n) = newer.as_any().downcast_ref::<SelectionCommand>() else {
            return false;
        };
        self.after = n.after.clone();
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Switching the active layer as its own recorded step.
pub struct ActiveLayerCommand {
    before: LayerId,
    after: LayerId,
}

impl ActiveLayerCommand {
    pub fn new(before: LayerId, after: LayerId) -> Self {
        Self { before, after }
    }

    fn apply(stack: &mut LayerStack, id: LayerId) {
        if let Err(e) = stack.set_active_layer(id) {
            tracing::warn!("active layer undo skipped: {e}");
        }
    }
}

impl Command for ActiveLayerCommand {
    fn undo(&self, stack: &mut LayerStack) {
        Self::apply(stack, self.before);
    }

    fn redo(&self, stack: &mut LayerStack) {
        Self::apply(stack, self.after);
    }

    fn description(&self) -> String {
        OperationKind::ActiveLayer.label().to_string()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>()
    }

    fn kind(&self) -> OperationKind {
        OperationKind::ActiveLayer
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        let Some(n) = newer.as_any().downcast_ref::<ActiveLayerCommand>() else {
            return false;
        };
        self.after = n.after;
        true
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct TextEditCommand {
    layer: LayerId,
    before: TextContent,
    after: TextContent,
}

impl TextEditCommand {
    pub fn new(layer: LayerId, before: TextContent, after: TextContent) -> Self {
        Self { layer, before, after }
    }

    fn apply(stack: &mut LayerStack, id: LayerId, content: &TextContent) {
        if let Some(text) = stack.layer_mut(id).and_then(Layer::text_mut) {
            text.set_content(content.clone());
        }
        stack.mark_dirty(None);
    }
}

impl Command for TextEditCommand {
    fn undo(&self, stack: &mut LayerStack) {
        Self::apply(stack, self.layer, &self.before);
    }

    fn redo(&self, stack: &mut LayerStack) {
        Self::apply(stack, self.layer, &self.after);
    }

    fn description(&self) -> String {
        OperationKind::Text.label().to_string()
    }

    fn memory_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.before.text.len() + self.after.text.len()
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Text
    }

    fn absorb(&mut self, newer: &dyn Command) -> bool {
        match newer.as_any().downcast_ref::<TextEditCommand>() {
            Some(n) if n.layer == self.layer => {
                self.after = n.after.clone();
                true
            }
            _ => false,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// UNDO HISTORY: undo/redo stacks with coalescing and memory limits
// ============================================================================

struct Entry {
    command: Box<dyn Command>,
    committed_at: Instant,
}

/// An operation between `begin` and `commit`.
struct PendingRecord {
    command: SnapshotCommand,
}

/// Linear undo/redo log.
///
/// `record` appends a step, or folds it into the previous one when both have
/// the same [`OperationKind`] and arrive within the merge interval. Recording
/// clears the redo stack. After an undo or redo the next record always starts
/// a fresh step.
pub struct UndoHistory {
    undo_stack: VecDeque<Entry>,
    redo_stack: Vec<Box<dyn Command>>,
    max_steps: usize,
    merge_interval: Duration,
    /// Optional memory cap in bytes.
    max_memory_bytes: Option<usize>,
    total_memory: usize,
    barrier: bool,
    recording: Option<PendingRecord>,
}

impl Default for UndoHistory {
    fn default() -> Self {
        Self::from_settings(&CoreSettings::default())
    }
}

impl fmt::Debug for UndoHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UndoHistory")
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .field("max_steps", &self.max_steps)
            .field("memory", &self.total_memory)
            .finish()
    }
}

impl UndoHistory {
    /// At least one step is always kept.
    pub fn new(max_steps: usize, merge_interval: Duration) -> Self {
        Self {
            undo_stack: VecDeque::new(),
            redo_stack: Vec::new(),
            max_steps: max_steps.max(1),
            merge_interval,
            max_memory_bytes: None,
            total_memory: 0,
            barrier: false,
            recording: None,
        }
    }

    pub fn from_settings(settings: &CoreSettings) -> Self {
        let mut history = Self::new(settings.max_undo_steps, Duration::from_millis(settings.merge_interval_ms));
        history.set_memory_limit(settings.max_history_memory_mb.checked_mul(1024 * 1024).filter(|b| *b > 0));
        history
    }

    pub fn set_memory_limit(&mut self, bytes: Option<usize>) {
        self.max_memory_bytes = bytes;
        self.prune();
    }

    pub fn set_max_steps(&mut self, max_steps: usize) {
        self.max_steps = max_steps.max(1);
        self.prune();
    }

    pub fn merge_interval(&self) -> Duration {
        self.merge_interval
    }

    pub fn record(&mut self, command: Box<dyn Command>) {
        self.record_at(command, Instant::now());
    }

    /// [`record`](Self::record) with an explicit commit time.
    pub fn record_at(&mut self, command: Box<dyn Command>, now: Instant) {
        for cmd in self.redo_stack.drain(..) {
            self.total_memory = self.total_memory.saturating_sub(cmd.memory_size());
        }

        let barrier = std::mem::take(&mut self.barrier);
        if !barrier
            && let Some(last) = self.undo_stack.back_mut()
            && last.command.kind() == command.kind()
            && now.saturating_duration_since(last.committed_at) < self.merge_interval
        {
            let before = last.command.memory_size();
            if last.command.absorb(command.as_ref()) {
                last.committed_at = now;
                let after = last.command.memory_size();
                self.total_memory = self.total_memory.saturating_sub(before) + after;
                tracing::debug!(kind = %command.kind(), "coalesced history step");
                self.prune();
                return;
            }
        }

        self.total_memory += command.memory_size();
        tracing::debug!(kind = %command.kind(), desc = %command.description(), "recorded history step");
        self.undo_stack.push_back(Entry {
            command,
            committed_at: now,
        });
        self.prune();
    }

    /// Prevent the next record from coalescing with the current top step.
    pub fn barrier(&mut self) {
        self.barrier = true;
    }

    /// Revert the newest step. `None` (and no change) when there is nothing
    /// to undo.
    pub fn undo(&mut self, stack: &mut LayerStack) -> Option<String> {
        let entry = self.undo_stack.pop_back()?;
        let description = entry.command.description();
        entry.command.undo(stack);
        self.redo_stack.push(entry.command);
        self.barrier = true;
        tracing::debug!(%description, "undo");
        Some(description)
    }

    pub fn redo(&mut self, stack: &mut LayerStack) -> Option<String> {
        let command = self.redo_stack.pop()?;
        let description = command.description();
        command.redo(stack);
        self.undo_stack.push_back(Entry {
            command,
            committed_at: Instant::now(),
        });
        self.barrier = true;
        tracing::debug!(%description, "redo");
        Some(description)
    }

    /// Undo `steps` times, stopping early if history runs out.
    pub fn undo_to(&mut self, steps: usize, stack: &mut LayerStack) -> usize {
        (0..steps).take_while(|_| self.undo(stack).is_some()).count()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo_count(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_count(&self) -> usize {
        self.redo_stack.len()
    }

    pub fn undo_description(&self) -> Option<String> {
        self.undo_stack.back().map(|e| e.command.description())
    }

    pub fn redo_description(&self) -> Option<String> {
        self.redo_stack.last().map(|c| c.description())
    }

    /// Undo descriptions, most recent first.
    pub fn undo_history(&self) -> Vec<String> {
        self.undo_stack.iter().rev().map(|e| e.command.description()).collect()
    }

    pub fn memory_usage(&self) -> usize {
        self.total_memory
    }

    fn prune(&mut self) {
        while self.undo_stack.len() > self.max_steps {
            if let Some(removed) = self.undo_stack.pop_front() {
                self.total_memory = self.total_memory.saturating_sub(removed.command.memory_size());
            }
        }
        if let Some(max_bytes) = self.max_memory_bytes {
            while self.total_memory > max_bytes && self.undo_stack.len() > 1 {
                if let Some(removed) = self.undo_stack.pop_front() {
                    self.total_memory = self.total_memory.saturating_sub(removed.command.memory_size());
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.undo_stack.clear();
        self.redo_stack.clear();
        self.total_memory = 0;
        self.recording = None;
        self.barrier = false;
    }

    // ---- idle -> recording(op) -> idle --------------------------------------

    /// Capture the stack before an operation. A begin while already recording
    /// drops the earlier capture.
    pub fn begin(&mut self, kind: OperationKind, description: impl Into<String>, stack: &LayerStack) {
        if self.recording.is_some() {
            tracing::warn!(%kind, "history begin while recording; previous capture dropped");
        }
        self.recording = Some(PendingRecord {
            command: SnapshotCommand::new(kind, description, stack),
        });
    }

    pub fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    /// Capture the after-state and record the step. Returns `false` when no
    /// operation was being recorded.
    pub fn commit(&mut self, stack: &LayerStack) -> bool {
        let Some(PendingRecord { mut command }) = self.recording.take() else {
            return false;
        };
        command.set_after(stack);
        self.record(Box::new(command));
        true
    }

    /// Leave recording without adding a step. The stack is not touched.
    pub fn abort(&mut self) -> bool {
        self.recording.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn snapshot_op<F: FnOnce(&mut LayerStack)>(stack: &mut LayerStack, kind: OperationKind, f: F) -> Box<dyn Command> {
        let mut cmd = SnapshotCommand::new(kind, kind.label(), stack);
        f(stack);
        cmd.set_after(stack);
        Box::new(cmd)
    }

    fn stack() -> LayerStack {
        LayerStack::with_background(4, 4, Rgba([255, 255, 255, 255])).unwrap()
    }

    #[test]
    fn undo_on_empty_is_noop() {
        let mut s = stack();
        let mut h = UndoHistory::new(10, Duration::from_millis(500));
        let before = s.describe_tree();
        assert_eq!(h.undo(&mut s), None);
        assert_eq!(h.redo(&mut s), None);
        assert_eq!(s.describe_tree(), before);
    }

    #[test]
    fn same_kind_within_interval_coalesces() {
        let mut s = stack();
        let id = s.active_layer_id();
        let mut h = UndoHistory::new(10, Duration::from_millis(500));
        let t0 = Instant::now();
        for (i, opacity) in [0.9, 0.7, 0.5].into_iter().enumerate() {
            let before = LayerProps::capture(s.layer(id).unwrap());
            s.set_opacity(id, opacity);
            let after = LayerProps::capture(s.layer(id).unwrap());
            h.record_at(
                Box::new(LayerPropsCommand::new(OperationKind::Opacity, id, before, after)),
                t0 + Duration::from_millis(100 * i as u64),
            );
        }
        assert_eq!(h.undo_count(), 1);
        h.undo(&mut s);
        assert_eq!(s.layer(id).unwrap().opacity(), 1.0);
        h.redo(&mut s);
        assert_eq!(s.layer(id).unwrap().opacity(), 0.5);
    }

    #[test]
    fn interval_gap_or_kind_change_starts_new_step() {
        let mut s = stack();
        let mut h = UndoHistory::new(10, Duration::from_millis(500));
        let t0 = Instant::now();
        let root = s.root_id();
        let a = snapshot_op(&mut s, OperationKind::InsertLayer, |s| {
            s.insert_layer(root, 1, Layer::new_group("a")).unwrap();
        });
        h.record_at(a, t0);
        let b = snapshot_op(&mut s, OperationKind::InsertLayer, |s| {
            s.insert_layer(root, 2, Layer::new_group("b")).unwrap();
        });
        h.record_at(b, t0 + Duration::from_millis(600));
        let c = snapshot_op(&mut s, OperationKind::Selection, |s| s.select_all());
        h.record_at(c, t0 + Duration::from_millis(650));
        assert_eq!(h.undo_count(), 3);
    }

    #[test]
    fn no_coalescing_across_undo() {
        let mut s = stack();
        let root = s.root_id();
        let mut h = UndoHistory::new(10, Duration::from_secs(60));
        let sel = snapshot_op(&mut s, OperationKind::Selection, |s| s.select_all());
        h.record(sel);
        for name in ["a", "b"] {
            let cmd = snapshot_op(&mut s, OperationKind::InsertLayer, |s| {
                s.insert_layer(root, 99, Layer::new_group(name)).unwrap();
            });
            h.record(cmd);
        }
        assert_eq!(h.undo_count(), 2);
        h.undo(&mut s);
        assert_eq!(s.layer_count(), 1);
        h.redo(&mut s);
        assert_eq!(s.layer_count(), 3);
        let c = snapshot_op(&mut s, OperationKind::InsertLayer, |s| {
            s.insert_layer(root, 99, Layer::new_group("c")).unwrap();
        });
        h.record(c);
        assert_eq!(h.undo_count(), 3);
        h.undo(&mut s);
        assert_eq!(s.layer_count(), 3);
    }

    #[test]
    fn record_clears_redo() {
        let mut s = stack();
        let mut h = UndoHistory::new(10, Duration::ZERO);
        let a = snapshot_op(&mut s, OperationKind::Selection, |s| s.select_all());
        h.record(a);
        h.undo(&mut s);
        assert!(h.can_redo());
        let b = snapshot_op(&mut s, OperationKind::Selection, |s| s.invert_selection());
        h.record(b);
        assert!(!h.can_redo());
    }

    #[test]
    fn oldest_steps_drop_past_max() {
        let mut s = stack();
        let mut h = UndoHistory::new(3, Duration::ZERO);
        for _ in 0..5 {
            let cmd = snapshot_op(&mut s, OperationKind::Selection, |s| s.invert_selection());
            h.record(cmd);
        }
        assert_eq!(h.undo_count(), 3);
        assert_eq!(h.undo_to(10, &mut s), 3);
        assert!(!h.can_undo());
    }

    #[test]
    fn begin_commit_records_one_step() {
        let mut s = stack();
        let mut h = UndoHistory::default();
        let bg = s.active_layer_id();
        h.begin(OperationKind::DeleteLayer, "Delete Layer", &s);
        assert!(h.is_recording());
        s.delete_layer(bg).unwrap();
        assert!(h.commit(&s));
        assert!(!h.is_recording());
        assert!(!h.commit(&s));
        assert_eq!(h.undo_description().as_deref(), Some("Delete Layer"));
        h.undo(&mut s);
        assert_eq!(s.active_layer_id(), bg);
        assert_eq!(s.layer_count(), 1);
    }

    #[test]
    fn pixel_command_restores_layer() {
        let mut s = stack();
        let id = s.active_layer_id();
        let mut h = UndoHistory::default();
        let mut cmd = LayerPixelsCommand::new("Fill", &s, id).unwrap();
        crate::ops::paint::fill_rect(&mut s, id, crate::geometry::PixelRect::new(0, 0, 2, 2), Rgba([0, 0, 0, 255])).unwrap();
        cmd.set_after(&s);
        h.record(Box::new(cmd));
        h.undo(&mut s);
        assert_eq!(*s.layer(id).unwrap().pixels().unwrap().get_pixel(0, 0), Rgba([255, 255, 255, 255]));
        h.redo(&mut s);
        assert_eq!(*s.layer(id).unwrap().pixels().unwrap().get_pixel(0, 0), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn memory_cap_keeps_newest_step() {
        let mut s = LayerStack::with_background(64, 64, Rgba([1, 2, 3, 255])).unwrap();
        let mut h = UndoHistory::new(100, Duration::ZERO);
        h.set_memory_limit(Some(1));
        for _ in 0..3 {
            let cmd = snapshot_op(&mut s, OperationKind::Selection, |s| s.invert_selection());
            h.record(cmd);
        }
        assert_eq!(h.undo_count(), 1);
        assert!(h.memory_usage() > 0);
    }
}
