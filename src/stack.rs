use image::Rgba;
use std::fmt::{self, Write as _};
use std::sync::{mpsc, Arc};

use crate::blend::BlendMode;
use crate::compositor::{self, RenderCtx};
use crate::error::{CoreError, CoreResult};
use crate::geometry::PixelRect;
use crate::layer::{Layer, LayerContent, LayerId, LayerKind};
use crate::ops::text::{self, TextContent, TextRasterizer};
use crate::selection::{Selection, SelectionMode, SelectionShape};
use crate::tiled::TiledImage;
use crate::transform::{Affine, LayerTransform};

/// Largest accepted canvas edge, in pixels.
pub const MAX_CANVAS_DIM: u32 = 32768;

/// Interactive tool preview bound to an image layer. Pixels are in the
/// layer's local space and are drawn over it until committed or cancelled.
#[derive(Clone, Debug)]
pub struct PendingEdit {
    pub(crate) layer: LayerId,
    pub(crate) pixels: TiledImage,
}

impl PendingEdit {
    pub fn layer(&self) -> LayerId {
        self.layer
    }

    pub fn pixels(&self) -> &TiledImage {
        &self.pixels
    }
}

/// The layer tree of one document plus its active layer, selection mask and
/// dirty-region bookkeeping.
///
/// The root group is created with the stack and can never be locked, deleted
/// or moved. Every operation validates before it mutates, so a returned error
/// means the tree is exactly as it was.
#[derive(Clone)]
pub struct LayerStack {
    width: u32,
    height: u32,
    root: Layer,
    active: LayerId,
    selection: Selection,
    pending: Option<PendingEdit>,
    text_engine: Option<Arc<dyn TextRasterizer>>,
    dirty: Option<PixelRect>,
    generation: u64,
}

impl fmt::Debug for LayerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerStack")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layers", &self.layer_count())
            .field("active", &self.active)
            .finish()
    }
}

fn check_canvas_size(width: u32, height: u32) -> CoreResult<()> {
    if width == 0 || height == 0 || width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM {
        return Err(CoreError::bounds(format!(
            "canvas {width}x{height} outside 1..={MAX_CANVAS_DIM}"
        )));
    }
    Ok(())
}

impl LayerStack {
    /// Empty stack: just the root group, which is also the active layer.
    pub fn new(width: u32, height: u32) -> CoreResult<Self> {
        check_canvas_size(width, height)?;
        let root = Layer::new_group("Root");
        Ok(Self {
            width,
            height,
            active: root.id(),
            root,
            selection: Selection::new(width, height),
            pending: None,
            text_engine: None,
            dirty: Some(PixelRect::from_size(width, height)),
            generation: 0,
        })
    }

    /// Stack with one filled "Background" layer, made active.
    pub fn with_background(width: u32, height: u32, color: Rgba<u8>) -> CoreResult<Self> {
        let mut stack = Self::new(width, height)?;
        let bg = Layer::new_filled("Background", width, height, color)?;
        let root = stack.root_id();
        let id = stack.insert_layer(root, 0, bg)?;
        stack.active = id;
        Ok(stack)
    }

    /// Reassemble a stack from persisted parts. `active` falls back to the
    /// root when it is not in the tree.
    pub(crate) fn from_parts(width: u32, height: u32, mut root: Layer, active: Option<LayerId>, selection: Selection) -> CoreResult<Self> {
        check_canvas_size(width, height)?;
        root.locked = false;
        root.adopt(None);
        let active = active.filter(|id| root.contains(*id)).unwrap_or(root.id());
        Ok(Self {
            width,
            height,
            root,
            active,
            selection,
            pending: None,
            text_engine: None,
            dirty: Some(PixelRect::from_size(width, height)),
            generation: 0,
        })
    }

    // ---- queries ------------------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn canvas_rect(&self) -> PixelRect {
        PixelRect::from_size(self.width, self.height)
    }

    pub fn root(&self) -> &Layer {
        &self.root
    }

    pub fn root_id(&self) -> LayerId {
        self.root.id()
    }

    pub fn active_layer_id(&self) -> LayerId {
        self.active
    }

    pub fn active_layer(&self) -> &Layer {
        self.layer(self.active).unwrap_or(&self.root)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.root.find(id)
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.root.contains(id)
    }

    /// Number of layers below the root.
    pub fn layer_count(&self) -> usize {
        self.root.subtree_len() - 1
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn pending_edit(&self) -> Option<&PendingEdit> {
        self.pending.as_ref()
    }

    pub fn text_engine(&self) -> Option<&dyn TextRasterizer> {
        self.text_engine.as_deref()
    }

    pub fn set_text_engine(&mut self, engine: Arc<dyn TextRasterizer>) {
        self.text_engine = Some(engine);
        self.mark_dirty(None);
    }

    /// Child indices from the root down to `id`.
    pub fn path_of(&self, id: LayerId) -> Option<Vec<usize>> {
        fn walk(node: &Layer, id: LayerId, path: &mut Vec<usize>) -> bool {
            if node.id() == id {
                return true;
            }
            for (i, c) in node.children().iter().enumerate() {
                path.push(i);
                if walk(c, id, path) {
                    return true;
                }
                path.pop();
            }
            false
        }
        let mut path = Vec::new();
        walk(&self.root, id, &mut path).then_some(path)
    }

    pub fn layer_at_path(&self, path: &[usize]) -> Option<&Layer> {
        path.iter().try_fold(&self.root, |node, &i| node.children().get(i))
    }

    fn layer_at_path_mut(&mut self, path: &[usize]) -> Option<&mut Layer> {
        let mut node = &mut self.root;
        for &i in path {
            node = node.children_mut()?.get_mut(i)?;
        }
        Some(node)
    }

    pub(crate) fn layer_mut(&mut self, id: LayerId) -> Option<&mut Layer> {
        let path = self.path_of(id)?;
        self.layer_at_path_mut(&path)
    }

    /// Parent group and index within it. `None` for the root or unknown ids.
    pub fn position_of(&self, id: LayerId) -> Option<(LayerId, usize)> {
        let path = self.path_of(id)?;
        let (&index, parent_path) = path.split_last()?;
        Some((self.layer_at_path(parent_path)?.id(), index))
    }

    fn ancestors_and_self(&self, id: LayerId) -> Option<Vec<&Layer>> {
        let path = self.path_of(id)?;
        let mut out = vec![&self.root];
        let mut node = &self.root;
        for &i in &path {
            node = node.children().get(i)?;
            out.push(node);
        }
        Some(out)
    }

    /// True when the layer or any ancestor is locked.
    pub fn is_effectively_locked(&self, id: LayerId) -> bool {
        self.ancestors_and_self(id)
            .is_some_and(|chain| chain.iter().any(|l| l.is_locked()))
    }

    /// True when the layer and every ancestor are visible.
    pub fn is_effectively_visible(&self, id: LayerId) -> bool {
        self.ancestors_and_self(id)
            .is_some_and(|chain| chain.iter().all(|l| l.is_visible()))
    }

    /// Local content space of `id` to canvas space.
    pub fn canvas_affine(&self, id: LayerId) -> Option<Affine> {
        let chain = self.ancestors_and_self(id)?;
        Some(
            chain
                .iter()
                .fold(Affine::IDENTITY, |acc, l| acc.then_after(&l.local_affine())),
        )
    }

    /// Content edits need an image layer that is unlocked and visible,
    /// ancestors included.
    pub fn check_editable(&self, id: LayerId) -> CoreResult<()> {
        let layer = self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        if self.is_effectively_locked(id) {
            return Err(CoreError::LayerLocked(id));
        }
        if !self.is_effectively_visible(id) {
            return Err(CoreError::InvisibleLayer(id));
        }
        if layer.kind() != LayerKind::Image {
            return Err(CoreError::NotRaster(id));
        }
        Ok(())
    }

    /// Indented one-line-per-layer dump of the tree, for logs and for
    /// comparing structure before and after an operation.
    pub fn describe_tree(&self) -> String {
        fn walk(node: &Layer, depth: usize, active: LayerId, out: &mut String) {
            let _ = writeln!(
                out,
                "{:indent$}{}{} {} {:?} pos={:?} size={:?} opacity={:.3} blend={} visible={} locked={} alpha_locked={} isolate={:?} transform={:?}",
                "",
                if node.id() == active { "*" } else { "" },
                node.kind().label(),
                node.id(),
                node.name,
                node.position(),
                node.content_size(),
                node.opacity(),
                node.blend_mode(),
                node.is_visible(),
                node.is_locked(),
                node.is_alpha_locked(),
                node.isolate(),
                node.transform(),
                indent = depth * 2,
            );
            for c in node.children().iter().rev() {
                walk(c, depth + 1, active, out);
            }
        }
        let mut out = String::new();
        walk(&self.root, 0, self.active, &mut out);
        out
    }

    // ---- dirty tracking -----------------------------------------------------

    /// Record a changed canvas area (`None` for everything).
    pub fn mark_dirty(&mut self, rect: Option<PixelRect>) {
        let canvas = self.canvas_rect();
        let rect = rect.and_then(|r| r.intersect(&canvas)).unwrap_or(canvas);
        self.dirty = Some(self.dirty.map_or(rect, |d| d.union(&rect)));
        self.generation = self.generation.wrapping_add(1);
    }

    /// Accumulated dirty area since the last call.
    pub fn take_dirty(&mut self) -> Option<PixelRect> {
        self.dirty.take()
    }

    /// Bumps on every recorded change.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn layer_dirty_rect(&self, id: LayerId) -> Option<PixelRect> {
        let layer = self.layer(id)?;
        if layer.kind() == LayerKind::Text {
            return None;
        }
        let (parent, _) = self.position_of(id)?;
        let to_canvas = self.canvas_affine(parent)?;
        let ext = layer.extent();
        if ext.is_empty() {
            return Some(ext);
        }
        Some(
            to_canvas
                .then_after(&Affine::translate(ext.x as f32, ext.y as f32))
                .map_rect(ext.width, ext.height),
        )
    }

    // ---- structural operations ----------------------------------------------

    /// Insert `layer` (with its subtree) into `parent_group` at `index`,
    /// clamped to the child count. Index 0 is the bottom.
    pub fn insert_layer(&mut self, parent_group: LayerId, index: usize, mut layer: Layer) -> CoreResult<LayerId> {
        let parent = self.layer(parent_group).ok_or(CoreError::LayerNotFound(parent_group))?;
        if !parent.is_group() {
            return Err(CoreError::NotAGroup(parent_group));
        }
        let incoming = layer.subtree_ids();
        if incoming.iter().any(|id| *id == parent_group || self.contains(*id)) {
            tracing::warn!(layer = %layer.id(), parent = %parent_group, "insert rejected: cycle");
            return Err(CoreError::Cycle {
                layer: layer.id(),
                parent: parent_group,
            });
        }
        if self.is_effectively_locked(parent_group) {
            tracing::warn!(parent = %parent_group, "insert rejected: parent locked");
            return Err(CoreError::Locked(parent_group));
        }

        let id = layer.id();
        layer.adopt(Some(parent_group));
        let children = self
            .layer_mut(parent_group)
            .and_then(Layer::children_mut)
            .ok_or(CoreError::NotAGroup(parent_group))?;
        let index = index.min(children.len());
        children.insert(index, layer);
        tracing::debug!(layer = %id, parent = %parent_group, index, "inserted layer");
        let dirty = self.layer_dirty_rect(id);
        self.mark_dirty(dirty);
        Ok(id)
    }

    /// Remove a layer and its subtree, returning it. When the active layer
    /// goes away the sibling above becomes active, else the one below, else
    /// the parent.
    pub fn delete_layer(&mut self, id: LayerId) -> CoreResult<Layer> {
        if id == self.root_id() {
            return Err(CoreError::Locked(id));
        }
        let (parent_id, index) = self.position_of(id).ok_or(CoreError::LayerNotFound(id))?;
        if self.is_effectively_locked(id) {
            tracing::warn!(layer = %id, "delete rejected: locked");
            return Err(CoreError::Locked(id));
        }
        let dirty = self.layer_dirty_rect(id);
        let active_removed = self.layer(id).is_some_and(|l| l.contains(self.active));
        if self.pending.as_ref().is_some_and(|p| self.layer(id).is_some_and(|l| l.contains(p.layer))) {
            self.pending = None;
        }

        let children = self
            .layer_mut(parent_id)
            .and_then(Layer::children_mut)
            .ok_or(CoreError::LayerNotFound(parent_id))?;
        let mut removed = children.remove(index);
        removed.parent = None;
        if active_removed {
            self.active = children
                .get(index)
                .or_else(|| index.checked_sub(1).and_then(|i| children.get(i)))
                .map_or(parent_id, Layer::id);
        }
        tracing::debug!(layer = %id, parent = %parent_id, index, "deleted layer");
        self.mark_dirty(dirty);
        Ok(removed)
    }

    /// Move a layer to `new_parent` at `new_index` (its index in the final
    /// child list, clamped). Fully validated before anything is detached.
    pub fn move_layer(&mut self, id: LayerId, new_parent: LayerId, new_index: usize) -> CoreResult<()> {
        if id == self.root_id() {
            return Err(CoreError::Locked(id));
        }
        let (old_parent, old_index) = self.position_of(id).ok_or(CoreError::LayerNotFound(id))?;
        let target = self.layer(new_parent).ok_or(CoreError::LayerNotFound(new_parent))?;
        if !target.is_group() {
            return Err(CoreError::NotAGroup(new_parent));
        }
        if self.layer(id).is_some_and(|l| l.contains(new_parent)) {
            tracing::warn!(layer = %id, parent = %new_parent, "move rejected: cycle");
            return Err(CoreError::Cycle { layer: id, parent: new_parent });
        }
        if self.is_effectively_locked(id) {
            return Err(CoreError::Locked(id));
        }
        if self.is_effectively_locked(new_parent) {
            return Err(CoreError::Locked(new_parent));
        }

        let before = self.layer_dirty_rect(id);
        let mut layer = self
            .layer_mut(old_parent)
            .and_then(Layer::children_mut)
            .map(|c| c.remove(old_index))
            .ok_or(CoreError::LayerNotFound(old_parent))?;
        layer.parent = Some(new_parent);
        match self.layer_mut(new_parent).and_then(Layer::children_mut) {
            Some(children) => {
                let index = new_index.min(children.len());
                children.insert(index, layer);
                tracing::debug!(layer = %id, from = %old_parent, to = %new_parent, index, "moved layer");
            }
            None => {
                // Validated above; put it back rather than lose it.
                tracing::error!(layer = %id, "move target vanished, restoring");
                debug_assert!(false, "move target vanished");
                layer.parent = Some(old_parent);
                if let Some(children) = self.layer_mut(old_parent).and_then(Layer::children_mut) {
                    children.insert(old_index, layer);
                }
                return Err(CoreError::LayerNotFound(new_parent));
            }
        }
        let after = self.layer_dirty_rect(id);
        self.mark_dirty(union_opt(before, after));
        Ok(())
    }

    /// Copy a layer (fresh ids throughout) directly above the original.
    pub fn duplicate_layer(&mut self, id: LayerId) -> CoreResult<LayerId> {
        if id == self.root_id() {
            return Err(CoreError::Locked(id));
        }
        let (parent, index) = self.position_of(id).ok_or(CoreError::LayerNotFound(id))?;
        let mut copy = self.layer(id).ok_or(CoreError::LayerNotFound(id))?.duplicate();
        copy.name = format!("{} Copy", copy.name);
        self.insert_layer(parent, index + 1, copy)
    }

    /// Merge `id` into the nearest visible sibling below it; hidden siblings in
    /// between are skipped and stay in place. The result is a new
    /// image layer at the lower position that keeps the lower layer's name,
    /// opacity and blend mode, with the upper content blended in using the
    /// upper layer's mode and opacity. Transforms are baked.
    pub fn merge_down(&mut self, id: LayerId) -> CoreResult<LayerId> {
        if id == self.root_id() {
            return Err(CoreError::merge(id, "the root has no siblings"));
        }
        let (parent, index) = self.position_of(id).ok_or(CoreError::LayerNotFound(id))?;
        if index == 0 {
            return Err(CoreError::merge(id, "no layer below"));
        }
        let siblings = self
            .layer(parent)
            .map(Layer::children)
            .ok_or(CoreError::LayerNotFound(parent))?;
        let upper = &siblings[index];
        let lower_index = siblings[..index]
            .iter()
            .rposition(Layer::is_visible)
            .ok_or_else(|| CoreError::merge(id, "no visible layer below"))?;
        let lower = &siblings[lower_index];
        for layer in [upper, lower] {
            if self.is_effectively_locked(layer.id()) {
                tracing::warn!(layer = %layer.id(), "merge rejected: locked");
                return Err(CoreError::merge(id, format!("layer {} is locked", layer.id())));
            }
            if !self.is_effectively_visible(layer.id()) {
                return Err(CoreError::merge(id, format!("layer {} is hidden", layer.id())));
            }
        }

        let region = lower.extent().union(&upper.extent());
        let mut merged = Layer::new_image(lower.name.clone(), TiledImage::new(1, 1)).with_position(lower.position().0, lower.position().1);
        merged.opacity = lower.opacity();
        merged.blend_mode = lower.blend_mode();
        if !region.is_empty() {
            let ctx = RenderCtx::new(self.text_engine());
            let mut buf = compositor::render_content(lower, &Affine::IDENTITY, region, &ctx);
            let top = compositor::render_content(upper, &Affine::IDENTITY, region, &ctx);
            buf.composite_from(&top, upper.blend_mode(), upper.opacity());
            merged.content = LayerContent::Image(buf.to_tiled());
            merged.position = (region.x, region.y);
        }

        let lower_id = lower.id();
        let dirty = union_opt(self.layer_dirty_rect(lower_id), self.layer_dirty_rect(id));
        let merged_id = merged.id();
        merged.adopt(Some(parent));
        let children = self
            .layer_mut(parent)
            .and_then(Layer::children_mut)
            .ok_or(CoreError::LayerNotFound(parent))?;
        children.remove(index);
        children[lower_index] = merged;
        if self.active == id || self.active == lower_id {
            self.active = merged_id;
        }
        if self.pending.as_ref().is_some_and(|p| p.layer == id || p.layer == lower_id) {
            self.pending = None;
        }
        tracing::info!(upper = %id, lower = %lower_id, merged = %merged_id, "merged down");
        self.mark_dirty(dirty);
        Ok(merged_id)
    }

    /// Replace a group by one image layer holding its isolated composite.
    /// The root delegates to [`flatten_image`](Self::flatten_image).
    pub fn flatten_group(&mut self, group: LayerId) -> CoreResult<LayerId> {
        if group == self.root_id() {
            return self.flatten_image();
        }
        let layer = self.layer(group).ok_or(CoreError::LayerNotFound(group))?;
        if !layer.is_group() {
            return Err(CoreError::NotAGroup(group));
        }
        if self.is_effectively_locked(group) {
            return Err(CoreError::Locked(group));
        }
        let flat = layer.convert_to_image(self.text_engine())?;
        self.replace_subtree(group, flat)?;
        tracing::info!(group = %group, "flattened group");
        Ok(group)
    }

    /// Collapse the whole tree into a single "Background" image layer holding
    /// the visible composite. Fails if any layer is locked.
    pub fn flatten_image(&mut self) -> CoreResult<LayerId> {
        if let Some(locked) = self.root.subtree_ids().into_iter().find(|id| self.layer(*id).is_some_and(Layer::is_locked)) {
            return Err(CoreError::Locked(locked));
        }
        let saved_pending = self.pending.take();
        let image = compositor::composite(self);
        self.pending = saved_pending;
        let mut bg = Layer::new_image("Background", TiledImage::from_rgba_image(&image));
        bg.adopt(Some(self.root_id()));
        let id = bg.id();
        if let Some(children) = self.root.children_mut() {
            children.clear();
            children.push(bg);
        }
        self.active = id;
        self.pending = None;
        tracing::info!(layer = %id, "flattened image");
        self.mark_dirty(None);
        Ok(id)
    }

    /// One-way conversion of a text layer (rasterized) or group (flattened)
    /// into an image layer. Image layers are left alone.
    pub fn convert_to_image(&mut self, id: LayerId) -> CoreResult<()> {
        let layer = self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        match layer.kind() {
            LayerKind::Image => Ok(()),
            LayerKind::Group => self.flatten_group(id).map(|_| ()),
            LayerKind::Text => {
                if self.is_effectively_locked(id) {
                    return Err(CoreError::Locked(id));
                }
                let converted = layer.convert_to_image(self.text_engine())?;
                self.replace_subtree(id, converted)
            }
        }
    }

    /// Swap the layer `id` for `replacement` in place, keeping the active
    /// layer inside the replaced subtree pointed at the replacement.
    fn replace_subtree(&mut self, id: LayerId, mut replacement: Layer) -> CoreResult<()> {
        let (parent, index) = self.position_of(id).ok_or(CoreError::LayerNotFound(id))?;
        let dirty = self.layer_dirty_rect(id);
        let active_inside = self.layer(id).is_some_and(|l| l.contains(self.active));
        if self.pending.as_ref().is_some_and(|p| self.layer(id).is_some_and(|l| l.contains(p.layer))) {
            self.pending = None;
        }
        replacement.adopt(Some(parent));
        let new_id = replacement.id();
        let slot = self
            .layer_mut(parent)
            .and_then(Layer::children_mut)
            .and_then(|c| c.get_mut(index))
            .ok_or(CoreError::LayerNotFound(id))?;
        *slot = replacement;
        if active_inside {
            self.active = new_id;
        }
        self.mark_dirty(dirty);
        Ok(())
    }

    /// Resample an image layer through its transform and reset the transform
    /// to identity.
    pub fn bake_transform(&mut self, id: LayerId) -> CoreResult<()> {
        let layer = self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        if self.is_effectively_locked(id) {
            return Err(CoreError::Locked(id));
        }
        let pixels = layer.pixels().ok_or(CoreError::NotRaster(id))?;
        if layer.transform().is_identity() {
            return Ok(());
        }
        let (baked, pos) = crate::ops::transform::bake(pixels, &layer.local_affine())
            .ok_or_else(|| CoreError::bounds("transform collapses the layer"))?;
        let dirty = self.layer_dirty_rect(id);
        if let Some(layer) = self.layer_mut(id) {
            layer.content = LayerContent::Image(baked);
            layer.position = pos;
            layer.transform = LayerTransform::identity();
        }
        if self.pending.as_ref().is_some_and(|p| p.layer == id) {
            self.pending = None;
        }
        tracing::debug!(layer = %id, "baked transform");
        self.mark_dirty(dirty);
        Ok(())
    }

    // ---- attributes ---------------------------------------------------------
    // Setters return whether the change applied. They are silently ignored on
    // layers that are locked directly or through an ancestor.

    fn with_unlocked<F>(&mut self, id: LayerId, f: F) -> bool
    where
        F: FnOnce(&mut Layer) -> bool,
    {
        if self.is_effectively_locked(id) {
            tracing::debug!(layer = %id, "attribute change ignored: locked");
            return false;
        }
        let dirty = self.layer_dirty_rect(id);
        let applied = self.layer_mut(id).is_some_and(f);
        if applied {
            self.mark_dirty(dirty);
        }
        applied
    }

    pub fn set_opacity(&mut self, id: LayerId, opacity: f32) -> bool {
        self.with_unlocked(id, |l| l.set_opacity(opacity))
    }

    pub fn set_blend_mode(&mut self, id: LayerId, mode: BlendMode) -> bool {
        self.with_unlocked(id, |l| l.set_blend_mode(mode))
    }

    pub fn set_visible(&mut self, id: LayerId, visible: bool) -> bool {
        self.with_unlocked(id, |l| l.set_visible(visible))
    }

    pub fn set_alpha_locked(&mut self, id: LayerId, alpha_locked: bool) -> bool {
        self.with_unlocked(id, |l| l.set_alpha_locked(alpha_locked))
    }

    pub fn rename_layer(&mut self, id: LayerId, name: impl Into<String>) -> bool {
        let name = name.into();
        self.with_unlocked(id, |l| {
            l.name = name;
            true
        })
    }

    pub fn set_isolate(&mut self, id: LayerId, isolate: bool) -> bool {
        self.with_unlocked(id, |l| match &mut l.content {
            LayerContent::Group(g) => {
                g.isolate = isolate;
                true
            }
            _ => false,
        })
    }

    /// Always applies, except on the root which can never be locked.
    pub fn set_locked(&mut self, id: LayerId, locked: bool) -> bool {
        if id == self.root_id() {
            return false;
        }
        let applied = self.layer_mut(id).is_some_and(|l| l.set_locked(locked));
        if applied {
            if locked && self.pending.as_ref().is_some_and(|p| p.layer == id) {
                self.pending = None;
            }
            let dirty = self.layer_dirty_rect(id);
            self.mark_dirty(dirty);
        }
        applied
    }

    pub fn set_transform(&mut self, id: LayerId, transform: LayerTransform) -> CoreResult<()> {
        self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        if self.is_effectively_locked(id) {
            return Err(CoreError::Locked(id));
        }
        let before = self.layer_dirty_rect(id);
        if let Some(l) = self.layer_mut(id) {
            l.transform = transform;
        }
        let after = self.layer_dirty_rect(id);
        self.mark_dirty(union_opt(before, after));
        Ok(())
    }

    /// Reset the transform to identity.
    pub fn clear_transform(&mut self, id: LayerId) -> CoreResult<()> {
        self.set_transform(id, LayerTransform::identity())
    }

    pub fn set_position(&mut self, id: LayerId, x: i32, y: i32) -> CoreResult<()> {
        self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        if self.is_effectively_locked(id) {
            return Err(CoreError::Locked(id));
        }
        let before = self.layer_dirty_rect(id);
        if let Some(l) = self.layer_mut(id) {
            l.position = (x, y);
        }
        let after = self.layer_dirty_rect(id);
        self.mark_dirty(union_opt(before, after));
        Ok(())
    }

    /// Replace a text layer's content. The cached raster is dropped and any
    /// in-flight rasterization abandoned.
    pub fn set_text(&mut self, id: LayerId, content: TextContent) -> CoreResult<()> {
        let layer = self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        if layer.kind() != LayerKind::Text {
            return Err(CoreError::NotText(id));
        }
        if self.is_effectively_locked(id) {
            return Err(CoreError::LayerLocked(id));
        }
        content.style.validate()?;
        if let Some(t) = self.layer_mut(id).and_then(Layer::text_mut) {
            t.set_content(content);
        }
        tracing::debug!(layer = %id, "text content replaced");
        self.mark_dirty(None);
        Ok(())
    }

    /// Rasterize a text layer on the rayon pool. `Ok(None)` when no text
    /// engine is installed.
    pub fn rasterize_text_async(&self, id: LayerId) -> CoreResult<Option<mpsc::Receiver<CoreResult<()>>>> {
        let layer = self.layer(id).ok_or(CoreError::LayerNotFound(id))?;
        let data = layer.text().ok_or(CoreError::NotText(id))?;
        let Some(engine) = self.text_engine.clone() else {
            return Ok(None);
        };
        Ok(Some(text::spawn_raster(data.request_raster(), engine)))
    }

    // ---- active layer & pending edit ----------------------------------------

    /// Make `id` active. Any pending edit is discarded.
    pub fn set_active_layer(&mut self, id: LayerId) -> CoreResult<()> {
        if !self.contains(id) {
            return Err(CoreError::LayerNotFound(id));
        }
        if self.pending.take().is_some() {
            tracing::debug!(layer = %self.active, "pending edit discarded by layer switch");
            self.mark_dirty(None);
        }
        self.active = id;
        Ok(())
    }

    /// Start a preview buffer on the active layer.
    pub fn begin_edit(&mut self) -> CoreResult<()> {
        let id = self.active;
        self.check_editable(id)?;
        let (w, h) = self.active_layer().content_size();
        self.pending = Some(PendingEdit {
            layer: id,
            pixels: TiledImage::new(w, h),
        });
        Ok(())
    }

    pub fn pending_edit_mut(&mut self) -> Option<&mut TiledImage> {
        self.pending.as_mut().map(|p| &mut p.pixels)
    }

    /// Blend the preview into its layer. Returns `false` when nothing was
    /// pending. On error the preview is kept.
    pub fn commit_edit(&mut self) -> CoreResult<bool> {
        let Some(edit) = self.pending.take() else {
            return Ok(false);
        };
        match crate::ops::paint::paint_local(self, edit.layer, &edit.pixels) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.pending = Some(edit);
                Err(e)
            }
        }
    }

    pub fn cancel_edit(&mut self) -> bool {
        let had = self.pending.take().is_some();
        if had {
            self.mark_dirty(None);
        }
        had
    }

    // ---- selection ----------------------------------------------------------

    pub fn select_all(&mut self) {
        self.selection.select_all();
        self.mark_dirty(None);
    }

    pub fn deselect_all(&mut self) {
        self.selection.deselect_all();
        self.mark_dirty(None);
    }

    pub fn invert_selection(&mut self) {
        self.selection.invert();
        self.mark_dirty(None);
    }

    pub fn grow_selection(&mut self, n: u32) {
        self.selection.grow(n);
        self.mark_dirty(None);
    }

    pub fn shrink_selection(&mut self, n: u32) {
        self.selection.shrink(n);
        self.mark_dirty(None);
    }

    pub fn combine_selection(&mut self, shape: &SelectionShape, mode: SelectionMode) {
        self.selection.combine(shape, mode);
        self.mark_dirty(None);
    }

    pub fn translate_selection(&mut self, dx: i32, dy: i32) {
        self.selection.translate(dx, dy);
        self.mark_dirty(None);
    }

    pub fn set_selection(&mut self, selection: Selection) {
        self.selection = Selection::from_mask(self.width, self.height, selection.mask().cloned());
        self.mark_dirty(None);
    }

    // ---- snapshot restore -----------------------------------------------------

    /// Put back a previously captured tree. Used by undo.
    pub(crate) fn restore_tree(&mut self, root: Layer, active: LayerId) {
        self.root = root;
        self.root.adopt(None);
        self.active = if self.root.contains(active) { active } else { self.root.id() };
        self.pending = None;
        self.mark_dirty(None);
    }

    pub(crate) fn replace_layer_content(&mut self, id: LayerId, content: LayerContent) -> bool {
        let Some(layer) = self.layer_mut(id) else {
            return false;
        };
        layer.content = content;
        if self.pending.as_ref().is_some_and(|p| p.layer == id) {
            self.pending = None;
        }
        let dirty = self.layer_dirty_rect(id);
        self.mark_dirty(dirty);
        true
    }

    pub fn memory_bytes(&self) -> usize {
        self.root.memory_bytes() + self.selection.memory_bytes()
    }
}

fn union_opt(a: Option<PixelRect>, b: Option<PixelRect>) -> Option<PixelRect> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.union(&b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::text::tests::BlockRasterizer;
    use crate::geometry::Point;
    use crate::ops::text::TextStyle;

    fn solid(name: &str, w: u32, h: u32, c: [u8; 4]) -> Layer {
        Layer::new_filled(name, w, h, Rgba(c)).unwrap()
    }

    fn child_names(stack: &LayerStack, group: LayerId) -> Vec<String> {
        stack.layer(group).unwrap().children().iter().map(|l| l.name.clone()).collect()
    }

    #[test]
    fn zero_sized_canvas_is_rejected() {
        assert!(matches!(LayerStack::new(0, 10), Err(CoreError::Bounds(_))));
        assert!(matches!(LayerStack::new(10, MAX_CANVAS_DIM + 1), Err(CoreError::Bounds(_))));
    }

    #[test]
    fn root_cannot_be_locked_deleted_or_moved() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let g = stack.insert_layer(root, 0, Layer::new_group("g")).unwrap();
        assert!(!stack.set_locked(root, true));
        assert_eq!(stack.delete_layer(root).err(), Some(CoreError::Locked(root)));
        assert_eq!(stack.move_layer(root, g, 0).err(), Some(CoreError::Locked(root)));
    }

    #[test]
    fn insert_clamps_index_and_sets_parent() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        stack.insert_layer(root, 0, solid("a", 1, 1, [0; 4])).unwrap();
        let b = stack.insert_layer(root, 99, solid("b", 1, 1, [0; 4])).unwrap();
        assert_eq!(child_names(&stack, root), ["a", "b"]);
        assert_eq!(stack.layer(b).unwrap().parent(), Some(root));
        assert_eq!(stack.position_of(b), Some((root, 1)));
    }

    #[test]
    fn insert_rejects_non_group_parent_and_locked_parent() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let a = stack.insert_layer(root, 0, solid("a", 1, 1, [0; 4])).unwrap();
        assert_eq!(
            stack.insert_layer(a, 0, solid("x", 1, 1, [0; 4])).err(),
            Some(CoreError::NotAGroup(a))
        );
        let g = stack.insert_layer(root, 1, Layer::new_group("g")).unwrap();
        stack.set_locked(g, true);
        assert_eq!(
            stack.insert_layer(g, 0, solid("x", 1, 1, [0; 4])).err(),
            Some(CoreError::Locked(g))
        );
    }

    #[test]
    fn reinserting_a_present_layer_is_a_cycle() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let g = stack.insert_layer(root, 0, Layer::new_group("g")).unwrap();
        let copy_of_g = stack.layer(g).unwrap().clone();
        assert!(matches!(
            stack.insert_layer(g, 0, copy_of_g),
            Err(CoreError::Cycle { .. })
        ));
    }

    #[test]
    fn move_into_descendant_is_cycle_and_leaves_tree_unchanged() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let outer = stack.insert_layer(root, 0, Layer::new_group("outer")).unwrap();
        let inner = stack.insert_layer(outer, 0, Layer::new_group("inner")).unwrap();
        let before = stack.describe_tree();
        assert!(matches!(
            stack.move_layer(outer, inner, 0),
            Err(CoreError::Cycle { .. })
        ));
        assert!(matches!(stack.move_layer(outer, outer, 0), Err(CoreError::Cycle { .. })));
        assert_eq!(stack.describe_tree(), before);
    }

    #[test]
    fn move_reorders_within_parent_using_final_index() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let a = stack.insert_layer(root, 0, solid("a", 1, 1, [0; 4])).unwrap();
        stack.insert_layer(root, 1, solid("b", 1, 1, [0; 4])).unwrap();
        stack.insert_layer(root, 2, solid("c", 1, 1, [0; 4])).unwrap();
        stack.move_layer(a, root, 2).unwrap();
        assert_eq!(child_names(&stack, root), ["b", "c", "a"]);
    }

    #[test]
    fn move_out_of_locked_group_is_rejected() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let g = stack.insert_layer(root, 0, Layer::new_group("g")).unwrap();
        let a = stack.insert_layer(g, 0, solid("a", 1, 1, [0; 4])).unwrap();
        stack.set_locked(g, true);
        assert_eq!(stack.move_layer(a, root, 0).err(), Some(CoreError::Locked(a)));
        assert_eq!(stack.position_of(a), Some((g, 0)));
    }

    #[test]
    fn delete_picks_sibling_above_then_below_then_parent() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let g = stack.insert_layer(root, 0, Layer::new_group("g")).unwrap();
        let a = stack.insert_layer(g, 0, solid("a", 1, 1, [0; 4])).unwrap();
        let b = stack.insert_layer(g, 1, solid("b", 1, 1, [0; 4])).unwrap();
        let c = stack.insert_layer(g, 2, solid("c", 1, 1, [0; 4])).unwrap();

        stack.set_active_layer(b).unwrap();
        stack.delete_layer(b).unwrap();
        assert_eq!(stack.active_layer_id(), c);
        stack.delete_layer(c).unwrap();
        assert_eq!(stack.active_layer_id(), a);
        stack.delete_layer(a).unwrap();
        assert_eq!(stack.active_layer_id(), g);
    }

    #[test]
    fn delete_removes_whole_subtree() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let g = stack.insert_layer(root, 0, Layer::new_group("g")).unwrap();
        let a = stack.insert_layer(g, 0, solid("a", 1, 1, [0; 4])).unwrap();
        stack.set_active_layer(a).unwrap();
        let removed = stack.delete_layer(g).unwrap();
        assert_eq!(removed.subtree_len(), 2);
        assert!(!stack.contains(a));
        assert_eq!(stack.active_layer_id(), root);
        assert_eq!(stack.layer_count(), 0);
    }

    #[test]
    fn merge_onto_locked_lower_fails_and_keeps_count() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let low = stack.insert_layer(root, 0, solid("low", 4, 4, [0, 0, 255, 255])).unwrap();
        let up = stack.insert_layer(root, 1, solid("up", 4, 4, [255, 0, 0, 255])).unwrap();
        stack.set_locked(low, true);
        let count = stack.layer_count();
        assert!(matches!(stack.merge_down(up), Err(CoreError::Merge { .. })));
        assert_eq!(stack.layer_count(), count);
    }

    #[test]
    fn merge_requires_layer_below_and_visibility() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let low = stack.insert_layer(root, 0, solid("low", 4, 4, [0, 0, 255, 255])).unwrap();
        let up = stack.insert_layer(root, 1, solid("up", 4, 4, [255, 0, 0, 255])).unwrap();
        assert!(matches!(stack.merge_down(low), Err(CoreError::Merge { .. })));
        stack.set_visible(low, false);
        assert!(matches!(stack.merge_down(up), Err(CoreError::Merge { .. })));
    }

    #[test]
    fn merge_skips_hidden_siblings_below() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let low = stack.insert_layer(root, 0, solid("low", 4, 4, [0, 0, 255, 255])).unwrap();
        let hidden = stack.insert_layer(root, 1, solid("hidden", 4, 4, [0, 255, 0, 255])).unwrap();
        let up = stack.insert_layer(root, 2, solid("up", 4, 4, [255, 0, 0, 255])).unwrap();
        stack.set_visible(hidden, false);

        let merged = stack.merge_down(up).unwrap();
        assert_eq!(stack.path_of(merged), Some(vec![0]));
        assert_eq!(stack.path_of(hidden), Some(vec![1]));
        assert!(!stack.contains(low));
        assert_eq!(stack.layer(merged).unwrap().name, "low");
        assert_eq!(*stack.layer(merged).unwrap().pixels().unwrap().get_pixel(1, 1), Rgba([255, 0, 0, 255]));

        let top = stack.insert_layer(root, 2, solid("top", 4, 4, [9, 9, 9, 255])).unwrap();
        stack.set_locked(merged, true);
        let count = stack.layer_count();
        assert!(matches!(stack.merge_down(top), Err(CoreError::Merge { .. })));
        assert_eq!(stack.layer_count(), count);
    }

    #[test]
    fn merge_blends_upper_into_lower_position() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let low = stack.insert_layer(root, 0, solid("low", 4, 4, [0, 0, 255, 255])).unwrap();
        let up = stack.insert_layer(root, 1, solid("up", 2, 2, [255, 0, 0, 255])).unwrap();
        stack.set_opacity(up, 0.5);
        stack.set_opacity(low, 0.8);
        stack.set_active_layer(up).unwrap();
        let merged = stack.merge_down(up).unwrap();
        assert_eq!(stack.layer_count(), 1);
        assert_eq!(stack.active_layer_id(), merged);
        let m = stack.layer(merged).unwrap();
        assert_eq!(m.name, "low");
        assert_eq!(m.opacity(), 0.8);
        assert_eq!(*m.pixels().unwrap().get_pixel(0, 0), Rgba([128, 0, 128, 255]));
        assert_eq!(*m.pixels().unwrap().get_pixel(3, 3), Rgba([0, 0, 255, 255]));
    }

    #[test]
    fn attribute_setters_respect_ancestor_locks() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let g = stack.insert_layer(root, 0, Layer::new_group("g")).unwrap();
        let a = stack.insert_layer(g, 0, solid("a", 1, 1, [0; 4])).unwrap();
        stack.set_locked(g, true);
        assert!(!stack.set_opacity(a, 0.3));
        assert!(!stack.set_blend_mode(a, BlendMode::Screen));
        assert!(!stack.rename_layer(a, "renamed"));
        assert!(stack.set_locked(a, true));
        assert_eq!(stack.layer(a).unwrap().opacity(), 1.0);
        stack.set_locked(g, false);
        assert!(!stack.set_visible(a, false));
        stack.set_locked(a, false);
        assert!(stack.set_visible(a, false));
    }

    #[test]
    fn set_active_requires_presence_and_drops_pending() {
        let mut stack = LayerStack::with_background(4, 4, Rgba([255; 4])).unwrap();
        let bg = stack.active_layer_id();
        stack.begin_edit().unwrap();
        assert!(stack.pending_edit().is_some());
        let root = stack.root_id();
        stack.set_active_layer(root).unwrap();
        assert!(stack.pending_edit().is_none());
        assert_eq!(
            stack.set_active_layer(LayerId::from_raw(u64::MAX)).err(),
            Some(CoreError::LayerNotFound(LayerId::from_raw(u64::MAX)))
        );
        stack.set_active_layer(bg).unwrap();
    }

    #[test]
    fn pending_edit_previews_and_commits() {
        let mut stack = LayerStack::with_background(4, 4, Rgba([255, 255, 255, 255])).unwrap();
        let bg = stack.active_layer_id();
        stack.begin_edit().unwrap();
        stack.pending_edit_mut().unwrap().put_pixel(1, 1, Rgba([0, 0, 0, 255]));
        let preview = compositor::composite(&stack);
        assert_eq!(*preview.get_pixel(1, 1), Rgba([0, 0, 0, 255]));
        assert_eq!(*stack.layer(bg).unwrap().pixels().unwrap().get_pixel(1, 1), Rgba([255; 4]));
        assert!(stack.commit_edit().unwrap());
        assert_eq!(*stack.layer(bg).unwrap().pixels().unwrap().get_pixel(1, 1), Rgba([0, 0, 0, 255]));
        assert!(!stack.commit_edit().unwrap());
    }

    #[test]
    fn begin_edit_on_group_or_hidden_layer_fails() {
        let mut stack = LayerStack::with_background(4, 4, Rgba([255; 4])).unwrap();
        let bg = stack.active_layer_id();
        stack.set_visible(bg, false);
        assert_eq!(stack.begin_edit().err(), Some(CoreError::InvisibleLayer(bg)));
        let root = stack.root_id();
        stack.set_active_layer(root).unwrap();
        assert_eq!(stack.begin_edit().err(), Some(CoreError::NotRaster(root)));
    }

    #[test]
    fn flatten_group_keeps_composite_for_passthrough_normal_children() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        stack.insert_layer(root, 0, solid("bg", 4, 4, [20, 40, 60, 255])).unwrap();
        let g = stack.insert_layer(root, 1, Layer::new_group("g").with_isolate(false)).unwrap();
        stack.insert_layer(g, 0, solid("a", 2, 2, [200, 0, 0, 128]).with_position(1, 1)).unwrap();
        stack.insert_layer(g, 1, solid("b", 2, 3, [0, 200, 0, 255])).unwrap();
        let before = compositor::composite(&stack);
        stack.flatten_group(g).unwrap();
        assert_eq!(stack.layer(g).unwrap().kind(), LayerKind::Image);
        assert_eq!(compositor::composite(&stack), before);
    }

    #[test]
    fn flatten_image_collapses_to_background() {
        let mut stack = LayerStack::with_background(3, 3, Rgba([10, 20, 30, 255])).unwrap();
        let root = stack.root_id();
        stack.insert_layer(root, 1, solid("top", 1, 1, [255, 0, 0, 255])).unwrap();
        let before = compositor::composite(&stack);
        let id = stack.flatten_image().unwrap();
        assert_eq!(stack.layer_count(), 1);
        assert_eq!(stack.active_layer_id(), id);
        assert_eq!(compositor::composite(&stack), before);
    }

    #[test]
    fn bake_transform_resamples_and_resets() {
        let mut stack = LayerStack::new(8, 8).unwrap();
        let root = stack.root_id();
        let a = stack.insert_layer(root, 0, solid("a", 2, 2, [9, 9, 9, 255])).unwrap();
        let t = LayerTransform::new(Point::new(3.0, 1.0), Point::new(2.0, 2.0), 0.0, Point::ZERO).unwrap();
        stack.set_transform(a, t).unwrap();
        stack.bake_transform(a).unwrap();
        let l = stack.layer(a).unwrap();
        assert!(l.transform().is_identity());
        assert_eq!(l.position(), (3, 1));
        assert_eq!(l.content_size(), (4, 4));
        assert_eq!(*compositor::composite(&stack).get_pixel(4, 2), Rgba([9, 9, 9, 255]));
    }

    #[test]
    fn text_layer_renders_lazily_and_converts() {
        let mut stack = LayerStack::new(8, 2).unwrap();
        stack.set_text_engine(Arc::new(BlockRasterizer::new()));
        let root = stack.root_id();
        let style = TextStyle {
            color: [255, 0, 0, 255],
            ..TextStyle::default()
        };
        let t = stack
            .insert_layer(root, 0, Layer::new_text("t", TextContent::new("abc", style.clone())))
            .unwrap();
        let img = compositor::composite(&stack);
        assert_eq!(*img.get_pixel(2, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(img.get_pixel(3, 0)[3], 0);

        stack.set_text(t, TextContent::new("abcde", style.clone())).unwrap();
        assert_eq!(compositor::composite(&stack).get_pixel(4, 0)[3], 255);

        let huge = TextStyle { font_size: 20_000.0, ..style };
        assert!(matches!(stack.set_text(t, TextContent::new("WWWW", huge)), Err(CoreError::Bounds(_))));
        assert_eq!(stack.layer(t).unwrap().text().unwrap().content().text, "abcde");

        stack.convert_to_image(t).unwrap();
        assert_eq!(stack.layer(t).unwrap().kind(), LayerKind::Image);
        assert_eq!(stack.set_text(t, TextContent::default()).err(), Some(CoreError::NotText(t)));
    }

    #[test]
    fn dirty_rect_accumulates_and_resets() {
        let mut stack = LayerStack::new(10, 10).unwrap();
        stack.take_dirty();
        let root = stack.root_id();
        stack.insert_layer(root, 0, solid("a", 2, 2, [1, 1, 1, 255]).with_position(1, 1)).unwrap();
        stack.insert_layer(root, 1, solid("b", 2, 2, [1, 1, 1, 255]).with_position(6, 6)).unwrap();
        assert_eq!(stack.take_dirty(), Some(PixelRect::new(1, 1, 7, 7)));
        assert_eq!(stack.take_dirty(), None);
    }

    #[test]
    fn duplicate_goes_directly_above() {
        let mut stack = LayerStack::new(4, 4).unwrap();
        let root = stack.root_id();
        let a = stack.insert_layer(root, 0, solid("a", 1, 1, [0; 4])).unwrap();
        stack.insert_layer(root, 1, solid("b", 1, 1, [0; 4])).unwrap();
        let copy = stack.duplicate_layer(a).unwrap();
        assert_eq!(child_names(&stack, root), ["a", "a Copy", "b"]);
        assert_eq!(stack.position_of(copy), Some((root, 1)));
    }
}
