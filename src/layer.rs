use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use image::Rgba;

use crate::blend::BlendMode;
use crate::compositor::{self, PremulBuffer};
use crate::error::{CoreError, CoreResult};
use crate::geometry::PixelRect;
use crate::ops::text::{TextContent, TextData, TextRasterizer};
use crate::tiled::TiledImage;
use crate::transform::{Affine, LayerTransform};

static NEXT_LAYER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique layer identity. Ids are never reused within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(u64);

impl LayerId {
    pub fn next() -> Self {
        LayerId(NEXT_LAYER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn from_raw(raw: u64) -> Self {
        LayerId(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct GroupData {
    /// Bottom-most child first.
    pub children: Vec<Layer>,
    pub isolate: bool,
}

#[derive(Clone, Debug)]
pub enum LayerContent {
    Image(TiledImage),
    Text(TextData),
    Group(GroupData),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Image,
    Text,
    Group,
}

impl LayerKind {
    pub fn label(&self) -> &'static str {
        match self {
            LayerKind::Image => "image",
            LayerKind::Text => "text",
            LayerKind::Group => "group",
        }
    }
}

/// One node of the layer tree.
///
/// Position is the pre-transform top-left of the content in the parent's
/// space; the transform then places the content around its origin. Groups
/// carry the same placement and apply it to all their children.
#[derive(Clone, Debug)]
pub struct Layer {
    id: LayerId,
    pub name: String,
    pub(crate) opacity: f32,
    pub(crate) blend_mode: BlendMode,
    pub(crate) visible: bool,
    pub(crate) locked: bool,
    pub(crate) alpha_locked: bool,
    pub(crate) position: (i32, i32),
    pub(crate) transform: LayerTransform,
    pub(crate) parent: Option<LayerId>,
    pub(crate) content: LayerContent,
}

impl Layer {
    fn with_content(name: impl Into<String>, content: LayerContent) -> Self {
        Self {
            id: LayerId::next(),
            name: name.into(),
            opacity: 1.0,
            blend_mode: BlendMode::Normal,
            visible: true,
            locked: false,
            alpha_locked: false,
            position: (0, 0),
            transform: LayerTransform::identity(),
            parent: None,
            content,
        }
    }

    pub fn new_image(name: impl Into<String>, pixels: TiledImage) -> Self {
        Self::with_content(name, LayerContent::Image(pixels))
    }

    /// Image layer of the given size filled with `fill`. Zero area fails.
    pub fn new_filled(name: impl Into<String>, width: u32, height: u32, fill: Rgba<u8>) -> CoreResult<Self> {
        if width == 0 || height == 0 {
            return Err(CoreError::bounds(format!("{width}x{height} layer")));
        }
        if width as u64 * height as u64 > crate::tiled::MAX_PIXELS {
            return Err(CoreError::bounds(format!("{width}x{height} exceeds pixel limit")));
        }
        Ok(Self::new_image(name, TiledImage::new_filled(width, height, fill)))
    }

    pub fn new_text(name: impl Into<String>, content: TextContent) -> Self {
        Self::with_content(name, LayerContent::Text(TextData::new(content)))
    }

    pub fn new_group(name: impl Into<String>) -> Self {
        Self::with_content(
            name,
            LayerContent::Group(GroupData {
                children: Vec::new(),
                isolate: true,
            }),
        )
    }

    pub fn with_position(mut self, x: i32, y: i32) -> Self {
        self.position = (x, y);
        self
    }

    pub fn with_transform(mut self, transform: LayerTransform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_child(mut self, child: Layer) -> Self {
        if let LayerContent::Group(g) = &mut self.content {
            g.children.push(child);
        }
        self
    }

    pub fn with_isolate(mut self, isolate: bool) -> Self {
        if let LayerContent::Group(g) = &mut self.content {
            g.isolate = isolate;
        }
        self
    }

    // ---- accessors ----------------------------------------------------------

    pub fn id(&self) -> LayerId {
        self.id
    }

    pub fn kind(&self) -> LayerKind {
        match self.content {
            LayerContent::Image(_) => LayerKind::Image,
            LayerContent::Text(_) => LayerKind::Text,
            LayerContent::Group(_) => LayerKind::Group,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.content, LayerContent::Group(_))
    }

    pub fn opacity(&self) -> f32 {
        self.opacity
    }

    pub fn blend_mode(&self) -> BlendMode {
        self.blend_mode
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn is_alpha_locked(&self) -> bool {
        self.alpha_locked
    }

    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn transform(&self) -> &LayerTransform {
        &self.transform
    }

    pub fn parent(&self) -> Option<LayerId> {
        self.parent
    }

    pub fn content(&self) -> &LayerContent {
        &self.content
    }

    pub fn pixels(&self) -> Option<&TiledImage> {
        match &self.content {
            LayerContent::Image(p) => Some(p),
            _ => None,
        }
    }

    pub(crate) fn pixels_mut(&mut self) -> Option<&mut TiledImage> {
        match &mut self.content {
            LayerContent::Image(p) => Some(p),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&TextData> {
        match &self.content {
            LayerContent::Text(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn text_mut(&mut self) -> Option<&mut TextData> {
        match &mut self.content {
            LayerContent::Text(t) => Some(t),
            _ => None,
        }
    }

    pub fn children(&self) -> &[Layer] {
        match &self.content {
            LayerContent::Group(g) => &g.children,
            _ => &[],
        }
    }

    pub(crate) fn children_mut(&mut self) -> Option<&mut Vec<Layer>> {
        match &mut self.content {
            LayerContent::Group(g) => Some(&mut g.children),
            _ => None,
        }
    }

    pub fn isolate(&self) -> Option<bool> {
        match &self.content {
            LayerContent::Group(g) => Some(g.isolate),
            _ => None,
        }
    }

    /// Image layers that are unlocked and visible accept brush strokes.
    /// Ancestor locks are checked by the stack.
    pub fn accepts_drawing(&self) -> bool {
        matches!(self.content, LayerContent::Image(_)) && self.visible && !self.locked
    }

    // ---- attribute setters --------------------------------------------------
    // These only honour this layer's own lock; `LayerStack` also checks
    // ancestors. Each returns whether the change was applied.

    pub fn set_opacity(&mut self, opacity: f32) -> bool {
        if self.locked || !opacity.is_finite() {
            return false;
        }
        self.opacity = opacity.clamp(0.0, 1.0);
        true
    }

    pub fn set_blend_mode(&mut self, mode: BlendMode) -> bool {
        if self.locked {
            return false;
        }
        self.blend_mode = mode;
        true
    }

    pub fn set_visible(&mut self, visible: bool) -> bool {
        if self.locked {
            return false;
        }
        self.visible = visible;
        true
    }

    pub fn set_locked(&mut self, locked: bool) -> bool {
        self.locked = locked;
        true
    }

    /// Only image layers carry alpha lock.
    pub fn set_alpha_locked(&mut self, alpha_locked: bool) -> bool {
        if self.locked || !matches!(self.content, LayerContent::Image(_)) {
            return false;
        }
        self.alpha_locked = alpha_locked;
        true
    }

    /// Reset the transform to identity. The bounds fall back to the native
    /// content size since they are derived from the content.
    pub fn clear_transform(&mut self) {
        self.transform.clear();
    }

    // ---- geometry -----------------------------------------------------------

    /// Untransformed content size. Text reports its cached raster, groups the
    /// extent of their children.
    pub fn content_size(&self) -> (u32, u32) {
        match &self.content {
            LayerContent::Image(p) => (p.width(), p.height()),
            LayerContent::Text(t) => t.cached_raster().map_or((0, 0), |r| (r.width(), r.height())),
            LayerContent::Group(_) => {
                let r = self.children_extent();
                (r.width, r.height)
            }
        }
    }

    /// Pre-transform bounds in the parent's space: position plus content size.
    pub fn bounds(&self) -> PixelRect {
        let (w, h) = self.content_size();
        PixelRect::new(self.position.0, self.position.1, w, h)
    }

    /// Local content space to the parent's space.
    pub fn local_affine(&self) -> Affine {
        Affine::translate(self.position.0 as f32, self.position.1 as f32).then_after(&self.transform.to_affine())
    }

    fn children_extent(&self) -> PixelRect {
        self.children()
            .iter()
            .fold(PixelRect::default(), |acc, c| acc.union(&c.extent()))
    }

    /// Transformed footprint in the parent's space.
    pub fn extent(&self) -> PixelRect {
        let m = self.local_affine();
        match &self.content {
            LayerContent::Group(_) => {
                let inner = self.children_extent();
                if inner.is_empty() {
                    return PixelRect::default();
                }
                let shifted = m.then_after(&Affine::translate(inner.x as f32, inner.y as f32));
                shifted.map_rect(inner.width, inner.height)
            }
            _ => {
                let (w, h) = self.content_size();
                if w == 0 || h == 0 {
                    return PixelRect::default();
                }
                m.map_rect(w, h)
            }
        }
    }

    // ---- tree helpers -------------------------------------------------------

    pub fn find(&self, id: LayerId) -> Option<&Layer> {
        if self.id == id {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(id))
    }

    pub fn contains(&self, id: LayerId) -> bool {
        self.find(id).is_some()
    }

    /// Ids of this layer and every descendant, pre-order.
    pub fn subtree_ids(&self) -> Vec<LayerId> {
        let mut out = Vec::new();
        self.collect_ids(&mut out);
        out
    }

    fn collect_ids(&self, out: &mut Vec<LayerId>) {
        out.push(self.id);
        for c in self.children() {
            c.collect_ids(out);
        }
    }

    pub fn subtree_len(&self) -> usize {
        1 + self.children().iter().map(Layer::subtree_len).sum::<usize>()
    }

    pub fn depth(&self) -> usize {
        1 + self.children().iter().map(Layer::depth).max().unwrap_or(0)
    }

    /// Set `parent` on this layer and point every descendant at its container.
    pub(crate) fn adopt(&mut self, parent: Option<LayerId>) {
        self.parent = parent;
        let id = self.id;
        if let Some(children) = self.children_mut() {
            for c in children {
                c.adopt(Some(id));
            }
        }
    }

    /// Deep copy with fresh ids throughout the subtree.
    pub fn duplicate(&self) -> Layer {
        let mut copy = self.clone();
        copy.reassign_ids();
        copy.adopt(self.parent);
        copy
    }

    pub(crate) fn reassign_ids(&mut self) {
        self.id = LayerId::next();
        if let Some(children) = self.children_mut() {
            for c in children {
                c.reassign_ids();
            }
        }
    }

    pub fn memory_bytes(&self) -> usize {
        let own = match &self.content {
            LayerContent::Image(p) => p.memory_bytes(),
            LayerContent::Text(t) => t.memory_bytes(),
            LayerContent::Group(_) => 0,
        };
        own + std::mem::size_of::<Layer>() + self.children().iter().map(Layer::memory_bytes).sum::<usize>()
    }

    // ---- rendering ----------------------------------------------------------

    /// This layer's own content (before its opacity and blend mode) over
    /// `region` of the parent's space. Groups return their children composited
    /// in isolation.
    pub fn render_to_buffer(&self, region: PixelRect, engine: Option<&dyn TextRasterizer>) -> PremulBuffer {
        compositor::render_content(self, &Affine::IDENTITY, region, &compositor::RenderCtx::new(engine))
    }

    /// One-way conversion to an image layer. Text is rasterized (using the
    /// cache or `engine`), groups are flattened into their extent. Attributes
    /// and id are kept; the transform is kept for text and dropped for groups
    /// since flattening already applies it.
    pub fn convert_to_image(&self, engine: Option<&dyn TextRasterizer>) -> CoreResult<Layer> {
        match &self.content {
            LayerContent::Image(_) => Ok(self.clone()),
            LayerContent::Text(t) => {
                let raster = t.raster(engine).ok_or(CoreError::NotRaster(self.id))?;
                let mut out = self.clone();
                out.content = LayerContent::Image((*raster).clone());
                Ok(out)
            }
            LayerContent::Group(_) => {
                let extent = self.extent();
                let mut out = self.clone();
                out.transform = LayerTransform::identity();
                if extent.is_empty() {
                    out.position = self.position;
                    out.content = LayerContent::Image(TiledImage::new(1, 1));
                    return Ok(out);
                }
                let buffer = self.render_to_buffer(extent, engine);
                out.position = (extent.x, extent.y);
                out.content = LayerContent::Image(buffer.to_tiled());
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Point;

    #[test]
    fn ids_are_unique_and_display_with_hash() {
        let a = LayerId::next();
        let b = LayerId::next();
        assert_ne!(a, b);
        assert_eq!(LayerId::from_raw(42).to_string(), "#42");
    }

    #[test]
    fn locked_layer_ignores_setters_except_lock() {
        let mut l = Layer::new_filled("a", 4, 4, Rgba([0, 0, 0, 255])).unwrap();
        assert!(l.set_locked(true));
        assert!(!l.set_opacity(0.2));
        assert!(!l.set_visible(false));
        assert_eq!(l.opacity(), 1.0);
        assert!(l.set_locked(false));
        assert!(l.set_opacity(2.0));
        assert_eq!(l.opacity(), 1.0);
    }

    #[test]
    fn alpha_lock_is_image_only() {
        let mut g = Layer::new_group("g");
        assert!(!g.set_alpha_locked(true));
        let mut i = Layer::new_filled("i", 1, 1, Rgba([0, 0, 0, 0])).unwrap();
        assert!(i.set_alpha_locked(true));
        assert!(i.is_alpha_locked());
    }

    #[test]
    fn zero_area_layer_is_rejected() {
        assert!(matches!(
            Layer::new_filled("z", 0, 3, Rgba([0, 0, 0, 0])),
            Err(CoreError::Bounds(_))
        ));
    }

    #[test]
    fn extent_follows_transform_and_clear_restores_native_bounds() {
        let mut l = Layer::new_filled("a", 10, 4, Rgba([1, 1, 1, 255])).unwrap().with_position(5, 5);
        l.transform
            .set(Point::new(0.0, 0.0), Point::new(2.0, 2.0), 0.0, Point::ZERO)
            .unwrap();
        assert_eq!(l.extent(), PixelRect::new(5, 5, 20, 8));
        assert_eq!(l.bounds(), PixelRect::new(5, 5, 10, 4));
        l.clear_transform();
        assert_eq!(l.extent(), l.bounds());
    }

    #[test]
    fn duplicate_assigns_fresh_ids() {
        let child = Layer::new_filled("c", 2, 2, Rgba([9, 9, 9, 255])).unwrap();
        let group = Layer::new_group("g").with_child(child);
        let copy = group.duplicate();
        assert_ne!(copy.id(), group.id());
        assert_ne!(copy.children()[0].id(), group.children()[0].id());
        assert_eq!(copy.children()[0].parent(), Some(copy.id()));
        assert_eq!(copy.children()[0].pixels(), group.children()[0].pixels());
    }

    #[test]
    fn group_converts_to_flattened_image() {
        let child = Layer::new_filled("c", 2, 2, Rgba([200, 10, 10, 255])).unwrap().with_position(3, 1);
        let group = Layer::new_group("g").with_child(child);
        let flat = group.convert_to_image(None).unwrap();
        assert_eq!(flat.kind(), LayerKind::Image);
        assert_eq!(flat.position(), (3, 1));
        assert_eq!(*flat.pixels().unwrap().get_pixel(1, 1), Rgba([200, 10, 10, 255]));
    }

    #[test]
    fn text_without_raster_cannot_convert() {
        let t = Layer::new_text("t", TextContent::default());
        assert_eq!(t.convert_to_image(None).err(), Some(CoreError::NotRaster(t.id())));
    }
}
