//! Flattening of a layer tree into a raster.
//!
//! All work happens on premultiplied f32 buffers covering exactly the
//! requested canvas region, so recompositing a dirty rectangle produces the
//! same pixels as cropping a full composite.

use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use std::sync::{mpsc, Arc};

use crate::blend::{self, BlendMode, Premul, TRANSPARENT};
use crate::error::{CoreError, CoreResult};
use crate::geometry::PixelRect;
use crate::layer::{Layer, LayerContent, LayerKind};
use crate::ops::text::TextRasterizer;
use crate::ops::transform::sample_into;
use crate::ops::CancelToken;
use crate::stack::{LayerStack, PendingEdit};
use crate::tiled::TiledImage;
use crate::transform::Affine;

/// Premultiplied RGBA pixels for one canvas-space rectangle.
#[derive(Clone, Debug, PartialEq)]
pub struct PremulBuffer {
    region: PixelRect,
    data: Vec<Premul>,
}

impl PremulBuffer {
    pub fn new(region: PixelRect) -> Self {
        Self::filled(region, TRANSPARENT)
    }

    pub fn filled(region: PixelRect, color: Premul) -> Self {
        Self {
            region,
            data: vec![color; region.area() as usize],
        }
    }

    pub fn region(&self) -> PixelRect {
        self.region
    }

    pub fn data(&self) -> &[Premul] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [Premul] {
        &mut self.data
    }

    /// Pixel at canvas coordinates, if inside the region.
    pub fn get(&self, x: i32, y: i32) -> Option<Premul> {
        if !self.region.contains(x, y) {
            return None;
        }
        let idx = (y - self.region.y) as usize * self.region.width as usize + (x - self.region.x) as usize;
        Some(self.data[idx])
    }

    /// Composite `src` (same region) onto `self`.
    pub fn composite_from(&mut self, src: &PremulBuffer, mode: BlendMode, opacity: f32) {
        debug_assert_eq!(self.region, src.region);
        if opacity <= 0.0 {
            return;
        }
        self.data
            .par_iter_mut()
            .zip(src.data.par_iter())
            .for_each(|(d, s)| blend::composite(d, *s, mode, opacity));
    }

    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut out = RgbaImage::new(self.region.width, self.region.height);
        for (px, p) in out.pixels_mut().zip(self.data.iter()) {
            *px = blend::unpremultiply(*p);
        }
        out
    }

    /// Quantized copy whose local (0, 0) is the region's top-left.
    pub fn to_tiled(&self) -> TiledImage {
        if self.region.is_empty() {
            return TiledImage::new(1, 1);
        }
        TiledImage::from_rgba_image(&self.to_rgba_image())
    }
}

/// Inputs shared by one compositing pass.
pub(crate) struct RenderCtx<'a> {
    engine: Option<&'a dyn TextRasterizer>,
    pending: Option<&'a PendingEdit>,
    cancel: Option<&'a CancelToken>,
}

impl<'a> RenderCtx<'a> {
    pub(crate) fn new(engine: Option<&'a dyn TextRasterizer>) -> Self {
        Self {
            engine,
            pending: None,
            cancel: None,
        }
    }

    fn for_stack(stack: &'a LayerStack, cancel: Option<&'a CancelToken>) -> Self {
        Self {
            engine: stack.text_engine(),
            pending: stack.pending_edit(),
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(CancelToken::is_cancelled)
    }
}

/// Canvas footprint of `layer` given the transform of its parent.
fn canvas_extent(layer: &Layer, parent_to_canvas: &Affine) -> PixelRect {
    let ext = layer.extent();
    if ext.is_empty() {
        return ext;
    }
    parent_to_canvas
        .then_after(&Affine::translate(ext.x as f32, ext.y as f32))
        .map_rect(ext.width, ext.height)
}

/// A layer's own content (pre-opacity, pre-blend) over `region`. Groups
/// composite their children onto a transparent buffer.
pub(crate) fn render_content(layer: &Layer, parent_to_canvas: &Affine, region: PixelRect, ctx: &RenderCtx) -> PremulBuffer {
    let mut buf = PremulBuffer::new(region);
    if ctx.cancelled() {
        return buf;
    }
    let m = parent_to_canvas.then_after(&layer.local_affine());
    match &layer.content {
        LayerContent::Image(pixels) => {
            sample_into(pixels, &m, &mut buf);
            if let Some(pending) = ctx.pending.filter(|p| p.layer == layer.id()) {
                let mut preview = PremulBuffer::new(region);
                sample_into(&pending.pixels, &m, &mut preview);
                buf.composite_from(&preview, BlendMode::Normal, 1.0);
            }
        }
        LayerContent::Text(text) => {
            if let Some(raster) = text.raster(ctx.engine) {
                sample_into(&raster, &m, &mut buf);
            }
        }
        LayerContent::Group(group) => {
            for child in &group.children {
                composite_node(&mut buf, child, &m, ctx);
            }
        }
    }
    buf
}

/// Composite `layer` onto `dst` with its opacity and blend mode, honouring
/// group isolation. Hidden and locked layers contribute nothing.
pub(crate) fn composite_node(dst: &mut PremulBuffer, layer: &Layer, parent_to_canvas: &Affine, ctx: &RenderCtx) {
    if !layer.is_visible() || layer.is_locked() || layer.opacity() <= 0.0 || ctx.cancelled() {
        return;
    }
    if layer.kind() != LayerKind::Text && canvas_extent(layer, parent_to_canvas).intersect(&dst.region()).is_none() {
        return;
    }
    match &layer.content {
        LayerContent::Group(group) if !group.isolate => {
            let m = parent_to_canvas.then_after(&layer.local_affine());
            let mut working = dst.clone();
            for child in &group.children {
                composite_node(&mut working, child, &m, ctx);
            }
            dst.composite_from(&working, layer.blend_mode(), layer.opacity());
        }
        _ => {
            let src = render_content(layer, parent_to_canvas, dst.region(), ctx);
            dst.composite_from(&src, layer.blend_mode(), layer.opacity());
        }
    }
}

fn composite_buffer(stack: &LayerStack, region: PixelRect, background: Option<Rgba<u8>>, cancel: Option<&CancelToken>) -> PremulBuffer {
    let ctx = RenderCtx::for_stack(stack, cancel);
    let mut dst = match background {
        Some(bg) => PremulBuffer::filled(region, blend::premultiply(bg)),
        None => PremulBuffer::new(region),
    };
    composite_node(&mut dst, stack.root(), &Affine::IDENTITY, &ctx);
    dst
}

fn clip_to_canvas(stack: &LayerStack, rect: PixelRect) -> CoreResult<PixelRect> {
    rect.intersect(&stack.canvas_rect())
        .ok_or_else(|| CoreError::bounds(format!("region {rect:?} does not overlap the canvas")))
}

/// Full-canvas composite onto a transparent page.
pub fn composite(stack: &LayerStack) -> RgbaImage {
    composite_buffer(stack, stack.canvas_rect(), None, None).to_rgba_image()
}

/// Composite only `rect` (clipped to the canvas). The result is pixel-identical
/// to the same crop of [`composite`].
pub fn composite_region(stack: &LayerStack, rect: PixelRect) -> CoreResult<RgbaImage> {
    let rect = clip_to_canvas(stack, rect)?;
    Ok(composite_buffer(stack, rect, None, None).to_rgba_image())
}

/// Composite `rect` over a solid page colour.
pub fn composite_with_background(stack: &LayerStack, rect: PixelRect, background: Rgba<u8>) -> CoreResult<RgbaImage> {
    let rect = clip_to_canvas(stack, rect)?;
    Ok(composite_buffer(stack, rect, Some(background), None).to_rgba_image())
}

/// Premultiplied composite, for callers that keep blending.
pub fn composite_premul(stack: &LayerStack, rect: PixelRect) -> CoreResult<PremulBuffer> {
    let rect = clip_to_canvas(stack, rect)?;
    Ok(composite_buffer(stack, rect, None, None))
}

// ---- background composites ---------------------------------------------------

/// Immutable, cheaply cloned view of a stack for off-thread compositing.
/// Pixel chunks are shared copy-on-write with the live stack, so later edits
/// never reach a snapshot.
#[derive(Clone)]
pub struct StackSnapshot(Arc<LayerStack>);

impl StackSnapshot {
    pub fn new(stack: &LayerStack) -> Self {
        StackSnapshot(Arc::new(stack.clone()))
    }

    pub fn stack(&self) -> &LayerStack {
        &self.0
    }
}

/// Composite running on the rayon pool against a snapshot.
pub struct CompositeJob {
    token: CancelToken,
    rx: mpsc::Receiver<CoreResult<RgbaImage>>,
}

impl CompositeJob {
    /// Start compositing `region` (the whole canvas when `None`).
    pub fn spawn(snapshot: StackSnapshot, region: Option<PixelRect>) -> Self {
        let token = CancelToken::new();
        let job_token = token.clone();
        let (tx, rx) = mpsc::channel();
        rayon::spawn(move || {
            let stack = snapshot.stack();
            let result = clip_to_canvas(stack, region.unwrap_or_else(|| stack.canvas_rect())).and_then(|rect| {
                let buf = composite_buffer(stack, rect, None, Some(&job_token));
                job_token.check()?;
                Ok(buf.to_rgba_image())
            });
            if let Err(e) = &result {
                tracing::debug!("background composite ended early: {e}");
            }
            let _ = tx.send(result);
        });
        Self { token, rx }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<CoreResult<RgbaImage>> {
        self.rx.try_recv().ok()
    }

    pub fn wait(self) -> CoreResult<RgbaImage> {
        self.rx.recv().unwrap_or(Err(CoreError::Cancelled))
    }
}
