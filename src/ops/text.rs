use ab_glyph::{point, Font, FontArc, GlyphId, InvalidFont, ScaleFont};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{mpsc, Arc};

use super::CancelToken;
use crate::error::{CoreError, CoreResult};
use crate::stack::MAX_CANVAS_DIM;
use crate::tiled::{MAX_PIXELS, TiledImage};

/// Largest accepted font size in pixels.
pub const MAX_FONT_SIZE: f32 = 2048.0;

/// Rasterized glyph coverage keyed by (glyph, size bits). Pixels are stored
/// relative to the glyph's pixel-bounds minimum at origin (0, 0).
type GlyphPixelCache = HashMap<(GlyphId, u32), (Vec<(u32, u32, f32)>, f32, f32)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TextAlignment {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TextStyle {
    pub font_size: f32,
    pub color: [u8; 4],
    pub alignment: TextAlignment,
    pub anti_alias: bool,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            font_size: 32.0,
            color: [0, 0, 0, 255],
            alignment: TextAlignment::Left,
            anti_alias: true,
            bold: false,
            italic: false,
            underline: false,
            strikethrough: false,
        }
    }
}

impl TextStyle {
    /// `Bounds` for a non-finite font size or one outside `1..=MAX_FONT_SIZE`.
    pub fn validate(&self) -> CoreResult<()> {
        if !self.font_size.is_finite() || !(1.0..=MAX_FONT_SIZE).contains(&self.font_size) {
            return Err(CoreError::bounds(format!(
                "font size {} outside 1..={MAX_FONT_SIZE}",
                self.font_size
            )));
        }
        Ok(())
    }
}

/// Size of a text raster, checked against the canvas and pixel limits before
/// anything is allocated.
pub fn checked_raster_size(width: f32, height: f32) -> CoreResult<(u32, u32)> {
    let fits = |v: f32| v.is_finite() && v <= MAX_CANVAS_DIM as f32;
    if !fits(width) || !fits(height) {
        return Err(CoreError::bounds(format!("text raster {width}x{height} exceeds {MAX_CANVAS_DIM}")));
    }
    let (w, h) = (width.ceil().max(1.0) as u32, height.ceil().max(1.0) as u32);
    if w as u64 * h as u64 > MAX_PIXELS {
        return Err(CoreError::bounds(format!("text raster {w}x{h} exceeds {MAX_PIXELS} pixels")));
    }
    Ok((w, h))
}

/// Editable text of a text layer. Lines are separated by `'\n'`.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct TextContent {
    pub text: String,
    pub style: TextStyle,
}

impl TextContent {
    pub fn new(text: impl Into<String>, style: TextStyle) -> Self {
        Self { text: text.into(), style }
    }
}

/// Turns text content into pixels. The result's top-left is the text layer's
/// local origin. Implementations poll `cancel` and bail with `Cancelled`.
pub trait TextRasterizer: Send + Sync {
    fn rasterize(&self, content: &TextContent, cancel: &CancelToken) -> CoreResult<TiledImage>;
}

/// `TextRasterizer` backed by a single ab_glyph font.
pub struct GlyphRasterizer {
    font: FontArc,
    glyph_cache: Mutex<GlyphPixelCache>,
}

impl GlyphRasterizer {
    pub fn new(font: FontArc) -> Self {
        Self {
            font,
            glyph_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_bytes(data: Vec<u8>) -> Result<Self, InvalidFont> {
        Ok(Self::new(FontArc::try_from_vec(data)?))
    }

    /// Lay out one line; glyph x positions include the alignment offset.
    fn layout_line(&self, text: &str, font_size: f32, alignment: TextAlignment) -> (Vec<(GlyphId, f32)>, f32) {
        let scaled = self.font.as_scaled(font_size);
        let mut glyphs = Vec::new();
        let mut cursor_x = 0.0f32;
        let mut last: Option<GlyphId> = None;
        for ch in text.chars() {
            let id = self.font.glyph_id(ch);
            if let Some(prev) = last {
                cursor_x += scaled.kern(prev, id);
            }
            glyphs.push((id, cursor_x));
            cursor_x += scaled.h_advance(id);
            last = Some(id);
        }
        let shift = align_offset(alignment, cursor_x);
        for g in &mut glyphs {
            g.1 += shift;
        }
        (glyphs, cursor_x)
    }
}

fn align_offset(alignment: TextAlignment, line_w: f32) -> f32 {
    match alignment {
        TextAlignment::Left => 0.0,
        TextAlignment::Center => -line_w * 0.5,
        TextAlignment::Right => -line_w,
    }
}

impl TextRasterizer for GlyphRasterizer {
    fn rasterize(&self, content: &TextContent, cancel: &CancelToken) -> CoreResult<TiledImage> {
        let style = &content.style;
        style.validate()?;
        let font_size = style.font_size;
        let scaled = self.font.as_scaled(font_size);
        let ascent = scaled.ascent();
        let line_height = scaled.height();
        let decorated = style.underline || style.strikethrough;

        // (glyph, x, baseline y) plus per-line width
        let mut glyphs: Vec<(GlyphId, f32, f32)> = Vec::new();
        let mut line_widths = Vec::new();
        for (i, line) in content.text.split('\n').enumerate() {
            let baseline = ascent + i as f32 * line_height;
            let (line_glyphs, w) = self.layout_line(line, font_size, style.alignment);
            glyphs.extend(line_glyphs.into_iter().map(|(id, x)| (id, x, baseline)));
            line_widths.push(w);
        }

        let mut min_x = f32::MAX;
        let mut min_y = f32::MAX;
        let mut max_x = f32::MIN;
        let mut max_y = f32::MIN;
        for &(id, gx, gy) in &glyphs {
            let b = self.font.glyph_bounds(&id.with_scale_and_position(font_size, point(gx, gy)));
            min_x = min_x.min(b.min.x);
            min_y = min_y.min(b.min.y);
            max_x = max_x.max(b.max.x);
            max_y = max_y.max(b.max.y);
        }
        if decorated {
            for (i, &w) in line_widths.iter().enumerate() {
                let off = align_offset(style.alignment, w);
                let y = i as f32 * line_height;
                min_x = min_x.min(off);
                max_x = max_x.max(off + w);
                min_y = min_y.min(y);
                max_y = max_y.max(y + ascent + font_size * 0.2);
            }
        }
        if min_x >= max_x || min_y >= max_y {
            return Ok(TiledImage::new(1, 1));
        }

        let pad = 2.0;
        let shift_x = pad - min_x.min(0.0).floor();
        let shift_y = pad - min_y.min(0.0).floor();
        let (buf_w, buf_h) = checked_raster_size(max_x + shift_x + pad, max_y + shift_y + pad)?;
        let mut coverage = vec![0.0f32; buf_w as usize * buf_h as usize];

        let size_key = font_size.to_bits();
        let mut cache = self.glyph_cache.lock();
        for &(id, gx, gy) in &glyphs {
            cancel.check()?;
            let entry = cache.entry((id, size_key)).or_insert_with(|| {
                let base = id.with_scale_and_position(font_size, point(0.0, 0.0));
                let mut px = Vec::new();
                match self.font.outline_glyph(base) {
                    Some(outlined) => {
                        let b = outlined.px_bounds();
                        outlined.draw(|x, y, c| px.push((x, y, c)));
                        (px, b.min.x, b.min.y)
                    }
                    None => (px, 0.0, 0.0),
                }
            });
            let (pixels, bx, by) = (&entry.0, entry.1, entry.2);
            let draw_x = gx.round() + bx + shift_x;
            let draw_y = gy.round() + by + shift_y;
            let baseline = gy.round() + shift_y;

            for &(px, py, cov) in pixels {
                let mut cx = px as f32 + draw_x;
                let cy = py as f32 + draw_y;
                if style.italic {
                    cx += (baseline - cy) * 0.2;
                }
                let ix = cx.round() as i32;
                let iy = cy.round() as i32;
                if ix < 0 || iy < 0 || ix as u32 >= buf_w || iy as u32 >= buf_h {
                    continue;
                }
                let idx = iy as usize * buf_w as usize + ix as usize;
                let v = if style.anti_alias { cov } else if cov > 0.5 { 1.0 } else { 0.0 };
                coverage[idx] = coverage[idx].max(v);
                if style.bold && (ix as u32) + 1 < buf_w {
                    coverage[idx + 1] = coverage[idx + 1].max(v);
                }
            }
        }
        drop(cache);

        let thickness = (font_size * 0.06).max(1.0);
        for (i, &w) in line_widths.iter().enumerate() {
            if w < 0.1 {
                continue;
            }
            let x0 = align_offset(style.alignment, w) + shift_x;
            let top = i as f32 * line_height + shift_y;
            if style.underline {
                fill_line(&mut coverage, buf_w, buf_h, x0, w, top + ascent + font_size * 0.1, thickness);
            }
            if style.strikethrough {
                fill_line(&mut coverage, buf_w, buf_h, x0, w, top + ascent * 0.6, thickness);
            }
        }

        cancel.check()?;
        let color = style.color;
        let mut buf = vec![0u8; coverage.len() * 4];
        for (i, &cov) in coverage.iter().enumerate() {
            if cov > 0.001 {
                let o = i * 4;
                buf[o] = color[0];
                buf[o + 1] = color[1];
                buf[o + 2] = color[2];
                buf[o + 3] = (color[3] as f32 * cov).round().min(255.0) as u8;
            }
        }
        Ok(TiledImage::from_raw_rgba(buf_w, buf_h, &buf))
    }
}

fn fill_line(coverage: &mut [f32], buf_w: u32, buf_h: u32, x0: f32, w: f32, y: f32, thickness: f32) {
    let half = thickness * 0.5;
    let ly0 = ((y - half).floor() as i32).max(0);
    let ly1 = ((y + half).ceil() as i32).min(buf_h as i32);
    let lx0 = (x0.floor() as i32).max(0);
    let lx1 = ((x0 + w).ceil() as i32).min(buf_w as i32);
    for ly in ly0..ly1 {
        for lx in lx0..lx1 {
            coverage[ly as usize * buf_w as usize + lx as usize] = 1.0;
        }
    }
}

// ---- per-layer raster cache -------------------------------------------------

/// Raster cache of one text layer. `generation` bumps on every content edit;
/// a stored raster is only valid while its generation matches.
#[derive(Default)]
struct TextCache {
    generation: u64,
    raster: Option<(u64, Arc<TiledImage>)>,
    pending: Option<CancelToken>,
}

impl TextCache {
    fn current(&self) -> Option<Arc<TiledImage>> {
        self.raster
            .as_ref()
            .filter(|(g, _)| *g == self.generation)
            .map(|(_, img)| Arc::clone(img))
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        if let Some(token) = self.pending.take() {
            token.cancel();
        }
    }
}

/// Content plus lazily rasterized pixels of a text layer.
pub struct TextData {
    content: TextContent,
    cache: Arc<Mutex<TextCache>>,
}

impl Clone for TextData {
    /// Clones share the current raster but get their own cache, so edits on
    /// one copy never invalidate another.
    fn clone(&self) -> Self {
        let src = self.cache.lock();
        let cache = TextCache {
            generation: src.generation,
            raster: src.raster.clone(),
            pending: None,
        };
        Self {
            content: self.content.clone(),
            cache: Arc::new(Mutex::new(cache)),
        }
    }
}

impl std::fmt::Debug for TextData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextData").field("content", &self.content).finish()
    }
}

impl TextData {
    pub fn new(content: TextContent) -> Self {
        Self {
            content,
            cache: Arc::new(Mutex::new(TextCache::default())),
        }
    }

    pub fn content(&self) -> &TextContent {
        &self.content
    }

    /// Replace the content, dropping the cached raster and abandoning any
    /// in-flight rasterization.
    pub fn set_content(&mut self, content: TextContent) {
        self.content = content;
        self.cache.lock().invalidate();
    }

    pub fn cached_raster(&self) -> Option<Arc<TiledImage>> {
        self.cache.lock().current()
    }

    /// Cached raster, rasterizing synchronously on a miss when an engine is
    /// available.
    pub fn raster(&self, engine: Option<&dyn TextRasterizer>) -> Option<Arc<TiledImage>> {
        let mut cache = self.cache.lock();
        if let Some(img) = cache.current() {
            return Some(img);
        }
        let engine = engine?;
        match engine.rasterize(&self.content, &CancelToken::new()) {
            Ok(img) => {
                let img = Arc::new(img);
                cache.raster = Some((cache.generation, Arc::clone(&img)));
                Some(img)
            }
            Err(e) => {
                tracing::warn!("text rasterization failed: {e}");
                None
            }
        }
    }

    /// Start an asynchronous rasterization. Any previous request for this
    /// layer is cancelled.
    pub fn request_raster(&self) -> RasterTicket {
        let mut cache = self.cache.lock();
        if let Some(prev) = cache.pending.take() {
            prev.cancel();
        }
        let token = CancelToken::new();
        cache.pending = Some(token.clone());
        RasterTicket {
            generation: cache.generation,
            token,
            content: self.content.clone(),
            cache: Arc::clone(&self.cache),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.content.text.len()
            + self
                .cache
                .lock()
                .raster
                .as_ref()
                .map_or(0, |(_, img)| img.memory_bytes())
    }
}

/// One outstanding rasterization for a text layer.
pub struct RasterTicket {
    generation: u64,
    token: CancelToken,
    content: TextContent,
    cache: Arc<Mutex<TextCache>>,
}

impl RasterTicket {
    pub fn cancel_token(&self) -> &CancelToken {
        &self.token
    }

    /// Rasterize and publish the result. A request superseded by an edit or a
    /// newer request returns `Cancelled` and leaves the cache untouched.
    pub fn run(self, engine: &dyn TextRasterizer) -> CoreResult<Arc<TiledImage>> {
        let img = Arc::new(engine.rasterize(&self.content, &self.token)?);
        let mut cache = self.cache.lock();
        if self.token.is_cancelled() || cache.generation != self.generation {
            tracing::warn!(generation = self.generation, "dropping superseded text raster");
            return Err(CoreError::Cancelled);
        }
        cache.raster = Some((self.generation, Arc::clone(&img)));
        cache.pending = None;
        Ok(img)
    }
}

/// Run a ticket on the rayon pool. The receiver yields once the job ends.
pub fn spawn_raster(ticket: RasterTicket, engine: Arc<dyn TextRasterizer>) -> mpsc::Receiver<CoreResult<()>> {
    let (tx, rx) = mpsc::channel();
    rayon::spawn(move || {
        let result = ticket.run(engine.as_ref()).map(|_| ());
        let _ = tx.send(result);
    });
    rx
}
