use image::{Rgba, RgbaImage};
use rayon::prelude::*;
use std::sync::Arc;

use crate::geometry::PixelRect;

pub const CHUNK_SIZE: u32 = 64;

/// Hard ceiling on pixels per buffer (~256 megapixels).
pub const MAX_PIXELS: u64 = 256_000_000;

static TRANSPARENT_PIXEL: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Sparse tiled RGBA buffer backed by a flat `Vec<Option<Arc<RgbaImage>>>`.
/// Chunk `(cx, cy)` lives at `cy * chunks_per_row + cx`.
///
/// Chunks are `Arc`-wrapped so `clone()` only bumps reference counts. Writes go
/// through `Arc::make_mut`, copying just the touched chunk when it is shared
/// with an undo snapshot or a background composite.
#[derive(Clone)]
pub struct TiledImage {
    width: u32,
    height: u32,
    chunks_per_row: u32,
    chunks: Vec<Option<Arc<RgbaImage>>>,
}

impl std::fmt::Debug for TiledImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiledImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl PartialEq for TiledImage {
    /// Pixel-wise equality; a missing chunk equals an all-transparent one.
    fn eq(&self, other: &Self) -> bool {
        if self.width != other.width || self.height != other.height {
            return false;
        }
        self.chunks.iter().zip(other.chunks.iter()).all(|(a, b)| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b) || a.as_raw() == b.as_raw(),
            (Some(c), None) | (None, Some(c)) => c.as_raw().iter().all(|&v| v == 0),
        })
    }
}

impl TiledImage {
    /// Create an empty (fully transparent) tiled image. Degenerate or oversized
    /// dimensions are clamped to 1×1; callers validate sizes up front.
    pub fn new(width: u32, height: u32) -> Self {
        let (width, height) = {
            let total = (width as u64) * (height as u64);
            if total > MAX_PIXELS || width == 0 || height == 0 {
                tracing::warn!(width, height, "TiledImage::new: invalid dimensions, clamped to 1x1");
                (1, 1)
            } else {
                (width, height)
            }
        };
        let chunks_per_row = width.div_ceil(CHUNK_SIZE);
        let chunks_per_col = height.div_ceil(CHUNK_SIZE);
        Self {
            width,
            height,
            chunks_per_row,
            chunks: vec![None; (chunks_per_row * chunks_per_col) as usize],
        }
    }

    pub fn new_filled(width: u32, height: u32, color: Rgba<u8>) -> Self {
        let mut img = Self::new(width, height);
        if color[3] > 0 {
            img.fill(color);
        }
        img
    }

    pub fn from_rgba_image(src: &RgbaImage) -> Self {
        Self::from_raw_rgba(src.width(), src.height(), src.as_raw())
    }

    /// Import from a row-major RGBA byte slice of exactly `width * height * 4`
    /// bytes. Only chunks with visible content are stored. Parallelised with rayon.
    pub fn from_raw_rgba(width: u32, height: u32, data: &[u8]) -> Self {
        let mut img = Self::new(width, height);
        if data.len() != (img.width as usize) * (img.height as usize) * 4 {
            tracing::warn!(width, height, len = data.len(), "from_raw_rgba: size mismatch");
            return img;
        }
        let (width, height) = (img.width, img.height);
        let chunks_x = img.chunks_per_row as usize;
        let total_chunks = img.chunks.len();

        let chunk_results: Vec<(usize, Option<Arc<RgbaImage>>)> = (0..total_chunks)
            .into_par_iter()
            .map(|flat| {
                let base_x = (flat % chunks_x) as u32 * CHUNK_SIZE;
                let base_y = (flat / chunks_x) as u32 * CHUNK_SIZE;
                let cw = CHUNK_SIZE.min(width - base_x) as usize;
                let ch = CHUNK_SIZE.min(height - base_y);
                let chunk_stride = CHUNK_SIZE as usize * 4;
                let mut chunk_data = vec![0u8; chunk_stride * CHUNK_SIZE as usize];
                let mut has_content = false;

                for ly in 0..ch {
                    let src_start = ((base_y + ly) * width + base_x) as usize * 4;
                    let dst_start = ly as usize * chunk_stride;
                    let row = &data[src_start..src_start + cw * 4];
                    chunk_data[dst_start..dst_start + cw * 4].copy_from_slice(row);
                    has_content |= row.chunks_exact(4).any(|px| px[3] != 0);
                }

                let chunk = if has_content {
                    RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, chunk_data).map(Arc::new)
                } else {
                    None
                };
                (flat, chunk)
            })
            .collect();

        for (idx, chunk) in chunk_results {
            img.chunks[idx] = chunk;
        }
        img
    }

    /// Flatten back to a contiguous `RgbaImage`.
    pub fn to_rgba_image(&self) -> RgbaImage {
        let mut buf = Vec::new();
        self.extract_region(PixelRect::from_size(self.width, self.height), &mut buf);
        RgbaImage::from_raw(self.width, self.height, buf)
            .unwrap_or_else(|| RgbaImage::new(self.width, self.height))
    }

    /// Copy a local-space region into `buf` as row-major RGBA. Pixels outside
    /// the image or in unpopulated chunks come out transparent.
    pub fn extract_region(&self, region: PixelRect, buf: &mut Vec<u8>) {
        buf.clear();
        buf.resize(region.area() as usize * 4, 0);
        let Some(clip) = region.intersect(&PixelRect::from_size(self.width, self.height)) else {
            return;
        };
        let rw = region.width as usize;
        let chunk_stride = CHUNK_SIZE as usize * 4;
        let (x0, y0) = (clip.x as u32, clip.y as u32);
        let (x1, y1) = (clip.right() as u32, clip.bottom() as u32);

        for cy in y0 / CHUNK_SIZE..y1.div_ceil(CHUNK_SIZE) {
            for cx in x0 / CHUNK_SIZE..x1.div_ceil(CHUNK_SIZE) {
                let Some(chunk) = self.chunk(cx, cy) else {
                    continue;
                };
                let base_x = cx * CHUNK_SIZE;
                let base_y = cy * CHUNK_SIZE;
                let ox = x0.max(base_x);
                let oy = y0.max(base_y);
                let ox2 = x1.min(base_x + CHUNK_SIZE);
                let oy2 = y1.min(base_y + CHUNK_SIZE);
                if ox >= ox2 || oy >= oy2 {
                    continue;
                }
                let ow = (ox2 - ox) as usize;
                let raw = chunk.as_raw();
                for sy in oy..oy2 {
                    let src = (sy - base_y) as usize * chunk_stride + (ox - base_x) as usize * 4;
                    let dx = (ox as i64 - region.x as i64) as usize;
                    let dy = (sy as i64 - region.y as i64) as usize;
                    let dst = (dy * rw + dx) * 4;
                    buf[dst..dst + ow * 4].copy_from_slice(&raw[src..src + ow * 4]);
                }
            }
        }
    }

    #[inline(always)]
    fn flat_index(&self, cx: u32, cy: u32) -> usize {
        (cy * self.chunks_per_row + cx) as usize
    }

    #[inline(always)]
    fn split(x: u32, y: u32) -> ((u32, u32), (u32, u32)) {
        ((x / CHUNK_SIZE, y / CHUNK_SIZE), (x % CHUNK_SIZE, y % CHUNK_SIZE))
    }

    /// Read a pixel; out-of-range coordinates and missing chunks are transparent.
    #[inline]
    pub fn get_pixel(&self, x: u32, y: u32) -> &Rgba<u8> {
        if x >= self.width || y >= self.height {
            return &TRANSPARENT_PIXEL;
        }
        let ((cx, cy), (lx, ly)) = Self::split(x, y);
        self.chunks[self.flat_index(cx, cy)]
            .as_ref()
            .map(|c| c.get_pixel(lx, ly))
            .unwrap_or(&TRANSPARENT_PIXEL)
    }

    /// Signed-coordinate read used by samplers.
    #[inline]
    pub fn get_pixel_i(&self, x: i32, y: i32) -> Rgba<u8> {
        if x < 0 || y < 0 {
            return TRANSPARENT_PIXEL;
        }
        *self.get_pixel(x as u32, y as u32)
    }

    /// Write a pixel (creates the chunk on demand, COW-clones if shared).
    #[inline]
    pub fn put_pixel(&mut self, x: u32, y: u32, pixel: Rgba<u8>) {
        if x >= self.width || y >= self.height {
            return;
        }
        let ((cx, cy), (lx, ly)) = Self::split(x, y);
        if pixel[3] == 0 && self.chunks[self.flat_index(cx, cy)].is_none() {
            return;
        }
        let idx = self.flat_index(cx, cy);
        let arc = self.chunks[idx].get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
        Arc::make_mut(arc).put_pixel(lx, ly, pixel);
    }

    /// Blit a row-major RGBA sub-image with its top-left at `(dst_x, dst_y)`,
    /// replacing destination pixels. Parts falling outside are dropped.
    pub fn blit_rgba_at(&mut self, dst_x: i32, dst_y: i32, src_w: u32, src_h: u32, data: &[u8]) {
        if data.len() != src_w as usize * src_h as usize * 4 {
            tracing::warn!(src_w, src_h, len = data.len(), "blit_rgba_at: size mismatch");
            return;
        }
        for sy in 0..src_h {
            let gy = dst_y + sy as i32;
            if gy < 0 || gy as u32 >= self.height {
                continue;
            }
            let gy = gy as u32;
            let src_row_start = sy as usize * src_w as usize * 4;

            let mut sx = 0u32;
            while sx < src_w {
                let gx = dst_x + sx as i32;
                if gx < 0 {
                    sx += 1;
                    continue;
                }
                let gx = gx as u32;
                if gx >= self.width {
                    break;
                }
                let ((cx, cy), (lx, ly)) = Self::split(gx, gy);
                let idx = self.flat_index(cx, cy);
                let run = (CHUNK_SIZE - lx).min(src_w - sx).min(self.width - gx);
                let src_off = src_row_start + sx as usize * 4;
                let byte_len = run as usize * 4;
                let src = &data[src_off..src_off + byte_len];

                if self.chunks[idx].is_some() || src.chunks_exact(4).any(|px| px[3] != 0) {
                    let arc = self.chunks[idx]
                        .get_or_insert_with(|| Arc::new(RgbaImage::new(CHUNK_SIZE, CHUNK_SIZE)));
                    let dst_off = (ly as usize * CHUNK_SIZE as usize + lx as usize) * 4;
                    Arc::make_mut(arc).as_mut()[dst_off..dst_off + byte_len].copy_from_slice(src);
                }
                sx += run;
            }
        }
    }

    pub fn chunk(&self, cx: u32, cy: u32) -> Option<&RgbaImage> {
        if cx >= self.chunks_per_row {
            return None;
        }
        self.chunks.get(self.flat_index(cx, cy)).and_then(|c| c.as_deref())
    }

    /// Place a fully-built chunk at the given chunk coordinate.
    pub fn set_chunk(&mut self, cx: u32, cy: u32, chunk: RgbaImage) {
        if cx >= self.chunks_per_row || chunk.dimensions() != (CHUNK_SIZE, CHUNK_SIZE) {
            return;
        }
        let idx = self.flat_index(cx, cy);
        if idx < self.chunks.len() {
            self.chunks[idx] = Some(Arc::new(chunk));
        }
    }

    /// Populated chunk coordinates.
    pub fn chunk_keys(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let cpr = self.chunks_per_row;
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(move |(i, _)| ((i as u32) % cpr, (i as u32) / cpr))
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }

    pub fn fill(&mut self, color: Rgba<u8>) {
        if color[3] == 0 {
            self.clear();
            return;
        }
        let filled = Arc::new(RgbaImage::from_pixel(CHUNK_SIZE, CHUNK_SIZE, color));
        for slot in &mut self.chunks {
            *slot = Some(Arc::clone(&filled));
        }
    }

    /// Drop all chunks.
    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
    }

    /// Apply `f` to every pixel in `rect` (local space, clipped). `f` gets the
    /// local coordinates and may rewrite the pixel in place.
    pub fn map_region<F>(&mut self, rect: PixelRect, mut f: F)
    where
        F: FnMut(u32, u32, &mut Rgba<u8>),
    {
        let Some(clip) = rect.intersect(&PixelRect::from_size(self.width, self.height)) else {
            return;
        };
        for y in clip.y as u32..clip.bottom() as u32 {
            for x in clip.x as u32..clip.right() as u32 {
                let mut px = *self.get_pixel(x, y);
                let before = px;
                f(x, y, &mut px);
                if px != before {
                    self.put_pixel(x, y, px);
                }
            }
        }
    }

    /// Smallest local rectangle holding every non-transparent pixel.
    pub fn content_bounds(&self) -> Option<PixelRect> {
        let mut bounds = PixelRect::default();
        for (cx, cy) in self.chunk_keys() {
            let Some(chunk) = self.chunk(cx, cy) else {
                continue;
            };
            for (lx, ly, px) in chunk.enumerate_pixels() {
                if px[3] == 0 {
                    continue;
                }
                let x = cx * CHUNK_SIZE + lx;
                let y = cy * CHUNK_SIZE + ly;
                if x < self.width && y < self.height {
                    bounds = bounds.union(&PixelRect::new(x as i32, y as i32, 1, 1));
                }
            }
        }
        (!bounds.is_empty()).then_some(bounds)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Approximate memory usage in bytes. Chunks shared with another image
    /// only count their pointer.
    pub fn memory_bytes(&self) -> usize {
        let chunk_byte_size = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
        self.chunks
            .iter()
            .filter_map(|c| c.as_ref())
            .map(|arc| {
                if Arc::strong_count(arc) == 1 {
                    chunk_byte_size
                } else {
                    std::mem::size_of::<usize>() * 2
                }
            })
            .sum()
    }
}
