use image::{GrayImage, Luma};
use rayon::prelude::*;

use crate::geometry::PixelRect;

/// How a new selection shape interacts with the existing mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectionMode {
    /// Discard the existing selection and use the new shape.
    #[default]
    Replace,
    Add,
    Subtract,
    /// Keep only pixels present in both the existing mask and the shape.
    Intersect,
}

impl SelectionMode {
    pub fn all() -> &'static [SelectionMode] {
        &[
            SelectionMode::Replace,
            SelectionMode::Add,
            SelectionMode::Subtract,
            SelectionMode::Intersect,
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SelectionShape {
    Rectangle(PixelRect),
    Ellipse { cx: f32, cy: f32, rx: f32, ry: f32 },
    /// Explicit coverage in canvas space, origin at (0, 0).
    Mask(GrayImage),
}

impl SelectionShape {
    /// Coverage (0..=255) of pixel `(x, y)`, sampled at the pixel centre.
    pub fn coverage(&self, x: u32, y: u32) -> u8 {
        match self {
            SelectionShape::Rectangle(r) => {
                if r.contains(x as i32, y as i32) {
                    255
                } else {
                    0
                }
            }
            SelectionShape::Ellipse { cx, cy, rx, ry } => {
                if *rx <= 0.0 || *ry <= 0.0 {
                    return 0;
                }
                let dx = (x as f32 + 0.5 - cx) / rx;
                let dy = (y as f32 + 0.5 - cy) / ry;
                if dx * dx + dy * dy <= 1.0 { 255 } else { 0 }
            }
            SelectionShape::Mask(m) => {
                if x < m.width() && y < m.height() {
                    m.get_pixel(x, y).0[0]
                } else {
                    0
                }
            }
        }
    }
}

/// Stack-level selection mask, one coverage byte per canvas pixel.
///
/// `None` means nothing is selected, in which case edits are unrestricted.
/// A mask that becomes all zero collapses back to `None`.
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    width: u32,
    height: u32,
    mask: Option<GrayImage>,
}

impl Selection {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, mask: None }
    }

    /// Adopt an existing mask. Wrong-sized masks are ignored.
    pub fn from_mask(width: u32, height: u32, mask: Option<GrayImage>) -> Self {
        let mut sel = Self::new(width, height);
        if let Some(m) = mask.filter(|m| m.dimensions() == (width, height)) {
            sel.mask = Some(m);
            sel.normalize();
        }
        sel
    }

    pub fn mask(&self) -> Option<&GrayImage> {
        self.mask.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.mask.is_some()
    }

    /// Edit weight at `(x, y)` in `[0, 1]`; 1 everywhere when nothing is selected.
    pub fn weight(&self, x: i32, y: i32) -> f32 {
        match &self.mask {
            None => 1.0,
            Some(m) => {
                if x < 0 || y < 0 || x as u32 >= self.width || y as u32 >= self.height {
                    0.0
                } else {
                    m.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0
                }
            }
        }
    }

    fn normalize(&mut self) {
        if self.mask.as_ref().is_some_and(|m| m.as_raw().iter().all(|&v| v == 0)) {
            self.mask = None;
        }
    }

    pub fn select_all(&mut self) {
        self.mask = Some(GrayImage::from_pixel(self.width, self.height, Luma([255])));
    }

    pub fn deselect_all(&mut self) {
        self.mask = None;
    }

    /// Invert coverage. With nothing selected this is a no-op.
    pub fn invert(&mut self) {
        if let Some(m) = &mut self.mask {
            for p in m.pixels_mut() {
                p.0[0] = 255 - p.0[0];
            }
        }
        self.normalize();
    }

    /// Combine `shape` into the mask.
    pub fn combine(&mut self, shape: &SelectionShape, mode: SelectionMode) {
        let (w, h) = (self.width, self.height);
        let old = self.mask.take();
        let mut out = GrayImage::new(w, h);
        let old_at = |x: u32, y: u32| old.as_ref().map_or(0, |m| m.get_pixel(x, y).0[0]);
        for y in 0..h {
            for x in 0..w {
                let s = shape.coverage(x, y);
                let o = old_at(x, y);
                let v = match mode {
                    SelectionMode::Replace => s,
                    SelectionMode::Add => o.max(s),
                    SelectionMode::Subtract => o.saturating_sub(s),
                    SelectionMode::Intersect => o.min(s),
                };
                if v > 0 {
                    out.put_pixel(x, y, Luma([v]));
                }
            }
        }
        self.mask = Some(out);
        self.normalize();
    }

    /// Dilate by a disc of radius `n`.
    pub fn grow(&mut self, n: u32) {
        self.morph(n, true);
    }

    /// Erode by a disc of radius `n`. The canvas edge counts as selected so a
    /// full selection stays full.
    pub fn shrink(&mut self, n: u32) {
        self.morph(n, false);
    }

    fn morph(&mut self, n: u32, dilate: bool) {
        let Some(src) = self.mask.as_ref() else {
            return;
        };
        if n == 0 {
            return;
        }
        let (w, h) = (self.width as i32, self.height as i32);
        let r = n as i32;
        let offsets: Vec<(i32, i32)> = (-r..=r)
            .flat_map(|dy| (-r..=r).map(move |dx| (dx, dy)))
            .filter(|(dx, dy)| dx * dx + dy * dy <= r * r)
            .collect();
        let raw = src.as_raw();
        let mut out = vec![0u8; raw.len()];
        out.par_chunks_mut(w as usize).enumerate().for_each(|(y, row)| {
            let y = y as i32;
            for x in 0..w {
                let mut acc = if dilate { 0u8 } else { 255u8 };
                for &(dx, dy) in &offsets {
                    let sx = (x + dx).clamp(0, w - 1);
                    let sy = (y + dy).clamp(0, h - 1);
                    let v = raw[(sy * w + sx) as usize];
                    acc = if dilate { acc.max(v) } else { acc.min(v) };
                }
                row[x as usize] = acc;
            }
        });
        self.mask = GrayImage::from_raw(self.width, self.height, out);
        self.normalize();
    }

    /// Shift the mask; pixels leaving the canvas are dropped.
    pub fn translate(&mut self, dx: i32, dy: i32) {
        let Some(src) = self.mask.as_ref() else {
            return;
        };
        if dx == 0 && dy == 0 {
            return;
        }
        let (w, h) = (self.width as i32, self.height as i32);
        let mut out = GrayImage::new(self.width, self.height);
        for y in 0..h {
            for x in 0..w {
                let (sx, sy) = (x - dx, y - dy);
                if sx >= 0 && sy >= 0 && sx < w && sy < h {
                    let v = src.get_pixel(sx as u32, sy as u32).0[0];
                    if v > 0 {
                        out.put_pixel(x as u32, y as u32, Luma([v]));
                    }
                }
            }
        }
        self.mask = Some(out);
        self.normalize();
    }

    /// Bounding box of selected pixels.
    pub fn bounds(&self) -> Option<PixelRect> {
        let m = self.mask.as_ref()?;
        let mut r = PixelRect::default();
        for (x, y, p) in m.enumerate_pixels() {
            if p.0[0] > 0 {
                r = r.union(&PixelRect::new(x as i32, y as i32, 1, 1));
            }
        }
        (!r.is_empty()).then_some(r)
    }

    pub fn memory_bytes(&self) -> usize {
        self.mask.as_ref().map_or(0, |m| m.as_raw().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(sel: &Selection) -> usize {
        sel.mask().map_or(0, |m| m.as_raw().iter().filter(|&&v| v > 0).count())
    }

    #[test]
    fn empty_input_is_idempotent() {
        let mut sel = Selection::new(8, 8);
        sel.invert();
        sel.grow(3);
        sel.shrink(3);
        sel.translate(2, 2);
        sel.deselect_all();
        assert!(!sel.is_active());
        sel.combine(&SelectionShape::Rectangle(PixelRect::default()), SelectionMode::Add);
        assert!(!sel.is_active());
        assert_eq!(sel.weight(3, 3), 1.0);
    }

    #[test]
    fn combine_modes() {
        let mut sel = Selection::new(10, 10);
        sel.combine(&SelectionShape::Rectangle(PixelRect::new(0, 0, 4, 4)), SelectionMode::Replace);
        assert_eq!(count(&sel), 16);
        sel.combine(&SelectionShape::Rectangle(PixelRect::new(2, 2, 4, 4)), SelectionMode::Add);
        assert_eq!(count(&sel), 28);
        sel.combine(&SelectionShape::Rectangle(PixelRect::new(0, 0, 2, 10)), SelectionMode::Subtract);
        assert_eq!(count(&sel), 20);
        sel.combine(&SelectionShape::Rectangle(PixelRect::new(3, 3, 1, 1)), SelectionMode::Intersect);
        assert_eq!(sel.bounds(), Some(PixelRect::new(3, 3, 1, 1)));
        sel.combine(&SelectionShape::Rectangle(PixelRect::new(8, 8, 1, 1)), SelectionMode::Intersect);
        assert!(!sel.is_active());
    }

    #[test]
    fn invert_of_full_selection_collapses() {
        let mut sel = Selection::new(4, 4);
        sel.select_all();
        sel.invert();
        assert!(!sel.is_active());
    }

    #[test]
    fn grow_then_shrink_restores_square() {
        let mut sel = Selection::new(20, 20);
        let square = PixelRect::new(8, 8, 4, 4);
        sel.combine(&SelectionShape::Rectangle(square), SelectionMode::Replace);
        sel.grow(2);
        assert_eq!(sel.bounds(), Some(PixelRect::new(6, 6, 8, 8)));
        sel.shrink(2);
        assert_eq!(sel.bounds(), Some(square));
    }

    #[test]
    fn shrink_keeps_full_selection_full() {
        let mut sel = Selection::new(6, 6);
        sel.select_all();
        sel.shrink(2);
        assert_eq!(count(&sel), 36);
    }

    #[test]
    fn translate_clips_at_canvas_edge() {
        let mut sel = Selection::new(5, 5);
        sel.combine(&SelectionShape::Rectangle(PixelRect::new(3, 3, 2, 2)), SelectionMode::Replace);
        sel.translate(1, 0);
        assert_eq!(sel.bounds(), Some(PixelRect::new(4, 3, 1, 2)));
        sel.translate(5, 0);
        assert!(!sel.is_active());
    }

    #[test]
    fn ellipse_samples_pixel_centres() {
        let shape = SelectionShape::Ellipse { cx: 5.0, cy: 5.0, rx: 2.0, ry: 2.0 };
        assert_eq!(shape.coverage(4, 4), 255);
        assert_eq!(shape.coverage(0, 0), 0);
    }
}
