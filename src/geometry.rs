use serde::{Deserialize, Serialize};

/// A point in floating-point pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const ZERO: Point = Point { x: 0.0, y: 0.0 };

    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Integer pixel rectangle in canvas space. `x`/`y` may be negative for
/// content placed partly off-canvas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub const fn from_size(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }

    /// Smallest integer rectangle covering the given float extents.
    pub fn covering(min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> Self {
        if !(min_x.is_finite() && min_y.is_finite() && max_x.is_finite() && max_y.is_finite())
            || max_x <= min_x
            || max_y <= min_y
        {
            return Self::default();
        }
        // Values within float noise of an integer count as that integer.
        let snap = |v: f32| if (v - v.round()).abs() < 1e-3 { v.round() } else { v };
        let x0 = snap(min_x).floor() as i32;
        let y0 = snap(min_y).floor() as i32;
        let x1 = snap(max_x).ceil() as i32;
        let y1 = snap(max_y).ceil() as i32;
        Self::new(x0, y0, (x1 - x0).max(0) as u32, (y1 - y0).max(0) as u32)
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width as i32
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height as i32
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        px >= self.x && py >= self.y && px < self.right() && py < self.bottom()
    }

    pub fn intersect(&self, other: &PixelRect) -> Option<PixelRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(PixelRect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32))
    }

    /// Bounding union. Empty rectangles do not contribute.
    pub fn union(&self, other: &PixelRect) -> PixelRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = self.right().max(other.right());
        let y1 = self.bottom().max(other.bottom());
        PixelRect::new(x0, y0, (x1 - x0) as u32, (y1 - y0) as u32)
    }

    pub fn translated(&self, dx: i32, dy: i32) -> PixelRect {
        PixelRect::new(self.x + dx, self.y + dy, self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersect_disjoint_is_none() {
        let a = PixelRect::new(0, 0, 4, 4);
        let b = PixelRect::new(4, 0, 4, 4);
        assert_eq!(a.intersect(&b), None);
    }

    #[test]
    fn union_ignores_empty() {
        let a = PixelRect::new(2, 3, 4, 5);
        assert_eq!(a.union(&PixelRect::default()), a);
        assert_eq!(PixelRect::default().union(&a), a);
        let b = PixelRect::new(-1, 0, 2, 2);
        assert_eq!(a.union(&b), PixelRect::new(-1, 0, 7, 8));
    }

    #[test]
    fn covering_rounds_outward() {
        let r = PixelRect::covering(0.5, -0.5, 2.1, 1.0);
        assert_eq!(r, PixelRect::new(0, -1, 3, 2));
    }
}
