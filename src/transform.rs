use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::geometry::{PixelRect, Point};

/// Smallest allowed magnitude for a scale component.
pub const MIN_SCALE: f32 = 1e-3;

/// 2D affine matrix mapping `(x, y)` to `(a·x + c·y + e, b·x + d·y + f)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Affine {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
    pub e: f32,
    pub f: f32,
}

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Affine {
    pub const IDENTITY: Affine = Affine { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: 0.0, f: 0.0 };

    pub const fn translate(dx: f32, dy: f32) -> Self {
        Affine { a: 1.0, b: 0.0, c: 0.0, d: 1.0, e: dx, f: dy }
    }

    #[inline]
    pub fn apply(&self, p: Point) -> Point {
        Point::new(
            self.a * p.x + self.c * p.y + self.e,
            self.b * p.x + self.d * p.y + self.f,
        )
    }

    /// `self ∘ inner`: apply `inner` first, then `self`.
    pub fn then_after(&self, inner: &Affine) -> Affine {
        Affine {
            a: self.a * inner.a + self.c * inner.b,
            b: self.b * inner.a + self.d * inner.b,
            c: self.a * inner.c + self.c * inner.d,
            d: self.b * inner.c + self.d * inner.d,
            e: self.a * inner.e + self.c * inner.f + self.e,
            f: self.b * inner.e + self.d * inner.f + self.f,
        }
    }

    pub fn invert(&self) -> Option<Affine> {
        let det = self.a * self.d - self.b * self.c;
        if !det.is_finite() || det.abs() < 1e-12 {
            return None;
        }
        let inv = 1.0 / det;
        let a = self.d * inv;
        let b = -self.b * inv;
        let c = -self.c * inv;
        let d = self.a * inv;
        Some(Affine {
            a,
            b,
            c,
            d,
            e: -(a * self.e + c * self.f),
            f: -(b * self.e + d * self.f),
        })
    }

    /// Integer translation, if this matrix is nothing more than that.
    pub fn integer_translation(&self) -> Option<(i32, i32)> {
        let pure = self.a == 1.0 && self.b == 0.0 && self.c == 0.0 && self.d == 1.0;
        if pure && self.e.fract() == 0.0 && self.f.fract() == 0.0 {
            Some((self.e as i32, self.f as i32))
        } else {
            None
        }
    }

    /// Canvas-space bounding box of the `w × h` local rectangle.
    pub fn map_rect(&self, w: u32, h: u32) -> PixelRect {
        let corners = [
            self.apply(Point::new(0.0, 0.0)),
            self.apply(Point::new(w as f32, 0.0)),
            self.apply(Point::new(0.0, h as f32)),
            self.apply(Point::new(w as f32, h as f32)),
        ];
        let min_x = corners.iter().map(|p| p.x).fold(f32::INFINITY, f32::min);
        let min_y = corners.iter().map(|p| p.y).fold(f32::INFINITY, f32::min);
        let max_x = corners.iter().map(|p| p.x).fold(f32::NEG_INFINITY, f32::max);
        let max_y = corners.iter().map(|p| p.y).fold(f32::NEG_INFINITY, f32::max);
        PixelRect::covering(min_x, min_y, max_x, max_y)
    }
}

/// Lossless placement of a layer's pixel buffer: offset, scale, rotation in
/// degrees and pivot origin relative to the untransformed bounds. The buffer
/// itself is only resampled when the transform is baked.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerTransform {
    offset: Point,
    scale: Point,
    rotation: f32,
    origin: Point,
}

impl Default for LayerTransform {
    fn default() -> Self {
        Self::identity()
    }
}

fn clamp_scale(s: f32) -> f32 {
    if s.abs() >= MIN_SCALE {
        s
    } else if s < 0.0 {
        -MIN_SCALE
    } else {
        MIN_SCALE
    }
}

/// Normalize to (-180, 180].
fn normalize_degrees(deg: f32) -> f32 {
    let r = deg.rem_euclid(360.0);
    if r > 180.0 { r - 360.0 } else { r }
}

impl LayerTransform {
    pub const fn identity() -> Self {
        Self {
            offset: Point::ZERO,
            scale: Point::new(1.0, 1.0),
            rotation: 0.0,
            origin: Point::ZERO,
        }
    }

    pub fn translation(dx: f32, dy: f32) -> Self {
        Self {
            offset: Point::new(dx, dy),
            ..Self::identity()
        }
    }

    /// Build a transform, clamping scale away from zero and normalizing
    /// rotation. Non-finite input is rejected.
    pub fn new(offset: Point, scale: Point, rotation: f32, origin: Point) -> CoreResult<Self> {
        let mut t = Self::identity();
        t.set(offset, scale, rotation, origin)?;
        Ok(t)
    }

    pub fn set(&mut self, offset: Point, scale: Point, rotation: f32, origin: Point) -> CoreResult<()> {
        if !(offset.is_finite() && scale.is_finite() && rotation.is_finite() && origin.is_finite()) {
            return Err(CoreError::bounds("transform parameters must be finite"));
        }
        self.offset = offset;
        self.scale = Point::new(clamp_scale(scale.x), clamp_scale(scale.y));
        self.rotation = normalize_degrees(rotation);
        self.origin = origin;
        Ok(())
    }

    pub fn clear(&mut self) {
        *self = Self::identity();
    }

    pub fn offset(&self) -> Point {
        self.offset
    }

    pub fn scale(&self) -> Point {
        self.scale
    }

    pub fn rotation(&self) -> f32 {
        self.rotation
    }

    pub fn origin(&self) -> Point {
        self.origin
    }

    pub fn is_identity(&self) -> bool {
        self.offset == Point::ZERO && self.scale == Point::new(1.0, 1.0) && self.rotation == 0.0
    }

    pub fn to_affine(&self) -> Affine {
        // Exact zeros at quarter turns keep axis-aligned placements pixel exact.
        let snap = |v: f32| if v.abs() < 1e-6 { 0.0 } else { v };
        let (sin, cos) = self.rotation.to_radians().sin_cos();
        let (sin, cos) = (snap(sin), snap(cos));
        let a = cos * self.scale.x;
        let b = sin * self.scale.x;
        let c = -sin * self.scale.y;
        let d = cos * self.scale.y;
        let (ox, oy) = (self.origin.x, self.origin.y);
        Affine {
            a,
            b,
            c,
            d,
            e: self.offset.x + ox - (a * ox + c * oy),
            f: self.offset.y + oy - (b * ox + d * oy),
        }
    }

    /// Map a point from untransformed layer space into placed space.
    pub fn apply_to_point(&self, p: Point) -> Point {
        self.to_affine().apply(p)
    }

    /// Inverse of [`apply_to_point`](Self::apply_to_point). Always defined
    /// since scale components never reach zero.
    pub fn invert_point(&self, p: Point) -> Point {
        self.to_affine().invert().map(|inv| inv.apply(p)).unwrap_or(p)
    }
}
