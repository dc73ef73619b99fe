// ============================================================================
// TRANSFORM SAMPLING: placing layer pixels through an affine
// ============================================================================

use rayon::prelude::*;

use crate::blend::{premultiply, Premul, TRANSPARENT};
use crate::compositor::PremulBuffer;
use crate::geometry::{PixelRect, Point};
use crate::tiled::TiledImage;
use crate::transform::Affine;

/// Render `src` through `to_canvas` into `dst`, replacing the covered pixels.
///
/// Pure integer translations copy pixels exactly; anything else samples
/// bilinearly in premultiplied space at pixel centres, against a transparent
/// surround.
pub fn sample_into(src: &TiledImage, to_canvas: &Affine, dst: &mut PremulBuffer) {
    let region = dst.region();
    let footprint = to_canvas.map_rect(src.width(), src.height());
    let Some(clip) = footprint.intersect(&region) else {
        return;
    };
    let row_len = region.width as usize;
    let (y0, y1) = (clip.y - region.y, clip.bottom() - region.y);
    let (x0, x1) = (clip.x, clip.right());

    if let Some((tx, ty)) = to_canvas.integer_translation() {
        dst.data_mut()
            .par_chunks_mut(row_len)
            .enumerate()
            .filter(|(row, _)| (*row as i32) >= y0 && (*row as i32) < y1)
            .for_each(|(row, out)| {
                let cy = region.y + row as i32;
                for cx in x0..x1 {
                    out[(cx - region.x) as usize] = premultiply(src.get_pixel_i(cx - tx, cy - ty));
                }
            });
        return;
    }

    let Some(inv) = to_canvas.invert() else {
        return;
    };
    dst.data_mut()
        .par_chunks_mut(row_len)
        .enumerate()
        .filter(|(row, _)| (*row as i32) >= y0 && (*row as i32) < y1)
        .for_each(|(row, out)| {
            let cy = region.y + row as i32;
            for cx in x0..x1 {
                let p = inv.apply(Point::new(cx as f32 + 0.5, cy as f32 + 0.5));
                out[(cx - region.x) as usize] = bilinear_premul(src, p.x - 0.5, p.y - 0.5);
            }
        });
}

/// Bilinear sample of premultiplied colour at continuous pixel coordinates.
fn bilinear_premul(img: &TiledImage, x: f32, y: f32) -> Premul {
    let fx0 = x.floor();
    let fy0 = y.floor();
    let (x0, y0) = (fx0 as i32, fy0 as i32);
    if x0 < -1 || y0 < -1 || x0 >= img.width() as i32 || y0 >= img.height() as i32 {
        return TRANSPARENT;
    }
    let fx = x - fx0;
    let fy = y - fy0;

    let tl = premultiply(img.get_pixel_i(x0, y0));
    let tr = premultiply(img.get_pixel_i(x0 + 1, y0));
    let bl = premultiply(img.get_pixel_i(x0, y0 + 1));
    let br = premultiply(img.get_pixel_i(x0 + 1, y0 + 1));

    let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
    let mut out = [0.0f32; 4];
    for c in 0..4 {
        let top = lerp(tl[c], tr[c], fx);
        let bot = lerp(bl[c], br[c], fx);
        out[c] = lerp(top, bot, fy);
    }
    out
}

/// Resample `src` through `m` into a new buffer covering its transformed
/// footprint. Returns the pixels and the footprint's top-left in the target
/// space, or `None` when the footprint is empty.
pub fn bake(src: &TiledImage, m: &Affine) -> Option<(TiledImage, (i32, i32))> {
    let footprint: PixelRect = m.map_rect(src.width(), src.height());
    if footprint.is_empty() {
        return None;
    }
    let mut buf = PremulBuffer::new(footprint);
    sample_into(src, m, &mut buf);
    Some((buf.to_tiled(), (footprint.x, footprint.y)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::LayerTransform;
    use image::Rgba;

    fn checker() -> TiledImage {
        let mut img = TiledImage::new(2, 2);
        img.put_pixel(0, 0, Rgba([255, 0, 0, 255]));
        img.put_pixel(1, 1, Rgba([0, 0, 255, 255]));
        img
    }

    #[test]
    fn integer_translation_is_exact() {
        let mut buf = PremulBuffer::new(PixelRect::new(0, 0, 4, 4));
        sample_into(&checker(), &Affine::translate(2.0, 1.0), &mut buf);
        let img = buf.to_rgba_image();
        assert_eq!(*img.get_pixel(2, 1), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(3, 2), Rgba([0, 0, 255, 255]));
        assert_eq!(img.get_pixel(0, 0)[3], 0);
    }

    #[test]
    fn bake_scale_two_doubles_footprint() {
        let t = LayerTransform::new(Point::ZERO, Point::new(2.0, 2.0), 0.0, Point::ZERO).unwrap();
        let (img, pos) = bake(&TiledImage::new_filled(3, 3, Rgba([9, 9, 9, 255])), &t.to_affine()).unwrap();
        assert_eq!(pos, (0, 0));
        assert_eq!((img.width(), img.height()), (6, 6));
        assert_eq!(*img.get_pixel(2, 2), Rgba([9, 9, 9, 255]));
    }

    #[test]
    fn rotation_by_ninety_maps_corners() {
        let t = LayerTransform::new(Point::ZERO, Point::new(1.0, 1.0), 90.0, Point::new(1.0, 1.0)).unwrap();
        let (img, pos) = bake(&checker(), &t.to_affine()).unwrap();
        assert_eq!(pos, (0, 0));
        // Top-left red rotates clockwise (y down) to the top-right.
        assert_eq!(*img.get_pixel(1, 0), Rgba([255, 0, 0, 255]));
        assert_eq!(*img.get_pixel(0, 1), Rgba([0, 0, 255, 255]));
    }
}
