// ============================================================================
// PAINT OPERATIONS: content edits on image layers (selection + lock aware)
// ============================================================================
//
// Every edit targets one image layer that must be editable (unlocked and
// visible, ancestors included). Canvas-space requests are mapped into the
// layer's local pixels through its placement, the stack selection weights
// each change, and alpha-locked layers keep their alpha channel.
// ============================================================================

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::blend::{self, BlendMode};
use crate::error::{CoreError, CoreResult};
use crate::geometry::{PixelRect, Point};
use crate::layer::{Layer, LayerId};
use crate::stack::LayerStack;
use crate::tiled::TiledImage;
use crate::transform::Affine;

/// Pixel filters that need no parameters beyond the pixel itself.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Filter {
    Invert,
    /// Rec. 709 luminance to grey.
    Desaturate,
    Sepia,
    /// Luminance threshold; brighter becomes white, the rest black.
    Threshold(u8),
}

impl Filter {
    fn apply(&self, px: Rgba<u8>) -> Rgba<u8> {
        let [r, g, b, a] = px.0.map(|v| v as f32);
        let (nr, ng, nb) = match *self {
            Filter::Invert => (255.0 - r, 255.0 - g, 255.0 - b),
            Filter::Desaturate => {
                let l = 0.2126 * r + 0.7152 * g + 0.0722 * b;
                (l, l, l)
            }
            Filter::Sepia => (
                0.393 * r + 0.769 * g + 0.189 * b,
                0.349 * r + 0.686 * g + 0.168 * b,
                0.272 * r + 0.534 * g + 0.131 * b,
            ),
            Filter::Threshold(level) => {
                let l = 0.2126 * r + 0.7152 * g + 0.0722 * b;
                let v = if l >= level as f32 { 255.0 } else { 0.0 };
                (v, v, v)
            }
        };
        let q = |v: f32| v.round().clamp(0.0, 255.0) as u8;
        Rgba([q(nr), q(ng), q(nb), a as u8])
    }
}

/// Where a pixel sits: local to the layer buffer and on the canvas.
#[derive(Clone, Copy, Debug)]
struct At {
    lx: u32,
    ly: u32,
    cx: i32,
    cy: i32,
}

/// Blend `new` into `old` by selection weight `w`, keeping `old`'s alpha when
/// the layer is alpha-locked.
fn mix(old: Rgba<u8>, new: Rgba<u8>, w: f32, keep_alpha: bool) -> Rgba<u8> {
    if keep_alpha && old[3] == 0 {
        return old;
    }
    let (po, pn) = (blend::premultiply(old), blend::premultiply(new));
    let mut m = [0.0f32; 4];
    for c in 0..4 {
        m[c] = po[c] + (pn[c] - po[c]) * w;
    }
    let mut out = blend::unpremultiply(m);
    if keep_alpha {
        if out[3] == 0 {
            // Fully erased colour is gone; nothing sensible to keep.
            return old;
        }
        out[3] = old[3];
    }
    out
}

/// Core of every content edit. `f` receives each affected pixel and returns
/// its unweighted replacement. `canvas_rect` limits the edit to a canvas area;
/// `None` covers the whole layer. Returns whether any pixel was visited.
fn edit_layer<F>(stack: &mut LayerStack, id: LayerId, canvas_rect: Option<PixelRect>, f: F) -> CoreResult<bool>
where
    F: Fn(At, Rgba<u8>) -> Rgba<u8> + Sync,
{
    stack.check_editable(id)?;
    let layer = stack.layer(id).ok_or(CoreError::LayerNotFound(id))?;
    let pixels = layer.pixels().ok_or(CoreError::NotRaster(id))?;
    let to_canvas = stack.canvas_affine(id).ok_or(CoreError::LayerNotFound(id))?;
    let local_bounds = PixelRect::from_size(pixels.width(), pixels.height());

    let local = match canvas_rect {
        Some(r) if r.is_empty() => None,
        Some(r) => to_canvas.invert().and_then(|inv| {
            inv.then_after(&Affine::translate(r.x as f32, r.y as f32))
                .map_rect(r.width, r.height)
                .intersect(&local_bounds)
        }),
        None => Some(local_bounds),
    };
    let Some(local) = local else {
        return Ok(false);
    };

    let selection = stack.selection();
    let keep_alpha = layer.is_alpha_locked();
    let mut buf = Vec::new();
    pixels.extract_region(local, &mut buf);
    let row_len = local.width as usize * 4;

    buf.par_chunks_mut(row_len).enumerate().for_each(|(row, out)| {
        let ly = local.y + row as i32;
        for (col, px) in out.chunks_exact_mut(4).enumerate() {
            let lx = local.x + col as i32;
            let c = to_canvas.apply(Point::new(lx as f32 + 0.5, ly as f32 + 0.5));
            let (cx, cy) = (c.x.floor() as i32, c.y.floor() as i32);
            if canvas_rect.is_some_and(|r| !r.contains(cx, cy)) {
                continue;
            }
            let w = selection.weight(cx, cy);
            if w <= 0.0 {
                continue;
            }
            let old = Rgba([px[0], px[1], px[2], px[3]]);
            let at = At {
                lx: lx as u32,
                ly: ly as u32,
                cx,
                cy,
            };
            px.copy_from_slice(&mix(old, f(at, old), w, keep_alpha).0);
        }
    });

    let dirty = to_canvas
        .then_after(&Affine::translate(local.x as f32, local.y as f32))
        .map_rect(local.width, local.height);
    if let Some(p) = stack.layer_mut(id).and_then(Layer::pixels_mut) {
        p.blit_rgba_at(local.x, local.y, local.width, local.height, &buf);
    }
    stack.mark_dirty(Some(dirty));
    Ok(true)
}

/// Fill a canvas rectangle of the layer with a solid colour.
pub fn fill_rect(stack: &mut LayerStack, id: LayerId, rect: PixelRect, color: Rgba<u8>) -> CoreResult<()> {
    edit_layer(stack, id, Some(rect), |_, _| color)?;
    tracing::debug!(layer = %id, ?rect, "fill rect");
    Ok(())
}

/// Clear a canvas rectangle of the layer to transparent. On an alpha-locked
/// layer this changes nothing.
pub fn erase_rect(stack: &mut LayerStack, id: LayerId, rect: PixelRect) -> CoreResult<()> {
    edit_layer(stack, id, Some(rect), |_, _| Rgba([0, 0, 0, 0]))?;
    tracing::debug!(layer = %id, ?rect, "erase rect");
    Ok(())
}

/// Fill the selected area, or the whole layer when nothing is selected.
pub fn fill_selection(stack: &mut LayerStack, id: LayerId, color: Rgba<u8>) -> CoreResult<()> {
    let rect = stack.selection().bounds();
    edit_layer(stack, id, rect, |_, _| color)?;
    Ok(())
}

/// Erase the selected area, or the whole layer when nothing is selected.
pub fn delete_selection(stack: &mut LayerStack, id: LayerId) -> CoreResult<()> {
    let rect = stack.selection().bounds();
    edit_layer(stack, id, rect, |_, _| Rgba([0, 0, 0, 0]))?;
    Ok(())
}

/// Run a pixel filter over the selection (or the whole layer).
pub fn apply_filter(stack: &mut LayerStack, id: LayerId, filter: Filter) -> CoreResult<()> {
    let rect = stack.selection().bounds();
    edit_layer(stack, id, rect, |_, px| filter.apply(px))?;
    tracing::debug!(layer = %id, ?filter, "filter applied");
    Ok(())
}

/// Composite `src` with its top-left at canvas `origin` onto the layer using
/// `mode` and `opacity`. Pixels are sampled nearest-neighbour through the
/// layer's placement.
pub fn paint_pixels(
    stack: &mut LayerStack,
    id: LayerId,
    origin: (i32, i32),
    src: &RgbaImage,
    mode: BlendMode,
    opacity: f32,
) -> CoreResult<()> {
    let rect = PixelRect::new(origin.0, origin.1, src.width(), src.height());
    edit_layer(stack, id, Some(rect), |at, old| {
        let s = *src.get_pixel((at.cx - origin.0) as u32, (at.cy - origin.1) as u32);
        let mut d = blend::premultiply(old);
        blend::composite(&mut d, blend::premultiply(s), mode, opacity);
        blend::unpremultiply(d)
    })?;
    tracing::debug!(layer = %id, ?rect, %mode, "painted pixels");
    Ok(())
}

/// Draw a buffer in the layer's own pixel space over it, Normal blend. Used
/// to commit a pending edit.
pub(crate) fn paint_local(stack: &mut LayerStack, id: LayerId, overlay: &TiledImage) -> CoreResult<()> {
    edit_layer(stack, id, None, |at, old| {
        let s = overlay.get_pixel_i(at.lx as i32, at.ly as i32);
        if s[3] == 0 {
            return old;
        }
        let mut d = blend::premultiply(old);
        blend::composite(&mut d, blend::premultiply(s), BlendMode::Normal, 1.0);
        blend::unpremultiply(d)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::{SelectionMode, SelectionShape};

    fn stack_with_layer(c: [u8; 4]) -> (LayerStack, LayerId) {
        let stack = LayerStack::with_background(6, 6, Rgba(c)).unwrap();
        let id = stack.active_layer_id();
        (stack, id)
    }

    fn px(stack: &LayerStack, id: LayerId, x: u32, y: u32) -> Rgba<u8> {
        *stack.layer(id).unwrap().pixels().unwrap().get_pixel(x, y)
    }

    #[test]
    fn fill_rect_is_clipped_to_rect() {
        let (mut stack, id) = stack_with_layer([255, 255, 255, 255]);
        fill_rect(&mut stack, id, PixelRect::new(1, 1, 2, 2), Rgba([255, 0, 0, 255])).unwrap();
        assert_eq!(px(&stack, id, 1, 1), Rgba([255, 0, 0, 255]));
        assert_eq!(px(&stack, id, 2, 2), Rgba([255, 0, 0, 255]));
        assert_eq!(px(&stack, id, 3, 3), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn fill_follows_layer_position() {
        let mut stack = LayerStack::new(8, 8).unwrap();
        let root = stack.root_id();
        let layer = Layer::new_image("a", TiledImage::new(4, 4)).with_position(2, 2);
        let id = stack.insert_layer(root, 0, layer).unwrap();
        fill_rect(&mut stack, id, PixelRect::new(0, 0, 3, 3), Rgba([0, 255, 0, 255])).unwrap();
        assert_eq!(px(&stack, id, 0, 0), Rgba([0, 255, 0, 255]));
        assert_eq!(px(&stack, id, 1, 1)[3], 0);
    }

    #[test]
    fn selection_limits_edits() {
        let (mut stack, id) = stack_with_layer([255, 255, 255, 255]);
        stack.combine_selection(&SelectionShape::Rectangle(PixelRect::new(0, 0, 2, 6)), SelectionMode::Replace);
        fill_selection(&mut stack, id, Rgba([0, 0, 0, 255])).unwrap();
        assert_eq!(px(&stack, id, 1, 5), Rgba([0, 0, 0, 255]));
        assert_eq!(px(&stack, id, 2, 0), Rgba([255, 255, 255, 255]));

        delete_selection(&mut stack, id).unwrap();
        assert_eq!(px(&stack, id, 0, 0)[3], 0);
        assert_eq!(px(&stack, id, 5, 5)[3], 255);
    }

    #[test]
    fn alpha_lock_preserves_alpha() {
        let mut stack = LayerStack::new(4, 1).unwrap();
        let root = stack.root_id();
        let mut img = TiledImage::new(4, 1);
        img.put_pixel(0, 0, Rgba([10, 10, 10, 128]));
        let id = stack.insert_layer(root, 0, Layer::new_image("a", img)).unwrap();
        assert!(stack.set_alpha_locked(id, true));
        fill_rect(&mut stack, id, PixelRect::new(0, 0, 4, 1), Rgba([200, 0, 0, 255])).unwrap();
        assert_eq!(px(&stack, id, 0, 0), Rgba([200, 0, 0, 128]));
        assert_eq!(px(&stack, id, 1, 0)[3], 0);
        erase_rect(&mut stack, id, PixelRect::new(0, 0, 4, 1)).unwrap();
        assert_eq!(px(&stack, id, 0, 0), Rgba([200, 0, 0, 128]));
    }

    #[test]
    fn locked_and_hidden_layers_reject_edits() {
        let (mut stack, id) = stack_with_layer([255, 255, 255, 255]);
        stack.set_locked(id, true);
        assert_eq!(
            fill_rect(&mut stack, id, PixelRect::new(0, 0, 1, 1), Rgba([0, 0, 0, 255])).err(),
            Some(CoreError::LayerLocked(id))
        );
        stack.set_locked(id, false);
        stack.set_visible(id, false);
        assert_eq!(
            apply_filter(&mut stack, id, Filter::Invert).err(),
            Some(CoreError::InvisibleLayer(id))
        );
        assert_eq!(px(&stack, id, 0, 0), Rgba([255, 255, 255, 255]));
    }

    #[test]
    fn filters_map_colours() {
        assert_eq!(Filter::Invert.apply(Rgba([0, 100, 255, 7])), Rgba([255, 155, 0, 7]));
        assert_eq!(Filter::Desaturate.apply(Rgba([255, 255, 255, 255])), Rgba([255, 255, 255, 255]));
        assert_eq!(Filter::Threshold(128).apply(Rgba([10, 10, 10, 255])), Rgba([0, 0, 0, 255]));
    }

    #[test]
    fn paint_pixels_uses_blend_mode() {
        let (mut stack, id) = stack_with_layer([255, 0, 0, 255]);
        let src = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 255, 255]));
        paint_pixels(&mut stack, id, (1, 1), &src, BlendMode::Normal, 0.5).unwrap();
        assert_eq!(px(&stack, id, 1, 1), Rgba([128, 0, 128, 255]));
        assert_eq!(px(&stack, id, 0, 0), Rgba([255, 0, 0, 255]));
        paint_pixels(&mut stack, id, (4, 4), &src, BlendMode::Multiply, 1.0).unwrap();
        assert_eq!(px(&stack, id, 4, 4), Rgba([0, 0, 0, 255]));
    }
}
