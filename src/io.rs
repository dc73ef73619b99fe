use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::tga::TgaEncoder;
use image::{DynamicImage, GrayImage, ImageEncoder, RgbaImage};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use bincode::Options;
use thiserror::Error;

use crate::blend::BlendMode;
use crate::compositor;
use crate::error::CoreError;
use crate::layer::{Layer, LayerContent};
use crate::selection::Selection;
use crate::stack::{LayerStack, MAX_CANVAS_DIM};
use crate::tiled::{CHUNK_SIZE, MAX_PIXELS, TiledImage};
use crate::transform::LayerTransform;

// ============================================================================
// PFS PROJECT FILE FORMAT
// ============================================================================

/// Magic header of the layered project format.
const PFS_MAGIC: &str = "PFS1";

/// Maximum number of layers (all depths) in a project file.
pub const MAX_LAYERS: usize = 4096;
/// Maximum group nesting in a project file.
pub const MAX_DEPTH: usize = 64;

/// Serializable project, built from a stack on the calling thread and safe to
/// write from a worker.
#[derive(Serialize, Deserialize)]
pub struct PfsDocument {
    magic: String,
    width: u32,
    height: u32,
    /// Child indices from the root to the active layer.
    active_path: Option<Vec<u32>>,
    /// One coverage byte per canvas pixel.
    selection: Option<Vec<u8>>,
    root: LayerRecord,
}

#[derive(Serialize, Deserialize)]
struct LayerRecord {
    name: String,
    visible: bool,
    locked: bool,
    alpha_locked: bool,
    opacity: f32,
    blend_mode: u8,
    position: (i32, i32),
    transform: LayerTransform,
    body: RecordBody,
}

#[derive(Serialize, Deserialize)]
enum RecordBody {
    Image { width: u32, height: u32, chunks: Vec<ChunkData> },
    Group { isolate: bool, children: Vec<LayerRecord> },
}

/// A single serialisable chunk (64×64 × 4 bytes of pixel data).
#[derive(Serialize, Deserialize)]
struct ChunkData {
    cx: u32,
    cy: u32,
    pixels: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FileError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("invalid format: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Core(#[from] CoreError),
}

fn invalid(msg: impl Into<String>) -> FileError {
    FileError::InvalidFormat(msg.into())
}

// ---- save --------------------------------------------------------------------

/// Snapshot the stack into its file form. Text layers are rasterized with the
/// stack's text engine (or their cached raster); a text layer with neither
/// fails the save.
pub fn build_pfs(stack: &LayerStack) -> Result<PfsDocument, FileError> {
    let root = record_from_layer(stack, stack.root())?;
    let active_path = stack
        .path_of(stack.active_layer_id())
        .map(|p| p.into_iter().map(|i| i as u32).collect());
    Ok(PfsDocument {
        magic: PFS_MAGIC.to_string(),
        width: stack.width(),
        height: stack.height(),
        active_path,
        selection: stack.selection().mask().map(|m| m.as_raw().clone()),
        root,
    })
}

fn record_from_layer(stack: &LayerStack, layer: &Layer) -> Result<LayerRecord, FileError> {
    let body = match layer.content() {
        LayerContent::Image(pixels) => image_body(pixels),
        LayerContent::Text(_) => {
            let converted = layer.convert_to_image(stack.text_engine())?;
            match converted.pixels() {
                Some(pixels) => image_body(pixels),
                None => return Err(CoreError::NotRaster(layer.id()).into()),
            }
        }
        LayerContent::Group(group) => RecordBody::Group {
            isolate: group.isolate,
            children: group
                .children
                .iter()
                .map(|c| record_from_layer(stack, c))
                .collect::<Result<_, _>>()?,
        },
    };
    Ok(LayerRecord {
        name: layer.name.clone(),
        visible: layer.is_visible(),
        locked: layer.is_locked(),
        alpha_locked: layer.is_alpha_locked(),
        opacity: layer.opacity(),
        blend_mode: layer.blend_mode().to_u8(),
        position: layer.position(),
        transform: *layer.transform(),
        body,
    })
}

fn image_body(pixels: &TiledImage) -> RecordBody {
    let chunks = pixels
        .chunk_keys()
        .filter_map(|(cx, cy)| {
            pixels.chunk(cx, cy).map(|c| ChunkData {
                cx,
                cy,
                pixels: c.as_raw().clone(),
            })
        })
        .collect();
    RecordBody::Image {
        width: pixels.width(),
        height: pixels.height(),
        chunks,
    }
}

/// Serialize + write a pre-built document to disk.
pub fn write_pfs(doc: &PfsDocument, path: &Path) -> Result<(), FileError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    bincode::serialize_into(&mut writer, doc)?;
    writer.flush()?;
    Ok(())
}

/// Save a stack as a `.pfs` project file.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn save_pfs(stack: &LayerStack, path: &Path) -> Result<(), FileError> {
    let doc = build_pfs(stack)?;
    write_pfs(&doc, path)?;
    tracing::info!(layers = stack.layer_count(), "saved project");
    Ok(())
}

pub fn encode_pfs(stack: &LayerStack) -> Result<Vec<u8>, FileError> {
    Ok(bincode::serialize(&build_pfs(stack)?)?)
}

// ---- load --------------------------------------------------------------------

/// Load a `.pfs` project file.
#[tracing::instrument(skip_all, fields(path = %path.display()))]
pub fn load_pfs(path: &Path) -> Result<LayerStack, FileError> {
    let raw = std::fs::read(path)?;
    let stack = decode_pfs(&raw)?;
    tracing::info!(layers = stack.layer_count(), "loaded project");
    Ok(stack)
}

/// Decode and validate a project held in memory. Layers get fresh ids.
pub fn decode_pfs(raw: &[u8]) -> Result<LayerStack, FileError> {
    // bincode writes a String as an 8-byte length then the UTF-8 bytes; the
    // 4-char magic sits at 8..12.
    if raw.len() < 12 {
        return Err(invalid("file too small"));
    }
    let magic = std::str::from_utf8(&raw[8..12]).unwrap_or("");
    if magic != PFS_MAGIC {
        return Err(invalid(format!("unknown magic '{magic}'")));
    }
    // No length prefix may claim more bytes than the file holds.
    let doc: PfsDocument = bincode::options()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(raw.len() as u64)
        .deserialize(raw)?;

    if doc.width == 0 || doc.height == 0 {
        return Err(invalid("canvas dimensions cannot be zero"));
    }
    if doc.width > MAX_CANVAS_DIM || doc.height > MAX_CANVAS_DIM {
        return Err(invalid(format!(
            "canvas size {}x{} exceeds maximum allowed {MAX_CANVAS_DIM}x{MAX_CANVAS_DIM}",
            doc.width, doc.height
        )));
    }

    let mut budget = MAX_LAYERS + 1;
    let mut root = layer_from_record(doc.root, 0, &mut budget)?;
    if !root.is_group() {
        return Err(invalid("root record is not a group"));
    }
    root.visible = true;

    let selection = match doc.selection {
        None => Selection::new(doc.width, doc.height),
        Some(raw) => {
            let mask = GrayImage::from_raw(doc.width, doc.height, raw)
                .ok_or_else(|| invalid("selection mask does not match the canvas size"))?;
            Selection::from_mask(doc.width, doc.height, Some(mask))
        }
    };

    let active = doc.active_path.and_then(|path| {
        path.iter()
            .try_fold(&root, |node, &i| node.children().get(i as usize))
            .map(Layer::id)
    });
    Ok(LayerStack::from_parts(doc.width, doc.height, root, active, selection)?)
}

fn layer_from_record(rec: LayerRecord, depth: usize, budget: &mut usize) -> Result<Layer, FileError> {
    if depth > MAX_DEPTH {
        return Err(invalid(format!("layer nesting exceeds {MAX_DEPTH} levels")));
    }
    *budget = budget
        .checked_sub(1)
        .ok_or_else(|| invalid(format!("project contains more than {MAX_LAYERS} layers")))?;

    let blend_mode = BlendMode::try_from_u8(rec.blend_mode)?;
    let t = rec.transform;
    let transform = LayerTransform::new(t.offset(), t.scale(), t.rotation(), t.origin())?;
    if !rec.opacity.is_finite() {
        return Err(invalid(format!("layer '{}' has a non-finite opacity", rec.name)));
    }

    let mut layer = match rec.body {
        RecordBody::Image { width, height, chunks } => {
            Layer::new_image(rec.name.clone(), tiled_from_chunks(&rec.name, width, height, chunks)?)
        }
        RecordBody::Group { isolate, children } => {
            let mut group = Layer::new_group(rec.name.clone()).with_isolate(isolate);
            let mut built = Vec::with_capacity(children.len());
            for child in children {
                built.push(layer_from_record(child, depth + 1, budget)?);
            }
            if let Some(slot) = group.children_mut() {
                *slot = built;
            }
            group.adopt(None);
            group
        }
    };
    layer.opacity = rec.opacity.clamp(0.0, 1.0);
    layer.blend_mode = blend_mode;
    layer.visible = rec.visible;
    layer.locked = rec.locked;
    layer.alpha_locked = rec.alpha_locked && !layer.is_group();
    layer.position = rec.position;
    layer.transform = transform;
    Ok(layer)
}

fn tiled_from_chunks(name: &str, width: u32, height: u32, chunks: Vec<ChunkData>) -> Result<TiledImage, FileError> {
    if width == 0 || height == 0 || width > MAX_CANVAS_DIM || height > MAX_CANVAS_DIM || width as u64 * height as u64 > MAX_PIXELS {
        return Err(invalid(format!("layer '{name}' has invalid size {width}x{height}")));
    }
    let expected_chunk_bytes = (CHUNK_SIZE * CHUNK_SIZE * 4) as usize;
    let (cols, rows) = (width.div_ceil(CHUNK_SIZE), height.div_ceil(CHUNK_SIZE));
    let mut tiled = TiledImage::new(width, height);
    for cd in chunks {
        if cd.cx >= cols || cd.cy >= rows {
            return Err(invalid(format!(
                "chunk ({},{}) in layer '{name}' lies outside {width}x{height}",
                cd.cx, cd.cy
            )));
        }
        if cd.pixels.len() != expected_chunk_bytes {
            return Err(invalid(format!(
                "chunk ({},{}) in layer '{name}' has {} bytes, expected {expected_chunk_bytes}",
                cd.cx,
                cd.cy,
                cd.pixels.len(),
            )));
        }
        let chunk = RgbaImage::from_raw(CHUNK_SIZE, CHUNK_SIZE, cd.pixels)
            .ok_or_else(|| invalid(format!("failed to rebuild chunk ({},{}) of layer '{name}'", cd.cx, cd.cy)))?;
        tiled.set_chunk(cd.cx, cd.cy, chunk);
    }
    Ok(tiled)
}

// ============================================================================
// RASTER IMPORT / EXPORT
// ============================================================================

/// Load a `.pfs` project, or any raster format the `image` crate decodes as a
/// single-layer stack named after the file.
pub fn load_image(path: &Path) -> Result<LayerStack, FileError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();
    if ext == "pfs" {
        return load_pfs(path);
    }

    let img = image::open(path)?.to_rgba8();
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || w > MAX_CANVAS_DIM || h > MAX_CANVAS_DIM {
        return Err(invalid(format!("image size {w}x{h} is not supported")));
    }
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Background")
        .to_string();

    let mut stack = LayerStack::new(w, h)?;
    let root = stack.root_id();
    let id = stack.insert_layer(root, 0, Layer::new_image(name, TiledImage::from_rgba_image(&img)))?;
    stack.set_active_layer(id)?;
    tracing::info!(path = %path.display(), w, h, "imported image");
    Ok(stack)
}

/// Flattened output formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExportFormat {
    Png,
    Jpeg,
    Bmp,
    Tga,
}

impl ExportFormat {
    pub fn all() -> &'static [ExportFormat] {
        &[ExportFormat::Png, ExportFormat::Jpeg, ExportFormat::Bmp, ExportFormat::Tga]
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Png => "png",
            ExportFormat::Jpeg => "jpg",
            ExportFormat::Bmp => "bmp",
            ExportFormat::Tga => "tga",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(ExportFormat::Png),
            "jpg" | "jpeg" => Some(ExportFormat::Jpeg),
            "bmp" => Some(ExportFormat::Bmp),
            "tga" => Some(ExportFormat::Tga),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|e| e.to_str()).and_then(Self::from_extension)
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| format!("unknown format '{s}' (png, jpg, bmp, tga)"))
    }
}

/// Encode and write an image. Standalone so it can run on a worker thread.
pub fn encode_and_write(image: &RgbaImage, path: &Path, format: ExportFormat, quality: u8) -> Result<(), FileError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let (w, h) = image.dimensions();

    match format {
        ExportFormat::Png => {
            PngEncoder::new(&mut writer).write_image(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        ExportFormat::Jpeg => {
            let rgb = DynamicImage::ImageRgba8(image.clone()).to_rgb8();
            JpegEncoder::new_with_quality(&mut writer, quality.clamp(1, 100)).encode(
                rgb.as_raw(),
                w,
                h,
                image::ColorType::Rgb8,
            )?;
        }
        ExportFormat::Bmp => {
            BmpEncoder::new(&mut writer).encode(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
        ExportFormat::Tga => {
            TgaEncoder::new(&mut writer).encode(image.as_raw(), w, h, image::ColorType::Rgba8)?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Composite the stack and write it flattened.
pub fn export_composite(stack: &LayerStack, path: &Path, format: ExportFormat, quality: u8) -> Result<(), FileError> {
    let image = compositor::composite(stack);
    encode_and_write(&image, path, format, quality)?;
    tracing::info!(path = %path.display(), ?format, "exported composite");
    Ok(())
}
