//! Layered raster image core: a tree of image, text and group layers,
//! W3C blend-mode compositing over tiled RGBA storage, coalescing undo
//! history and the `.pfs` project format.

#![allow(clippy::too_many_arguments)]

pub mod blend;
pub mod cli;
pub mod compositor;
pub mod error;
pub mod geometry;
pub mod history;
pub mod io;
pub mod layer;
pub mod logger;
pub mod ops;
pub mod project;
pub mod selection;
pub mod settings;
pub mod stack;
pub mod tiled;
pub mod transform;

pub use blend::BlendMode;
pub use error::{CoreError, CoreResult};
pub use geometry::{PixelRect, Point};
pub use history::{OperationKind, UndoHistory};
pub use layer::{Layer, LayerId, LayerKind};
pub use project::Project;
pub use settings::CoreSettings;
pub use stack::LayerStack;
pub use tiled::TiledImage;
pub use transform::LayerTransform;
