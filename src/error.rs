use crate::layer::LayerId;

pub type CoreResult<T> = Result<T, CoreError>;

/// Recoverable failures of stack operations. When one of these is returned
/// the tree has not been modified.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("placing layer {layer} under {parent} would create a cycle")]
    Cycle { layer: LayerId, parent: LayerId },

    #[error("layer {0} or one of its ancestors is locked")]
    Locked(LayerId),

    #[error("cannot merge layer {layer}: {reason}")]
    Merge { layer: LayerId, reason: String },

    #[error("layer {0} is locked for editing")]
    LayerLocked(LayerId),

    #[error("layer {0} is hidden")]
    InvisibleLayer(LayerId),

    #[error("degenerate geometry: {0}")]
    Bounds(String),

    #[error("unsupported blend mode: {0}")]
    UnsupportedBlendMode(String),

    #[error("layer {0} not found")]
    LayerNotFound(LayerId),

    #[error("layer {0} is not a group")]
    NotAGroup(LayerId),

    #[error("layer {0} does not hold raster content")]
    NotRaster(LayerId),

    #[error("layer {0} is not a text layer")]
    NotText(LayerId),

    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn bounds(msg: impl Into<String>) -> Self {
        Self::Bounds(msg.into())
    }

    pub fn merge(layer: LayerId, reason: impl Into<String>) -> Self {
        Self::Merge {
            layer,
            reason: reason.into(),
        }
    }

    pub fn unsupported_blend(what: impl Into<String>) -> Self {
        Self::UnsupportedBlendMode(what.into())
    }
}
