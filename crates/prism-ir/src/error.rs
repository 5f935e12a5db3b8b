//! Error types for the Prism IR.

/// Errors that can occur when constructing, editing or decoding IR.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle index is out of bounds for its arena.
    #[error("handle index {index} out of bounds (arena size: {size})")]
    BadHandle { index: usize, size: usize },

    /// An instruction used as an insertion anchor is not in any block.
    #[error("instruction {0} is not attached to a block")]
    Detached(usize),

    /// The module could not be encoded or decoded.
    #[error("malformed module JSON: {0}")]
    Json(#[from] serde_json::Error),
}
