//! Error types for allocfs.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all allocfs operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the followed file or the stream sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error on the frame wire format.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Allocation id missing from the request path.
    #[error("allocation id not present")]
    AllocIdNotPresent,

    /// File path missing from the request query.
    #[error("file name not present")]
    FileNameNotPresent,

    /// Origin was neither `start` nor `end`.
    #[error("invalid origin {0:?}")]
    InvalidOrigin(String),

    /// Offset did not parse as a non-negative integer.
    #[error("invalid offset {0:?}")]
    InvalidOffset(String),

    /// Read limit did not parse as an integer.
    #[error("invalid limit {0:?}")]
    InvalidLimit(String),

    /// No allocation registered under the given id.
    #[error("unknown allocation {0:?}")]
    UnknownAlloc(String),

    /// Path does not exist under the allocation root.
    #[error("path {0:?} not found")]
    NotFound(String),

    /// Path escapes the allocation root.
    #[error("path {0:?} escapes allocation directory")]
    Forbidden(String),

    /// Write to the stream sink failed. Sticky on the framer: every
    /// subsequent send returns the same error.
    #[error("sink write failed: {0}")]
    Sink(Arc<std::io::Error>),

    /// Send was called on a destroyed framer.
    #[error("framer destroyed")]
    FramerDestroyed,
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
