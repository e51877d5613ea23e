//! Error types for backend-free operations.

use thiserror::Error;

/// Engine-wide error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Handle refers to a slot that was removed or reused.
    #[error("Stale handle: index {index}, generation {generation}")]
    StaleHandle { index: u32, generation: u32 },

    /// Extent with a zero dimension where a drawable one is required.
    #[error("Invalid extent: {width}x{height}")]
    InvalidExtent { width: u32, height: u32 },

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
