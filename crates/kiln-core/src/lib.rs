//! Core types for the Kiln renderer.
//!
//! This crate holds everything that does not need a graphics device:
//! - Render extents
//! - Generational arenas used for cross-resource references
//! - Vertex layouts and planar geometry descriptions
//! - Engine-wide error type and constants

pub mod arena;
pub mod error;
pub mod extent;
pub mod geometry;
pub mod vertex;

pub use arena::{Arena, Handle};
pub use error::{Error, Result};
pub use extent::Extent;
pub use geometry::{Geometry, GeometryProperties};
pub use vertex::{LineVertex, MeshVertex, QuadVertex};

/// Engine-wide constants
pub mod constants {
    /// Upper bound on frame slots a command executor may rotate through.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 3;
    /// Default number of quads a batch holds before it must flush.
    pub const DEFAULT_QUAD_CAPACITY: u32 = 2_000;
    /// Default number of line segments a batch holds before it must flush.
    pub const DEFAULT_LINE_CAPACITY: u32 = 2_000;
}
