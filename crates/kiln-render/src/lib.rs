//! Geometry batching and frame orchestration for the Kiln renderer.
//!
//! This crate provides:
//! - The geometry batch accumulator for quads and lines
//! - Per-slot GPU storage for batches
//! - Device-local meshes
//! - The frame renderer and its built-in pipelines
//! - Camera matrices and attachment capture

pub mod batch;
pub mod batch_renderer;
pub mod camera;
pub mod error;
pub mod mesh;
pub mod renderer;
pub mod screenshot;

pub use batch::{BatchFull, BatchKind, BatchPushConstants, EmplacePlan, GeometryBatch, IndexedDraw};
pub use batch_renderer::{BatchRenderer, BATCH_PUSH_CONSTANT_STAGES};
pub use camera::{Camera, CameraUniforms};
pub use error::{RenderError, Result};
pub use mesh::{Mesh, MeshData};
pub use renderer::{Renderer, RendererConfig, ShaderPair, ShaderSet};
pub use screenshot::{capture_attachment, save_rgba, ScreenshotError};
