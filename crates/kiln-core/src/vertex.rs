//! GPU vertex layouts.
//!
//! All layouts are `#[repr(C)]` and `Pod` so they can be copied straight into
//! mapped vertex buffers.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3, Vec4};

/// Vertex emitted for each corner of a batched quad.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct QuadVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub color: [f32; 4],
    pub identifier: u32,
}

impl QuadVertex {
    /// Vertices contributed by one quad.
    pub const PER_OBJECT: u32 = 4;
    /// Indices contributed by one quad (two triangles).
    pub const INDICES_PER_OBJECT: u32 = 6;

    /// Build a vertex from glam types.
    pub fn new(position: Vec3, uv: Vec2, normal: Vec3, color: Vec4, identifier: u32) -> Self {
        Self {
            position: position.to_array(),
            uv: uv.to_array(),
            normal: normal.to_array(),
            color: color.to_array(),
            identifier,
        }
    }
}

/// Vertex emitted for each end of a batched line segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct LineVertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
}

impl LineVertex {
    /// Vertices contributed by one line segment.
    pub const PER_OBJECT: u32 = 2;
    /// Indices contributed by one line segment.
    pub const INDICES_PER_OBJECT: u32 = 2;

    /// Build a vertex from glam types.
    pub fn new(position: Vec3, color: Vec4) -> Self {
        Self {
            position: position.to_array(),
            color: color.to_array(),
        }
    }
}

/// Vertex layout for uploaded meshes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct MeshVertex {
    pub position: [f32; 3],
    pub uv: [f32; 2],
    pub normal: [f32; 3],
    pub color: [f32; 4],
}

impl MeshVertex {
    /// Build a vertex from glam types.
    pub fn new(position: Vec3, uv: Vec2, normal: Vec3, color: Vec4) -> Self {
        Self {
            position: position.to_array(),
            uv: uv.to_array(),
            normal: normal.to_array(),
            color: color.to_array(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layouts_are_tightly_packed() {
        assert_eq!(std::mem::size_of::<QuadVertex>(), 52);
        assert_eq!(std::mem::size_of::<LineVertex>(), 28);
        assert_eq!(std::mem::size_of::<MeshVertex>(), 48);
    }

    #[test]
    fn quad_vertex_bytes_match_fields() {
        let vertex = QuadVertex::new(Vec3::X, Vec2::Y, Vec3::Z, Vec4::ONE, 7);
        let bytes = bytemuck::bytes_of(&vertex);
        assert_eq!(bytes.len(), 52);
        assert_eq!(&bytes[48..52], &7u32.to_ne_bytes());
    }
}
