//! Indexed meshes uploaded to device-local memory.

use crate::error::Result;
use glam::{Vec2, Vec3, Vec4};
use kiln_core::MeshVertex;
use kiln_gpu::{Buffer, BufferKind, GpuContext, GpuError};

/// CPU-side mesh contents.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    /// Axis-aligned cube of edge `size` centred at the origin, one colour per face.
    pub fn cube(size: f32) -> Self {
        let h = size * 0.5;
        let faces: [(Vec3, Vec3, Vec3, Vec4); 6] = [
            (Vec3::X, Vec3::NEG_Z, Vec3::Y, Vec4::new(0.9, 0.3, 0.3, 1.0)),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y, Vec4::new(0.3, 0.9, 0.3, 1.0)),
            (Vec3::Y, Vec3::X, Vec3::NEG_Z, Vec4::new(0.3, 0.3, 0.9, 1.0)),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z, Vec4::new(0.9, 0.9, 0.3, 1.0)),
            (Vec3::Z, Vec3::X, Vec3::Y, Vec4::new(0.3, 0.9, 0.9, 1.0)),
            (Vec3::NEG_Z, Vec3::NEG_X, Vec3::Y, Vec4::new(0.9, 0.3, 0.9, 1.0)),
        ];

        let mut data = Self::default();
        for (normal, right, up, color) in faces {
            let base = data.vertices.len() as u32;
            let centre = normal * h;
            let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
            for (u, v) in corners {
                let position = centre + right * (u * h) + up * (v * h);
                let uv = Vec2::new((u + 1.0) * 0.5, (v + 1.0) * 0.5);
                data.vertices.push(MeshVertex::new(position, uv, normal, color));
            }
            data.indices
                .extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }
        data
    }

    /// Check every index refers to a vertex.
    pub fn validate(&self) -> std::result::Result<(), GpuError> {
        if self.indices.is_empty() || self.vertices.is_empty() {
            return Err(GpuError::InvalidDescription("mesh is empty".into()));
        }
        let count = self.vertices.len() as u32;
        match self.indices.iter().find(|&&i| i >= count) {
            Some(i) => Err(GpuError::InvalidDescription(format!(
                "index {i} out of range for {count} vertices"
            ))),
            None => Ok(()),
        }
    }
}

/// Device-local vertex and index buffers.
pub struct Mesh {
    name: String,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
}

impl Mesh {
    /// Upload `data` through staging buffers.
    pub fn new(gpu: &GpuContext, name: impl Into<String>, data: &MeshData) -> Result<Self> {
        data.validate()?;
        let name = name.into();
        let vertex_name = format!("{name} vertices");
        let mut vertex_buffer =
            Buffer::from_slice(gpu, BufferKind::Vertex, vertex_name, &data.vertices)?;
        let index_name = format!("{name} indices");
        let index_buffer =
            match Buffer::from_slice(gpu, BufferKind::Index, index_name, &data.indices) {
                Ok(buffer) => buffer,
                Err(e) => {
                    vertex_buffer.destroy(gpu);
                    return Err(e.into());
                }
            };
        tracing::debug!(
            %name,
            vertices = data.vertices.len(),
            indices = data.indices.len(),
            "mesh uploaded"
        );
        Ok(Self {
            name,
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn index_count(&self) -> u32 {
        self.index_count
    }

    pub const fn vertex_buffer(&self) -> &Buffer {
        &self.vertex_buffer
    }

    pub const fn index_buffer(&self) -> &Buffer {
        &self.index_buffer
    }

    /// Release both buffers. Further calls do nothing.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        self.vertex_buffer.destroy(gpu);
        self.index_buffer.destroy(gpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cube_has_six_faces() {
        let cube = MeshData::cube(2.0);
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.validate().is_ok());
        for vertex in &cube.vertices {
            let max = vertex.position.iter().fold(0.0f32, |m, c| m.max(c.abs()));
            assert!((max - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn out_of_range_indices_are_rejected() {
        let mut mesh = MeshData::cube(1.0);
        mesh.indices.push(24);
        assert!(matches!(
            mesh.validate(),
            Err(GpuError::InvalidDescription(_))
        ));
        assert!(MeshData::default().validate().is_err());
    }
}
