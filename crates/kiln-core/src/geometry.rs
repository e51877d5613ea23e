//! Planar geometry descriptions for immediate-mode drawing.

use crate::vertex::{LineVertex, QuadVertex};
use glam::{Mat4, Quat, Vec2, Vec3, Vec4};

/// Primitive kinds accepted by the planar geometry path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Geometry {
    /// Unit quad scaled by `dimensions`.
    Rectangle,
    /// Segment from `position` to `to_position`.
    Line,
}

/// Placement and appearance of one planar primitive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryProperties {
    pub position: Vec3,
    pub to_position: Vec3,
    pub dimensions: Vec3,
    pub rotation: Quat,
    pub color: Vec4,
    pub identifier: Option<u32>,
}

impl Default for GeometryProperties {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            to_position: Vec3::ZERO,
            dimensions: Vec3::ONE,
            rotation: Quat::IDENTITY,
            color: Vec4::ONE,
            identifier: None,
        }
    }
}

const QUAD_CORNERS: [Vec3; 4] = [
    Vec3::new(-0.5, -0.5, 0.0),
    Vec3::new(0.5, -0.5, 0.0),
    Vec3::new(0.5, 0.5, 0.0),
    Vec3::new(-0.5, 0.5, 0.0),
];

const QUAD_UVS: [Vec2; 4] = [
    Vec2::new(0.0, 0.0),
    Vec2::new(1.0, 0.0),
    Vec2::new(1.0, 1.0),
    Vec2::new(0.0, 1.0),
];

impl GeometryProperties {
    /// Rectangle centred at `position` with the given size.
    pub fn rectangle(position: Vec3, dimensions: Vec2) -> Self {
        Self {
            position,
            dimensions: dimensions.extend(1.0),
            ..Default::default()
        }
    }

    /// Line segment between two points.
    pub fn line(from: Vec3, to: Vec3) -> Self {
        Self {
            position: from,
            to_position: to,
            ..Default::default()
        }
    }

    /// Set the colour.
    #[must_use]
    pub const fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }

    /// Set the rotation.
    #[must_use]
    pub const fn with_rotation(mut self, rotation: Quat) -> Self {
        self.rotation = rotation;
        self
    }

    /// Tag the primitive with a picking identifier.
    #[must_use]
    pub const fn with_identifier(mut self, identifier: u32) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Model transform: translate, then rotate, then scale.
    pub fn to_transform(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.dimensions, self.rotation, self.position)
    }

    /// The four corners of the transformed unit quad, counter-clockwise.
    pub fn quad_vertices(&self) -> [QuadVertex; 4] {
        let transform = self.to_transform();
        let identifier = self.identifier.unwrap_or(0);
        std::array::from_fn(|i| {
            QuadVertex::new(
                transform.transform_point3(QUAD_CORNERS[i]),
                QUAD_UVS[i],
                Vec3::NEG_Y,
                self.color,
                identifier,
            )
        })
    }

    /// The two end points of the segment.
    pub fn line_vertices(&self) -> [LineVertex; 2] {
        [
            LineVertex::new(self.position, self.color),
            LineVertex::new(self.to_position, self.color),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn unit_quad_at_origin() {
        let vertices = GeometryProperties::default().quad_vertices();
        assert_eq!(vertices[0].position, [-0.5, -0.5, 0.0]);
        assert_eq!(vertices[2].position, [0.5, 0.5, 0.0]);
        assert_eq!(vertices[3].uv, [0.0, 1.0]);
        assert_eq!(vertices[1].identifier, 0);
    }

    #[test]
    fn quad_is_scaled_then_translated() {
        let props = GeometryProperties::rectangle(Vec3::new(10.0, 5.0, 0.0), Vec2::new(4.0, 2.0))
            .with_identifier(9);
        let vertices = props.quad_vertices();
        assert_relative_eq!(Vec3::from(vertices[0].position), Vec3::new(8.0, 4.0, 0.0));
        assert_relative_eq!(Vec3::from(vertices[2].position), Vec3::new(12.0, 6.0, 0.0));
        assert!(vertices.iter().all(|v| v.identifier == 9));
    }

    #[test]
    fn rotation_applies_before_translation() {
        let props = GeometryProperties::rectangle(Vec3::new(1.0, 0.0, 0.0), Vec2::new(2.0, 2.0))
            .with_rotation(Quat::from_rotation_z(FRAC_PI_2));
        let vertices = props.quad_vertices();
        // (1, -1) rotated by 90 degrees is (1, 1), then shifted by +1 on x.
        let corner = Vec3::from(vertices[1].position);
        assert_relative_eq!(corner, Vec3::new(2.0, 1.0, 0.0), epsilon = 1e-5);
    }

    #[test]
    fn line_keeps_endpoints_and_colour() {
        let color = Vec4::new(1.0, 0.0, 0.0, 1.0);
        let props =
            GeometryProperties::line(Vec3::ZERO, Vec3::new(3.0, 4.0, 0.0)).with_color(color);
        let [a, b] = props.line_vertices();
        assert_eq!(a.position, [0.0, 0.0, 0.0]);
        assert_eq!(b.position, [3.0, 4.0, 0.0]);
        assert_eq!(a.color, color.to_array());
        assert_eq!(b.color, a.color);
    }
}
