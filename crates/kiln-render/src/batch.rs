//! CPU-side accumulation of planar geometry into indexed draws.
//!
//! A [`GeometryBatch`] collects vertices for one primitive kind. Each flush
//! produces at most one indexed draw covering every object in the batch; an
//! empty batch produces none.

use bytemuck::{Pod, Zeroable};
use kiln_core::{Geometry, GeometryProperties, LineVertex, QuadVertex};
use std::fmt;
use std::mem::size_of;
use thiserror::Error;

/// Primitive kind a batch accumulates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BatchKind {
    Quads,
    Lines,
}

impl BatchKind {
    pub const ALL: [Self; 2] = [Self::Quads, Self::Lines];

    /// Batch kind that draws a planar geometry primitive.
    pub const fn for_geometry(geometry: Geometry) -> Self {
        match geometry {
            Geometry::Rectangle => Self::Quads,
            Geometry::Line => Self::Lines,
        }
    }

    pub const fn vertices_per_object(self) -> u32 {
        match self {
            Self::Quads => QuadVertex::PER_OBJECT,
            Self::Lines => LineVertex::PER_OBJECT,
        }
    }

    pub const fn indices_per_object(self) -> u32 {
        match self {
            Self::Quads => QuadVertex::INDICES_PER_OBJECT,
            Self::Lines => LineVertex::INDICES_PER_OBJECT,
        }
    }

    /// Size of one vertex in bytes.
    pub const fn vertex_stride(self) -> u64 {
        match self {
            Self::Quads => size_of::<QuadVertex>() as u64,
            Self::Lines => size_of::<LineVertex>() as u64,
        }
    }

    /// Bytes of vertex data one object occupies.
    pub const fn object_bytes(self) -> u64 {
        self.vertex_stride() * self.vertices_per_object() as u64
    }

    /// Key of the pipeline that draws this kind.
    pub const fn pipeline_key(self) -> &'static str {
        match self {
            Self::Quads => "quad",
            Self::Lines => "line",
        }
    }

    /// Index pattern for `objects` objects.
    ///
    /// Quads use `0,1,2, 2,3,0` offset by four per quad; lines are sequential.
    pub fn generate_indices(self, objects: u32) -> Vec<u32> {
        match self {
            Self::Quads => (0..objects)
                .flat_map(|quad| {
                    let base = quad * 4;
                    [base, base + 1, base + 2, base + 2, base + 3, base]
                })
                .collect(),
            Self::Lines => (0..objects * 2).collect(),
        }
    }
}

impl fmt::Display for BatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Quads => "quads",
            Self::Lines => "lines",
        })
    }
}

/// Returned by [`GeometryBatch::emplace`] when the batch holds `capacity` objects.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} batch is full")]
pub struct BatchFull {
    pub kind: BatchKind,
}

/// One flushed batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexedDraw {
    pub objects: u32,
    pub index_count: u32,
    pub vertex_bytes: u64,
}

/// Push constants of the batch pipelines, visible to both stages.
///
/// `max_identifiers` is the object count of the flush; identifiers in the
/// draw run from zero up to it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct BatchPushConstants {
    pub max_identifiers: u32,
    /// Vertex segment of the slot buffer the draw reads from.
    pub segment: u32,
    pub _padding: [u32; 2],
}

impl BatchPushConstants {
    /// Size of the push-constant range the batch pipelines declare.
    pub const SIZE: u32 = size_of::<Self>() as u32;

    pub const fn for_draw(draw: &IndexedDraw, segment: u32) -> Self {
        Self {
            max_identifiers: draw.objects,
            segment,
            _padding: [0; 2],
        }
    }
}

/// How to handle one more object for a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmplacePlan {
    /// The batch has room.
    Append,
    /// Flush the full batch into the next vertex segment, then append.
    FlushThenAppend,
    /// Report the overflow as a capacity error.
    Reject,
}

impl EmplacePlan {
    /// Overflow policy: a full batch restarts while a pass is recording and
    /// the slot still has a free segment.
    pub const fn decide(full: bool, pass_active: bool, free_segment: bool) -> Self {
        match (full, pass_active && free_segment) {
            (false, _) => Self::Append,
            (true, true) => Self::FlushThenAppend,
            (true, false) => Self::Reject,
        }
    }
}

/// Fixed-capacity vertex accumulator for one primitive kind.
#[derive(Clone, Debug)]
pub struct GeometryBatch {
    kind: BatchKind,
    capacity: u32,
    objects: u32,
    vertices: Vec<u8>,
}

impl GeometryBatch {
    /// Batch holding at most `capacity` objects (at least one).
    pub fn new(kind: BatchKind, capacity: u32) -> Self {
        let capacity = capacity.max(1);
        Self {
            kind,
            capacity,
            objects: 0,
            vertices: Vec::with_capacity((kind.object_bytes() * u64::from(capacity)) as usize),
        }
    }

    pub const fn kind(&self) -> BatchKind {
        self.kind
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Objects accumulated since the last flush.
    pub const fn len(&self) -> u32 {
        self.objects
    }

    pub const fn is_empty(&self) -> bool {
        self.objects == 0
    }

    pub const fn is_full(&self) -> bool {
        self.objects >= self.capacity
    }

    /// True when one more object would fill the batch.
    pub const fn would_be_full(&self) -> bool {
        self.objects + 1 >= self.capacity
    }

    pub const fn index_count(&self) -> u32 {
        self.objects * self.kind.indices_per_object()
    }

    /// Accumulated vertex bytes.
    pub fn vertex_bytes(&self) -> &[u8] {
        &self.vertices
    }

    /// Append one object's vertices.
    #[inline]
    pub fn emplace(&mut self, properties: &GeometryProperties) -> Result<(), BatchFull> {
        if self.is_full() {
            return Err(BatchFull { kind: self.kind });
        }
        match self.kind {
            BatchKind::Quads => self
                .vertices
                .extend_from_slice(bytemuck::cast_slice(&properties.quad_vertices())),
            BatchKind::Lines => self
                .vertices
                .extend_from_slice(bytemuck::cast_slice(&properties.line_vertices())),
        }
        self.objects += 1;
        Ok(())
    }

    /// Describe the pending draw and reset the cursor. `None` when empty.
    pub fn take_draw(&mut self) -> Option<IndexedDraw> {
        if self.is_empty() {
            return None;
        }
        let draw = IndexedDraw {
            objects: self.objects,
            index_count: self.index_count(),
            vertex_bytes: self.vertices.len() as u64,
        };
        self.reset();
        Some(draw)
    }

    /// Drop accumulated objects.
    pub fn reset(&mut self) {
        self.objects = 0;
        self.vertices.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Vec2, Vec3};

    fn quad(x: f32) -> GeometryProperties {
        GeometryProperties::rectangle(Vec3::new(x, 0.0, 0.0), Vec2::ONE)
    }

    #[test]
    fn empty_batch_issues_no_draw() {
        let mut batch = GeometryBatch::new(BatchKind::Quads, 16);
        assert_eq!(batch.take_draw(), None);
        assert_eq!(batch.index_count(), 0);
    }

    #[test]
    fn quads_flush_six_indices_each() {
        let mut batch = GeometryBatch::new(BatchKind::Quads, 16);
        for i in 0..5 {
            batch.emplace(&quad(i as f32)).unwrap();
        }
        assert_eq!(batch.index_count(), 30);
        assert_eq!(batch.vertex_bytes().len(), 5 * 4 * 52);

        let draw = batch.take_draw().unwrap();
        assert_eq!(draw.objects, 5);
        assert_eq!(draw.index_count, 30);
        assert_eq!(draw.vertex_bytes, 5 * 4 * 52);

        // The cursor is reset by the flush.
        assert!(batch.is_empty());
        assert_eq!(batch.take_draw(), None);
    }

    #[test]
    fn lines_flush_two_indices_each() {
        let mut batch = GeometryBatch::new(BatchKind::Lines, 8);
        batch
            .emplace(&GeometryProperties::line(Vec3::ZERO, Vec3::X))
            .unwrap();
        batch
            .emplace(&GeometryProperties::line(Vec3::X, Vec3::Y))
            .unwrap();
        let draw = batch.take_draw().unwrap();
        assert_eq!(draw.index_count, 4);
        assert_eq!(draw.vertex_bytes, 2 * 2 * 28);
    }

    #[test]
    fn capacity_is_enforced() {
        let mut batch = GeometryBatch::new(BatchKind::Quads, 3);
        batch.emplace(&quad(0.0)).unwrap();
        assert!(!batch.would_be_full());
        batch.emplace(&quad(1.0)).unwrap();
        assert!(batch.would_be_full());
        assert!(!batch.is_full());
        batch.emplace(&quad(2.0)).unwrap();
        assert!(batch.is_full());
        assert_eq!(
            batch.emplace(&quad(3.0)),
            Err(BatchFull {
                kind: BatchKind::Quads
            })
        );
        assert_eq!(batch.len(), 3);
    }

    #[test]
    fn quad_index_pattern() {
        let indices = BatchKind::Quads.generate_indices(2);
        assert_eq!(indices, [0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4]);
        assert_eq!(BatchKind::Lines.generate_indices(2), [0, 1, 2, 3]);
    }

    #[test]
    fn push_constants_carry_the_flushed_object_count() {
        let mut batch = GeometryBatch::new(BatchKind::Quads, 16);
        for i in 0..7 {
            batch.emplace(&quad(i as f32)).unwrap();
        }
        let draw = batch.take_draw().unwrap();
        let constants = BatchPushConstants::for_draw(&draw, 2);
        assert_eq!(constants.max_identifiers, 7);
        assert_eq!(constants.segment, 2);
        assert_eq!(BatchPushConstants::SIZE, 16);
        assert_eq!(bytemuck::bytes_of(&constants)[..4], 7u32.to_ne_bytes());
    }

    #[test]
    fn overflow_flushes_only_inside_a_pass_with_a_free_segment() {
        assert_eq!(EmplacePlan::decide(false, false, false), EmplacePlan::Append);
        assert_eq!(EmplacePlan::decide(false, true, true), EmplacePlan::Append);
        assert_eq!(EmplacePlan::decide(true, true, true), EmplacePlan::FlushThenAppend);
        // No pass recording.
        assert_eq!(EmplacePlan::decide(true, false, true), EmplacePlan::Reject);
        // Segments exhausted.
        assert_eq!(EmplacePlan::decide(true, true, false), EmplacePlan::Reject);
    }

    #[test]
    fn kinds_map_from_geometry() {
        assert_eq!(BatchKind::for_geometry(Geometry::Rectangle), BatchKind::Quads);
        assert_eq!(BatchKind::for_geometry(Geometry::Line), BatchKind::Lines);
        assert_eq!(BatchKind::Quads.pipeline_key(), "quad");
        assert_eq!(BatchKind::Lines.object_bytes(), 56);
    }
}
