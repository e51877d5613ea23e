//! GPU resources backing a geometry batch.
//!
//! Every frame slot owns a host-visible vertex buffer split into `segments`
//! regions of `capacity` objects each. A flush writes the batch into the next
//! free region and records one indexed draw against a shared, device-local
//! index buffer holding the pre-generated index pattern.

use crate::batch::{BatchFull, BatchKind, BatchPushConstants, GeometryBatch, IndexedDraw};
use crate::error::{RenderError, Result};
use ash::vk;
use kiln_core::GeometryProperties;
use kiln_gpu::{Buffer, BufferKind, BufferProperties, GpuContext, GraphicsPipeline};

/// Stages the batch pipelines expose [`BatchPushConstants`] to.
pub const BATCH_PUSH_CONSTANT_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::VERTEX;

/// Batch accumulator plus its per-slot vertex storage.
pub struct BatchRenderer {
    batch: GeometryBatch,
    vertex_buffers: Vec<Buffer>,
    index_buffer: Buffer,
    segments: u32,
    segment: u32,
    slot: usize,
}

impl BatchRenderer {
    /// Allocate buffers for `slots` frame slots.
    pub fn construct(
        gpu: &GpuContext,
        kind: BatchKind,
        capacity: u32,
        segments: u32,
        slots: usize,
    ) -> Result<Self> {
        let batch = GeometryBatch::new(kind, capacity);
        let capacity = batch.capacity();
        let segments = segments.max(1);

        let indices = kind.generate_indices(capacity);
        let index_buffer =
            Buffer::from_slice(gpu, BufferKind::Index, format!("{kind} indices"), &indices)?;

        let objects = capacity * segments;
        let bytes = kind.object_bytes() * u64::from(objects);
        let mut vertex_buffers = Vec::with_capacity(slots);
        for slot in 0..slots {
            let props = BufferProperties::sized(format!("{kind} vertices {slot}"), bytes, objects)
                .always_mapped(true);
            match Buffer::new(gpu, BufferKind::Vertex, props) {
                Ok(buffer) => vertex_buffers.push(buffer),
                Err(e) => {
                    let mut partial = Self {
                        batch,
                        vertex_buffers,
                        index_buffer,
                        segments,
                        segment: 0,
                        slot: 0,
                    };
                    partial.destroy(gpu);
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(%kind, capacity, segments, slots, "batch resources constructed");
        Ok(Self {
            batch,
            vertex_buffers,
            index_buffer,
            segments,
            segment: 0,
            slot: 0,
        })
    }

    pub const fn kind(&self) -> BatchKind {
        self.batch.kind()
    }

    pub const fn batch(&self) -> &GeometryBatch {
        &self.batch
    }

    /// Start accumulating for frame slot `slot`.
    pub fn begin_frame(&mut self, slot: usize) {
        self.batch.reset();
        self.segment = 0;
        self.slot = slot;
    }

    /// Append one object. Fails when the CPU batch is full.
    pub fn emplace(
        &mut self,
        properties: &GeometryProperties,
    ) -> std::result::Result<(), BatchFull> {
        self.batch.emplace(properties)
    }

    /// True while another flush fits in this slot's vertex buffer.
    pub const fn has_free_segment(&self) -> bool {
        self.segment < self.segments
    }

    /// Upload the batch and record one indexed draw.
    ///
    /// Does nothing for an empty batch. The pipeline must already belong to a
    /// render pass being recorded into `cmd` and declare a
    /// [`BatchPushConstants`] range. A null `descriptor_set` is not bound.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn submit(
        &mut self,
        gpu: &GpuContext,
        cmd: vk::CommandBuffer,
        pipeline: &GraphicsPipeline,
        descriptor_set: vk::DescriptorSet,
    ) -> Result<Option<IndexedDraw>> {
        if self.batch.is_empty() {
            return Ok(None);
        }
        if !self.has_free_segment() {
            return Err(RenderError::BatchCapacity {
                kind: self.kind(),
                capacity: self.batch.capacity() * self.segments,
            });
        }

        let segment_bytes = self.kind().object_bytes() * u64::from(self.batch.capacity());
        let offset = segment_bytes * u64::from(self.segment);
        let vertex_buffer = self.vertex_buffers.get_mut(self.slot).ok_or_else(|| {
            RenderError::Gpu(kiln_gpu::GpuError::ResourceNotFound(format!(
                "{} vertex buffer for slot {}",
                self.batch.kind(),
                self.slot
            )))
        })?;
        vertex_buffer.set_data(gpu, self.batch.vertex_bytes(), offset)?;
        let vertex_handle = vertex_buffer.handle();

        let Some(draw) = self.batch.take_draw() else {
            return Ok(None);
        };
        let constants = BatchPushConstants::for_draw(&draw, self.segment);
        let device = gpu.device();
        unsafe {
            pipeline.bind(device, cmd);
            if descriptor_set != vk::DescriptorSet::null() {
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    0,
                    &[descriptor_set],
                    &[],
                );
            }
            device.cmd_push_constants(
                cmd,
                pipeline.layout(),
                BATCH_PUSH_CONSTANT_STAGES,
                0,
                bytemuck::bytes_of(&constants),
            );
            device.cmd_bind_vertex_buffers(cmd, 0, &[vertex_handle], &[offset]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.handle(), 0, vk::IndexType::UINT32);
            device.cmd_draw_indexed(cmd, draw.index_count, 1, 0, 0, 0);
        }
        self.segment += 1;
        tracing::trace!(
            kind = %self.kind(),
            objects = draw.objects,
            segment = self.segment,
            "batch flushed"
        );
        Ok(Some(draw))
    }

    /// Release every buffer. Further calls do nothing.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        for buffer in &mut self.vertex_buffers {
            buffer.destroy(gpu);
        }
        self.vertex_buffers.clear();
        self.index_buffer.destroy(gpu);
    }
}
