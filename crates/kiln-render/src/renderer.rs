//! Frame orchestration on top of the GPU layer.
//!
//! The [`Renderer`] owns the swapchain render pass and framebuffer, the
//! `quad`, `line` and `mesh` pipelines, per-slot camera uniforms and the
//! geometry batches. A frame is recorded as:
//!
//! 1. [`CommandExecutor::begin`], then [`Renderer::begin_frame`]
//! 2. [`Renderer::begin_pass`]
//! 3. any number of [`Renderer::draw_mesh`] and [`Renderer::draw_planar_geometry`]
//! 4. [`Renderer::end_pass`], which flushes pending batches
//! 5. [`CommandExecutor::submit_and_end`]

use crate::batch::{BatchKind, BatchPushConstants, EmplacePlan};
use crate::batch_renderer::{BatchRenderer, BATCH_PUSH_CONSTANT_STAGES};
use crate::camera::CameraUniforms;
use crate::error::{RenderError, Result};
use crate::mesh::Mesh;
use ash::vk;
use glam::Mat4;
use kiln_core::constants::{DEFAULT_LINE_CAPACITY, DEFAULT_QUAD_CAPACITY, MAX_FRAMES_IN_FLIGHT};
use kiln_core::{Extent, Geometry, GeometryProperties, Handle, LineVertex, MeshVertex, QuadVertex};
use kiln_gpu::{
    find_depth_format, write_uniform_buffer, BlendMode, Buffer, BufferKind, BufferProperties,
    CommandExecutor, DescriptorPool, DescriptorSetLayoutBuilder, Framebuffer, FramebufferProperties,
    GpuContext, GpuError, GraphicsPipeline, PipelineCache, PipelineProperties, RenderPass,
    RenderPassProperties, Swapchain, VulkanRenderTargets, VulkanTargetContext,
};
use std::mem::size_of;
use std::path::PathBuf;

/// SPIR-V for one pipeline.
#[derive(Clone, Debug, Default)]
pub struct ShaderPair {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderPair {
    pub const fn new(vertex: Vec<u32>, fragment: Vec<u32>) -> Self {
        Self { vertex, fragment }
    }
}

impl From<kiln_shaders::Program> for ShaderPair {
    fn from(program: kiln_shaders::Program) -> Self {
        Self::new(program.vertex.to_vec(), program.fragment.to_vec())
    }
}

/// Shaders for the built-in pipelines.
#[derive(Clone, Debug, Default)]
pub struct ShaderSet {
    pub quad: ShaderPair,
    pub line: ShaderPair,
    pub mesh: ShaderPair,
}

impl ShaderSet {
    /// The shaders compiled into `kiln-shaders`.
    pub fn built_in() -> Self {
        Self {
            quad: kiln_shaders::quad().into(),
            line: kiln_shaders::line().into(),
            mesh: kiln_shaders::mesh().into(),
        }
    }
}

/// Renderer configuration.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub shaders: ShaderSet,
    /// Quads per flush.
    pub quad_capacity: u32,
    /// Line segments per flush.
    pub line_capacity: u32,
    /// Flushes per frame slot before a batch reports overflow.
    pub segments: u32,
    /// Requested line width, clamped to the device range.
    pub line_width: f32,
    pub clear_color: [f32; 4],
    pub depth: bool,
    /// Directory for persisted pipeline caches. `None` keeps them in memory.
    pub pipeline_cache_dir: Option<PathBuf>,
}

impl RendererConfig {
    pub fn new(shaders: ShaderSet) -> Self {
        Self {
            shaders,
            quad_capacity: DEFAULT_QUAD_CAPACITY,
            line_capacity: DEFAULT_LINE_CAPACITY,
            segments: 4,
            line_width: 1.0,
            clear_color: [0.02, 0.02, 0.03, 1.0],
            depth: true,
            pipeline_cache_dir: None,
        }
    }

    #[must_use]
    pub const fn with_capacities(mut self, quads: u32, lines: u32) -> Self {
        self.quad_capacity = quads;
        self.line_capacity = lines;
        self
    }

    #[must_use]
    pub const fn with_segments(mut self, segments: u32) -> Self {
        self.segments = segments;
        self
    }

    #[must_use]
    pub const fn with_line_width(mut self, width: f32) -> Self {
        self.line_width = width;
        self
    }

    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    #[must_use]
    pub fn with_pipeline_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pipeline_cache_dir = Some(dir.into());
        self
    }

    /// Quad, line and mesh pipeline properties, in that order.
    ///
    /// Set layouts and extent are left to the caller.
    pub fn pipeline_properties(&self, line_width: f32) -> [PipelineProperties; 3] {
        let shaders = &self.shaders;
        [
            PipelineProperties::new(
                BatchKind::Quads.pipeline_key(),
                shaders.quad.vertex.clone(),
                shaders.quad.fragment.clone(),
            )
            .with_vertex::<QuadVertex>()
            .with_cull_mode(vk::CullModeFlags::NONE)
            .with_blend(BlendMode::Alpha)
            .with_push_constants(BATCH_PUSH_CONSTANT_STAGES, BatchPushConstants::SIZE),
            PipelineProperties::new(
                BatchKind::Lines.pipeline_key(),
                shaders.line.vertex.clone(),
                shaders.line.fragment.clone(),
            )
            .with_vertex::<LineVertex>()
            .with_topology(vk::PrimitiveTopology::LINE_LIST)
            .with_cull_mode(vk::CullModeFlags::NONE)
            .with_blend(BlendMode::Alpha)
            .with_line_width(line_width)
            .with_push_constants(BATCH_PUSH_CONSTANT_STAGES, BatchPushConstants::SIZE),
            PipelineProperties::new(
                "mesh",
                shaders.mesh.vertex.clone(),
                shaders.mesh.fragment.clone(),
            )
            .with_vertex::<MeshVertex>()
            .with_push_constants(vk::ShaderStageFlags::VERTEX, MESH_PUSH_CONSTANT_SIZE),
        ]
        .map(|props| props.with_depth(self.depth, self.depth))
    }
}

/// Push constant block of the mesh pipeline.
const MESH_PUSH_CONSTANT_SIZE: u32 = size_of::<Mat4>() as u32;

#[derive(Clone, Copy, Debug)]
struct ActivePass {
    framebuffer: Handle<Framebuffer>,
    cmd: vk::CommandBuffer,
}

/// Pipelines, targets and batches for one swapchain.
pub struct Renderer {
    targets: VulkanRenderTargets,
    cache: PipelineCache,
    swapchain_pass: Handle<RenderPass>,
    swapchain_framebuffer: Handle<Framebuffer>,
    quad_pipeline: Handle<GraphicsPipeline>,
    line_pipeline: Handle<GraphicsPipeline>,
    mesh_pipeline: Handle<GraphicsPipeline>,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: DescriptorPool,
    descriptor_sets: Vec<vk::DescriptorSet>,
    camera_buffers: Vec<Buffer>,
    quads: BatchRenderer,
    lines: BatchRenderer,
    active: Option<ActivePass>,
    slot: usize,
    image_index: u32,
    draws: u32,
}

impl Renderer {
    /// Build every resource for drawing into `swapchain`.
    ///
    /// Per-slot resources are sized for [`MAX_FRAMES_IN_FLIGHT`], so the
    /// executor may change its slot count on recreation.
    pub fn new(
        gpu: &GpuContext,
        swapchain: &Swapchain,
        executor: &CommandExecutor,
        config: RendererConfig,
    ) -> Result<Self> {
        let device = gpu.device();
        let extent = swapchain.extent();
        let depth = if config.depth {
            Some(find_depth_format(gpu)?)
        } else {
            None
        };

        let mut targets = VulkanRenderTargets::new(extent);
        let mut cache = match &config.pipeline_cache_dir {
            Some(dir) => PipelineCache::with_directory(dir),
            None => PipelineCache::new(),
        };

        let pass = unsafe {
            RenderPass::new(
                device,
                RenderPassProperties::present("swapchain", swapchain.format(), depth),
            )
        }?;
        let swapchain_pass = targets.add_pass(pass);

        let framebuffer = Framebuffer::for_swapchain(
            gpu,
            targets.pass(swapchain_pass)?,
            FramebufferProperties::new("swapchain", extent, swapchain_pass)
                .with_clear_color(config.clear_color),
            swapchain.views(),
        )?;
        let swapchain_framebuffer = targets.add_framebuffer(framebuffer, swapchain_pass)?;

        let layout_builder = DescriptorSetLayoutBuilder::new().uniform_buffer(
            0,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        );
        let set_layout = unsafe { layout_builder.build(device) }?;

        let slots = MAX_FRAMES_IN_FLIGHT;
        let pool_sizes = layout_builder.pool_sizes(slots as u32);
        let descriptor_pool = unsafe { DescriptorPool::new(device, slots as u32, &pool_sizes) }?;
        let descriptor_sets =
            unsafe { descriptor_pool.allocate(device, &vec![set_layout; slots]) }?;

        let mut camera_buffers = Vec::with_capacity(slots);
        for slot in 0..slots {
            let props = BufferProperties::sized(
                format!("camera {slot}"),
                size_of::<CameraUniforms>() as u64,
                1,
            )
            .always_mapped(true);
            let buffer = Buffer::new(gpu, BufferKind::Uniform, props)?;
            unsafe { write_uniform_buffer(device, descriptor_sets[slot], 0, &buffer) };
            camera_buffers.push(buffer);
        }

        let line_width = gpu.capabilities().clamp_line_width(config.line_width);
        let pipelines = config.pipeline_properties(line_width);

        let mut handles = Vec::with_capacity(pipelines.len());
        for props in pipelines {
            let props = props.with_set_layouts(&[set_layout]).with_extent(extent);
            handles.push(build_pipeline(gpu, &mut targets, &mut cache, swapchain_pass, props)?);
        }
        let [quad_pipeline, line_pipeline, mesh_pipeline] = handles[..] else {
            return Err(GpuError::InvalidState("pipeline set incomplete".into()).into());
        };

        let quads = BatchRenderer::construct(
            gpu,
            BatchKind::Quads,
            config.quad_capacity,
            config.segments,
            slots,
        )?;
        let lines = BatchRenderer::construct(
            gpu,
            BatchKind::Lines,
            config.line_capacity,
            config.segments,
            slots,
        )?;

        tracing::info!(
            extent = %extent,
            slots = executor.slot_count(),
            line_width,
            "renderer ready"
        );

        Ok(Self {
            targets,
            cache,
            swapchain_pass,
            swapchain_framebuffer,
            quad_pipeline,
            line_pipeline,
            mesh_pipeline,
            set_layout,
            descriptor_pool,
            descriptor_sets,
            camera_buffers,
            quads,
            lines,
            active: None,
            slot: 0,
            image_index: 0,
            draws: 0,
        })
    }

    /// Start recording for the executor's current slot and swapchain image.
    ///
    /// Must follow [`CommandExecutor::begin`], which guarantees the slot's
    /// uniform buffer is no longer read by the GPU.
    pub fn begin_frame(
        &mut self,
        gpu: &GpuContext,
        executor: &CommandExecutor,
        image_index: u32,
        view_projection: Mat4,
    ) -> Result<()> {
        let slot = executor.current_slot();
        let uniforms = CameraUniforms::from_matrix(view_projection);
        let buffer = self
            .camera_buffers
            .get_mut(slot)
            .ok_or_else(|| GpuError::ResourceNotFound(format!("camera buffer for slot {slot}")))?;
        buffer.set_data(gpu, bytemuck::bytes_of(&uniforms), 0)?;

        self.quads.begin_frame(slot);
        self.lines.begin_frame(slot);
        self.slot = slot;
        self.image_index = image_index;
        self.draws = 0;
        Ok(())
    }

    /// Begin `target`'s render pass on the executor's command buffer.
    ///
    /// With `explicit_clear`, every attachment is also cleared inside the pass
    /// using the framebuffer's clear values.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn begin_pass(
        &mut self,
        gpu: &GpuContext,
        executor: &CommandExecutor,
        target: Handle<Framebuffer>,
        explicit_clear: bool,
    ) -> Result<()> {
        if self.active.is_some() {
            return Err(GpuError::InvalidState("a render pass is already active".into()).into());
        }
        let cmd = executor.current_buffer()?;
        let framebuffer = self.targets.framebuffer(target)?;
        let pass = self.targets.pass(framebuffer.pass())?;
        let clear_values = framebuffer.clear_values();
        let render_area = framebuffer.render_area();

        let info = vk::RenderPassBeginInfo::default()
            .render_pass(pass.handle())
            .framebuffer(framebuffer.handle(self.image_index)?)
            .render_area(render_area)
            .clear_values(&clear_values);

        let device = gpu.device();
        unsafe {
            device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
        }

        if explicit_clear {
            let color_count = pass.properties().color_formats.len();
            let attachments = clear_attachments(&clear_values, color_count);
            let rects = vec![
                vk::ClearRect {
                    rect: render_area,
                    base_array_layer: 0,
                    layer_count: 1,
                };
                attachments.len()
            ];
            unsafe { device.cmd_clear_attachments(cmd, &attachments, &rects) };
        }

        self.active = Some(ActivePass {
            framebuffer: target,
            cmd,
        });
        Ok(())
    }

    /// Flush pending batches and end the active pass.
    pub fn end_pass(&mut self, gpu: &GpuContext) -> Result<()> {
        let Some(active) = self.active else {
            return Err(RenderError::NoActivePass);
        };
        self.submit_batched_geometry(gpu)?;
        unsafe { gpu.device().cmd_end_render_pass(active.cmd) };
        self.active = None;
        Ok(())
    }

    /// Record one indexed draw of `mesh` with `transform` as its model matrix.
    pub fn draw_mesh(&mut self, gpu: &GpuContext, mesh: &Mesh, transform: Mat4) -> Result<()> {
        let active = self.active.ok_or(RenderError::NoActivePass)?;
        let pipeline = self.targets.pipeline(self.mesh_pipeline)?;
        let set = self.descriptor_set()?;
        let device = gpu.device();
        unsafe {
            pipeline.bind(device, active.cmd);
            device.cmd_bind_descriptor_sets(
                active.cmd,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout(),
                0,
                &[set],
                &[],
            );
            device.cmd_push_constants(
                active.cmd,
                pipeline.layout(),
                vk::ShaderStageFlags::VERTEX,
                0,
                bytemuck::bytes_of(&transform.to_cols_array()),
            );
            device.cmd_bind_vertex_buffers(active.cmd, 0, &[mesh.vertex_buffer().handle()], &[0]);
            device.cmd_bind_index_buffer(
                active.cmd,
                mesh.index_buffer().handle(),
                0,
                vk::IndexType::UINT32,
            );
            device.cmd_draw_indexed(active.cmd, mesh.index_count(), 1, 0, 0, 0);
        }
        self.draws += 1;
        Ok(())
    }

    /// Queue one planar primitive.
    ///
    /// A full batch is flushed and restarted while a pass is active. Outside a
    /// pass, or once the slot has no free vertex segment, overflow is
    /// reported as [`RenderError::BatchCapacity`].
    pub fn draw_planar_geometry(
        &mut self,
        gpu: &GpuContext,
        geometry: Geometry,
        properties: &GeometryProperties,
    ) -> Result<()> {
        let kind = BatchKind::for_geometry(geometry);
        let pass_active = self.active.is_some();
        let batch = self.batch_mut(kind);
        let capacity = batch.batch().capacity();
        let plan =
            EmplacePlan::decide(batch.batch().is_full(), pass_active, batch.has_free_segment());
        match plan {
            EmplacePlan::Append => {}
            EmplacePlan::FlushThenAppend => {
                tracing::trace!(%kind, "batch full, flushing");
                self.flush(gpu, kind)?;
            }
            EmplacePlan::Reject => return Err(RenderError::BatchCapacity { kind, capacity }),
        }
        self.batch_mut(kind)
            .emplace(properties)
            .map_err(|_| RenderError::BatchCapacity { kind, capacity })
    }

    /// Flush every non-empty batch as one indexed draw each. Returns the number of draws.
    pub fn submit_batched_geometry(&mut self, gpu: &GpuContext) -> Result<u32> {
        let mut issued = 0;
        for kind in BatchKind::ALL {
            if self.batch_mut(kind).batch().is_empty() {
                continue;
            }
            if self.active.is_none() {
                return Err(RenderError::NoActivePass);
            }
            if self.flush(gpu, kind)? {
                issued += 1;
            }
        }
        Ok(issued)
    }

    fn flush(&mut self, gpu: &GpuContext, kind: BatchKind) -> Result<bool> {
        let active = self.active.ok_or(RenderError::NoActivePass)?;
        let set = self.descriptor_set()?;
        let (batch, handle) = match kind {
            BatchKind::Quads => (&mut self.quads, self.quad_pipeline),
            BatchKind::Lines => (&mut self.lines, self.line_pipeline),
        };
        let pipeline = self.targets.pipeline(handle)?;
        let drawn = batch.submit(gpu, active.cmd, pipeline, set)?.is_some();
        if drawn {
            self.draws += 1;
        }
        Ok(drawn)
    }

    /// Recreate every extent-dependent resource for a new swapchain.
    ///
    /// Call after the swapchain and the executor have been recreated.
    /// Passes, pipelines, framebuffers and images are rebuilt in that order.
    pub fn set_extent(
        &mut self,
        gpu: &GpuContext,
        extent: Extent,
        swapchain_views: &[vk::ImageView],
    ) -> Result<()> {
        if self.active.is_some() {
            return Err(GpuError::InvalidState("cannot resize inside a render pass".into()).into());
        }
        let mut ctx = VulkanTargetContext {
            gpu,
            cache: &mut self.cache,
            swapchain_views,
        };
        self.targets.set_extent(&mut ctx, extent)?;
        tracing::debug!(extent = %extent, "renderer targets recreated");
        Ok(())
    }

    fn batch_mut(&mut self, kind: BatchKind) -> &mut BatchRenderer {
        match kind {
            BatchKind::Quads => &mut self.quads,
            BatchKind::Lines => &mut self.lines,
        }
    }

    fn descriptor_set(&self) -> Result<vk::DescriptorSet> {
        self.descriptor_sets.get(self.slot).copied().ok_or_else(|| {
            GpuError::ResourceNotFound(format!("descriptor set for slot {}", self.slot)).into()
        })
    }

    pub const fn swapchain_framebuffer(&self) -> Handle<Framebuffer> {
        self.swapchain_framebuffer
    }

    pub const fn swapchain_pass(&self) -> Handle<RenderPass> {
        self.swapchain_pass
    }

    pub const fn targets(&self) -> &VulkanRenderTargets {
        &self.targets
    }

    pub fn targets_mut(&mut self) -> &mut VulkanRenderTargets {
        &mut self.targets
    }

    pub const fn pipeline_cache(&self) -> &PipelineCache {
        &self.cache
    }

    /// Pipeline registered under `key` (`quad`, `line` or `mesh`).
    pub fn pipeline(&self, key: &str) -> Result<&GraphicsPipeline> {
        Ok(self.targets.pipeline(self.cache.get(key)?)?)
    }

    pub const fn extent(&self) -> Extent {
        self.targets.extent()
    }

    /// Framebuffer of the pass being recorded.
    pub fn active_target(&self) -> Option<Handle<Framebuffer>> {
        self.active.map(|active| active.framebuffer)
    }

    /// Draws recorded since [`Self::begin_frame`].
    pub const fn draw_count(&self) -> u32 {
        self.draws
    }

    /// Release everything. The device must be idle.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        let device = gpu.device();
        self.quads.destroy(gpu);
        self.lines.destroy(gpu);
        for buffer in &mut self.camera_buffers {
            buffer.destroy(gpu);
        }
        self.camera_buffers.clear();
        self.descriptor_sets.clear();
        unsafe {
            self.descriptor_pool.destroy(device);
            if self.set_layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.set_layout, None);
                self.set_layout = vk::DescriptorSetLayout::null();
            }
        }
        let mut ctx = VulkanTargetContext {
            gpu,
            cache: &mut self.cache,
            swapchain_views: &[],
        };
        self.targets.destroy(&mut ctx);
        unsafe { self.cache.destroy(device) };
        self.active = None;
        tracing::debug!("renderer destroyed");
    }
}

fn build_pipeline(
    gpu: &GpuContext,
    targets: &mut VulkanRenderTargets,
    cache: &mut PipelineCache,
    pass: Handle<RenderPass>,
    props: PipelineProperties,
) -> Result<Handle<GraphicsPipeline>> {
    let device = gpu.device();
    let key = props.name.clone();
    let pipeline = unsafe {
        let native = cache.native(device, &key, &props)?;
        GraphicsPipeline::new(device, props, targets.pass(pass)?, native)
    }?;
    let handle = targets.add_pipeline(pipeline, pass)?;
    cache.register(&key, handle);
    Ok(handle)
}

/// Clear descriptions in attachment order: colours, then depth.
fn clear_attachments(values: &[vk::ClearValue], color_count: usize) -> Vec<vk::ClearAttachment> {
    values
        .iter()
        .enumerate()
        .map(|(i, &clear_value)| {
            if i < color_count {
                vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    color_attachment: i as u32,
                    clear_value,
                }
            } else {
                vk::ClearAttachment {
                    aspect_mask: vk::ImageAspectFlags::DEPTH,
                    color_attachment: 0,
                    clear_value,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_gpu::framebuffer::clear_values_for;

    #[test]
    fn explicit_clear_covers_every_attachment() {
        let values = clear_values_for(2, true, [1.0, 0.0, 0.0, 1.0], 1.0);
        let attachments = clear_attachments(&values, 2);
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[0].aspect_mask, vk::ImageAspectFlags::COLOR);
        assert_eq!(attachments[1].color_attachment, 1);
        assert_eq!(attachments[2].aspect_mask, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn config_defaults() {
        let config = RendererConfig::new(ShaderSet::default())
            .with_capacities(10, 20)
            .with_segments(0);
        assert_eq!(config.quad_capacity, 10);
        assert_eq!(config.line_capacity, 20);
        assert_eq!(config.segments, 0);
        assert!(config.depth);
        assert!(config.pipeline_cache_dir.is_none());
        assert_eq!(MESH_PUSH_CONSTANT_SIZE, 64);
    }

    #[test]
    fn batch_pipelines_take_the_batch_block() {
        let config = RendererConfig::new(ShaderSet::default());
        let [quads, lines, mesh] = config.pipeline_properties(2.0);
        for props in [&quads, &lines] {
            assert_eq!(props.push_constant_ranges.len(), 1);
            assert_eq!(props.push_constant_ranges[0].stage_flags, BATCH_PUSH_CONSTANT_STAGES);
            assert_eq!(props.push_constant_ranges[0].size, BatchPushConstants::SIZE);
        }
        assert_eq!(mesh.push_constant_ranges[0].size, MESH_PUSH_CONSTANT_SIZE);
    }
}
