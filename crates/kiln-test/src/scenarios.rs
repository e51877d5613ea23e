//! Hardware scenarios shared by the tests and the viewer's self-check.

use ash::vk;
use glam::{Mat4, Vec3};
use kiln_core::{Extent, GeometryProperties, Handle, LineVertex, QuadVertex};
use kiln_gpu::{
    write_uniform_buffer, Buffer, BufferKind, BufferProperties, CommandExecutor, DescriptorPool,
    DescriptorSetLayoutBuilder, GpuContext, GraphicsPipeline, Image, ImageProperties, Placement,
    PipelineProperties,
};
use kiln_render::{
    BatchKind, BatchPushConstants, BatchRenderer, CameraUniforms, BATCH_PUSH_CONSTANT_STAGES,
};

use crate::harness::OffscreenTarget;
use crate::{ensure, Result, TestError};

/// Extents of the resize sequence; the last one is the final size.
pub const RESIZE_SEQUENCE: [Extent; 5] = [
    Extent::new(800, 600),
    Extent::new(1920, 1080),
    Extent::new(640, 480),
    Extent::new(800, 600),
    Extent::new(1920, 1080),
];

/// Upload `data` into a device-local buffer and read it back.
pub fn buffer_round_trip(gpu: &GpuContext, data: &[u8]) -> Result<Vec<u8>> {
    let mut buffer = Buffer::new(
        gpu,
        BufferKind::Storage,
        BufferProperties::with_data("round trip", data, 1),
    )?;
    let result = (|| {
        ensure(buffer.placement() == Placement::DeviceLocal, || {
            format!("expected a device-local buffer, got {:?}", buffer.placement())
        })?;
        Ok(buffer.read_back(gpu)?)
    })();
    buffer.destroy(gpu);
    result
}

/// Upload RGBA8 texels into an image and read them back.
pub fn image_round_trip(gpu: &GpuContext, extent: Extent, texels: &[u8]) -> Result<Vec<u8>> {
    let mut image = Image::new(
        gpu,
        ImageProperties::new("round trip", extent, OffscreenTarget::COLOR_FORMAT).with_data(texels),
    )?;
    let result = image.read_back(gpu, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    image.destroy(gpu);
    Ok(result?)
}

/// Write a 64-byte patch at offset 32 of a 256-byte buffer holding `1, 2, ..`.
///
/// Returns the buffer contents after the write.
pub fn partial_write(gpu: &GpuContext, host_visible: bool) -> Result<Vec<u8>> {
    let initial: Vec<u8> = (1..=256u32).map(|i| i as u8).collect();
    let patch = [0xEE_u8; 64];
    let mut buffer = Buffer::new(
        gpu,
        BufferKind::Vertex,
        BufferProperties::with_data("partial write", &initial, 256).host_visible(host_visible),
    )?;
    let result = buffer
        .set_data(gpu, &patch, 32)
        .and_then(|()| buffer.read_back(gpu));
    buffer.destroy(gpu);
    let contents = result?;

    ensure(contents.len() == 256, || format!("read {} bytes", contents.len()))?;
    ensure(contents[..32] == initial[..32], || "head changed".into())?;
    ensure(contents[32..96] == patch, || "patch missing".into())?;
    ensure(contents[96..] == initial[96..], || "tail changed".into())?;
    Ok(contents)
}

/// Recreate `target` through [`RESIZE_SEQUENCE`], with a zero extent
/// deferred in between. Returns the coordinator extent after the last step.
pub fn resize_sequence(
    gpu: &GpuContext,
    target: &mut OffscreenTarget,
    pipeline: Option<Handle<GraphicsPipeline>>,
) -> Result<Extent> {
    for (step, &extent) in RESIZE_SEQUENCE.iter().enumerate() {
        // A minimised window reports zero; nothing is rebuilt until it has area again.
        target.targets.mark_stale(Extent::new(0, 0));
        let mut ctx = kiln_gpu::VulkanTargetContext {
            gpu,
            cache: &mut target.cache,
            swapchain_views: &[],
        };
        ensure(!target.targets.apply_pending(&mut ctx)?, || {
            format!("step {step}: zero extent was applied")
        })?;

        gpu.wait_idle()?;
        target.set_extent(gpu, extent)?;

        let framebuffer = target.targets.framebuffer(target.framebuffer)?;
        ensure(framebuffer.extent() == extent, || {
            format!("step {step}: framebuffer at {}", framebuffer.extent())
        })?;
        let image = target.targets.image(target.image)?;
        ensure(image.extent() == extent, || {
            format!("step {step}: image at {}", image.extent())
        })?;
        if let Some(handle) = pipeline {
            let pipeline = target.targets.pipeline(handle)?;
            ensure(pipeline.extent() == extent, || {
                format!("step {step}: pipeline at {}", pipeline.extent())
            })?;
        }
    }
    Ok(target.targets.extent())
}

/// Camera uniform bound at set 0, binding 0, as the batch shaders expect.
pub struct CameraBinding {
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
    pool: DescriptorPool,
    buffer: Buffer,
}

impl CameraBinding {
    pub fn new(gpu: &GpuContext, view_projection: Mat4) -> Result<Self> {
        let device = gpu.device();
        let builder =
            DescriptorSetLayoutBuilder::new().uniform_buffer(0, vk::ShaderStageFlags::VERTEX);
        let layout = unsafe { builder.build(device) }?;
        let pool = unsafe { DescriptorPool::new(device, 1, &builder.pool_sizes(1)) }?;
        let set = unsafe { pool.allocate(device, &[layout]) }?
            .first()
            .copied()
            .ok_or_else(|| TestError::Check("no descriptor set allocated".into()))?;

        let uniforms = CameraUniforms::from_matrix(view_projection);
        let buffer = Buffer::new(
            gpu,
            BufferKind::Uniform,
            BufferProperties::with_data("camera", bytemuck::bytes_of(&uniforms), 1)
                .host_visible(true),
        )?;
        unsafe { write_uniform_buffer(device, set, 0, &buffer) };
        Ok(Self { layout, set, pool, buffer })
    }

    pub fn destroy(&mut self, gpu: &GpuContext) {
        self.buffer.destroy(gpu);
        let device = gpu.device();
        unsafe {
            self.pool.destroy(device);
            if self.layout != vk::DescriptorSetLayout::null() {
                device.destroy_descriptor_set_layout(self.layout, None);
                self.layout = vk::DescriptorSetLayout::null();
            }
        }
    }
}

/// Pipeline properties for the batch kind using the built-in shaders.
pub fn batch_pipeline(
    kind: BatchKind,
    extent: Extent,
    camera_layout: vk::DescriptorSetLayout,
) -> PipelineProperties {
    let program = match kind {
        BatchKind::Quads => kiln_shaders::quad(),
        BatchKind::Lines => kiln_shaders::line(),
    };
    let props = PipelineProperties::new(
        kind.pipeline_key(),
        program.vertex.to_vec(),
        program.fragment.to_vec(),
    )
    .with_extent(extent)
    .with_depth(false, false)
    .with_cull_mode(vk::CullModeFlags::NONE)
    .with_set_layouts(&[camera_layout])
    .with_push_constants(BATCH_PUSH_CONSTANT_STAGES, BatchPushConstants::SIZE);
    match kind {
        BatchKind::Quads => props.with_vertex::<QuadVertex>(),
        BatchKind::Lines => props
            .with_vertex::<LineVertex>()
            .with_topology(vk::PrimitiveTopology::LINE_LIST),
    }
}

/// Fill a batch past one flush and check the draws it records.
///
/// Returns the index count of every draw.
pub fn batch_flushes(
    gpu: &GpuContext,
    executor: &mut CommandExecutor,
    target: &OffscreenTarget,
    pipeline: Handle<GraphicsPipeline>,
    camera: &CameraBinding,
    quads: u32,
) -> Result<Vec<u32>> {
    let capacity = 16;
    let slots = executor.slot_count();
    let mut batch = BatchRenderer::construct(gpu, BatchKind::Quads, capacity, 4, slots)?;
    let result = (|| {
        let cmd = executor.begin()?;
        batch.begin_frame(executor.current_slot());

        let framebuffer = target.targets.framebuffer(target.framebuffer)?;
        let pass = target.targets.pass(target.pass)?;
        let pipeline = target.targets.pipeline(pipeline)?;
        let clear_values = framebuffer.clear_values();
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(pass.handle())
            .framebuffer(framebuffer.handle(0)?)
            .render_area(framebuffer.render_area())
            .clear_values(&clear_values);
        unsafe {
            gpu.device()
                .cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
        }

        let mut draws = Vec::new();
        for i in 0..quads {
            let position = Vec3::new(i as f32, 0.0, 0.0);
            let quad = GeometryProperties::rectangle(position, glam::Vec2::ONE);
            if batch.emplace(&quad).is_err() {
                if let Some(draw) = batch.submit(gpu, cmd, pipeline, camera.set)? {
                    draws.push(draw.index_count);
                }
                batch
                    .emplace(&quad)
                    .map_err(|full| TestError::Check(full.to_string()))?;
            }
        }
        if let Some(draw) = batch.submit(gpu, cmd, pipeline, camera.set)? {
            draws.push(draw.index_count);
        }
        // Nothing left: a second flush records nothing.
        ensure(batch.submit(gpu, cmd, pipeline, camera.set)?.is_none(), || {
            "empty batch recorded a draw".into()
        })?;

        unsafe { gpu.device().cmd_end_render_pass(cmd) };
        executor.submit_and_end()?;
        gpu.wait_idle()?;
        Ok(draws)
    })();
    batch.destroy(gpu);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::HeadlessGpu;

    fn headless() -> HeadlessGpu {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        HeadlessGpu::new().unwrap()
    }

    #[test]
    fn batch_pipelines_declare_the_batch_block() {
        for kind in BatchKind::ALL {
            let props = batch_pipeline(kind, Extent::new(64, 64), vk::DescriptorSetLayout::null());
            assert_eq!(props.push_constant_ranges.len(), 1);
            let range = props.push_constant_ranges[0];
            assert_eq!(range.stage_flags, BATCH_PUSH_CONSTANT_STAGES);
            assert_eq!(range.offset, 0);
            assert_eq!(range.size, BatchPushConstants::SIZE);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn staged_upload_round_trips() {
        let headless = headless();
        let data: Vec<u8> = (0..4096u32).map(|i| (i * 7 % 251) as u8).collect();
        assert_eq!(buffer_round_trip(headless.gpu(), &data).unwrap(), data);

        let extent = Extent::new(16, 8);
        let texels: Vec<u8> = (0..extent.area() * 4).map(|i| (i % 256) as u8).collect();
        assert_eq!(image_round_trip(headless.gpu(), extent, &texels).unwrap(), texels);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn partial_write_keeps_surrounding_bytes() {
        let headless = headless();
        for host_visible in [true, false] {
            let contents = partial_write(headless.gpu(), host_visible).unwrap();
            assert_eq!(contents[0], 1);
            assert_eq!(contents[31], 32);
            assert_eq!(contents[32], 0xEE);
            assert_eq!(contents[95], 0xEE);
            assert_eq!(contents[96], 97);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn five_resizes_end_at_full_hd() {
        let headless = headless();
        let gpu = headless.gpu();
        let mut target = headless
            .offscreen_target("resize", Extent::new(320, 240), true)
            .unwrap();
        let mut camera = CameraBinding::new(gpu, Mat4::IDENTITY).unwrap();
        let props = batch_pipeline(BatchKind::Quads, Extent::new(320, 240), camera.layout);
        let pipeline = target.add_pipeline(gpu, props).unwrap();

        let final_extent = resize_sequence(gpu, &mut target, Some(pipeline)).unwrap();
        assert_eq!(final_extent, Extent::new(1920, 1080));
        assert_eq!(target.targets.counts()[2], 1);

        target.destroy(gpu);
        camera.destroy(gpu);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn frame_slots_rotate_under_load() {
        let headless = headless();
        let gpu = headless.gpu();
        let mut target = headless
            .offscreen_target("slots", Extent::new(64, 64), false)
            .unwrap();
        let mut executor = headless.executor(3).unwrap();
        assert_eq!(executor.slot_count(), 3);

        for frame in 0..9 {
            assert_eq!(executor.current_slot(), frame % 3);
            target.clear(gpu, &mut executor, [0.0, 0.0, 1.0, 1.0]).unwrap();
        }
        // A fixed slot count ignores the image count.
        executor.force_recreation(2).unwrap();
        assert_eq!(executor.slot_count(), 3);

        executor.destroy();
        target.destroy(gpu);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn overflowing_batch_flushes_in_segments() {
        let headless = headless();
        let gpu = headless.gpu();
        let extent = Extent::new(128, 128);
        let mut target = headless.offscreen_target("batch", extent, false).unwrap();
        let mut camera = CameraBinding::new(gpu, Mat4::IDENTITY).unwrap();
        let props = batch_pipeline(BatchKind::Quads, extent, camera.layout);
        let pipeline = target.add_pipeline(gpu, props).unwrap();
        let mut executor = headless.executor(2).unwrap();

        // Capacity 16: 40 quads flush as 16 + 16 + 8.
        let draws = batch_flushes(gpu, &mut executor, &target, pipeline, &camera, 40).unwrap();
        assert_eq!(draws, [96, 96, 48]);

        executor.destroy();
        target.destroy(gpu);
        camera.destroy(gpu);
    }
}
