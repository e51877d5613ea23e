//! Offscreen GPU harness.
//!
//! Everything here runs without a window: the context is headless and
//! render targets are offscreen framebuffers whose colour attachments are
//! read back for comparison.

use ash::vk;
use image::{ImageBuffer, Rgba};
use kiln_core::{Extent, Handle};
use kiln_gpu::{
    find_depth_format, CommandExecutor, CommandExecutorProperties, Framebuffer,
    FramebufferProperties, GpuContext, GpuContextBuilder, GraphicsPipeline, Image, ImageProperties,
    PipelineCache, PipelineProperties, RenderPass, RenderPassProperties, VulkanRenderTargets,
    VulkanTargetContext,
};
use kiln_render::screenshot::to_rgba8;

use crate::{Result, TestError};

/// Headless device for hardware tests.
pub struct HeadlessGpu {
    context: GpuContext,
}

impl HeadlessGpu {
    /// Create a headless context with validation enabled.
    pub fn new() -> Result<Self> {
        let context = GpuContextBuilder::new()
            .app_name("kiln-test")
            .validation(true)
            .headless(true)
            .build()?;
        tracing::info!("GPU: {}", context.capabilities().summary());
        Ok(Self { context })
    }

    pub const fn gpu(&self) -> &GpuContext {
        &self.context
    }

    /// Executor with `slots` frame slots and no swapchain semaphores.
    pub fn executor(&self, slots: usize) -> Result<CommandExecutor> {
        let props = CommandExecutorProperties {
            count: Some(slots),
            owned_by_swapchain: false,
            ..Default::default()
        };
        Ok(CommandExecutor::new(&self.context, slots, props)?)
    }

    /// Offscreen pass, framebuffer and one free-standing image at `extent`.
    pub fn offscreen_target(
        &self,
        name: &str,
        extent: Extent,
        depth: bool,
    ) -> Result<OffscreenTarget> {
        OffscreenTarget::new(&self.context, name, extent, depth)
    }
}

/// Offscreen pass with its framebuffer and an extra sampled image, all
/// registered for extent-driven recreation.
pub struct OffscreenTarget {
    pub targets: VulkanRenderTargets,
    pub cache: PipelineCache,
    pub pass: Handle<RenderPass>,
    pub framebuffer: Handle<Framebuffer>,
    pub image: Handle<Image>,
}

impl OffscreenTarget {
    pub const COLOR_FORMAT: vk::Format = vk::Format::R8G8B8A8_UNORM;

    fn new(gpu: &GpuContext, name: &str, extent: Extent, depth: bool) -> Result<Self> {
        let depth = if depth { Some(find_depth_format(gpu)?) } else { None };
        let mut targets = VulkanRenderTargets::new(extent);

        let pass = unsafe {
            RenderPass::new(
                gpu.device(),
                RenderPassProperties::offscreen(name, vec![Self::COLOR_FORMAT], depth),
            )
        }?;
        let pass = targets.add_pass(pass);

        let framebuffer = Framebuffer::new(
            gpu,
            targets.pass(pass)?,
            FramebufferProperties::new(name, extent, pass),
        )?;
        let framebuffer = targets.add_framebuffer(framebuffer, pass)?;

        let image = Image::new(
            gpu,
            ImageProperties::new(format!("{name}/sampled"), extent, Self::COLOR_FORMAT),
        )?;
        let image = targets.add_image(image);

        Ok(Self {
            targets,
            cache: PipelineCache::new(),
            pass,
            framebuffer,
            image,
        })
    }

    /// Build a pipeline against the offscreen pass.
    pub fn add_pipeline(
        &mut self,
        gpu: &GpuContext,
        props: PipelineProperties,
    ) -> Result<Handle<GraphicsPipeline>> {
        let device = gpu.device();
        let key = props.name.clone();
        let pipeline = unsafe {
            let native = self.cache.native(device, &key, &props)?;
            GraphicsPipeline::new(device, props, self.targets.pass(self.pass)?, native)
        }?;
        let handle = self.targets.add_pipeline(pipeline, self.pass)?;
        self.cache.register(&key, handle);
        Ok(handle)
    }

    /// Recreate everything at `extent`.
    pub fn set_extent(&mut self, gpu: &GpuContext, extent: Extent) -> Result<()> {
        let mut ctx = VulkanTargetContext {
            gpu,
            cache: &mut self.cache,
            swapchain_views: &[],
        };
        self.targets.set_extent(&mut ctx, extent)?;
        Ok(())
    }

    /// Run the pass once with `color` as the clear value and wait for it.
    pub fn clear(
        &mut self,
        gpu: &GpuContext,
        executor: &mut CommandExecutor,
        color: [f32; 4],
    ) -> Result<()> {
        self.targets.framebuffer_mut(self.framebuffer)?.set_clear_color(color);
        let framebuffer = self.targets.framebuffer(self.framebuffer)?;
        let pass = self.targets.pass(self.pass)?;
        let clear_values = framebuffer.clear_values();

        let cmd = executor.begin()?;
        let info = vk::RenderPassBeginInfo::default()
            .render_pass(pass.handle())
            .framebuffer(framebuffer.handle(0)?)
            .render_area(framebuffer.render_area())
            .clear_values(&clear_values);
        unsafe {
            let device = gpu.device();
            device.cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE);
            device.cmd_end_render_pass(cmd);
        }
        executor.submit_and_end()?;
        gpu.wait_idle()?;
        Ok(())
    }

    /// Read the colour attachment as an RGBA8 image.
    pub fn read_color(&self, gpu: &GpuContext) -> Result<ImageBuffer<Rgba<u8>, Vec<u8>>> {
        let framebuffer = self.targets.framebuffer(self.framebuffer)?;
        let attachment = framebuffer.color_attachment(0).ok_or_else(|| {
            TestError::Check(format!("'{}' has no colour attachment", framebuffer.name()))
        })?;
        let data = attachment.read_back(gpu, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?;
        let data = to_rgba8(attachment.format(), data)?;
        let extent = attachment.extent();
        ImageBuffer::from_raw(extent.width, extent.height, data)
            .ok_or_else(|| TestError::ImageComparison(format!("read-back does not match {extent}")))
    }

    pub fn destroy(&mut self, gpu: &GpuContext) {
        let mut ctx = VulkanTargetContext {
            gpu,
            cache: &mut self.cache,
            swapchain_views: &[],
        };
        self.targets.destroy(&mut ctx);
        unsafe { self.cache.destroy(gpu.device()) };
    }
}

/// Normalized RGB difference between two images (0.0-1.0).
pub fn compare_images(
    a: &ImageBuffer<Rgba<u8>, Vec<u8>>,
    b: &ImageBuffer<Rgba<u8>, Vec<u8>>,
) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(TestError::ImageComparison(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            (0..3)
                .map(|c| u64::from(pa[c].abs_diff(pb[c])))
                .sum::<u64>()
        })
        .sum();

    let max_diff = (u64::from(a.width()) * u64::from(a.height()) * 3 * 255) as f64;
    if max_diff == 0.0 {
        return Ok(0.0);
    }
    Ok(total_diff as f64 / max_diff)
}

/// Solid image of `extent` filled with `color`.
pub fn solid_image(extent: Extent, color: [u8; 4]) -> ImageBuffer<Rgba<u8>, Vec<u8>> {
    ImageBuffer::from_pixel(extent.width, extent.height, Rgba(color))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn identical_images_have_no_difference() {
        let a = solid_image(Extent::new(4, 4), [10, 20, 30, 255]);
        assert_relative_eq!(compare_images(&a, &a.clone()).unwrap(), 0.0);
    }

    #[test]
    fn opposite_images_differ_fully() {
        let black = solid_image(Extent::new(2, 2), [0, 0, 0, 255]);
        let white = solid_image(Extent::new(2, 2), [255, 255, 255, 255]);
        assert_relative_eq!(compare_images(&black, &white).unwrap(), 1.0);
    }

    #[test]
    fn mismatched_dimensions_are_an_error() {
        let a = solid_image(Extent::new(2, 2), [0; 4]);
        let b = solid_image(Extent::new(3, 2), [0; 4]);
        assert!(matches!(compare_images(&a, &b), Err(TestError::ImageComparison(_))));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_context_creation() {
        let headless = HeadlessGpu::new().unwrap();
        assert!(headless.gpu().is_headless());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn clear_colour_reaches_the_attachment() {
        let headless = HeadlessGpu::new().unwrap();
        let gpu = headless.gpu();
        let extent = Extent::new(64, 32);
        let mut target = headless.offscreen_target("clear", extent, true).unwrap();
        let mut executor = headless.executor(2).unwrap();

        target.clear(gpu, &mut executor, [1.0, 0.0, 0.0, 1.0]).unwrap();
        let image = target.read_color(gpu).unwrap();
        let expected = solid_image(extent, [255, 0, 0, 255]);
        assert!(compare_images(&image, &expected).unwrap() < 0.01);

        executor.destroy();
        target.destroy(gpu);
    }
}
