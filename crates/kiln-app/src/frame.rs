//! Per-frame context for rendering.

use glam::Mat4;
use kiln_core::{Extent, Geometry, GeometryProperties, Handle};
use kiln_gpu::{CommandExecutor, Framebuffer, GpuContext};
use kiln_render::{Mesh, Renderer};

/// Borrowed state for recording one frame.
pub struct FrameContext<'a> {
    pub gpu: &'a GpuContext,
    pub executor: &'a CommandExecutor,
    pub renderer: &'a mut Renderer,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    pub extent: Extent,
    /// Seconds since the previous frame.
    pub dt: f32,
    pub frame_number: u64,
}

impl FrameContext<'_> {
    /// Begin the swapchain pass.
    pub fn begin_pass(&mut self, explicit_clear: bool) -> kiln_render::Result<()> {
        let target = self.renderer.swapchain_framebuffer();
        self.begin_target(target, explicit_clear)
    }

    /// Begin the pass of any registered framebuffer.
    pub fn begin_target(
        &mut self,
        target: Handle<Framebuffer>,
        explicit_clear: bool,
    ) -> kiln_render::Result<()> {
        self.renderer
            .begin_pass(self.gpu, self.executor, target, explicit_clear)
    }

    pub fn end_pass(&mut self) -> kiln_render::Result<()> {
        self.renderer.end_pass(self.gpu)
    }

    pub fn draw_mesh(&mut self, mesh: &Mesh, transform: Mat4) -> kiln_render::Result<()> {
        self.renderer.draw_mesh(self.gpu, mesh, transform)
    }

    pub fn draw_planar_geometry(
        &mut self,
        geometry: Geometry,
        properties: &GeometryProperties,
    ) -> kiln_render::Result<()> {
        self.renderer
            .draw_planar_geometry(self.gpu, geometry, properties)
    }

    /// Flush queued planar geometry now instead of at `end_pass`.
    pub fn submit_batched_geometry(&mut self) -> kiln_render::Result<u32> {
        self.renderer.submit_batched_geometry(self.gpu)
    }
}
