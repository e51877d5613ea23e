//! `KilnApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use glam::Mat4;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};

/// Trait for Kiln applications.
///
/// The runner owns the window, GPU context, swapchain, command executor and
/// renderer. Applications only describe what to draw each frame.
pub trait KilnApp: Sized {
    /// Initialize the application.
    ///
    /// Called once after the window, GPU context and renderer exist.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state. `dt` is the time since the last frame in seconds.
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Camera matrix written to the frame's uniform buffer before [`Self::render`].
    #[allow(unused_variables)]
    fn view_projection(&self, ctx: &AppContext) -> Mat4 {
        Mat4::IDENTITY
    }

    /// Record the frame.
    ///
    /// The command buffer is open and the swapchain image acquired. A pass
    /// left open is closed by the runner before submission.
    fn render(&mut self, frame: &mut FrameContext<'_>) -> anyhow::Result<()>;

    /// Called after the swapchain and every render target were rebuilt.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle a window event. Return `true` to stop further processing.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Handle raw device input.
    #[allow(unused_variables)]
    fn on_device_event(&mut self, device_id: DeviceId, event: &DeviceEvent) {}

    /// Release application GPU resources. The device is idle.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
