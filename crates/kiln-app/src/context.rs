//! Application context.

use std::sync::Arc;
use std::time::Instant;

use kiln_core::Extent;
use kiln_gpu::{CommandExecutor, CommandExecutorProperties, GpuContext, SurfaceContext, Swapchain};
use kiln_render::{Renderer, RendererConfig};
use winit::window::Window;

/// Everything the runner owns on behalf of an application.
///
/// Field order matters: the GPU context is dropped last.
pub struct AppContext {
    pub window: Arc<Window>,
    pub surface: SurfaceContext,
    pub swapchain: Swapchain,
    pub executor: CommandExecutor,
    pub renderer: Renderer,
    /// Total frames submitted.
    pub frame_count: u64,
    pub vsync: bool,
    pub(crate) last_frame_time: Instant,
    /// Rebuild waiting for the next frame with a non-zero window size.
    pub(crate) pending_resize: Option<PendingResize>,
    pub gpu: GpuContext,
}

/// Swapchain rebuild scheduled for the next frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct PendingResize {
    pub extent: Extent,
    /// Rebuild even when the extent matches the swapchain.
    pub forced: bool,
}

impl PendingResize {
    /// Fold a new request into the pending one. The latest extent wins and a
    /// forced request stays forced.
    pub fn merge(pending: Option<Self>, extent: Extent, forced: bool) -> Self {
        Self {
            extent,
            forced: forced || pending.is_some_and(|p| p.forced),
        }
    }

    /// Extent to rebuild at, or `None` when the swapchain is already current.
    ///
    /// A zero extent falls back to the window size.
    pub fn target(self, window: Extent, current: Extent) -> Option<Extent> {
        let extent = if self.extent.is_valid() { self.extent } else { window };
        (self.forced || extent != current).then_some(extent)
    }
}

impl AppContext {
    /// Create the surface, swapchain, executor and renderer for `window`.
    ///
    /// # Safety
    /// The window must have valid handles and outlive the context.
    pub(crate) unsafe fn new(
        window: Arc<Window>,
        gpu: GpuContext,
        vsync: bool,
        renderer_config: RendererConfig,
    ) -> anyhow::Result<Self> {
        // SAFETY: caller guarantees the window handles are valid
        let mut surface = unsafe { SurfaceContext::from_window(&gpu, window.as_ref())? };

        let size = window.inner_size();
        let extent = Extent::new(size.width.max(1), size.height.max(1));

        // SAFETY: the surface was created from this context's instance
        let mut swapchain = match unsafe { Swapchain::new(&gpu, &surface, extent, vsync) } {
            Ok(swapchain) => swapchain,
            Err(e) => {
                unsafe { surface.destroy() };
                return Err(e.into());
            }
        };

        let executor = match CommandExecutor::new(
            &gpu,
            swapchain.image_count(),
            CommandExecutorProperties::default(),
        ) {
            Ok(executor) => executor,
            Err(e) => {
                unsafe {
                    swapchain.destroy(gpu.device());
                    surface.destroy();
                }
                return Err(e.into());
            }
        };

        let renderer = match Renderer::new(&gpu, &swapchain, &executor, renderer_config) {
            Ok(renderer) => renderer,
            Err(e) => {
                let mut executor = executor;
                executor.destroy();
                unsafe {
                    swapchain.destroy(gpu.device());
                    surface.destroy();
                }
                return Err(e.into());
            }
        };

        tracing::info!(
            extent = %swapchain.extent(),
            images = swapchain.image_count(),
            slots = executor.slot_count(),
            "application context ready"
        );

        Ok(Self {
            window,
            surface,
            swapchain,
            executor,
            renderer,
            frame_count: 0,
            vsync,
            last_frame_time: Instant::now(),
            pending_resize: None,
            gpu,
        })
    }

    pub const fn extent(&self) -> Extent {
        self.swapchain.extent()
    }

    pub const fn width(&self) -> u32 {
        self.swapchain.extent().width
    }

    pub const fn height(&self) -> u32 {
        self.swapchain.extent().height
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.extent().aspect_ratio()
    }

    /// Current window size; zero while minimised.
    pub fn window_extent(&self) -> Extent {
        let size = self.window.inner_size();
        Extent::new(size.width, size.height)
    }

    /// Schedule a resize for the next frame. Later requests replace earlier ones.
    ///
    /// Skipped when the swapchain already has the requested extent.
    pub fn request_resize(&mut self, extent: Extent) {
        self.pending_resize = Some(PendingResize::merge(self.pending_resize, extent, false));
    }

    /// Schedule a swapchain rebuild for the next frame even if the extent is
    /// unchanged. Used when acquire or present reports the swapchain as
    /// out of date or suboptimal.
    pub fn request_recreation(&mut self, extent: Extent) {
        self.pending_resize = Some(PendingResize::merge(self.pending_resize, extent, true));
    }

    /// Resize protocol: wait for the device, rebuild the swapchain, rebuild
    /// the executor's frame slots, then every render target.
    pub(crate) fn resize(&mut self, extent: Extent) -> anyhow::Result<()> {
        self.gpu.wait_idle()?;
        // SAFETY: the device is idle
        unsafe { self.swapchain.recreate(&self.gpu, &self.surface, extent)? };
        self.executor.force_recreation(self.swapchain.image_count())?;
        self.renderer
            .set_extent(&self.gpu, self.swapchain.extent(), self.swapchain.views())?;
        tracing::info!(extent = %self.swapchain.extent(), "swapchain recreated");
        Ok(())
    }

    /// Release everything except the GPU context, which is dropped with `self`.
    ///
    /// # Safety
    /// No submitted work may still reference the resources.
    pub(crate) unsafe fn cleanup(&mut self) {
        self.renderer.destroy(&self.gpu);
        self.executor.destroy();
        // SAFETY: caller guarantees nothing is in flight
        unsafe {
            self.swapchain.destroy(self.gpu.device());
            self.surface.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HD: Extent = Extent::new(1280, 720);

    #[test]
    fn same_extent_resize_is_skipped() {
        let pending = PendingResize::merge(None, HD, false);
        assert_eq!(pending.target(HD, HD), None);
        assert_eq!(pending.target(HD, Extent::new(800, 600)), Some(HD));
    }

    #[test]
    fn stale_swapchain_rebuilds_at_the_same_extent() {
        let pending = PendingResize::merge(None, HD, true);
        assert_eq!(pending.target(HD, HD), Some(HD));
    }

    #[test]
    fn forced_request_survives_a_later_resize() {
        let stale = PendingResize::merge(None, HD, true);
        let pending = PendingResize::merge(Some(stale), HD, false);
        assert!(pending.forced);
        assert_eq!(pending.target(HD, HD), Some(HD));
    }

    #[test]
    fn zero_extent_falls_back_to_the_window() {
        let pending = PendingResize::merge(None, Extent::new(0, 0), true);
        assert_eq!(pending.target(HD, Extent::new(800, 600)), Some(HD));
    }
}
