//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kiln_core::Extent;
use kiln_gpu::{AcquireResult, GpuContextBuilder};
use kiln_render::RendererConfig;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{DeviceEvent, DeviceId, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::KilnApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
    pub vsync: bool,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Kiln".to_string(),
            width: 1280,
            height: 720,
            target_fps: None,
            vsync: true,
            validation: cfg!(debug_assertions),
        }
    }
}

impl AppConfig {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub const fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    #[must_use]
    pub const fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    #[must_use]
    pub const fn with_vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }

    #[must_use]
    pub const fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    /// Frame budget for the target rate.
    pub fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Run a [`KilnApp`] until its window closes.
///
/// Initializes logging, creates the window, GPU context and renderer, and
/// drives the event loop.
pub fn run_app<A: KilnApp + 'static>(
    config: AppConfig,
    renderer: RendererConfig,
) -> anyhow::Result<()> {
    init_logging();
    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        renderer: Some(renderer),
        state: None,
        failure: None,
    };
    event_loop.run_app(&mut runner)?;

    match runner.failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

struct AppRunner<A: KilnApp> {
    config: AppConfig,
    /// Consumed when the window is first created.
    renderer: Option<RendererConfig>,
    state: Option<AppState<A>>,
    failure: Option<anyhow::Error>,
}

struct AppState<A: KilnApp> {
    ctx: AppContext,
    app: A,
    target_frame_time: Option<Duration>,
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: KilnApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }
        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e:#}");
                self.failure = Some(e);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                if let Some(state) = &mut self.state {
                    if let Err(e) = state.render_frame() {
                        error!("Render error: {e:#}");
                        if is_fatal(&e) {
                            if let Some(mut state) = self.state.take() {
                                state.cleanup();
                            }
                            self.failure = Some(e);
                            event_loop.exit();
                        }
                    }
                }
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = &mut self.state {
                    state.ctx.request_resize(Extent::new(size.width, size.height));
                }
            }
            _ => {}
        }
    }

    fn device_event(
        &mut self,
        _event_loop: &ActiveEventLoop,
        device_id: DeviceId,
        event: DeviceEvent,
    ) {
        if let Some(state) = &mut self.state {
            state.app.on_device_event(device_id, &event);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: KilnApp + 'static> AppRunner<A> {
    fn create_state(&mut self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let renderer = self
            .renderer
            .take()
            .ok_or_else(|| anyhow::anyhow!("renderer configuration already consumed"))?;

        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContextBuilder::new()
            .app_name(&self.config.title)
            .validation(self.config.validation)
            .build()?;
        info!("GPU: {}", gpu.capabilities().summary());

        // SAFETY: the window is kept alive by the context's Arc
        let mut ctx = unsafe { AppContext::new(window, gpu, self.config.vsync, renderer)? };
        let app = A::init(&mut ctx)?;

        Ok(AppState {
            ctx,
            app,
            target_frame_time: self.config.target_frame_time(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }
}

fn is_fatal(err: &anyhow::Error) -> bool {
    err.downcast_ref::<kiln_render::RenderError>()
        .is_some_and(kiln_render::RenderError::is_fatal)
        || err
            .downcast_ref::<kiln_gpu::GpuError>()
            .is_some_and(|e| matches!(e, kiln_gpu::GpuError::Vulkan(_)))
}

impl<A: KilnApp> AppState<A> {
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        // Skip frames while minimised; a resize is applied once the window has area again.
        let window_extent = self.ctx.window_extent();
        if !window_extent.is_valid() {
            return Ok(());
        }
        if let Some(pending) = self.ctx.pending_resize.take() {
            if let Some(extent) = pending.target(window_extent, self.ctx.swapchain.extent()) {
                self.resize(extent)?;
            }
        }

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;
        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        // Blocks until this slot's previous submission has retired.
        self.ctx.executor.begin()?;

        // SAFETY: the slot's acquire semaphore has no pending signal once its fence was waited on
        let acquired = unsafe {
            self.ctx
                .swapchain
                .acquire(self.ctx.executor.image_acquired(), u64::MAX)
        };
        let image_index = match acquired {
            Ok(AcquireResult::Ready { index, suboptimal }) => {
                if suboptimal {
                    self.ctx.request_recreation(window_extent);
                }
                index
            }
            Ok(AcquireResult::OutOfDate) => {
                self.ctx.executor.abandon()?;
                self.ctx.request_recreation(window_extent);
                return Ok(());
            }
            Err(e) => {
                self.ctx.executor.abandon()?;
                return Err(e.into());
            }
        };

        let view_projection = self.app.view_projection(&self.ctx);
        let recorded = self.record(image_index, view_projection, dt);

        // The acquire semaphore is signalled, so the frame is submitted and
        // presented even when recording failed.
        self.ctx.executor.submit_and_end()?;
        // SAFETY: the graphics queue was checked for present support when the surface was created
        let stale = unsafe {
            self.ctx.swapchain.present(
                self.ctx.gpu.graphics_queue(),
                image_index,
                &[self.ctx.executor.render_complete()],
            )?
        };
        if stale {
            self.ctx.request_recreation(window_extent);
        }
        self.ctx.frame_count += 1;

        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        recorded
    }

    fn record(
        &mut self,
        image_index: u32,
        view_projection: glam::Mat4,
        dt: f32,
    ) -> anyhow::Result<()> {
        let ctx = &mut self.ctx;
        ctx.renderer
            .begin_frame(&ctx.gpu, &ctx.executor, image_index, view_projection)?;

        let mut frame = FrameContext {
            gpu: &ctx.gpu,
            executor: &ctx.executor,
            renderer: &mut ctx.renderer,
            image_index,
            extent: ctx.swapchain.extent(),
            dt,
            frame_number: ctx.frame_count,
        };
        let rendered = self.app.render(&mut frame);

        if frame.renderer.active_target().is_some() {
            if rendered.is_ok() {
                warn!("render pass left open; closing it");
            }
            frame.end_pass()?;
        }
        rendered
    }

    fn resize(&mut self, extent: Extent) -> anyhow::Result<()> {
        self.ctx.resize(extent)?;
        let Extent { width, height } = self.ctx.swapchain.extent();
        self.app.on_resize(&mut self.ctx, width, height)?;
        info!("Resized to {width}x{height}");
        Ok(())
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 {
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.gpu.wait_idle() {
            error!("Failed to wait idle: {e}");
        }
        self.app.cleanup(&mut self.ctx);
        // SAFETY: the device is idle
        unsafe { self.ctx.cleanup() };
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_budget_follows_target_fps() {
        let config = AppConfig::new("test").with_target_fps(50);
        assert_eq!(config.target_frame_time(), Some(Duration::from_millis(20)));
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = AppConfig::new("viewer")
            .with_size(1920, 1080)
            .with_vsync(false)
            .with_validation(true);
        assert_eq!(config.title, "viewer");
        assert_eq!((config.width, config.height), (1920, 1080));
        assert!(!config.vsync);
        assert!(config.validation);
    }
}
