//! Windowed application runner for the Kiln renderer.
//!
//! The runner handles:
//! - Logging setup
//! - Window, GPU context, swapchain, executor and renderer creation
//! - The frame loop: acquire, record, submit, present
//! - Swapchain recreation on resize, deferred while the window is minimised
//!
//! # Example
//!
//! ```no_run
//! use kiln_app::{run_app, AppConfig, AppContext, FrameContext, KilnApp};
//! use kiln_render::{RendererConfig, ShaderSet};
//!
//! struct MyApp;
//!
//! impl KilnApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, frame: &mut FrameContext<'_>) -> anyhow::Result<()> {
//!         frame.begin_pass(false)?;
//!         frame.end_pass()?;
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let shaders = ShaderSet::built_in();
//!     run_app::<MyApp>(AppConfig::default(), RendererConfig::new(shaders))
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::KilnApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{init_logging, run_app, AppConfig};

pub use kiln_gpu::{GpuContext, GpuContextBuilder};
pub use kiln_render::Camera;
pub use winit::event::{DeviceEvent, DeviceId, WindowEvent};
