//! Headless GPU harness for the Kiln renderer.
//!
//! Provides an offscreen context and the scenarios exercised by the
//! hardware tests: staged round-trips, partial buffer writes, recreation
//! across resizes, and clear-colour image comparison.

pub mod harness;
pub mod scenarios;

pub use harness::{compare_images, HeadlessGpu, OffscreenTarget};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TestError {
    #[error(transparent)]
    Gpu(#[from] kiln_gpu::GpuError),
    #[error(transparent)]
    Render(#[from] kiln_render::RenderError),
    #[error(transparent)]
    Screenshot(#[from] kiln_render::ScreenshotError),
    #[error("Scenario check failed: {0}")]
    Check(String),
    #[error("Image comparison failed: {0}")]
    ImageComparison(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, TestError>;

/// Fail with [`TestError::Check`] unless `condition` holds.
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(TestError::Check(message()))
    }
}
