//! Renderer error type.

use crate::batch::BatchKind;
use kiln_gpu::GpuError;
use thiserror::Error;

/// Errors raised while recording frames.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Gpu(#[from] GpuError),

    /// A batch overflowed with no way to flush it.
    #[error("{kind} batch exceeded its capacity of {capacity} objects")]
    BatchCapacity { kind: BatchKind, capacity: u32 },

    /// A draw was issued outside `begin_pass` / `end_pass`.
    #[error("no render pass is active")]
    NoActivePass,
}

impl From<kiln_core::Error> for RenderError {
    fn from(err: kiln_core::Error) -> Self {
        Self::Gpu(err.into())
    }
}

impl RenderError {
    /// Returns true when the failure left the device unusable.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Gpu(GpuError::Vulkan(_) | GpuError::OutOfDeviceMemory { .. }))
    }
}

/// Result alias for renderer operations.
pub type Result<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_name_the_batch() {
        let err = RenderError::BatchCapacity {
            kind: BatchKind::Lines,
            capacity: 2000,
        };
        assert_eq!(
            err.to_string(),
            "lines batch exceeded its capacity of 2000 objects"
        );
        assert!(!err.is_fatal());
    }

    #[test]
    fn device_loss_is_fatal() {
        let err = RenderError::from(GpuError::Vulkan(ash::vk::Result::ERROR_DEVICE_LOST));
        assert!(err.is_fatal());
        let stale = RenderError::from(kiln_core::Error::InvalidExtent {
            width: 0,
            height: 0,
        });
        assert!(matches!(stale, RenderError::Gpu(GpuError::InvalidDescription(_))));
    }
}
