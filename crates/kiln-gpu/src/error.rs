//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Required extension not supported.
    #[error("Required extension not supported: {0}")]
    ExtensionNotSupported(String),

    /// The device (or host) ran out of memory while allocating `name`.
    #[error("Out of device memory allocating '{name}' ({size} bytes)")]
    OutOfDeviceMemory { name: String, size: u64 },

    /// A resource description was rejected before reaching the driver.
    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// Shader module rejected.
    #[error("Shader module creation failed: {0}")]
    ShaderModule(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl GpuError {
    /// Returns true for errors caused by memory exhaustion.
    pub const fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::OutOfDeviceMemory { .. }
                | Self::Vulkan(
                    vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY
                )
        )
    }
}

impl From<kiln_core::Error> for GpuError {
    fn from(err: kiln_core::Error) -> Self {
        match err {
            kiln_core::Error::StaleHandle { .. } => Self::ResourceNotFound(err.to_string()),
            kiln_core::Error::InvalidExtent { .. } | kiln_core::Error::InvalidData(_) => {
                Self::InvalidDescription(err.to_string())
            }
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_distinct_from_bad_description() {
        let oom = GpuError::OutOfDeviceMemory {
            name: "vertices".into(),
            size: 1024,
        };
        assert!(oom.is_out_of_memory());
        assert!(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).is_out_of_memory());
        assert!(!GpuError::InvalidDescription("zero size".into()).is_out_of_memory());
    }

    #[test]
    fn core_errors_convert() {
        let stale: GpuError = kiln_core::Error::StaleHandle {
            index: 1,
            generation: 2,
        }
        .into();
        assert!(matches!(stale, GpuError::ResourceNotFound(_)));

        let extent: GpuError = kiln_core::Error::InvalidExtent {
            width: 0,
            height: 4,
        }
        .into();
        assert!(matches!(extent, GpuError::InvalidDescription(_)));
    }
}
