//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Minimum API version the renderer runs on.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_2;

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    // Buffer limits
    /// Largest range a uniform buffer descriptor may cover
    pub max_uniform_buffer_range: u64,
    /// Largest range a storage buffer descriptor may cover
    pub max_storage_buffer_range: u64,
    /// Push constant budget in bytes
    pub max_push_constants_size: u32,
    /// Required alignment of uniform buffer offsets
    pub min_uniform_buffer_offset_alignment: u64,

    // Rasterisation
    /// Lines wider than one pixel
    pub supports_wide_lines: bool,
    /// Supported line widths
    pub line_width_range: [f32; 2],
    /// Line and point polygon modes
    pub supports_fill_mode_non_solid: bool,

    // Queries
    /// Nanoseconds per timestamp tick
    pub timestamp_period: f32,
    /// Timestamps on graphics and compute queues
    pub supports_timestamps: bool,
    /// Pipeline statistics query pools
    pub supports_pipeline_statistics: bool,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let features = instance.get_physical_device_features(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let limits = properties.limits;

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,

            device_local_memory_mb,
            max_memory_allocation_count: limits.max_memory_allocation_count,

            max_uniform_buffer_range: u64::from(limits.max_uniform_buffer_range),
            max_storage_buffer_range: u64::from(limits.max_storage_buffer_range),
            max_push_constants_size: limits.max_push_constants_size,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,

            supports_wide_lines: features.wide_lines == vk::TRUE,
            line_width_range: limits.line_width_range,
            supports_fill_mode_non_solid: features.fill_mode_non_solid == vk::TRUE,

            timestamp_period: limits.timestamp_period,
            supports_timestamps: limits.timestamp_compute_and_graphics == vk::TRUE,
            supports_pipeline_statistics: features.pipeline_statistics_query == vk::TRUE,

            available_extensions,
        }
    }

    /// Check if the GPU meets minimum requirements for the engine.
    ///
    /// Presenting devices must also expose the swapchain extension.
    pub fn meets_requirements(&self, present: bool) -> bool {
        if !api_at_least(self.api_version, MIN_API_VERSION) {
            return false;
        }

        // Batched lines are drawn with a line polygon mode
        if !self.supports_fill_mode_non_solid {
            return false;
        }

        !present
            || self
                .available_extensions
                .contains(&ash::khr::swapchain::NAME.to_string_lossy().into_owned())
    }

    /// Clamp a requested line width into the supported range.
    pub fn clamp_line_width(&self, width: f32) -> f32 {
        if !self.supports_wide_lines {
            return 1.0;
        }
        width.clamp(self.line_width_range[0], self.line_width_range[1])
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Compare major and minor API versions, ignoring the patch level.
pub const fn api_at_least(version: u32, required: u32) -> bool {
    let (major, minor) = (vk::api_version_major(version), vk::api_version_minor(version));
    let (req_major, req_minor) = (
        vk::api_version_major(required),
        vk::api_version_minor(required),
    );
    major > req_major || (major == req_major && minor >= req_minor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test Device".to_string(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 0,
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            max_uniform_buffer_range: 65_536,
            max_storage_buffer_range: 1 << 27,
            max_push_constants_size: 128,
            min_uniform_buffer_offset_alignment: 256,
            supports_wide_lines: true,
            line_width_range: [1.0, 8.0],
            supports_fill_mode_non_solid: true,
            timestamp_period: 1.0,
            supports_timestamps: true,
            supports_pipeline_statistics: true,
            available_extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn api_version_comparison() {
        assert!(api_at_least(vk::API_VERSION_1_3, vk::API_VERSION_1_2));
        assert!(api_at_least(vk::make_api_version(0, 1, 2, 198), vk::API_VERSION_1_2));
        assert!(!api_at_least(vk::API_VERSION_1_1, vk::API_VERSION_1_2));
        assert!(api_at_least(vk::make_api_version(0, 2, 0, 0), vk::API_VERSION_1_3));
    }

    #[test]
    fn requirements() {
        assert!(capabilities().meets_requirements(true));

        let mut old = capabilities();
        old.api_version = vk::API_VERSION_1_1;
        assert!(!old.meets_requirements(false));

        let mut no_swapchain = capabilities();
        no_swapchain.available_extensions.clear();
        assert!(!no_swapchain.meets_requirements(true));
        assert!(no_swapchain.meets_requirements(false));
    }

    #[test]
    fn line_width_is_clamped() {
        let caps = capabilities();
        assert!((caps.clamp_line_width(16.0) - 8.0).abs() < f32::EPSILON);
        assert!((caps.clamp_line_width(0.5) - 1.0).abs() < f32::EPSILON);

        let mut thin = capabilities();
        thin.supports_wide_lines = false;
        assert!((thin.clamp_line_width(8.0) - 1.0).abs() < f32::EPSILON);
    }
}
