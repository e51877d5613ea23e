//! Vulkan instance creation.

use crate::capabilities::{api_at_least, MIN_API_VERSION};
use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{CStr, CString};

/// Instance extensions needed to present to a window on this platform.
pub fn surface_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
    ]
}

/// Validation layers to enable in debug builds.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// Headless instances request no surface extensions.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    headless: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidDescription("application name contains NUL".into()))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Kiln")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(MIN_API_VERSION);

    let mut extensions = if headless {
        Vec::new()
    } else {
        surface_instance_extensions()
    };
    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME);

    let available_extensions = entry.enumerate_instance_extension_properties(None)?;
    extensions.retain(|ext| {
        let found = available_extensions
            .iter()
            .any(|props| CStr::from_ptr(props.extension_name.as_ptr()) == *ext);
        if !found {
            tracing::warn!("Instance extension {} not available", ext.to_string_lossy());
        }
        found
    });
    let extension_names: Vec<*const std::ffi::c_char> =
        extensions.iter().map(|ext| ext.as_ptr()).collect();

    let mut layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are dropped rather than failing instance creation
    let available_layers = entry.enumerate_instance_layer_properties()?;
    layers.retain(|layer| {
        let found = available_layers
            .iter()
            .any(|props| CStr::from_ptr(props.layer_name.as_ptr()) == *layer);
        if !found {
            tracing::warn!("Validation layer {} not available", layer.to_string_lossy());
        }
        found
    });

    let layer_names: Vec<*const std::ffi::c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    devices
        .into_iter()
        .map(|device| (score_physical_device(instance, device), device))
        .filter(|(score, _)| *score >= 0)
        .max_by_key(|(score, _)| *score)
        .map(|(_, device)| device)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection. Negative scores are unusable.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i64 {
    let properties = instance.get_physical_device_properties(device);
    let features = instance.get_physical_device_features(device);

    if !api_at_least(properties.api_version, MIN_API_VERSION) {
        return -1;
    }

    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();

    device_score(
        properties.device_type,
        vram_mb,
        features.wide_lines == vk::TRUE,
    )
}

/// Rank device type first, then memory, then wide line support.
fn device_score(device_type: vk::PhysicalDeviceType, vram_mb: u64, wide_lines: bool) -> i64 {
    let mut score = match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 50,
        _ => 0,
    };

    // +1 per GB
    score += i64::try_from(vram_mb / 1024).unwrap_or(0);

    if wide_lines {
        score += 10;
    }

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discrete_beats_integrated() {
        let discrete = device_score(vk::PhysicalDeviceType::DISCRETE_GPU, 4096, false);
        let integrated = device_score(vk::PhysicalDeviceType::INTEGRATED_GPU, 32_768, true);
        assert!(discrete > integrated);
    }

    #[test]
    fn software_devices_still_qualify() {
        assert!(device_score(vk::PhysicalDeviceType::CPU, 0, false) >= 0);
    }
}
