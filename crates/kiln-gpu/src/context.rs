//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::command::{submit_one_shot, CommandPool};
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use kiln_core::constants::MAX_FRAMES_IN_FLIGHT;
use parking_lot::Mutex;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
///
/// Owns the device-memory allocator and the transient command pool used for
/// one-shot uploads. Both are torn down before the device in [`Drop`].
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) immediate_pool: Mutex<CommandPool>,

    pub(crate) graphics_queue_family: u32,
    pub(crate) graphics_queue: vk::Queue,

    pub(crate) frames_in_flight: usize,
    pub(crate) headless: bool,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the Vulkan device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        Arc::clone(&self.device)
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the graphics queue. Presentation uses the same queue.
    pub const fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the graphics queue family index.
    pub const fn graphics_queue_family(&self) -> u32 {
        self.graphics_queue_family
    }

    /// Loaded Vulkan entry points.
    pub const fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// Default number of frame slots for command executors.
    pub const fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    /// Returns true if the context was built without presentation support.
    pub const fn is_headless(&self) -> bool {
        self.headless
    }

    /// Record and run commands on the graphics queue, blocking until they finish.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn execute_immediate<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let pool = self.immediate_pool.lock();
        unsafe { submit_one_shot(&self.device, &pool, self.graphics_queue, f) }
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            self.immediate_pool.lock().destroy(&self.device);

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    headless: bool,
    frames_in_flight: usize,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Kiln".to_string(),
            enable_validation: cfg!(debug_assertions),
            headless: false,
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Skip surface and swapchain extensions (offscreen rendering and tests).
    #[must_use]
    pub const fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Default frame slot count, clamped to `1..=MAX_FRAMES_IN_FLIGHT`.
    #[must_use]
    pub fn frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.clamp(1, MAX_FRAMES_IN_FLIGHT);
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe {
            create_instance(
                &entry,
                &self.app_name,
                self.enable_validation,
                self.headless,
            )
        }?;

        let physical_device = unsafe { select_physical_device(&instance) }?;

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };

        if !capabilities.meets_requirements(!self.headless) {
            unsafe { instance.destroy_instance(None) };
            return Err(GpuError::NoSuitableDevice);
        }

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let graphics_queue_family =
            match unsafe { find_graphics_queue_family(&instance, physical_device) } {
                Ok(family) => family,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        let (device, graphics_queue) = match unsafe {
            create_device(
                &instance,
                physical_device,
                graphics_queue_family,
                &capabilities,
                self.headless,
            )
        } {
            Ok(created) => created,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let device = Arc::new(device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        let immediate_pool = unsafe {
            CommandPool::new(
                &device,
                graphics_queue_family,
                vk::CommandPoolCreateFlags::TRANSIENT
                    | vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
            )
        }?;

        tracing::debug!(
            frames_in_flight = self.frames_in_flight,
            headless = self.headless,
            "GPU context ready"
        );

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            immediate_pool: Mutex::new(immediate_pool),
            graphics_queue_family,
            graphics_queue,
            frames_in_flight: self.frames_in_flight,
            headless: self.headless,
        })
    }
}

/// Find the first queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let families = instance.get_physical_device_queue_family_properties(physical_device);
    first_graphics_family(&families).ok_or(GpuError::NoSuitableDevice)
}

fn first_graphics_family(families: &[vk::QueueFamilyProperties]) -> Option<u32> {
    families
        .iter()
        .position(|family| {
            family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && family.queue_count > 0
        })
        .and_then(|index| u32::try_from(index).ok())
}

/// Create the logical device and retrieve the graphics queue.
///
/// Optional features are enabled only when the device reports them.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
    capabilities: &GpuCapabilities,
    headless: bool,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const std::ffi::c_char> = if headless {
        Vec::new()
    } else {
        vec![ash::khr::swapchain::NAME.as_ptr()]
    };

    let features = vk::PhysicalDeviceFeatures::default()
        .fill_mode_non_solid(capabilities.supports_fill_mode_non_solid)
        .wide_lines(capabilities.supports_wide_lines)
        .pipeline_statistics_query(capabilities.supports_pipeline_statistics);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&features);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let graphics_queue = device.get_device_queue(graphics_queue_family, 0);

    Ok((device, graphics_queue))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn picks_first_graphics_family() {
        let families = [
            family(vk::QueueFlags::TRANSFER, 2),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER, 1),
        ];
        assert_eq!(first_graphics_family(&families), Some(2));
        assert_eq!(first_graphics_family(&families[..2]), None);
    }

    #[test]
    fn builder_clamps_frames_in_flight() {
        assert_eq!(GpuContextBuilder::new().frames_in_flight(8).frames_in_flight, 3);
        assert_eq!(GpuContextBuilder::new().frames_in_flight(0).frames_in_flight, 1);
        assert_eq!(GpuContextBuilder::default().frames_in_flight, MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn headless_context_runs_immediate_commands() {
        let gpu = GpuContextBuilder::new()
            .headless(true)
            .validation(false)
            .build()
            .unwrap();
        gpu.execute_immediate(|_cmd| {}).unwrap();
        gpu.wait_idle().unwrap();
    }
}
