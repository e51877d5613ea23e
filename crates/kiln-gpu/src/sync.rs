//! Synchronization primitives.

use crate::error::Result;
use ash::vk;

/// Create a semaphore.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = device.create_semaphore(&create_info, None)?;
    Ok(semaphore)
}

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Wait for every fence in `fences`. An empty slice returns immediately.
///
/// # Safety
/// The device and fences must be valid.
pub unsafe fn wait_for_all(device: &ash::Device, fences: &[vk::Fence]) -> Result<()> {
    if fences.is_empty() {
        return Ok(());
    }
    device.wait_for_fences(fences, true, u64::MAX)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// Per-slot synchronization owned by a command executor.
///
/// The fence guards the slot's command buffer. The semaphores exist only for
/// executors that feed a swapchain.
pub struct SlotSync {
    /// Signaled by the presentation engine when the acquired image is ready
    pub image_acquired: vk::Semaphore,
    /// Signaled by the slot's submission, waited on by present
    pub render_complete: vk::Semaphore,
    /// Signaled when the slot's last submission retires
    pub fence: vk::Fence,
}

impl SlotSync {
    /// Create a slot's primitives. The fence starts signaled.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, with_semaphores: bool) -> Result<Self> {
        let (image_acquired, render_complete) = if with_semaphores {
            (create_semaphore(device)?, create_semaphore(device)?)
        } else {
            (vk::Semaphore::null(), vk::Semaphore::null())
        };
        Ok(Self {
            image_acquired,
            render_complete,
            fence: create_fence(device, true)?,
        })
    }

    /// Returns true if the slot carries presentation semaphores.
    pub fn has_semaphores(&self) -> bool {
        self.image_acquired != vk::Semaphore::null()
    }

    /// Destroy synchronization resources. Null handles are skipped.
    ///
    /// # Safety
    /// The device must be valid and resources must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        for semaphore in [&mut self.image_acquired, &mut self.render_complete] {
            if *semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(*semaphore, None);
                *semaphore = vk::Semaphore::null();
            }
        }
        if self.fence != vk::Fence::null() {
            device.destroy_fence(self.fence, None);
            self.fence = vk::Fence::null();
        }
    }
}
