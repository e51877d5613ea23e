//! Swapchain management.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::surface::SurfaceContext;
use ash::vk;
use kiln_core::Extent;

/// Outcome of acquiring a swapchain image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireResult {
    /// Image ready; `suboptimal` asks for a recreation at the next safe point.
    Ready { index: u32, suboptimal: bool },
    /// No image was acquired; the swapchain must be recreated.
    OutOfDate,
}

/// Swapchain wrapper owning its image views.
pub struct Swapchain {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: Extent,
    vsync: bool,
}

impl Swapchain {
    /// Create a swapchain for `surface` sized as close to `extent` as the surface allows.
    ///
    /// # Safety
    /// The surface must belong to the context's instance.
    pub unsafe fn new(
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: Extent,
        vsync: bool,
    ) -> Result<Self> {
        let mut swapchain = Self {
            loader: surface.swapchain_loader().clone(),
            swapchain: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent,
            vsync,
        };
        swapchain.build(gpu, surface, extent)?;
        Ok(swapchain)
    }

    unsafe fn build(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: Extent,
    ) -> Result<()> {
        let caps = surface.capabilities(gpu)?;
        let surface_format = select_surface_format(&caps.formats)?;
        let present_mode = select_present_mode(&caps.present_modes, self.vsync);
        let native_extent = calculate_extent(&caps.capabilities, extent);
        let old = self.swapchain;

        let queue_families = [gpu.graphics_queue_family()];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(desired_image_count(&caps.capabilities))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(native_extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(caps.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = self
            .loader
            .create_swapchain(&create_info, None)
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        // The retired swapchain is only needed as the creation hint.
        self.release(gpu.device());
        self.swapchain = swapchain;
        self.images = self.loader.get_swapchain_images(swapchain)?;
        self.format = surface_format.format;
        self.extent = Extent::new(native_extent.width, native_extent.height);

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.format)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            self.image_views.push(gpu.device().create_image_view(&view_info, None)?);
        }

        tracing::info!(
            extent = %self.extent,
            images = self.images.len(),
            format = ?self.format,
            mode = ?present_mode,
            "swapchain ready"
        );
        Ok(())
    }

    /// Rebuild at `extent`, handing the old swapchain to the driver.
    ///
    /// # Safety
    /// The device must be idle with respect to the old swapchain.
    pub unsafe fn recreate(
        &mut self,
        gpu: &GpuContext,
        surface: &SurfaceContext,
        extent: Extent,
    ) -> Result<()> {
        self.build(gpu, surface, extent)
    }

    /// Acquire the next image, signalling `semaphore` when it is ready.
    ///
    /// # Safety
    /// The semaphore must be unsignaled with no pending signal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn acquire(
        &self,
        semaphore: vk::Semaphore,
        timeout_ns: u64,
    ) -> Result<AcquireResult> {
        match self
            .loader
            .acquire_next_image(self.swapchain, timeout_ns, semaphore, vk::Fence::null())
        {
            Ok((index, suboptimal)) => Ok(AcquireResult::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireResult::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present image `index` after `wait_semaphores`. Returns true when the
    /// swapchain should be recreated.
    ///
    /// # Safety
    /// The queue must support presentation to this surface.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn present(
        &self,
        queue: vk::Queue,
        index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let indices = [index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices);

        match self.loader.queue_present(queue, &present_info) {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    pub const fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.image_views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub const fn format(&self) -> vk::Format {
        self.format
    }

    pub const fn extent(&self) -> Extent {
        self.extent
    }

    pub const fn vsync(&self) -> bool {
        self.vsync
    }

    unsafe fn release(&mut self, device: &ash::Device) {
        for view in self.image_views.drain(..) {
            device.destroy_image_view(view, None);
        }
        self.images.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.loader.destroy_swapchain(self.swapchain, None);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }

    /// Destroy views and swapchain. Further calls do nothing.
    ///
    /// # Safety
    /// The swapchain must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.release(device);
    }
}

/// Prefer 8-bit sRGB BGRA, then any sRGB-nonlinear format, then the first offered.
pub fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    let srgb = |f: &&vk::SurfaceFormatKHR| f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;
    available
        .iter()
        .find(|f| srgb(f) && f.format == vk::Format::B8G8R8A8_SRGB)
        .or_else(|| available.iter().find(|f| srgb(f)))
        .or_else(|| available.first())
        .copied()
        .ok_or_else(|| GpuError::SwapchainCreation("surface offers no formats".into()))
}

/// FIFO with vsync; otherwise mailbox, then immediate, then FIFO.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Surface-dictated extent, or `desired` clamped to the surface limits.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired: Extent,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image above the minimum, capped by the maximum (0 = unbounded).
pub const fn desired_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && count > capabilities.max_image_count {
        capabilities.max_image_count
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space,
        }
    }

    #[test]
    fn prefers_srgb_bgra() {
        let offered = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        assert_eq!(
            select_surface_format(&offered).unwrap().format,
            vk::Format::B8G8R8A8_SRGB
        );
    }

    #[test]
    fn falls_back_without_panicking() {
        let offered = [format(
            vk::Format::A2B10G10R10_UNORM_PACK32,
            vk::ColorSpaceKHR::HDR10_ST2084_EXT,
        )];
        assert_eq!(
            select_surface_format(&offered).unwrap().format,
            vk::Format::A2B10G10R10_UNORM_PACK32
        );
        assert!(matches!(
            select_surface_format(&[]),
            Err(GpuError::SwapchainCreation(_))
        ));
    }

    #[test]
    fn present_mode_preference() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(select_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&all[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_is_clamped_when_surface_defers() {
        let caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&caps, Extent::new(2560, 480));
        assert_eq!((extent.width, extent.height), (1920, 480));
    }

    #[test]
    fn image_count_respects_maximum() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(desired_image_count(&caps), 3);
        caps.max_image_count = 2;
        assert_eq!(desired_image_count(&caps), 2);
    }
}
