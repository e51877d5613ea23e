//! 2D images with a view and sampler, staged upload and extent-driven recreation.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::memory::{AllocationDesc, GpuImage};
use ash::vk;
use kiln_core::Extent;

/// Construction parameters for an [`Image`].
#[derive(Clone, Debug)]
pub struct ImageProperties<'a> {
    pub name: String,
    pub extent: Extent,
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    /// Tightly packed texels uploaded at construction.
    pub data: Option<&'a [u8]>,
}

impl<'a> ImageProperties<'a> {
    /// Single-sampled image without initial contents.
    pub fn new(name: impl Into<String>, extent: Extent, format: vk::Format) -> Self {
        Self {
            name: name.into(),
            extent,
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            data: None,
        }
    }

    /// Attach initial texel data.
    #[must_use]
    pub const fn with_data(mut self, data: &'a [u8]) -> Self {
        self.data = Some(data);
        self
    }

    /// Copy without the borrowed data.
    pub fn detached(&self) -> ImageProperties<'static> {
        ImageProperties {
            name: self.name.clone(),
            extent: self.extent,
            format: self.format,
            samples: self.samples,
            data: None,
        }
    }
}

/// Returns true for depth and depth-stencil formats.
pub const fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect touched by views and barriers on an image of this format.
pub const fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        vk::ImageAspectFlags::DEPTH
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// Usage flags for an image of this format.
pub fn image_usage(format: vk::Format) -> vk::ImageUsageFlags {
    let attachment = if is_depth_format(format) {
        vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT
    } else {
        vk::ImageUsageFlags::COLOR_ATTACHMENT
    };
    attachment
        | vk::ImageUsageFlags::SAMPLED
        | vk::ImageUsageFlags::TRANSFER_SRC
        | vk::ImageUsageFlags::TRANSFER_DST
}

/// Bytes per texel for the colour formats the host can read or write.
pub const fn texel_size(format: vk::Format) -> Option<u32> {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_UINT => Some(1),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_UINT
        | vk::Format::R32_SFLOAT => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

/// Access masks and stages for a layout transition.
pub fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> (
    vk::AccessFlags,
    vk::AccessFlags,
    vk::PipelineStageFlags,
    vk::PipelineStageFlags,
) {
    let (src_access, src_stage) = match old {
        vk::ImageLayout::UNDEFINED => {
            (vk::AccessFlags::empty(), vk::PipelineStageFlags::TOP_OF_PIPE)
        }
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER)
        }
        _ => (
            vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    };
    let (dst_access, dst_stage) = match new {
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_WRITE, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => {
            (vk::AccessFlags::TRANSFER_READ, vk::PipelineStageFlags::TRANSFER)
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::AccessFlags::SHADER_READ, vk::PipelineStageFlags::FRAGMENT_SHADER)
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        ),
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        ),
        _ => (
            vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE,
            vk::PipelineStageFlags::ALL_COMMANDS,
        ),
    };
    (src_access, dst_access, src_stage, dst_stage)
}

/// Record a whole-image layout transition.
///
/// # Safety
/// The command buffer must be recording and the image must be valid.
pub unsafe fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) {
    let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old, new);
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(full_range(format));
    device.cmd_pipeline_barrier(
        cmd,
        src_stage,
        dst_stage,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        std::slice::from_ref(&barrier),
    );
}

const fn full_range(format: vk::Format) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect_mask(format),
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// Depth formats tried by [`find_depth_format`], best first.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D24_UNORM_S8_UINT,
    vk::Format::D16_UNORM,
];

/// First candidate usable as an optimally tiled depth attachment.
pub fn find_depth_format(gpu: &GpuContext) -> Result<vk::Format> {
    DEPTH_FORMAT_CANDIDATES
        .into_iter()
        .find(|&format| {
            let props = unsafe {
                gpu.instance()
                    .get_physical_device_format_properties(gpu.physical_device(), format)
            };
            props
                .optimal_tiling_features
                .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| GpuError::InvalidDescription("no supported depth format".into()))
}

/// A GPU image with its view and sampler.
pub struct Image {
    properties: ImageProperties<'static>,
    inner: GpuImage,
    view: vk::ImageView,
    sampler: vk::Sampler,
}

impl Image {
    /// Create an image, uploading `properties.data` if present.
    ///
    /// Uploaded images end in `SHADER_READ_ONLY_OPTIMAL`; others start `UNDEFINED`.
    pub fn new(gpu: &GpuContext, properties: ImageProperties<'_>) -> Result<Self> {
        let data = properties.data;
        let extent = properties.extent.validated()?;
        let mut image = Self {
            properties: properties.detached(),
            inner: GpuImage {
                image: vk::Image::null(),
                allocation: None,
                format: properties.format,
                extent: vk::Extent3D::default(),
            },
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
        };
        let built = image.recreate(gpu, false, extent).and_then(|()| match data {
            Some(data) => image.upload(gpu, data),
            None => Ok(()),
        });
        if let Err(e) = built {
            image.destroy(gpu);
            return Err(e);
        }
        Ok(image)
    }

    /// Returns true while native handles are held.
    pub fn is_live(&self) -> bool {
        self.inner.image != vk::Image::null()
    }

    /// Rebuild at `extent`. An invalid extent keeps the current one.
    ///
    /// `should_clean` releases the current handles first. Passing `false` is
    /// only allowed when nothing is held (the construction path).
    pub fn recreate(&mut self, gpu: &GpuContext, should_clean: bool, extent: Extent) -> Result<()> {
        if should_clean {
            self.release(gpu);
        } else if self.is_live() {
            return Err(GpuError::InvalidState(format!(
                "image '{}' recreated without cleanup while live",
                self.properties.name
            )));
        }

        self.properties.extent = extent.or(self.properties.extent);
        let props = &self.properties;
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(props.format)
            .extent(vk::Extent3D {
                width: props.extent.width,
                height: props.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(props.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage(props.format))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        self.inner = gpu
            .allocator()
            .lock()
            .allocate_image(&create_info, &AllocationDesc::gpu_only(&props.name))?;

        let device = gpu.device();
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.inner.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(props.format)
            .subresource_range(full_range(props.format));
        self.view = unsafe { device.create_image_view(&view_info, None) }.map_err(|e| {
            tracing::error!(name = %props.name, "image view creation failed: {e}");
            GpuError::from(e)
        })?;

        let filter = if is_depth_format(props.format) {
            vk::Filter::NEAREST
        } else {
            vk::Filter::LINEAR
        };
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .max_lod(1.0);
        self.sampler = unsafe { device.create_sampler(&sampler_info, None) }?;

        tracing::debug!(name = %props.name, extent = %props.extent, "image created");
        Ok(())
    }

    /// Rebuild at the current extent.
    pub fn force_recreation(&mut self, gpu: &GpuContext) -> Result<()> {
        self.recreate(gpu, true, self.properties.extent)
    }

    /// Replace the whole image with tightly packed texels.
    pub fn upload(&mut self, gpu: &GpuContext, data: &[u8]) -> Result<()> {
        let expected = self.byte_size()?;
        if data.len() as u64 != expected {
            return Err(GpuError::InvalidDescription(format!(
                "image '{}' expects {expected} bytes, got {}",
                self.properties.name,
                data.len()
            )));
        }
        if self.properties.samples != vk::SampleCountFlags::TYPE_1 {
            return Err(GpuError::InvalidDescription(format!(
                "image '{}' is multisampled and cannot be uploaded",
                self.properties.name
            )));
        }

        let staging_name = format!("{} (staging)", self.properties.name);
        let create_info = vk::BufferCreateInfo::default()
            .size(expected)
            .usage(vk::BufferUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut staging = gpu
            .allocator()
            .lock()
            .allocate_buffer(&create_info, &AllocationDesc::staging(&staging_name))?;

        let (image, format, extent) = (
            self.inner.image,
            self.properties.format,
            self.properties.extent,
        );
        let result = staging.write_bytes(0, data).and_then(|()| {
            let src = staging.buffer;
            gpu.execute_immediate(|cmd| unsafe {
                let device = gpu.device();
                record_transition(
                    device,
                    cmd,
                    image,
                    format,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                device.cmd_copy_buffer_to_image(
                    cmd,
                    src,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[copy_region(format, 0, 0, extent.width, extent.height)],
                );
                record_transition(
                    device,
                    cmd,
                    image,
                    format,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            })
        });

        gpu.allocator().lock().free_buffer(&mut staging)?;
        result
    }

    /// Read the whole image. `layout` is the layout it is in and returns to.
    pub fn read_back(&self, gpu: &GpuContext, layout: vk::ImageLayout) -> Result<Vec<u8>> {
        let Extent { width, height } = self.properties.extent;
        self.read_region(gpu, layout, 0, 0, width, height)
    }

    /// Read one texel, e.g. an identifier for picking.
    pub fn read_texel(
        &self,
        gpu: &GpuContext,
        layout: vk::ImageLayout,
        x: u32,
        y: u32,
    ) -> Result<Vec<u8>> {
        let extent = self.properties.extent;
        if x >= extent.width || y >= extent.height {
            return Err(GpuError::InvalidState(format!(
                "texel ({x}, {y}) outside {extent}"
            )));
        }
        self.read_region(gpu, layout, x, y, 1, 1)
    }

    fn read_region(
        &self,
        gpu: &GpuContext,
        layout: vk::ImageLayout,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        let texel = self.texel_size()?;
        let size = u64::from(width) * u64::from(height) * u64::from(texel);

        let download_name = format!("{} (readback)", self.properties.name);
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let mut download = gpu
            .allocator()
            .lock()
            .allocate_buffer(&create_info, &AllocationDesc::readback(&download_name))?;

        let (image, format) = (self.inner.image, self.properties.format);
        let dst = download.buffer;
        let result = gpu
            .execute_immediate(|cmd| unsafe {
                let device = gpu.device();
                record_transition(
                    device,
                    cmd,
                    image,
                    format,
                    layout,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                );
                device.cmd_copy_image_to_buffer(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst,
                    &[copy_region(format, x, y, width, height)],
                );
                if layout != vk::ImageLayout::UNDEFINED {
                    record_transition(
                        device,
                        cmd,
                        image,
                        format,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        layout,
                    );
                }
                let to_host = vk::MemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                    .dst_access_mask(vk::AccessFlags::HOST_READ);
                device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::HOST,
                    vk::DependencyFlags::empty(),
                    &[to_host],
                    &[],
                    &[],
                );
            })
            .and_then(|()| Ok(download.map()?.to_vec()));

        gpu.allocator().lock().free_buffer(&mut download)?;
        result
    }

    fn texel_size(&self) -> Result<u32> {
        texel_size(self.properties.format).ok_or_else(|| {
            GpuError::InvalidDescription(format!(
                "format {:?} of '{}' has no host layout",
                self.properties.format, self.properties.name
            ))
        })
    }

    fn byte_size(&self) -> Result<u64> {
        Ok(self.properties.extent.area() * u64::from(self.texel_size()?))
    }

    fn release(&mut self, gpu: &GpuContext) {
        let device = gpu.device();
        unsafe {
            if self.sampler != vk::Sampler::null() {
                device.destroy_sampler(self.sampler, None);
                self.sampler = vk::Sampler::null();
            }
            if self.view != vk::ImageView::null() {
                device.destroy_image_view(self.view, None);
                self.view = vk::ImageView::null();
            }
        }
        if let Err(e) = gpu.allocator().lock().free_image(&mut self.inner) {
            tracing::error!(name = %self.properties.name, "failed to free image: {e}");
        }
    }

    /// Release the image. Further calls do nothing.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        self.release(gpu);
    }

    /// Descriptor for sampling in `SHADER_READ_ONLY_OPTIMAL`.
    pub const fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Image view.
    pub const fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Native image handle.
    pub const fn handle(&self) -> vk::Image {
        self.inner.image
    }

    /// Current extent.
    pub const fn extent(&self) -> Extent {
        self.properties.extent
    }

    /// Texel format.
    pub const fn format(&self) -> vk::Format {
        self.properties.format
    }

    /// Sample count.
    pub const fn samples(&self) -> vk::SampleCountFlags {
        self.properties.samples
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.properties.name
    }
}

fn copy_region(
    format: vk::Format,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> vk::BufferImageCopy {
    vk::BufferImageCopy::default()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect_mask(format),
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(vk::Offset3D {
            x: i32::try_from(x).unwrap_or(i32::MAX),
            y: i32::try_from(y).unwrap_or(i32::MAX),
            z: 0,
        })
        .image_extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats_get_depth_usage() {
        assert!(is_depth_format(vk::Format::D32_SFLOAT));
        assert!(!is_depth_format(vk::Format::R8G8B8A8_UNORM));

        let depth = image_usage(vk::Format::D32_SFLOAT);
        assert!(depth.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
        assert!(!depth.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let color = image_usage(vk::Format::B8G8R8A8_SRGB);
        assert!(color.contains(
            vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
        ));
        assert_eq!(aspect_mask(vk::Format::D24_UNORM_S8_UINT), vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32_UINT), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::D32_SFLOAT), None);
    }

    #[test]
    fn upload_transitions_wait_on_transfer() {
        let (src, dst, src_stage, dst_stage) = transition_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert!(src.is_empty());
        assert_eq!(dst, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst_stage, vk::PipelineStageFlags::TRANSFER);

        let (src, dst, src_stage, dst_stage) = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }

    #[test]
    fn detached_properties_keep_description() {
        let texels = [0u8; 16];
        let props = ImageProperties::new("albedo", Extent::new(2, 2), vk::Format::R8G8B8A8_UNORM)
            .with_data(&texels);
        let stored = props.detached();
        assert!(stored.data.is_none());
        assert_eq!(stored.extent, Extent::new(2, 2));
        assert_eq!(stored.samples, vk::SampleCountFlags::TYPE_1);
    }
}
