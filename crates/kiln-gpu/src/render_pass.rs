//! Render passes built from a stored description.

use crate::error::{GpuError, Result};
use ash::vk;

/// Description of a single-subpass render pass.
///
/// Colour attachments come first, the optional depth attachment last.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderPassProperties {
    pub name: String,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub samples: vk::SampleCountFlags,
    /// Clear colour attachments on load (otherwise previous contents are kept).
    pub clear_color_on_load: bool,
    /// Clear the depth attachment on load.
    pub clear_depth_on_load: bool,
    /// Layout colour attachments are left in after the pass.
    pub final_color_layout: vk::ImageLayout,
}

impl RenderPassProperties {
    /// Pass drawing straight into swapchain images.
    pub fn present(name: impl Into<String>, format: vk::Format, depth: Option<vk::Format>) -> Self {
        Self {
            name: name.into(),
            color_formats: vec![format],
            depth_format: depth,
            samples: vk::SampleCountFlags::TYPE_1,
            clear_color_on_load: true,
            clear_depth_on_load: true,
            final_color_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    /// Pass rendering into sampled offscreen images.
    pub fn offscreen(
        name: impl Into<String>,
        color_formats: Vec<vk::Format>,
        depth: Option<vk::Format>,
    ) -> Self {
        Self {
            name: name.into(),
            color_formats,
            depth_format: depth,
            samples: vk::SampleCountFlags::TYPE_1,
            clear_color_on_load: true,
            clear_depth_on_load: true,
            final_color_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Total attachment count.
    pub fn attachment_count(&self) -> usize {
        self.color_formats.len() + usize::from(self.depth_format.is_some())
    }

    /// Attachment descriptions in attachment order.
    pub fn attachment_descriptions(&self) -> Vec<vk::AttachmentDescription> {
        let (color_load, color_initial) = if self.clear_color_on_load {
            (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED)
        } else {
            (vk::AttachmentLoadOp::LOAD, self.final_color_layout)
        };

        let mut attachments: Vec<_> = self
            .color_formats
            .iter()
            .map(|&format| {
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(self.samples)
                    .load_op(color_load)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(color_initial)
                    .final_layout(self.final_color_layout)
            })
            .collect();

        if let Some(format) = self.depth_format {
            let (load, initial) = if self.clear_depth_on_load {
                (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED)
            } else {
                (
                    vk::AttachmentLoadOp::LOAD,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                )
            };
            attachments.push(
                vk::AttachmentDescription::default()
                    .format(format)
                    .samples(self.samples)
                    .load_op(load)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                    .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                    .initial_layout(initial)
                    .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
            );
        }

        attachments
    }

    fn dependencies(&self) -> Vec<vk::SubpassDependency> {
        let stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        let access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;

        let mut dependencies = vec![vk::SubpassDependency::default()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .dst_stage_mask(stages)
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(access)];

        if self.final_color_layout == vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL {
            dependencies.push(
                vk::SubpassDependency::default()
                    .src_subpass(0)
                    .dst_subpass(vk::SUBPASS_EXTERNAL)
                    .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
                    .dst_stage_mask(vk::PipelineStageFlags::FRAGMENT_SHADER)
                    .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
                    .dst_access_mask(vk::AccessFlags::SHADER_READ),
            );
        }
        dependencies
    }
}

/// A render pass that can be rebuilt from its description.
pub struct RenderPass {
    properties: RenderPassProperties,
    handle: vk::RenderPass,
}

impl RenderPass {
    /// Create a render pass.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device, properties: RenderPassProperties) -> Result<Self> {
        if properties.attachment_count() == 0 {
            return Err(GpuError::InvalidDescription(format!(
                "render pass '{}' has no attachments",
                properties.name
            )));
        }
        let mut pass = Self {
            properties,
            handle: vk::RenderPass::null(),
        };
        pass.recreate(device, false)?;
        Ok(pass)
    }

    /// Rebuild from the stored description.
    ///
    /// `should_clean` destroys the current handle first. Passing `false` is
    /// only allowed when no handle is held.
    ///
    /// # Safety
    /// The device must be valid and the old pass must not be in use.
    pub unsafe fn recreate(&mut self, device: &ash::Device, should_clean: bool) -> Result<()> {
        if should_clean {
            self.destroy(device);
        } else if self.handle != vk::RenderPass::null() {
            return Err(GpuError::InvalidState(format!(
                "render pass '{}' recreated without cleanup while live",
                self.properties.name
            )));
        }

        let attachments = self.properties.attachment_descriptions();
        let color_refs: Vec<_> = (0..self.properties.color_formats.len())
            .map(|i| vk::AttachmentReference {
                attachment: i as u32,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();
        let depth_ref = vk::AttachmentReference {
            attachment: color_refs.len() as u32,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs);
        if self.properties.depth_format.is_some() {
            subpass = subpass.depth_stencil_attachment(&depth_ref);
        }

        let dependencies = self.properties.dependencies();
        let create_info = vk::RenderPassCreateInfo::default()
            .attachments(&attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);

        self.handle = device.create_render_pass(&create_info, None).map_err(|e| {
            tracing::error!(name = %self.properties.name, "render pass creation failed: {e}");
            GpuError::from(e)
        })?;
        tracing::debug!(name = %self.properties.name, "render pass created");
        Ok(())
    }

    /// Native handle.
    pub const fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    /// Stored description.
    pub const fn properties(&self) -> &RenderPassProperties {
        &self.properties
    }

    /// Debug name.
    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// Destroy the pass. Destroying a null handle does nothing.
    ///
    /// # Safety
    /// The pass must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.handle != vk::RenderPass::null() {
            device.destroy_render_pass(self.handle, None);
            self.handle = vk::RenderPass::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_attachment_comes_last() {
        let props = RenderPassProperties::offscreen(
            "gbuffer",
            vec![vk::Format::R8G8B8A8_UNORM, vk::Format::R32_UINT],
            Some(vk::Format::D32_SFLOAT),
        );
        let attachments = props.attachment_descriptions();
        assert_eq!(props.attachment_count(), 3);
        assert_eq!(attachments.len(), 3);
        assert_eq!(attachments[1].format, vk::Format::R32_UINT);
        assert_eq!(attachments[2].format, vk::Format::D32_SFLOAT);
        assert_eq!(
            attachments[2].final_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            attachments[0].final_layout,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn load_keeps_previous_contents() {
        let mut props =
            RenderPassProperties::present("overlay", vk::Format::B8G8R8A8_SRGB, None);
        props.clear_color_on_load = false;
        let attachments = props.attachment_descriptions();
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(
            attachments[0].initial_layout,
            vk::ImageLayout::PRESENT_SRC_KHR
        );

        props.clear_color_on_load = true;
        let attachments = props.attachment_descriptions();
        assert_eq!(attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(attachments[0].initial_layout, vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn offscreen_passes_hand_off_to_shaders() {
        let offscreen =
            RenderPassProperties::offscreen("scene", vec![vk::Format::R8G8B8A8_UNORM], None);
        assert_eq!(offscreen.dependencies().len(), 2);
        let present = RenderPassProperties::present("swapchain", vk::Format::B8G8R8A8_SRGB, None);
        assert_eq!(present.dependencies().len(), 1);
    }
}
