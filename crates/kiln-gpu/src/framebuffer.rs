//! Framebuffers over offscreen images or swapchain views.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::image::{Image, ImageProperties};
use crate::render_pass::{RenderPass, RenderPassProperties};
use ash::vk;
use kiln_core::{Extent, Handle};

/// Construction parameters for a [`Framebuffer`].
#[derive(Clone, Debug)]
pub struct FramebufferProperties {
    pub name: String,
    pub extent: Extent,
    /// Pass the framebuffer is compatible with.
    pub pass: Handle<RenderPass>,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

impl FramebufferProperties {
    pub fn new(name: impl Into<String>, extent: Extent, pass: Handle<RenderPass>) -> Self {
        Self {
            name: name.into(),
            extent,
            pass,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            clear_depth: 1.0,
        }
    }

    #[must_use]
    pub const fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

/// Clear values in attachment order: colours first, depth last.
pub fn clear_values_for(
    color_count: usize,
    has_depth: bool,
    color: [f32; 4],
    depth: f32,
) -> Vec<vk::ClearValue> {
    let mut values = vec![
        vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        };
        color_count
    ];
    if has_depth {
        values.push(vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
        });
    }
    values
}

/// Framebuffer owning its attachment images, or one framebuffer per
/// swapchain image when built over swapchain views.
pub struct Framebuffer {
    properties: FramebufferProperties,
    /// Owned images: every attachment offscreen, only depth for swapchain targets.
    attachments: Vec<Image>,
    swapchain_views: Vec<vk::ImageView>,
    color_count: usize,
    has_depth: bool,
    handles: Vec<vk::Framebuffer>,
}

impl Framebuffer {
    /// Offscreen framebuffer with one owned image per pass attachment.
    pub fn new(
        gpu: &GpuContext,
        pass: &RenderPass,
        properties: FramebufferProperties,
    ) -> Result<Self> {
        Self::build(gpu, pass, properties, Vec::new())
    }

    /// Framebuffer drawing into swapchain images. Only a depth attachment is owned.
    pub fn for_swapchain(
        gpu: &GpuContext,
        pass: &RenderPass,
        properties: FramebufferProperties,
        views: &[vk::ImageView],
    ) -> Result<Self> {
        if views.is_empty() {
            return Err(GpuError::InvalidDescription(format!(
                "framebuffer '{}' has no swapchain views",
                properties.name
            )));
        }
        if pass.properties().color_formats.len() != 1 {
            return Err(GpuError::InvalidDescription(format!(
                "swapchain framebuffer '{}' needs a pass with exactly one colour attachment",
                properties.name
            )));
        }
        Self::build(gpu, pass, properties, views.to_vec())
    }

    fn build(
        gpu: &GpuContext,
        pass: &RenderPass,
        properties: FramebufferProperties,
        swapchain_views: Vec<vk::ImageView>,
    ) -> Result<Self> {
        let pass_props = pass.properties();
        let mut framebuffer = Self {
            color_count: pass_props.color_formats.len(),
            has_depth: pass_props.depth_format.is_some(),
            attachments: Vec::new(),
            swapchain_views,
            properties,
            handles: Vec::new(),
        };
        let extent = framebuffer.properties.extent.validated()?;
        if let Err(e) = framebuffer.create_attachments(gpu, pass_props, extent) {
            framebuffer.destroy(gpu);
            return Err(e);
        }
        if let Err(e) = framebuffer.create_handles(gpu, pass) {
            framebuffer.destroy(gpu);
            return Err(e);
        }
        Ok(framebuffer)
    }

    fn create_attachments(
        &mut self,
        gpu: &GpuContext,
        pass: &RenderPassProperties,
        extent: Extent,
    ) -> Result<()> {
        let mut formats: Vec<vk::Format> = if self.is_swapchain_owned() {
            Vec::new()
        } else {
            pass.color_formats.clone()
        };
        formats.extend(pass.depth_format);

        for (i, format) in formats.into_iter().enumerate() {
            let name = format!("{}/attachment{i}", self.properties.name);
            let mut props = ImageProperties::new(name, extent, format);
            props.samples = pass.samples;
            self.attachments.push(Image::new(gpu, props)?);
        }
        Ok(())
    }

    fn create_handles(&mut self, gpu: &GpuContext, pass: &RenderPass) -> Result<()> {
        let extent = self.properties.extent;
        let owned: Vec<vk::ImageView> = self.attachments.iter().map(Image::view).collect();
        let targets: Vec<Vec<vk::ImageView>> = if self.is_swapchain_owned() {
            self.swapchain_views
                .iter()
                .map(|&view| std::iter::once(view).chain(owned.iter().copied()).collect())
                .collect()
        } else {
            vec![owned]
        };

        for views in targets {
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(pass.handle())
                .attachments(&views)
                .width(extent.width)
                .height(extent.height)
                .layers(1);
            let handle = unsafe { gpu.device().create_framebuffer(&info, None) }.map_err(|e| {
                tracing::error!(name = %self.properties.name, "framebuffer creation failed: {e}");
                GpuError::from(e)
            })?;
            self.handles.push(handle);
        }
        tracing::debug!(
            name = %self.properties.name,
            extent = %extent,
            count = self.handles.len(),
            "framebuffer created"
        );
        Ok(())
    }

    /// Swap in the views of a recreated swapchain. Takes effect on the next recreate.
    pub fn rebind_swapchain(&mut self, views: &[vk::ImageView]) {
        if self.is_swapchain_owned() {
            self.swapchain_views = views.to_vec();
        }
    }

    /// Rebuild attachments and then the native framebuffers at `extent`.
    ///
    /// An invalid extent keeps the current one. Passing `should_clean = false`
    /// while handles are held is rejected.
    pub fn recreate(
        &mut self,
        gpu: &GpuContext,
        pass: &RenderPass,
        should_clean: bool,
        extent: Extent,
    ) -> Result<()> {
        if !should_clean && !self.handles.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "framebuffer '{}' recreated without cleanup while live",
                self.properties.name
            )));
        }
        self.destroy_handles(gpu);

        let extent = extent.or(self.properties.extent);
        self.properties.extent = extent;
        for image in &mut self.attachments {
            image.recreate(gpu, true, extent)?;
        }
        self.create_handles(gpu, pass)
    }

    /// Native framebuffer for the given swapchain image index.
    ///
    /// Offscreen framebuffers ignore the index.
    pub fn handle(&self, image_index: u32) -> Result<vk::Framebuffer> {
        let slot = if self.is_swapchain_owned() {
            image_index as usize
        } else {
            0
        };
        self.handles.get(slot).copied().ok_or_else(|| {
            GpuError::ResourceNotFound(format!(
                "framebuffer '{}' has no image {image_index}",
                self.properties.name
            ))
        })
    }

    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        clear_values_for(
            self.color_count,
            self.has_depth,
            self.properties.clear_color,
            self.properties.clear_depth,
        )
    }

    /// Owned attachment images, colour first.
    pub fn attachments(&self) -> &[Image] {
        &self.attachments
    }

    /// Owned colour attachment at `index`, if offscreen.
    pub fn color_attachment(&self, index: usize) -> Option<&Image> {
        if self.is_swapchain_owned() || index >= self.color_count {
            None
        } else {
            self.attachments.get(index)
        }
    }

    pub fn is_swapchain_owned(&self) -> bool {
        !self.swapchain_views.is_empty()
    }

    pub const fn extent(&self) -> Extent {
        self.properties.extent
    }

    pub const fn pass(&self) -> Handle<RenderPass> {
        self.properties.pass
    }

    pub fn set_clear_color(&mut self, color: [f32; 4]) {
        self.properties.clear_color = color;
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    /// Full-extent render area.
    pub const fn render_area(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.properties.extent.width,
                height: self.properties.extent.height,
            },
        }
    }

    fn destroy_handles(&mut self, gpu: &GpuContext) {
        for handle in self.handles.drain(..) {
            unsafe { gpu.device().destroy_framebuffer(handle, None) };
        }
    }

    /// Release native framebuffers and owned images. Further calls do nothing.
    pub fn destroy(&mut self, gpu: &GpuContext) {
        self.destroy_handles(gpu);
        for image in &mut self.attachments {
            image.destroy(gpu);
        }
        self.attachments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_values_put_depth_last() {
        let values = clear_values_for(2, true, [0.1, 0.2, 0.3, 1.0], 1.0);
        assert_eq!(values.len(), 3);
        unsafe {
            assert_eq!(values[0].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[1].color.float32, [0.1, 0.2, 0.3, 1.0]);
            assert_eq!(values[2].depth_stencil.depth, 1.0);
            assert_eq!(values[2].depth_stencil.stencil, 0);
        }
    }

    #[test]
    fn colour_only_targets_have_no_depth_clear() {
        let values = clear_values_for(1, false, [0.0; 4], 1.0);
        assert_eq!(values.len(), 1);
    }
}
