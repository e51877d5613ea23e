//! Graphics pipelines bound to a render pass, rebuilt on extent changes.

use crate::error::{GpuError, Result};
use crate::render_pass::RenderPass;
use ash::vk;
use kiln_core::{Extent, LineVertex, MeshVertex, QuadVertex};
use std::mem::{offset_of, size_of};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Vertex types that describe their own input layout.
pub trait VertexLayout {
    fn bindings() -> Vec<vk::VertexInputBindingDescription>;
    fn attributes() -> Vec<vk::VertexInputAttributeDescription>;
}

fn binding<T>() -> Vec<vk::VertexInputBindingDescription> {
    vec![vk::VertexInputBindingDescription {
        binding: 0,
        stride: size_of::<T>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    }]
}

const fn attribute(
    location: u32,
    format: vk::Format,
    offset: usize,
) -> vk::VertexInputAttributeDescription {
    vk::VertexInputAttributeDescription {
        location,
        binding: 0,
        format,
        offset: offset as u32,
    }
}

impl VertexLayout for QuadVertex {
    fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        binding::<Self>()
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(3, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, color)),
            attribute(4, vk::Format::R32_UINT, offset_of!(Self, identifier)),
        ]
    }
}

impl VertexLayout for LineVertex {
    fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        binding::<Self>()
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, color)),
        ]
    }
}

impl VertexLayout for MeshVertex {
    fn bindings() -> Vec<vk::VertexInputBindingDescription> {
        binding::<Self>()
    }

    fn attributes() -> Vec<vk::VertexInputAttributeDescription> {
        vec![
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, position)),
            attribute(1, vk::Format::R32G32_SFLOAT, offset_of!(Self, uv)),
            attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Self, normal)),
            attribute(3, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Self, color)),
        ]
    }
}

/// Colour blending applied to every colour attachment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BlendMode {
    #[default]
    Opaque,
    /// Standard non-premultiplied alpha blending.
    Alpha,
    Additive,
}

impl BlendMode {
    pub fn attachment_state(self) -> vk::PipelineColorBlendAttachmentState {
        let state = vk::PipelineColorBlendAttachmentState::default()
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        let (src, dst) = match self {
            Self::Opaque => return state.blend_enable(false),
            Self::Alpha => (
                vk::BlendFactor::SRC_ALPHA,
                vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            ),
            Self::Additive => (vk::BlendFactor::SRC_ALPHA, vk::BlendFactor::ONE),
        };
        state
            .blend_enable(true)
            .src_color_blend_factor(src)
            .dst_color_blend_factor(dst)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
    }
}

/// Check that `words` look like a SPIR-V module.
pub fn validate_spirv(stage: &str, words: &[u32]) -> Result<()> {
    match words.first() {
        None => Err(GpuError::ShaderModule(format!("{stage} shader is empty"))),
        Some(&magic) if magic != SPIRV_MAGIC => Err(GpuError::ShaderModule(format!(
            "{stage} shader is not SPIR-V (magic {magic:#010x})"
        ))),
        Some(_) => Ok(()),
    }
}

/// Everything needed to (re)build a graphics pipeline.
#[derive(Clone, Debug)]
pub struct PipelineProperties {
    pub name: String,
    pub vertex_shader: Vec<u32>,
    pub fragment_shader: Vec<u32>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: BlendMode,
    /// Initial line width; also set dynamically per draw.
    pub line_width: f32,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub extent: Extent,
}

impl PipelineProperties {
    /// Triangle-list pipeline with depth testing and back-face culling.
    pub fn new(
        name: impl Into<String>,
        vertex_shader: Vec<u32>,
        fragment_shader: Vec<u32>,
    ) -> Self {
        Self {
            name: name.into(),
            vertex_shader,
            fragment_shader,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            blend: BlendMode::Opaque,
            line_width: 1.0,
            push_constant_ranges: Vec::new(),
            set_layouts: Vec::new(),
            extent: Extent::new(1, 1),
        }
    }

    #[must_use]
    pub fn with_vertex<V: VertexLayout>(mut self) -> Self {
        self.vertex_bindings = V::bindings();
        self.vertex_attributes = V::attributes();
        self
    }

    #[must_use]
    pub const fn with_topology(mut self, topology: vk::PrimitiveTopology) -> Self {
        self.topology = topology;
        self
    }

    #[must_use]
    pub const fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    #[must_use]
    pub const fn with_depth(mut self, test: bool, write: bool) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self
    }

    #[must_use]
    pub const fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    #[must_use]
    pub const fn with_line_width(mut self, width: f32) -> Self {
        self.line_width = width;
        self
    }

    #[must_use]
    pub fn with_push_constants(mut self, stages: vk::ShaderStageFlags, size: u32) -> Self {
        self.push_constant_ranges.push(vk::PushConstantRange {
            stage_flags: stages,
            offset: 0,
            size,
        });
        self
    }

    #[must_use]
    pub fn with_set_layouts(mut self, layouts: &[vk::DescriptorSetLayout]) -> Self {
        self.set_layouts = layouts.to_vec();
        self
    }

    #[must_use]
    pub const fn with_extent(mut self, extent: Extent) -> Self {
        self.extent = extent;
        self
    }

    /// Dynamic states every pipeline is built with.
    pub fn dynamic_states(&self) -> Vec<vk::DynamicState> {
        let mut states = vec![vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        if is_line_topology(self.topology) || self.polygon_mode == vk::PolygonMode::LINE {
            states.push(vk::DynamicState::LINE_WIDTH);
        }
        states
    }
}

const fn is_line_topology(topology: vk::PrimitiveTopology) -> bool {
    matches!(
        topology,
        vk::PrimitiveTopology::LINE_LIST | vk::PrimitiveTopology::LINE_STRIP
    )
}

/// Graphics pipeline plus its layout.
pub struct GraphicsPipeline {
    properties: PipelineProperties,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    /// Build a pipeline for subpass 0 of `pass`.
    ///
    /// # Safety
    /// The device, pass and cache must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        properties: PipelineProperties,
        pass: &RenderPass,
        cache: vk::PipelineCache,
    ) -> Result<Self> {
        validate_spirv("vertex", &properties.vertex_shader)?;
        validate_spirv("fragment", &properties.fragment_shader)?;
        let extent = properties.extent.validated()?;

        let mut pipeline = Self {
            properties,
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
        };
        pipeline.recreate(device, pass, cache, false, extent)?;
        Ok(pipeline)
    }

    /// Rebuild against `pass` at `extent`.
    ///
    /// An invalid extent keeps the current one. Passing `should_clean = false`
    /// while handles are held is rejected.
    ///
    /// # Safety
    /// The old pipeline must not be in use.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub unsafe fn recreate(
        &mut self,
        device: &ash::Device,
        pass: &RenderPass,
        cache: vk::PipelineCache,
        should_clean: bool,
        extent: Extent,
    ) -> Result<()> {
        if should_clean {
            self.destroy(device);
        } else if self.pipeline != vk::Pipeline::null() {
            return Err(GpuError::InvalidState(format!(
                "pipeline '{}' recreated without cleanup while live",
                self.properties.name
            )));
        }
        self.properties.extent = extent.or(self.properties.extent);

        let props = &self.properties;
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&props.set_layouts)
            .push_constant_ranges(&props.push_constant_ranges);
        self.layout = device
            .create_pipeline_layout(&layout_info, None)
            .map_err(|e| GpuError::PipelineCreation(format!("{}: layout: {e}", props.name)))?;

        let vert_info = vk::ShaderModuleCreateInfo::default().code(&props.vertex_shader);
        let vert_module = match device.create_shader_module(&vert_info, None) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_pipeline_layout(self.layout, None);
                self.layout = vk::PipelineLayout::null();
                return Err(GpuError::ShaderModule(format!("{}: vertex: {e}", props.name)));
            }
        };
        let frag_info = vk::ShaderModuleCreateInfo::default().code(&props.fragment_shader);
        let frag_module = match device.create_shader_module(&frag_info, None) {
            Ok(module) => module,
            Err(e) => {
                device.destroy_shader_module(vert_module, None);
                device.destroy_pipeline_layout(self.layout, None);
                self.layout = vk::PipelineLayout::null();
                return Err(GpuError::ShaderModule(format!("{}: fragment: {e}", props.name)));
            }
        };

        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(c"main"),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(c"main"),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&props.vertex_bindings)
            .vertex_attribute_descriptions(&props.vertex_attributes);
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(props.topology)
            .primitive_restart_enable(false);
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(props.polygon_mode)
            .cull_mode(props.cull_mode)
            .front_face(props.front_face)
            .line_width(props.line_width);
        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(pass.properties().samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(props.depth_test)
            .depth_write_enable(props.depth_write)
            .depth_compare_op(props.depth_compare);

        let blend_attachments =
            vec![props.blend.attachment_state(); pass.properties().color_formats.len()];
        let color_blending =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

        let dynamic_states = props.dynamic_states();
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(self.layout)
            .render_pass(pass.handle())
            .subpass(0);
        if pass.properties().depth_format.is_some() {
            pipeline_info = pipeline_info.depth_stencil_state(&depth_stencil);
        }

        let result = device.create_graphics_pipelines(cache, &[pipeline_info], None);
        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);

        match result {
            Ok(pipelines) => {
                self.pipeline = pipelines.first().copied().unwrap_or_default();
                tracing::debug!(name = %props.name, extent = %props.extent, "pipeline created");
                Ok(())
            }
            Err((_, e)) => {
                tracing::error!(name = %props.name, "pipeline creation failed: {e}");
                device.destroy_pipeline_layout(self.layout, None);
                self.layout = vk::PipelineLayout::null();
                Err(GpuError::PipelineCreation(format!("{}: {e}", props.name)))
            }
        }
    }

    /// Record without native handles.
    #[cfg(test)]
    pub(crate) const fn unbuilt(properties: PipelineProperties) -> Self {
        Self {
            properties,
            pipeline: vk::Pipeline::null(),
            layout: vk::PipelineLayout::null(),
        }
    }

    /// Rebuild at the current extent.
    ///
    /// # Safety
    /// See [`Self::recreate`].
    pub unsafe fn force_recreation(
        &mut self,
        device: &ash::Device,
        pass: &RenderPass,
        cache: vk::PipelineCache,
    ) -> Result<()> {
        self.recreate(device, pass, cache, true, self.properties.extent)
    }

    /// Bind the pipeline and set viewport, scissor and line width to cover `extent`.
    ///
    /// # Safety
    /// `cmd` must be recording inside a compatible render pass.
    pub unsafe fn bind(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);
        device.cmd_set_viewport(cmd, 0, &[self.viewport()]);
        device.cmd_set_scissor(cmd, 0, &[self.scissor()]);
        if self.properties.dynamic_states().contains(&vk::DynamicState::LINE_WIDTH) {
            device.cmd_set_line_width(cmd, self.properties.line_width);
        }
    }

    /// Full-extent viewport with a 0..1 depth range.
    pub fn viewport(&self) -> vk::Viewport {
        vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.properties.extent.width as f32,
            height: self.properties.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }

    pub const fn scissor(&self) -> vk::Rect2D {
        vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: self.properties.extent.width,
                height: self.properties.extent.height,
            },
        }
    }

    /// Extent the pipeline was last built for.
    pub const fn extent(&self) -> Extent {
        self.properties.extent
    }

    pub const fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub const fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    pub const fn properties(&self) -> &PipelineProperties {
        &self.properties
    }

    pub fn name(&self) -> &str {
        &self.properties.name
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.properties.line_width = width;
    }

    /// Destroy the pipeline and layout. Further calls do nothing.
    ///
    /// # Safety
    /// The pipeline must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline, None);
            self.pipeline = vk::Pipeline::null();
        }
        if self.layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.layout, None);
            self.layout = vk::PipelineLayout::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_layout_covers_every_field() {
        let attributes = QuadVertex::attributes();
        assert_eq!(attributes.len(), 5);
        assert_eq!(attributes[4].offset, 48);
        assert_eq!(attributes[4].format, vk::Format::R32_UINT);
        assert_eq!(QuadVertex::bindings()[0].stride, 52);
        assert_eq!(LineVertex::bindings()[0].stride, 28);
        assert_eq!(LineVertex::attributes()[1].offset, 12);
        assert_eq!(MeshVertex::attributes()[3].offset, 32);
    }

    #[test]
    fn spirv_magic_is_checked() {
        assert!(validate_spirv("vertex", &[SPIRV_MAGIC, 0x0001_0000]).is_ok());
        assert!(matches!(
            validate_spirv("vertex", &[]),
            Err(GpuError::ShaderModule(_))
        ));
        assert!(matches!(
            validate_spirv("fragment", &[0xdead_beef]),
            Err(GpuError::ShaderModule(_))
        ));
    }

    #[test]
    fn line_pipelines_get_dynamic_width() {
        let props = PipelineProperties::new("line", vec![SPIRV_MAGIC], vec![SPIRV_MAGIC])
            .with_vertex::<LineVertex>()
            .with_topology(vk::PrimitiveTopology::LINE_LIST);
        assert!(props.dynamic_states().contains(&vk::DynamicState::LINE_WIDTH));

        let quads = PipelineProperties::new("quad", vec![SPIRV_MAGIC], vec![SPIRV_MAGIC]);
        assert_eq!(quads.dynamic_states().len(), 2);
    }

    #[test]
    fn blend_modes() {
        assert_eq!(BlendMode::Opaque.attachment_state().blend_enable, vk::FALSE);
        let alpha = BlendMode::Alpha.attachment_state();
        assert_eq!(alpha.blend_enable, vk::TRUE);
        assert_eq!(alpha.dst_color_blend_factor, vk::BlendFactor::ONE_MINUS_SRC_ALPHA);
        assert_eq!(
            BlendMode::Additive.attachment_state().dst_color_blend_factor,
            vk::BlendFactor::ONE
        );
    }
}
