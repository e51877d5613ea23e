//! Vulkan layer for the Kiln renderer.
//!
//! This crate provides:
//! - Instance, device and context management
//! - GPU capability detection
//! - Device-memory allocation via gpu-allocator
//! - Buffers and images with staged upload and recreation
//! - The command executor and its frame slots
//! - Render passes, framebuffers, graphics pipelines and the pipeline cache
//! - Render-target arenas with extent-driven recreation
//! - Swapchain and surface handling

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod descriptors;
pub mod error;
pub mod executor;
pub mod framebuffer;
pub mod image;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod pipeline_cache;
pub mod query;
pub mod render_pass;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod targets;

pub use buffer::{Buffer, BufferKind, BufferProperties, Placement};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use context::{GpuContext, GpuContextBuilder};
pub use descriptors::{
    write_sampled_image, write_uniform_buffer, DescriptorPool, DescriptorSetLayoutBuilder,
};
pub use error::{GpuError, Result};
pub use executor::{
    execute_immediate, CommandExecutor, CommandExecutorProperties, ExecutorState, FrameSlots,
    SubmitSync,
};
pub use framebuffer::{Framebuffer, FramebufferProperties};
pub use image::{find_depth_format, Image, ImageProperties};
pub use memory::{AllocationDesc, AllocationFlags, GpuAllocator, GpuBuffer, GpuImage, MemoryUsage};
pub use pipeline::{BlendMode, GraphicsPipeline, PipelineProperties, VertexLayout};
pub use pipeline_cache::PipelineCache;
pub use query::{FrameStatistics, PipelineStatistics};
pub use render_pass::{RenderPass, RenderPassProperties};
pub use surface::{SurfaceCapabilities, SurfaceContext};
pub use swapchain::{AcquireResult, Swapchain};
pub use targets::{
    RenderTargets, TargetBackend, VulkanRenderTargets, VulkanTargetContext, VulkanTargets,
};
