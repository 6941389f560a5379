//! Object-oriented Vulkan wrapper.
//!
//! This crate provides:
//! - Instance and device creation with queue-family assignment
//! - Dedicated memory allocation via gpu-allocator
//! - Typed buffers, images, samplers and descriptor sets
//! - Render passes, swapchains and graphics/compute pipelines
//! - Command recording with fences, semaphores and events
//!
//! Every device child holds an `Arc<Device>` and releases its handle on drop,
//! so a device always outlives the objects created from it.

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod image;
pub mod instance;
pub mod manager;
pub mod memory;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::Buffer;
pub use capabilities::{ComputeLimits, GpuCapabilities, GpuVendor};
pub use command::{
    CommandBuffer, CommandBufferState, CommandPool, ComputeBindings, RenderingAttachment,
    SubmitSync,
};
pub use descriptors::{DescriptorKind, DescriptorPool, DescriptorSet};
pub use device::{Device, DeviceConfig, QueueAssignment, QueueUsage};
pub use error::{GpuError, Result};
pub use image::{Image, ImageConfig, ImageView, Sampler, SamplerConfig};
pub use instance::{ApplicationInfo, Instance};
pub use manager::{make_singleton, release_singleton, singleton, Manager, ManagerConfig};
pub use pipeline::{ComputePipeline, GraphicsPipeline, GraphicsPipelineDesc, Pipeline, RenderTarget};
pub use render_pass::{AttachmentType, RenderAttachment, RenderPass, SubPass};
pub use shader::{PushConstants, ShaderModule};
pub use surface::{Surface, SurfaceCapabilities};
pub use swapchain::{
    resolve_parameters, PresentStatus, Swapchain, SwapchainConfig, SwapchainParameters,
};
pub use sync::{
    Barrier, BufferMemoryBarrier, Event, Fence, ImageMemoryBarrier, MemoryBarrier, Semaphore,
    SemaphoreKind,
};
