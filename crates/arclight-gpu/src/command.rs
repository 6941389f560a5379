//! Command pools and command buffer recording.

use crate::buffer::Buffer;
use crate::descriptors::DescriptorSet;
use crate::device::{Device, QueueUsage};
use crate::error::{GpuError, Result};
use crate::image::{texel_size, Image, ImageView};
use crate::pipeline::{ComputePipeline, Pipeline};
use crate::render_pass::RenderPass;
use crate::shader::PushConstants;
use crate::sync::{
    Barrier, BarrierBatch, Event, Fence, ImageMemoryBarrier, MemoryBarrier, Semaphore,
};
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct PoolInner {
    device: Arc<Device>,
    handle: vk::CommandPool,
    usage: QueueUsage,
    queue_family: u32,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        // SAFETY: every command buffer holds the pool alive, so none remain.
        unsafe { self.device.handle().destroy_command_pool(self.handle, None) };
    }
}

/// Command pool bound to the queue family serving one usage.
#[derive(Clone)]
pub struct CommandPool {
    inner: Arc<PoolInner>,
}

impl CommandPool {
    /// Create a pool whose buffers can be reset individually.
    pub fn new(device: &Arc<Device>, usage: QueueUsage) -> Result<Self> {
        if !device.synchronization2_enabled() {
            return Err(GpuError::InvalidConfig(
                "command recording requires synchronization2".to_string(),
            ));
        }
        let queue_family = device
            .queue_family(usage)
            .ok_or_else(|| GpuError::InvalidConfig(format!("device has no {usage} queue")))?;

        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: the queue family exists on this device.
        let handle = unsafe { device.handle().create_command_pool(&create_info, None) }?;
        debug!("Created {usage} command pool {handle:?} on family {queue_family}");

        Ok(Self {
            inner: Arc::new(PoolInner {
                device: Arc::clone(device),
                handle,
                usage,
                queue_family,
            }),
        })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.inner.handle
    }

    pub fn usage(&self) -> QueueUsage {
        self.inner.usage
    }

    pub fn queue_family(&self) -> u32 {
        self.inner.queue_family
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.inner.device
    }

    /// Allocate a primary command buffer that is ready for recording.
    pub fn allocate(&self) -> Result<CommandBuffer> {
        CommandBuffer::new(self)
    }
}

/// Lifecycle of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandBufferState {
    Initial,
    Recording,
    Executable,
    Pending,
    Invalid,
}

impl CommandBufferState {
    fn can_record(self) -> bool {
        self == Self::Recording
    }

    /// Buffers are recorded for one-time submission, so only a buffer that is
    /// still recording can be ended and submitted.
    fn can_submit(self) -> bool {
        self == Self::Recording
    }

    fn can_reset(self) -> bool {
        self != Self::Pending
    }
}

/// Number of workgroups covering `global` invocations.
pub fn workgroup_count(global: [u32; 3], workgroup: [u32; 3]) -> [u32; 3] {
    [0, 1, 2].map(|i| global[i].div_ceil(workgroup[i].max(1)))
}

/// Validate a copy of `bytes` between buffers of `src_size` and `dst_size`.
/// A zero-byte copy yields `None`.
fn copy_region(
    src_size: vk::DeviceSize,
    dst_size: vk::DeviceSize,
    bytes: vk::DeviceSize,
    src_offset: vk::DeviceSize,
    dst_offset: vk::DeviceSize,
) -> Result<Option<vk::BufferCopy>> {
    if bytes == 0 {
        return Ok(None);
    }
    let fits = |offset: vk::DeviceSize, size: vk::DeviceSize| {
        offset
            .checked_add(bytes)
            .is_some_and(|end| end <= size)
    };
    if !fits(src_offset, src_size) {
        return Err(GpuError::OutOfBounds(format!(
            "copy source range {src_offset}..{} exceeds {src_size} bytes",
            src_offset.saturating_add(bytes)
        )));
    }
    if !fits(dst_offset, dst_size) {
        return Err(GpuError::OutOfBounds(format!(
            "copy destination range {dst_offset}..{} exceeds {dst_size} bytes",
            dst_offset.saturating_add(bytes)
        )));
    }
    Ok(Some(vk::BufferCopy {
        src_offset,
        dst_offset,
        size: bytes,
    }))
}

/// Stage and access scopes for a known layout transition.
fn transition_scope(old: vk::ImageLayout, new: vk::ImageLayout) -> Option<MemoryBarrier> {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    let scope = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => {
            MemoryBarrier::new(S::TOP_OF_PIPE, A::NONE, S::TRANSFER, A::TRANSFER_WRITE)
        }
        (L::UNDEFINED, L::GENERAL) => MemoryBarrier::new(
            S::TOP_OF_PIPE,
            A::NONE,
            S::COMPUTE_SHADER,
            A::SHADER_READ | A::SHADER_WRITE,
        ),
        (L::UNDEFINED, L::COLOR_ATTACHMENT_OPTIMAL) => MemoryBarrier::new(
            S::TOP_OF_PIPE,
            A::NONE,
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
        ),
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => MemoryBarrier::new(
            S::TOP_OF_PIPE,
            A::NONE,
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => MemoryBarrier::new(
            S::TRANSFER,
            A::TRANSFER_WRITE,
            S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::SHADER_READ,
        ),
        (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_SRC_OPTIMAL) => {
            MemoryBarrier::new(S::TRANSFER, A::TRANSFER_WRITE, S::TRANSFER, A::TRANSFER_READ)
        }
        (L::TRANSFER_SRC_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => {
            MemoryBarrier::new(S::TRANSFER, A::TRANSFER_READ, S::TRANSFER, A::TRANSFER_WRITE)
        }
        (L::TRANSFER_DST_OPTIMAL, L::PRESENT_SRC_KHR) => {
            MemoryBarrier::new(S::TRANSFER, A::TRANSFER_WRITE, S::BOTTOM_OF_PIPE, A::NONE)
        }
        (L::COLOR_ATTACHMENT_OPTIMAL, L::PRESENT_SRC_KHR) => MemoryBarrier::new(
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_WRITE,
            S::BOTTOM_OF_PIPE,
            A::NONE,
        ),
        (L::GENERAL, L::TRANSFER_SRC_OPTIMAL) => MemoryBarrier::new(
            S::COMPUTE_SHADER,
            A::SHADER_WRITE,
            S::TRANSFER,
            A::TRANSFER_READ,
        ),
        (L::TRANSFER_SRC_OPTIMAL, L::GENERAL) => MemoryBarrier::new(
            S::TRANSFER,
            A::TRANSFER_READ,
            S::COMPUTE_SHADER,
            A::SHADER_READ | A::SHADER_WRITE,
        ),
        _ => return None,
    };
    Some(scope)
}

/// One attachment of a dynamic rendering scope.
#[derive(Clone, Copy)]
pub struct RenderingAttachment {
    view: vk::ImageView,
    layout: vk::ImageLayout,
    load_op: vk::AttachmentLoadOp,
    store_op: vk::AttachmentStoreOp,
    clear: vk::ClearValue,
}

impl RenderingAttachment {
    /// Color attachment cleared to `color`.
    pub fn color(view: &ImageView, color: [f32; 4]) -> Self {
        Self {
            view: view.handle(),
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: vk::ClearValue {
                color: vk::ClearColorValue { float32: color },
            },
        }
    }

    /// Depth attachment cleared to `depth`.
    pub fn depth(view: &ImageView, depth: f32) -> Self {
        Self {
            view: view.handle(),
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            clear: vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil: 0 },
            },
        }
    }

    /// Keep the existing contents instead of clearing.
    pub fn load(mut self) -> Self {
        self.load_op = vk::AttachmentLoadOp::LOAD;
        self
    }

    fn to_vk(self) -> vk::RenderingAttachmentInfo<'static> {
        vk::RenderingAttachmentInfo::default()
            .image_view(self.view)
            .image_layout(self.layout)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .clear_value(self.clear)
    }
}

/// Semaphores and fence attached to a submission.
#[derive(Default)]
pub struct SubmitSync {
    waits: Vec<vk::SemaphoreSubmitInfo<'static>>,
    signals: Vec<vk::SemaphoreSubmitInfo<'static>>,
    fence: Option<vk::Fence>,
}

impl SubmitSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for `semaphore` (reaching `value` if it is a timeline) before `stages`.
    pub fn wait(mut self, semaphore: &Semaphore, value: u64, stages: vk::PipelineStageFlags2) -> Self {
        self.waits.push(semaphore.submit_info(value, stages));
        self
    }

    /// Signal `semaphore` (to `value` if it is a timeline) after `stages`.
    pub fn signal(mut self, semaphore: &Semaphore, value: u64, stages: vk::PipelineStageFlags2) -> Self {
        self.signals.push(semaphore.submit_info(value, stages));
        self
    }

    pub fn fence(mut self, fence: &Fence) -> Self {
        self.fence = Some(fence.handle());
        self
    }
}

/// Resources the [`CommandBuffer::compute`] helper binds before dispatching.
#[derive(Default, Clone, Copy)]
pub struct ComputeBindings<'a> {
    pub descriptor_set: Option<&'a DescriptorSet>,
    pub push_constants: Option<&'a PushConstants>,
}

#[derive(Debug, Clone, Copy)]
struct BoundPipeline {
    layout: vk::PipelineLayout,
    bind_point: vk::PipelineBindPoint,
    workgroup: Option<[u32; 3]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RenderScope {
    Pass { subpass: u32, subpass_count: u32 },
    Dynamic,
}

/// Primary command buffer recorded for one-time submission.
pub struct CommandBuffer {
    pool: Arc<PoolInner>,
    handle: vk::CommandBuffer,
    state: CommandBufferState,
    bound: Option<BoundPipeline>,
    render_scope: Option<RenderScope>,
    in_flight: Option<vk::Fence>,
}

impl CommandBuffer {
    /// Allocate from `pool` and begin recording.
    pub fn new(pool: &CommandPool) -> Result<Self> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool.inner.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: the pool is alive and used by this thread only.
        let handles = unsafe { pool.inner.device.handle().allocate_command_buffers(&alloc_info) }?;
        let handle = handles
            .first()
            .copied()
            .ok_or_else(|| GpuError::AllocationFailed("no command buffer returned".to_string()))?;

        let mut buffer = Self {
            pool: Arc::clone(&pool.inner),
            handle,
            state: CommandBufferState::Initial,
            bound: None,
            render_scope: None,
            in_flight: None,
        };
        buffer.begin()?;
        Ok(buffer)
    }

    fn device(&self) -> &ash::Device {
        self.pool.device.handle()
    }

    fn begin(&mut self) -> Result<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        // SAFETY: the buffer is in the initial state.
        if let Err(e) = unsafe { self.device().begin_command_buffer(self.handle, &begin_info) } {
            self.state = CommandBufferState::Invalid;
            return Err(e.into());
        }
        self.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn usage(&self) -> QueueUsage {
        self.pool.usage
    }

    pub fn state(&self) -> CommandBufferState {
        self.state
    }

    fn ensure_recording(&self) -> Result<()> {
        if self.state.can_record() {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "command buffer is {:?}, not recording",
                self.state
            )))
        }
    }

    fn ensure_usage(&self, usage: QueueUsage, operation: &str) -> Result<()> {
        if self.pool.usage == usage {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "{operation} requires a {usage} command buffer, this one is {}",
                self.pool.usage
            )))
        }
    }

    fn bound_pipeline(&self, operation: &str) -> Result<BoundPipeline> {
        self.bound.ok_or_else(|| {
            GpuError::InvalidState(format!("{operation} requires a bound pipeline"))
        })
    }

    /// Bind a graphics or compute pipeline.
    pub fn bind_pipeline<P: Pipeline>(&mut self, pipeline: &P) -> Result<()> {
        self.ensure_recording()?;
        let bind_point = pipeline.bind_point();
        let usage = if bind_point == vk::PipelineBindPoint::COMPUTE {
            QueueUsage::Compute
        } else {
            QueueUsage::Graphics
        };
        self.ensure_usage(usage, "binding this pipeline")?;

        // SAFETY: the buffer is recording and the pipeline is alive.
        unsafe {
            self.device()
                .cmd_bind_pipeline(self.handle, bind_point, pipeline.handle());
        }
        self.bound = Some(BoundPipeline {
            layout: pipeline.layout(),
            bind_point,
            workgroup: pipeline.workgroup_size(),
        });
        Ok(())
    }

    /// Bind `set` at set index 0.
    pub fn bind_descriptor_set(&mut self, set: &DescriptorSet) -> Result<()> {
        self.bind_descriptor_set_at(set, 0)
    }

    /// Bind `set` at `index` of the bound pipeline's layout.
    pub fn bind_descriptor_set_at(&mut self, set: &DescriptorSet, index: u32) -> Result<()> {
        self.ensure_recording()?;
        let bound = self.bound_pipeline("binding a descriptor set")?;
        if !set.is_allocated() {
            return Err(GpuError::InvalidState(
                "descriptor set has not been allocated from a pool".to_string(),
            ));
        }
        // SAFETY: the set is allocated and compatible with the bound layout.
        unsafe {
            self.device().cmd_bind_descriptor_sets(
                self.handle,
                bound.bind_point,
                bound.layout,
                index,
                &[set.handle()],
                &[],
            );
        }
        Ok(())
    }

    /// Upload push constants through the bound pipeline's layout.
    pub fn push_constants(&mut self, push_constants: &PushConstants) -> Result<()> {
        self.ensure_recording()?;
        let bound = self.bound_pipeline("pushing constants")?;
        if push_constants.is_empty() {
            return Ok(());
        }
        // SAFETY: the range matches the one declared in the layout.
        unsafe {
            self.device().cmd_push_constants(
                self.handle,
                bound.layout,
                push_constants.stages(),
                push_constants.offset(),
                push_constants.data(),
            );
        }
        Ok(())
    }

    pub fn bind_vertex_buffer<T: Pod>(
        &mut self,
        binding: u32,
        buffer: &Buffer<T>,
        offset: vk::DeviceSize,
    ) -> Result<()> {
        self.ensure_recording()?;
        self.ensure_usage(QueueUsage::Graphics, "binding a vertex buffer")?;
        // SAFETY: the buffer is alive while the recording is pending.
        unsafe {
            self.device()
                .cmd_bind_vertex_buffers(self.handle, binding, &[buffer.handle()], &[offset]);
        }
        Ok(())
    }

    /// Copy `bytes` from `src` to `dst`. Both ranges must lie inside their buffers.
    pub fn copy_buffer<S: Pod, D: Pod>(
        &mut self,
        src: &Buffer<S>,
        dst: &Buffer<D>,
        bytes: vk::DeviceSize,
        src_offset: vk::DeviceSize,
        dst_offset: vk::DeviceSize,
    ) -> Result<()> {
        self.ensure_recording()?;
        let Some(region) =
            copy_region(src.size_bytes(), dst.size_bytes(), bytes, src_offset, dst_offset)?
        else {
            return Ok(());
        };
        // SAFETY: the region was checked against both buffers.
        unsafe {
            self.device()
                .cmd_copy_buffer(self.handle, src.handle(), dst.handle(), &[region]);
        }
        Ok(())
    }

    /// Copy mip level 0 of a color image into `dst`, tightly packed.
    pub fn copy_image_to_buffer<T: Pod>(&mut self, image: &Image, dst: &Buffer<T>) -> Result<()> {
        self.ensure_recording()?;
        let layout = image.layout();
        if layout != vk::ImageLayout::GENERAL && layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            return Err(GpuError::InvalidState(format!(
                "cannot copy from an image in layout {layout:?}"
            )));
        }
        let extent = image.extent();
        let texel_size = texel_size(image.format()).ok_or_else(|| {
            GpuError::InvalidConfig(format!("no texel size known for {:?}", image.format()))
        })?;
        let needed = vk::DeviceSize::from(extent.width)
            * vk::DeviceSize::from(extent.height)
            * vk::DeviceSize::from(extent.depth)
            * vk::DeviceSize::from(texel_size);
        if needed > dst.size_bytes() {
            return Err(GpuError::OutOfBounds(format!(
                "image needs {needed} bytes but the buffer holds {}",
                dst.size_bytes()
            )));
        }
        let region = vk::BufferImageCopy::default()
            .image_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(image.full_range().aspect_mask)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1),
            )
            .image_extent(extent);
        // SAFETY: the image is in a transfer-capable layout and the buffer fits it.
        unsafe {
            self.device().cmd_copy_image_to_buffer(
                self.handle,
                image.handle(),
                layout,
                dst.handle(),
                &[region],
            );
        }
        Ok(())
    }

    /// Record a single pipeline barrier.
    pub fn add_barrier(&mut self, barrier: impl Into<Barrier>) -> Result<()> {
        self.add_barriers(&[barrier.into()])
    }

    /// Record several barriers as one dependency.
    pub fn add_barriers(&mut self, barriers: &[Barrier]) -> Result<()> {
        self.ensure_recording()?;
        let batch = BarrierBatch::new(barriers);
        if batch.is_empty() {
            return Ok(());
        }
        // SAFETY: the dependency arrays live until the call returns.
        unsafe {
            self.device()
                .cmd_pipeline_barrier2(self.handle, &batch.dependency_info());
        }
        Ok(())
    }

    /// Transition `image` to `new_layout` and record the new layout on it.
    pub fn transition_image_layout(&mut self, image: &mut Image, new_layout: vk::ImageLayout) -> Result<()> {
        self.transition_image_handle(image.handle(), image.full_range(), image.layout(), new_layout)?;
        image.set_layout(new_layout);
        Ok(())
    }

    /// Transition an image this crate does not own, such as a swapchain image.
    pub fn transition_image_handle(
        &mut self,
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) -> Result<()> {
        let scope = transition_scope(old_layout, new_layout).unwrap_or_else(|| {
            warn!("Unknown layout transition {old_layout:?} -> {new_layout:?}, using a full barrier");
            MemoryBarrier::new(
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_WRITE,
                vk::PipelineStageFlags2::ALL_COMMANDS,
                vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
            )
        });
        let barrier = ImageMemoryBarrier::from_raw(image, range, scope)
            .with_layouts(old_layout, new_layout);
        self.add_barrier(barrier)
    }

    /// Clear a color image in `GENERAL` or `TRANSFER_DST_OPTIMAL` layout.
    pub fn clear_color_image(&mut self, image: &Image, color: [f32; 4]) -> Result<()> {
        self.ensure_recording()?;
        let layout = image.layout();
        if layout != vk::ImageLayout::GENERAL && layout != vk::ImageLayout::TRANSFER_DST_OPTIMAL {
            return Err(GpuError::InvalidState(format!(
                "cannot clear an image in layout {layout:?}"
            )));
        }
        let value = vk::ClearColorValue { float32: color };
        // SAFETY: the image is in a layout that permits clears.
        unsafe {
            self.device().cmd_clear_color_image(
                self.handle,
                image.handle(),
                layout,
                &value,
                &[image.full_range()],
            );
        }
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.ensure_recording()?;
        let bound = self.bound_pipeline("draw")?;
        if bound.bind_point != vk::PipelineBindPoint::GRAPHICS {
            return Err(GpuError::InvalidState("draw requires a graphics pipeline".to_string()));
        }
        if self.render_scope.is_none() {
            return Err(GpuError::InvalidState(
                "draw must be recorded inside a render pass or rendering scope".to_string(),
            ));
        }
        // SAFETY: a graphics pipeline is bound inside a rendering scope.
        unsafe {
            self.device().cmd_draw(
                self.handle,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            );
        }
        Ok(())
    }

    /// Dispatch enough workgroups of the bound compute pipeline to cover
    /// `global` invocations.
    pub fn dispatch(&mut self, global: [u32; 3]) -> Result<()> {
        self.ensure_recording()?;
        self.ensure_usage(QueueUsage::Compute, "dispatch")?;
        let workgroup = self
            .bound_pipeline("dispatch")?
            .workgroup
            .ok_or_else(|| GpuError::InvalidState("dispatch requires a compute pipeline".to_string()))?;
        let [x, y, z] = workgroup_count(global, workgroup);
        // SAFETY: a compute pipeline is bound.
        unsafe { self.device().cmd_dispatch(self.handle, x, y, z) };
        Ok(())
    }

    /// Begin `render_pass` on `framebuffer`, rendering into `extent`.
    pub fn begin_renderpass(
        &mut self,
        render_pass: &RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) -> Result<()> {
        self.ensure_recording()?;
        self.ensure_usage(QueueUsage::Graphics, "begin_renderpass")?;
        if !render_pass.is_finalized() {
            return Err(GpuError::InvalidState("render pass is not finalized".to_string()));
        }
        if self.render_scope.is_some() {
            return Err(GpuError::InvalidState("a rendering scope is already open".to_string()));
        }
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass.handle())
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        // SAFETY: the pass is finalized and the framebuffer matches it.
        unsafe {
            self.device()
                .cmd_begin_render_pass(self.handle, &begin_info, vk::SubpassContents::INLINE);
        }
        self.render_scope = Some(RenderScope::Pass {
            subpass: 0,
            subpass_count: render_pass.subpass_count() as u32,
        });
        Ok(())
    }

    pub fn next_subpass(&mut self) -> Result<()> {
        self.ensure_recording()?;
        let Some(RenderScope::Pass {
            subpass,
            subpass_count,
        }) = self.render_scope
        else {
            return Err(GpuError::InvalidState("no render pass is active".to_string()));
        };
        if subpass + 1 >= subpass_count {
            return Err(GpuError::InvalidState(format!(
                "render pass has no subpass after {subpass}"
            )));
        }
        // SAFETY: a render pass with a further subpass is active.
        unsafe {
            self.device()
                .cmd_next_subpass(self.handle, vk::SubpassContents::INLINE);
        }
        self.render_scope = Some(RenderScope::Pass {
            subpass: subpass + 1,
            subpass_count,
        });
        Ok(())
    }

    pub fn end_renderpass(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if !matches!(self.render_scope, Some(RenderScope::Pass { .. })) {
            return Err(GpuError::InvalidState("no render pass is active".to_string()));
        }
        // SAFETY: a render pass is active.
        unsafe { self.device().cmd_end_render_pass(self.handle) };
        self.render_scope = None;
        Ok(())
    }

    /// Begin a dynamic rendering scope over `area`.
    pub fn begin_render(
        &mut self,
        area: vk::Rect2D,
        colors: &[RenderingAttachment],
        depth: Option<RenderingAttachment>,
    ) -> Result<()> {
        self.ensure_recording()?;
        self.ensure_usage(QueueUsage::Graphics, "begin_render")?;
        if !self.pool.device.dynamic_rendering_enabled() {
            return Err(GpuError::InvalidConfig(
                "dynamic rendering is not enabled on this device".to_string(),
            ));
        }
        if self.render_scope.is_some() {
            return Err(GpuError::InvalidState("a rendering scope is already open".to_string()));
        }
        let color_infos: Vec<_> = colors.iter().map(|a| a.to_vk()).collect();
        let depth_info = depth.map(RenderingAttachment::to_vk);
        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(area)
            .layer_count(1)
            .color_attachments(&color_infos);
        if let Some(depth_info) = depth_info.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth_info);
        }
        // SAFETY: the attachment views are alive and in the declared layouts.
        unsafe { self.device().cmd_begin_rendering(self.handle, &rendering_info) };
        self.render_scope = Some(RenderScope::Dynamic);
        Ok(())
    }

    pub fn end_render(&mut self) -> Result<()> {
        self.ensure_recording()?;
        if self.render_scope != Some(RenderScope::Dynamic) {
            return Err(GpuError::InvalidState("no dynamic rendering scope is active".to_string()));
        }
        // SAFETY: a dynamic rendering scope is active.
        unsafe { self.device().cmd_end_rendering(self.handle) };
        self.render_scope = None;
        Ok(())
    }

    /// Signal `event` once its dependency is satisfied.
    pub fn set_event(&mut self, event: &Event) -> Result<()> {
        self.ensure_recording()?;
        // SAFETY: the event and its dependency arrays are alive.
        unsafe {
            self.device()
                .cmd_set_event2(self.handle, event.handle(), &event.dependency().dependency_info());
        }
        Ok(())
    }

    /// Unsignal `event` after `stages` complete.
    pub fn reset_event(&mut self, event: &Event, stages: vk::PipelineStageFlags2) -> Result<()> {
        self.ensure_recording()?;
        // SAFETY: the event is alive.
        unsafe { self.device().cmd_reset_event2(self.handle, event.handle(), stages) };
        Ok(())
    }

    /// Wait for `event`, applying its dependency.
    pub fn wait_event(&mut self, event: &Event) -> Result<()> {
        self.ensure_recording()?;
        let dependency = event.dependency().dependency_info();
        // SAFETY: the dependency matches the one used by set_event.
        unsafe {
            self.device().cmd_wait_events2(
                self.handle,
                std::slice::from_ref(&event.handle()),
                std::slice::from_ref(&dependency),
            );
        }
        Ok(())
    }

    /// End recording and submit to the queue matching the pool's usage.
    pub fn submit(&mut self) -> Result<()> {
        self.submit_with(SubmitSync::default())
    }

    /// Submit and signal `fence` on completion.
    pub fn submit_with_fence(&mut self, fence: &Fence) -> Result<()> {
        self.submit_with(SubmitSync::new().fence(fence))
    }

    /// Submit with explicit semaphore waits and signals.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit_with(&mut self, sync: SubmitSync) -> Result<()> {
        if !self.state.can_submit() {
            return Err(GpuError::InvalidState(format!(
                "cannot submit a command buffer that is {:?}; reset it first",
                self.state
            )));
        }
        if self.render_scope.is_some() {
            return Err(GpuError::InvalidState(
                "a rendering scope is still open".to_string(),
            ));
        }
        // SAFETY: the buffer is recording.
        if let Err(e) = unsafe { self.device().end_command_buffer(self.handle) } {
            self.state = CommandBufferState::Invalid;
            return Err(e.into());
        }
        self.state = CommandBufferState::Executable;

        let command_buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(self.handle)];
        let submit_info = vk::SubmitInfo2::default()
            .wait_semaphore_infos(&sync.waits)
            .command_buffer_infos(&command_buffers)
            .signal_semaphore_infos(&sync.signals);
        let fence = sync.fence.unwrap_or_default();

        let device = Arc::clone(&self.pool.device);
        device.with_queue(self.pool.usage, |queue| {
            // SAFETY: the queue lock is held and every referenced object is alive.
            unsafe { device.handle().queue_submit2(queue, &[submit_info], fence) }?;
            Ok(())
        })?;

        self.state = CommandBufferState::Pending;
        self.in_flight = sync.fence;
        Ok(())
    }

    /// Move a pending buffer to executable once its fence has signaled.
    fn refresh(&mut self) -> Result<()> {
        if self.state != CommandBufferState::Pending {
            return Ok(());
        }
        if let Some(fence) = self.in_flight {
            // SAFETY: the fence handle stays valid while the submission is tracked.
            if unsafe { self.device().get_fence_status(fence) }? {
                self.complete();
            }
        }
        Ok(())
    }

    fn complete(&mut self) {
        self.state = CommandBufferState::Executable;
        self.in_flight = None;
    }

    /// Block until the submission queue is idle.
    pub fn wait_idle(&mut self) -> Result<()> {
        self.pool.device.queue_wait_idle(self.pool.usage)?;
        if self.state == CommandBufferState::Pending {
            self.complete();
        }
        Ok(())
    }

    /// Reset to the initial state and begin recording again.
    pub fn reset(&mut self) -> Result<()> {
        self.refresh()?;
        if !self.state.can_reset() {
            return Err(GpuError::InvalidState(
                "command buffer is still pending; wait for it before resetting".to_string(),
            ));
        }
        // SAFETY: the buffer is not pending and its pool allows individual resets.
        unsafe {
            self.device()
                .reset_command_buffer(self.handle, vk::CommandBufferResetFlags::empty())
        }?;
        self.state = CommandBufferState::Initial;
        self.bound = None;
        self.render_scope = None;
        self.begin()
    }

    /// Bind, dispatch over `global` invocations, submit, wait, then reset.
    ///
    /// With a fence, the fence is reset, then the host spins on its status
    /// until it signals or `timeout` elapses; without one the queue is
    /// waited idle.
    pub fn compute(
        &mut self,
        pipeline: &ComputePipeline,
        bindings: ComputeBindings<'_>,
        global: [u32; 3],
        fence: Option<&Fence>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.bind_pipeline(pipeline)?;
        if let Some(set) = bindings.descriptor_set {
            self.bind_descriptor_set(set)?;
        }
        if let Some(push_constants) = bindings.push_constants {
            self.push_constants(push_constants)?;
        }
        self.dispatch(global)?;

        match fence {
            Some(fence) => {
                // A fence left signaled by an earlier call must not satisfy this wait.
                fence.reset()?;
                self.submit_with_fence(fence)?;
                let start = Instant::now();
                while !fence.signaled()? {
                    if timeout.is_some_and(|t| start.elapsed() >= t) {
                        return Err(GpuError::Timeout);
                    }
                    std::thread::yield_now();
                }
                self.complete();
            }
            None => {
                self.submit()?;
                self.wait_idle()?;
            }
        }
        self.reset()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.state == CommandBufferState::Pending {
            if let Err(e) = self.pool.device.queue_wait_idle(self.pool.usage) {
                warn!("Failed to wait for pending command buffer: {e}");
            }
        }
        // SAFETY: the buffer is no longer pending.
        unsafe {
            self.device()
                .free_command_buffers(self.pool.handle, &[self.handle]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_count_rounds_up() {
        assert_eq!(workgroup_count([16, 1, 1], [16, 1, 1]), [1, 1, 1]);
        assert_eq!(workgroup_count([17, 5, 1], [16, 4, 1]), [2, 2, 1]);
        assert_eq!(workgroup_count([100, 100, 3], [8, 8, 2]), [13, 13, 2]);
        assert_eq!(workgroup_count([0, 1, 1], [64, 1, 1]), [0, 1, 1]);
    }

    #[test]
    fn zero_byte_copy_is_skipped() {
        assert!(copy_region(4, 4, 0, 100, 100).unwrap().is_none());
    }

    #[test]
    fn copy_region_inside_both_buffers() {
        let region = copy_region(64, 32, 16, 48, 16).unwrap().unwrap();
        assert_eq!(region.src_offset, 48);
        assert_eq!(region.dst_offset, 16);
        assert_eq!(region.size, 16);
    }

    #[test]
    fn copy_region_out_of_bounds_is_rejected() {
        assert!(matches!(
            copy_region(64, 64, 32, 40, 0),
            Err(GpuError::OutOfBounds(_))
        ));
        assert!(matches!(
            copy_region(64, 16, 32, 0, 0),
            Err(GpuError::OutOfBounds(_))
        ));
        assert!(matches!(
            copy_region(64, 64, u64::MAX, 1, 0),
            Err(GpuError::OutOfBounds(_))
        ));
    }

    #[test]
    fn known_transitions_have_scopes() {
        let scope = transition_scope(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        )
        .unwrap();
        assert_eq!(scope.dst_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(scope.src_stage, vk::PipelineStageFlags2::TOP_OF_PIPE);

        let scope = transition_scope(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        )
        .unwrap();
        assert_eq!(scope.src_access, vk::AccessFlags2::COLOR_ATTACHMENT_WRITE);
    }

    #[test]
    fn unknown_transition_has_no_scope() {
        assert!(transition_scope(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        )
        .is_none());
    }

    #[test]
    fn state_table() {
        use CommandBufferState as S;
        assert!(S::Recording.can_record());
        assert!(!S::Executable.can_record());
        assert!(!S::Pending.can_record());

        assert!(S::Recording.can_submit());
        assert!(!S::Executable.can_submit());
        assert!(!S::Pending.can_submit());
        assert!(!S::Initial.can_submit());

        assert!(!S::Pending.can_reset());
        for state in [S::Initial, S::Recording, S::Executable, S::Invalid] {
            assert!(state.can_reset(), "{state:?}");
        }
    }
}
