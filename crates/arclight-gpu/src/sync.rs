//! Synchronization primitives.
//!
//! Fences signal the host, semaphores order work between queue submissions,
//! and events split a dependency across two points of one queue. Barrier
//! values describe memory dependencies and are recorded through
//! synchronization2.

use crate::buffer::Buffer;
use crate::device::Device;
use crate::error::{map_wait_result, GpuError, Result};
use crate::image::Image;
use ash::vk;
use bytemuck::Pod;
use std::sync::Arc;
use std::time::Duration;

/// Convert an optional timeout to nanoseconds; `None` waits indefinitely.
pub fn timeout_ns(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
}

/// A device-to-host signal.
pub struct Fence {
    device: Arc<Device>,
    handle: vk::Fence,
}

impl Fence {
    /// Create a fence, optionally already signaled.
    pub fn new(device: &Arc<Device>, signaled: bool) -> Result<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        // SAFETY: the device is alive.
        let handle = unsafe { device.handle().create_fence(&create_info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    pub fn handle(&self) -> vk::Fence {
        self.handle
    }

    /// Whether the fence is currently signaled.
    pub fn signaled(&self) -> Result<bool> {
        // SAFETY: the fence is alive.
        Ok(unsafe { self.device.handle().get_fence_status(self.handle) }?)
    }

    /// Block until the fence signals.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        // SAFETY: the fence is alive.
        unsafe {
            self.device
                .handle()
                .wait_for_fences(&[self.handle], true, timeout_ns(timeout))
        }
        .map_err(map_wait_result)
    }

    /// Return the fence to the unsignaled state.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn reset(&self) -> Result<()> {
        // SAFETY: the fence is alive and not part of a pending submission.
        unsafe { self.device.handle().reset_fences(&[self.handle]) }?;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        // SAFETY: the fence is owned exclusively.
        unsafe { self.device.handle().destroy_fence(self.handle, None) };
    }
}

/// Whether a semaphore is a binary signal or a monotonic counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemaphoreKind {
    Binary,
    Timeline,
}

/// A device-side signal between queue submissions.
pub struct Semaphore {
    device: Arc<Device>,
    handle: vk::Semaphore,
    kind: SemaphoreKind,
}

impl Semaphore {
    /// Create a binary semaphore.
    pub fn binary(device: &Arc<Device>) -> Result<Self> {
        let create_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: the device is alive.
        let handle = unsafe { device.handle().create_semaphore(&create_info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            kind: SemaphoreKind::Binary,
        })
    }

    /// Create a timeline semaphore starting at `initial_value`.
    pub fn timeline(device: &Arc<Device>, initial_value: u64) -> Result<Self> {
        if !device.timeline_semaphores_enabled() {
            return Err(GpuError::InvalidConfig(
                "timeline semaphores are not enabled on this device".to_string(),
            ));
        }
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        // SAFETY: the device is alive and has timeline semaphores enabled.
        let handle = unsafe { device.handle().create_semaphore(&create_info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            kind: SemaphoreKind::Timeline,
        })
    }

    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }

    pub fn kind(&self) -> SemaphoreKind {
        self.kind
    }

    fn require_timeline(&self, operation: &str) -> Result<()> {
        if self.kind == SemaphoreKind::Timeline {
            Ok(())
        } else {
            Err(GpuError::InvalidState(format!(
                "{operation} requires a timeline semaphore"
            )))
        }
    }

    /// Current counter value of a timeline semaphore.
    pub fn counter(&self) -> Result<u64> {
        self.require_timeline("counter")?;
        // SAFETY: the semaphore is alive.
        Ok(unsafe { self.device.handle().get_semaphore_counter_value(self.handle) }?)
    }

    /// Advance a timeline semaphore from the host. The value must exceed the
    /// current counter.
    pub fn signal(&self, value: u64) -> Result<()> {
        let current = self.counter()?;
        if value <= current {
            return Err(GpuError::InvalidState(format!(
                "timeline value {value} does not advance past {current}"
            )));
        }
        let signal_info = vk::SemaphoreSignalInfo::default()
            .semaphore(self.handle)
            .value(value);
        // SAFETY: the semaphore is alive and the value is monotonic.
        unsafe { self.device.handle().signal_semaphore(&signal_info) }?;
        Ok(())
    }

    /// Block until a timeline semaphore reaches `value`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait(&self, value: u64, timeout: Option<Duration>) -> Result<()> {
        self.require_timeline("wait")?;
        let semaphores = [self.handle];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        // SAFETY: the semaphore is alive.
        unsafe {
            self.device
                .handle()
                .wait_semaphores(&wait_info, timeout_ns(timeout))
        }
        .map_err(map_wait_result)
    }

    /// Submission entry waiting on or signaling this semaphore at `stages`.
    /// `value` is ignored for binary semaphores.
    pub fn submit_info(
        &self,
        value: u64,
        stages: vk::PipelineStageFlags2,
    ) -> vk::SemaphoreSubmitInfo<'static> {
        let value = match self.kind {
            SemaphoreKind::Binary => 0,
            SemaphoreKind::Timeline => value,
        };
        vk::SemaphoreSubmitInfo::default()
            .semaphore(self.handle)
            .value(value)
            .stage_mask(stages)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: the semaphore is owned exclusively.
        unsafe { self.device.handle().destroy_semaphore(self.handle, None) };
    }
}

/// A global memory dependency.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryBarrier {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl MemoryBarrier {
    pub fn new(
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
    ) -> Self {
        Self {
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        }
    }

    /// Compute shader writes made visible to later compute shader reads.
    pub fn compute_to_compute() -> Self {
        Self::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE,
        )
    }

    fn to_vk(self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2::default()
            .src_stage_mask(self.src_stage)
            .src_access_mask(self.src_access)
            .dst_stage_mask(self.dst_stage)
            .dst_access_mask(self.dst_access)
    }
}

/// A dependency on a range of one buffer.
#[derive(Debug, Clone, Copy)]
pub struct BufferMemoryBarrier {
    pub scope: MemoryBarrier,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// `(source family, destination family)` for an ownership transfer.
    pub queue_transfer: Option<(u32, u32)>,
}

impl BufferMemoryBarrier {
    /// Barrier covering the whole buffer.
    pub fn new<T: Pod>(buffer: &Buffer<T>, scope: MemoryBarrier) -> Self {
        Self {
            scope,
            buffer: buffer.handle(),
            offset: 0,
            size: vk::WHOLE_SIZE,
            queue_transfer: None,
        }
    }

    /// Restrict the barrier to a byte range.
    pub fn with_range(mut self, offset: vk::DeviceSize, size: vk::DeviceSize) -> Self {
        self.offset = offset;
        self.size = size;
        self
    }

    /// Transfer ownership between queue families.
    pub fn with_queue_transfer(mut self, src_family: u32, dst_family: u32) -> Self {
        self.queue_transfer = Some((src_family, dst_family));
        self
    }

    fn to_vk(self) -> vk::BufferMemoryBarrier2<'static> {
        let (src_family, dst_family) = self
            .queue_transfer
            .unwrap_or((vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED));
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(self.scope.src_stage)
            .src_access_mask(self.scope.src_access)
            .dst_stage_mask(self.scope.dst_stage)
            .dst_access_mask(self.scope.dst_access)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .buffer(self.buffer)
            .offset(self.offset)
            .size(self.size)
    }
}

/// A dependency on an image, optionally with a layout transition.
#[derive(Debug, Clone, Copy)]
pub struct ImageMemoryBarrier {
    pub scope: MemoryBarrier,
    pub image: vk::Image,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub range: vk::ImageSubresourceRange,
    pub queue_transfer: Option<(u32, u32)>,
}

impl ImageMemoryBarrier {
    /// Barrier over every mip level of `image`, keeping its current layout.
    pub fn new(image: &Image, scope: MemoryBarrier) -> Self {
        Self {
            scope,
            image: image.handle(),
            old_layout: image.layout(),
            new_layout: image.layout(),
            range: image.full_range(),
            queue_transfer: None,
        }
    }

    /// Barrier over an image owned elsewhere, such as a swapchain image.
    pub fn from_raw(
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        scope: MemoryBarrier,
    ) -> Self {
        Self {
            scope,
            image,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::UNDEFINED,
            range,
            queue_transfer: None,
        }
    }

    pub fn with_layouts(mut self, old_layout: vk::ImageLayout, new_layout: vk::ImageLayout) -> Self {
        self.old_layout = old_layout;
        self.new_layout = new_layout;
        self
    }

    pub fn with_queue_transfer(mut self, src_family: u32, dst_family: u32) -> Self {
        self.queue_transfer = Some((src_family, dst_family));
        self
    }

    fn to_vk(self) -> vk::ImageMemoryBarrier2<'static> {
        let (src_family, dst_family) = self
            .queue_transfer
            .unwrap_or((vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED));
        vk::ImageMemoryBarrier2::default()
            .src_stage_mask(self.scope.src_stage)
            .src_access_mask(self.scope.src_access)
            .dst_stage_mask(self.scope.dst_stage)
            .dst_access_mask(self.scope.dst_access)
            .old_layout(self.old_layout)
            .new_layout(self.new_layout)
            .src_queue_family_index(src_family)
            .dst_queue_family_index(dst_family)
            .image(self.image)
            .subresource_range(self.range)
    }
}

/// Any of the three barrier kinds.
#[derive(Debug, Clone, Copy)]
pub enum Barrier {
    Memory(MemoryBarrier),
    Buffer(BufferMemoryBarrier),
    Image(ImageMemoryBarrier),
}

impl From<MemoryBarrier> for Barrier {
    fn from(barrier: MemoryBarrier) -> Self {
        Self::Memory(barrier)
    }
}

impl From<BufferMemoryBarrier> for Barrier {
    fn from(barrier: BufferMemoryBarrier) -> Self {
        Self::Buffer(barrier)
    }
}

impl From<ImageMemoryBarrier> for Barrier {
    fn from(barrier: ImageMemoryBarrier) -> Self {
        Self::Image(barrier)
    }
}

/// Barriers sorted into the arrays a dependency info points at.
#[derive(Debug, Clone, Default)]
pub struct BarrierBatch {
    memory: Vec<vk::MemoryBarrier2<'static>>,
    buffer: Vec<vk::BufferMemoryBarrier2<'static>>,
    image: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl BarrierBatch {
    pub fn new(barriers: &[Barrier]) -> Self {
        let mut batch = Self::default();
        for &barrier in barriers {
            batch.push(barrier);
        }
        batch
    }

    pub fn push(&mut self, barrier: Barrier) {
        match barrier {
            Barrier::Memory(b) => self.memory.push(b.to_vk()),
            Barrier::Buffer(b) => self.buffer.push(b.to_vk()),
            Barrier::Image(b) => self.image.push(b.to_vk()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.buffer.is_empty() && self.image.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memory.len() + self.buffer.len() + self.image.len()
    }

    pub fn dependency_info(&self) -> vk::DependencyInfo<'_> {
        vk::DependencyInfo::default()
            .memory_barriers(&self.memory)
            .buffer_memory_barriers(&self.buffer)
            .image_memory_barriers(&self.image)
    }
}

/// Split-barrier signal within a queue.
///
/// The event carries the dependency it represents; the same dependency is
/// used when the event is set and when it is waited on.
pub struct Event {
    device: Arc<Device>,
    handle: vk::Event,
    dependency: BarrierBatch,
}

impl Event {
    /// Create an unsignaled event.
    pub fn new(device: &Arc<Device>) -> Result<Self> {
        let create_info = vk::EventCreateInfo::default();
        // SAFETY: the device is alive.
        let handle = unsafe { device.handle().create_event(&create_info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            dependency: BarrierBatch::default(),
        })
    }

    pub fn handle(&self) -> vk::Event {
        self.handle
    }

    /// Replace the dependency applied when the event fires.
    pub fn set_dependency(&mut self, barriers: &[Barrier]) -> &mut Self {
        self.dependency = BarrierBatch::new(barriers);
        self
    }

    pub fn dependency(&self) -> &BarrierBatch {
        &self.dependency
    }

    /// Whether the event is signaled.
    pub fn signaled(&self) -> Result<bool> {
        // SAFETY: the event is alive.
        Ok(unsafe { self.device.handle().get_event_status(self.handle) }?)
    }

    /// Signal the event from the host.
    pub fn set(&self) -> Result<()> {
        // SAFETY: the event is not referenced by in-flight commands.
        unsafe { self.device.handle().set_event(self.handle) }?;
        Ok(())
    }

    /// Unsignal the event from the host.
    pub fn reset(&self) -> Result<()> {
        // SAFETY: the event is not referenced by in-flight commands.
        unsafe { self.device.handle().reset_event(self.handle) }?;
        Ok(())
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        // SAFETY: the event is owned exclusively.
        unsafe { self.device.handle().destroy_event(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_convert_to_nanoseconds() {
        assert_eq!(timeout_ns(None), u64::MAX);
        assert_eq!(timeout_ns(Some(Duration::from_secs(1))), 1_000_000_000);
        assert_eq!(timeout_ns(Some(Duration::MAX)), u64::MAX);
    }

    #[test]
    fn batch_sorts_barriers_by_kind() {
        let scope = MemoryBarrier::compute_to_compute();
        let image = ImageMemoryBarrier::from_raw(
            vk::Image::null(),
            vk::ImageSubresourceRange::default()
                .aspect_mask(vk::ImageAspectFlags::COLOR)
                .level_count(1)
                .layer_count(1),
            scope,
        )
        .with_layouts(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);

        let batch = BarrierBatch::new(&[scope.into(), image.into(), scope.into()]);
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.memory.len(), 2);
        assert_eq!(batch.image.len(), 1);
        assert_eq!(batch.image[0].new_layout, vk::ImageLayout::GENERAL);
        assert_eq!(
            batch.image[0].src_queue_family_index,
            vk::QUEUE_FAMILY_IGNORED
        );

        let info = batch.dependency_info();
        assert_eq!(info.memory_barrier_count, 2);
        assert_eq!(info.buffer_memory_barrier_count, 0);
        assert_eq!(info.image_memory_barrier_count, 1);
    }

    #[test]
    fn queue_transfer_sets_family_indices() {
        let barrier = ImageMemoryBarrier::from_raw(
            vk::Image::null(),
            vk::ImageSubresourceRange::default(),
            MemoryBarrier::default(),
        )
        .with_queue_transfer(0, 2)
        .to_vk();
        assert_eq!(barrier.src_queue_family_index, 0);
        assert_eq!(barrier.dst_queue_family_index, 2);
    }
}
