//! Typed GPU buffers.
//!
//! A [`Buffer<T>`] owns a linear allocation of `len` elements of a plain-old
//! data type. Host-visible buffers are persistently mapped and support
//! element-indexed reads and writes. Out-of-range host accesses are clamped
//! to the buffer and logged, never errors; device-side copies go through
//! `CommandBuffer::copy_buffer`, which does reject out-of-range regions.

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::{DedicatedResource, DeviceMemory};
use ash::vk;
use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// Elements a clamped host copy actually transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CopyPlan {
    pub src_offset: usize,
    pub dst_offset: usize,
    pub count: usize,
}

/// Clamp a copy of `requested` elements so it stays inside both sides.
///
/// Offsets past either end are pulled back to that end, so the planned
/// ranges can always be sliced.
pub(crate) fn plan_copy(
    src_len: usize,
    dst_len: usize,
    requested: usize,
    src_offset: usize,
    dst_offset: usize,
) -> CopyPlan {
    let available = src_len
        .saturating_sub(src_offset)
        .min(dst_len.saturating_sub(dst_offset));
    let count = requested.min(available);
    if count < requested {
        warn!(
            "Copy of {requested} elements (source {src_offset}/{src_len}, \
             destination {dst_offset}/{dst_len}) clamped to {count}"
        );
    }
    CopyPlan {
        src_offset: src_offset.min(src_len),
        dst_offset: dst_offset.min(dst_len),
        count,
    }
}

/// The source elements selected by `plan`.
fn planned_elements<T: Copy>(src: &[T], plan: CopyPlan) -> Vec<T> {
    src.get(plan.src_offset..plan.src_offset + plan.count)
        .map(<[T]>::to_vec)
        .unwrap_or_default()
}

/// Size in bytes of `len` elements of `T`.
fn byte_size<T>(len: usize) -> Result<vk::DeviceSize> {
    len.checked_mul(std::mem::size_of::<T>())
        .and_then(|bytes| vk::DeviceSize::try_from(bytes).ok())
        .ok_or_else(|| {
            GpuError::InvalidConfig(format!(
                "{len} elements of {} overflow the buffer size",
                std::any::type_name::<T>()
            ))
        })
}

/// A typed buffer with its own memory.
pub struct Buffer<T: Pod> {
    device: Arc<Device>,
    handle: vk::Buffer,
    memory: Option<DeviceMemory>,
    len: usize,
    size_bytes: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    _marker: PhantomData<T>,
}

impl<T: Pod> std::fmt::Debug for Buffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("handle", &self.handle)
            .field("len", &self.len)
            .field("size_bytes", &self.size_bytes)
            .field("host_visible", &self.is_host_visible())
            .finish()
    }
}

impl<T: Pod> Buffer<T> {
    /// Create a buffer of `len` elements in memory with `properties`.
    ///
    /// Transfer source and destination usage are always added so the buffer
    /// can take part in device-side copies.
    pub fn new(
        device: &Arc<Device>,
        len: usize,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if len == 0 || std::mem::size_of::<T>() == 0 {
            return Err(GpuError::InvalidConfig(
                "buffers need at least one non-empty element".to_string(),
            ));
        }
        let size_bytes = byte_size::<T>(len)?;
        let usage = usage | vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;

        let create_info = vk::BufferCreateInfo::default()
            .size(size_bytes)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: the create info is fully initialized.
        let handle = unsafe { device.handle().create_buffer(&create_info, None) }?;
        // SAFETY: handle was just created on this device.
        let requirements = unsafe { device.handle().get_buffer_memory_requirements(handle) };

        let memory = match device.allocate_dedicated(
            DedicatedResource::Buffer(handle),
            requirements,
            properties,
            std::any::type_name::<T>(),
        ) {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: the buffer has no memory bound and is unused.
                unsafe { device.handle().destroy_buffer(handle, None) };
                return Err(e);
            }
        };

        Ok(Self {
            device: Arc::clone(device),
            handle,
            memory: Some(memory),
            len,
            size_bytes,
            usage,
            _marker: PhantomData,
        })
    }

    /// Host-visible, coherent storage buffer.
    pub fn host_storage(device: &Arc<Device>, len: usize) -> Result<Self> {
        Self::new(
            device,
            len,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> vk::DeviceSize {
        self.size_bytes
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    /// Property flags of the memory the buffer is bound to.
    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.memory
            .as_ref()
            .map_or(vk::MemoryPropertyFlags::empty(), |m| m.properties)
    }

    pub fn memory_type_index(&self) -> Option<u32> {
        self.memory.as_ref().map(|m| m.memory_type_index)
    }

    /// Whether the host can read and write the buffer directly.
    pub fn is_host_visible(&self) -> bool {
        self.memory.as_ref().is_some_and(DeviceMemory::is_host_visible)
    }

    /// Descriptor info covering the whole buffer.
    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo {
            buffer: self.handle,
            offset: 0,
            range: self.size_bytes,
        }
    }

    fn is_coherent(&self) -> bool {
        self.properties()
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    fn mapped_range(&self) -> vk::MappedMemoryRange<'static> {
        let memory = self
            .memory
            .as_ref()
            // SAFETY: the allocation is alive while the buffer is.
            .map_or(vk::DeviceMemory::null(), |m| unsafe { m.allocation.memory() });
        vk::MappedMemoryRange::default()
            .memory(memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }

    fn invalidate(&self) -> Result<()> {
        if !self.is_coherent() {
            // SAFETY: the memory is mapped by the allocator.
            unsafe {
                self.device
                    .handle()
                    .invalidate_mapped_memory_ranges(&[self.mapped_range()])
            }?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if !self.is_coherent() {
            // SAFETY: the memory is mapped by the allocator.
            unsafe {
                self.device
                    .handle()
                    .flush_mapped_memory_ranges(&[self.mapped_range()])
            }?;
        }
        Ok(())
    }

    fn mapped(&self) -> Result<&[T]> {
        let memory = self.memory.as_ref().ok_or(GpuError::NotHostVisible)?;
        if !memory.is_host_visible() {
            return Err(GpuError::NotHostVisible);
        }
        let bytes = memory
            .allocation
            .mapped_slice()
            .ok_or(GpuError::NotHostVisible)?;
        let bytes = bytes
            .get(..self.size_bytes as usize)
            .ok_or_else(|| GpuError::InvalidState("mapping smaller than buffer".to_string()))?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|e| GpuError::InvalidState(format!("mapped memory not castable: {e}")))
    }

    fn mapped_mut(&mut self) -> Result<&mut [T]> {
        let size = self.size_bytes as usize;
        let memory = self.memory.as_mut().ok_or(GpuError::NotHostVisible)?;
        if !memory.is_host_visible() {
            return Err(GpuError::NotHostVisible);
        }
        let bytes = memory
            .allocation
            .mapped_slice_mut()
            .ok_or(GpuError::NotHostVisible)?;
        let bytes = bytes
            .get_mut(..size)
            .ok_or_else(|| GpuError::InvalidState("mapping smaller than buffer".to_string()))?;
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|e| GpuError::InvalidState(format!("mapped memory not castable: {e}")))
    }

    /// Copy `copied` elements of `src`, starting at `src_offset`, into the
    /// buffer at `dst_offset`. Returns the number of elements written.
    pub fn write(
        &mut self,
        src: &[T],
        copied: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<usize> {
        let plan = plan_copy(src.len(), self.len, copied, src_offset, dst_offset);
        if plan.count > 0 {
            let dst = self.mapped_mut()?;
            dst[plan.dst_offset..plan.dst_offset + plan.count]
                .copy_from_slice(&src[plan.src_offset..plan.src_offset + plan.count]);
            self.flush()?;
        }
        Ok(plan.count)
    }

    /// Write all of `src` at the start of the buffer.
    pub fn write_all(&mut self, src: &[T]) -> Result<usize> {
        self.write(src, src.len(), 0, 0)
    }

    /// Host copy from another host-visible buffer.
    pub fn write_from_buffer(
        &mut self,
        src: &Buffer<T>,
        copied: usize,
        src_offset: usize,
        dst_offset: usize,
    ) -> Result<usize> {
        src.invalidate()?;
        let source = src.mapped()?;
        self.write(source, copied, src_offset, dst_offset)
    }

    /// Read `count` elements starting at `src_offset`; a count of zero reads
    /// to the end of the buffer.
    pub fn read(&self, count: usize, src_offset: usize) -> Result<Vec<T>> {
        let requested = if count == 0 {
            self.len.saturating_sub(src_offset)
        } else {
            count
        };
        let plan = plan_copy(self.len, requested, requested, src_offset, 0);
        self.invalidate()?;
        let src = self.mapped()?;
        Ok(planned_elements(src, plan))
    }

    /// The whole buffer.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.read(0, 0)
    }

    /// Element at `index`, or `None` (with a warning) past the end.
    pub fn get(&self, index: usize) -> Result<Option<T>> {
        Ok(self.read(1, index)?.first().copied())
    }

    /// Overwrite the element at `index`; ignored with a warning past the end.
    pub fn set(&mut self, index: usize, value: T) -> Result<()> {
        self.write(std::slice::from_ref(&value), 1, 0, index)?;
        Ok(())
    }

    /// Fill `count` elements from `offset` with `value`; a count of zero
    /// fills to the end of the buffer.
    pub fn set_all(&mut self, value: T, offset: usize, count: usize) -> Result<usize> {
        let requested = if count == 0 {
            self.len.saturating_sub(offset)
        } else {
            count
        };
        let plan = plan_copy(requested, self.len, requested, 0, offset);
        if plan.count > 0 {
            let dst = self.mapped_mut()?;
            dst[plan.dst_offset..plan.dst_offset + plan.count].fill(value);
            self.flush()?;
        }
        Ok(plan.count)
    }
}

impl<T: Pod> Drop for Buffer<T> {
    fn drop(&mut self) {
        // SAFETY: the buffer is owned exclusively; descriptor sets referring
        // to it must not be in use once it drops.
        unsafe { self.device.handle().destroy_buffer(self.handle, None) };
        if let Some(memory) = self.memory.take() {
            self.device.free_allocation(memory.allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_range_copies_are_untouched() {
        assert_eq!(
            plan_copy(4, 4, 4, 0, 0),
            CopyPlan {
                src_offset: 0,
                dst_offset: 0,
                count: 4
            }
        );
        assert_eq!(plan_copy(8, 16, 3, 5, 10).count, 3);
    }

    #[test]
    fn write_past_end_is_clamped() {
        // Six source bytes aimed at offset 2 of a four byte buffer.
        let plan = plan_copy(6, 4, 6, 0, 2);
        assert_eq!(plan.count, 2);
        assert_eq!(plan.dst_offset, 2);
    }

    #[test]
    fn short_source_limits_the_copy() {
        assert_eq!(plan_copy(3, 10, 8, 1, 0).count, 2);
    }

    #[test]
    fn offsets_beyond_either_end_copy_nothing() {
        assert_eq!(plan_copy(4, 4, 1, 0, 4).count, 0);
        assert_eq!(plan_copy(4, 4, 2, 9, 0).count, 0);
    }

    #[test]
    fn byte_size_rejects_overflow() {
        assert_eq!(byte_size::<u32>(16).unwrap(), 64);
        assert!(matches!(
            byte_size::<[u64; 4]>(usize::MAX / 8),
            Err(GpuError::InvalidConfig(_))
        ));
    }

    #[test]
    fn offsets_past_the_end_are_pulled_back() {
        let plan = plan_copy(4, 1, 1, 5, 0);
        assert_eq!(plan.count, 0);
        assert_eq!(plan.src_offset, 4);
        let plan = plan_copy(4, 4, 3, 0, usize::MAX);
        assert_eq!(plan.dst_offset, 4);
    }

    #[test]
    fn reading_past_the_end_yields_nothing() {
        let mapped = [10_u32, 11, 12, 13];
        // What `get(5)` on a four element buffer plans.
        assert!(planned_elements(&mapped, plan_copy(4, 1, 1, 5, 0)).is_empty());
        // `read(3, 2)` is cut short at the end.
        assert_eq!(planned_elements(&mapped, plan_copy(4, 3, 3, 2, 0)), [12, 13]);
        assert_eq!(planned_elements(&mapped, plan_copy(4, 2, 2, 1, 0)), [11, 12]);
    }
}
