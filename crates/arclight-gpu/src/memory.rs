//! GPU memory management.
//!
//! Every buffer and image owns one dedicated allocation obtained through
//! gpu-allocator. The requested memory-property flags are checked against the
//! adapter's memory types first; a request no memory type can satisfy is an
//! error rather than a silent fallback.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use tracing::warn;

/// Create the allocator owned by a [`Device`].
///
/// # Safety
/// The instance, device, and physical device must be valid and related.
pub(crate) unsafe fn create_allocator(
    instance: &ash::Instance,
    device: &ash::Device,
    physical_device: vk::PhysicalDevice,
) -> Result<Allocator> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device: device.clone(),
        physical_device,
        debug_settings: gpu_allocator::AllocatorDebugSettings {
            log_memory_information: cfg!(debug_assertions),
            log_leaks_on_shutdown: true,
            store_stack_traces: false,
            log_allocations: false,
            log_frees: false,
            log_stack_traces: false,
        },
        buffer_device_address: false,
        allocation_sizes: Default::default(),
    })
    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
}

/// Index of the first memory type allowed by `type_bits` that has all of `properties`.
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    memory_properties
        .memory_types
        .iter()
        .take(memory_properties.memory_type_count as usize)
        .enumerate()
        .find(|(i, memory_type)| {
            type_bits & (1 << i) != 0 && memory_type.property_flags.contains(properties)
        })
        .map(|(i, _)| i as u32)
}

/// The gpu-allocator location matching a set of requested property flags.
pub fn memory_location(properties: vk::MemoryPropertyFlags) -> MemoryLocation {
    if properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
        if properties.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
            MemoryLocation::GpuToCpu
        } else {
            MemoryLocation::CpuToGpu
        }
    } else {
        MemoryLocation::GpuOnly
    }
}

/// The resource a dedicated allocation backs.
#[derive(Debug, Clone, Copy)]
pub(crate) enum DedicatedResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

/// One dedicated device-memory allocation.
pub(crate) struct DeviceMemory {
    pub(crate) allocation: Allocation,
    pub(crate) memory_type_index: u32,
    pub(crate) properties: vk::MemoryPropertyFlags,
}

impl DeviceMemory {
    pub(crate) fn is_host_visible(&self) -> bool {
        self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && self.allocation.mapped_ptr().is_some()
    }
}

impl Device {
    /// First memory type satisfying both `type_bits` and `properties`.
    pub fn find_memory_type(
        &self,
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<u32> {
        find_memory_type_index(self.memory_properties(), type_bits, properties).ok_or(
            GpuError::NoCompatibleMemoryType {
                type_bits,
                properties,
            },
        )
    }

    /// Allocate and bind dedicated memory for `resource`.
    pub(crate) fn allocate_dedicated(
        &self,
        resource: DedicatedResource,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        name: &str,
    ) -> Result<DeviceMemory> {
        let memory_type_index = self.find_memory_type(requirements.memory_type_bits, properties)?;

        let (linear, allocation_scheme) = match resource {
            DedicatedResource::Buffer(buffer) => (true, AllocationScheme::DedicatedBuffer(buffer)),
            DedicatedResource::Image(image) => (false, AllocationScheme::DedicatedImage(image)),
        };

        let allocation = self
            .allocator()
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))?
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: memory_location(properties),
                linear,
                allocation_scheme,
            })
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        // SAFETY: the allocation was made for this resource's requirements.
        let bound = unsafe {
            match resource {
                DedicatedResource::Buffer(buffer) => self.handle().bind_buffer_memory(
                    buffer,
                    allocation.memory(),
                    allocation.offset(),
                ),
                DedicatedResource::Image(image) => self.handle().bind_image_memory(
                    image,
                    allocation.memory(),
                    allocation.offset(),
                ),
            }
        };

        let actual = allocation.memory_properties();
        if let Err(e) = bound {
            self.free_allocation(allocation);
            return Err(e.into());
        }

        Ok(DeviceMemory {
            allocation,
            memory_type_index,
            properties: actual,
        })
    }

    /// Return an allocation to the allocator. Failures are logged.
    pub(crate) fn free_allocation(&self, allocation: Allocation) {
        let mut allocator = self.allocator().lock();
        match allocator.as_mut() {
            Some(allocator) => {
                if let Err(e) = allocator.free(allocation) {
                    warn!("Failed to free allocation: {e}");
                }
            }
            None => warn!("Allocator already shut down; allocation leaked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in props.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        props
    }

    #[test]
    fn first_matching_memory_type_wins() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL
                | vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;

        assert_eq!(find_memory_type_index(&props, 0b111, host), Some(1));
        assert_eq!(find_memory_type_index(&props, 0b101, host), Some(2));
        assert_eq!(
            find_memory_type_index(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
    }

    #[test]
    fn unsatisfiable_request_finds_nothing() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert_eq!(
            find_memory_type_index(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
        // Types beyond memory_type_count are ignored even if the mask allows them.
        assert_eq!(
            find_memory_type_index(&props, u32::MAX, vk::MemoryPropertyFlags::HOST_VISIBLE),
            None
        );
    }

    #[test]
    fn property_flags_map_to_locations() {
        assert_eq!(
            memory_location(vk::MemoryPropertyFlags::DEVICE_LOCAL),
            MemoryLocation::GpuOnly
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            ),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location(
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            ),
            MemoryLocation::GpuToCpu
        );
    }
}
