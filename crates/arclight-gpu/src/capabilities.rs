//! Physical device identification and limits.

use ash::vk;
use std::collections::BTreeSet;
use std::fmt;

/// Hardware vendor, keyed by PCI vendor id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Arm,
    Qualcomm,
    Unknown(u32),
}

impl From<u32> for GpuVendor {
    fn from(pci_id: u32) -> Self {
        match pci_id {
            0x10DE => Self::Nvidia,
            0x1002 | 0x1022 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            0x13B5 => Self::Arm,
            0x5143 => Self::Qualcomm,
            unknown => Self::Unknown(unknown),
        }
    }
}

/// Compute dispatch limits reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComputeLimits {
    pub workgroup_size: [u32; 3],
    pub workgroup_invocations: u32,
    pub workgroup_count: [u32; 3],
}

impl ComputeLimits {
    /// Whether a workgroup of `size` is non-empty and within every limit.
    pub fn fits(&self, size: [u32; 3]) -> bool {
        let per_axis = size
            .iter()
            .zip(self.workgroup_size)
            .all(|(&s, max)| (1..=max).contains(&s));
        let total = size.iter().map(|&s| u64::from(s)).product::<u64>();
        per_axis && total <= u64::from(self.workgroup_invocations)
    }
}

/// What one physical adapter is and what it can do.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    /// Vendor-specific id, compared against [`crate::DeviceConfig::device_id`].
    pub device_id: u32,
    pub name: String,
    pub kind: vk::PhysicalDeviceType,
    pub api_version: u32,
    pub driver_version: u32,
    /// Sum of all device-local heaps.
    pub local_memory_bytes: u64,
    pub compute: ComputeLimits,
    pub max_push_constants_size: u32,
    pub max_bound_descriptor_sets: u32,
    pub extensions: BTreeSet<String>,
}

impl GpuCapabilities {
    /// # Safety
    /// `physical_device` must have been enumerated from `instance`.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        // SAFETY: guaranteed by the caller.
        let (properties, memory, extensions) = unsafe {
            (
                instance.get_physical_device_properties(physical_device),
                instance.get_physical_device_memory_properties(physical_device),
                instance
                    .enumerate_device_extension_properties(physical_device)
                    .unwrap_or_default(),
            )
        };
        let extensions = extensions
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .map(|name| name.to_string_lossy().into_owned())
            .collect();
        Self::from_properties(&properties, &memory, extensions)
    }

    pub fn from_properties(
        properties: &vk::PhysicalDeviceProperties,
        memory: &vk::PhysicalDeviceMemoryProperties,
        extensions: BTreeSet<String>,
    ) -> Self {
        let heaps = &memory.memory_heaps[..memory.memory_heap_count as usize];
        let local_memory_bytes = heaps
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .fold(0_u64, |total, heap| total.saturating_add(heap.size));

        let limits = &properties.limits;
        Self {
            vendor: GpuVendor::from(properties.vendor_id),
            device_id: properties.device_id,
            name: properties.device_name_as_c_str().map_or_else(
                |_| String::from("unnamed device"),
                |name| name.to_string_lossy().into_owned(),
            ),
            kind: properties.device_type,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            local_memory_bytes,
            compute: ComputeLimits {
                workgroup_size: limits.max_compute_work_group_size,
                workgroup_invocations: limits.max_compute_work_group_invocations,
                workgroup_count: limits.max_compute_work_group_count,
            },
            max_push_constants_size: limits.max_push_constants_size,
            max_bound_descriptor_sets: limits.max_bound_descriptor_sets,
            extensions,
        }
    }

    /// Whether the adapter reports at least `required`; patch levels are ignored.
    pub fn supports_api_version(&self, required: u32) -> bool {
        let major_minor = |v: u32| (vk::api_version_major(v), vk::api_version_minor(v));
        major_minor(self.api_version) >= major_minor(required)
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.contains(name)
    }

    pub fn fits_workgroup(&self, size: [u32; 3]) -> bool {
        self.compute.fits(size)
    }
}

impl fmt::Display for GpuCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:?} {:?}, device {:#06x}] Vulkan {}.{}.{}, {} MiB local",
            self.name,
            self.vendor,
            self.kind,
            self.device_id,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.local_memory_bytes >> 20,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(workgroup_size: [u32; 3], invocations: u32) -> GpuCapabilities {
        let mut properties = vk::PhysicalDeviceProperties {
            api_version: vk::make_api_version(0, 1, 3, 250),
            vendor_id: 0x10DE,
            ..Default::default()
        };
        properties.limits.max_compute_work_group_size = workgroup_size;
        properties.limits.max_compute_work_group_invocations = invocations;

        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_heap_count: 2,
            ..Default::default()
        };
        memory.memory_heaps[0] = vk::MemoryHeap {
            size: 8 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };
        memory.memory_heaps[1] = vk::MemoryHeap {
            size: 16 << 30,
            flags: vk::MemoryHeapFlags::empty(),
        };
        // Past the heap count; must be ignored.
        memory.memory_heaps[2] = vk::MemoryHeap {
            size: 1 << 30,
            flags: vk::MemoryHeapFlags::DEVICE_LOCAL,
        };

        GpuCapabilities::from_properties(
            &properties,
            &memory,
            BTreeSet::from(["VK_KHR_swapchain".to_string()]),
        )
    }

    #[test]
    fn vendor_from_pci_id() {
        assert_eq!(GpuVendor::from(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from(0x5143), GpuVendor::Qualcomm);
        assert_eq!(GpuVendor::from(0xBEEF), GpuVendor::Unknown(0xBEEF));
    }

    #[test]
    fn local_memory_counts_only_listed_device_heaps() {
        let caps = adapter([1024, 1024, 64], 1024);
        assert_eq!(caps.local_memory_bytes, 8 << 30);
        assert_eq!(caps.vendor, GpuVendor::Nvidia);
        assert!(caps.to_string().contains("8192 MiB local"));
    }

    #[test]
    fn api_version_ignores_patch() {
        let caps = adapter([1024, 1024, 64], 1024);
        assert!(caps.supports_api_version(vk::API_VERSION_1_3));
        assert!(caps.supports_api_version(vk::API_VERSION_1_2));
        assert!(!caps.supports_api_version(vk::make_api_version(0, 1, 4, 0)));
    }

    #[test]
    fn extension_lookup() {
        let caps = adapter([1, 1, 1], 1);
        assert!(caps.supports_extension("VK_KHR_swapchain"));
        assert!(!caps.supports_extension("VK_KHR_ray_query"));
    }

    #[test]
    fn workgroup_limits() {
        let caps = adapter([1024, 1024, 64], 1024);
        assert!(caps.fits_workgroup([16, 1, 1]));
        assert!(caps.fits_workgroup([32, 32, 1]));
        assert!(!caps.fits_workgroup([64, 32, 1]));
        assert!(!caps.fits_workgroup([1, 1, 128]));
        assert!(!caps.fits_workgroup([0, 1, 1]));
    }
}
