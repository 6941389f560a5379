//! Physical adapter selection, logical device and queue management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{to_cstring, Instance, InstanceShared};
use crate::memory::create_allocator;
use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;
use std::ffi::c_char;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

/// The capability a queue, command pool or command buffer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueUsage {
    Graphics,
    Compute,
    Transfer,
}

impl QueueUsage {
    /// All usages, in assignment order.
    pub const ALL: [Self; 3] = [Self::Graphics, Self::Compute, Self::Transfer];

    /// The queue flag that advertises this capability.
    pub fn queue_flags(self) -> vk::QueueFlags {
        match self {
            Self::Graphics => vk::QueueFlags::GRAPHICS,
            Self::Compute => vk::QueueFlags::COMPUTE,
            Self::Transfer => vk::QueueFlags::TRANSFER,
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Graphics => 0,
            Self::Compute => 1,
            Self::Transfer => 2,
        }
    }
}

impl fmt::Display for QueueUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graphics => f.write_str("graphics"),
            Self::Compute => f.write_str("compute"),
            Self::Transfer => f.write_str("transfer"),
        }
    }
}

/// Whether a queue family can serve the given usage.
///
/// Graphics and compute families implicitly support transfer operations even
/// when they do not advertise the transfer bit.
pub fn family_supports(family: &vk::QueueFamilyProperties, usage: QueueUsage) -> bool {
    if family.queue_count == 0 {
        return false;
    }
    let flags = family.queue_flags;
    match usage {
        QueueUsage::Transfer => flags.intersects(
            vk::QueueFlags::TRANSFER | vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
        ),
        other => flags.contains(other.queue_flags()),
    }
}

/// One queue within a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSlot {
    pub family: u32,
    pub index: u32,
}

/// Which family (and queue within it) serves each capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueAssignment {
    slots: [Option<QueueSlot>; 3],
}

impl QueueAssignment {
    /// Assign queue families to the graphics, compute and transfer capabilities.
    ///
    /// Each capability first takes the first family supporting it that no
    /// other capability claimed yet. Capabilities left over fall back to any
    /// supporting family, sharing it. With `distinct_queues`, a capability
    /// landing on a shared family gets its own queue index when the family
    /// exposes enough queues; otherwise it shares queue 0.
    pub fn assign(families: &[vk::QueueFamilyProperties], distinct_queues: bool) -> Self {
        let mut slots: [Option<QueueSlot>; 3] = [None; 3];
        let mut claimed = vec![false; families.len()];

        for usage in QueueUsage::ALL {
            let fresh = families
                .iter()
                .enumerate()
                .find(|(i, family)| !claimed[*i] && family_supports(family, usage));
            if let Some((i, _)) = fresh {
                claimed[i] = true;
                slots[usage.slot()] = Some(QueueSlot {
                    family: i as u32,
                    index: 0,
                });
            }
        }

        let mut used_per_family = vec![0u32; families.len()];
        for slot in slots.iter().flatten() {
            used_per_family[slot.family as usize] += 1;
        }

        for usage in QueueUsage::ALL {
            if slots[usage.slot()].is_some() {
                continue;
            }
            let Some((i, family)) = families
                .iter()
                .enumerate()
                .find(|(_, family)| family_supports(family, usage))
            else {
                continue;
            };

            let index = if distinct_queues && used_per_family[i] < family.queue_count {
                used_per_family[i]
            } else {
                0
            };
            used_per_family[i] = used_per_family[i].max(index + 1);
            slots[usage.slot()] = Some(QueueSlot {
                family: i as u32,
                index,
            });
        }

        Self { slots }
    }

    /// The slot serving `usage`, if any family supports it.
    pub fn slot(&self, usage: QueueUsage) -> Option<QueueSlot> {
        self.slots[usage.slot()]
    }

    /// Whether a family was found for `usage`.
    pub fn is_assigned(&self, usage: QueueUsage) -> bool {
        self.slot(usage).is_some()
    }

    /// The family index serving `usage`.
    pub fn family(&self, usage: QueueUsage) -> Option<u32> {
        self.slot(usage).map(|s| s.family)
    }

    /// `(family, queue count)` pairs to request at device creation, sorted by family.
    pub fn queue_requests(&self) -> Vec<(u32, u32)> {
        let mut requests: Vec<(u32, u32)> = Vec::new();
        for slot in self.slots.iter().flatten() {
            match requests.iter_mut().find(|(family, _)| *family == slot.family) {
                Some((_, count)) => *count = (*count).max(slot.index + 1),
                None => requests.push((slot.family, slot.index + 1)),
            }
        }
        requests.sort_unstable();
        requests
    }
}

/// Logical device configuration.
#[derive(Clone)]
pub struct DeviceConfig {
    /// Preferred adapter; the first adapter is used when absent or unmatched.
    pub device_id: Option<u32>,
    pub extensions: Vec<String>,
    pub features: vk::PhysicalDeviceFeatures,
    pub synchronization2: bool,
    pub dynamic_rendering: bool,
    pub timeline_semaphore: bool,
    pub distinct_queues: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            extensions: Vec::new(),
            features: vk::PhysicalDeviceFeatures::default(),
            synchronization2: true,
            dynamic_rendering: true,
            timeline_semaphore: true,
            distinct_queues: false,
        }
    }
}

impl DeviceConfig {
    /// Create a new config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefer the adapter with this device id.
    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device_id = Some(device_id);
        self
    }

    /// Enable a device extension.
    pub fn with_extension(mut self, name: impl Into<String>) -> Self {
        self.extensions.push(name.into());
        self
    }

    /// Enable several device extensions.
    pub fn with_extensions<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(names.into_iter().map(Into::into));
        self
    }

    /// Enable the swapchain extension.
    pub fn with_swapchain(self) -> Self {
        self.with_extension(ash::khr::swapchain::NAME.to_string_lossy())
    }

    /// Set the Vulkan 1.0 base features.
    pub fn with_features(mut self, features: vk::PhysicalDeviceFeatures) -> Self {
        self.features = features;
        self
    }

    /// Toggle dynamic rendering (Vulkan 1.3).
    pub fn with_dynamic_rendering(mut self, enable: bool) -> Self {
        self.dynamic_rendering = enable;
        self
    }

    /// Toggle timeline semaphores (Vulkan 1.2).
    pub fn with_timeline_semaphore(mut self, enable: bool) -> Self {
        self.timeline_semaphore = enable;
        self
    }

    /// Request separate queues for capabilities that share a family.
    pub fn with_distinct_queues(mut self, enable: bool) -> Self {
        self.distinct_queues = enable;
        self
    }
}

/// A retrieved queue plus the lock serializing host access to it.
struct DeviceQueue {
    handle: vk::Queue,
    slot: QueueSlot,
    lock: Arc<Mutex<()>>,
}

/// Physical adapter plus logical device and its queues.
pub struct Device {
    instance: Arc<InstanceShared>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    capabilities: GpuCapabilities,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: OnceLock<vk::PhysicalDeviceMemoryProperties>,
    assignment: QueueAssignment,
    queues: [Option<DeviceQueue>; 3],
    allocator: Mutex<Option<Allocator>>,
    synchronization2: bool,
    timeline_semaphore: bool,
    dynamic_rendering: bool,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.device.handle())
            .field("name", &self.capabilities.name)
            .field("assignment", &self.assignment)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Select an adapter and create the logical device with its queues.
    pub fn new(instance: &Instance, config: &DeviceConfig) -> Result<Arc<Self>> {
        let shared = instance.shared()?;
        let vk_instance = shared.instance();

        let physical_device = select_physical_device(vk_instance, config.device_id)?;

        // SAFETY: physical_device was just enumerated from this instance.
        let (capabilities, properties, families) = unsafe {
            (
                GpuCapabilities::query(vk_instance, physical_device),
                vk_instance.get_physical_device_properties(physical_device),
                vk_instance.get_physical_device_queue_family_properties(physical_device),
            )
        };
        info!("Selected GPU: {capabilities}");

        if (config.synchronization2 || config.dynamic_rendering)
            && !capabilities.supports_api_version(vk::API_VERSION_1_3)
        {
            error!("{} does not support Vulkan 1.3", capabilities.name);
            return Err(GpuError::NoSuitableDevice);
        }

        for extension in &config.extensions {
            if !capabilities.supports_extension(extension) {
                warn!("Device extension {extension} not reported by {}", capabilities.name);
            }
        }

        let assignment = QueueAssignment::assign(&families, config.distinct_queues);
        for usage in QueueUsage::ALL {
            match assignment.slot(usage) {
                Some(slot) => debug!("{usage} queue: family {} index {}", slot.family, slot.index),
                None => warn!("No queue family supports {usage}"),
            }
        }

        let requests = assignment.queue_requests();
        if requests.is_empty() {
            return Err(GpuError::NoSuitableDevice);
        }
        let priorities: Vec<Vec<f32>> = requests
            .iter()
            .map(|&(_, count)| vec![1.0_f32; count as usize])
            .collect();
        let queue_create_infos: Vec<vk::DeviceQueueCreateInfo<'_>> = requests
            .iter()
            .zip(&priorities)
            .map(|(&(family, _), priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(priorities)
            })
            .collect();

        let extension_names = config
            .extensions
            .iter()
            .map(|e| to_cstring(e))
            .collect::<Result<Vec<_>>>()?;
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|e| e.as_ptr()).collect();

        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
            .dynamic_rendering(config.dynamic_rendering)
            .synchronization2(config.synchronization2);
        let mut vulkan_1_2_features =
            vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(config.timeline_semaphore);

        let mut features2 = vk::PhysicalDeviceFeatures2::default().features(config.features);
        if capabilities.supports_api_version(vk::API_VERSION_1_2) {
            features2 = features2.push_next(&mut vulkan_1_2_features);
        }
        if capabilities.supports_api_version(vk::API_VERSION_1_3) {
            features2 = features2.push_next(&mut vulkan_1_3_features);
        }

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut features2);

        // SAFETY: every pointer in the create info references locals alive for the call.
        let device = unsafe { vk_instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| {
                error!("Logical device creation failed: {e}");
                GpuError::from(e)
            })?;

        let mut locks: Vec<(QueueSlot, Arc<Mutex<()>>)> = Vec::new();
        let queues = QueueUsage::ALL.map(|usage| {
            assignment.slot(usage).map(|slot| {
                let lock = match locks.iter().find(|(s, _)| *s == slot) {
                    Some((_, lock)) => Arc::clone(lock),
                    None => {
                        let lock = Arc::new(Mutex::new(()));
                        locks.push((slot, Arc::clone(&lock)));
                        lock
                    }
                };
                DeviceQueue {
                    // SAFETY: the slot's family and index were requested above.
                    handle: unsafe { device.get_device_queue(slot.family, slot.index) },
                    slot,
                    lock,
                }
            })
        });

        // SAFETY: the device was created from this instance and physical device.
        let allocator = match unsafe { create_allocator(vk_instance, &device, physical_device) } {
            Ok(allocator) => allocator,
            Err(e) => {
                // SAFETY: nothing has been created from the device yet.
                unsafe { device.destroy_device(None) };
                return Err(e);
            }
        };

        Ok(Arc::new(Self {
            physical_device,
            device,
            capabilities,
            properties,
            memory_properties: OnceLock::new(),
            assignment,
            queues,
            allocator: Mutex::new(Some(allocator)),
            synchronization2: config.synchronization2,
            timeline_semaphore: config.timeline_semaphore,
            dynamic_rendering: config.dynamic_rendering,
            instance: shared,
        }))
    }

    /// Get the Vulkan device function table.
    pub fn handle(&self) -> &ash::Device {
        &self.device
    }

    /// Get the instance function table the device was created from.
    pub fn instance(&self) -> &ash::Instance {
        self.instance.instance()
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Adapter properties queried at construction.
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    /// Adapter limits.
    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.properties.limits
    }

    /// Memory properties, queried on first use and cached.
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.memory_properties.get_or_init(|| {
            // SAFETY: the physical device belongs to the live instance.
            unsafe {
                self.instance
                    .instance()
                    .get_physical_device_memory_properties(self.physical_device)
            }
        })
    }

    /// The queue-family assignment.
    pub fn queue_assignment(&self) -> &QueueAssignment {
        &self.assignment
    }

    /// The queue serving `usage`.
    pub fn queue(&self, usage: QueueUsage) -> Option<vk::Queue> {
        self.queues[usage.slot()].as_ref().map(|q| q.handle)
    }

    /// The family index serving `usage`.
    pub fn queue_family(&self, usage: QueueUsage) -> Option<u32> {
        self.queues[usage.slot()].as_ref().map(|q| q.slot.family)
    }

    /// Whether a queue was assigned to `usage`.
    pub fn has_queue(&self, usage: QueueUsage) -> bool {
        self.queues[usage.slot()].is_some()
    }

    /// Whether synchronization2 was enabled.
    pub fn synchronization2_enabled(&self) -> bool {
        self.synchronization2
    }

    /// Whether timeline semaphores were enabled.
    pub fn timeline_semaphores_enabled(&self) -> bool {
        self.timeline_semaphore
    }

    /// Whether dynamic rendering was enabled.
    pub fn dynamic_rendering_enabled(&self) -> bool {
        self.dynamic_rendering
    }

    pub(crate) fn allocator(&self) -> &Mutex<Option<Allocator>> {
        &self.allocator
    }

    /// Run `f` with exclusive host access to the queue serving `usage`.
    pub(crate) fn with_queue<R>(
        &self,
        usage: QueueUsage,
        f: impl FnOnce(vk::Queue) -> Result<R>,
    ) -> Result<R> {
        let queue = self.queues[usage.slot()].as_ref().ok_or_else(|| {
            GpuError::InvalidConfig(format!("device has no {usage} queue"))
        })?;
        let _guard = queue.lock.lock();
        f(queue.handle)
    }

    /// Block until the queue serving `usage` is idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn queue_wait_idle(&self, usage: QueueUsage) -> Result<()> {
        self.with_queue(usage, |queue| {
            // SAFETY: the queue lock is held.
            unsafe { self.device.queue_wait_idle(queue) }?;
            Ok(())
        })
    }

    /// Wait for device to be idle.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn wait_idle(&self) -> Result<()> {
        // SAFETY: the device is alive for &self.
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        debug!("Destroying device {:?}", self.device.handle());
        // SAFETY: every child object holds an Arc<Device>, so none is alive.
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {e}");
            }

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            drop(self.allocator.lock().take());

            self.device.destroy_device(None);
        }
    }
}

/// Log every adapter the instance can see.
pub fn log_available_devices(instance: &Instance) -> Result<()> {
    let vk_instance = instance.get()?;
    // SAFETY: the instance is live.
    let devices = unsafe { vk_instance.enumerate_physical_devices() }?;
    info!("{} physical devices available", devices.len());
    for device in devices {
        // SAFETY: device was enumerated from this instance.
        let caps = unsafe { GpuCapabilities::query(vk_instance, device) };
        info!("  {caps}");
    }
    Ok(())
}

/// Pick the adapter whose device id matches, else the first one.
fn select_physical_device(
    instance: &ash::Instance,
    device_id: Option<u32>,
) -> Result<vk::PhysicalDevice> {
    // SAFETY: the instance is live.
    let devices = unsafe { instance.enumerate_physical_devices() }?;
    let first = *devices.first().ok_or(GpuError::NoSuitableDevice)?;

    let Some(wanted) = device_id else {
        return Ok(first);
    };

    let matched = devices.iter().copied().find(|&device| {
        // SAFETY: device was enumerated from this instance.
        let properties = unsafe { instance.get_physical_device_properties(device) };
        properties.device_id == wanted
    });

    Ok(matched.unwrap_or_else(|| {
        warn!("No adapter with device id {wanted:#06x}; using the first adapter");
        first
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags, count: u32) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn single_universal_family_serves_everything() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
            1,
        )];
        let assignment = QueueAssignment::assign(&families, false);

        for usage in QueueUsage::ALL {
            assert!(assignment.is_assigned(usage));
            assert_eq!(assignment.family(usage), Some(0));
        }
        assert_eq!(assignment.queue_requests(), vec![(0, 1)]);
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(
                vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
                16,
            ),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER, 8),
            family(vk::QueueFlags::TRANSFER, 2),
        ];
        let assignment = QueueAssignment::assign(&families, false);

        assert_eq!(assignment.family(QueueUsage::Graphics), Some(0));
        assert_eq!(assignment.family(QueueUsage::Compute), Some(1));
        assert_eq!(assignment.family(QueueUsage::Transfer), Some(2));
        assert_eq!(assignment.queue_requests(), vec![(0, 1), (1, 1), (2, 1)]);
    }

    #[test]
    fn transfer_falls_back_to_graphics_family_without_transfer_bit() {
        let families = [family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE, 1)];
        let assignment = QueueAssignment::assign(&families, false);
        assert_eq!(assignment.family(QueueUsage::Transfer), Some(0));
    }

    #[test]
    fn empty_families_are_skipped() {
        let families = [
            family(vk::QueueFlags::COMPUTE, 0),
            family(vk::QueueFlags::COMPUTE, 1),
        ];
        let assignment = QueueAssignment::assign(&families, false);
        assert!(!assignment.is_assigned(QueueUsage::Graphics));
        assert_eq!(assignment.family(QueueUsage::Compute), Some(1));
        assert_eq!(assignment.family(QueueUsage::Transfer), Some(1));
    }

    #[test]
    fn distinct_queues_split_a_shared_family() {
        let universal =
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER;

        let assignment = QueueAssignment::assign(&[family(universal, 4)], true);
        assert_eq!(
            assignment.slot(QueueUsage::Graphics),
            Some(QueueSlot { family: 0, index: 0 })
        );
        assert_eq!(
            assignment.slot(QueueUsage::Compute),
            Some(QueueSlot { family: 0, index: 1 })
        );
        assert_eq!(
            assignment.slot(QueueUsage::Transfer),
            Some(QueueSlot { family: 0, index: 2 })
        );
        assert_eq!(assignment.queue_requests(), vec![(0, 3)]);

        // Not enough queues: the extra capability shares queue 0.
        let assignment = QueueAssignment::assign(&[family(universal, 2)], true);
        assert_eq!(assignment.slot(QueueUsage::Compute).map(|s| s.index), Some(1));
        assert_eq!(assignment.slot(QueueUsage::Transfer).map(|s| s.index), Some(0));
        assert_eq!(assignment.queue_requests(), vec![(0, 2)]);
    }
}
