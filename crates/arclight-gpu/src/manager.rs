//! Instance, device and per-queue command pools bundled together.

use crate::command::CommandPool;
use crate::device::{Device, DeviceConfig, QueueUsage};
use crate::error::Result;
use crate::instance::{ApplicationInfo, Instance, VALIDATION_LAYER};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Process-wide manager installed by [`make_singleton`].
static MANAGER: Mutex<Option<Arc<Manager>>> = Mutex::new(None);

/// Everything needed to bring up a [`Manager`].
#[derive(Clone)]
pub struct ManagerConfig {
    pub application: ApplicationInfo,
    pub layers: Vec<String>,
    pub instance_extensions: Vec<String>,
    pub device: DeviceConfig,
    /// Enable the validation layer and debug messenger when available.
    pub validation: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            application: ApplicationInfo::default(),
            layers: Vec::new(),
            instance_extensions: Vec::new(),
            device: DeviceConfig::default(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl ManagerConfig {
    pub fn new(application: ApplicationInfo) -> Self {
        Self {
            application,
            ..Default::default()
        }
    }

    pub fn with_layers<I, S>(mut self, layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layers.extend(layers.into_iter().map(Into::into));
        self
    }

    pub fn with_instance_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.instance_extensions
            .extend(extensions.into_iter().map(Into::into));
        self
    }

    pub fn with_device_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.device = self.device.with_extensions(extensions);
        self
    }

    pub fn with_device_id(mut self, device_id: u32) -> Self {
        self.device = self.device.with_device_id(device_id);
        self
    }

    pub fn with_device_config(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }
}

/// An instance, its device and one command pool per assigned queue.
pub struct Manager {
    // Field order is drop order: pools, then device, then instance.
    pools: [Option<CommandPool>; 3],
    device: Arc<Device>,
    instance: Instance,
}

impl Manager {
    pub fn new(config: &ManagerConfig) -> Result<Self> {
        let mut instance = Instance::new()?;
        instance
            .set_application_info(config.application.clone())
            .enable_layers(config.layers.iter().cloned())
            .enable_extensions(config.instance_extensions.iter().cloned());

        if config.validation {
            let debug_utils = ash::ext::debug_utils::NAME.to_string_lossy().into_owned();
            if instance.available_layers().iter().any(|l| l == VALIDATION_LAYER) {
                instance
                    .enable_layer(VALIDATION_LAYER)
                    .enable_extension(debug_utils);
            } else {
                warn!("Validation requested but {VALIDATION_LAYER} is not installed");
            }
        }
        instance.create(vk::InstanceCreateFlags::empty())?;

        let device = Device::new(&instance, &config.device)?;

        let mut pools: [Option<CommandPool>; 3] = Default::default();
        for (slot, usage) in pools.iter_mut().zip(QueueUsage::ALL) {
            if device.has_queue(usage) {
                *slot = Some(CommandPool::new(&device, usage)?);
            }
        }
        info!(
            "Manager ready on {} with {} command pools",
            device.capabilities().name,
            pools.iter().flatten().count()
        );

        Ok(Self {
            pools,
            device,
            instance,
        })
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Command pool for the queue serving `usage`.
    pub fn command_pool(&self, usage: QueueUsage) -> Option<&CommandPool> {
        self.pools[usage.slot()].as_ref()
    }
}

/// Create the process-wide manager on first call.
///
/// Later calls return the existing manager and ignore `config`.
///
/// The manager is held in a static and is not destroyed when the process
/// exits. Call [`release_singleton`] once done with it, and drop every
/// returned clone, so the device and instance are torn down while the
/// Vulkan loader is still usable.
pub fn make_singleton(config: &ManagerConfig) -> Result<Arc<Manager>> {
    let mut guard = MANAGER.lock();
    if let Some(manager) = guard.as_ref() {
        return Ok(Arc::clone(manager));
    }
    let manager = Arc::new(Manager::new(config)?);
    *guard = Some(Arc::clone(&manager));
    Ok(manager)
}

/// The process-wide manager, if one has been made.
pub fn singleton() -> Option<Arc<Manager>> {
    MANAGER.lock().clone()
}

/// Drop the process-wide reference. The manager is destroyed once every
/// other clone is gone.
pub fn release_singleton() {
    MANAGER.lock().take();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_collects_names() {
        let config = ManagerConfig::new(ApplicationInfo::new("demo", 1, 2, 3))
            .with_layers(["VK_LAYER_test"])
            .with_instance_extensions(["VK_KHR_surface"])
            .with_device_extensions(["VK_KHR_swapchain"])
            .with_device_id(0x1234)
            .with_validation(false);

        assert_eq!(config.application.version, (1, 2, 3));
        assert_eq!(config.layers, ["VK_LAYER_test"]);
        assert_eq!(config.instance_extensions, ["VK_KHR_surface"]);
        assert_eq!(config.device.extensions, ["VK_KHR_swapchain"]);
        assert_eq!(config.device.device_id, Some(0x1234));
        assert!(!config.validation);
    }

    #[test]
    fn validation_follows_build_profile() {
        assert_eq!(ManagerConfig::default().validation, cfg!(debug_assertions));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn singleton_lives_until_released() {
        let config = ManagerConfig::new(ApplicationInfo::new("singleton", 0, 1, 0));
        let first = make_singleton(&config).unwrap();
        let second = make_singleton(&ManagerConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        drop(second);

        // Still held by the static, not by the last caller.
        let weak = Arc::downgrade(&first);
        drop(first);
        assert!(weak.upgrade().is_some());
        assert!(singleton().is_some());

        release_singleton();
        assert!(singleton().is_none());
        assert!(weak.upgrade().is_none());
    }
}
