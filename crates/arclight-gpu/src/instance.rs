//! Vulkan instance creation.
//!
//! [`Instance`] records the application identity and the enabled layer and
//! extension lists, then materializes the native instance on
//! [`create`](Instance::create). The native handle lives in a shared
//! [`InstanceShared`] so that devices and surfaces created from it keep it
//! alive even if the owning [`Instance`] is recreated or dropped first.

use crate::error::{GpuError, Result};
use ash::vk;
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Standard validation layer name.
pub const VALIDATION_LAYER: &str = "VK_LAYER_KHRONOS_validation";

/// Application identity passed to the driver at instance creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationInfo {
    pub name: String,
    pub version: (u32, u32, u32),
    pub engine_name: String,
    pub engine_version: (u32, u32, u32),
    pub api_version: u32,
}

impl Default for ApplicationInfo {
    fn default() -> Self {
        Self {
            name: "Arclight".to_string(),
            version: (0, 1, 0),
            engine_name: "Arclight".to_string(),
            engine_version: (0, 1, 0),
            api_version: vk::API_VERSION_1_3,
        }
    }
}

impl ApplicationInfo {
    /// Create application info with the given name and version.
    pub fn new(name: impl Into<String>, major: u32, minor: u32, patch: u32) -> Self {
        Self {
            name: name.into(),
            version: (major, minor, patch),
            ..Default::default()
        }
    }
}

/// The live native instance plus everything that must die with it.
pub struct InstanceShared {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
}

impl InstanceShared {
    /// The Vulkan entry point the instance was created from.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    /// The instance function table.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
}

impl Drop for InstanceShared {
    fn drop(&mut self) {
        debug!("Destroying instance {:?}", self.instance.handle());
        // SAFETY: every device and surface created from this instance holds
        // an Arc to it, so none of them is alive at this point.
        unsafe {
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Process-wide Vulkan instance owner.
pub struct Instance {
    entry: ash::Entry,
    application: ApplicationInfo,
    layers: Vec<String>,
    extensions: Vec<String>,
    shared: Option<Arc<InstanceShared>>,
}

impl Instance {
    /// Load the Vulkan loader. No native instance exists until [`create`](Self::create).
    pub fn new() -> Result<Self> {
        // SAFETY: the loaded library stays alive inside the Entry for as long
        // as any function pointer obtained from it is used.
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        Ok(Self {
            entry,
            application: ApplicationInfo::default(),
            layers: Vec::new(),
            extensions: Vec::new(),
            shared: None,
        })
    }

    /// Record the application name and version.
    pub fn init_application(
        &mut self,
        name: impl Into<String>,
        major: u32,
        minor: u32,
        patch: u32,
    ) -> &mut Self {
        self.application.name = name.into();
        self.application.version = (major, minor, patch);
        self
    }

    /// Record the engine name and version.
    pub fn init_engine(
        &mut self,
        name: impl Into<String>,
        major: u32,
        minor: u32,
        patch: u32,
    ) -> &mut Self {
        self.application.engine_name = name.into();
        self.application.engine_version = (major, minor, patch);
        self
    }

    /// Record the requested Vulkan API version (see [`vk::make_api_version`]).
    pub fn init_api_version(&mut self, api_version: u32) -> &mut Self {
        self.application.api_version = api_version;
        self
    }

    /// Replace the whole application identity at once.
    pub fn set_application_info(&mut self, info: ApplicationInfo) -> &mut Self {
        self.application = info;
        self
    }

    /// Enable one instance layer.
    pub fn enable_layer(&mut self, name: impl Into<String>) -> &mut Self {
        self.layers.push(name.into());
        self
    }

    /// Enable several instance layers.
    pub fn enable_layers<I, S>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.layers.extend(names.into_iter().map(Into::into));
        self
    }

    /// Enable one instance extension.
    pub fn enable_extension(&mut self, name: impl Into<String>) -> &mut Self {
        self.extensions.push(name.into());
        self
    }

    /// Enable several instance extensions.
    pub fn enable_extensions<I, S>(&mut self, names: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions.extend(names.into_iter().map(Into::into));
        self
    }

    /// Enable the surface extensions required to present to `display`.
    pub fn enable_surface_extensions(&mut self, display: RawDisplayHandle) -> Result<&mut Self> {
        let required = ash_window::enumerate_required_extensions(display)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        for &ptr in required {
            // SAFETY: ash-window returns pointers to static NUL-terminated names.
            let name = unsafe { CStr::from_ptr(ptr) };
            self.extensions.push(name.to_string_lossy().into_owned());
        }
        Ok(self)
    }

    /// Enabled layer names, in the order they were added.
    pub fn layers(&self) -> &[String] {
        &self.layers
    }

    /// Enabled extension names, in the order they were added.
    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// The recorded application identity.
    pub fn application_info(&self) -> &ApplicationInfo {
        &self.application
    }

    /// Names of all layers the loader reports. Empty (with a warning) on failure.
    pub fn available_layers(&self) -> Vec<String> {
        // SAFETY: the entry is loaded.
        match unsafe { self.entry.enumerate_instance_layer_properties() } {
            Ok(props) => props
                .iter()
                .filter_map(|p| p.layer_name_as_c_str().ok())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                warn!("Failed to enumerate instance layers: {e}");
                Vec::new()
            }
        }
    }

    /// Names of all instance extensions the loader reports. Empty (with a warning) on failure.
    pub fn available_extensions(&self) -> Vec<String> {
        // SAFETY: the entry is loaded.
        match unsafe { self.entry.enumerate_instance_extension_properties(None) } {
            Ok(props) => props
                .iter()
                .filter_map(|p| p.extension_name_as_c_str().ok())
                .map(|name| name.to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                warn!("Failed to enumerate instance extensions: {e}");
                Vec::new()
            }
        }
    }

    /// Log every available instance layer.
    pub fn log_available_layers(&self) {
        let layers = self.available_layers();
        info!("{} instance layers available", layers.len());
        for layer in layers {
            info!("  {layer}");
        }
    }

    /// Log every available instance extension.
    pub fn log_available_extensions(&self) {
        let extensions = self.available_extensions();
        info!("{} instance extensions available", extensions.len());
        for extension in extensions {
            info!("  {extension}");
        }
    }

    /// Create the native instance. Any previously created instance is released first.
    pub fn create(&mut self, flags: vk::InstanceCreateFlags) -> Result<()> {
        self.create_chained(flags, None::<&mut vk::ValidationFeaturesEXT<'_>>)
    }

    /// [`create`](Self::create) with `next` chained onto the create info, for
    /// structures such as `vk::ValidationFeaturesEXT`. Any extension `next`
    /// belongs to must be enabled beforehand.
    pub fn create_with_next<T>(&mut self, flags: vk::InstanceCreateFlags, next: &mut T) -> Result<()>
    where
        T: vk::ExtendsInstanceCreateInfo + ?Sized,
    {
        self.create_chained(flags, Some(next))
    }

    fn create_chained<T>(&mut self, flags: vk::InstanceCreateFlags, next: Option<&mut T>) -> Result<()>
    where
        T: vk::ExtendsInstanceCreateInfo + ?Sized,
    {
        // Devices and surfaces still holding the old handle keep it alive.
        self.shared = None;

        let available_layers = self.available_layers();
        for layer in &self.layers {
            if !available_layers.iter().any(|l| l == layer) {
                warn!("Instance layer {layer} not available");
            }
        }

        let app_name = to_cstring(&self.application.name)?;
        let engine_name = to_cstring(&self.application.engine_name)?;
        let (major, minor, patch) = self.application.version;
        let (engine_major, engine_minor, engine_patch) = self.application.engine_version;

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, major, minor, patch))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, engine_major, engine_minor, engine_patch))
            .api_version(self.application.api_version);

        #[allow(unused_mut)]
        let mut extensions = self.extensions.clone();
        #[allow(unused_mut)]
        let mut flags = flags;

        // Required for MoltenVK on macOS
        #[cfg(target_os = "macos")]
        {
            let portability = ash::khr::portability_enumeration::NAME.to_string_lossy();
            if !extensions.iter().any(|e| *e == portability) {
                extensions.push(portability.into_owned());
            }
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let layer_names = self
            .layers
            .iter()
            .map(|l| to_cstring(l))
            .collect::<Result<Vec<_>>>()?;
        let extension_names = extensions
            .iter()
            .map(|e| to_cstring(e))
            .collect::<Result<Vec<_>>>()?;
        let layer_ptrs: Vec<*const c_char> = layer_names.iter().map(|l| l.as_ptr()).collect();
        let extension_ptrs: Vec<*const c_char> = extension_names.iter().map(|e| e.as_ptr()).collect();

        let debug_utils = extension_names
            .iter()
            .any(|e| e.as_c_str() == ash::ext::debug_utils::NAME);

        let mut messenger_info = debug_messenger_info();
        let mut create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs)
            .enabled_extension_names(&extension_ptrs)
            .flags(flags);
        if debug_utils {
            create_info = create_info.push_next(&mut messenger_info);
        }
        if let Some(next) = next {
            create_info = create_info.push_next(next);
        }

        // SAFETY: all pointers in create_info reference locals that outlive the call.
        let instance = unsafe { self.entry.create_instance(&create_info, None) }.map_err(|e| {
            error!("Instance creation failed: {e}");
            GpuError::from(e)
        })?;

        let debug_messenger = if debug_utils {
            let loader = ash::ext::debug_utils::Instance::new(&self.entry, &instance);
            // SAFETY: the extension was enabled on this instance.
            match unsafe { loader.create_debug_utils_messenger(&debug_messenger_info(), None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    warn!("Failed to create debug messenger: {e}");
                    None
                }
            }
        } else {
            None
        };

        info!(
            "Created Vulkan instance for {} ({} layers, {} extensions)",
            self.application.name,
            layer_ptrs.len(),
            extension_ptrs.len()
        );

        self.shared = Some(Arc::new(InstanceShared {
            entry: self.entry.clone(),
            instance,
            debug_messenger,
        }));
        Ok(())
    }

    /// Whether [`create`](Self::create) has succeeded.
    pub fn is_created(&self) -> bool {
        self.shared.is_some()
    }

    /// The instance function table.
    pub fn get(&self) -> Result<&ash::Instance> {
        self.shared
            .as_deref()
            .map(InstanceShared::instance)
            .ok_or_else(not_created)
    }

    /// The native instance handle, null before creation.
    pub fn handle(&self) -> vk::Instance {
        self.shared
            .as_ref()
            .map_or_else(vk::Instance::null, |s| s.instance.handle())
    }

    /// The Vulkan entry point.
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub(crate) fn shared(&self) -> Result<Arc<InstanceShared>> {
        self.shared.clone().ok_or_else(not_created)
    }
}

fn not_created() -> GpuError {
    GpuError::InvalidState("instance has not been created".to_string())
}

pub(crate) fn to_cstring(value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| GpuError::InvalidConfig(format!("name contains a NUL byte: {value:?}")))
}

fn debug_messenger_info() -> vk::DebugUtilsMessengerCreateInfoEXT<'static> {
    vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    // SAFETY: the driver passes a valid callback payload for the duration of the call.
    let message = unsafe {
        let message = (*data).p_message;
        if message.is_null() {
            return vk::FALSE;
        }
        CStr::from_ptr(message).to_string_lossy()
    };

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("({message_type:?}) {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("({message_type:?}) {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        info!("({message_type:?}) {message}");
    } else {
        debug!("({message_type:?}) {message}");
    }
    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_info_defaults_to_vulkan_1_3() {
        let info = ApplicationInfo::new("demo", 1, 2, 3);
        assert_eq!(info.version, (1, 2, 3));
        assert_eq!(info.api_version, vk::API_VERSION_1_3);
        assert_eq!(info.engine_name, "Arclight");
    }

    #[test]
    fn names_with_nul_bytes_are_rejected() {
        assert!(to_cstring("VK_LAYER_KHRONOS_validation").is_ok());
        assert!(matches!(
            to_cstring("bad\0name"),
            Err(GpuError::InvalidConfig(_))
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn create_accepts_a_chained_structure() {
        let mut instance = Instance::new().unwrap();
        let name = ash::ext::debug_utils::NAME.to_string_lossy().into_owned();
        if !instance.available_extensions().contains(&name) {
            return;
        }
        instance.init_application("chained", 0, 1, 0).enable_extension(name);

        let mut messenger = debug_messenger_info();
        instance
            .create_with_next(vk::InstanceCreateFlags::empty(), &mut messenger)
            .unwrap();
        assert!(instance.is_created());
        assert_ne!(instance.handle(), vk::Instance::null());
    }
}
