//! Presentation surfaces.
//!
//! A [`Surface`] wraps the platform surface created from native window
//! handles. [`Surface::from_window`] accepts anything implementing the
//! `raw-window-handle` traits; the per-platform constructors take the native
//! handles directly and are only compiled on their platform.

use crate::device::{Device, QueueUsage};
use crate::error::{GpuError, Result};
use crate::instance::{Instance, InstanceShared};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;
use tracing::{debug, warn};

/// A platform presentation target.
pub struct Surface {
    instance: Arc<InstanceShared>,
    loader: ash::khr::surface::Instance,
    handle: vk::SurfaceKHR,
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface").field("handle", &self.handle).finish()
    }
}

impl Surface {
    fn wrap(instance: Arc<InstanceShared>, handle: vk::SurfaceKHR) -> Self {
        let loader = ash::khr::surface::Instance::new(instance.entry(), instance.instance());
        debug!("Created surface {handle:?}");
        Self {
            instance,
            loader,
            handle,
        }
    }

    /// Create a surface from a window.
    ///
    /// The instance must have been created with the extensions reported by
    /// [`Instance::enable_surface_extensions`] for this window's display.
    ///
    /// # Safety
    /// The window must outlive the returned surface.
    pub unsafe fn from_window<W>(instance: &Instance, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let shared = instance.shared()?;

        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let handle = ash_window::create_surface(
            shared.entry(),
            shared.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        Ok(Self::wrap(shared, handle))
    }

    /// Create a surface from a Win32 window.
    ///
    /// # Safety
    /// `hinstance` and `hwnd` must identify a live window.
    #[cfg(target_os = "windows")]
    pub unsafe fn from_win32(
        instance: &Instance,
        hinstance: vk::HINSTANCE,
        hwnd: vk::HWND,
    ) -> Result<Self> {
        let shared = instance.shared()?;
        let create_info = vk::Win32SurfaceCreateInfoKHR::default()
            .hinstance(hinstance)
            .hwnd(hwnd);
        let handle = ash::khr::win32_surface::Instance::new(shared.entry(), shared.instance())
            .create_win32_surface(&create_info, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(Self::wrap(shared, handle))
    }

    /// Create a surface from an XCB window.
    ///
    /// # Safety
    /// `connection` must be a live XCB connection owning `window`.
    #[cfg(all(
        unix,
        not(any(target_os = "android", target_os = "macos", target_os = "ios"))
    ))]
    pub unsafe fn from_xcb(
        instance: &Instance,
        connection: *mut vk::xcb_connection_t,
        window: vk::xcb_window_t,
    ) -> Result<Self> {
        let shared = instance.shared()?;
        let create_info = vk::XcbSurfaceCreateInfoKHR::default()
            .connection(connection)
            .window(window);
        let handle = ash::khr::xcb_surface::Instance::new(shared.entry(), shared.instance())
            .create_xcb_surface(&create_info, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(Self::wrap(shared, handle))
    }

    /// Create a surface from an Xlib window.
    ///
    /// # Safety
    /// `display` must be a live Xlib display owning `window`.
    #[cfg(all(
        unix,
        not(any(target_os = "android", target_os = "macos", target_os = "ios"))
    ))]
    pub unsafe fn from_xlib(
        instance: &Instance,
        display: *mut vk::Display,
        window: vk::Window,
    ) -> Result<Self> {
        let shared = instance.shared()?;
        let create_info = vk::XlibSurfaceCreateInfoKHR::default()
            .dpy(display)
            .window(window);
        let handle = ash::khr::xlib_surface::Instance::new(shared.entry(), shared.instance())
            .create_xlib_surface(&create_info, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(Self::wrap(shared, handle))
    }

    /// Create a surface from a Wayland surface.
    ///
    /// # Safety
    /// `display` and `surface` must be live Wayland objects.
    #[cfg(all(
        unix,
        not(any(target_os = "android", target_os = "macos", target_os = "ios"))
    ))]
    pub unsafe fn from_wayland(
        instance: &Instance,
        display: *mut vk::wl_display,
        surface: *mut vk::wl_surface,
    ) -> Result<Self> {
        let shared = instance.shared()?;
        let create_info = vk::WaylandSurfaceCreateInfoKHR::default()
            .display(display)
            .surface(surface);
        let handle = ash::khr::wayland_surface::Instance::new(shared.entry(), shared.instance())
            .create_wayland_surface(&create_info, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(Self::wrap(shared, handle))
    }

    /// Create a surface from an Android native window.
    ///
    /// # Safety
    /// `window` must stay valid for the surface's lifetime.
    #[cfg(target_os = "android")]
    pub unsafe fn from_android(
        instance: &Instance,
        window: *mut vk::ANativeWindow,
    ) -> Result<Self> {
        let shared = instance.shared()?;
        let create_info = vk::AndroidSurfaceCreateInfoKHR::default().window(window);
        let handle = ash::khr::android_surface::Instance::new(shared.entry(), shared.instance())
            .create_android_surface(&create_info, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(Self::wrap(shared, handle))
    }

    /// Create a surface from a `CAMetalLayer`.
    ///
    /// # Safety
    /// `layer` must stay valid for the surface's lifetime.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub unsafe fn from_metal(instance: &Instance, layer: *const vk::CAMetalLayer) -> Result<Self> {
        let shared = instance.shared()?;
        let create_info = vk::MetalSurfaceCreateInfoEXT::default().layer(layer);
        let handle = ash::ext::metal_surface::Instance::new(shared.entry(), shared.instance())
            .create_metal_surface(&create_info, None)
            .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;
        Ok(Self::wrap(shared, handle))
    }

    /// The native surface handle.
    pub fn handle(&self) -> vk::SurfaceKHR {
        self.handle
    }

    /// The instance the surface was created from.
    pub fn instance(&self) -> &ash::Instance {
        self.instance.instance()
    }

    /// Whether the device's graphics queue family can present to this surface.
    pub fn supports_presentation(&self, device: &Device) -> bool {
        if self.handle == vk::SurfaceKHR::null() {
            warn!("Presentation support queried on a null surface");
            return false;
        }
        let Some(family) = device.queue_family(QueueUsage::Graphics) else {
            warn!("Device has no graphics queue to present from");
            return false;
        };
        // SAFETY: surface and physical device belong to the same instance.
        unsafe {
            self.loader
                .get_physical_device_surface_support(device.physical_device(), family, self.handle)
        }
        .unwrap_or_else(|e| {
            warn!("Surface support query failed: {e}");
            false
        })
    }

    /// Surface capabilities for the device, or `None` if the query fails.
    pub fn capabilities(&self, device: &Device) -> Option<vk::SurfaceCapabilitiesKHR> {
        if self.handle == vk::SurfaceKHR::null() {
            warn!("Capabilities queried on a null surface");
            return None;
        }
        // SAFETY: surface and physical device belong to the same instance.
        unsafe {
            self.loader
                .get_physical_device_surface_capabilities(device.physical_device(), self.handle)
        }
        .map_err(|e| warn!("Surface capability query failed: {e}"))
        .ok()
    }

    /// Supported surface formats; empty if the query fails.
    pub fn formats(&self, device: &Device) -> Vec<vk::SurfaceFormatKHR> {
        if self.handle == vk::SurfaceKHR::null() {
            warn!("Formats queried on a null surface");
            return Vec::new();
        }
        // SAFETY: surface and physical device belong to the same instance.
        unsafe {
            self.loader
                .get_physical_device_surface_formats(device.physical_device(), self.handle)
        }
        .unwrap_or_else(|e| {
            warn!("Surface format query failed: {e}");
            Vec::new()
        })
    }

    /// Supported present modes; empty if the query fails.
    pub fn present_modes(&self, device: &Device) -> Vec<vk::PresentModeKHR> {
        if self.handle == vk::SurfaceKHR::null() {
            warn!("Present modes queried on a null surface");
            return Vec::new();
        }
        // SAFETY: surface and physical device belong to the same instance.
        unsafe {
            self.loader
                .get_physical_device_surface_present_modes(device.physical_device(), self.handle)
        }
        .unwrap_or_else(|e| {
            warn!("Present mode query failed: {e}");
            Vec::new()
        })
    }

    /// All three queries at once.
    pub fn query(&self, device: &Device) -> Option<SurfaceCapabilities> {
        Some(SurfaceCapabilities {
            capabilities: self.capabilities(device)?,
            formats: self.formats(device),
            present_modes: self.present_modes(device),
        })
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        debug!("Destroying surface {:?}", self.handle);
        // SAFETY: swapchains hold an Arc<Surface>, so none outlives it; the
        // instance is kept alive by `self.instance`.
        unsafe { self.loader.destroy_surface(self.handle, None) };
    }
}

/// Surface capabilities query result.
#[derive(Debug, Clone)]
pub struct SurfaceCapabilities {
    /// Raw surface capabilities.
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported surface formats.
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes.
    pub present_modes: Vec<vk::PresentModeKHR>,
}
