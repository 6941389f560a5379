//! Swapchain management.

use crate::device::{Device, QueueUsage};
use crate::error::{GpuError, Result};
use crate::image::ImageView;
use crate::render_pass::RenderPass;
use crate::surface::Surface;
use crate::sync::{timeout_ns, Fence, Semaphore};
use ash::vk;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Requested swapchain parameters. The surface's capabilities have the last word.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainConfig {
    /// Used only when the surface does not dictate its own extent.
    pub extent: vk::Extent2D,
    /// Zero asks for one more than the surface minimum.
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    /// Preferred format; sRGB BGRA8 is tried next, then whatever comes first.
    pub surface_format: Option<vk::SurfaceFormatKHR>,
    pub usage: vk::ImageUsageFlags,
}

impl SwapchainConfig {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: vk::Extent2D { width, height },
            image_count: 0,
            present_mode: vk::PresentModeKHR::FIFO,
            surface_format: None,
            usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        }
    }

    pub fn with_image_count(mut self, count: u32) -> Self {
        self.image_count = count;
        self
    }

    pub fn with_present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.present_mode = mode;
        self
    }

    pub fn with_surface_format(mut self, format: vk::SurfaceFormatKHR) -> Self {
        self.surface_format = Some(format);
        self
    }

    pub fn with_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage = usage;
        self
    }

    /// Change the requested extent, e.g. after a window resize.
    pub fn with_extent(mut self, width: u32, height: u32) -> Self {
        self.extent = vk::Extent2D { width, height };
        self
    }
}

/// Outcome of an acquire or present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Optimal,
    /// The swapchain still works but no longer matches the surface exactly.
    Suboptimal,
    /// The swapchain was out of date and has been rebuilt; no image was
    /// acquired or presented.
    Recreated,
}

/// Use `preferred` if the surface supports it, else FIFO.
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        warn!("Present mode {preferred:?} unsupported, falling back to FIFO");
        vk::PresentModeKHR::FIFO
    }
}

/// The surface's current extent, or the requested one clamped to its bounds.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: requested.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: requested.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Clamp the requested image count to the surface bounds. A maximum of zero
/// means the surface has no upper limit.
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR, requested: u32) -> u32 {
    let wanted = if requested == 0 {
        capabilities.min_image_count + 1
    } else {
        requested
    };
    let count = wanted.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// Select a surface format.
pub fn choose_surface_format(
    available: &[vk::SurfaceFormatKHR],
    preferred: Option<vk::SurfaceFormatKHR>,
) -> Option<vk::SurfaceFormatKHR> {
    let srgb = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    // A lone UNDEFINED entry means the surface accepts any format.
    if let [only] = available {
        if only.format == vk::Format::UNDEFINED {
            return Some(preferred.unwrap_or(srgb));
        }
    }

    preferred
        .into_iter()
        .chain(std::iter::once(srgb))
        .find(|wanted| available.contains(wanted))
        .or_else(|| available.first().copied())
}

/// What a swapchain is actually built with once the surface has been consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainParameters {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

fn is_empty_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

/// Intersect `config` with what the surface supports.
///
/// Fails when the surface has no formats or the resulting extent is empty,
/// as it is while a window is minimized.
pub fn resolve_parameters(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    formats: &[vk::SurfaceFormatKHR],
    present_modes: &[vk::PresentModeKHR],
    config: &SwapchainConfig,
) -> Result<SwapchainParameters> {
    let surface_format = choose_surface_format(formats, config.surface_format)
        .ok_or_else(|| GpuError::SwapchainCreation("surface reports no formats".to_string()))?;
    let extent = choose_extent(capabilities, config.extent);
    if is_empty_extent(extent) {
        return Err(GpuError::SwapchainCreation(format!(
            "extent {}x{} has no area",
            extent.width, extent.height
        )));
    }
    Ok(SwapchainParameters {
        surface_format,
        present_mode: choose_present_mode(present_modes, config.present_mode),
        extent,
        image_count: choose_image_count(capabilities, config.image_count),
    })
}

struct SwapchainParts {
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
}

/// Framebuffer inputs remembered so recreation can rebuild them.
struct FramebufferSource {
    render_pass: vk::RenderPass,
    extra_views: Vec<vk::ImageView>,
}

/// A presentation chain for one surface.
pub struct Swapchain {
    device: Arc<Device>,
    surface: Arc<Surface>,
    loader: ash::khr::swapchain::Device,
    config: SwapchainConfig,
    handle: vk::SwapchainKHR,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    framebuffer_source: Option<FramebufferSource>,
    current_image: u32,
}

impl Swapchain {
    /// Create a swapchain presenting through the device's graphics queue.
    pub fn new(device: &Arc<Device>, surface: &Arc<Surface>, config: SwapchainConfig) -> Result<Self> {
        let loader = ash::khr::swapchain::Device::new(device.instance(), device.handle());
        let parts = Self::build(device, surface, &loader, &config, vk::SwapchainKHR::null())?;
        let views = Self::create_views(device, &parts)?;

        Ok(Self {
            device: Arc::clone(device),
            surface: Arc::clone(surface),
            loader,
            config,
            handle: parts.handle,
            surface_format: parts.surface_format,
            present_mode: parts.present_mode,
            extent: parts.extent,
            images: parts.images,
            views,
            framebuffers: Vec::new(),
            framebuffer_source: None,
            current_image: 0,
        })
    }

    fn build(
        device: &Device,
        surface: &Surface,
        loader: &ash::khr::swapchain::Device,
        config: &SwapchainConfig,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<SwapchainParts> {
        if !surface.supports_presentation(device) {
            return Err(GpuError::SwapchainCreation(
                "surface cannot be presented from the graphics queue family".to_string(),
            ));
        }
        let capabilities = surface.capabilities(device).ok_or_else(|| {
            GpuError::SwapchainCreation("surface capabilities unavailable".to_string())
        })?;
        let SwapchainParameters {
            surface_format,
            present_mode,
            extent,
            image_count,
        } = resolve_parameters(
            &capabilities,
            &surface.formats(device),
            &surface.present_modes(device),
            config,
        )?;

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface.handle())
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(config.usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        // SAFETY: the surface and device are alive and the surface supports presentation.
        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

        // SAFETY: handle was just created.
        let images = match unsafe { loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(e) => {
                // SAFETY: nothing references the new swapchain yet.
                unsafe { loader.destroy_swapchain(handle, None) };
                return Err(e.into());
            }
        };

        info!(
            "Swapchain {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            images.len(),
            surface_format.format,
            present_mode
        );

        Ok(SwapchainParts {
            handle,
            surface_format,
            present_mode,
            extent,
            images,
        })
    }

    fn create_views(device: &Arc<Device>, parts: &SwapchainParts) -> Result<Vec<ImageView>> {
        parts
            .images
            .iter()
            .map(|&image| ImageView::from_raw(device, image, parts.surface_format.format))
            .collect()
    }

    /// Build one framebuffer per swapchain image: the image's color view in
    /// slot 0 followed by `extra_views` (e.g. a depth view).
    pub fn create_framebuffers(
        &mut self,
        render_pass: &RenderPass,
        extra_views: &[&ImageView],
    ) -> Result<()> {
        if !render_pass.is_finalized() {
            return Err(GpuError::InvalidState(
                "framebuffers need a finalized render pass".to_string(),
            ));
        }
        if render_pass.attachment_count() != extra_views.len() + 1 {
            return Err(GpuError::InvalidConfig(format!(
                "render pass has {} attachments but {} views were supplied",
                render_pass.attachment_count(),
                extra_views.len() + 1
            )));
        }

        self.framebuffer_source = Some(FramebufferSource {
            render_pass: render_pass.handle(),
            extra_views: extra_views.iter().map(|v| v.handle()).collect(),
        });
        self.rebuild_framebuffers()
    }

    fn rebuild_framebuffers(&mut self) -> Result<()> {
        self.destroy_framebuffers();
        let Some(source) = self.framebuffer_source.as_ref() else {
            return Ok(());
        };

        let mut framebuffers = Vec::with_capacity(self.views.len());
        for view in &self.views {
            let attachments: Vec<vk::ImageView> = std::iter::once(view.handle())
                .chain(source.extra_views.iter().copied())
                .collect();
            let info = vk::FramebufferCreateInfo::default()
                .render_pass(source.render_pass)
                .attachments(&attachments)
                .width(self.extent.width)
                .height(self.extent.height)
                .layers(1);
            // SAFETY: the render pass and views are alive; the caller keeps
            // the extra views alive while the framebuffers are in use.
            match unsafe { self.device.handle().create_framebuffer(&info, None) } {
                Ok(framebuffer) => framebuffers.push(framebuffer),
                Err(e) => {
                    for framebuffer in framebuffers {
                        // SAFETY: created above and never used.
                        unsafe { self.device.handle().destroy_framebuffer(framebuffer, None) };
                    }
                    return Err(e.into());
                }
            }
        }
        self.framebuffers = framebuffers;
        Ok(())
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            // SAFETY: framebuffers are owned by the swapchain and idle here.
            unsafe { self.device.handle().destroy_framebuffer(framebuffer, None) };
        }
    }

    /// Acquire the next presentable image, signaling `semaphore` (and `fence`)
    /// when it is ready.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn acquire_next_image(
        &mut self,
        semaphore: &Semaphore,
        fence: Option<&Fence>,
        timeout: Option<Duration>,
    ) -> Result<PresentStatus> {
        // SAFETY: the swapchain and sync objects are alive.
        let result = unsafe {
            self.loader.acquire_next_image(
                self.handle,
                timeout_ns(timeout),
                semaphore.handle(),
                fence.map_or(vk::Fence::null(), Fence::handle),
            )
        };

        match result {
            Ok((index, false)) => {
                self.current_image = index;
                Ok(PresentStatus::Optimal)
            }
            Ok((index, true)) => {
                info!("Acquired image {index} from a suboptimal swapchain");
                self.current_image = index;
                Ok(PresentStatus::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate()?;
                Ok(PresentStatus::Recreated)
            }
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => Err(GpuError::Timeout),
            Err(e) => Err(e.into()),
        }
    }

    /// Present the most recently acquired image after `wait_semaphores` signal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn present_rendered_image(&mut self, wait_semaphores: &[&Semaphore]) -> Result<PresentStatus> {
        let waits: Vec<vk::Semaphore> = wait_semaphores.iter().map(|s| s.handle()).collect();
        let swapchains = [self.handle];
        let image_indices = [self.current_image];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = self.device.with_queue(QueueUsage::Graphics, |queue| {
            // SAFETY: the queue lock is held and every handle is alive.
            Ok(unsafe { self.loader.queue_present(queue, &present_info) })
        })?;

        match result {
            Ok(false) => Ok(PresentStatus::Optimal),
            Ok(true) => {
                info!("Presented to a suboptimal swapchain");
                Ok(PresentStatus::Suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate()?;
                Ok(PresentStatus::Recreated)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild the swapchain, its views and framebuffers with the same configuration.
    pub fn recreate(&mut self) -> Result<()> {
        self.recreate_with(self.config)
    }

    /// Rebuild the swapchain with a new configuration (e.g. a new extent).
    ///
    /// An empty requested extent leaves the swapchain untouched; call again
    /// once the window has a size.
    pub fn recreate_with(&mut self, config: SwapchainConfig) -> Result<()> {
        if is_empty_extent(config.extent) {
            debug!(
                "Skipping recreation of {:?} for empty extent {}x{}",
                self.handle, config.extent.width, config.extent.height
            );
            return Ok(());
        }
        debug!("Recreating swapchain {:?}", self.handle);
        self.device.queue_wait_idle(QueueUsage::Graphics)?;

        let parts = Self::build(&self.device, &self.surface, &self.loader, &config, self.handle)?;
        let old_extent = self.extent;

        self.destroy_framebuffers();
        self.views.clear();
        // SAFETY: the graphics queue is idle and the old swapchain was retired
        // by passing it as `old_swapchain`.
        unsafe { self.loader.destroy_swapchain(self.handle, None) };

        self.handle = parts.handle;
        self.surface_format = parts.surface_format;
        self.present_mode = parts.present_mode;
        self.extent = parts.extent;
        self.views = Self::create_views(&self.device, &parts)?;
        self.images = parts.images;
        self.config = config;
        self.current_image = 0;

        let extras_fit = self
            .framebuffer_source
            .as_ref()
            .is_some_and(|s| s.extra_views.is_empty() || old_extent == self.extent);
        if extras_fit {
            self.rebuild_framebuffers()?;
        } else if self.framebuffer_source.take().is_some() {
            warn!("Swapchain extent changed; call create_framebuffers with resized views");
        }
        Ok(())
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn surface(&self) -> &Arc<Surface> {
        &self.surface
    }

    pub fn config(&self) -> &SwapchainConfig {
        &self.config
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.surface_format.format
    }

    pub fn surface_format(&self) -> vk::SurfaceFormatKHR {
        self.surface_format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Index of the image returned by the last successful acquire.
    pub fn current_image(&self) -> u32 {
        self.current_image
    }

    pub fn image(&self, index: u32) -> Option<vk::Image> {
        self.images.get(index as usize).copied()
    }

    pub fn image_view(&self, index: u32) -> Option<&ImageView> {
        self.views.get(index as usize)
    }

    pub fn framebuffer(&self, index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(index as usize).copied()
    }

    /// Framebuffer of the most recently acquired image.
    pub fn current_framebuffer(&self) -> Option<vk::Framebuffer> {
        self.framebuffer(self.current_image)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if let Err(e) = self.device.queue_wait_idle(QueueUsage::Graphics) {
            warn!("Graphics queue wait failed during swapchain teardown: {e}");
        }
        self.destroy_framebuffers();
        self.views.clear();
        // SAFETY: the views over its images are gone and the queue is idle.
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 64,
                height: 64,
            },
            max_image_extent: vk::Extent2D {
                width: 1920,
                height: 1080,
            },
            ..Default::default()
        }
    }

    #[test]
    fn unsupported_present_mode_falls_back_to_fifo() {
        let available = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );

        let available = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&available, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn extent_is_clamped_unless_surface_dictates_it() {
        let caps = capabilities(2, 3);
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 4000,
                height: 10,
            },
        );
        assert_eq!((extent.width, extent.height), (1920, 64));

        let mut fixed = caps;
        fixed.current_extent = vk::Extent2D {
            width: 800,
            height: 600,
        };
        let extent = choose_extent(
            &fixed,
            vk::Extent2D {
                width: 4000,
                height: 10,
            },
        );
        assert_eq!((extent.width, extent.height), (800, 600));
    }

    #[test]
    fn image_count_respects_surface_bounds() {
        assert_eq!(choose_image_count(&capabilities(2, 3), 0), 3);
        assert_eq!(choose_image_count(&capabilities(2, 3), 8), 3);
        assert_eq!(choose_image_count(&capabilities(2, 3), 1), 2);
        // No upper bound.
        assert_eq!(choose_image_count(&capabilities(2, 0), 8), 8);
        assert_eq!(choose_image_count(&capabilities(3, 3), 0), 3);
    }

    #[test]
    fn surface_format_preference_order() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };

        assert_eq!(choose_surface_format(&[unorm, srgb], None), Some(srgb));
        assert_eq!(choose_surface_format(&[unorm, srgb], Some(unorm)), Some(unorm));
        assert_eq!(choose_surface_format(&[unorm], None), Some(unorm));
        assert_eq!(choose_surface_format(&[], None), None);

        let any = vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(choose_surface_format(&[any], Some(unorm)), Some(unorm));
    }

    fn formats() -> [vk::SurfaceFormatKHR; 2] {
        [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ]
    }

    #[test]
    fn resolving_twice_is_stable() {
        let caps = capabilities(2, 3);
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let config = SwapchainConfig::new(4000, 10).with_present_mode(vk::PresentModeKHR::IMMEDIATE);

        let first = resolve_parameters(&caps, &formats(), &modes, &config).unwrap();
        assert_eq!(first.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(first.surface_format.format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!((first.extent.width, first.extent.height), (1920, 64));
        assert_eq!(first.image_count, 3);

        // Recreating from what was resolved, against the same surface, changes nothing.
        let again = SwapchainConfig::new(first.extent.width, first.extent.height)
            .with_image_count(first.image_count)
            .with_present_mode(first.present_mode)
            .with_surface_format(first.surface_format);
        let second = resolve_parameters(&caps, &formats(), &modes, &again).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_extent_is_rejected() {
        let mut minimized = capabilities(2, 3);
        minimized.current_extent = vk::Extent2D {
            width: 0,
            height: 0,
        };
        let config = SwapchainConfig::new(800, 600);
        assert!(matches!(
            resolve_parameters(&minimized, &formats(), &[vk::PresentModeKHR::FIFO], &config),
            Err(GpuError::SwapchainCreation(_))
        ));

        assert!(is_empty_extent(vk::Extent2D {
            width: 0,
            height: 600
        }));
        assert!(is_empty_extent(SwapchainConfig::new(800, 0).extent));
        assert!(!is_empty_extent(config.extent));
    }

    #[test]
    fn no_formats_is_rejected() {
        let config = SwapchainConfig::new(800, 600);
        assert!(resolve_parameters(&capabilities(2, 3), &[], &[], &config).is_err());
    }
}
