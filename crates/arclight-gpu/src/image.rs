//! Images, image views and samplers.

use crate::device::Device;
use crate::error::Result;
use crate::memory::{DedicatedResource, DeviceMemory};
use ash::vk;
use std::sync::Arc;
use tracing::{debug, warn};

/// Aspect flags implied by an image format.
pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::X8_D24_UNORM_PACK32 | vk::Format::D32_SFLOAT => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Whether the format carries a depth component.
pub fn is_depth_format(format: vk::Format) -> bool {
    aspect_for_format(format).contains(vk::ImageAspectFlags::DEPTH)
}

/// Bytes per texel for uncompressed formats used in transfers.
pub fn texel_size(format: vk::Format) -> Option<u32> {
    use vk::Format as F;
    let size = match format {
        F::R8_UNORM | F::R8_UINT | F::R8_SRGB | F::S8_UINT => 1,
        F::R8G8_UNORM | F::R16_SFLOAT | F::R16_UINT | F::D16_UNORM => 2,
        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SRGB
        | F::R8G8B8A8_UINT
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SRGB
        | F::A2B10G10R10_UNORM_PACK32
        | F::R32_SFLOAT
        | F::R32_UINT
        | F::D32_SFLOAT
        | F::X8_D24_UNORM_PACK32 => 4,
        F::R16G16B16A16_SFLOAT | F::R32G32_SFLOAT => 8,
        F::R32G32B32A32_SFLOAT | F::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// Image creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct ImageConfig {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub usage: vk::ImageUsageFlags,
    pub tiling: vk::ImageTiling,
    pub samples: vk::SampleCountFlags,
    pub mip_levels: u32,
    pub properties: vk::MemoryPropertyFlags,
}

impl ImageConfig {
    /// A single-sampled, optimally tiled, device-local 2D image.
    pub fn new_2d(format: vk::Format, width: u32, height: u32, usage: vk::ImageUsageFlags) -> Self {
        Self {
            format,
            extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            usage,
            tiling: vk::ImageTiling::OPTIMAL,
            samples: vk::SampleCountFlags::TYPE_1,
            mip_levels: 1,
            properties: vk::MemoryPropertyFlags::DEVICE_LOCAL,
        }
    }

    /// Set the depth of the extent, making this a 3D image when above 1.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.extent.depth = depth;
        self
    }

    pub fn with_tiling(mut self, tiling: vk::ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn with_samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels.max(1);
        self
    }

    pub fn with_properties(mut self, properties: vk::MemoryPropertyFlags) -> Self {
        self.properties = properties;
        self
    }

    fn image_type(&self) -> vk::ImageType {
        if self.extent.depth > 1 {
            vk::ImageType::TYPE_3D
        } else if self.extent.height > 1 {
            vk::ImageType::TYPE_2D
        } else {
            vk::ImageType::TYPE_1D
        }
    }
}

/// A GPU image with its own memory.
pub struct Image {
    device: Arc<Device>,
    handle: vk::Image,
    memory: Option<DeviceMemory>,
    format: vk::Format,
    extent: vk::Extent3D,
    mip_levels: u32,
    layout: vk::ImageLayout,
}

impl Image {
    /// Create an image and bind dedicated memory to it.
    pub fn new(device: &Arc<Device>, config: &ImageConfig) -> Result<Self> {
        let create_info = vk::ImageCreateInfo::default()
            .image_type(config.image_type())
            .format(config.format)
            .extent(config.extent)
            .mip_levels(config.mip_levels)
            .array_layers(1)
            .samples(config.samples)
            .tiling(config.tiling)
            .usage(config.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        // SAFETY: the create info is fully initialized.
        let handle = unsafe { device.handle().create_image(&create_info, None) }?;
        // SAFETY: handle was just created on this device.
        let requirements = unsafe { device.handle().get_image_memory_requirements(handle) };

        let memory = match device.allocate_dedicated(
            DedicatedResource::Image(handle),
            requirements,
            config.properties,
            "image",
        ) {
            Ok(memory) => memory,
            Err(e) => {
                // SAFETY: the image has no memory bound and is unused.
                unsafe { device.handle().destroy_image(handle, None) };
                return Err(e);
            }
        };

        debug!(
            "Created image {handle:?} {:?} {}x{}x{}",
            config.format, config.extent.width, config.extent.height, config.extent.depth
        );

        Ok(Self {
            device: Arc::clone(device),
            handle,
            memory: Some(memory),
            format: config.format,
            extent: config.extent,
            mip_levels: config.mip_levels,
            layout: vk::ImageLayout::UNDEFINED,
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent3D {
        self.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    /// The layout the image will be in once all recorded transitions execute.
    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }

    pub(crate) fn set_layout(&mut self, layout: vk::ImageLayout) {
        self.layout = layout;
    }

    /// Subresource range covering every mip level of the image.
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_for_format(self.format))
            .base_mip_level(0)
            .level_count(self.mip_levels)
            .base_array_layer(0)
            .layer_count(1)
    }

    /// Memory type index the image is bound to.
    pub fn memory_type_index(&self) -> Option<u32> {
        self.memory.as_ref().map(|m| m.memory_type_index)
    }
}

impl Drop for Image {
    fn drop(&mut self) {
        // SAFETY: the image is owned exclusively and no longer referenced by
        // pending work once the owner drops it.
        unsafe { self.device.handle().destroy_image(self.handle, None) };
        if let Some(memory) = self.memory.take() {
            self.device.free_allocation(memory.allocation);
        }
    }
}

/// A view over an image.
///
/// The view does not keep the viewed image alive; drop it first.
pub struct ImageView {
    device: Arc<Device>,
    handle: vk::ImageView,
    format: vk::Format,
}

impl ImageView {
    /// Create a view over all mip levels of `image`.
    pub fn new(image: &Image) -> Result<Self> {
        let view_type = match image.extent.depth {
            d if d > 1 => vk::ImageViewType::TYPE_3D,
            _ if image.extent.height > 1 => vk::ImageViewType::TYPE_2D,
            _ => vk::ImageViewType::TYPE_1D,
        };
        Self::create(
            &image.device,
            image.handle,
            image.format,
            view_type,
            image.full_range(),
        )
    }

    /// Create a 2D color view over an image owned elsewhere, such as a
    /// swapchain image.
    pub(crate) fn from_raw(
        device: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
    ) -> Result<Self> {
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect_for_format(format))
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        Self::create(device, image, format, vk::ImageViewType::TYPE_2D, range)
    }

    fn create(
        device: &Arc<Device>,
        image: vk::Image,
        format: vk::Format,
        view_type: vk::ImageViewType,
        range: vk::ImageSubresourceRange,
    ) -> Result<Self> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(range);

        // SAFETY: image is a live image on this device.
        let handle = unsafe { device.handle().create_image_view(&view_info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            format,
        })
    }

    pub fn handle(&self) -> vk::ImageView {
        self.handle
    }

    /// Format of the viewed image.
    pub fn format(&self) -> vk::Format {
        self.format
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        // SAFETY: the view is owned exclusively.
        unsafe { self.device.handle().destroy_image_view(self.handle, None) };
    }
}

/// Sampler parameters.
#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: [vk::SamplerAddressMode; 3],
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
    pub unnormalized_coordinates: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: [vk::SamplerAddressMode::REPEAT; 3],
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
            unnormalized_coordinates: false,
        }
    }
}

impl SamplerConfig {
    /// Nearest filtering with clamped edges.
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            address_mode: [vk::SamplerAddressMode::CLAMP_TO_EDGE; 3],
            ..Self::default()
        }
    }

    pub fn with_address_mode(mut self, mode: vk::SamplerAddressMode) -> Self {
        self.address_mode = [mode; 3];
        self
    }

    pub fn with_anisotropy(mut self, max_anisotropy: f32) -> Self {
        self.max_anisotropy = Some(max_anisotropy);
        self
    }

    pub fn with_compare_op(mut self, op: vk::CompareOp) -> Self {
        self.compare_op = Some(op);
        self
    }

    pub fn with_lod_range(mut self, min_lod: f32, max_lod: f32) -> Self {
        self.min_lod = min_lod;
        self.max_lod = max_lod;
        self
    }
}

/// Clamp a requested anisotropy to the device limit.
fn clamp_anisotropy(requested: f32, limit: f32) -> f32 {
    if requested > limit {
        warn!("Requested anisotropy {requested} exceeds device limit {limit}; clamping");
        limit
    } else {
        requested.max(1.0)
    }
}

/// Image sampling state.
pub struct Sampler {
    device: Arc<Device>,
    handle: vk::Sampler,
    config: SamplerConfig,
}

impl Sampler {
    /// Create a sampler.
    pub fn new(device: &Arc<Device>, config: &SamplerConfig) -> Result<Self> {
        let mut info = vk::SamplerCreateInfo::default()
            .mag_filter(config.mag_filter)
            .min_filter(config.min_filter)
            .mipmap_mode(config.mipmap_mode)
            .address_mode_u(config.address_mode[0])
            .address_mode_v(config.address_mode[1])
            .address_mode_w(config.address_mode[2])
            .min_lod(config.min_lod)
            .max_lod(config.max_lod)
            .border_color(config.border_color)
            .unnormalized_coordinates(config.unnormalized_coordinates);

        if let Some(requested) = config.max_anisotropy {
            let limit = device.limits().max_sampler_anisotropy;
            info = info
                .anisotropy_enable(true)
                .max_anisotropy(clamp_anisotropy(requested, limit));
        }
        if let Some(op) = config.compare_op {
            info = info.compare_enable(true).compare_op(op);
        }

        // SAFETY: the create info is fully initialized.
        let handle = unsafe { device.handle().create_sampler(&info, None) }?;
        Ok(Self {
            device: Arc::clone(device),
            handle,
            config: *config,
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        // SAFETY: the sampler is owned exclusively.
        unsafe { self.device.handle().destroy_sampler(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aspect_follows_format() {
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert!(is_depth_format(vk::Format::D16_UNORM));
        assert!(!is_depth_format(vk::Format::S8_UINT));
    }

    #[test]
    fn texel_sizes() {
        assert_eq!(texel_size(vk::Format::R8G8B8A8_UNORM), Some(4));
        assert_eq!(texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        assert_eq!(texel_size(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn image_type_follows_extent() {
        let usage = vk::ImageUsageFlags::SAMPLED;
        let config = ImageConfig::new_2d(vk::Format::R8_UNORM, 64, 64, usage);
        assert_eq!(config.image_type(), vk::ImageType::TYPE_2D);
        assert_eq!(config.with_depth(8).image_type(), vk::ImageType::TYPE_3D);
        assert_eq!(
            ImageConfig::new_2d(vk::Format::R8_UNORM, 64, 1, usage).image_type(),
            vk::ImageType::TYPE_1D
        );
    }

    #[test]
    fn anisotropy_is_clamped_to_limit() {
        assert_eq!(clamp_anisotropy(16.0, 8.0), 8.0);
        assert_eq!(clamp_anisotropy(4.0, 16.0), 4.0);
        assert_eq!(clamp_anisotropy(0.5, 16.0), 1.0);
    }
}
