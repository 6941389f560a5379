//! Headless GPU harness and image readback helpers.
//!
//! Builds a device without a window and renders into off-screen images so
//! end-to-end behavior can be checked on the host.

use arclight_gpu::{
    ApplicationInfo, Buffer, CommandBuffer, CommandPool, Device, Fence, Image, ImageConfig,
    Manager, ManagerConfig, QueueUsage, ShaderModule,
};
use ash::vk;
use image::{ImageBuffer, Rgba};
use std::sync::Arc;
use std::time::Duration;

use crate::{CompareConfig, HarnessError, Result, NOOP_COMPUTE_SPIRV};

/// Default timeout for fences in tests.
pub const FENCE_TIMEOUT: Duration = Duration::from_secs(1);

/// Headless device with a command pool per assigned queue.
pub struct GpuHarness {
    manager: Manager,
}

impl GpuHarness {
    /// Create a harness with no layers or extensions beyond validation.
    pub fn new() -> Result<Self> {
        let config = ManagerConfig::new(ApplicationInfo::new("arclight-test", 0, 1, 0));
        Self::with_config(&config)
    }

    pub fn with_config(config: &ManagerConfig) -> Result<Self> {
        let manager = Manager::new(config)?;
        Ok(Self { manager })
    }

    pub fn device(&self) -> &Arc<Device> {
        self.manager.device()
    }

    pub fn pool(&self, usage: QueueUsage) -> Result<&CommandPool> {
        self.manager.command_pool(usage).ok_or_else(|| {
            HarnessError::Gpu(arclight_gpu::GpuError::InvalidConfig(format!(
                "no {usage} command pool"
            )))
        })
    }

    /// A fresh command buffer in the recording state.
    pub fn command_buffer(&self, usage: QueueUsage) -> Result<CommandBuffer> {
        Ok(self.pool(usage)?.allocate()?)
    }

    /// The no-op compute shader.
    pub fn noop_shader(&self) -> Result<ShaderModule> {
        Ok(ShaderModule::from_words(self.device(), &NOOP_COMPUTE_SPIRV)?)
    }
}

/// Clears an off-screen image and reads it back to the host.
pub struct HeadlessClear {
    harness: GpuHarness,
    target: Image,
    readback: Buffer<u8>,
    fence: Fence,
    width: u32,
    height: u32,
}

impl HeadlessClear {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        let harness = GpuHarness::new()?;
        let device = harness.device();

        let target = Image::new(
            device,
            &ImageConfig::new_2d(
                vk::Format::R8G8B8A8_UNORM,
                width,
                height,
                vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::TRANSFER_SRC,
            ),
        )?;
        let readback = Buffer::new(
            device,
            (width * height * 4) as usize,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        let fence = Fence::new(device, false)?;

        Ok(Self {
            harness,
            target,
            readback,
            fence,
            width,
            height,
        })
    }

    /// Clear the image to `color` and return its contents.
    pub fn clear(&mut self, color: [f32; 4]) -> Result<ImageBuffer<Rgba<u8>, Vec<u8>>> {
        let mut cmd = self.harness.command_buffer(QueueUsage::Graphics)?;
        cmd.transition_image_layout(&mut self.target, vk::ImageLayout::TRANSFER_DST_OPTIMAL)?;
        cmd.clear_color_image(&self.target, color)?;
        cmd.transition_image_layout(&mut self.target, vk::ImageLayout::TRANSFER_SRC_OPTIMAL)?;
        cmd.copy_image_to_buffer(&self.target, &self.readback)?;
        cmd.submit_with_fence(&self.fence)?;

        self.fence.wait(Some(FENCE_TIMEOUT))?;
        self.fence.reset()?;

        let data = self.readback.to_vec()?;
        ImageBuffer::from_raw(self.width, self.height, data)
            .ok_or_else(|| HarnessError::Mismatch("readback size mismatch".to_string()))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// An image filled with one color.
pub fn solid_image(width: u32, height: u32, color: [u8; 4]) -> ImageBuffer<Rgba<u8>, Vec<u8>> {
    ImageBuffer::from_pixel(width, height, Rgba(color))
}

/// Compare two images and return the normalized difference (0.0-1.0).
pub fn compare_images(
    a: &ImageBuffer<Rgba<u8>, Vec<u8>>,
    b: &ImageBuffer<Rgba<u8>, Vec<u8>>,
) -> Result<f64> {
    if a.dimensions() != b.dimensions() {
        return Err(HarnessError::Mismatch(format!(
            "Image dimensions don't match: {:?} vs {:?}",
            a.dimensions(),
            b.dimensions()
        )));
    }

    let total_diff: u64 = a
        .pixels()
        .zip(b.pixels())
        .map(|(pa, pb)| {
            pa.0.iter()
                .zip(pb.0.iter())
                .map(|(x, y)| u64::from(x.abs_diff(*y)))
                .sum::<u64>()
        })
        .sum();

    let max_diff = (u64::from(a.width()) * u64::from(a.height()) * 4 * 255) as f64;
    Ok(total_diff as f64 / max_diff)
}

/// Save `image` under the artifact directory and fail when it differs from
/// `expected` by more than the tolerance.
pub fn check_image(
    config: &CompareConfig,
    name: &str,
    image: &ImageBuffer<Rgba<u8>, Vec<u8>>,
    expected: &ImageBuffer<Rgba<u8>, Vec<u8>>,
) -> Result<()> {
    std::fs::create_dir_all(&config.artifact_dir)?;
    let output_path = config.artifact_dir.join(format!("{name}.png"));
    image.save(&output_path)?;

    let diff = compare_images(expected, image)?;
    if diff > config.tolerance {
        return Err(HarnessError::Mismatch(format!(
            "difference {diff:.4} exceeds tolerance {:.4} (see {})",
            config.tolerance,
            output_path.display()
        )));
    }
    tracing::info!("{name}: difference {diff:.6}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use arclight_gpu::descriptors::pool_size;
    use crate::count_warnings;
    use arclight_gpu::{
        ComputeBindings, ComputePipeline, DescriptorKind, DescriptorPool, DescriptorSet,
        GpuError, PushConstants, Semaphore, SubmitSync,
    };

    #[test]
    fn identical_images_have_no_difference() {
        let a = solid_image(4, 4, [10, 20, 30, 255]);
        assert_relative_eq!(compare_images(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn opposite_images_differ_fully() {
        let black = solid_image(2, 2, [0, 0, 0, 0]);
        let white = solid_image(2, 2, [255, 255, 255, 255]);
        assert_relative_eq!(compare_images(&black, &white).unwrap(), 1.0);
    }

    #[test]
    fn mismatched_dimensions_are_rejected() {
        let a = solid_image(2, 2, [0; 4]);
        let b = solid_image(3, 2, [0; 4]);
        assert!(matches!(
            compare_images(&a, &b),
            Err(HarnessError::Mismatch(_))
        ));
    }

    // These tests require a GPU and will be skipped in CI without GPU support

    /// Storage buffer bound to a no-op pipeline, ready to dispatch.
    struct NoopCompute {
        storage: Buffer<i32>,
        push: PushConstants,
        set: DescriptorSet,
        _pool: DescriptorPool,
        pipeline: ComputePipeline,
    }

    impl NoopCompute {
        fn new(harness: &GpuHarness) -> Self {
            let device = harness.device();
            let shader = harness.noop_shader().unwrap();
            let mut push = PushConstants::new().with_stages(vk::ShaderStageFlags::COMPUTE);
            push.add_value(&42_i32);

            let mut storage = Buffer::<i32>::host_storage(device, 16).unwrap();
            storage.set_all(0, 0, 0).unwrap();

            let mut set = DescriptorSet::new(device);
            set.bind_buffer(&storage, DescriptorKind::StorageBuffer, vk::ShaderStageFlags::COMPUTE)
                .unwrap();
            let mut pool =
                DescriptorPool::new(device, 1, &[pool_size(DescriptorKind::StorageBuffer, 1)])
                    .unwrap();
            pool.allocate_set(&mut set).unwrap();

            let pipeline =
                ComputePipeline::new(device, &shader, Some(&push), Some(&set), [16, 1, 1]).unwrap();
            Self {
                storage,
                push,
                set,
                _pool: pool,
                pipeline,
            }
        }

        fn run(&self, cmd: &mut CommandBuffer, fence: &Fence) -> arclight_gpu::Result<()> {
            cmd.compute(
                &self.pipeline,
                ComputeBindings {
                    descriptor_set: Some(&self.set),
                    push_constants: Some(&self.push),
                },
                [16, 1, 1],
                Some(fence),
                Some(FENCE_TIMEOUT),
            )
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn minimal_compute_leaves_buffer_unchanged() {
        let (storage, warnings) = count_warnings(|| {
            let harness = GpuHarness::new().unwrap();
            let noop = NoopCompute::new(&harness);
            let fence = Fence::new(harness.device(), false).unwrap();
            let mut cmd = harness.command_buffer(QueueUsage::Compute).unwrap();
            noop.run(&mut cmd, &fence).unwrap();
            noop.storage.to_vec().unwrap()
        });

        assert_eq!(storage, vec![0; 16]);
        assert_eq!(warnings, 0);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn compute_twice_on_one_fence() {
        let harness = GpuHarness::new().unwrap();
        let noop = NoopCompute::new(&harness);
        // Starts signaled, as a fence from a previous frame would be.
        let fence = Fence::new(harness.device(), true).unwrap();
        let mut cmd = harness.command_buffer(QueueUsage::Compute).unwrap();

        noop.run(&mut cmd, &fence).unwrap();
        assert!(fence.signaled().unwrap());
        noop.run(&mut cmd, &fence).unwrap();
        assert!(fence.signaled().unwrap());

        assert_eq!(noop.storage.to_vec().unwrap(), vec![0; 16]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn reads_past_the_end_are_empty() {
        let harness = GpuHarness::new().unwrap();
        let mut buffer = Buffer::<u32>::host_storage(harness.device(), 4).unwrap();
        buffer.write_all(&[5, 6, 7, 8]).unwrap();

        assert_eq!(buffer.get(3).unwrap(), Some(8));
        assert_eq!(buffer.get(4).unwrap(), None);
        assert_eq!(buffer.get(5).unwrap(), None);
        assert!(buffer.read(2, 9).unwrap().is_empty());
        assert_eq!(buffer.read(8, 2).unwrap(), vec![7, 8]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn host_round_trip() {
        let harness = GpuHarness::new().unwrap();
        let mut buffer = Buffer::<f32>::host_storage(harness.device(), 4).unwrap();
        buffer.write_all(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        let values = buffer.read(0, 0).unwrap();
        for (got, want) in values.iter().zip([1.0, 2.0, 3.0, 4.0]) {
            assert_relative_eq!(*got, want);
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn write_past_end_is_clamped() {
        let harness = GpuHarness::new().unwrap();
        let mut buffer = Buffer::<u8>::host_storage(harness.device(), 4).unwrap();
        buffer.set_all(0, 0, 0).unwrap();

        let written = buffer.write(&[1, 2, 3, 4, 5, 6], 6, 0, 2).unwrap();
        assert_eq!(written, 2);
        assert_eq!(buffer.to_vec().unwrap(), vec![0, 0, 1, 2]);
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn allocated_descriptor_set_rejects_bindings() {
        let harness = GpuHarness::new().unwrap();
        let device = harness.device();
        let buffer = Buffer::<u32>::host_storage(device, 8).unwrap();

        let mut set = DescriptorSet::new(device);
        set.bind_buffer(&buffer, DescriptorKind::StorageBuffer, vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        let mut pool =
            DescriptorPool::new(device, 1, &[pool_size(DescriptorKind::StorageBuffer, 1)]).unwrap();
        pool.allocate_set(&mut set).unwrap();

        let again =
            set.bind_buffer(&buffer, DescriptorKind::StorageBuffer, vk::ShaderStageFlags::COMPUTE);
        assert!(matches!(again, Err(GpuError::InvalidState(_))));

        let mut second = DescriptorSet::new(device);
        second
            .bind_buffer(&buffer, DescriptorKind::StorageBuffer, vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        assert!(matches!(
            pool.allocate_set(&mut second),
            Err(GpuError::DescriptorPoolExhausted { max_sets: 1 })
        ));
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn removed_descriptor_set_can_be_reallocated() {
        let harness = GpuHarness::new().unwrap();
        let device = harness.device();
        let buffer = Buffer::<u32>::host_storage(device, 8).unwrap();

        let mut set = DescriptorSet::new(device);
        set.bind_buffer(&buffer, DescriptorKind::StorageBuffer, vk::ShaderStageFlags::COMPUTE)
            .unwrap();
        let mut pool =
            DescriptorPool::new(device, 1, &[pool_size(DescriptorKind::StorageBuffer, 1)]).unwrap();

        assert_eq!(pool.allocate_set(&mut set).unwrap(), 0);
        pool.remove_set(0).unwrap();
        assert!(!set.is_allocated());
        assert!(matches!(set.update(), Err(GpuError::InvalidState(_))));

        assert_eq!(pool.allocate_set(&mut set).unwrap(), 0);
        assert!(set.is_allocated());
        pool.remove_all_sets().unwrap();
        assert!(!set.is_allocated());

        pool.allocate_set(&mut set).unwrap();
        drop(pool);
        assert!(!set.is_allocated());
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn fence_signals_after_empty_submit() {
        let harness = GpuHarness::new().unwrap();
        let fence = Fence::new(harness.device(), false).unwrap();

        let mut cmd = harness.command_buffer(QueueUsage::Graphics).unwrap();
        cmd.submit_with_fence(&fence).unwrap();

        fence.wait(Some(FENCE_TIMEOUT)).unwrap();
        assert!(fence.signaled().unwrap());
        fence.reset().unwrap();
        assert!(!fence.signaled().unwrap());

        cmd.reset().unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn timeline_semaphore_counts_up() {
        let harness = GpuHarness::new().unwrap();
        let semaphore = Semaphore::timeline(harness.device(), 0).unwrap();
        assert_eq!(semaphore.counter().unwrap(), 0);

        let mut cmd = harness.command_buffer(QueueUsage::Compute).unwrap();
        cmd.submit_with(SubmitSync::new().signal(
            &semaphore,
            5,
            vk::PipelineStageFlags2::ALL_COMMANDS,
        ))
        .unwrap();

        semaphore.wait(5, Some(FENCE_TIMEOUT)).unwrap();
        assert_eq!(semaphore.counter().unwrap(), 5);
        semaphore.signal(7).unwrap();
        assert_eq!(semaphore.counter().unwrap(), 7);
        cmd.wait_idle().unwrap();
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn every_usage_has_a_queue() {
        let harness = GpuHarness::new().unwrap();
        let device = harness.device();
        for usage in QueueUsage::ALL {
            assert!(device.has_queue(usage), "{usage}");
            assert_eq!(
                harness.pool(usage).unwrap().queue_family(),
                device.queue_family(usage).unwrap()
            );
        }
    }

    #[test]
    #[ignore = "Requires GPU hardware"]
    fn clear_reads_back_solid_color() {
        let mut renderer = HeadlessClear::new(64, 64).unwrap();
        let image = renderer.clear([1.0, 0.0, 0.0, 1.0]).unwrap();
        let (width, height) = renderer.dimensions();
        let expected = solid_image(width, height, [255, 0, 0, 255]);
        check_image(&CompareConfig::default(), "clear_red", &image, &expected).unwrap();
    }
}
