//! Headless compute demo.
//!
//! Uploads a buffer through the transfer queue, dispatches a compute shader
//! over it and copies the result back for inspection.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p arclight-compute -- [SHADER.spv]
//! ```
//!
//! Without an argument a built-in no-op kernel is dispatched, so the
//! read-back data must match the upload.
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use arclight_gpu::descriptors::pool_size;
use arclight_gpu::{
    make_singleton, release_singleton, ApplicationInfo, Buffer, CommandBuffer, ComputeBindings,
    ComputePipeline, DescriptorKind, DescriptorPool, DescriptorSet, Fence, Manager,
    ManagerConfig, PushConstants, QueueUsage, Semaphore, ShaderModule, SubmitSync,
};
use arclight_test::NOOP_COMPUTE_SPIRV;
use ash::vk;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ELEMENTS: usize = 256;
const WORKGROUP: [u32; 3] = [64, 1, 1];
const TIMEOUT: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let shader_path = std::env::args_os().nth(1).map(PathBuf::from);

    let config = ManagerConfig::new(ApplicationInfo::new("arclight-compute", 0, 1, 0));
    let manager = make_singleton(&config).context("failed to bring up the GPU")?;

    let result = run(&manager, shader_path);

    drop(manager);
    release_singleton();
    result
}

fn run(manager: &Manager, shader_path: Option<PathBuf>) -> anyhow::Result<()> {
    let device = manager.device();
    let compute_pool = manager
        .command_pool(QueueUsage::Compute)
        .context("device has no compute queue")?;
    let transfer_pool = manager
        .command_pool(QueueUsage::Transfer)
        .context("device has no transfer queue")?;

    let input: Vec<u32> = (0..ELEMENTS as u32).collect();

    let mut staging = Buffer::<u32>::host_storage(device, ELEMENTS)?;
    staging.write_all(&input)?;
    let storage = Buffer::<u32>::new(
        device,
        ELEMENTS,
        vk::BufferUsageFlags::STORAGE_BUFFER,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )?;
    let readback = Buffer::<u32>::host_storage(device, ELEMENTS)?;

    // Upload, signalling the timeline once the copy lands.
    let uploaded = Semaphore::timeline(device, 0)?;
    let mut upload = CommandBuffer::new(transfer_pool)?;
    upload.copy_buffer(&staging, &storage, storage.size_bytes(), 0, 0)?;
    upload.submit_with(SubmitSync::new().signal(&uploaded, 1, vk::PipelineStageFlags2::TRANSFER))?;
    uploaded.wait(1, Some(TIMEOUT))?;
    info!("Uploaded {} bytes", storage.size_bytes());

    let shader = match &shader_path {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            ShaderModule::from_bytes(device, &bytes)?
        }
        None => ShaderModule::from_words(device, &NOOP_COMPUTE_SPIRV)?,
    };

    let mut descriptor_set = DescriptorSet::new(device);
    descriptor_set.bind_buffer(
        &storage,
        DescriptorKind::StorageBuffer,
        vk::ShaderStageFlags::COMPUTE,
    )?;
    let mut descriptor_pool =
        DescriptorPool::new(device, 1, &[pool_size(DescriptorKind::StorageBuffer, 1)])?;
    descriptor_pool.allocate_set(&mut descriptor_set)?;

    let mut push_constants = PushConstants::new().with_stages(vk::ShaderStageFlags::COMPUTE);
    push_constants.add_value(&(ELEMENTS as u32));

    let pipeline = ComputePipeline::new(
        device,
        &shader,
        Some(&push_constants),
        Some(&descriptor_set),
        WORKGROUP,
    )?;

    let fence = Fence::new(device, false)?;
    let mut dispatch = CommandBuffer::new(compute_pool)?;
    dispatch.compute(
        &pipeline,
        ComputeBindings {
            descriptor_set: Some(&descriptor_set),
            push_constants: Some(&push_constants),
        },
        [ELEMENTS as u32, 1, 1],
        Some(&fence),
        Some(TIMEOUT),
    )?;
    info!("Dispatched {ELEMENTS} invocations in groups of {}", WORKGROUP[0]);

    let mut download = CommandBuffer::new(transfer_pool)?;
    download.copy_buffer(&storage, &readback, storage.size_bytes(), 0, 0)?;
    download.submit()?;
    download.wait_idle()?;

    let output = readback.to_vec()?;
    let changed = input.iter().zip(&output).filter(|(a, b)| a != b).count();
    if shader_path.is_none() && changed != 0 {
        bail!("no-op kernel changed {changed} of {ELEMENTS} elements");
    }
    if changed == 0 {
        info!("Read back {} elements, all unchanged", output.len());
    } else {
        warn!("Kernel changed {changed} of {ELEMENTS} elements");
        info!("First elements: {:?}", &output[..output.len().min(8)]);
    }
    Ok(())
}
