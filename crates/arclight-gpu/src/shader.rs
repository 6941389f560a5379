//! Shader modules and push constants.

use crate::device::Device;
use crate::error::{GpuError, Result};
use ash::vk;
use bytemuck::Pod;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Folder searched for compiled shaders when none is given.
pub const DEFAULT_SHADER_DIR: &str = "../shaders/spirv/";

/// Entry point every module is expected to export.
pub const ENTRY_POINT: &CStr = c"main";

/// Resolve a shader file name against `folder` or [`DEFAULT_SHADER_DIR`].
pub fn shader_path(folder: Option<&Path>, filename: &str) -> PathBuf {
    folder
        .unwrap_or_else(|| Path::new(DEFAULT_SHADER_DIR))
        .join(filename)
}

/// A compiled SPIR-V module.
pub struct ShaderModule {
    device: Arc<Device>,
    handle: vk::ShaderModule,
}

impl ShaderModule {
    /// Create a module from SPIR-V words.
    pub fn from_words(device: &Arc<Device>, code: &[u32]) -> Result<Self> {
        if code.is_empty() {
            return Err(GpuError::ShaderModule("empty SPIR-V module".to_string()));
        }
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        // SAFETY: the code slice outlives the call.
        let handle = unsafe { device.handle().create_shader_module(&create_info, None) }
            .map_err(|e| GpuError::ShaderModule(e.to_string()))?;
        debug!("Created shader module {handle:?} ({} words)", code.len());
        Ok(Self {
            device: Arc::clone(device),
            handle,
        })
    }

    /// Create a module from a SPIR-V byte stream.
    pub fn from_bytes(device: &Arc<Device>, bytes: &[u8]) -> Result<Self> {
        let words = ash::util::read_spv(&mut Cursor::new(bytes))
            .map_err(|e| GpuError::ShaderModule(format!("invalid SPIR-V: {e}")))?;
        Self::from_words(device, &words)
    }

    /// Load `filename` from `folder`, or from [`DEFAULT_SHADER_DIR`] when `None`.
    pub fn from_file(device: &Arc<Device>, folder: Option<&Path>, filename: &str) -> Result<Self> {
        let path = shader_path(folder, filename);
        debug!("Loading shader {}", path.display());
        let bytes = std::fs::read(&path)?;
        Self::from_bytes(device, &bytes)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Stage create info for this module.
    pub fn stage_info(&self, stage: vk::ShaderStageFlags) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(stage)
            .module(self.handle)
            .name(ENTRY_POINT)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        // SAFETY: pipelines do not reference the module after creation.
        unsafe { self.device.handle().destroy_shader_module(self.handle, None) };
    }
}

/// Extra capacity reserved, as a fraction of the required size, when the
/// push-constant buffer grows.
const RESERVE_FACTOR: f32 = 0.5;

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

/// A block of push-constant data.
///
/// Values are packed back to back, each padded to a four-byte boundary.
#[derive(Debug, Clone)]
pub struct PushConstants {
    data: Vec<u8>,
    capacity: usize,
    stages: vk::ShaderStageFlags,
    offset: u32,
}

impl Default for PushConstants {
    fn default() -> Self {
        Self::new()
    }
}

impl PushConstants {
    /// Empty block visible to all stages.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(bytes: usize) -> Self {
        let capacity = align4(bytes);
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
            stages: vk::ShaderStageFlags::ALL,
            offset: 0,
        }
    }

    pub fn with_stages(mut self, stages: vk::ShaderStageFlags) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_offset(mut self, offset: u32) -> Self {
        self.offset = offset;
        self
    }

    fn reserve(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed > self.capacity {
            let grown = needed + (needed as f32 * RESERVE_FACTOR).ceil() as usize;
            self.capacity = align4(grown);
            self.data.reserve_exact(self.capacity - self.data.len());
        }
    }

    /// Append one value.
    pub fn add_value<T: Pod>(&mut self, value: &T) -> &mut Self {
        self.add_values(std::slice::from_ref(value))
    }

    /// Append a run of values.
    pub fn add_values<T: Pod>(&mut self, values: &[T]) -> &mut Self {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let padded = align4(bytes.len());
        self.reserve(padded);
        self.data.extend_from_slice(bytes);
        self.data.resize(self.data.len() + padded - bytes.len(), 0);
        self
    }

    /// Remove all values, keeping the capacity.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Packed size in bytes.
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stages(&self) -> vk::ShaderStageFlags {
        self.stages
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// The range a pipeline layout declares for this block.
    pub fn range(&self) -> vk::PushConstantRange {
        vk::PushConstantRange {
            stage_flags: self.stages,
            offset: self.offset,
            size: self.size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn values_pack_back_to_back() {
        let mut push = PushConstants::new();
        push.add_value(&42_i32)
            .add_value(&1.5_f32)
            .add_values(&[7_u32, 9_u32]);

        assert_eq!(push.size(), 16);
        let mut expected = Vec::new();
        expected.extend_from_slice(&42_i32.to_le_bytes());
        expected.extend_from_slice(&1.5_f32.to_le_bytes());
        expected.extend_from_slice(&7_u32.to_le_bytes());
        expected.extend_from_slice(&9_u32.to_le_bytes());
        assert_eq!(push.data(), expected.as_slice());
    }

    #[test]
    fn small_values_are_padded_to_four_bytes() {
        let mut push = PushConstants::new();
        push.add_value(&3_u8).add_value(&[1_u16, 2, 3]);
        assert_eq!(push.size(), 12);
        assert_eq!(push.size() % 4, 0);
        assert_eq!(&push.data()[..4], &[3, 0, 0, 0]);
    }

    #[test]
    fn capacity_grows_with_reserve() {
        let mut push = PushConstants::new();
        assert_eq!(push.capacity(), 0);
        push.add_value(&[0_u32; 4]);
        // 16 bytes needed plus half again.
        assert_eq!(push.capacity(), 24);
        push.add_value(&0_u32).add_value(&0_u32);
        assert_eq!(push.capacity(), 24);
        push.add_value(&0_u32);
        assert!(push.capacity() >= push.data().len());
    }

    #[test]
    fn range_covers_packed_bytes() {
        let mut push = PushConstants::new().with_stages(vk::ShaderStageFlags::COMPUTE);
        push.add_value(&[1.0_f32; 3]);
        let range = push.range();
        assert_eq!(range.size, 12);
        assert_eq!(range.offset, 0);
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::COMPUTE);
        assert_eq!(PushConstants::new().stages(), vk::ShaderStageFlags::ALL);
    }

    #[test]
    fn floats_read_back_from_packed_bytes() {
        let mut push = PushConstants::new();
        push.add_values(&[0.25_f32, -3.5, 1e-3]);
        let floats: Vec<f32> = push
            .data()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(floats.len(), 3);
        assert_relative_eq!(floats[0], 0.25);
        assert_relative_eq!(floats[1], -3.5);
        assert_relative_eq!(floats[2], 1e-3);
    }

    #[test]
    fn shader_path_uses_default_folder() {
        assert_eq!(
            shader_path(None, "noop.spv"),
            Path::new("../shaders/spirv/noop.spv")
        );
        assert_eq!(
            shader_path(Some(Path::new("/opt/shaders")), "noop.spv"),
            Path::new("/opt/shaders/noop.spv")
        );
    }
}
