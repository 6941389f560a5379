//! Test harness for the Arclight Vulkan wrapper.
//!
//! Provides a headless device, a no-op compute shader and image readback
//! helpers for end-to-end tests.

pub mod capture;
pub mod harness;

pub use capture::{count_warnings, WarningCounter};
pub use harness::{compare_images, solid_image, GpuHarness, HeadlessClear};

use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error(transparent)]
    Gpu(#[from] arclight_gpu::GpuError),
    /// Rendered output did not match what the test expected.
    #[error("readback mismatch: {0}")]
    Mismatch(String),
    #[error("writing test output: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding test output: {0}")]
    Image(#[from] image::ImageError),
}

pub type Result<T> = std::result::Result<T, HarnessError>;

/// How strictly readbacks are compared and where diff artifacts go.
#[derive(Debug, Clone)]
pub struct CompareConfig {
    /// Largest mean per-channel difference accepted, in `0.0..=1.0`.
    pub tolerance: f64,
    pub artifact_dir: PathBuf,
}

impl Default for CompareConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-3,
            artifact_dir: PathBuf::from("target/readback"),
        }
    }
}

/// A compute shader with an empty `main` and a 1x1x1 local size.
pub const NOOP_COMPUTE_SPIRV: [u32; 35] = [
    // Header: magic, version 1.0, generator, id bound, schema.
    0x0723_0203,
    0x0001_0000,
    0,
    5,
    0,
    // OpCapability Shader
    0x0002_0011,
    1,
    // OpMemoryModel Logical GLSL450
    0x0003_000E,
    0,
    1,
    // OpEntryPoint GLCompute %1 "main"
    0x0005_000F,
    5,
    1,
    0x6E69_616D,
    0,
    // OpExecutionMode %1 LocalSize 1 1 1
    0x0006_0010,
    1,
    17,
    1,
    1,
    1,
    // %2 = OpTypeVoid
    0x0002_0013,
    2,
    // %3 = OpTypeFunction %2
    0x0003_0021,
    3,
    2,
    // %1 = OpFunction %2 None %3
    0x0005_0036,
    2,
    1,
    0,
    3,
    // %4 = OpLabel
    0x0002_00F8,
    4,
    // OpReturn
    0x0001_00FD,
    // OpFunctionEnd
    0x0001_0038,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_shader_header_is_valid() {
        assert_eq!(NOOP_COMPUTE_SPIRV[0], 0x0723_0203);
        // Each instruction's word count must land exactly on the end.
        let mut index = 5;
        while index < NOOP_COMPUTE_SPIRV.len() {
            let words = (NOOP_COMPUTE_SPIRV[index] >> 16) as usize;
            assert!(words > 0);
            index += words;
        }
        assert_eq!(index, NOOP_COMPUTE_SPIRV.len());
    }
}
