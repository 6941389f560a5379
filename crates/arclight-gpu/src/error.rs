//! Error type shared by every wrapper operation.

use ash::vk;
use thiserror::Error;

/// Failures reported by the wrapper.
///
/// Every condition the wrapper treats as fatal surfaces as one of these
/// variants. Recoverable boundary problems (host buffer reads and writes past
/// the end) are clamped and logged instead and never reach this type.
#[derive(Error, Debug)]
pub enum GpuError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be found or initialized.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No physical device offers the queues and API version required.
    #[error("No usable Vulkan device")]
    NoSuitableDevice,

    /// Missing argument, conflicting options or an unusable queue tag.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No memory type satisfies both the allocation mask and requested flags.
    #[error("No memory type matches type bits {type_bits:#b} with properties {properties:?}")]
    NoCompatibleMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Device memory allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Cannot create surface: {0}")]
    SurfaceCreation(String),

    #[error("Cannot create swapchain: {0}")]
    SwapchainCreation(String),

    #[error("Cannot create shader module: {0}")]
    ShaderModule(String),

    #[error("Cannot create pipeline: {0}")]
    PipelineCreation(String),

    /// An object was used outside the lifecycle state that allows it.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A device-side copy region falls outside its buffer.
    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    /// The descriptor pool already holds its maximum number of sets.
    #[error("Descriptor pool exhausted: all {max_sets} sets are allocated")]
    DescriptorPoolExhausted { max_sets: u32 },

    /// Host access was requested on memory that is not host-visible.
    #[error("Buffer memory is not host-visible")]
    NotHostVisible,

    /// A wait did not complete within its timeout.
    #[error("Timed out waiting for the device")]
    Timeout,

    /// Reading a shader binary from disk failed.
    #[error("Shader file: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GpuError>;

/// Map the `TIMEOUT` status of a wait call onto [`GpuError::Timeout`].
pub(crate) fn map_wait_result(result: vk::Result) -> GpuError {
    if result == vk::Result::TIMEOUT {
        GpuError::Timeout
    } else {
        GpuError::Vulkan(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_distinguished_from_other_failures() {
        assert!(matches!(
            map_wait_result(vk::Result::TIMEOUT),
            GpuError::Timeout
        ));
        assert!(matches!(
            map_wait_result(vk::Result::ERROR_DEVICE_LOST),
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        ));
    }
}
