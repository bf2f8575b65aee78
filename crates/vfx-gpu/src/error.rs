//! GPU error types.

use ash::vk;
use thiserror::Error;

/// GPU-related errors.
///
/// Everything here is fatal to the operation that raised it, with one
/// exception: [`GpuError::SwapchainOutOfDate`] signals that the surface
/// changed underneath the swapchain and the caller should rebuild the layer
/// and retry the frame.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(String),

    /// The swapchain no longer matches the surface; rebuild and retry.
    #[error("Swapchain out of date")]
    SwapchainOutOfDate,

    /// Shader module creation or SPIR-V reflection failed.
    #[error("Shader reflection failed: {0}")]
    ShaderReflection(String),

    /// Pipeline creation failed.
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
