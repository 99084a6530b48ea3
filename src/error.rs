//! Backend error types.
//!
//! Every variant here is fatal to the frame that produced it. Stale swapchain
//! results never reach this type; they are absorbed by a swapchain rebuild.

use ash::vk;
use thiserror::Error;

use crate::backend::command::{CommandBufferOp, CommandBufferState};

#[derive(Error, Debug)]
pub enum BackendError {
    /// Vulkan API error outside the handled swapchain codes
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Failed to load the Vulkan loader library
    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    /// GPU memory allocator error
    #[error("Allocator error: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("Validation layer {0} requested but not installed")]
    MissingValidationLayer(String),

    #[error("No adapter satisfies the renderer requirements")]
    NoSuitableAdapter,

    #[error("None of the candidate depth formats is supported")]
    NoDepthFormat,

    #[error("Surface reports no supported formats")]
    NoSurfaceFormat,

    #[error("Surface error: {0}")]
    Surface(String),

    #[error("Shader error: {0}")]
    Shader(String),

    #[error("Texture error: {0}")]
    Texture(String),

    /// Allocation request larger than any free range of the heap
    #[error("{heap} heap exhausted: requested {requested} bytes, largest free range is {available} bytes")]
    HeapExhausted {
        heap: &'static str,
        requested: u64,
        available: u64,
    },

    #[error("Unknown heap index {0}")]
    UnknownHeapIndex(u32),

    #[error("Cannot {op:?} a command buffer in state {state:?}")]
    InvalidCommandBufferState {
        op: CommandBufferOp,
        state: CommandBufferState,
    },

    #[error("Material object limit of {0} reached for this frame")]
    ObjectLimitReached(u32),

    #[error("Unknown material {0}")]
    UnknownMaterial(usize),

    #[error("Renderer backend is not initialized")]
    NotInitialized,
}

/// Result type alias for backend operations.
pub type BackendResult<T> = std::result::Result<T, BackendError>;
