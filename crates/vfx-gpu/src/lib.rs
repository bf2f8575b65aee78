//! Thin Vulkan abstraction layer.
//!
//! This crate provides:
//! - Instance and device management, with validation output routed into `tracing`
//! - Buffer, texture, and sampler creation via gpu-allocator
//! - SPIR-V reflection driving descriptor-set-layout derivation for pipelines
//! - Command queues with fixed rings of reusable command buffers
//! - Batched synchronization2 barriers and dynamic rendering
//! - Swapchain layers handing out one drawable per frame
//!
//! The [`Device`] is the factory for everything else: create one through
//! [`ContextBuilder`], then make and free resources through it.

pub mod arena;
pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod deferred;
pub mod descriptors;
pub mod device;
pub mod error;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod pipeline;
pub mod reflect;
pub mod sampler;
pub mod shader;
mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use buffer::{Buffer, BufferDescription, BufferUsage};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{
    BufferBarrier, ColorAttachment, CommandBuffer, CommandQueue, CommandQueueDescription,
    DepthAttachment, ImageBarrier, MemoryBarrier, QueueKind, RenderingInfo,
};
pub use deferred::DeferredQueue;
pub use descriptors::ResourceGroup;
pub use device::{Context, ContextBuilder, Device};
pub use error::{GpuError, Result};
pub use layout::{BindingSlot, LayoutPlan};
pub use pipeline::{ComputePipelineState, PipelineState, PipelineStateDescription};
pub use reflect::{PushConstantBlock, ShaderBinding};
pub use sampler::{Sampler, SamplerDescription};
pub use shader::{Function, Library};
pub use swapchain::{Drawable, Layer, LayerDescription};
pub use texture::{Texture, TextureDescription, TextureUsage};
