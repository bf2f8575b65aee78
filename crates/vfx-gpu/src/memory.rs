//! GPU memory management.
//!
//! Allocations are owned by the [`MemoryPool`] and referenced from resources
//! through a generation-checked [`MemoryIndex`]. Resources stay plain `Copy`-
//! free handle structs and the pool catches double frees and stale handles.

use std::ptr::NonNull;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

use crate::arena::{Arena, Index};
use crate::error::{GpuError, Result};

/// Handle to an allocation held by the [`MemoryPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryIndex(Index);

/// Device memory allocator plus the table of live allocations.
pub struct MemoryPool {
    // Option so shutdown can drop the allocator before the device goes away.
    allocator: Option<Allocator>,
    allocations: Arena<Allocation>,
    device: Arc<ash::Device>,
}

impl MemoryPool {
    /// Create a new pool.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: (*device).clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: cfg!(debug_assertions),
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Some(allocator),
            allocations: Arena::new(),
            device,
        })
    }

    fn allocator_mut(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
    }

    /// Create a buffer and bind fresh memory to it.
    pub fn create_buffer(
        &mut self,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<(vk::Buffer, MemoryIndex)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe {
            self.device
                .create_buffer(&buffer_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let allocation = match self.allocator_mut()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
                .map_err(GpuError::from)?;
        }

        Ok((buffer, MemoryIndex(self.allocations.insert(allocation))))
    }

    /// Create an image and bind fresh device-local memory to it.
    pub fn create_image(
        &mut self,
        create_info: &vk::ImageCreateInfo,
        name: &str,
    ) -> Result<(vk::Image, MemoryIndex)> {
        let image = unsafe {
            self.device
                .create_image(create_info, None)
                .map_err(GpuError::from)?
        };

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocator_mut()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(GpuError::AllocationFailed(e.to_string()));
            }
        };

        unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
                .map_err(GpuError::from)?;
        }

        Ok((image, MemoryIndex(self.allocations.insert(allocation))))
    }

    /// Destroy a buffer and release its allocation. A stale index means the
    /// allocation was already freed and is reported as an error.
    pub fn free_buffer(&mut self, buffer: vk::Buffer, memory: MemoryIndex) -> Result<()> {
        let allocation = self
            .allocations
            .remove(memory.0)
            .ok_or_else(|| GpuError::InvalidState("Buffer allocation already freed".to_string()))?;

        self.allocator_mut()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device.destroy_buffer(buffer, None);
        }

        Ok(())
    }

    /// Destroy an image and release its allocation.
    pub fn free_image(&mut self, image: vk::Image, memory: MemoryIndex) -> Result<()> {
        let allocation = self
            .allocations
            .remove(memory.0)
            .ok_or_else(|| GpuError::InvalidState("Image allocation already freed".to_string()))?;

        self.allocator_mut()?
            .free(allocation)
            .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        unsafe {
            self.device.destroy_image(image, None);
        }

        Ok(())
    }

    /// CPU pointer for a host-visible allocation. Memory stays persistently
    /// mapped for the allocation's lifetime, so there is no unmap.
    pub fn mapped_ptr(&self, memory: MemoryIndex) -> Option<NonNull<u8>> {
        self.allocations
            .get(memory.0)
            .and_then(Allocation::mapped_ptr)
            .map(NonNull::cast)
    }

    /// Number of allocations that have not been freed.
    pub fn live_allocations(&self) -> usize {
        self.allocations.len()
    }

    /// Release every remaining allocation and drop the allocator.
    ///
    /// This must run before the Vulkan device is destroyed. Allocations still
    /// live at this point belong to resources that were never freed; their
    /// memory is reclaimed here so teardown does not strand it.
    pub fn shutdown(&mut self) {
        if let Some(mut allocator) = self.allocator.take() {
            for allocation in self.allocations.drain() {
                if let Err(e) = allocator.free(allocation) {
                    tracing::warn!("Failed to free leaked allocation: {e}");
                }
            }
            drop(allocator);
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
