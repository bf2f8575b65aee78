//! Buffer resources.

use std::ptr::NonNull;

use ash::vk;
use gpu_allocator::MemoryLocation;

use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::MemoryIndex;

bitflags::bitflags! {
    /// How a buffer will be used. Drives both the Vulkan usage flags and the
    /// memory residency choice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDIRECT = 1 << 4;
        const TRANSFER_SRC = 1 << 5;
        const TRANSFER_DST = 1 << 6;
        /// Buffer can be referenced by raw device address from shaders.
        const DEVICE_ADDRESS = 1 << 7;
    }
}

impl BufferUsage {
    pub(crate) fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
        }
        if self.contains(Self::INDIRECT) {
            flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
        }
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        if self.contains(Self::DEVICE_ADDRESS) {
            flags |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        flags
    }
}

/// Pick residency from usage. Buffers that only receive copied data live in
/// device-local memory; everything else stays host-visible so it can be
/// written directly.
pub(crate) fn memory_location_for(usage: BufferUsage) -> MemoryLocation {
    if usage.contains(BufferUsage::TRANSFER_DST) && !usage.contains(BufferUsage::TRANSFER_SRC) {
        MemoryLocation::GpuOnly
    } else {
        MemoryLocation::CpuToGpu
    }
}

/// Parameters for [`Device::make_buffer`].
#[derive(Debug, Clone)]
pub struct BufferDescription<'a> {
    pub size: u64,
    pub usage: BufferUsage,
    /// Name shown in allocator reports and validation output.
    pub label: &'a str,
}

impl<'a> BufferDescription<'a> {
    pub fn new(size: u64, usage: BufferUsage) -> Self {
        Self {
            size,
            usage,
            label: "buffer",
        }
    }

    pub fn label(mut self, label: &'a str) -> Self {
        self.label = label;
        self
    }
}

/// A GPU buffer. Plain handle data; the backing allocation is owned by the
/// device and released through [`Device::free_buffer`].
pub struct Buffer {
    pub(crate) handle: vk::Buffer,
    pub(crate) memory: MemoryIndex,
    pub(crate) size: u64,
    pub(crate) usage: BufferUsage,
}

impl Buffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Raw device address of the buffer, for shaders that chase pointers
    /// instead of going through descriptors. Requires
    /// [`BufferUsage::DEVICE_ADDRESS`].
    pub fn device_address(&self, device: &Device) -> vk::DeviceAddress {
        let info = vk::BufferDeviceAddressInfo::default().buffer(self.handle);
        unsafe { device.handle().get_buffer_device_address(&info) }
    }

    /// CPU pointer to the buffer contents.
    ///
    /// Host-visible buffers stay persistently mapped for their whole
    /// lifetime, so there is nothing to unmap. Device-local buffers have no
    /// mapping and return an error.
    pub fn mapped_ptr(&self, device: &Device) -> Result<NonNull<u8>> {
        device
            .memory_pool()
            .mapped_ptr(self.memory)
            .ok_or_else(|| GpuError::InvalidState("Buffer is not host-visible".to_string()))
    }

    /// Copy raw bytes into the buffer at the given offset.
    pub fn update(&self, device: &Device, data: &[u8], offset: u64) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(format!(
                "Write of {} bytes at offset {} exceeds buffer size {}",
                data.len(),
                offset,
                self.size
            )));
        }

        let ptr = self.mapped_ptr(device)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                ptr.as_ptr().add(offset as usize),
                data.len(),
            );
        }

        Ok(())
    }

    /// Copy a slice of plain-old-data values into the start of the buffer.
    pub fn write<T: bytemuck::NoUninit>(&self, device: &Device, data: &[T]) -> Result<()> {
        self.update(device, bytemuck::cast_slice(data), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_targets_live_in_device_memory() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        assert_eq!(memory_location_for(usage), MemoryLocation::GpuOnly);
    }

    #[test]
    fn directly_written_buffers_stay_host_visible() {
        assert_eq!(
            memory_location_for(BufferUsage::VERTEX),
            MemoryLocation::CpuToGpu
        );
        assert_eq!(
            memory_location_for(BufferUsage::UNIFORM),
            MemoryLocation::CpuToGpu
        );
        // Staging sources must be written by the CPU even though they also
        // participate in transfers.
        assert_eq!(
            memory_location_for(BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST),
            MemoryLocation::CpuToGpu
        );
    }

    #[test]
    fn usage_maps_to_vulkan_flags() {
        let flags = (BufferUsage::VERTEX | BufferUsage::TRANSFER_DST).to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::VERTEX_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::BufferUsageFlags::INDEX_BUFFER));

        let flags = (BufferUsage::STORAGE | BufferUsage::DEVICE_ADDRESS).to_vk();
        assert!(flags.contains(vk::BufferUsageFlags::STORAGE_BUFFER));
        assert!(flags.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS));
    }
}
