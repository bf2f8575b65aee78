//! Small wrappers over Vulkan synchronization primitives.

use ash::vk;

use crate::error::Result;

pub fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    let semaphore = unsafe { device.create_semaphore(&create_info, None)? };
    Ok(semaphore)
}

pub fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };
    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = unsafe { device.create_fence(&create_info, None)? };
    Ok(fence)
}

pub fn wait_for_fence(device: &ash::Device, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
    unsafe { device.wait_for_fences(&[fence], true, timeout_ns)? };
    Ok(())
}

pub fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    unsafe { device.reset_fences(&[fence])? };
    Ok(())
}
