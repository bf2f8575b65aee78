//! GPU capability detection.

use std::collections::HashSet;
use std::ffi::CStr;

use ash::vk;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities and device limits. Factories validate resource
/// descriptions against these; alignment limits are for callers laying out
/// dynamic offsets.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    // Vulkan 1.3 core features
    /// Dynamic rendering support (VK 1.3 core)
    pub supports_dynamic_rendering: bool,
    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,
    /// Presentation support (VK_KHR_swapchain)
    pub supports_swapchain: bool,

    // Memory info
    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Maximum memory allocation count
    pub max_memory_allocation_count: u32,

    // Limits checked by factories or honored by callers
    /// Largest 2D texture dimension
    pub max_image_dimension_2d: u32,
    /// Anisotropic filtering ceiling
    pub max_sampler_anisotropy: f32,
    /// Push constant byte budget
    pub max_push_constant_size: u32,
    /// Descriptor sets bindable at once
    pub max_bound_descriptor_sets: u32,
    /// Uniform buffer offset alignment
    pub min_uniform_buffer_offset_alignment: u64,

    // Compute limits
    /// Maximum compute workgroup size
    pub max_compute_workgroup_size: [u32; 3],
    /// Maximum compute workgroup invocations
    pub max_compute_workgroup_invocations: u32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory_properties = instance.get_physical_device_memory_properties(physical_device);

        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        // Dynamic rendering and synchronization2 are core in 1.3.
        let api_version = properties.api_version;
        let has_vulkan_1_3 = at_least_vulkan_1_3(api_version);

        Self {
            vendor,
            device_name,
            api_version,
            driver_version: properties.driver_version,

            supports_dynamic_rendering: has_vulkan_1_3,
            supports_synchronization2: has_vulkan_1_3,
            supports_swapchain: available_extensions.contains("VK_KHR_swapchain"),

            device_local_memory_mb,
            max_memory_allocation_count: properties.limits.max_memory_allocation_count,

            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            max_push_constant_size: properties.limits.max_push_constants_size,
            max_bound_descriptor_sets: properties.limits.max_bound_descriptor_sets,
            min_uniform_buffer_offset_alignment: properties
                .limits
                .min_uniform_buffer_offset_alignment,

            max_compute_workgroup_size: properties.limits.max_compute_work_group_size,
            max_compute_workgroup_invocations: properties.limits.max_compute_work_group_invocations,

            available_extensions,
        }
    }

    /// Check whether the GPU supports everything this layer needs: Vulkan 1.3
    /// core features plus swapchain presentation.
    pub fn meets_requirements(&self) -> bool {
        if !at_least_vulkan_1_3(self.api_version) {
            return false;
        }

        if !self.supports_swapchain {
            return false;
        }

        true
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

/// Core version gate for the 1.3 features this layer depends on.
fn at_least_vulkan_1_3(api_version: u32) -> bool {
    let major = vk::api_version_major(api_version);
    let minor = vk::api_version_minor(api_version);
    major > 1 || (major == 1 && minor >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_capabilities() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "Test Adapter".into(),
            api_version: vk::API_VERSION_1_3,
            driver_version: 1,
            supports_dynamic_rendering: true,
            supports_synchronization2: true,
            supports_swapchain: true,
            device_local_memory_mb: 8192,
            max_memory_allocation_count: 4096,
            max_image_dimension_2d: 16384,
            max_sampler_anisotropy: 16.0,
            max_push_constant_size: 128,
            max_bound_descriptor_sets: 4,
            min_uniform_buffer_offset_alignment: 64,
            max_compute_workgroup_size: [1024, 1024, 64],
            max_compute_workgroup_invocations: 1024,
            available_extensions: HashSet::from(["VK_KHR_swapchain".to_string()]),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn core_version_gate_handles_future_majors() {
        assert!(at_least_vulkan_1_3(vk::API_VERSION_1_3));
        assert!(at_least_vulkan_1_3(vk::make_api_version(0, 1, 4, 0)));
        assert!(at_least_vulkan_1_3(vk::make_api_version(0, 2, 0, 0)));
        assert!(!at_least_vulkan_1_3(vk::API_VERSION_1_2));
        assert!(!at_least_vulkan_1_3(vk::API_VERSION_1_0));
    }

    #[test]
    fn requirements_gate_on_api_version_and_swapchain() {
        let caps = sample_capabilities();
        assert!(caps.meets_requirements());

        let mut old_api = caps.clone();
        old_api.api_version = vk::API_VERSION_1_2;
        assert!(!old_api.meets_requirements());

        let mut headless = caps;
        headless.supports_swapchain = false;
        assert!(!headless.meets_requirements());
    }
}
