//! Vulkan instance creation, physical device selection and the validation
//! message pump.

use std::ffi::{c_void, CStr, CString};

use ash::vk;

use crate::error::{GpuError, Result};

/// Instance extensions required for presenting to a window.
pub fn required_instance_extensions(enable_validation: bool) -> Vec<&'static CStr> {
    let mut extensions = vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ];

    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME);
    }

    extensions
}

/// Validation layers requested when validation is enabled.
pub fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|_| GpuError::InvalidState("application name contains a NUL byte".into()))?;
    let engine_name = c"vfx";

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let extension_names: Vec<*const i8> = required_instance_extensions(enable_validation)
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Missing layers are reported but not fatal; the instance still works
    // without them.
    let available_layers = entry.enumerate_instance_layer_properties()?;
    let layers: Vec<&CStr> = layers
        .into_iter()
        .filter(|layer| {
            let found = available_layers
                .iter()
                .any(|props| unsafe { CStr::from_ptr(props.layer_name.as_ptr()) } == *layer);
            if !found {
                tracing::warn!("Validation layer {:?} not available", layer);
            }
            found
        })
        .collect();
    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Install a debug-utils messenger that forwards validation output to
/// `tracing`.
///
/// # Safety
/// The instance must have been created with the debug-utils extension.
pub unsafe fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = loader.create_debug_utils_messenger(&create_info, None)?;

    Ok((loader, messenger))
}

/// Loader and driver chatter that is expected on healthy systems and only
/// drowns out real validation output.
const BENIGN_MESSAGE_FRAGMENTS: &[&str] = &[
    "loader_scanned_icd_add",
    "terminator_CreateInstance",
    "VK_KHR_portability_subset",
];

fn is_benign(message: &str) -> bool {
    BENIGN_MESSAGE_FRAGMENTS
        .iter()
        .any(|fragment| message.contains(fragment))
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    // Logging from inside an unwinding thread aborts the process.
    if std::thread::panicking() {
        return vk::FALSE;
    }

    let message = if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    } else {
        CStr::from_ptr((*p_callback_data).p_message).to_string_lossy()
    };

    if is_benign(&message) {
        return vk::FALSE;
    }

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vfx_gpu::validation", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vfx_gpu::validation", "{message}");
    } else {
        tracing::trace!(target: "vfx_gpu::validation", "{message}");
    }

    vk::FALSE
}

/// Select the best physical device.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(instance: &ash::Instance) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;

    if devices.is_empty() {
        return Err(GpuError::NoSuitableDevice);
    }

    let mut best_device = None;
    let mut best_score = 0i32;

    for device in devices {
        let score = score_physical_device(instance, device);
        if score > best_score {
            best_score = score;
            best_device = Some(device);
        }
    }

    best_device.ok_or(GpuError::NoSuitableDevice)
}

/// Score a physical device for selection.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    // Everything here requires Vulkan 1.3.
    let api_version = properties.api_version;
    if vk::api_version_major(api_version) < 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) < 3)
    {
        return -1;
    }

    let mut score = 0;

    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // +1 per GB of device-local memory
    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32;

    score
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_noise_is_filtered() {
        assert!(is_benign(
            "loader_scanned_icd_add: Driver /usr/lib/libvulkan_radeon.so"
        ));
        assert!(is_benign(
            "terminator_CreateInstance: Received return code -3 from ICD"
        ));
        assert!(is_benign(
            "vkCreateDevice: VK_KHR_portability_subset must be enabled"
        ));
    }

    #[test]
    fn real_validation_messages_pass() {
        assert!(!is_benign(
            "Validation Error: vkCmdDraw(): no pipeline bound"
        ));
        assert!(!is_benign(""));
    }

    #[test]
    fn surface_extension_always_requested() {
        let extensions = required_instance_extensions(false);
        assert!(extensions.contains(&ash::khr::surface::NAME));
        assert!(!extensions.contains(&ash::ext::debug_utils::NAME));

        let with_validation = required_instance_extensions(true);
        assert!(with_validation.contains(&ash::ext::debug_utils::NAME));
    }
}
