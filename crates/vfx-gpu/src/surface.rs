//! Surface plumbing for windowed presentation.
//!
//! Wraps the Vulkan surface and the two extension loaders a layer needs,
//! hiding the raw-window-handle details from the rest of the crate.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::error::{GpuError, Result};

pub(crate) struct SurfaceContext {
    pub(crate) surface: vk::SurfaceKHR,
    pub(crate) surface_loader: ash::khr::surface::Instance,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
    physical_device: vk::PhysicalDevice,
}

impl SurfaceContext {
    /// Create a surface for a window.
    ///
    /// # Safety
    /// The entry, instance, and device must be valid; the window must
    /// outlive the surface.
    pub(crate) unsafe fn from_window<W>(
        entry: &ash::Entry,
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
        window: &W,
    ) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        let surface = ash_window::create_surface(
            entry,
            instance,
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(entry, instance);
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, device);

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
            physical_device,
        })
    }

    /// Query what the surface supports on this device.
    pub(crate) fn query_support(&self) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)?;

            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)?;

            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// Whether a queue family can present to this surface.
    pub(crate) fn supports_family(&self, family: u32) -> Result<bool> {
        let supported = unsafe {
            self.surface_loader.get_physical_device_surface_support(
                self.physical_device,
                family,
                self.surface,
            )?
        };
        Ok(supported)
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// Every swapchain built on the surface must be destroyed first.
    pub(crate) unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}

/// Surface support query result.
pub(crate) struct SurfaceSupport {
    pub(crate) capabilities: vk::SurfaceCapabilitiesKHR,
    pub(crate) formats: Vec<vk::SurfaceFormatKHR>,
    pub(crate) present_modes: Vec<vk::PresentModeKHR>,
}
