//! Presentation layers.
//!
//! A [`Layer`] ties a window surface to a swapchain and hands out one
//! [`Drawable`] per frame. Acquisition blocks on a fence until the image is
//! actually ready, so no acquire semaphore threads through submission; the
//! present call is the only place that waits on GPU work, via the command
//! buffer's submit semaphore.

use std::sync::Arc;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::surface::{SurfaceContext, SurfaceSupport};
use crate::sync;
use crate::texture::{Texture, TextureUsage};

/// Parameters for [`crate::Device::make_layer`]. Width and height are only a
/// fallback for surfaces that do not report a fixed extent.
#[derive(Debug, Clone, Copy)]
pub struct LayerDescription {
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for LayerDescription {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            vsync: true,
        }
    }
}

impl LayerDescription {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Self::default()
        }
    }

    pub fn vsync(mut self, vsync: bool) -> Self {
        self.vsync = vsync;
        self
    }
}

/// One swapchain image handed out for a single frame.
///
/// Deliberately neither `Clone` nor `Copy`: presenting consumes the value,
/// so an image cannot be presented twice or kept around after presentation.
pub struct Drawable {
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) index: u32,
    extent: vk::Extent2D,
    format: vk::Format,
}

impl Drawable {
    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }
}

/// A presentable surface with its swapchain.
pub struct Layer {
    device: Arc<ash::Device>,
    surface: SurfaceContext,
    swapchain: vk::SwapchainKHR,
    // Swapchain images wrapped as textures with no owned memory; only their
    // views belong to us.
    textures: Vec<Texture>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
    vsync: bool,
    acquire_fence: vk::Fence,
}

impl Layer {
    /// # Safety
    /// The device and surface must be valid.
    pub(crate) unsafe fn new(
        device: Arc<ash::Device>,
        surface: SurfaceContext,
        desc: &LayerDescription,
    ) -> Result<Self> {
        let support = surface.query_support()?;
        let built = match build_swapchain(
            &device,
            &surface,
            &support,
            desc.width,
            desc.height,
            desc.vsync,
        ) {
            Ok(built) => built,
            Err(e) => {
                surface.destroy();
                return Err(e);
            }
        };

        let acquire_fence = match sync::create_fence(&device, false) {
            Ok(fence) => fence,
            Err(e) => {
                destroy_swapchain_textures(&device, &surface, built.textures, built.swapchain);
                surface.destroy();
                return Err(e);
            }
        };

        tracing::debug!(
            width = built.extent.width,
            height = built.extent.height,
            format = ?built.format,
            present_mode = ?built.present_mode,
            images = built.textures.len(),
            "Created layer"
        );

        Ok(Self {
            device,
            surface,
            swapchain: built.swapchain,
            textures: built.textures,
            format: built.format,
            extent: built.extent,
            present_mode: built.present_mode,
            vsync: desc.vsync,
            acquire_fence,
        })
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn image_count(&self) -> usize {
        self.textures.len()
    }

    /// Acquire the next swapchain image, blocking until it is ready to
    /// record against.
    ///
    /// Returns [`GpuError::SwapchainOutOfDate`] when the surface has changed
    /// underneath the swapchain; call [`Layer::rebuild`] and try again.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn next_drawable(&mut self) -> Result<Drawable> {
        unsafe {
            sync::reset_fence(&self.device, self.acquire_fence)?;

            let result = self.surface.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                vk::Semaphore::null(),
                self.acquire_fence,
            );

            let (index, suboptimal) = match result {
                Ok(pair) => pair,
                // No image was acquired; the caller must rebuild.
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    return Err(GpuError::SwapchainOutOfDate)
                }
                Err(e) => return Err(e.into()),
            };

            // The image index arrives before the image is usable. Blocking
            // here is what lets submission skip acquire semaphores entirely.
            sync::wait_for_fence(&self.device, self.acquire_fence, u64::MAX)?;

            if suboptimal {
                tracing::warn!("Swapchain is suboptimal, consider rebuilding the layer");
            }

            let texture = &self.textures[index as usize];
            Ok(Drawable {
                image: texture.image,
                view: texture.view,
                index,
                extent: self.extent,
                format: self.format,
            })
        }
    }

    /// Present a drawable. Returns `Ok(true)` when the swapchain should be
    /// rebuilt, matching the acquire side's out-of-date signal.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub(crate) fn present_drawable(
        &mut self,
        queue: vk::Queue,
        drawable: Drawable,
        wait_semaphore: vk::Semaphore,
    ) -> Result<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [drawable.index];
        let wait_semaphores = [wait_semaphore];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe {
            self.surface
                .swapchain_loader
                .queue_present(queue, &present_info)
        };

        match result {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Tear the swapchain down and build a fresh one at the new size.
    ///
    /// Waits for the device to go idle first, so pending frames that still
    /// reference the old images retire before their views are destroyed.
    pub fn rebuild(&mut self, width: u32, height: u32) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;

            let old_textures = std::mem::take(&mut self.textures);
            destroy_swapchain_textures(&self.device, &self.surface, old_textures, self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();

            let support = self.surface.query_support()?;
            let built = build_swapchain(
                &self.device,
                &self.surface,
                &support,
                width,
                height,
                self.vsync,
            )?;

            tracing::debug!(
                width = built.extent.width,
                height = built.extent.height,
                "Rebuilt layer swapchain"
            );

            self.swapchain = built.swapchain;
            self.textures = built.textures;
            self.format = built.format;
            self.extent = built.extent;
            self.present_mode = built.present_mode;
        }
        Ok(())
    }

    /// Destroy the swapchain, views, fence, and surface.
    ///
    /// # Safety
    /// No frame may still reference the layer; the caller waits for idle.
    pub(crate) unsafe fn destroy(&mut self) {
        let textures = std::mem::take(&mut self.textures);
        destroy_swapchain_textures(&self.device, &self.surface, textures, self.swapchain);
        self.device.destroy_fence(self.acquire_fence, None);
        self.surface.destroy();
    }
}

struct BuiltSwapchain {
    swapchain: vk::SwapchainKHR,
    textures: Vec<Texture>,
    format: vk::Format,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,
}

unsafe fn build_swapchain(
    device: &ash::Device,
    surface: &SurfaceContext,
    support: &SurfaceSupport,
    width: u32,
    height: u32,
    vsync: bool,
) -> Result<BuiltSwapchain> {
    let surface_format = select_surface_format(&support.formats);
    let present_mode = select_present_mode(&support.present_modes, vsync);
    let extent = calculate_extent(&support.capabilities, width, height);
    let image_count = select_image_count(&support.capabilities);

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface.surface)
        .min_image_count(image_count)
        .image_format(surface_format.format)
        .image_color_space(surface_format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(support.capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true);

    let swapchain = surface
        .swapchain_loader
        .create_swapchain(&create_info, None)
        .map_err(|e| GpuError::SwapchainCreation(e.to_string()))?;

    let images = match surface.swapchain_loader.get_swapchain_images(swapchain) {
        Ok(images) => images,
        Err(e) => {
            surface.swapchain_loader.destroy_swapchain(swapchain, None);
            return Err(e.into());
        }
    };

    let mut textures: Vec<Texture> = Vec::with_capacity(images.len());
    for image in images {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(surface_format.format)
            .components(vk::ComponentMapping::default())
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .base_mip_level(0)
                    .level_count(1)
                    .base_array_layer(0)
                    .layer_count(1),
            );

        let view = match device.create_image_view(&view_info, None) {
            Ok(view) => view,
            Err(e) => {
                for texture in &textures {
                    device.destroy_image_view(texture.view, None);
                }
                surface.swapchain_loader.destroy_swapchain(swapchain, None);
                return Err(e.into());
            }
        };

        // memory: None marks the image as swapchain-owned; only the view is
        // ever destroyed.
        textures.push(Texture {
            image,
            view,
            memory: None,
            format: surface_format.format,
            extent,
            usage: TextureUsage::COLOR_ATTACHMENT | TextureUsage::TRANSFER_DST,
            mip_levels: 1,
        });
    }

    Ok(BuiltSwapchain {
        swapchain,
        textures,
        format: surface_format.format,
        extent,
        present_mode,
    })
}

unsafe fn destroy_swapchain_textures(
    device: &ash::Device,
    surface: &SurfaceContext,
    textures: Vec<Texture>,
    swapchain: vk::SwapchainKHR,
) {
    for texture in textures {
        device.destroy_image_view(texture.view, None);
    }
    if swapchain != vk::SwapchainKHR::null() {
        surface.swapchain_loader.destroy_swapchain(swapchain, None);
    }
}

/// Prefer SRGB, fall back to whatever the surface lists first.
fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for format in available {
        if format.format == vk::Format::B8G8R8A8_SRGB
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }

    available[0]
}

/// FIFO under vsync; otherwise mailbox, then immediate, then the FIFO
/// fallback every implementation provides.
fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }

    for &mode in available {
        if mode == vk::PresentModeKHR::MAILBOX {
            return mode;
        }
    }
    for &mode in available {
        if mode == vk::PresentModeKHR::IMMEDIATE {
            return mode;
        }
    }
    vk::PresentModeKHR::FIFO
}

/// The surface dictates the extent unless it reports the "window decides"
/// sentinel, in which case the requested size is clamped to the allowed
/// range.
fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum so acquire rarely blocks on the compositor,
/// clamped when the surface caps the count.
fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 && image_count > capabilities.max_image_count {
        image_count = capabilities.max_image_count;
    }
    image_count
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capabilities(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    #[test]
    fn srgb_format_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::R8G8B8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        let chosen = select_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
    }

    #[test]
    fn first_format_wins_without_srgb() {
        let formats = [vk::SurfaceFormatKHR {
            format: vk::Format::R16G16B16A16_SFLOAT,
            color_space: vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT,
        }];
        let chosen = select_surface_format(&formats);
        assert_eq!(chosen.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn vsync_always_picks_fifo() {
        let modes = [
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn uncapped_prefers_mailbox_then_immediate() {
        let with_mailbox = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            select_present_mode(&with_mailbox, false),
            vk::PresentModeKHR::MAILBOX
        );

        let with_immediate = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE];
        assert_eq!(
            select_present_mode(&with_immediate, false),
            vk::PresentModeKHR::IMMEDIATE
        );

        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            select_present_mode(&fifo_only, false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn surface_extent_wins_when_fixed() {
        let caps = capabilities((800, 600), (1, 1), (4096, 4096));
        let extent = calculate_extent(&caps, 1920, 1080);
        assert_eq!(extent.width, 800);
        assert_eq!(extent.height, 600);
    }

    #[test]
    fn requested_extent_clamps_under_sentinel() {
        let caps = capabilities((u32::MAX, u32::MAX), (640, 480), (1920, 1080));
        let extent = calculate_extent(&caps, 4000, 100);
        assert_eq!(extent.width, 1920);
        assert_eq!(extent.height, 480);
    }

    #[test]
    fn image_count_is_min_plus_one_within_caps() {
        let uncapped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(select_image_count(&uncapped), 3);

        let capped = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 3,
            ..Default::default()
        };
        assert_eq!(select_image_count(&capped), 3);
    }
}
