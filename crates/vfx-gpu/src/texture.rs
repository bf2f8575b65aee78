//! Texture resources.

use ash::vk;

use crate::buffer::{BufferDescription, BufferUsage};
use crate::command::CommandQueue;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::memory::MemoryIndex;

bitflags::bitflags! {
    /// How a texture will be used.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const STORAGE = 1 << 1;
        const COLOR_ATTACHMENT = 1 << 2;
        const DEPTH_ATTACHMENT = 1 << 3;
        const TRANSFER_SRC = 1 << 4;
        const TRANSFER_DST = 1 << 5;
    }
}

impl TextureUsage {
    pub(crate) fn to_vk(self) -> vk::ImageUsageFlags {
        let mut flags = vk::ImageUsageFlags::empty();
        if self.contains(Self::SAMPLED) {
            flags |= vk::ImageUsageFlags::SAMPLED;
        }
        if self.contains(Self::STORAGE) {
            flags |= vk::ImageUsageFlags::STORAGE;
        }
        if self.contains(Self::COLOR_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
        if self.contains(Self::DEPTH_ATTACHMENT) {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        }
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        flags
    }
}

/// Image aspect implied by a format.
pub(crate) fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

/// Bytes per texel for formats that support tightly packed CPU uploads.
/// Compressed and depth formats return `None`.
pub(crate) fn format_texel_size(format: vk::Format) -> Option<u32> {
    let size = match format {
        vk::Format::R8_UNORM | vk::Format::R8_SNORM | vk::Format::R8_UINT | vk::Format::R8_SINT => {
            1
        }
        vk::Format::R8G8_UNORM | vk::Format::R8G8_SNORM | vk::Format::R16_SFLOAT => 2,
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_SNORM
        | vk::Format::R8G8B8A8_UINT
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R16G16_SFLOAT
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::A2B10G10R10_UNORM_PACK32
        | vk::Format::B10G11R11_UFLOAT_PACK32 => 4,
        vk::Format::R16G16B16A16_SFLOAT | vk::Format::R32G32_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => 16,
        _ => return None,
    };
    Some(size)
}

/// Parameters for [`Device::make_texture`].
#[derive(Debug, Clone)]
pub struct TextureDescription<'a> {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: TextureUsage,
    pub mip_levels: u32,
    /// Name shown in allocator reports and validation output.
    pub label: &'a str,
}

impl<'a> TextureDescription<'a> {
    pub fn new(width: u32, height: u32, format: vk::Format, usage: TextureUsage) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            mip_levels: 1,
            label: "texture",
        }
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn label(mut self, label: &'a str) -> Self {
        self.label = label;
        self
    }
}

/// A 2D image plus its default view.
///
/// `memory` is `None` for images the device does not own, such as swapchain
/// images. Freeing those destroys the view but leaves the image alone.
pub struct Texture {
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) memory: Option<MemoryIndex>,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent2D,
    pub(crate) usage: TextureUsage,
    pub(crate) mip_levels: u32,
}

impl Texture {
    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    /// Upload tightly packed texel data to the base mip level through a
    /// staging buffer, leaving the whole image in a shader-readable layout.
    ///
    /// Blocks until the copy completes. The texture needs `TRANSFER_DST`
    /// usage and a format with a known texel size.
    pub fn update(&self, device: &Device, queue: &CommandQueue, data: &[u8]) -> Result<()> {
        if !self.usage.contains(TextureUsage::TRANSFER_DST) {
            return Err(GpuError::InvalidState(
                "Texture was not created with TRANSFER_DST usage".to_string(),
            ));
        }

        let texel_size = format_texel_size(self.format).ok_or_else(|| {
            GpuError::InvalidState(format!("Format {:?} does not support CPU uploads", self.format))
        })?;

        let expected = u64::from(self.extent.width) * u64::from(self.extent.height)
            * u64::from(texel_size);
        if data.len() as u64 != expected {
            return Err(GpuError::InvalidState(format!(
                "Upload of {} bytes does not match {}x{} texels of {} bytes",
                data.len(),
                self.extent.width,
                self.extent.height,
                texel_size
            )));
        }

        let staging = device.make_buffer(
            &BufferDescription::new(expected, BufferUsage::TRANSFER_SRC).label("texture staging"),
        )?;
        if let Err(e) = staging.update(device, data, 0) {
            if let Err(free_err) = device.free_buffer(staging) {
                tracing::warn!("Failed to release staging buffer after write failure: {free_err}");
            }
            return Err(e);
        }

        let aspect = aspect_for_format(self.format);
        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(aspect)
            .base_mip_level(0)
            .level_count(self.mip_levels)
            .base_array_layer(0)
            .layer_count(1);

        // Shader-sampled is the common case; storage-only images end up in
        // GENERAL instead.
        let final_layout = if self.usage.contains(TextureUsage::SAMPLED) {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::GENERAL
        };

        let result = queue.submit_one_shot(|raw, cmd| {
            let to_transfer = vk::ImageMemoryBarrier2::default()
                .image(self.image)
                .subresource_range(range)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_stage_mask(vk::PipelineStageFlags2::TOP_OF_PIPE)
                .src_access_mask(vk::AccessFlags2::empty())
                .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE);
            let barriers = [to_transfer];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { raw.cmd_pipeline_barrier2(cmd, &dependency) };

            let region = vk::BufferImageCopy::default()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(
                    vk::ImageSubresourceLayers::default()
                        .aspect_mask(aspect)
                        .mip_level(0)
                        .base_array_layer(0)
                        .layer_count(1),
                )
                .image_extent(vk::Extent3D {
                    width: self.extent.width,
                    height: self.extent.height,
                    depth: 1,
                });
            unsafe {
                raw.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            let to_final = vk::ImageMemoryBarrier2::default()
                .image(self.image)
                .subresource_range(range)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(final_layout)
                .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
                .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
                .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                .dst_access_mask(vk::AccessFlags2::MEMORY_READ);
            let barriers = [to_final];
            let dependency = vk::DependencyInfo::default().image_memory_barriers(&barriers);
            unsafe { raw.cmd_pipeline_barrier2(cmd, &dependency) };
        });

        // The one-shot waited for the queue, so the staging buffer is idle.
        device.free_buffer(staging)?;

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn color_formats_use_color_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::R8G8B8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
        assert_eq!(
            aspect_for_format(vk::Format::B8G8R8A8_UNORM),
            vk::ImageAspectFlags::COLOR
        );
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D32_SFLOAT),
            vk::ImageAspectFlags::DEPTH
        );
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn texel_sizes_for_upload_formats() {
        assert_eq!(format_texel_size(vk::Format::R8_UNORM), Some(1));
        assert_eq!(format_texel_size(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(format_texel_size(vk::Format::R16G16B16A16_SFLOAT), Some(8));
        assert_eq!(format_texel_size(vk::Format::R32G32B32A32_SFLOAT), Some(16));
        // No tightly packed CPU layout for these.
        assert_eq!(format_texel_size(vk::Format::D32_SFLOAT), None);
        assert_eq!(format_texel_size(vk::Format::BC7_SRGB_BLOCK), None);
    }

    #[test]
    fn usage_maps_to_vulkan_flags() {
        let flags = (TextureUsage::SAMPLED | TextureUsage::TRANSFER_DST).to_vk();
        assert!(flags.contains(vk::ImageUsageFlags::SAMPLED));
        assert!(flags.contains(vk::ImageUsageFlags::TRANSFER_DST));
        assert!(!flags.contains(vk::ImageUsageFlags::STORAGE));

        let depth = TextureUsage::DEPTH_ATTACHMENT.to_vk();
        assert!(depth.contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));
    }
}
