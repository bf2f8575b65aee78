//! Descriptor set management.

use std::sync::Arc;

use ash::vk;

use crate::buffer::Buffer;
use crate::error::{GpuError, Result};
use crate::layout::{BindingSlot, LayoutPlan};
use crate::sampler::Sampler;
use crate::texture::Texture;

/// Descriptor set layout builder.
struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl DescriptorSetLayoutBuilder<'_> {
    fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    fn slot(mut self, slot: &BindingSlot) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(slot.binding)
                .descriptor_type(slot.descriptor_type)
                .descriptor_count(slot.count)
                .stage_flags(slot.stages),
        );
        self
    }

    /// Build the descriptor set layout. Zero bindings is fine and yields an
    /// empty layout.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

/// Realize a [`LayoutPlan`] into one layout per set number. Gaps in the plan
/// become empty layouts so indices line up with shader set numbers.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_set_layouts(
    device: &ash::Device,
    plan: &LayoutPlan,
) -> Result<Vec<vk::DescriptorSetLayout>> {
    let mut layouts = Vec::with_capacity(plan.sets.len());

    for slots in &plan.sets {
        let mut builder = DescriptorSetLayoutBuilder::new();
        for slot in slots {
            builder = builder.slot(slot);
        }
        match builder.build(device) {
            Ok(layout) => layouts.push(layout),
            Err(e) => {
                for layout in &layouts {
                    device.destroy_descriptor_set_layout(*layout, None);
                }
                return Err(e);
            }
        }
    }

    Ok(layouts)
}

fn check_slot(
    slots: &[BindingSlot],
    set_index: u32,
    binding: u32,
    expected: vk::DescriptorType,
) -> Result<()> {
    match slots.iter().find(|s| s.binding == binding) {
        None => Err(GpuError::InvalidState(format!(
            "Set {set_index} has no binding {binding}"
        ))),
        Some(slot) if slot.descriptor_type != expected => Err(GpuError::InvalidState(format!(
            "Binding {} of set {} is {:?}, not {:?}",
            binding, set_index, slot.descriptor_type, expected
        ))),
        Some(_) => Ok(()),
    }
}

/// One bound descriptor set of a pipeline, backed by its own pool.
///
/// Setters validate against the pipeline's reflected layout and write
/// immediately; there is no flush step. Freed through
/// [`crate::Device::free_resource_group`], which destroys the pool and the
/// set with it.
pub struct ResourceGroup {
    device: Arc<ash::Device>,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
    set_index: u32,
    slots: Vec<BindingSlot>,
}

impl ResourceGroup {
    /// Allocate a descriptor set for `set_index` of `plan`.
    ///
    /// # Safety
    /// The device and set layout must be valid.
    pub(crate) unsafe fn new(
        device: Arc<ash::Device>,
        plan: &LayoutPlan,
        set_layout: vk::DescriptorSetLayout,
        set_index: u32,
    ) -> Result<Self> {
        let slots = plan
            .set_slots(set_index)
            .ok_or_else(|| {
                GpuError::InvalidState(format!(
                    "Pipeline uses {} descriptor sets, set {} does not exist",
                    plan.sets.len(),
                    set_index
                ))
            })?
            .to_vec();

        if slots.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "Set {set_index} has no bindings"
            )));
        }

        let mut pool_sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for slot in &slots {
            match pool_sizes.iter_mut().find(|p| p.ty == slot.descriptor_type) {
                Some(size) => size.descriptor_count += slot.count,
                None => pool_sizes.push(vk::DescriptorPoolSize {
                    ty: slot.descriptor_type,
                    descriptor_count: slot.count,
                }),
            }
        }

        // The pool holds exactly this one set and is destroyed with it, so
        // individual set frees are never needed.
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = device.create_descriptor_pool(&pool_info, None)?;

        let layouts = [set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);

        let set = match device.allocate_descriptor_sets(&alloc_info) {
            Ok(sets) => sets[0],
            Err(e) => {
                device.destroy_descriptor_pool(pool, None);
                return Err(e.into());
            }
        };

        Ok(Self {
            device,
            pool,
            set,
            set_index,
            slots,
        })
    }

    pub fn set_index(&self) -> u32 {
        self.set_index
    }

    pub(crate) fn handle(&self) -> vk::DescriptorSet {
        self.set
    }

    /// Bind a uniform buffer over its whole size.
    pub fn set_buffer(&self, binding: u32, buffer: &Buffer) -> Result<()> {
        check_slot(
            &self.slots,
            self.set_index,
            binding,
            vk::DescriptorType::UNIFORM_BUFFER,
        )?;
        self.write_buffer(binding, vk::DescriptorType::UNIFORM_BUFFER, buffer);
        Ok(())
    }

    /// Bind a storage buffer over its whole size.
    pub fn set_storage_buffer(&self, binding: u32, buffer: &Buffer) -> Result<()> {
        check_slot(
            &self.slots,
            self.set_index,
            binding,
            vk::DescriptorType::STORAGE_BUFFER,
        )?;
        self.write_buffer(binding, vk::DescriptorType::STORAGE_BUFFER, buffer);
        Ok(())
    }

    /// Bind a texture for sampling. The texture must be in the
    /// shader-read-only layout when the set is used.
    pub fn set_texture(&self, binding: u32, texture: &Texture) -> Result<()> {
        check_slot(
            &self.slots,
            self.set_index,
            binding,
            vk::DescriptorType::SAMPLED_IMAGE,
        )?;
        self.write_image(
            binding,
            vk::DescriptorType::SAMPLED_IMAGE,
            texture.view,
            vk::Sampler::null(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        Ok(())
    }

    /// Bind a texture for storage access in the GENERAL layout.
    pub fn set_storage_texture(&self, binding: u32, texture: &Texture) -> Result<()> {
        check_slot(
            &self.slots,
            self.set_index,
            binding,
            vk::DescriptorType::STORAGE_IMAGE,
        )?;
        self.write_image(
            binding,
            vk::DescriptorType::STORAGE_IMAGE,
            texture.view,
            vk::Sampler::null(),
            vk::ImageLayout::GENERAL,
        );
        Ok(())
    }

    /// Bind a standalone sampler.
    pub fn set_sampler(&self, binding: u32, sampler: &Sampler) -> Result<()> {
        check_slot(
            &self.slots,
            self.set_index,
            binding,
            vk::DescriptorType::SAMPLER,
        )?;

        let image_info = vk::DescriptorImageInfo::default().sampler(sampler.handle);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(std::slice::from_ref(&image_info));

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    /// Bind a texture and sampler pair for a combined image sampler, the
    /// form GLSL `sampler2D` uniforms reflect to.
    pub fn set_texture_sampler(
        &self,
        binding: u32,
        texture: &Texture,
        sampler: &Sampler,
    ) -> Result<()> {
        check_slot(
            &self.slots,
            self.set_index,
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        )?;
        self.write_image(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            texture.view,
            sampler.handle,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        Ok(())
    }

    fn write_buffer(&self, binding: u32, ty: vk::DescriptorType, buffer: &Buffer) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(buffer.handle)
            .offset(0)
            .range(vk::WHOLE_SIZE);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .buffer_info(std::slice::from_ref(&buffer_info));

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    fn write_image(
        &self,
        binding: u32,
        ty: vk::DescriptorType,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    ) {
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(view)
            .sampler(sampler)
            .image_layout(layout);

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.set)
            .dst_binding(binding)
            .descriptor_type(ty)
            .image_info(std::slice::from_ref(&image_info));

        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }

    /// Destroy the pool, freeing the set with it.
    ///
    /// # Safety
    /// The device must be valid and the set must not be referenced by any
    /// pending command buffer.
    pub(crate) unsafe fn destroy(&self) {
        self.device.destroy_descriptor_pool(self.pool, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slots() -> Vec<BindingSlot> {
        vec![
            BindingSlot {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX,
            },
            BindingSlot {
                binding: 1,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: 1,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        ]
    }

    #[test]
    fn known_binding_with_matching_type_passes() {
        assert!(check_slot(&slots(), 0, 0, vk::DescriptorType::UNIFORM_BUFFER).is_ok());
        assert!(check_slot(&slots(), 0, 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER).is_ok());
    }

    #[test]
    fn unknown_binding_is_rejected() {
        let result = check_slot(&slots(), 0, 7, vk::DescriptorType::UNIFORM_BUFFER);
        assert!(result.is_err());
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let result = check_slot(&slots(), 0, 0, vk::DescriptorType::STORAGE_BUFFER);
        assert!(result.is_err());
    }
}
