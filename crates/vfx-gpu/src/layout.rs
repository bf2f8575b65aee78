//! Descriptor layout planning.
//!
//! Pipelines derive their descriptor-set and push-constant layouts by
//! merging the reflection data of every stage. The merge is pure data work
//! with no Vulkan objects involved, so it is fully covered by unit tests;
//! realizing the plan into `vk::DescriptorSetLayout`s happens at pipeline
//! creation.

use ash::vk;

use crate::error::{GpuError, Result};
use crate::reflect::{PushConstantBlock, ShaderBinding};

/// One binding of one descriptor set, with the union of the stages that
/// declare it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingSlot {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// Merged layout of a whole pipeline.
///
/// `sets` is indexed by set number. Set numbers a shader skips leave empty
/// entries, which become zero-binding layouts so the remaining indices keep
/// their meaning.
#[derive(Debug, Clone, Default)]
pub struct LayoutPlan {
    pub sets: Vec<Vec<BindingSlot>>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl LayoutPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one stage's reflection into the plan.
    ///
    /// Two stages may declare the same (set, binding) only with an identical
    /// descriptor type and count; the slot then carries both stage flags.
    /// Anything else is a conflict the shaders have to resolve.
    pub fn add_stage(
        &mut self,
        stage: vk::ShaderStageFlags,
        bindings: &[ShaderBinding],
        push_constants: &[PushConstantBlock],
    ) -> Result<()> {
        for binding in bindings {
            let set = binding.set as usize;
            if self.sets.len() <= set {
                self.sets.resize_with(set + 1, Vec::new);
            }

            let slots = &mut self.sets[set];
            match slots.iter_mut().find(|s| s.binding == binding.binding) {
                Some(slot) => {
                    if slot.descriptor_type != binding.descriptor_type
                        || slot.count != binding.count
                    {
                        return Err(GpuError::PipelineCreation(format!(
                            "Conflicting declarations for set {} binding {}: \
                             {:?} x{} vs {:?} x{}",
                            binding.set,
                            binding.binding,
                            slot.descriptor_type,
                            slot.count,
                            binding.descriptor_type,
                            binding.count,
                        )));
                    }
                    slot.stages |= stage;
                }
                None => {
                    slots.push(BindingSlot {
                        binding: binding.binding,
                        descriptor_type: binding.descriptor_type,
                        count: binding.count,
                        stages: stage,
                    });
                    slots.sort_by_key(|s| s.binding);
                }
            }
        }

        for block in push_constants {
            self.add_push_constant(stage, block.size);
        }

        Ok(())
    }

    // Each stage owns its own constant-offset space, so ranges accumulate
    // per stage and never merge across stages. A stage appears in at most
    // one range; repeated blocks widen it.
    fn add_push_constant(&mut self, stage: vk::ShaderStageFlags, size: u32) {
        match self
            .push_constant_ranges
            .iter_mut()
            .find(|range| range.stage_flags == stage)
        {
            Some(range) => range.size = range.size.max(size),
            None => self.push_constant_ranges.push(vk::PushConstantRange {
                stage_flags: stage,
                offset: 0,
                size,
            }),
        }
    }

    /// Bindings of one set, if the plan has that set number.
    pub fn set_slots(&self, set: u32) -> Option<&[BindingSlot]> {
        self.sets.get(set as usize).map(Vec::as_slice)
    }

    /// Stage union of every push constant range.
    pub fn push_constant_stages(&self) -> vk::ShaderStageFlags {
        self.push_constant_ranges
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, range| {
                acc | range.stage_flags
            })
    }

    /// Total descriptors of each type across all sets, for pool sizing.
    pub fn descriptor_counts(&self) -> Vec<(vk::DescriptorType, u32)> {
        let mut counts: Vec<(vk::DescriptorType, u32)> = Vec::new();
        for slot in self.sets.iter().flatten() {
            match counts.iter_mut().find(|(ty, _)| *ty == slot.descriptor_type) {
                Some((_, count)) => *count += slot.count,
                None => counts.push((slot.descriptor_type, slot.count)),
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(set: u32, slot: u32, ty: vk::DescriptorType, count: u32) -> ShaderBinding {
        ShaderBinding {
            name: String::new(),
            set,
            binding: slot,
            descriptor_type: ty,
            count,
        }
    }

    #[test]
    fn stages_accumulate_distinct_bindings() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            &[binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1)],
            &[],
        )
        .unwrap();
        plan.add_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[binding(0, 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1)],
            &[],
        )
        .unwrap();

        assert_eq!(plan.sets.len(), 1);
        let slots = plan.set_slots(0).unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].stages, vk::ShaderStageFlags::VERTEX);
        assert_eq!(slots[1].stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn identical_bindings_union_their_stages() {
        let mut plan = LayoutPlan::new();
        let ubo = binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1);
        plan.add_stage(vk::ShaderStageFlags::VERTEX, &[ubo.clone()], &[])
            .unwrap();
        plan.add_stage(vk::ShaderStageFlags::FRAGMENT, &[ubo], &[])
            .unwrap();

        let slots = plan.set_slots(0).unwrap();
        assert_eq!(slots.len(), 1);
        assert_eq!(
            slots[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn type_conflicts_are_rejected() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            &[binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1)],
            &[],
        )
        .unwrap();

        let result = plan.add_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[binding(0, 0, vk::DescriptorType::STORAGE_BUFFER, 1)],
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn count_conflicts_are_rejected() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            &[binding(0, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1)],
            &[],
        )
        .unwrap();

        let result = plan.add_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[binding(0, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4)],
            &[],
        );
        assert!(result.is_err());
    }

    #[test]
    fn skipped_set_numbers_leave_empty_sets() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::COMPUTE,
            &[
                binding(0, 0, vk::DescriptorType::STORAGE_BUFFER, 1),
                binding(2, 0, vk::DescriptorType::STORAGE_IMAGE, 1),
            ],
            &[],
        )
        .unwrap();

        assert_eq!(plan.sets.len(), 3);
        assert!(plan.set_slots(1).unwrap().is_empty());
        assert_eq!(plan.set_slots(2).unwrap().len(), 1);
    }

    #[test]
    fn stages_with_disjoint_sets_cover_the_union() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            &[
                binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1),
                binding(1, 0, vk::DescriptorType::STORAGE_BUFFER, 1),
            ],
            &[],
        )
        .unwrap();
        plan.add_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[
                binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1),
                binding(2, 0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
            ],
            &[],
        )
        .unwrap();

        assert_eq!(plan.sets.len(), 3);
        assert_eq!(
            plan.set_slots(0).unwrap()[0].stages,
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            plan.set_slots(1).unwrap()[0].stages,
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            plan.set_slots(2).unwrap()[0].stages,
            vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn push_constant_ranges_stay_per_stage() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            &[],
            &[PushConstantBlock {
                name: "pc".to_string(),
                size: 64,
            }],
        )
        .unwrap();
        plan.add_stage(
            vk::ShaderStageFlags::FRAGMENT,
            &[],
            &[PushConstantBlock {
                name: "pc".to_string(),
                size: 80,
            }],
        )
        .unwrap();

        // One range per stage even when the extents would allow sharing.
        assert_eq!(plan.push_constant_ranges.len(), 2);
        let vertex = plan
            .push_constant_ranges
            .iter()
            .find(|r| r.stage_flags == vk::ShaderStageFlags::VERTEX)
            .unwrap();
        assert_eq!(vertex.size, 64);
        assert_eq!(vertex.offset, 0);
        let fragment = plan
            .push_constant_ranges
            .iter()
            .find(|r| r.stage_flags == vk::ShaderStageFlags::FRAGMENT)
            .unwrap();
        assert_eq!(fragment.size, 80);
        assert_eq!(
            plan.push_constant_stages(),
            vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT
        );
    }

    #[test]
    fn repeated_blocks_widen_a_stage_range() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::COMPUTE,
            &[],
            &[
                PushConstantBlock {
                    name: "small".to_string(),
                    size: 48,
                },
                PushConstantBlock {
                    name: "large".to_string(),
                    size: 64,
                },
            ],
        )
        .unwrap();

        assert_eq!(plan.push_constant_ranges.len(), 1);
        assert_eq!(plan.push_constant_ranges[0].size, 64);
    }

    #[test]
    fn descriptor_counts_sum_across_sets() {
        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            &[
                binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, 1),
                binding(1, 0, vk::DescriptorType::UNIFORM_BUFFER, 2),
                binding(1, 1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1),
            ],
            &[],
        )
        .unwrap();

        let counts = plan.descriptor_counts();
        assert!(counts.contains(&(vk::DescriptorType::UNIFORM_BUFFER, 3)));
        assert!(counts.contains(&(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 1)));
    }
}
