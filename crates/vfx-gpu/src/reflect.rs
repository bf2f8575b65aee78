//! SPIR-V reflection.
//!
//! Pipeline and resource-group layouts are derived from the shaders
//! themselves instead of hand-written binding tables. Reflection runs once
//! when a library is created and the results are cached on it.

use ash::vk;

use crate::error::{GpuError, Result};

/// A descriptor the shader declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderBinding {
    pub name: String,
    pub set: u32,
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    /// Array length, 1 for scalars.
    pub count: u32,
}

/// A push constant block the shader declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantBlock {
    pub name: String,
    pub size: u32,
}

/// One entry point of a shader library.
#[derive(Debug, Clone)]
pub struct EntryPoint {
    pub name: String,
    pub stage: vk::ShaderStageFlags,
    pub bindings: Vec<ShaderBinding>,
    pub push_constants: Vec<PushConstantBlock>,
}

/// Reflect every entry point of a SPIR-V module.
pub fn reflect_spirv(code: &[u32]) -> Result<Vec<EntryPoint>> {
    let reflected = spirq::ReflectConfig::new()
        .spv(code)
        .ref_all_rscs(true)
        .reflect()
        .map_err(|e| GpuError::ShaderReflection(format!("SPIR-V reflection failed: {e:?}")))?;

    if reflected.is_empty() {
        return Err(GpuError::ShaderReflection(
            "Module declares no entry points".to_string(),
        ));
    }

    reflected
        .iter()
        .map(|entry| {
            let stage = stage_for_exec_model(entry.exec_model)?;

            let mut bindings = Vec::new();
            let mut push_constants = Vec::new();
            for var in &entry.vars {
                match var {
                    spirq::var::Variable::Descriptor {
                        name,
                        desc_bind,
                        desc_ty,
                        nbind,
                        ..
                    } => {
                        bindings.push(ShaderBinding {
                            name: name.clone().unwrap_or_default(),
                            set: desc_bind.set(),
                            binding: desc_bind.bind(),
                            descriptor_type: descriptor_type_for(desc_ty)?,
                            count: *nbind,
                        });
                    }
                    spirq::var::Variable::PushConstant { name, ty } => {
                        let size = ty.nbyte().ok_or_else(|| {
                            GpuError::ShaderReflection(
                                "Push constant block has no fixed size".to_string(),
                            )
                        })?;
                        push_constants.push(PushConstantBlock {
                            name: name.clone().unwrap_or_default(),
                            size: size as u32,
                        });
                    }
                    _ => {}
                }
            }

            bindings.sort_by_key(|b| (b.set, b.binding));

            Ok(EntryPoint {
                name: entry.name.clone(),
                stage,
                bindings,
                push_constants,
            })
        })
        .collect()
}

fn stage_for_exec_model(model: spirq::spirv::ExecutionModel) -> Result<vk::ShaderStageFlags> {
    use spirq::spirv::ExecutionModel;

    match model {
        ExecutionModel::Vertex => Ok(vk::ShaderStageFlags::VERTEX),
        ExecutionModel::Fragment => Ok(vk::ShaderStageFlags::FRAGMENT),
        ExecutionModel::GLCompute => Ok(vk::ShaderStageFlags::COMPUTE),
        other => Err(GpuError::ShaderReflection(format!(
            "Unsupported execution model: {other:?}"
        ))),
    }
}

fn descriptor_type_for(desc_ty: &spirq::ty::DescriptorType) -> Result<vk::DescriptorType> {
    use spirq::ty::DescriptorType;

    match desc_ty {
        DescriptorType::UniformBuffer() => Ok(vk::DescriptorType::UNIFORM_BUFFER),
        DescriptorType::StorageBuffer(..) => Ok(vk::DescriptorType::STORAGE_BUFFER),
        DescriptorType::CombinedImageSampler() => Ok(vk::DescriptorType::COMBINED_IMAGE_SAMPLER),
        DescriptorType::SampledImage() => Ok(vk::DescriptorType::SAMPLED_IMAGE),
        DescriptorType::Sampler() => Ok(vk::DescriptorType::SAMPLER),
        DescriptorType::StorageImage(..) => Ok(vk::DescriptorType::STORAGE_IMAGE),
        other => Err(GpuError::ShaderReflection(format!(
            "Unsupported descriptor type: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graphics_and_compute_stages_map() {
        use spirq::spirv::ExecutionModel;

        assert_eq!(
            stage_for_exec_model(ExecutionModel::Vertex).unwrap(),
            vk::ShaderStageFlags::VERTEX
        );
        assert_eq!(
            stage_for_exec_model(ExecutionModel::Fragment).unwrap(),
            vk::ShaderStageFlags::FRAGMENT
        );
        assert_eq!(
            stage_for_exec_model(ExecutionModel::GLCompute).unwrap(),
            vk::ShaderStageFlags::COMPUTE
        );
    }

    #[test]
    fn geometry_stage_is_rejected() {
        use spirq::spirv::ExecutionModel;

        assert!(stage_for_exec_model(ExecutionModel::Geometry).is_err());
    }

    #[test]
    fn descriptor_kinds_map() {
        use spirq::ty::DescriptorType;

        assert_eq!(
            descriptor_type_for(&DescriptorType::UniformBuffer()).unwrap(),
            vk::DescriptorType::UNIFORM_BUFFER
        );
        assert_eq!(
            descriptor_type_for(&DescriptorType::CombinedImageSampler()).unwrap(),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(
            descriptor_type_for(&DescriptorType::SampledImage()).unwrap(),
            vk::DescriptorType::SAMPLED_IMAGE
        );
        assert_eq!(
            descriptor_type_for(&DescriptorType::Sampler()).unwrap(),
            vk::DescriptorType::SAMPLER
        );
    }

    #[test]
    fn acceleration_structures_are_rejected() {
        use spirq::ty::DescriptorType;

        assert!(descriptor_type_for(&DescriptorType::AccelStruct()).is_err());
    }
}
