//! Shader libraries and functions.

use std::sync::Arc;

use ash::vk;

use crate::error::{GpuError, Result};
use crate::reflect::{reflect_spirv, EntryPoint, PushConstantBlock, ShaderBinding};

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Convert raw bytes to aligned SPIR-V words (SPIR-V requires 4-byte
/// alignment, `include_bytes!` does not guarantee it).
pub fn spirv_from_bytes(bytes: &[u8]) -> Result<Vec<u32>> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(GpuError::ShaderReflection(format!(
            "SPIR-V byte length {} is not a non-zero multiple of 4",
            bytes.len()
        )));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(GpuError::ShaderReflection(
            "Invalid SPIR-V magic number".to_string(),
        ));
    }

    Ok(words)
}

/// A compiled shader module plus the reflection data for its entry points.
///
/// Libraries are shared: every [`Function`] and pipeline built from one keeps
/// it alive, and the Vulkan module is destroyed when the last reference
/// drops.
pub struct Library {
    device: Arc<ash::Device>,
    pub(crate) module: vk::ShaderModule,
    entries: Vec<EntryPoint>,
}

impl Library {
    /// Reflect the module and upload it to the device. Reflection runs first
    /// so invalid bytecode fails before any Vulkan object exists.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(device: Arc<ash::Device>, code: &[u32]) -> Result<Self> {
        let entries = reflect_spirv(code)?;

        let shader_info = vk::ShaderModuleCreateInfo::default().code(code);
        let module = device.create_shader_module(&shader_info, None)?;

        Ok(Self {
            device,
            module,
            entries,
        })
    }

    /// Names of every entry point in the module.
    pub fn entry_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    /// Look up an entry point by name.
    pub fn function(self: &Arc<Self>, name: &str) -> Result<Function> {
        let entry_index = self
            .entries
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| {
                let available: Vec<&str> = self.entry_names().collect();
                GpuError::ShaderReflection(format!(
                    "No entry point named {name:?} (module has {available:?})"
                ))
            })?;

        Ok(Function {
            library: Arc::clone(self),
            entry_index,
        })
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// One entry point of a [`Library`], the unit pipelines are built from.
#[derive(Clone)]
pub struct Function {
    library: Arc<Library>,
    entry_index: usize,
}

impl Function {
    fn entry(&self) -> &EntryPoint {
        &self.library.entries[self.entry_index]
    }

    pub fn name(&self) -> &str {
        &self.entry().name
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.entry().stage
    }

    /// Descriptors this entry point declares, sorted by (set, binding).
    pub fn bindings(&self) -> &[ShaderBinding] {
        &self.entry().bindings
    }

    pub fn push_constants(&self) -> &[PushConstantBlock] {
        &self.entry().push_constants
    }

    pub(crate) fn module(&self) -> vk::ShaderModule {
        self.library.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_conversion_round_trips() {
        let bytes = [
            0x03, 0x02, 0x23, 0x07, // magic, little endian
            0x00, 0x00, 0x01, 0x00,
        ];
        let words = spirv_from_bytes(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn unaligned_length_is_rejected() {
        assert!(spirv_from_bytes(&[0x03, 0x02, 0x23]).is_err());
        assert!(spirv_from_bytes(&[]).is_err());
    }

    #[test]
    fn wrong_magic_is_rejected() {
        let bytes = [0xDE, 0xAD, 0xBE, 0xEF];
        assert!(spirv_from_bytes(&bytes).is_err());
    }
}
