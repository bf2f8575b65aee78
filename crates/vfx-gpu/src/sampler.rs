//! Sampler resources.

use ash::vk;

/// Parameters for [`crate::Device::make_sampler`]. Defaults give trilinear
/// filtering with repeat addressing.
#[derive(Debug, Clone, Copy)]
pub struct SamplerDescription {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode: vk::SamplerAddressMode,
    /// Requested anisotropy, clamped to the device limit at creation.
    pub anisotropy: Option<f32>,
    /// Enables depth-comparison sampling for shadow lookups.
    pub compare: Option<vk::CompareOp>,
}

impl Default for SamplerDescription {
    fn default() -> Self {
        Self {
            min_filter: vk::Filter::LINEAR,
            mag_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
            anisotropy: None,
            compare: None,
        }
    }
}

impl SamplerDescription {
    pub fn nearest() -> Self {
        Self {
            min_filter: vk::Filter::NEAREST,
            mag_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Self::default()
        }
    }

    pub fn clamped(mut self) -> Self {
        self.address_mode = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        self
    }

    pub(crate) fn to_vk(self, max_device_anisotropy: f32) -> vk::SamplerCreateInfo<'static> {
        let anisotropy = self.anisotropy.map(|a| a.min(max_device_anisotropy));

        vk::SamplerCreateInfo::default()
            .min_filter(self.min_filter)
            .mag_filter(self.mag_filter)
            .mipmap_mode(self.mipmap_mode)
            .address_mode_u(self.address_mode)
            .address_mode_v(self.address_mode)
            .address_mode_w(self.address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .compare_enable(self.compare.is_some())
            .compare_op(self.compare.unwrap_or(vk::CompareOp::NEVER))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE)
    }
}

/// A texture sampler. Freed through [`crate::Device::free_sampler`].
pub struct Sampler {
    pub(crate) handle: vk::Sampler,
}

impl Sampler {
    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anisotropy_clamps_to_device_limit() {
        let desc = SamplerDescription {
            anisotropy: Some(16.0),
            ..SamplerDescription::default()
        };
        let info = desc.to_vk(8.0);
        assert_eq!(info.anisotropy_enable, vk::TRUE);
        assert_eq!(info.max_anisotropy, 8.0);
    }

    #[test]
    fn anisotropy_disabled_by_default() {
        let info = SamplerDescription::default().to_vk(16.0);
        assert_eq!(info.anisotropy_enable, vk::FALSE);
        assert_eq!(info.max_anisotropy, 1.0);
    }

    #[test]
    fn compare_op_enables_comparison() {
        let desc = SamplerDescription {
            compare: Some(vk::CompareOp::LESS_OR_EQUAL),
            ..SamplerDescription::default()
        };
        let info = desc.to_vk(1.0);
        assert_eq!(info.compare_enable, vk::TRUE);
        assert_eq!(info.compare_op, vk::CompareOp::LESS_OR_EQUAL);
    }
}
