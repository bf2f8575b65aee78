//! Pipeline state creation.
//!
//! Pipeline layouts are not hand-assembled. Each pipeline merges the
//! reflection data of its functions into a [`LayoutPlan`] and realizes that
//! plan into Vulkan layout objects, so shaders are the single source of truth
//! for what a pipeline binds.

use std::ffi::CString;

use ash::vk;

use crate::capabilities::GpuCapabilities;
use crate::descriptors;
use crate::error::{GpuError, Result};
use crate::layout::LayoutPlan;
use crate::shader::Function;

/// Parameters for [`crate::Device::make_pipeline_state`].
///
/// Defaults describe an opaque triangle-list pipeline with back-face culling
/// and depth testing against a reversed-Z-free LESS compare.
#[derive(Clone)]
pub struct PipelineStateDescription<'a> {
    pub vertex_function: &'a Function,
    /// `None` builds a depth-only pipeline without a fragment stage.
    pub fragment_function: Option<&'a Function>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    /// Standard alpha blending on every color attachment when set.
    pub blend_enable: bool,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
}

impl<'a> PipelineStateDescription<'a> {
    pub fn new(vertex_function: &'a Function) -> Self {
        Self {
            vertex_function,
            fragment_function: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: true,
            depth_write: true,
            depth_compare: vk::CompareOp::LESS,
            blend_enable: false,
            color_formats: vec![vk::Format::B8G8R8A8_SRGB],
            depth_format: None,
        }
    }
}

/// A graphics pipeline with the layout objects derived from its shaders.
pub struct PipelineState {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) set_layouts: Vec<vk::DescriptorSetLayout>,
    pub(crate) plan: LayoutPlan,
}

impl PipelineState {
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The merged binding layout, used when making resource groups.
    pub fn layout_plan(&self) -> &LayoutPlan {
        &self.plan
    }

    /// Build a graphics pipeline using dynamic rendering (Vulkan 1.3).
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        capabilities: &GpuCapabilities,
        desc: &PipelineStateDescription,
    ) -> Result<Self> {
        expect_stage(desc.vertex_function, vk::ShaderStageFlags::VERTEX)?;
        if let Some(fragment) = desc.fragment_function {
            expect_stage(fragment, vk::ShaderStageFlags::FRAGMENT)?;
        }

        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::VERTEX,
            desc.vertex_function.bindings(),
            desc.vertex_function.push_constants(),
        )?;
        if let Some(fragment) = desc.fragment_function {
            plan.add_stage(
                vk::ShaderStageFlags::FRAGMENT,
                fragment.bindings(),
                fragment.push_constants(),
            )?;
        }
        check_against_limits(&plan, capabilities)?;

        let (layout, set_layouts) = create_layout(device, &plan)?;

        let vertex_name = entry_name(desc.vertex_function)?;
        let mut shader_stages = vec![vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(desc.vertex_function.module())
            .name(&vertex_name)];

        let fragment_name;
        if let Some(fragment) = desc.fragment_function {
            fragment_name = entry_name(fragment)?;
            shader_stages.push(
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(vk::ShaderStageFlags::FRAGMENT)
                    .module(fragment.module())
                    .name(&fragment_name),
            );
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(desc.topology)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic; only counts matter here.
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1)
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments: Vec<_> = desc
            .color_formats
            .iter()
            .map(|_| blend_attachment(desc.blend_enable))
            .collect();

        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&desc.color_formats);
        if let Some(depth_format) = desc.depth_format {
            rendering_info = rendering_info.depth_attachment_format(depth_format);
        }

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| {
                unsafe { destroy_layout(device, layout, &set_layouts) };
                GpuError::PipelineCreation(e.to_string())
            })?;

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            set_layouts,
            plan,
        })
    }

    /// Destroy the pipeline and its layout objects.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        destroy_layout(device, self.layout, &self.set_layouts);
    }
}

/// A compute pipeline with the layout objects derived from its shader.
pub struct ComputePipelineState {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) set_layouts: Vec<vk::DescriptorSetLayout>,
    pub(crate) plan: LayoutPlan,
}

impl ComputePipelineState {
    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }

    /// The binding layout, used when making resource groups.
    pub fn layout_plan(&self) -> &LayoutPlan {
        &self.plan
    }

    /// Build a compute pipeline from a compute entry point.
    ///
    /// # Safety
    /// The device must be valid.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        capabilities: &GpuCapabilities,
        function: &Function,
    ) -> Result<Self> {
        expect_stage(function, vk::ShaderStageFlags::COMPUTE)?;

        let mut plan = LayoutPlan::new();
        plan.add_stage(
            vk::ShaderStageFlags::COMPUTE,
            function.bindings(),
            function.push_constants(),
        )?;
        check_against_limits(&plan, capabilities)?;

        let (layout, set_layouts) = create_layout(device, &plan)?;

        let name = entry_name(function)?;
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(function.module())
            .name(&name);

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);

        let pipelines = device
            .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_pipelines, e)| {
                unsafe { destroy_layout(device, layout, &set_layouts) };
                GpuError::PipelineCreation(e.to_string())
            })?;

        Ok(Self {
            pipeline: pipelines[0],
            layout,
            set_layouts,
            plan,
        })
    }

    /// Destroy the pipeline and its layout objects.
    ///
    /// # Safety
    /// The device must be valid and the pipeline must not be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        destroy_layout(device, self.layout, &self.set_layouts);
    }
}

fn expect_stage(function: &Function, expected: vk::ShaderStageFlags) -> Result<()> {
    if function.stage() != expected {
        return Err(GpuError::PipelineCreation(format!(
            "Function {:?} is a {:?} entry point, expected {:?}",
            function.name(),
            function.stage(),
            expected
        )));
    }
    Ok(())
}

fn entry_name(function: &Function) -> Result<CString> {
    CString::new(function.name())
        .map_err(|_| GpuError::PipelineCreation("Entry point name contains a NUL byte".to_string()))
}

fn check_against_limits(plan: &LayoutPlan, capabilities: &GpuCapabilities) -> Result<()> {
    if plan.sets.len() as u32 > capabilities.max_bound_descriptor_sets {
        return Err(GpuError::PipelineCreation(format!(
            "Shaders use {} descriptor sets but the device supports {}",
            plan.sets.len(),
            capabilities.max_bound_descriptor_sets
        )));
    }

    for range in &plan.push_constant_ranges {
        if range.size > capabilities.max_push_constant_size {
            return Err(GpuError::PipelineCreation(format!(
                "Push constant block of {} bytes exceeds the device limit of {}",
                range.size, capabilities.max_push_constant_size
            )));
        }
    }

    Ok(())
}

fn blend_attachment(blend_enable: bool) -> vk::PipelineColorBlendAttachmentState {
    if blend_enable {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    } else {
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA)
    }
}

unsafe fn create_layout(
    device: &ash::Device,
    plan: &LayoutPlan,
) -> Result<(vk::PipelineLayout, Vec<vk::DescriptorSetLayout>)> {
    let set_layouts = descriptors::create_set_layouts(device, plan)?;

    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&plan.push_constant_ranges);

    match device.create_pipeline_layout(&layout_info, None) {
        Ok(layout) => Ok((layout, set_layouts)),
        Err(e) => {
            for set_layout in &set_layouts {
                device.destroy_descriptor_set_layout(*set_layout, None);
            }
            Err(GpuError::PipelineCreation(e.to_string()))
        }
    }
}

unsafe fn destroy_layout(
    device: &ash::Device,
    layout: vk::PipelineLayout,
    set_layouts: &[vk::DescriptorSetLayout],
) {
    device.destroy_pipeline_layout(layout, None);
    for set_layout in set_layouts {
        device.destroy_descriptor_set_layout(*set_layout, None);
    }
}
