//! Pipeline creation and management.

use crate::descriptors::DescriptorSet;
use crate::device::Device;
use crate::error::{GpuError, Result};
use crate::render_pass::RenderPass;
use crate::shader::{PushConstants, ShaderModule};
use crate::swapchain::Swapchain;
use ash::vk;
use std::sync::Arc;
use tracing::debug;

/// Operations the command buffer needs from any pipeline.
pub trait Pipeline {
    fn handle(&self) -> vk::Pipeline;
    fn layout(&self) -> vk::PipelineLayout;
    fn bind_point(&self) -> vk::PipelineBindPoint;

    /// Local workgroup size of a compute pipeline.
    fn workgroup_size(&self) -> Option<[u32; 3]> {
        None
    }
}

/// A pipeline and its layout, destroyed together.
struct PipelineHandles {
    device: Arc<Device>,
    pipeline: vk::Pipeline,
    layout: vk::PipelineLayout,
}

impl Drop for PipelineHandles {
    fn drop(&mut self) {
        // SAFETY: both handles are owned exclusively and no longer in use.
        unsafe {
            self.device.handle().destroy_pipeline(self.pipeline, None);
            self.device
                .handle()
                .destroy_pipeline_layout(self.layout, None);
        }
    }
}

fn create_layout(
    device: &Device,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant: Option<vk::PushConstantRange>,
) -> Result<vk::PipelineLayout> {
    let ranges: Vec<vk::PushConstantRange> = push_constant.into_iter().collect();
    if let Some(range) = ranges.first() {
        let limit = device.limits().max_push_constants_size;
        if range.offset + range.size > limit {
            return Err(GpuError::InvalidConfig(format!(
                "push constants end at byte {} but the device allows {limit}",
                range.offset + range.size
            )));
        }
    }
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(&ranges);

    // SAFETY: the slices outlive the call.
    unsafe { device.handle().create_pipeline_layout(&layout_info, None) }
        .map_err(|e| GpuError::PipelineCreation(e.to_string()))
}

/// Specialization data exposing the workgroup size at constant ids 0, 1 and 2.
fn workgroup_specialization(workgroup: &[u32; 3]) -> [vk::SpecializationMapEntry; 3] {
    let size = std::mem::size_of_val(&workgroup[0]);
    [0u32, 1, 2].map(|id| vk::SpecializationMapEntry {
        constant_id: id,
        offset: id * size as u32,
        size,
    })
}

/// Compute pipeline wrapper.
pub struct ComputePipeline {
    handles: PipelineHandles,
    workgroup: [u32; 3],
}

impl ComputePipeline {
    /// Create a compute pipeline with the given local workgroup size.
    ///
    /// The shader reads the workgroup size through specialization constants
    /// 0, 1 and 2. The descriptor set must have a finalized layout.
    pub fn new(
        device: &Arc<Device>,
        shader: &ShaderModule,
        push_constants: Option<&PushConstants>,
        descriptor_set: Option<&DescriptorSet>,
        workgroup: [u32; 3],
    ) -> Result<Self> {
        if !device.capabilities().fits_workgroup(workgroup) {
            return Err(GpuError::InvalidConfig(format!(
                "workgroup {workgroup:?} exceeds device limits {:?} / {} invocations",
                device.capabilities().compute.workgroup_size,
                device.capabilities().compute.workgroup_invocations
            )));
        }

        let set_layouts = descriptor_set
            .map(DescriptorSet::layout)
            .transpose()?
            .into_iter()
            .collect::<Vec<_>>();
        let push_range = push_constants
            .filter(|p| !p.is_empty())
            .map(PushConstants::range);
        let layout = create_layout(device, &set_layouts, push_range)?;

        let entries = workgroup_specialization(&workgroup);
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(bytemuck::bytes_of(&workgroup));
        let stage = shader
            .stage_info(vk::ShaderStageFlags::COMPUTE)
            .specialization_info(&specialization);

        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        // SAFETY: all referenced create infos live until the call returns.
        let pipelines = unsafe {
            device
                .handle()
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                // SAFETY: the layout is unused.
                unsafe { device.handle().destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };
        debug!("Created compute pipeline {pipeline:?} with workgroup {workgroup:?}");

        Ok(Self {
            handles: PipelineHandles {
                device: Arc::clone(device),
                pipeline,
                layout,
            },
            workgroup,
        })
    }
}

impl Pipeline for ComputePipeline {
    fn handle(&self) -> vk::Pipeline {
        self.handles.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.handles.layout
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::COMPUTE
    }

    fn workgroup_size(&self) -> Option<[u32; 3]> {
        Some(self.workgroup)
    }
}

/// Where a graphics pipeline renders.
#[derive(Debug, Clone)]
pub enum RenderTarget {
    /// A subpass of a render pass.
    Subpass {
        render_pass: vk::RenderPass,
        subpass: u32,
        color_attachments: usize,
        samples: vk::SampleCountFlags,
    },
    /// Dynamic rendering into attachments of these formats.
    Dynamic {
        color_formats: Vec<vk::Format>,
        depth_format: Option<vk::Format>,
    },
}

/// Graphics pipeline description.
#[derive(Clone)]
pub struct GraphicsPipelineDesc<'a> {
    pub vertex: &'a ShaderModule,
    pub fragment: Option<&'a ShaderModule>,
    /// Tessellation control and evaluation stages.
    pub tessellation: Option<(&'a ShaderModule, &'a ShaderModule)>,
    pub vertex_bindings: Vec<vk::VertexInputBindingDescription>,
    pub vertex_attributes: Vec<vk::VertexInputAttributeDescription>,
    pub push_constants: Option<vk::PushConstantRange>,
    pub set_layouts: Vec<vk::DescriptorSetLayout>,
    pub target: RenderTarget,
    pub extent: vk::Extent2D,
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub blend: bool,
    pub dynamic_states: Vec<vk::DynamicState>,
}

impl<'a> GraphicsPipelineDesc<'a> {
    fn with_target(vertex: &'a ShaderModule, target: RenderTarget, extent: vk::Extent2D) -> Self {
        Self {
            vertex,
            fragment: None,
            tessellation: None,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
            push_constants: None,
            set_layouts: Vec::new(),
            target,
            extent,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS,
            blend: false,
            dynamic_states: Vec::new(),
        }
    }

    /// Render into `subpass` of a finalized render pass, sized to the swapchain.
    pub fn for_subpass(
        vertex: &'a ShaderModule,
        render_pass: &RenderPass,
        subpass: u32,
        swapchain: &Swapchain,
    ) -> Self {
        let mut desc = Self::with_target(
            vertex,
            RenderTarget::Subpass {
                render_pass: render_pass.handle(),
                subpass,
                color_attachments: render_pass.color_attachment_count(subpass),
                samples: render_pass.samples(),
            },
            swapchain.extent(),
        );
        if render_pass.has_depth_stencil() {
            desc.depth_test = true;
            desc.depth_write = true;
        }
        desc
    }

    /// Render with dynamic rendering into attachments of the given formats.
    pub fn for_dynamic_rendering(
        vertex: &'a ShaderModule,
        color_formats: &[vk::Format],
        depth_format: Option<vk::Format>,
        extent: vk::Extent2D,
    ) -> Self {
        let mut desc = Self::with_target(
            vertex,
            RenderTarget::Dynamic {
                color_formats: color_formats.to_vec(),
                depth_format,
            },
            extent,
        );
        if depth_format.is_some() {
            desc.depth_test = true;
            desc.depth_write = true;
        }
        desc
    }

    pub fn with_fragment(mut self, fragment: &'a ShaderModule) -> Self {
        self.fragment = Some(fragment);
        self
    }

    pub fn with_tessellation(mut self, control: &'a ShaderModule, evaluation: &'a ShaderModule) -> Self {
        self.tessellation = Some((control, evaluation));
        self
    }

    pub fn with_vertex_input(
        mut self,
        bindings: &[vk::VertexInputBindingDescription],
        attributes: &[vk::VertexInputAttributeDescription],
    ) -> Self {
        self.vertex_bindings = bindings.to_vec();
        self.vertex_attributes = attributes.to_vec();
        self
    }

    pub fn with_push_constants(mut self, push_constants: &PushConstants) -> Self {
        self.push_constants = Some(push_constants.range());
        self
    }

    /// Use a descriptor set's finalized layout.
    pub fn with_descriptor_set(mut self, set: &DescriptorSet) -> Result<Self> {
        self.set_layouts.push(set.layout()?);
        Ok(self)
    }

    pub fn with_cull_mode(mut self, cull_mode: vk::CullModeFlags, front_face: vk::FrontFace) -> Self {
        self.cull_mode = cull_mode;
        self.front_face = front_face;
        self
    }

    pub fn with_depth(mut self, test: bool, write: bool, compare: vk::CompareOp) -> Self {
        self.depth_test = test;
        self.depth_write = write;
        self.depth_compare = compare;
        self
    }

    pub fn with_blend(mut self, blend: bool) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_dynamic_states(mut self, states: &[vk::DynamicState]) -> Self {
        self.dynamic_states = states.to_vec();
        self
    }

    fn color_attachment_count(&self) -> usize {
        match &self.target {
            RenderTarget::Subpass {
                color_attachments, ..
            } => *color_attachments,
            RenderTarget::Dynamic { color_formats, .. } => color_formats.len(),
        }
    }

    fn samples(&self) -> vk::SampleCountFlags {
        match &self.target {
            RenderTarget::Subpass { samples, .. } => *samples,
            RenderTarget::Dynamic { .. } => vk::SampleCountFlags::TYPE_1,
        }
    }
}

fn blend_attachment(blend: bool) -> vk::PipelineColorBlendAttachmentState {
    let state = vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA);
    if blend {
        state
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
    } else {
        state.blend_enable(false)
    }
}

/// Graphics pipeline wrapper.
pub struct GraphicsPipeline {
    handles: PipelineHandles,
}

impl GraphicsPipeline {
    /// Create a graphics pipeline.
    pub fn new(device: &Arc<Device>, desc: &GraphicsPipelineDesc<'_>) -> Result<Self> {
        if matches!(desc.target, RenderTarget::Dynamic { .. }) && !device.dynamic_rendering_enabled() {
            return Err(GpuError::InvalidConfig(
                "dynamic rendering is not enabled on this device".to_string(),
            ));
        }
        if let RenderTarget::Subpass { render_pass, .. } = desc.target {
            if render_pass == vk::RenderPass::null() {
                return Err(GpuError::InvalidState(
                    "render pass must be finalized before creating pipelines".to_string(),
                ));
            }
        }

        let mut stages = vec![desc.vertex.stage_info(vk::ShaderStageFlags::VERTEX)];
        if let Some((control, evaluation)) = desc.tessellation {
            stages.push(control.stage_info(vk::ShaderStageFlags::TESSELLATION_CONTROL));
            stages.push(evaluation.stage_info(vk::ShaderStageFlags::TESSELLATION_EVALUATION));
        }
        if let Some(fragment) = desc.fragment {
            stages.push(fragment.stage_info(vk::ShaderStageFlags::FRAGMENT));
        }

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&desc.vertex_bindings)
            .vertex_attribute_descriptions(&desc.vertex_attributes);

        let topology = if desc.tessellation.is_some() {
            vk::PrimitiveTopology::PATCH_LIST
        } else {
            desc.topology
        };
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology)
            .primitive_restart_enable(false);
        let tessellation =
            vk::PipelineTessellationStateCreateInfo::default().patch_control_points(3);

        let viewports = [vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: desc.extent.width as f32,
            height: desc.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }];
        let scissors = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: desc.extent,
        }];
        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewports(&viewports)
            .scissors(&scissors);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(desc.polygon_mode)
            .cull_mode(desc.cull_mode)
            .front_face(desc.front_face)
            .depth_bias_enable(false)
            .line_width(1.0);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(desc.samples())
            .sample_shading_enable(false);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(desc.depth_test)
            .depth_write_enable(desc.depth_write)
            .depth_compare_op(desc.depth_compare)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = vec![blend_attachment(desc.blend); desc.color_attachment_count()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&desc.dynamic_states);

        let layout = create_layout(device, &desc.set_layouts, desc.push_constants)?;

        let color_formats: &[vk::Format] = match &desc.target {
            RenderTarget::Dynamic { color_formats, .. } => color_formats,
            RenderTarget::Subpass { .. } => &[],
        };
        let mut rendering_info =
            vk::PipelineRenderingCreateInfo::default().color_attachment_formats(color_formats);

        let mut pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout);
        if desc.tessellation.is_some() {
            pipeline_info = pipeline_info.tessellation_state(&tessellation);
        }
        match desc.target {
            RenderTarget::Subpass {
                render_pass,
                subpass,
                ..
            } => {
                pipeline_info = pipeline_info.render_pass(render_pass).subpass(subpass);
            }
            RenderTarget::Dynamic { depth_format, .. } => {
                if let Some(depth_format) = depth_format {
                    rendering_info = rendering_info.depth_attachment_format(depth_format);
                }
                pipeline_info = pipeline_info.push_next(&mut rendering_info);
            }
        }

        // SAFETY: every create info referenced above lives until the call returns.
        let pipelines = unsafe {
            device
                .handle()
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let pipeline = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                // SAFETY: the layout is unused.
                unsafe { device.handle().destroy_pipeline_layout(layout, None) };
                return Err(GpuError::PipelineCreation(e.to_string()));
            }
        };
        debug!("Created graphics pipeline {pipeline:?}");

        Ok(Self {
            handles: PipelineHandles {
                device: Arc::clone(device),
                pipeline,
                layout,
            },
        })
    }
}

impl Pipeline for GraphicsPipeline {
    fn handle(&self) -> vk::Pipeline {
        self.handles.pipeline
    }

    fn layout(&self) -> vk::PipelineLayout {
        self.handles.layout
    }

    fn bind_point(&self) -> vk::PipelineBindPoint {
        vk::PipelineBindPoint::GRAPHICS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroup_size_maps_to_constants_zero_to_two() {
        let workgroup = [16u32, 4, 1];
        let entries = workgroup_specialization(&workgroup);
        let data = bytemuck::bytes_of(&workgroup);

        for (id, entry) in entries.iter().enumerate() {
            assert_eq!(entry.constant_id, id as u32);
            assert_eq!(entry.size, 4);
            let start = entry.offset as usize;
            let value = u32::from_ne_bytes(data[start..start + 4].try_into().unwrap());
            assert_eq!(value, workgroup[id]);
        }
    }

    #[test]
    fn blending_toggles_alpha_blend() {
        let on = blend_attachment(true);
        assert_eq!(on.blend_enable, vk::TRUE);
        assert_eq!(on.src_color_blend_factor, vk::BlendFactor::SRC_ALPHA);
        let off = blend_attachment(false);
        assert_eq!(off.blend_enable, vk::FALSE);
        assert_eq!(off.color_write_mask, vk::ColorComponentFlags::RGBA);
    }
}
