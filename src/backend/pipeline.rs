// Graphics pipeline creation and management
//
// Every pipeline shares one fixed vertex layout and one rasterizer setup:
// triangle lists, counter-clockwise front faces, back-face culling, depth
// test + write with LESS, opaque output. Viewport and scissor are dynamic so
// only a render pass change (swapchain rebuild) forces a new pipeline.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::ffi::CStr;
use std::mem::{offset_of, size_of};
use std::sync::Arc;

use super::shader::ShaderModule;
use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

/// Interleaved vertex: position, normal, texcoord, color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub texcoord: [f32; 2],
    pub color: [f32; 4],
}

impl Vertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], texcoord: [f32; 2], color: [f32; 4]) -> Self {
        Self {
            position,
            normal,
            texcoord,
            color,
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 4] {
        let attribute = |location: u32, format: vk::Format, offset: usize| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
                .build()
        };

        [
            attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
            attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, normal)),
            attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, texcoord)),
            attribute(3, vk::Format::R32G32B32A32_SFLOAT, offset_of!(Vertex, color)),
        ]
    }
}

/// Push constant block: the object's model matrix
pub const MODEL_PUSH_CONSTANT_SIZE: u32 = 64;

const ENTRY_POINT: &CStr = c"main";

pub struct Pipeline {
    pub handle: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    device: Arc<VulkanDevice>,
}

impl Pipeline {
    /// Build a pipeline for subpass 0 of `render_pass`.
    pub fn new(
        device: Arc<VulkanDevice>,
        render_pass: vk::RenderPass,
        stages: &[&ShaderModule],
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> BackendResult<Self> {
        if stages.is_empty() {
            return Err(BackendError::Shader("pipeline needs at least one shader stage".into()));
        }

        let shader_stages: Vec<_> = stages
            .iter()
            .map(|module| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(module.stage)
                    .module(module.handle)
                    .name(ENTRY_POINT)
                    .build()
            })
            .collect();

        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Counts only, the rectangles are set per frame
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(vk::CullModeFlags::BACK)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(vk::CompareOp::LESS) // Closer objects win
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build()];
        let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&color_blend_attachments);

        let push_constant_ranges = [model_push_constant_range()];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }?;

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .render_pass(render_pass)
            .subpass(0)
            .build();

        let pipelines = unsafe {
            device
                .device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        let handle = match pipelines {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe { device.device.destroy_pipeline_layout(layout, None) };
                return Err(e.into());
            }
        };

        Ok(Self { handle, layout, device })
    }

    pub fn bind(&self, cmd: vk::CommandBuffer) {
        unsafe {
            self.device
                .device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.handle);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_pipeline(self.handle, None);
            self.device.device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

pub fn model_push_constant_range() -> vk::PushConstantRange {
    vk::PushConstantRange::builder()
        .stage_flags(vk::ShaderStageFlags::VERTEX)
        .offset(0)
        .size(MODEL_PUSH_CONSTANT_SIZE)
        .build()
}

/// Viewport covering `extent` with the standard 0..1 depth range.
pub fn full_viewport(extent: vk::Extent2D) -> vk::Viewport {
    vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(size_of::<Vertex>(), 48);

        let binding = Vertex::binding_description();
        assert_eq!(binding.stride, 48);
        assert_eq!(binding.input_rate, vk::VertexInputRate::VERTEX);

        let attributes = Vertex::attribute_descriptions();
        let offsets: Vec<u32> = attributes.iter().map(|a| a.offset).collect();
        assert_eq!(offsets, vec![0, 12, 24, 32]);
        assert!(attributes.iter().all(|a| a.binding == 0));
        assert_eq!(attributes[3].format, vk::Format::R32G32B32A32_SFLOAT);
    }

    #[test]
    fn test_model_push_constant_fits_mat4() {
        let range = model_push_constant_range();
        assert_eq!(range.size as usize, size_of::<glam::Mat4>());
        assert_eq!(range.stage_flags, vk::ShaderStageFlags::VERTEX);
    }

    #[test]
    fn test_full_viewport() {
        let viewport = full_viewport(vk::Extent2D {
            width: 1024,
            height: 768,
        });
        assert_eq!(viewport.width, 1024.0);
        assert_eq!(viewport.height, 768.0);
        assert_eq!(viewport.max_depth, 1.0);
    }
}
