// Render pass built from a declarative attachment list
//
// Color attachments come in order, with at most one depth attachment after
// them. There is always exactly one subpass, plus an EXTERNAL -> 0 dependency
// so this frame's attachment writes wait for the previous use of the image.

use ash::vk;
use std::sync::Arc;

use super::command::CommandBuffer;
use super::VulkanDevice;
use crate::error::BackendResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorAttachmentConfig {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

impl ColorAttachmentConfig {
    /// Cleared every frame, stored, handed to the presentation engine.
    pub fn presentable(format: vk::Format) -> Self {
        Self {
            format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }

    fn describe(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(self.samples)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(self.initial_layout)
            .final_layout(self.final_layout)
            .build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthAttachmentConfig {
    pub format: vk::Format,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub stencil_load_op: vk::AttachmentLoadOp,
    pub stencil_store_op: vk::AttachmentStoreOp,
}

impl DepthAttachmentConfig {
    pub fn cleared(format: vk::Format) -> Self {
        Self {
            format,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE, // Don't need to store depth
            stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
            stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        }
    }

    fn describe(&self) -> vk::AttachmentDescription {
        vk::AttachmentDescription::builder()
            .format(self.format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(self.load_op)
            .store_op(self.store_op)
            .stencil_load_op(self.stencil_load_op)
            .stencil_store_op(self.stencil_store_op)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPassConfig {
    pub name: String,
    pub color_attachments: Vec<ColorAttachmentConfig>,
    pub depth_attachment: Option<DepthAttachmentConfig>,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
    pub clear_stencil: u32,
}

/// Attachment descriptions, references and dependency derived from a config
#[derive(Debug, Clone)]
pub struct RenderPassLayout {
    pub attachments: Vec<vk::AttachmentDescription>,
    pub color_refs: Vec<vk::AttachmentReference>,
    pub depth_ref: Option<vk::AttachmentReference>,
    pub dependency: vk::SubpassDependency,
}

impl RenderPassConfig {
    /// One presentable color target plus the swapchain's depth attachment.
    pub fn swapchain(name: &str, color_format: vk::Format, depth_format: vk::Format, clear_color: [f32; 4]) -> Self {
        Self {
            name: name.to_string(),
            color_attachments: vec![ColorAttachmentConfig::presentable(color_format)],
            depth_attachment: Some(DepthAttachmentConfig::cleared(depth_format)),
            clear_color,
            clear_depth: 1.0,
            clear_stencil: 0,
        }
    }

    pub fn layout(&self) -> RenderPassLayout {
        let mut attachments: Vec<_> = self.color_attachments.iter().map(|c| c.describe()).collect();
        let color_refs = (0..self.color_attachments.len() as u32)
            .map(|attachment| vk::AttachmentReference {
                attachment,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            })
            .collect();

        let depth_ref = self.depth_attachment.as_ref().map(|depth| {
            attachments.push(depth.describe());
            vk::AttachmentReference {
                attachment: self.color_attachments.len() as u32,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            }
        });

        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut src_access = vk::AccessFlags::empty();
        let mut access = vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if depth_ref.is_some() {
            // Frames in flight share one depth image: the clear must wait
            // for the previous frame's late-test stores.
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
            src_access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(stages)
            .src_access_mask(src_access)
            .dst_stage_mask(stages)
            .dst_access_mask(access)
            .build();

        RenderPassLayout {
            attachments,
            color_refs,
            depth_ref,
            dependency,
        }
    }

    pub fn clear_values(&self) -> Vec<vk::ClearValue> {
        let mut values: Vec<vk::ClearValue> = self
            .color_attachments
            .iter()
            .map(|_| vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            })
            .collect();
        if self.depth_attachment.is_some() {
            values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: self.clear_depth,
                    stencil: self.clear_stencil,
                },
            });
        }
        values
    }
}

pub struct RenderPass {
    pub handle: vk::RenderPass,
    pub config: RenderPassConfig,
    device: Arc<VulkanDevice>,
}

impl RenderPass {
    pub fn new(device: Arc<VulkanDevice>, config: RenderPassConfig) -> BackendResult<Self> {
        let layout = config.layout();

        let mut subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&layout.color_refs);
        if let Some(depth_ref) = layout.depth_ref.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth_ref);
        }

        let subpasses = [subpass.build()];
        let dependencies = [layout.dependency];
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&layout.attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        let handle = unsafe { device.device.create_render_pass(&render_pass_info, None) }?;
        log::debug!(
            "Created render pass '{}' ({} color, depth: {})",
            config.name,
            config.color_attachments.len(),
            config.depth_attachment.is_some()
        );

        Ok(Self { handle, config, device })
    }

    /// Begin the pass over the whole `extent` with the configured clear values.
    pub fn begin(
        &self,
        cmd: &mut CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) -> BackendResult<()> {
        let clear_values = self.config.clear_values();
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.handle)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        cmd.begin_render_pass(&self.device.device, &begin_info)
    }

    pub fn end(&self, cmd: &mut CommandBuffer) -> BackendResult<()> {
        cmd.end_render_pass(&self.device.device)
    }
}

impl Drop for RenderPass {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_render_pass(self.handle, None);
        }
    }
}
