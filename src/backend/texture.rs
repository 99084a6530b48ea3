// Sampled 2D textures
//
// Pixels go through a staging buffer. One single-use command buffer moves the
// image UNDEFINED -> TRANSFER_DST, copies, then moves it to
// SHADER_READ_ONLY for fragment sampling.

use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandBufferOp;
use super::image::GpuImage;
use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

pub const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

pub struct Texture {
    pub image: GpuImage,
    pub sampler: vk::Sampler,
    device: Arc<VulkanDevice>,
}

impl Texture {
    /// Upload tightly packed RGBA8 pixels.
    pub fn from_rgba8(
        device: Arc<VulkanDevice>,
        name: &str,
        width: u32,
        height: u32,
        pixels: &[u8],
    ) -> BackendResult<Self> {
        let expected = rgba8_len(width, height);
        if width == 0 || height == 0 || pixels.len() != expected {
            return Err(BackendError::Texture(format!(
                "texture '{}' is {}x{} but has {} bytes (expected {})",
                name,
                width,
                height,
                pixels.len(),
                expected
            )));
        }

        let extent = vk::Extent2D { width, height };
        let image = GpuImage::new(
            device.clone(),
            name,
            extent,
            TEXTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::ImageAspectFlags::COLOR,
        )?;

        let staging = GpuBuffer::staging(device.clone(), pixels)?;
        Self::upload(&device, &staging, image.image, extent)?;

        let sampler = create_sampler(&device)?;
        log::debug!("Uploaded texture '{}' ({}x{})", name, width, height);

        Ok(Self { image, sampler, device })
    }

    /// 1x1 opaque white, used when a material has no texture.
    pub fn white(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        Self::from_rgba8(device, "default_white", 1, 1, &[255, 255, 255, 255])
    }

    fn upload(
        device: &VulkanDevice,
        staging: &GpuBuffer,
        image: vk::Image,
        extent: vk::Extent2D,
    ) -> BackendResult<()> {
        let cmd = device.allocate_and_begin_single_use()?;
        let handle = cmd.recording_handle(CommandBufferOp::Record)?;

        let (to_transfer, to_shader) = layout_transitions(image);
        let region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .image_extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .build();

        unsafe {
            device.device.cmd_pipeline_barrier(
                handle,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.device.cmd_copy_buffer_to_image(
                handle,
                staging.buffer,
                image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
            device.device.cmd_pipeline_barrier(
                handle,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        }

        device.end_single_use(cmd)
    }

    pub fn descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo {
            sampler: self.sampler,
            image_view: self.image.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_sampler(self.sampler, None);
        }
    }
}

pub fn rgba8_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

/// Barriers for UNDEFINED -> TRANSFER_DST and TRANSFER_DST -> SHADER_READ_ONLY.
fn layout_transitions(image: vk::Image) -> (vk::ImageMemoryBarrier, vk::ImageMemoryBarrier) {
    let subresource_range = vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    };

    let to_transfer = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(vk::ImageLayout::UNDEFINED)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range)
        .build();

    let to_shader = vk::ImageMemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::SHADER_READ)
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(subresource_range)
        .build();

    (to_transfer, to_shader)
}

fn create_sampler(device: &VulkanDevice) -> BackendResult<vk::Sampler> {
    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(device.properties.limits.max_sampler_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .min_lod(0.0)
        .max_lod(0.0);

    Ok(unsafe { device.device.create_sampler(&sampler_info, None) }?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_transitions() {
        let (to_transfer, to_shader) = layout_transitions(vk::Image::null());
        assert_eq!(to_transfer.old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(to_transfer.new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(to_shader.old_layout, to_transfer.new_layout);
        assert_eq!(to_shader.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(to_shader.dst_access_mask, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_rgba8_len() {
        assert_eq!(rgba8_len(1, 1), 4);
        assert_eq!(rgba8_len(256, 128), 131072);
    }
}
