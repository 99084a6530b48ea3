// Buffer utilities for vertex, index, uniform and staging buffers
//
// Memory comes from gpu-allocator; every GpuBuffer owns its allocation and
// returns it on drop.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer and back it with memory from `location`.
    ///
    /// `CpuToGpu` buffers come back persistently mapped.
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> BackendResult<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let allocation = device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        if let Err(e) = unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            unsafe { device.device.destroy_buffer(buffer, None) };
            let _ = device.allocator().free(allocation);
            return Err(e.into());
        }

        log::debug!("Created buffer '{}' ({} bytes, {:?})", name, size, location);

        Ok(Self {
            buffer,
            size,
            allocation: Some(allocation),
            device,
        })
    }

    /// Copy `data` into a mapped buffer at byte `offset`.
    pub fn write(&mut self, offset: vk::DeviceSize, data: &[u8]) -> BackendResult<()> {
        let slice = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(BackendError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > slice.len() {
            return Err(BackendError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        slice[start..end].copy_from_slice(data);
        Ok(())
    }

    /// Create a mapped staging buffer holding `data`.
    pub fn staging(device: Arc<VulkanDevice>, data: &[u8]) -> BackendResult<Self> {
        let mut staging = Self::new(
            device,
            "staging",
            data.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;
        staging.write(0, data)?;
        Ok(staging)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free buffer allocation: {}", e);
            }
        }
    }
}

/// Copy `size` bytes between buffers with a blocking single-use command buffer.
pub fn copy_buffer(
    device: &VulkanDevice,
    src: vk::Buffer,
    src_offset: vk::DeviceSize,
    dst: vk::Buffer,
    dst_offset: vk::DeviceSize,
    size: vk::DeviceSize,
) -> BackendResult<()> {
    let cmd = device.allocate_and_begin_single_use()?;
    let region = vk::BufferCopy {
        src_offset,
        dst_offset,
        size,
    };
    let handle = cmd.recording_handle(super::command::CommandBufferOp::Record)?;
    unsafe { device.device.cmd_copy_buffer(handle, src, dst, &[region]) };
    device.end_single_use(cmd)
}
