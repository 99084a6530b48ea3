// Shader module loading
//
// Vulkan consumes SPIR-V words. Modules only need to live until the
// pipelines using them are created, so callers drop them right after.

use ash::vk;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{BackendError, BackendResult};

pub struct ShaderModule {
    pub handle: vk::ShaderModule,
    pub stage: vk::ShaderStageFlags,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes (any alignment).
    pub fn from_bytes(
        device: Arc<VulkanDevice>,
        code: &[u8],
        stage: vk::ShaderStageFlags,
    ) -> BackendResult<Self> {
        let words = spirv_words(code)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);
        let handle = unsafe { device.device.create_shader_module(&create_info, None) }?;
        Ok(Self { handle, stage, device })
    }

    pub fn from_file(
        device: Arc<VulkanDevice>,
        path: impl AsRef<Path>,
        stage: vk::ShaderStageFlags,
    ) -> BackendResult<Self> {
        let path = path.as_ref();
        let code = std::fs::read(path)
            .map_err(|e| BackendError::Shader(format!("failed to read {}: {}", path.display(), e)))?;
        log::debug!("Loading {:?} shader from {}", stage, path.display());
        Self::from_bytes(device, &code, stage)
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_shader_module(self.handle, None);
        }
    }
}

/// Re-pack SPIR-V bytes into aligned words, checking the magic number.
pub fn spirv_words(code: &[u8]) -> BackendResult<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(code))
        .map_err(|e| BackendError::Shader(format!("invalid SPIR-V: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spirv_words_accepts_magic() {
        let mut code = 0x0723_0203u32.to_le_bytes().to_vec();
        code.extend_from_slice(&7u32.to_le_bytes());
        let words = spirv_words(&code).unwrap();
        assert_eq!(words, vec![0x0723_0203, 7]);
    }

    #[test]
    fn test_spirv_words_rejects_garbage() {
        assert!(spirv_words(&[1, 2, 3]).is_err());
        assert!(matches!(
            spirv_words(&[0, 0, 0, 0]),
            Err(BackendError::Shader(_))
        ));
    }
}
