// Types exchanged with the scene and asset collaborators

use glam::Mat4;
use std::path::Path;

use crate::backend::heap::HeapIndex;
use crate::error::{BackendError, BackendResult};

/// Opaque handle returned by `RendererBackend::create_material`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MaterialHandle(pub(crate) usize);

impl MaterialHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Vertex and index blocks of one uploaded mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshRef {
    pub vertex: HeapIndex,
    pub index: HeapIndex,
}

/// One object to draw this frame. Read-only, discarded after `frame`.
#[derive(Debug, Clone, Copy)]
pub struct Drawable {
    pub material: MaterialHandle,
    pub model: Mat4,
    pub mesh: MeshRef,
}

/// Number of drawables using each of `material_count` materials.
pub fn objects_per_material(drawables: &[Drawable], material_count: usize) -> BackendResult<Vec<u32>> {
    let mut counts = vec![0u32; material_count];
    for drawable in drawables {
        let index = drawable.material.0;
        let count = counts.get_mut(index).ok_or(BackendError::UnknownMaterial(index))?;
        *count = count.saturating_add(1);
    }
    Ok(counts)
}

/// Decoded RGBA8 image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub rgba8: Vec<u8>,
}

impl TextureData {
    /// Single-color texture of the given size.
    pub fn solid(width: u32, height: u32, rgba: [u8; 4]) -> Self {
        let rgba8 = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * 4)
            .collect();
        Self { width, height, rgba8 }
    }
}

/// Image decoding is not the backend's job; the asset layer supplies pixels.
pub trait TextureLoader {
    fn load(&self, path: &Path) -> anyhow::Result<TextureData>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solid_texture() {
        let texture = TextureData::solid(2, 3, [1, 2, 3, 4]);
        assert_eq!(texture.rgba8.len(), 24);
        assert_eq!(&texture.rgba8[20..], &[1, 2, 3, 4]);
    }

    fn drawable(material: usize) -> Drawable {
        Drawable {
            material: MaterialHandle(material),
            model: Mat4::IDENTITY,
            mesh: MeshRef { vertex: 0, index: 0 },
        }
    }

    #[test]
    fn test_objects_per_material() {
        let drawables: Vec<_> = (0..2000).map(|i| drawable(i % 2)).chain([drawable(2)]).collect();
        let counts = objects_per_material(&drawables, 3).unwrap();
        assert_eq!(counts, vec![1000, 1000, 1]);
    }

    #[test]
    fn test_objects_per_material_rejects_unknown_handle() {
        let result = objects_per_material(&[drawable(0), drawable(4)], 2);
        assert!(matches!(result, Err(BackendError::UnknownMaterial(4))));
    }
}
