// Resource manager
//
// Owns the named render passes and the texture cache. One instance lives in
// the renderer and is passed by reference; there is no global registry.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use super::scene::TextureLoader;
use crate::backend::render_pass::RenderPass;
use crate::backend::texture::Texture;
use crate::backend::VulkanDevice;
use crate::error::{BackendError, BackendResult};

/// Name-keyed cache of shared values with explicit reference counts
#[derive(Debug)]
pub struct RefCache<T> {
    entries: HashMap<String, (Arc<T>, u32)>,
}

impl<T> Default for RefCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T> RefCache<T> {
    /// Take a reference to `name`, creating the value with `create` on a miss.
    pub fn acquire<F>(&mut self, name: &str, create: F) -> BackendResult<Arc<T>>
    where
        F: FnOnce() -> BackendResult<T>,
    {
        if let Some((value, refs)) = self.entries.get_mut(name) {
            *refs += 1;
            return Ok(value.clone());
        }

        let value = Arc::new(create()?);
        self.entries.insert(name.to_string(), (value.clone(), 1));
        Ok(value)
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries.get(name).map(|(value, _)| value.clone())
    }

    pub fn ref_count(&self, name: &str) -> u32 {
        self.entries.get(name).map_or(0, |(_, refs)| *refs)
    }

    /// Drop one reference. Returns true when the entry was evicted.
    pub fn release(&mut self, name: &str) -> bool {
        let evict = match self.entries.get_mut(name) {
            Some((_, refs)) => {
                *refs -= 1;
                *refs == 0
            }
            None => return false,
        };
        if evict {
            self.entries.remove(name);
        }
        evict
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct ResourceManager {
    render_passes: HashMap<String, RenderPass>,
    textures: RefCache<Texture>,
    default_texture: Arc<Texture>,
    device: Arc<VulkanDevice>,
}

impl ResourceManager {
    pub fn new(device: Arc<VulkanDevice>) -> BackendResult<Self> {
        let default_texture = Arc::new(Texture::white(device.clone())?);
        Ok(Self {
            render_passes: HashMap::new(),
            textures: RefCache::default(),
            default_texture,
            device,
        })
    }

    /// Register a render pass under its config name, replacing (and dropping)
    /// any previous pass of that name.
    pub fn insert_render_pass(&mut self, render_pass: RenderPass) {
        let name = render_pass.config.name.clone();
        if self.render_passes.insert(name.clone(), render_pass).is_some() {
            log::debug!("Replaced render pass '{}'", name);
        }
    }

    pub fn render_pass(&self, name: &str) -> Option<&RenderPass> {
        self.render_passes.get(name)
    }

    /// Cached texture by name, loading `path` through `loader` on first use.
    pub fn get_texture(
        &mut self,
        name: &str,
        path: &Path,
        loader: Option<&dyn TextureLoader>,
    ) -> BackendResult<Arc<Texture>> {
        let device = self.device.clone();
        self.textures.acquire(name, || {
            let loader = loader.ok_or_else(|| BackendError::Texture(format!("no loader for '{}'", name)))?;
            let data = loader
                .load(path)
                .map_err(|e| BackendError::Texture(format!("failed to load {}: {:#}", path.display(), e)))?;
            log::info!("Loaded texture '{}' from {}", name, path.display());
            Texture::from_rgba8(device, name, data.width, data.height, &data.rgba8)
        })
    }

    /// Drop one reference to `name`. The GPU image lives on while any
    /// material still holds it.
    pub fn release_texture(&mut self, name: &str) -> bool {
        let evicted = self.textures.release(name);
        if evicted {
            log::debug!("Evicted texture '{}'", name);
        } else {
            log::trace!("Texture '{}' has {} references left", name, self.textures.ref_count(name));
        }
        evicted
    }

    pub fn default_texture(&self) -> Arc<Texture> {
        self.default_texture.clone()
    }
}
