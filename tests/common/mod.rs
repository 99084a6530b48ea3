// Headless surface provider for tests that need a real device
//
// VK_EXT_headless_surface gives a presentable surface without a window
// system. Drivers such as lavapipe expose it.

#![allow(dead_code)]

use ash::extensions::ext::HeadlessSurface;
use ash::extensions::khr::Surface;
use ash::vk;
use std::cell::Cell;
use std::ffi::c_char;
use std::path::PathBuf;

use strata_renderer::{BackendResult, Config, SurfaceProvider};

pub struct HeadlessProvider {
    extent: Cell<(u32, u32)>,
}

impl HeadlessProvider {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            extent: Cell::new((width, height)),
        }
    }

    pub fn set_extent(&self, width: u32, height: u32) {
        self.extent.set((width, height));
    }
}

impl SurfaceProvider for HeadlessProvider {
    fn required_instance_extensions(&self) -> BackendResult<Vec<*const c_char>> {
        Ok(vec![Surface::name().as_ptr(), HeadlessSurface::name().as_ptr()])
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> BackendResult<vk::SurfaceKHR> {
        let loader = HeadlessSurface::new(entry, instance);
        let create_info = vk::HeadlessSurfaceCreateInfoEXT::builder();
        Ok(unsafe { loader.create_headless_surface(&create_info, None) }?)
    }

    fn framebuffer_extent(&self) -> (u32, u32) {
        self.extent.get()
    }
}

/// Small heaps, no validation, bounded fence waits so a deadlock fails
/// the test instead of hanging it.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.window.title = "strata-tests".to_string();
    config.graphics.present_mode = "fifo".to_string();
    config.graphics.max_frames_in_flight = 2;
    config.graphics.fence_timeout_ms = 5_000;
    config.heaps.vertex_mib = 4;
    config.heaps.index_mib = 1;
    config.heaps.uniform_mib = 1;
    config.debug.validation_layers = false;

    let shaders = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("shaders");
    config.shaders.unlit_vert = shaders.join("unlit.vert.spv");
    config.shaders.unlit_frag = shaders.join("unlit.frag.spv");
    config.shaders.physical_vert = shaders.join("physical.vert.spv");
    config.shaders.physical_frag = shaders.join("physical.frag.spv");
    config
}
