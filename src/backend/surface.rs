// Surface provider - the seam to the OS windowing layer
//
// The backend never talks to a window system directly. Whoever owns the
// window implements this trait; the demo binary does it for winit.

use ash::vk;
use std::ffi::c_char;

use crate::error::BackendResult;

pub trait SurfaceProvider {
    /// Instance extensions the platform surface needs (surface + platform surface).
    fn required_instance_extensions(&self) -> BackendResult<Vec<*const c_char>>;

    /// Create the presentation surface against a freshly created instance.
    fn create_surface(
        &self,
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> BackendResult<vk::SurfaceKHR>;

    /// Current framebuffer size in pixels. Zero in either axis means minimized.
    fn framebuffer_extent(&self) -> (u32, u32);
}
