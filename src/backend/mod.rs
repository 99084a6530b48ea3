// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc<VulkanDevice>
// so the device always outlives what was created from it.

pub mod buffer;
pub mod command;
pub mod device;
pub mod heap;
pub mod image;
pub mod pipeline;
pub mod render_pass;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod texture;

pub use device::VulkanDevice;
pub use pipeline::Vertex;
pub use surface::SurfaceProvider;
pub use swapchain::Swapchain;
