// =============================================================================
// STRATA RENDERER - Vulkan rendering backend
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
//   renderer::RendererBackend      prepare_frame / frame, resize latch
//     ├── renderer::material       pipelines + descriptor sets per material
//     ├── renderer::resources      render passes by name, texture cache
//     └── backend                  device, swapchain, sync, commands, heaps
//
// FRAME FLOW:
// 1. Apply a latched resize (recreate swapchain and everything derived)
// 2. Wait on the ring slot's fence
// 3. Acquire a swapchain image
// 4. Record the draw list
// 5. Wait on whichever slot still guards that image
// 6. Submit and present
//
// =============================================================================

pub mod backend;
pub mod config;
pub mod error;
pub mod renderer;

pub use backend::{SurfaceProvider, Vertex, VulkanDevice};
pub use config::Config;
pub use error::{BackendError, BackendResult};
pub use renderer::material::{MaterialKind, MaterialParams};
pub use renderer::{Drawable, MaterialHandle, MeshRef, RendererBackend, TextureData, TextureLoader};
