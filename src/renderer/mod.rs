// Renderer backend - frame orchestration
//
// Each tick is two calls: `prepare_frame` waits for the ring slot, acquires an
// image and records the draw list; `frame` submits and presents. Resizes are
// latched and applied at the top of the next `prepare_frame`, never from the
// event handler that reported them.

pub mod frame;
pub mod material;
pub mod resources;
pub mod scene;

use ash::vk;
use glam::Mat4;
use std::path::Path;
use std::sync::Arc;

use crate::backend::command::{BeginFlags, CommandBufferId, CommandBufferOp, CommandPool};
use crate::backend::heap::{BufferHeap, HeapAllocation, HeapIndex, HeapKind, HeapStats};
use crate::backend::pipeline::full_viewport;
use crate::backend::render_pass::{RenderPass, RenderPassConfig};
use crate::backend::swapchain::PresentOutcome;
use crate::backend::sync::FrameSync;
use crate::backend::texture::Texture;
use crate::backend::{Swapchain, SurfaceProvider, Vertex, VulkanDevice};
use crate::config::Config;
use crate::error::{BackendError, BackendResult};

use frame::{DeferredFrees, FrameGate, ImageFenceTable, ResizeLatch};
use material::{Material, MaterialKind, MaterialParams, MaterialUniform, ViewProjection};
use resources::ResourceManager;
use scene::objects_per_material;
pub use scene::{Drawable, MaterialHandle, MeshRef, TextureData, TextureLoader};

/// Name of the render pass that draws into the swapchain
pub const WORLD_PASS: &str = "world";

/// Heap usage snapshot for the mesh and material uniform heaps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererStats {
    pub vertex_heap: HeapStats,
    pub index_heap: HeapStats,
    pub uniform_heap: HeapStats,
    pub frames_submitted: u64,
    pub swapchain_generation: u64,
}

// Field order is drop order: everything created from the device goes before it.
struct BackendState {
    materials: Vec<Material>,
    resources: ResourceManager,
    vertex_heap: BufferHeap<Vertex>,
    index_heap: BufferHeap<u32>,
    uniform_heap: BufferHeap<MaterialUniform>,
    deferred_frees: DeferredFrees<MeshRef>,
    uniform_frees: DeferredFrees<HeapIndex>,
    command_buffers: Vec<CommandBufferId>,
    command_pool: CommandPool,
    frame_sync: Vec<FrameSync>,
    images: ImageFenceTable,
    swapchain: Swapchain,
    swapchain_generation: u64,
    /// Image acquired by `prepare_frame`, consumed by `frame`
    acquired_image: Option<u32>,
    frames_submitted: u64,
    device: Arc<VulkanDevice>,
}

pub struct RendererBackend {
    config: Config,
    state: Option<BackendState>,
    latch: ResizeLatch,
    camera: ViewProjection,
    texture_loader: Option<Box<dyn TextureLoader>>,
}

impl RendererBackend {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: None,
            latch: ResizeLatch::new(),
            camera: ViewProjection::default(),
            texture_loader: None,
        }
    }

    pub fn set_texture_loader(&mut self, loader: Box<dyn TextureLoader>) {
        self.texture_loader = Some(loader);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.state.is_some()
    }

    pub fn device(&self) -> Option<&Arc<VulkanDevice>> {
        self.state.as_ref().map(|state| &state.device)
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.state.as_ref().map(|state| &state.swapchain)
    }

    pub fn render_pass(&self, name: &str) -> Option<&RenderPass> {
        self.state.as_ref().and_then(|state| state.resources.render_pass(name))
    }

    /// Create the device, swapchain, world render pass, per-frame sync and mesh heaps.
    pub fn initialize(&mut self, surface_provider: &dyn SurfaceProvider) -> BackendResult<()> {
        if self.state.is_some() {
            log::warn!("Renderer backend already initialized");
            return Ok(());
        }

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = VulkanDevice::new(&self.config.window.title, enable_validation, surface_provider)?;

        let frames_in_flight = self.config.frames_in_flight();
        let (width, height) = surface_provider.framebuffer_extent();
        let mut swapchain = Swapchain::new(
            device.clone(),
            width,
            height,
            self.config.present_mode(),
            frames_in_flight,
        )?;
        if swapchain.image_count() == 0 {
            // Started minimized; the first positive extent builds it
            self.latch.latch(width, height);
        }

        let mut resources = ResourceManager::new(device.clone())?;
        let render_pass = Self::create_world_pass(&device, &swapchain, &self.config)?;
        swapchain.attach_render_pass(render_pass.handle)?;
        resources.insert_render_pass(render_pass);

        let mut command_pool = CommandPool::new(device.clone(), device.queue_families.graphics)?;
        let command_buffers = (0..frames_in_flight)
            .map(|_| command_pool.allocate(true))
            .collect::<BackendResult<Vec<_>>>()?;
        let frame_sync = (0..frames_in_flight)
            .map(|_| FrameSync::new(&device))
            .collect::<BackendResult<Vec<_>>>()?;

        let vertex_heap = BufferHeap::new(device.clone(), HeapKind::Vertex, self.config.vertex_heap_bytes())?;
        let index_heap = BufferHeap::new(device.clone(), HeapKind::Index, self.config.index_heap_bytes())?;
        let uniform_heap = BufferHeap::new(device.clone(), HeapKind::Uniform, self.config.uniform_heap_bytes())?;

        let images = ImageFenceTable::new(swapchain.image_count());
        let swapchain_generation = swapchain.generation();

        self.state = Some(BackendState {
            materials: Vec::new(),
            resources,
            vertex_heap,
            index_heap,
            uniform_heap,
            deferred_frees: DeferredFrees::new(frames_in_flight),
            uniform_frees: DeferredFrees::new(frames_in_flight),
            command_buffers,
            command_pool,
            frame_sync,
            images,
            swapchain,
            swapchain_generation,
            acquired_image: None,
            frames_submitted: 0,
            device,
        });

        log::info!("Renderer backend initialized ({} frames in flight)", frames_in_flight);
        Ok(())
    }

    fn create_world_pass(
        device: &Arc<VulkanDevice>,
        swapchain: &Swapchain,
        config: &Config,
    ) -> BackendResult<RenderPass> {
        RenderPass::new(
            device.clone(),
            RenderPassConfig::swapchain(
                WORLD_PASS,
                swapchain.format.format,
                swapchain.depth_format(),
                config.graphics.clear_color,
            ),
        )
    }

    /// Wait for the GPU and release everything. Safe to call more than once.
    pub fn shutdown(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };

        log::info!("Shutting down renderer backend");
        if let Err(e) = state.device.wait_idle() {
            log::error!("wait_idle failed during shutdown: {}", e);
        }
        for mesh in state.deferred_frees.flush() {
            state.release_mesh(mesh);
        }
        state.release_uniforms(false);
        drop(state);
    }

    /// Latch a new framebuffer extent. Applied by the next `prepare_frame`.
    pub fn on_resize(&mut self, width: u32, height: u32) {
        log::debug!("Resize latched: {}x{}", width, height);
        self.latch.latch(width, height);
    }

    pub fn set_camera(&mut self, view: Mat4, projection: Mat4) {
        self.camera = ViewProjection { view, projection };
    }

    pub fn create_material(
        &mut self,
        name: &str,
        kind: MaterialKind,
        params: MaterialParams,
    ) -> BackendResult<MaterialHandle> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;
        let render_pass = state
            .resources
            .render_pass(WORLD_PASS)
            .ok_or(BackendError::NotInitialized)?
            .handle;

        let uniform = state.uniform_heap.allocate_data(&[kind.pack(&params)])?;
        let material = Material::new(
            state.device.clone(),
            name,
            kind,
            params,
            state.uniform_heap.buffer(),
            uniform,
            render_pass,
            &self.config.shaders,
            state.resources.default_texture(),
            self.config.frames_in_flight(),
            self.config.graphics.max_objects,
        );
        let material = match material {
            Ok(material) => material,
            Err(e) => {
                let _ = state.uniform_heap.free_data_range_by_index(uniform.heap_index);
                return Err(e);
            }
        };
        state.materials.push(material);
        Ok(MaterialHandle(state.materials.len() - 1))
    }

    pub fn material(&self, handle: MaterialHandle) -> Option<&Material> {
        self.state.as_ref().and_then(|state| state.materials.get(handle.0))
    }

    /// Replace a material's parameters. The packed uniform goes to a new
    /// heap block; the old one is released once no frame in flight reads it.
    pub fn set_material_params(&mut self, handle: MaterialHandle, params: MaterialParams) -> BackendResult<()> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;
        let material = state
            .materials
            .get_mut(handle.0)
            .ok_or(BackendError::UnknownMaterial(handle.0))?;

        let uniform = state.uniform_heap.allocate_data(&[material.kind.pack(&params)])?;
        let previous = material.set_params(params, uniform);
        state.uniform_frees.defer(state.frames_submitted, previous.heap_index);
        log::debug!(
            "Material '{}' uniform moved to block {}",
            material.name,
            uniform.heap_index
        );
        Ok(())
    }

    /// Upload one mesh into the vertex and index heaps.
    pub fn upload_mesh_data(&mut self, vertices: &[Vertex], indices: &[u32]) -> BackendResult<MeshRef> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;

        let vertex = state.vertex_heap.allocate_data(vertices)?;
        let index = match state.index_heap.allocate_data(indices) {
            Ok(index) => index,
            Err(e) => {
                let _ = state.vertex_heap.free_data_range_by_index(vertex.heap_index);
                return Err(e);
            }
        };

        log::debug!(
            "Uploaded mesh: {} vertices (block {}), {} indices (block {})",
            vertex.element_count,
            vertex.heap_index,
            index.element_count,
            index.heap_index
        );

        Ok(MeshRef {
            vertex: vertex.heap_index,
            index: index.heap_index,
        })
    }

    /// Release a mesh once no frame in flight can still draw it.
    ///
    /// The handle is dead from this call on: freeing it again fails with
    /// `UnknownHeapIndex` instead of queueing a second release.
    pub fn free_mesh_data(&mut self, mesh: MeshRef) -> BackendResult<()> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;
        state.mesh_ranges(mesh)?;
        if !state.deferred_frees.defer(state.frames_submitted, mesh) {
            return Err(BackendError::UnknownHeapIndex(mesh.vertex));
        }
        Ok(())
    }

    /// Current vertex and index block of a live mesh. Meshes waiting to be
    /// released are reported as unknown.
    pub fn mesh_ranges(&self, mesh: MeshRef) -> BackendResult<(HeapAllocation, HeapAllocation)> {
        self.state
            .as_ref()
            .ok_or(BackendError::NotInitialized)?
            .mesh_ranges(mesh)
    }

    /// Texture by name, loaded through the texture loader on first use.
    pub fn get_texture(&mut self, name: &str, path: impl AsRef<Path>) -> BackendResult<Arc<Texture>> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;
        state
            .resources
            .get_texture(name, path.as_ref(), self.texture_loader.as_deref())
    }

    pub fn release_texture(&mut self, name: &str) -> bool {
        self.state
            .as_mut()
            .is_some_and(|state| state.resources.release_texture(name))
    }

    pub fn stats(&self) -> Option<RendererStats> {
        self.state.as_ref().map(|state| RendererStats {
            vertex_heap: state.vertex_heap.stats(),
            index_heap: state.index_heap.stats(),
            uniform_heap: state.uniform_heap.stats(),
            frames_submitted: state.frames_submitted,
            swapchain_generation: state.swapchain.generation(),
        })
    }

    /// Record this tick's draw list.
    ///
    /// `Ok(false)` means skip the tick: a recreation is running or just ran,
    /// the window has no area, the ring fence timed out, or no image could be
    /// acquired.
    ///
    /// Drawables are checked before an image is acquired, so an unknown
    /// material or a dead mesh fails the call without consuming an image.
    pub fn prepare_frame(&mut self, _delta_time: f32, drawables: &[Drawable]) -> BackendResult<bool> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;

        match self.latch.gate() {
            FrameGate::Proceed => {}
            FrameGate::Skip => {
                log::trace!("Frame skipped: swapchain unavailable");
                return Ok(false);
            }
            FrameGate::Recreate { width, height } => {
                let result = state.recreate(width, height, &self.config);
                self.latch.finish_recreate();
                result?;
                return Ok(false);
            }
        }

        if state.acquired_image.is_some() {
            log::warn!("prepare_frame called twice without frame");
            return Ok(false);
        }

        let timeout = self.config.fence_timeout_ns();
        let slot = state.swapchain.current_frame();
        if !state.frame_sync[slot].in_flight_fence.wait(timeout)? {
            return Ok(false);
        }

        for mesh in state.deferred_frees.retire(state.frames_submitted) {
            state.release_mesh(mesh);
        }
        state.release_uniforms(true);
        state.prepare_drawables(slot, drawables)?;

        let image_available = state.frame_sync[slot].image_available.handle();
        let Some(image_index) =
            state
                .swapchain
                .acquire_next_image_index(timeout, image_available, vk::Fence::null())?
        else {
            state.sync_swapchain(&self.config)?;
            return Ok(false);
        };

        state.record(slot, image_index, drawables, &self.camera)?;
        state.acquired_image = Some(image_index);
        Ok(true)
    }

    /// Submit what `prepare_frame` recorded and present it.
    pub fn frame(&mut self, _delta_time: f32) -> BackendResult<bool> {
        let state = self.state.as_mut().ok_or(BackendError::NotInitialized)?;
        let Some(image_index) = state.acquired_image.take() else {
            return Ok(false);
        };

        let slot = state.swapchain.current_frame();
        if let Some(guard) = state.images.guard(image_index) {
            if guard != slot {
                // Guard fences always have a submission behind them
                state.frame_sync[guard].in_flight_fence.wait(u64::MAX)?;
            }
        }
        state.images.assign(image_index, slot);

        let sync = &mut state.frame_sync[slot];
        sync.in_flight_fence.reset()?;

        let cmd = state.command_pool.get_mut(state.command_buffers[slot]);
        cmd.add_wait_semaphore(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            sync.image_available.handle(),
        );
        cmd.submit(
            &state.device.device,
            state.device.graphics_queue,
            &[sync.render_complete.handle()],
            sync.in_flight_fence.handle(),
        )?;
        state.frames_submitted += 1;

        let render_complete = sync.render_complete.handle();
        let outcome = state
            .swapchain
            .present(state.device.present_queue, render_complete, image_index)?;
        if outcome == PresentOutcome::Recreated {
            state.sync_swapchain(&self.config)?;
        }

        Ok(true)
    }
}

impl Drop for RendererBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BackendState {
    fn recreate(&mut self, width: u32, height: u32, config: &Config) -> BackendResult<()> {
        log::debug!("Recreating swapchain for {}x{}", width, height);
        if self.swapchain.recreate(width, height)? {
            self.sync_swapchain(config)?;
        }
        Ok(())
    }

    /// Rebuild everything derived from the swapchain if it changed since last time.
    fn sync_swapchain(&mut self, config: &Config) -> BackendResult<()> {
        if self.swapchain.generation() == self.swapchain_generation {
            return Ok(());
        }
        self.device.wait_idle()?;

        let render_pass = RendererBackend::create_world_pass(&self.device, &self.swapchain, config)?;
        self.swapchain.attach_render_pass(render_pass.handle)?;
        for material in &mut self.materials {
            material.on_resize(render_pass.handle)?;
        }
        self.resources.insert_render_pass(render_pass);

        self.images.reset(self.swapchain.image_count());
        self.acquired_image = None;
        self.swapchain_generation = self.swapchain.generation();
        log::debug!(
            "Swapchain generation {}: {}x{}",
            self.swapchain_generation,
            self.swapchain.extent.width,
            self.swapchain.extent.height
        );
        Ok(())
    }

    fn mesh_ranges(&self, mesh: MeshRef) -> BackendResult<(HeapAllocation, HeapAllocation)> {
        if self.deferred_frees.contains(&mesh) {
            return Err(BackendError::UnknownHeapIndex(mesh.vertex));
        }
        Ok((
            self.vertex_heap.get_data_range_by_index(mesh.vertex)?,
            self.index_heap.get_data_range_by_index(mesh.index)?,
        ))
    }

    /// Validate this tick's draw list and size every material's object
    /// storage for it. Runs after the ring fence wait, before acquire.
    fn prepare_drawables(&mut self, slot: usize, drawables: &[Drawable]) -> BackendResult<()> {
        for drawable in drawables {
            self.mesh_ranges(drawable.mesh)?;
        }
        let counts = objects_per_material(drawables, self.materials.len())?;
        for (material, count) in self.materials.iter_mut().zip(counts) {
            material.reserve_objects(slot, count)?;
        }
        Ok(())
    }

    /// Free retired material uniform blocks, or every pending one when
    /// `retired_only` is false and the device is idle.
    fn release_uniforms(&mut self, retired_only: bool) {
        let blocks = if retired_only {
            self.uniform_frees.retire(self.frames_submitted)
        } else {
            self.uniform_frees.flush()
        };
        for block in blocks {
            if let Err(e) = self.uniform_heap.free_data_range_by_index(block) {
                log::warn!("Failed to free uniform block {}: {}", block, e);
            }
        }
    }

    fn release_mesh(&mut self, mesh: MeshRef) {
        if let Err(e) = self.vertex_heap.free_data_range_by_index(mesh.vertex) {
            log::warn!("Failed to free vertex block {}: {}", mesh.vertex, e);
        }
        if let Err(e) = self.index_heap.free_data_range_by_index(mesh.index) {
            log::warn!("Failed to free index block {}: {}", mesh.index, e);
        }
    }

    fn record(
        &mut self,
        slot: usize,
        image_index: u32,
        drawables: &[Drawable],
        camera: &ViewProjection,
    ) -> BackendResult<()> {
        let device = &self.device.device;
        let extent = self.swapchain.extent;
        let framebuffer = self.swapchain.framebuffer(image_index);
        let render_pass = self
            .resources
            .render_pass(WORLD_PASS)
            .ok_or(BackendError::NotInitialized)?;

        let cmd = self.command_pool.get_mut(self.command_buffers[slot]);
        cmd.reset(device)?;
        cmd.begin(device, BeginFlags::default())?;

        let handle = cmd.recording_handle(CommandBufferOp::Record)?;
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            device.cmd_set_viewport(handle, 0, &[full_viewport(extent)]);
            device.cmd_set_scissor(handle, 0, &[scissor]);
        }

        render_pass.begin(cmd, framebuffer, extent)?;

        let mut seen = vec![false; self.materials.len()];
        for drawable in drawables {
            let material_index = drawable.material.0;
            let material = self
                .materials
                .get_mut(material_index)
                .ok_or(BackendError::UnknownMaterial(material_index))?;
            let handle = cmd.recording_handle(CommandBufferOp::Draw)?;

            material.bind_pipeline(handle)?;
            if !seen[material_index] {
                seen[material_index] = true;
                material.reset_descriptors(slot)?;
                material.set_global_uniform(handle, camera, slot)?;
            }
            material.set_model(handle, &drawable.model)?;
            material.update_descriptor(slot)?;
            material.bind_descriptor(handle, slot)?;

            let vertices = self.vertex_heap.get_data_range_by_index(drawable.mesh.vertex)?;
            let indices = self.index_heap.get_data_range_by_index(drawable.mesh.index)?;
            unsafe {
                device.cmd_bind_vertex_buffers(handle, 0, &[self.vertex_heap.buffer()], &[vertices.offset]);
                device.cmd_bind_index_buffer(handle, self.index_heap.buffer(), indices.offset, vk::IndexType::UINT32);
                device.cmd_draw_indexed(handle, indices.element_count, 1, 0, 0, 0);
            }
        }

        render_pass.end(cmd)?;
        cmd.end(device)?;
        Ok(())
    }
}
