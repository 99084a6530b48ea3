// Materials
//
// A material owns its pipeline and the descriptor state for every frame in
// flight. Set 0 holds the per-frame camera uniform, set 1 the material
// uniform plus a texture. The material uniform lives in a block of the
// uniform heap; changing the parameters moves it to a new block. Object sets
// come from a per-frame pool that is reset wholesale once that frame's fence
// has been waited, and that grows when a frame draws more objects than it has
// room for.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};
use gpu_allocator::MemoryLocation;
use std::mem::size_of;
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::buffer::GpuBuffer;
use crate::backend::heap::HeapAllocation;
use crate::backend::pipeline::{Pipeline, MODEL_PUSH_CONSTANT_SIZE};
use crate::backend::shader::ShaderModule;
use crate::backend::texture::Texture;
use crate::backend::VulkanDevice;
use crate::config::ShaderConfig;
use crate::error::{BackendError, BackendResult};

/// Camera state shared by every material in a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewProjection {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for ViewProjection {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

/// Set 0, binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct GlobalUniform {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    /// xyz direction towards the light, w unused
    pub light_direction: Vec4,
}

impl GlobalUniform {
    pub fn new(camera: &ViewProjection) -> Self {
        Self {
            view: camera.view,
            projection: camera.projection,
            view_projection: camera.projection * camera.view,
            light_direction: Vec3::new(0.4, 1.0, 0.6).normalize().extend(0.0),
        }
    }
}

/// Set 1, binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MaterialUniform {
    pub diffuse_color: Vec4,
    /// x roughness, y metallic
    pub surface: Vec4,
}

#[derive(Clone)]
pub struct MaterialParams {
    pub diffuse_color: Vec4,
    pub roughness: f32,
    pub metallic: f32,
    /// Falls back to the 1x1 white texture
    pub texture: Option<Arc<Texture>>,
}

impl Default for MaterialParams {
    fn default() -> Self {
        Self {
            diffuse_color: Vec4::ONE,
            roughness: 0.5,
            metallic: 0.0,
            texture: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaterialKind {
    Unlit,
    Physical,
    Custom { vertex: PathBuf, fragment: PathBuf },
}

impl MaterialKind {
    pub fn shader_paths(&self, shaders: &ShaderConfig) -> (PathBuf, PathBuf) {
        match self {
            MaterialKind::Unlit => (shaders.unlit_vert.clone(), shaders.unlit_frag.clone()),
            MaterialKind::Physical => (shaders.physical_vert.clone(), shaders.physical_frag.clone()),
            MaterialKind::Custom { vertex, fragment } => (vertex.clone(), fragment.clone()),
        }
    }

    /// Unlit shaders never read the surface terms, so they are left zeroed.
    pub fn pack(&self, params: &MaterialParams) -> MaterialUniform {
        let surface = match self {
            MaterialKind::Unlit => Vec4::ZERO,
            MaterialKind::Physical | MaterialKind::Custom { .. } => {
                Vec4::new(params.roughness.clamp(0.04, 1.0), params.metallic.clamp(0.0, 1.0), 0.0, 0.0)
            }
        };
        MaterialUniform {
            diffuse_color: params.diffuse_color,
            surface,
        }
    }
}

/// Object capacity after growing to hold `requested` objects.
pub fn grown_capacity(current: u32, requested: u32) -> u32 {
    if requested <= current {
        return current;
    }
    requested.checked_next_power_of_two().unwrap_or(u32::MAX)
}

struct MaterialFrame {
    global_buffer: GpuBuffer,
    global_set: vk::DescriptorSet,
    object_pool: vk::DescriptorPool,
    object_capacity: u32,
    object_count: u32,
    current_set: vk::DescriptorSet,
}

pub struct Material {
    pub name: String,
    pub kind: MaterialKind,
    params: MaterialParams,
    uniform_buffer: vk::Buffer,
    uniform: HeapAllocation,
    pipeline: Option<Pipeline>,
    global_layout: vk::DescriptorSetLayout,
    object_layout: vk::DescriptorSetLayout,
    global_pool: vk::DescriptorPool,
    frames: Vec<MaterialFrame>,
    shaders: (PathBuf, PathBuf),
    default_texture: Arc<Texture>,
    initial_objects: u32,
    device: Arc<VulkanDevice>,
}

impl Material {
    /// `uniform` must hold `kind.pack(&params)` inside `uniform_buffer`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        kind: MaterialKind,
        params: MaterialParams,
        uniform_buffer: vk::Buffer,
        uniform: HeapAllocation,
        render_pass: vk::RenderPass,
        shaders: &ShaderConfig,
        default_texture: Arc<Texture>,
        frames_in_flight: usize,
        max_objects: u32,
    ) -> BackendResult<Self> {
        let global_layout = create_global_layout(&device)?;
        let object_layout = create_object_layout(&device)?;

        let mut material = Self {
            name: name.to_string(),
            shaders: kind.shader_paths(shaders),
            kind,
            params,
            uniform_buffer,
            uniform,
            pipeline: None,
            global_layout,
            object_layout,
            global_pool: vk::DescriptorPool::null(),
            frames: Vec::with_capacity(frames_in_flight),
            default_texture,
            initial_objects: max_objects.max(1),
            device,
        };

        material.create_frames(frames_in_flight)?;
        material.on_resize(render_pass)?;

        log::info!("Created {:?} material '{}'", material.kind, material.name);
        Ok(material)
    }

    fn create_frames(&mut self, frames_in_flight: usize) -> BackendResult<()> {
        let device = &self.device.device;

        let global_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: frames_in_flight as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(frames_in_flight as u32)
            .pool_sizes(&global_sizes);
        self.global_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }?;

        let layouts = vec![self.global_layout; frames_in_flight];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.global_pool)
            .set_layouts(&layouts);
        let global_sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }?;

        for (frame, global_set) in global_sets.into_iter().enumerate() {
            let global_buffer = GpuBuffer::new(
                self.device.clone(),
                &format!("{} globals {}", self.name, frame),
                size_of::<GlobalUniform>() as u64,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
            )?;

            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: global_buffer.buffer,
                offset: 0,
                range: size_of::<GlobalUniform>() as u64,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(global_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build();
            unsafe { device.update_descriptor_sets(&[write], &[]) };

            let object_pool = self.create_object_pool(self.initial_objects)?;

            self.frames.push(MaterialFrame {
                global_buffer,
                global_set,
                object_pool,
                object_capacity: self.initial_objects,
                object_count: 0,
                current_set: vk::DescriptorSet::null(),
            });
        }
        Ok(())
    }

    fn create_object_pool(&self, capacity: u32) -> BackendResult<vk::DescriptorPool> {
        let object_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: capacity,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(capacity)
            .pool_sizes(&object_sizes);
        Ok(unsafe { self.device.device.create_descriptor_pool(&pool_info, None) }?)
    }

    /// Make room for `count` objects in `frame`. Only after that frame's fence.
    pub fn reserve_objects(&mut self, frame: usize, count: u32) -> BackendResult<()> {
        let slot = frame % self.frames.len();
        let current = self.frames[slot].object_capacity;
        let capacity = grown_capacity(current, count);
        if capacity == current {
            return Ok(());
        }

        let object_pool = self.create_object_pool(capacity)?;
        let frame_state = &mut self.frames[slot];
        let old_pool = std::mem::replace(&mut frame_state.object_pool, object_pool);
        frame_state.object_capacity = capacity;
        frame_state.object_count = 0;
        frame_state.current_set = vk::DescriptorSet::null();
        unsafe { self.device.device.destroy_descriptor_pool(old_pool, None) };

        log::debug!(
            "Material '{}' frame {} grew to {} objects",
            self.name,
            slot,
            capacity
        );
        Ok(())
    }

    pub fn object_capacity(&self, frame: usize) -> u32 {
        self.frames[frame % self.frames.len()].object_capacity
    }

    pub fn params(&self) -> &MaterialParams {
        &self.params
    }

    /// Heap block holding the packed material uniform
    pub fn uniform_block(&self) -> HeapAllocation {
        self.uniform
    }

    /// Switch to new parameters already packed into `uniform`. Returns the
    /// previous block, which frames in flight may still read.
    pub fn set_params(&mut self, params: MaterialParams, uniform: HeapAllocation) -> HeapAllocation {
        self.params = params;
        std::mem::replace(&mut self.uniform, uniform)
    }

    /// Rebuild the pipeline against a new render pass. The device must be idle.
    pub fn on_resize(&mut self, render_pass: vk::RenderPass) -> BackendResult<()> {
        self.pipeline = None;

        let (vertex_path, fragment_path) = &self.shaders;
        let vertex = ShaderModule::from_file(self.device.clone(), vertex_path, vk::ShaderStageFlags::VERTEX)?;
        let fragment = ShaderModule::from_file(self.device.clone(), fragment_path, vk::ShaderStageFlags::FRAGMENT)?;

        let set_layouts = [self.global_layout, self.object_layout];
        self.pipeline = Some(Pipeline::new(
            self.device.clone(),
            render_pass,
            &[&vertex, &fragment],
            &set_layouts,
        )?);

        log::debug!("Rebuilt pipeline for material '{}'", self.name);
        Ok(())
    }

    fn pipeline(&self) -> BackendResult<&Pipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| BackendError::Shader(format!("material '{}' has no pipeline", self.name)))
    }

    fn frame_mut(&mut self, frame: usize) -> &mut MaterialFrame {
        let slot = frame % self.frames.len();
        &mut self.frames[slot]
    }

    pub fn bind_pipeline(&self, cmd: vk::CommandBuffer) -> BackendResult<()> {
        self.pipeline()?.bind(cmd);
        Ok(())
    }

    /// Write this frame's camera uniform and bind set 0.
    pub fn set_global_uniform(
        &mut self,
        cmd: vk::CommandBuffer,
        camera: &ViewProjection,
        frame: usize,
    ) -> BackendResult<()> {
        let uniform = GlobalUniform::new(camera);
        let frame_state = self.frame_mut(frame);
        frame_state.global_buffer.write(0, bytemuck::bytes_of(&uniform))?;
        let global_set = frame_state.global_set;

        let layout = self.pipeline()?.layout;
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                0,
                &[global_set],
                &[],
            );
        }
        Ok(())
    }

    pub fn set_model(&self, cmd: vk::CommandBuffer, model: &Mat4) -> BackendResult<()> {
        let layout = self.pipeline()?.layout;
        let bytes = bytemuck::bytes_of(model);
        debug_assert_eq!(bytes.len(), MODEL_PUSH_CONSTANT_SIZE as usize);
        unsafe {
            self.device
                .device
                .cmd_push_constants(cmd, layout, vk::ShaderStageFlags::VERTEX, 0, bytes);
        }
        Ok(())
    }

    /// Allocate the next object descriptor set of `frame`, pointing at the
    /// material uniform and texture. Returns the object index.
    pub fn update_descriptor(&mut self, frame: usize) -> BackendResult<u32> {
        let texture = self
            .params
            .texture
            .clone()
            .unwrap_or_else(|| self.default_texture.clone());
        let uniform_buffer = self.uniform_buffer;
        let uniform_offset = self.uniform.offset;
        let object_layout = self.object_layout;
        let device = self.device.clone();

        let frame_state = self.frame_mut(frame);
        let object = frame_state.object_count;
        if object >= frame_state.object_capacity {
            return Err(BackendError::ObjectLimitReached(frame_state.object_capacity));
        }

        let layouts = [object_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(frame_state.object_pool)
            .set_layouts(&layouts);
        let set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }?[0];

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: uniform_buffer,
            offset: uniform_offset,
            range: size_of::<MaterialUniform>() as u64,
        }];
        let image_info = [texture.descriptor_info()];
        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(&image_info)
                .build(),
        ];
        unsafe { device.device.update_descriptor_sets(&writes, &[]) };

        frame_state.object_count += 1;
        frame_state.current_set = set;
        Ok(object)
    }

    /// Bind the set written by the last `update_descriptor` as set 1.
    pub fn bind_descriptor(&self, cmd: vk::CommandBuffer, frame: usize) -> BackendResult<()> {
        let set = self.frames[frame % self.frames.len()].current_set;
        let layout = self.pipeline()?.layout;
        unsafe {
            self.device.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                1,
                &[set],
                &[],
            );
        }
        Ok(())
    }

    /// Recycle every object set of `frame`. Only after that frame's fence.
    pub fn reset_descriptors(&mut self, frame: usize) -> BackendResult<()> {
        let device = self.device.clone();
        let frame_state = self.frame_mut(frame);
        unsafe {
            device
                .device
                .reset_descriptor_pool(frame_state.object_pool, vk::DescriptorPoolResetFlags::empty())
        }?;
        frame_state.object_count = 0;
        frame_state.current_set = vk::DescriptorSet::null();
        Ok(())
    }
}

impl Drop for Material {
    fn drop(&mut self) {
        self.pipeline = None;
        unsafe {
            for frame in &self.frames {
                self.device.device.destroy_descriptor_pool(frame.object_pool, None);
            }
            self.device.device.destroy_descriptor_pool(self.global_pool, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.object_layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.global_layout, None);
        }
    }
}

fn create_global_layout(device: &VulkanDevice) -> BackendResult<vk::DescriptorSetLayout> {
    let bindings = [vk::DescriptorSetLayoutBinding::builder()
        .binding(0)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .descriptor_count(1)
        .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
        .build()];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    Ok(unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }?)
}

fn create_object_layout(device: &VulkanDevice) -> BackendResult<vk::DescriptorSetLayout> {
    let bindings = [
        vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
        vk::DescriptorSetLayoutBinding::builder()
            .binding(1)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build(),
    ];
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
    Ok(unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }?)
}
