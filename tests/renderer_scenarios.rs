// End-to-end frame scenarios against a real Vulkan driver.
//
// Run with `cargo test -- --ignored` on a machine with a driver that
// supports VK_EXT_headless_surface.

mod common;

use std::time::{Duration, Instant};

use common::{test_config, HeadlessProvider};
use glam::{Mat4, Vec4};
use strata_renderer::backend::command::{BeginFlags, CommandBufferState, CommandPool};
use strata_renderer::backend::device::DEPTH_FORMAT_CANDIDATES;
use strata_renderer::backend::sync::{Fence, Semaphore};
use strata_renderer::renderer::WORLD_PASS;
use strata_renderer::{BackendError, Config, Drawable, MaterialKind, MaterialParams, RendererBackend, Vertex};

fn quad() -> (Vec<Vertex>, Vec<u32>) {
    let normal = [0.0, 0.0, 1.0];
    let color = [1.0, 1.0, 1.0, 1.0];
    let vertices = vec![
        Vertex::new([-0.5, -0.5, 0.0], normal, [0.0, 0.0], color),
        Vertex::new([0.5, -0.5, 0.0], normal, [1.0, 0.0], color),
        Vertex::new([0.5, 0.5, 0.0], normal, [1.0, 1.0], color),
        Vertex::new([-0.5, 0.5, 0.0], normal, [0.0, 1.0], color),
    ];
    (vertices, vec![0, 1, 2, 2, 3, 0])
}

fn initialized(width: u32, height: u32) -> (RendererBackend, HeadlessProvider) {
    initialized_with(test_config(), width, height)
}

fn initialized_with(config: Config, width: u32, height: u32) -> (RendererBackend, HeadlessProvider) {
    let _ = env_logger::builder().is_test(true).try_init();
    let provider = HeadlessProvider::new(width, height);
    let mut renderer = RendererBackend::new(config);
    renderer.initialize(&provider).expect("initialize renderer");
    (renderer, provider)
}

fn run_frame(renderer: &mut RendererBackend) -> bool {
    renderer.prepare_frame(0.016, &[]).expect("prepare_frame") && renderer.frame(0.016).expect("frame")
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn initialize_builds_swapchain_and_world_pass() {
    let (renderer, _provider) = initialized(800, 600);

    let swapchain = renderer.swapchain().expect("swapchain");
    assert!(swapchain.image_count() >= 2);
    assert_eq!((swapchain.extent.width, swapchain.extent.height), (800, 600));

    let device = renderer.device().expect("device");
    assert!(DEPTH_FORMAT_CANDIDATES.contains(&device.depth_format));

    let world = renderer.render_pass(WORLD_PASS).expect("world render pass");
    let depth = world.config.depth_attachment.as_ref().expect("depth attachment");
    assert_eq!(depth.format, device.depth_format);
    assert_eq!(world.config.color_attachments[0].format, swapchain.format.format);
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn uploaded_meshes_do_not_alias() {
    let (mut renderer, _provider) = initialized(800, 600);
    let (vertices, indices) = quad();

    let first = renderer.upload_mesh_data(&vertices, &indices).unwrap();
    let second = renderer.upload_mesh_data(&vertices, &indices).unwrap();

    let (first_vertices, first_indices) = renderer.mesh_ranges(first).unwrap();
    let (second_vertices, second_indices) = renderer.mesh_ranges(second).unwrap();
    assert_eq!(first_vertices.element_count, 4);
    assert_eq!(first_indices.element_count, 6);
    assert_ne!(first.vertex, second.vertex);
    assert_ne!(first.index, second.index);
    assert_ne!(first_vertices.offset, second_vertices.offset);
    assert_ne!(first_indices.offset, second_indices.offset);

    let stats = renderer.stats().unwrap();
    assert_eq!(stats.vertex_heap.live_blocks, 2);
    assert_eq!(stats.index_heap.live_blocks, 2);
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn minimize_and_restore_recreates_once() {
    let (mut renderer, provider) = initialized(800, 600);
    assert!(run_frame(&mut renderer));
    let generation = renderer.stats().unwrap().swapchain_generation;

    provider.set_extent(0, 0);
    renderer.on_resize(0, 0);
    for _ in 0..3 {
        assert!(!renderer.prepare_frame(0.016, &[]).unwrap());
    }
    assert_eq!(renderer.stats().unwrap().swapchain_generation, generation);

    provider.set_extent(1024, 768);
    renderer.on_resize(1024, 768);
    // The recreation tick itself draws nothing
    assert!(!renderer.prepare_frame(0.016, &[]).unwrap());
    assert!(run_frame(&mut renderer));

    assert_eq!(renderer.stats().unwrap().swapchain_generation, generation + 1);
    let extent = renderer.swapchain().unwrap().extent;
    assert_eq!((extent.width, extent.height), (1024, 768));
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn frames_in_flight_never_deadlock() {
    let (mut renderer, _provider) = initialized(800, 600);

    let start = Instant::now();
    let mut presented = 0;
    for _ in 0..30 {
        if run_frame(&mut renderer) {
            presented += 1;
        }
    }

    assert_eq!(presented, 30);
    assert_eq!(renderer.stats().unwrap().frames_submitted, 30);
    assert!(start.elapsed() < Duration::from_secs(30));
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn freed_mesh_survives_frames_in_flight() {
    let (mut renderer, _provider) = initialized(800, 600);
    let (vertices, indices) = quad();
    let mesh = renderer.upload_mesh_data(&vertices, &indices).unwrap();

    renderer.free_mesh_data(mesh).unwrap();
    // The handle is dead at once, but the blocks stay allocated
    assert!(matches!(
        renderer.mesh_ranges(mesh),
        Err(BackendError::UnknownHeapIndex(_))
    ));
    assert_eq!(renderer.stats().unwrap().vertex_heap.live_blocks, 1);

    // Two frames in flight: the block is released on the third prepare
    for _ in 0..3 {
        assert!(run_frame(&mut renderer));
    }
    assert_eq!(renderer.stats().unwrap().vertex_heap.live_blocks, 0);
    assert_eq!(renderer.stats().unwrap().index_heap.live_blocks, 0);
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn second_free_never_releases_a_reused_block() {
    let (mut renderer, _provider) = initialized(800, 600);
    let (vertices, indices) = quad();
    let stale = renderer.upload_mesh_data(&vertices, &indices).unwrap();

    renderer.free_mesh_data(stale).unwrap();
    assert!(run_frame(&mut renderer));
    assert!(matches!(
        renderer.free_mesh_data(stale),
        Err(BackendError::UnknownHeapIndex(_))
    ));

    for _ in 0..3 {
        assert!(run_frame(&mut renderer));
    }
    let reused = renderer.upload_mesh_data(&vertices, &indices).unwrap();
    assert_eq!(reused, stale);

    for _ in 0..3 {
        assert!(run_frame(&mut renderer));
    }
    let (reused_vertices, reused_indices) = renderer.mesh_ranges(reused).unwrap();
    assert_eq!(reused_vertices.element_count, 4);
    assert_eq!(reused_indices.element_count, 6);
    assert_eq!(renderer.stats().unwrap().vertex_heap.live_blocks, 1);
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn draw_list_with_freed_mesh_is_rejected_before_acquire() {
    let (mut renderer, _provider) = initialized(800, 600);
    let (vertices, indices) = quad();
    let material = renderer
        .create_material("unlit", MaterialKind::Unlit, MaterialParams::default())
        .unwrap();
    let mesh = renderer.upload_mesh_data(&vertices, &indices).unwrap();
    renderer.free_mesh_data(mesh).unwrap();

    let drawables = [Drawable {
        material,
        model: Mat4::IDENTITY,
        mesh,
    }];
    assert!(matches!(
        renderer.prepare_frame(0.016, &drawables),
        Err(BackendError::UnknownHeapIndex(_))
    ));
    // Nothing was acquired, so the next tick runs normally
    assert!(run_frame(&mut renderer));
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn draw_list_larger_than_object_capacity_still_renders() {
    let mut config = test_config();
    config.graphics.max_objects = 4;
    let (mut renderer, _provider) = initialized_with(config, 800, 600);
    let (vertices, indices) = quad();
    let material = renderer
        .create_material("physical", MaterialKind::Physical, MaterialParams::default())
        .unwrap();
    let mesh = renderer.upload_mesh_data(&vertices, &indices).unwrap();

    let drawables: Vec<_> = (0..10)
        .map(|i| Drawable {
            material,
            model: Mat4::from_translation([i as f32, 0.0, 0.0].into()),
            mesh,
        })
        .collect();
    for _ in 0..3 {
        assert!(renderer.prepare_frame(0.016, &drawables).unwrap());
        assert!(renderer.frame(0.016).unwrap());
    }

    let material = renderer.material(material).unwrap();
    assert_eq!(material.object_capacity(0), 16);
    assert_eq!(material.object_capacity(1), 16);
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn material_params_move_to_a_new_uniform_block() {
    let (mut renderer, _provider) = initialized(800, 600);
    let handle = renderer
        .create_material("unlit", MaterialKind::Unlit, MaterialParams::default())
        .unwrap();
    let first = renderer.material(handle).unwrap().uniform_block();
    assert_eq!(renderer.stats().unwrap().uniform_heap.live_blocks, 1);

    let red = MaterialParams {
        diffuse_color: Vec4::new(1.0, 0.0, 0.0, 1.0),
        ..Default::default()
    };
    renderer.set_material_params(handle, red).unwrap();
    let material = renderer.material(handle).unwrap();
    assert_ne!(material.uniform_block().heap_index, first.heap_index);
    assert_eq!(material.params().diffuse_color, Vec4::new(1.0, 0.0, 0.0, 1.0));
    // The old block may still be read by frames in flight
    assert_eq!(renderer.stats().unwrap().uniform_heap.live_blocks, 2);

    for _ in 0..3 {
        assert!(run_frame(&mut renderer));
    }
    assert_eq!(renderer.stats().unwrap().uniform_heap.live_blocks, 1);
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn fence_signals_after_submission() {
    let (renderer, _provider) = initialized(800, 600);
    let device = renderer.device().unwrap().clone();

    let mut fence = Fence::new(device.clone(), false).unwrap();
    assert!(!fence.is_signaled());

    let mut pool = CommandPool::new(device.clone(), device.queue_families.graphics).unwrap();
    let id = pool.allocate(true).unwrap();
    let cmd = pool.get_mut(id);
    cmd.begin(&device.device, BeginFlags::single_use()).unwrap();
    cmd.end(&device.device).unwrap();
    cmd.submit(&device.device, device.graphics_queue, &[], fence.handle())
        .unwrap();

    assert!(fence.wait(u64::MAX).unwrap());
    assert!(fence.is_signaled());

    fence.reset().unwrap();
    assert!(!fence.is_signaled());
    device.wait_idle().unwrap();
}

#[test]
#[ignore = "requires a Vulkan driver"]
fn freed_command_buffer_slot_is_recycled() {
    let (renderer, _provider) = initialized(800, 600);
    let device = renderer.device().unwrap().clone();
    let mut fence = Fence::new(device.clone(), false).unwrap();
    let wait = Semaphore::new(device.clone()).unwrap();

    let mut pool = CommandPool::new(device.clone(), device.queue_families.graphics).unwrap();
    let id = pool.allocate(true).unwrap();
    let cmd = pool.get_mut(id);
    cmd.begin(&device.device, BeginFlags::single_use()).unwrap();
    cmd.end(&device.device).unwrap();
    cmd.submit(&device.device, device.graphics_queue, &[], fence.handle())
        .unwrap();
    assert!(fence.wait(u64::MAX).unwrap());
    assert_eq!(pool.get(id).state(), CommandBufferState::Submitted);

    pool.free(id);
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.get(id).state(), CommandBufferState::NotAllocated);
    assert!(matches!(
        pool.get_mut(id).begin(&device.device, BeginFlags::default()),
        Err(BackendError::InvalidCommandBufferState { .. })
    ));

    // Queue a wait that must not survive the recycling
    pool.get_mut(id)
        .add_wait_semaphore(ash::vk::PipelineStageFlags::ALL_COMMANDS, wait.handle());

    let recycled = pool.allocate(true).unwrap();
    assert_eq!(recycled, id);
    assert_eq!(pool.live_count(), 1);
    let cmd = pool.get(recycled);
    assert_eq!(cmd.state(), CommandBufferState::Ready);
    assert!(cmd.pending_waits().is_empty());
    assert!(cmd.submitted_waits().is_empty());

    // A secondary request never takes a freed primary slot
    pool.free(recycled);
    let secondary = pool.allocate(false).unwrap();
    assert_ne!(secondary, recycled);
    assert!(!pool.get(secondary).is_primary());
    device.wait_idle().unwrap();
}

#[test]
fn uninitialized_renderer_reports_not_initialized() {
    let mut renderer = RendererBackend::new(test_config());
    assert!(!renderer.is_initialized());
    assert!(matches!(
        renderer.prepare_frame(0.016, &[]),
        Err(BackendError::NotInitialized)
    ));
    assert!(matches!(
        renderer.upload_mesh_data(&[], &[]),
        Err(BackendError::NotInitialized)
    ));
    // Shutdown without initialize is a no-op
    renderer.shutdown();
    renderer.shutdown();
}
