// =============================================================================
// STRATA DEMO - drives the renderer backend from a winit window
// =============================================================================
//
// Two spinning cubes: one physical material with a procedural checker
// texture, one unlit. F11 toggles fullscreen, Space swaps the unlit cube's
// mesh (exercises deferred heap frees), Escape quits.
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use glam::{Mat4, Vec3, Vec4};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::c_char;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use strata_renderer::{
    BackendError, BackendResult, Config, Drawable, MaterialHandle, MaterialKind, MaterialParams, MeshRef,
    RendererBackend, SurfaceProvider, TextureData, TextureLoader, Vertex,
};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config).context("Failed to initialize logging")?;
    log::info!("Starting Strata demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging, to the configured file when enabled
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info).parse_default_env();

    if config.debug.log_to_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
            .with_context(|| format!("Failed to open log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

// =============================================================================
// SURFACE PROVIDER
// =============================================================================

struct WindowSurface {
    window: Arc<Window>,
}

impl SurfaceProvider for WindowSurface {
    fn required_instance_extensions(&self) -> BackendResult<Vec<*const c_char>> {
        let extensions = ash_window::enumerate_required_extensions(self.window.raw_display_handle())?;
        Ok(extensions.to_vec())
    }

    fn create_surface(&self, entry: &ash::Entry, instance: &ash::Instance) -> BackendResult<vk::SurfaceKHR> {
        unsafe {
            ash_window::create_surface(
                entry,
                instance,
                self.window.raw_display_handle(),
                self.window.raw_window_handle(),
                None,
            )
        }
        .map_err(|e| BackendError::Surface(format!("window surface creation failed: {:?}", e)))
    }

    fn framebuffer_extent(&self) -> (u32, u32) {
        let size = self.window.inner_size();
        (size.width, size.height)
    }
}

// =============================================================================
// DEMO CONTENT
// =============================================================================

/// Checkerboard pixels; the path only picks the tile size.
struct CheckerLoader;

impl TextureLoader for CheckerLoader {
    fn load(&self, path: &Path) -> Result<TextureData> {
        let tile = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.rsplit('_').next())
            .and_then(|size| size.parse::<u32>().ok())
            .unwrap_or(8)
            .max(1);
        Ok(checkerboard(64, tile))
    }
}

fn checkerboard(size: u32, tile: u32) -> TextureData {
    let mut rgba8 = Vec::with_capacity((size * size * 4) as usize);
    for y in 0..size {
        for x in 0..size {
            let light = ((x / tile) + (y / tile)) % 2 == 0;
            let value = if light { 235 } else { 40 };
            rgba8.extend_from_slice(&[value, value, value, 255]);
        }
    }
    TextureData {
        width: size,
        height: size,
        rgba8,
    }
}

/// Unit cube, counter-clockwise when seen from outside.
fn cube_mesh(color: Vec4) -> (Vec<Vertex>, Vec<u32>) {
    let faces = [
        (Vec3::X, Vec3::NEG_Z),
        (Vec3::NEG_X, Vec3::Z),
        (Vec3::Y, Vec3::X),
        (Vec3::NEG_Y, Vec3::X),
        (Vec3::Z, Vec3::X),
        (Vec3::NEG_Z, Vec3::NEG_X),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, u) in faces {
        let v = normal.cross(u);
        let base = vertices.len() as u32;
        let corners = [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)];
        for (a, b) in corners {
            let position = (normal + u * a + v * b) * 0.5;
            vertices.push(Vertex::new(
                position.to_array(),
                normal.to_array(),
                [(a + 1.0) * 0.5, (1.0 - b) * 0.5],
                color.to_array(),
            ));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

struct DemoScene {
    physical: MaterialHandle,
    unlit: MaterialHandle,
    cube: MeshRef,
    tinted_cube: MeshRef,
    tint_index: usize,
}

const TINTS: [Vec4; 3] = [
    Vec4::new(1.0, 0.6, 0.2, 1.0),
    Vec4::new(0.3, 0.9, 0.4, 1.0),
    Vec4::new(0.8, 0.3, 0.9, 1.0),
];

impl DemoScene {
    fn new(renderer: &mut RendererBackend) -> Result<Self> {
        let checker = renderer
            .get_texture("checker", "procedural/checker_8")
            .context("Failed to create checker texture")?;

        let physical = renderer
            .create_material(
                "checker_physical",
                MaterialKind::Physical,
                MaterialParams {
                    roughness: 0.35,
                    texture: Some(checker),
                    ..Default::default()
                },
            )
            .context("Failed to create physical material")?;
        let unlit = renderer
            .create_material("plain_unlit", MaterialKind::Unlit, MaterialParams::default())
            .context("Failed to create unlit material")?;

        let (vertices, indices) = cube_mesh(Vec4::ONE);
        let cube = renderer.upload_mesh_data(&vertices, &indices)?;
        let (vertices, indices) = cube_mesh(TINTS[0]);
        let tinted_cube = renderer.upload_mesh_data(&vertices, &indices)?;

        Ok(Self {
            physical,
            unlit,
            cube,
            tinted_cube,
            tint_index: 0,
        })
    }

    fn swap_tint(&mut self, renderer: &mut RendererBackend) -> Result<()> {
        self.tint_index = (self.tint_index + 1) % TINTS.len();
        let (vertices, indices) = cube_mesh(TINTS[self.tint_index]);
        let replacement = renderer.upload_mesh_data(&vertices, &indices)?;
        renderer.free_mesh_data(self.tinted_cube)?;
        self.tinted_cube = replacement;

        if let Some(stats) = renderer.stats() {
            log::info!(
                "Vertex heap: {} / {} bytes in {} blocks",
                stats.vertex_heap.used,
                stats.vertex_heap.capacity,
                stats.vertex_heap.live_blocks
            );
        }
        Ok(())
    }

    fn drawables(&self, time: f32) -> [Drawable; 2] {
        let spin = Mat4::from_rotation_y(time) * Mat4::from_rotation_x(time * 0.5);
        [
            Drawable {
                material: self.physical,
                model: Mat4::from_translation(Vec3::new(-0.9, 0.0, 0.0)) * spin,
                mesh: self.cube,
            },
            Drawable {
                material: self.unlit,
                model: Mat4::from_translation(Vec3::new(0.9, 0.0, 0.0)) * spin.inverse(),
                mesh: self.tinted_cube,
            },
        ]
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,
    renderer: RendererBackend,
    scene: Option<DemoScene>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        let mut renderer = RendererBackend::new(config.clone());
        renderer.set_texture_loader(Box::new(CheckerLoader));
        Self {
            config,
            renderer,
            scene: None,
            window: None,
            is_fullscreen,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_renderer(&mut self, window: Arc<Window>) -> Result<()> {
        let surface = WindowSurface { window };
        self.renderer
            .initialize(&surface)
            .context("Failed to initialize renderer backend")?;
        self.scene = Some(DemoScene::new(&mut self.renderer)?);
        Ok(())
    }

    /// Returns Ok(true) when a frame was presented.
    fn render_frame(&mut self) -> Result<bool> {
        let Some(scene) = self.scene.as_ref() else {
            return Ok(false);
        };
        let Some(window) = self.window.as_ref() else {
            return Ok(false);
        };

        let now = Instant::now();
        let delta_time = now.duration_since(self.last_frame_time).as_secs_f32();
        let time = now.duration_since(self.start_time).as_secs_f32();

        let size = window.inner_size();
        let aspect = size.width.max(1) as f32 / size.height.max(1) as f32;
        let mut projection = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 100.0);
        projection.y_axis.y *= -1.0; // Vulkan clip space is y-down
        let view = Mat4::look_at_rh(Vec3::new(0.0, 1.5, 4.0), Vec3::ZERO, Vec3::Y);
        self.renderer.set_camera(view, projection);

        let drawables = scene.drawables(time);
        if !self.renderer.prepare_frame(delta_time, &drawables)? {
            return Ok(false);
        }
        Ok(self.renderer.frame(delta_time)?)
    }

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn update_fps(&mut self) {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if !self.config.debug.show_fps {
            return;
        }

        // Update title every second
        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(window.clone()) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                self.renderer.on_resize(size.width, size.height);
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() && !event.repeat {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            KeyCode::Space => {
                                if let Some(scene) = self.scene.as_mut() {
                                    if let Err(e) = scene.swap_tint(&mut self.renderer) {
                                        log::error!("Mesh swap failed: {:?}", e);
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.scene = None;
        self.renderer.shutdown();
    }
}
