// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section falls back to its defaults, so a partial file (or no file at
// all) still produces a complete configuration.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub heaps: HeapConfig,
    pub shaders: ShaderConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Strata Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// 0 waits forever
    pub fence_timeout_ms: u64,
    /// Objects each material can draw per frame
    pub max_objects: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            max_frames_in_flight: 2,
            fence_timeout_ms: 0,
            max_objects: 1024,
        }
    }
}

/// Sizes of the device-local vertex, index and material uniform heaps
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    pub vertex_mib: u64,
    pub index_mib: u64,
    pub uniform_mib: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            vertex_mib: 128,
            index_mib: 32,
            uniform_mib: 4,
        }
    }
}

/// Compiled SPIR-V for the built-in materials
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub unlit_vert: PathBuf,
    pub unlit_frag: PathBuf,
    pub physical_vert: PathBuf,
    pub physical_frag: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        Self {
            unlit_vert: PathBuf::from("shaders/unlit.vert.spv"),
            unlit_frag: PathBuf::from("shaders/unlit.frag.spv"),
            physical_vert: PathBuf::from("shaders/physical.vert.spv"),
            physical_frag: PathBuf::from("shaders/physical.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "strata_debug.log".to_string(),
            show_fps: true,
        }
    }
}

const MIB: u64 = 1024 * 1024;

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_toml(&content).with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Fence and acquire timeout in nanoseconds
    pub fn fence_timeout_ns(&self) -> u64 {
        match self.graphics.fence_timeout_ms {
            0 => u64::MAX,
            ms => ms.saturating_mul(1_000_000),
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    pub fn vertex_heap_bytes(&self) -> u64 {
        self.heaps.vertex_mib * MIB
    }

    pub fn index_heap_bytes(&self) -> u64 {
        self.heaps.index_mib * MIB
    }

    pub fn uniform_heap_bytes(&self) -> u64 {
        self.heaps.uniform_mib * MIB
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
        assert_eq!(config.vertex_heap_bytes(), 128 * MIB);
        assert_eq!(config.index_heap_bytes(), 32 * MIB);
        assert_eq!(config.uniform_heap_bytes(), 4 * MIB);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            [graphics]
            present_mode = "FIFO"
            fence_timeout_ms = 250

            [heaps]
            index_mib = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.fence_timeout_ns(), 250_000_000);
        assert_eq!(config.heaps.index_mib, 8);
        assert_eq!(config.heaps.vertex_mib, 128);
        assert_eq!(config.heaps.uniform_mib, 4);
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.graphics.max_objects, 1024);
    }

    #[test]
    fn test_unknown_present_mode_falls_back() {
        let mut config = Config::default();
        config.graphics.present_mode = "vsync-ish".into();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn test_zero_frames_in_flight_clamped() {
        let mut config = Config::default();
        config.graphics.max_frames_in_flight = 0;
        assert_eq!(config.frames_in_flight(), 1);
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::from_toml("[window\nwidth = ").is_err());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.window.height, 720);
    }
}
