use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::render::DisplayMode;

/// Environment variable that overrides `server.token`.
pub const TOKEN_ENV: &str = "MIMIC_TOKEN";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP API base (e.g. "http://localhost:8000")
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// WebSocket base. Derived from `api_base` when unset.
    #[serde(default)]
    pub ws_base: Option<String>,
    /// Bearer token for the API and the session socket
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// Preferred device id; first enumerated device when unset
    #[serde(default)]
    pub device: Option<String>,
    /// Requested width (ideal, not exact)
    #[serde(default = "default_camera_width")]
    pub width: u32,
    /// Requested height (ideal, not exact)
    #[serde(default = "default_camera_height")]
    pub height: u32,
    /// How many device indices the OpenCV backend probes
    #[serde(default = "default_probe_count")]
    pub probe_count: i32,
    /// Probe wait in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Frames sent per second while active
    #[serde(default = "default_capture_fps")]
    pub capture_fps: u32,
    /// Liveness ping interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Delay between `end_session` on the socket and the HTTP fallback
    #[serde(default = "default_end_delay_ms")]
    pub end_delay_ms: u64,
    /// Upper bound on the `connecting` phase
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Reference playback is only corrected beyond this drift (seconds)
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: f64,
    /// Outbound socket queue depth; frames beyond it are dropped
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// JPEG quality (0-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverlayConfig {
    /// Landmarks below this visibility are not drawn
    #[serde(default = "default_visibility_threshold")]
    pub visibility_threshold: f32,
    #[serde(default)]
    pub display_mode: DisplayMode,
    /// Joint radius in pixels
    #[serde(default = "default_joint_radius")]
    pub joint_radius: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_directory")]
    pub directory: PathBuf,
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_api_base() -> String { "http://localhost:8000".to_string() }
fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_probe_count() -> i32 { 10 }
fn default_probe_timeout_ms() -> u64 { 3000 }
fn default_capture_fps() -> u32 { 10 }
fn default_keepalive_secs() -> u64 { 30 }
fn default_end_delay_ms() -> u64 { 500 }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_drift_tolerance() -> f64 { 0.5 }
fn default_outbound_queue() -> usize { 8 }
fn default_jpeg_quality() -> i32 { 80 }
fn default_visibility_threshold() -> f32 { 0.3 }
fn default_joint_radius() -> i32 { 4 }
fn default_log_directory() -> PathBuf { PathBuf::from("logs") }
fn default_log_level() -> String { "info".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            ws_base: None,
            token: String::new(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: None,
            width: default_camera_width(),
            height: default_camera_height(),
            probe_count: default_probe_count(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capture_fps: default_capture_fps(),
            keepalive_secs: default_keepalive_secs(),
            end_delay_ms: default_end_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            drift_tolerance: default_drift_tolerance(),
            outbound_queue: default_outbound_queue(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            visibility_threshold: default_visibility_threshold(),
            display_mode: DisplayMode::default(),
            joint_radius: default_joint_radius(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_directory(),
            level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// WebSocket base URL, `http(s)` swapped for `ws(s)` when not configured.
    pub fn ws_base(&self) -> String {
        match &self.ws_base {
            Some(base) => base.clone(),
            None => {
                if let Some(rest) = self.api_base.strip_prefix("https://") {
                    format!("wss://{}", rest)
                } else if let Some(rest) = self.api_base.strip_prefix("http://") {
                    format!("ws://{}", rest)
                } else {
                    self.api_base.clone()
                }
            }
        }
    }
}

impl SessionConfig {
    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.capture_fps.max(1) as f64)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn end_delay(&self) -> Duration {
        Duration::from_millis(self.end_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        config.apply_env();
        Ok(config)
    }

    /// Missing or unreadable files fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path.as_ref()) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("config: {:#} (using defaults)", e);
                let mut config = Config::default();
                config.apply_env();
                config
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.server.token = token;
            }
        }
    }
}
