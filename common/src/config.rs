use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    /// V4L2 device index, i.e. /dev/video{device}.
    #[serde(default)]
    pub device: u32,
    /// Requested capture width. Advisory: the device may pick another
    /// size, and the assembler always uses the actual frame dimensions.
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default = "default_output_file")]
    pub output_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: 0,
            width: default_width(),
            height: default_height(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            duration_secs: default_duration_secs(),
        }
    }
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            output_dir: default_output_dir(),
            output_file: default_output_file(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_width() -> u32 {
    1920
}
fn default_height() -> u32 {
    1080
}
fn default_interval_secs() -> u64 {
    1
}
fn default_duration_secs() -> u64 {
    60
}
fn default_fps() -> f64 {
    24.0
}
fn default_output_dir() -> String {
    "output".into()
}
fn default_output_file() -> String {
    "timelapse.mp4".into()
}
fn default_log_level() -> String {
    "info".into()
}
