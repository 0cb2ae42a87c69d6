use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::filename::FilenameTemplate;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    pub brokers: String,
    #[serde(default = "default_image_topic")]
    pub image_topic: String,
    #[serde(default = "default_unlock_topic")]
    pub unlock_topic: String,
    #[serde(default = "default_group_id")]
    pub group_id: String,
    #[serde(default)]
    pub transport: Transport,
}

/// How frames are carried on the image topic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Binary envelope with raw pixels (see `frame::ImageFrame::deserialize`).
    #[default]
    Raw,
    /// Timestamp followed by an encoded image (JPEG, PNG, ...).
    Compressed,
}

impl std::str::FromStr for Transport {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "raw" => Ok(Transport::Raw),
            "compressed" => Ok(Transport::Compressed),
            other => Err(ConfigError::Invalid(format!(
                "unknown transport {other:?}, expected 'raw' or 'compressed'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_filename_format")]
    pub filename_format: String,
    #[serde(default = "default_sec_per_frame")]
    pub sec_per_frame: f64,
    /// Require an unlock message between consecutive saves.
    #[serde(default)]
    pub key_lock: bool,
    #[serde(default)]
    pub output: OutputMode,
    #[serde(default = "default_video_path")]
    pub video_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    /// One file per admitted frame, named from `filename_format`.
    #[default]
    Images,
    /// All admitted frames appended to a single MJPEG video.
    Video,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            filename_format: default_filename_format(),
            sec_per_frame: default_sec_per_frame(),
            key_lock: false,
            output: OutputMode::default(),
            video_path: default_video_path(),
        }
    }
}

impl ExtractConfig {
    pub fn template(&self) -> Result<FilenameTemplate, ConfigError> {
        FilenameTemplate::parse(&self.filename_format)
            .map_err(|e| ConfigError::Invalid(format!("filename_format: {e}")))
    }

    pub fn min_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.sec_per_frame)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
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
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let spf = self.extract.sec_per_frame;
        if !spf.is_finite() || spf < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "sec_per_frame must be a finite number >= 0, got {spf}"
            )));
        }
        self.extract.template()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_image_topic() -> String {
    "image".into()
}
fn default_unlock_topic() -> String {
    "key_topic".into()
}
fn default_group_id() -> String {
    "extract-images".into()
}
fn default_filename_format() -> String {
    "frame%04d.jpg".into()
}
fn default_sec_per_frame() -> f64 {
    0.1
}
fn default_video_path() -> PathBuf {
    PathBuf::from("video.avi")
}
fn default_log_level() -> String {
    "info".into()
}
