pub mod image_file;
pub mod video;

use std::path::PathBuf;
use std::sync::Arc;

use frame_extract_common::config::{ConfigError, ExtractConfig, OutputMode};
use frame_extract_common::frame::{ImageFrame, PixelError};

use self::image_file::ImageFileWriter;
use self::video::VideoWriter;

/// Writes admitted frames. Which variant is used comes from `extract.output`;
/// both share the same `save` contract and never touch the gate.
pub enum Persister {
    Images(ImageFileWriter),
    Video(VideoWriter),
}

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode {path}: {reason}")]
    Encode { path: String, reason: String },
    #[error("unable to convert image: {0}")]
    Conversion(#[from] PixelError),
    #[error("video writer: {0}")]
    Video(String),
    #[error("write task failed: {0}")]
    Join(String),
}

impl Persister {
    pub fn from_config(config: &ExtractConfig) -> Result<Self, ConfigError> {
        Ok(match config.output {
            OutputMode::Images => Persister::Images(ImageFileWriter::new(config.template()?)),
            OutputMode::Video => Persister::Video(VideoWriter::new(
                config.video_path.clone(),
                config.sec_per_frame,
            )),
        })
    }

    /// Write one admitted frame and return where it went.
    pub async fn save(&self, frame: Arc<ImageFrame>, seq: u64) -> Result<PathBuf, PersistError> {
        match self {
            Persister::Images(writer) => writer.save(frame, seq).await,
            Persister::Video(writer) => writer.save(&frame, seq).await,
        }
    }

    /// Whether frames must be convertible to RGB to be saved.
    pub fn needs_rgb(&self) -> bool {
        match self {
            Persister::Images(writer) => writer.needs_rgb(),
            Persister::Video(_) => true,
        }
    }

    /// Whether saves may run in parallel. Image files are distinct per
    /// sequence number; video frames must be appended in order.
    pub fn concurrent(&self) -> bool {
        matches!(self, Persister::Images(_))
    }

    /// Flush anything still open (the video container).
    pub async fn finish(&self) -> Result<(), PersistError> {
        match self {
            Persister::Images(_) => Ok(()),
            Persister::Video(writer) => writer.finish().await.map(|_| ()),
        }
    }
}
