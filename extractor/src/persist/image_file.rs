use std::path::{Path, PathBuf};
use std::sync::Arc;

use frame_extract_common::filename::FilenameTemplate;
use frame_extract_common::frame::ImageFrame;
use image::{ImageError, ImageFormat};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::PersistError;

const RAW_EXTENSION: &str = ".raw";

/// One file per admitted frame, named by substituting the sequence number
/// into the template. `.raw` names get the pixel buffer verbatim; anything
/// else is converted to RGB and encoded in the format the extension implies.
pub struct ImageFileWriter {
    template: FilenameTemplate,
}

impl ImageFileWriter {
    pub fn new(template: FilenameTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &FilenameTemplate {
        &self.template
    }

    pub fn filename(&self, seq: u64) -> String {
        self.template.render(seq)
    }

    /// True unless the template names `.raw` files. Only the literal suffix
    /// can end a rendered name in `.raw`, so one rendering decides it.
    pub fn needs_rgb(&self) -> bool {
        !is_raw(&self.filename(0))
    }

    pub async fn save(&self, frame: Arc<ImageFrame>, seq: u64) -> Result<PathBuf, PersistError> {
        let filename = self.filename(seq);
        let path = PathBuf::from(&filename);

        if is_raw(&filename) {
            write_raw(&path, frame.data()).await?;
        } else {
            let target = path.clone();
            tokio::task::spawn_blocking(move || encode_to(&frame, &target))
                .await
                .map_err(|e| PersistError::Join(e.to_string()))??;
        }

        Ok(path)
    }
}

fn is_raw(filename: &str) -> bool {
    filename.ends_with(RAW_EXTENSION)
}

async fn write_raw(path: &Path, data: &[u8]) -> Result<(), PersistError> {
    let io_err = |source| PersistError::Io {
        path: path.display().to_string(),
        source,
    };
    let mut file = tokio::fs::File::create(path).await.map_err(io_err)?;
    file.write_all(data).await.map_err(io_err)?;
    file.flush().await.map_err(io_err)?;
    debug!(path = %path.display(), bytes = data.len(), "wrote raw frame");
    Ok(())
}

fn encode_to(frame: &ImageFrame, path: &Path) -> Result<(), PersistError> {
    let format = ImageFormat::from_path(path).map_err(|e| PersistError::Encode {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let rgb = frame.to_rgb_image()?;

    rgb.save_with_format(path, format).map_err(|e| match e {
        ImageError::IoError(source) => PersistError::Io {
            path: path.display().to_string(),
            source,
        },
        other => PersistError::Encode {
            path: path.display().to_string(),
            reason: other.to_string(),
        },
    })?;
    debug!(path = %path.display(), ?format, "encoded frame");
    Ok(())
}
