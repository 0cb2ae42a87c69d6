use std::path::{Path, PathBuf};
use std::process::Stdio;

use frame_extract_common::frame::ImageFrame;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::PersistError;

const FALLBACK_FPS: u32 = 30;

/// Appends admitted frames to a single MJPEG video through an ffmpeg
/// subprocess. The stream is opened on the first frame, whose size fixes the
/// video dimensions.
pub struct VideoWriter {
    path: PathBuf,
    fps: u32,
    stream: Mutex<Option<VideoStream>>,
}

struct VideoStream {
    child: Child,
    stdin: ChildStdin,
    stderr_tail: JoinHandle<String>,
    width: u32,
    height: u32,
    frame_count: u32,
}

impl VideoWriter {
    pub fn new(path: PathBuf, sec_per_frame: f64) -> Self {
        Self {
            path,
            fps: fps_for(sec_per_frame),
            stream: Mutex::new(None),
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub async fn save(&self, frame: &ImageFrame, seq: u64) -> Result<PathBuf, PersistError> {
        let bgr = frame.to_bgr24()?;
        let mut guard = self.stream.lock().await;

        let stream = match guard.take() {
            Some(stream) => stream,
            None => VideoStream::start(&self.path, frame.width(), frame.height(), self.fps).await?,
        };
        let stream = guard.insert(stream);

        if (frame.width(), frame.height()) != (stream.width, stream.height) {
            return Err(PersistError::Video(format!(
                "frame {seq} is {}x{}, video is {}x{}",
                frame.width(),
                frame.height(),
                stream.width,
                stream.height
            )));
        }

        stream
            .stdin
            .write_all(&bgr)
            .await
            .map_err(|e| PersistError::Video(format!("failed to write frame to ffmpeg: {e}")))?;
        stream.frame_count += 1;
        debug!(seq, frame_count = stream.frame_count, "pushed frame to video");

        Ok(self.path.clone())
    }

    /// Close ffmpeg's stdin and wait for it to finalize the container.
    /// Returns the number of frames written, or `None` if nothing was opened.
    pub async fn finish(&self) -> Result<Option<u32>, PersistError> {
        let Some(stream) = self.stream.lock().await.take() else {
            return Ok(None);
        };
        let VideoStream {
            mut child,
            stdin,
            stderr_tail,
            frame_count,
            ..
        } = stream;
        drop(stdin);

        let status = child
            .wait()
            .await
            .map_err(|e| PersistError::Video(format!("failed to wait for ffmpeg: {e}")))?;
        let last_line = stderr_tail.await.unwrap_or_default();
        if !status.success() {
            return Err(PersistError::Video(format!(
                "ffmpeg exited with {status}: {}",
                last_line.trim()
            )));
        }

        info!(
            path = %self.path.display(),
            frame_count,
            fps = self.fps,
            "video finalized"
        );
        Ok(Some(frame_count))
    }
}

impl VideoStream {
    async fn start(path: &Path, width: u32, height: u32, fps: u32) -> Result<Self, PersistError> {
        let size = format!("{width}x{height}");
        let rate = fps.to_string();

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error"])
            .args(["-f", "rawvideo", "-pix_fmt", "bgr24"])
            .args(["-s", &size, "-r", &rate])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "mjpeg", "-q:v", "3", "-y"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| PersistError::Video(format!("failed to spawn ffmpeg: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PersistError::Video("could not get ffmpeg stdin handle".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| PersistError::Video("could not get ffmpeg stderr handle".into()))?;
        let stderr_tail = tokio::spawn(drain_stderr(stderr));

        info!(path = %path.display(), size, fps, "video writer started");

        Ok(Self {
            child,
            stdin,
            stderr_tail,
            width,
            height,
            frame_count: 0,
        })
    }
}

/// Log ffmpeg diagnostics as they arrive so the pipe never fills while the
/// video is open. Returns the last line for error reports.
async fn drain_stderr(stderr: ChildStderr) -> String {
    let mut lines = BufReader::new(stderr).lines();
    let mut last = String::new();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                warn!(line = %line, "ffmpeg");
                last = line;
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "stopped reading ffmpeg stderr");
                break;
            }
        }
    }
    last
}

/// Whole frames per second matching the save interval, at least 1.
fn fps_for(sec_per_frame: f64) -> u32 {
    if sec_per_frame > 0.0 && sec_per_frame.is_finite() {
        ((1.0 / sec_per_frame) as u32).max(1)
    } else {
        FALLBACK_FPS
    }
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub async fn check_ffmpeg_available() {
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!("ffmpeg is available");
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; video output may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; video output will fail. \
                 Install ffmpeg or set extract.output = \"images\"."
            );
        }
    }
}
