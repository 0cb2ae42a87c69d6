use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use frame_extract_common::frame::{ImageFrame, PixelError};
use futures_util::{Stream, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::gate::{Decision, FrameGate};
use crate::persist::{PersistError, Persister};

/// Per-process counters, logged periodically and at shutdown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub received: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub skipped: u64,
}

/// Why [`Extractor::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    StreamEnded,
}

/// Frame-arrival handler: asks the gate, then hands admitted frames to the
/// persister. Writes to distinct files run in the background so a slow disk
/// never delays the next decision.
pub struct Extractor {
    gate: Arc<FrameGate>,
    persister: Arc<Persister>,
    writes: JoinSet<()>,
    stats: FrameStats,
}

impl Extractor {
    pub fn new(gate: Arc<FrameGate>, persister: Arc<Persister>) -> Self {
        Self {
            gate,
            persister,
            writes: JoinSet::new(),
            stats: FrameStats::default(),
        }
    }

    /// Shared with the unlock consumer.
    pub fn gate(&self) -> &Arc<FrameGate> {
        &self.gate
    }

    /// Feed frames until the stream ends or `shutdown` resolves. Shutdown is
    /// only observed between frames, so a save in progress always completes.
    pub async fn run<S, F>(&mut self, frames: S, shutdown: F) -> StopReason
    where
        S: Stream<Item = ImageFrame>,
        F: Future<Output = ()>,
    {
        tokio::pin!(frames);
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                () = &mut shutdown => return StopReason::Shutdown,
                next = frames.next() => match next {
                    Some(frame) => self.handle_frame(frame).await,
                    None => return StopReason::StreamEnded,
                },
            }
        }
    }

    pub async fn handle_frame(&mut self, mut frame: ImageFrame) {
        self.stats.received += 1;
        if self.stats.received % 100 == 0 {
            debug!(stats = ?self.stats, "frames processed");
        }

        let seq = match self.gate.on_frame_arrived(&mut frame) {
            Decision::Admit(seq) => seq,
            Decision::Reject => {
                self.stats.rejected += 1;
                return;
            }
            Decision::Skip(PixelError::Empty) => {
                self.stats.skipped += 1;
                warn!(stamp = %frame.captured_at(), "couldn't save image, no data");
                return;
            }
            Decision::Skip(e) => {
                self.stats.skipped += 1;
                error!(
                    encoding = %frame.encoding(),
                    width = frame.width(),
                    height = frame.height(),
                    error = %e,
                    "unable to convert image, skipping"
                );
                return;
            }
        };
        self.stats.admitted += 1;

        let frame = Arc::new(frame);
        if self.persister.concurrent() {
            let persister = Arc::clone(&self.persister);
            self.writes.spawn(async move {
                report(seq, persister.save(frame, seq).await);
            });
            // Reap finished writes so the set does not grow unbounded.
            while self.writes.try_join_next().is_some() {}
        } else {
            report(seq, self.persister.save(frame, seq).await);
        }
    }

    /// Wait for in-flight writes and finalize the output.
    pub async fn shutdown(mut self) -> FrameStats {
        while let Some(res) = self.writes.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "write task panicked");
            }
        }
        if let Err(e) = self.persister.finish().await {
            warn!(error = %e, "failed to finalize output");
        }
        info!(
            received = self.stats.received,
            admitted = self.stats.admitted,
            rejected = self.stats.rejected,
            skipped = self.stats.skipped,
            next_sequence = self.gate.next_sequence(),
            "extractor stopped"
        );
        self.stats
    }
}

fn report(seq: u64, result: Result<PathBuf, PersistError>) {
    match result {
        Ok(path) => info!(seq, path = %path.display(), "saved image"),
        Err(e) => warn!(seq, error = %e, "failed to save image"),
    }
}
