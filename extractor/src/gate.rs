use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frame_extract_common::frame::{ImageFrame, PixelError};
use tokio::time::Instant;
use tracing::debug;

/// Outcome of offering one frame to the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Save the frame under this sequence number.
    Admit(u64),
    /// Too soon after the last save, or waiting for an unlock.
    Reject,
    /// The timing and lock checks passed but the frame holds no usable
    /// pixels. The clock and lock advanced; no sequence number was consumed.
    Skip(PixelError),
}

struct GateState {
    last_save: Instant,
    locked: bool,
    sequence: u64,
}

/// Throttle and optional key lock shared by the frame and unlock handlers.
///
/// All state lives behind one mutex. Decisions are pure computation, so the
/// lock is never held across I/O; callers write the file after the decision
/// returns.
pub struct FrameGate {
    state: Mutex<GateState>,
    min_interval: Duration,
    key_lock: bool,
    require_rgb: bool,
}

impl FrameGate {
    pub fn new(min_interval: Duration, key_lock: bool) -> Self {
        Self::starting_at(min_interval, key_lock, Instant::now())
    }

    /// Build a gate whose throttle clock starts at `start`.
    pub fn starting_at(min_interval: Duration, key_lock: bool, start: Instant) -> Self {
        Self {
            state: Mutex::new(GateState {
                last_save: start,
                locked: false,
                sequence: 0,
            }),
            min_interval,
            key_lock,
            require_rgb: false,
        }
    }

    /// Also skip frames whose encoding cannot be converted to RGB. Set when
    /// the persister encodes images rather than dumping raw bytes.
    pub fn requiring_rgb(mut self, require_rgb: bool) -> Self {
        self.require_rgb = require_rgb;
        self
    }

    pub fn on_frame_arrived(&self, frame: &mut ImageFrame) -> Decision {
        self.on_frame_arrived_at(frame, Instant::now())
    }

    pub fn on_frame_arrived_at(&self, frame: &mut ImageFrame, now: Instant) -> Decision {
        let mut state = self.lock();

        if frame.normalize_encoding() {
            debug!("bayer frame relabelled as mono8");
        }

        let elapsed = now.saturating_duration_since(state.last_save);
        let unlocked = !self.key_lock || !state.locked;
        if elapsed < self.min_interval || !unlocked {
            return Decision::Reject;
        }

        if self.key_lock {
            state.locked = true;
        }
        state.last_save = now;

        let usable = if self.require_rgb {
            frame.check_convertible()
        } else {
            frame.check_pixels()
        };
        if let Err(e) = usable {
            return Decision::Skip(e);
        }

        let seq = state.sequence;
        state.sequence += 1;
        Decision::Admit(seq)
    }

    /// Clear the key lock. Harmless when key lock is disabled or already clear.
    /// Returns whether the gate was locked.
    pub fn on_unlock(&self) -> bool {
        std::mem::replace(&mut self.lock().locked, false)
    }

    /// The sequence number the next admitted frame will get.
    pub fn next_sequence(&self) -> u64 {
        self.lock().sequence
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.lock().locked
    }

    pub fn key_lock(&self) -> bool {
        self.key_lock
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // GateState has no invariant a panicking holder could break halfway.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame_extract_common::frame::Encoding;
    use std::sync::Arc;

    fn frame() -> ImageFrame {
        ImageFrame::new(vec![0; 100], Encoding::Mono8, 10, 10, 0)
    }

    fn empty_frame() -> ImageFrame {
        ImageFrame::new(vec![], Encoding::Mono8, 10, 10, 0)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn throttles_to_one_frame_per_interval() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(100), false, t0);

        let mut admitted = Vec::new();
        // One arrival every 30ms for one second.
        for i in 0..=33 {
            let at = t0 + ms(30 * i);
            if let Decision::Admit(seq) = gate.on_frame_arrived_at(&mut frame(), at) {
                admitted.push((i * 30, seq));
            }
        }

        let seqs: Vec<u64> = admitted.iter().map(|&(_, s)| s).collect();
        assert_eq!(seqs, (0..seqs.len() as u64).collect::<Vec<_>>());
        for pair in admitted.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= 100, "saves too close: {pair:?}");
        }
        // Admitted at 120, 240, ..., 960.
        assert_eq!(admitted.len(), 8);
        assert_eq!(admitted[0].0, 120);
    }

    #[test]
    fn first_frame_waits_for_interval_since_start() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(100), false, t0);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(50)), Decision::Reject);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(100)), Decision::Admit(0));
    }

    #[test]
    fn zero_interval_admits_everything() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(Duration::ZERO, false, t0);
        for expected in 0..3 {
            assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(expected));
        }
        assert_eq!(gate.next_sequence(), 3);
    }

    #[test]
    fn key_lock_blocks_until_unlock() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(10), true, t0);
        assert!(!gate.is_locked());

        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(10)), Decision::Admit(0));
        assert!(gate.is_locked());

        // Time alone never reopens the gate.
        for secs in [1, 10, 3600] {
            let at = t0 + Duration::from_secs(secs);
            assert_eq!(gate.on_frame_arrived_at(&mut frame(), at), Decision::Reject);
        }

        gate.on_unlock();
        assert!(!gate.is_locked());
        let at = t0 + Duration::from_secs(3601);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), at), Decision::Admit(1));
        assert!(gate.is_locked());
    }

    #[test]
    fn unlock_still_respects_interval() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(100), true, t0);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(100)), Decision::Admit(0));
        gate.on_unlock();
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(150)), Decision::Reject);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(200)), Decision::Admit(1));
    }

    #[test]
    fn unlock_while_unlocked_is_noop() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(Duration::ZERO, true, t0);
        gate.on_unlock();
        gate.on_unlock();
        assert!(!gate.is_locked());
        assert_eq!(gate.next_sequence(), 0);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(0));

        let unlocked = FrameGate::starting_at(Duration::ZERO, false, t0);
        unlocked.on_unlock();
        assert!(!unlocked.is_locked());
        assert_eq!(unlocked.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(0));
        assert_eq!(unlocked.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(1));
    }

    #[test]
    fn empty_frame_advances_clock_but_not_sequence() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(100), false, t0);

        assert_eq!(
            gate.on_frame_arrived_at(&mut empty_frame(), t0 + ms(100)),
            Decision::Skip(PixelError::Empty)
        );
        assert_eq!(gate.next_sequence(), 0);
        // The empty frame restarted the throttle window.
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(150)), Decision::Reject);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(200)), Decision::Admit(0));
    }

    #[test]
    fn empty_frame_engages_key_lock() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(Duration::ZERO, true, t0);
        assert_eq!(
            gate.on_frame_arrived_at(&mut empty_frame(), t0),
            Decision::Skip(PixelError::Empty)
        );
        assert!(gate.is_locked());
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0), Decision::Reject);
        gate.on_unlock();
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(0));
    }

    #[test]
    fn truncated_frame_is_skipped_without_a_sequence() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(Duration::ZERO, false, t0);
        let mut short = ImageFrame::new(vec![0; 50], Encoding::Bgr8, 10, 10, 0);
        assert!(matches!(
            gate.on_frame_arrived_at(&mut short, t0),
            Decision::Skip(PixelError::Truncated { got: 50, expected: 300 })
        ));
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(0));
    }

    #[test]
    fn unconvertible_frame_is_skipped_when_encoding() {
        let t0 = Instant::now();
        let yuv = || ImageFrame::new(vec![0; 200], Encoding::parse("yuv422"), 10, 10, 0);

        let encoding = FrameGate::starting_at(Duration::ZERO, false, t0).requiring_rgb(true);
        assert!(matches!(
            encoding.on_frame_arrived_at(&mut yuv(), t0),
            Decision::Skip(PixelError::Unsupported(_))
        ));
        assert_eq!(encoding.next_sequence(), 0);
        assert_eq!(encoding.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(0));

        // A raw dump takes the bytes as they are.
        let dumping = FrameGate::starting_at(Duration::ZERO, false, t0);
        assert_eq!(dumping.on_frame_arrived_at(&mut yuv(), t0), Decision::Admit(0));
    }

    #[test]
    fn unlock_reports_previous_lock_state() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(Duration::ZERO, true, t0);
        assert!(!gate.on_unlock());
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0), Decision::Admit(0));
        assert!(gate.on_unlock());
        assert!(!gate.on_unlock());
    }

    #[test]
    fn rejected_frame_leaves_state_untouched() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(100), false, t0);
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(100)), Decision::Admit(0));
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(199)), Decision::Reject);
        // Window still measured from the save at 100ms, not the rejection at 199ms.
        assert_eq!(gate.on_frame_arrived_at(&mut frame(), t0 + ms(200)), Decision::Admit(1));
    }

    #[test]
    fn bayer_frames_are_normalized_even_when_rejected() {
        let t0 = Instant::now();
        let gate = FrameGate::starting_at(ms(100), false, t0);
        let mut bayer = ImageFrame::new(vec![1; 4], Encoding::parse("bayer_rggb8"), 2, 2, 0);
        assert_eq!(gate.on_frame_arrived_at(&mut bayer, t0), Decision::Reject);
        assert_eq!(bayer.encoding(), &Encoding::Mono8);
    }

    #[test]
    fn concurrent_arrivals_get_unique_contiguous_sequences() {
        let gate = Arc::new(FrameGate::new(Duration::ZERO, false));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    let mut seqs = Vec::new();
                    for _ in 0..250 {
                        if let Decision::Admit(seq) = gate.on_frame_arrived(&mut frame()) {
                            seqs.push(seq);
                        }
                        gate.on_unlock();
                    }
                    seqs
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..2000).collect::<Vec<_>>());
        assert_eq!(gate.next_sequence(), 2000);
    }
}
