//! # Frame acquisition
//!
//! A capture source runs on a dedicated background thread, paced to the
//! source's native frame rate for files, and hands frames to a single
//! consumer through a drop-on-busy gate: while the consumer is processing,
//! captured frames are discarded, never queued. Throughput degrades
//! gracefully under a slow consumer with no backlog growth.

use crate::prelude::v1::*;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Frame rate assumed for file sources that do not report a usable one.
pub const DEFAULT_FRAME_RATE: f64 = 30.0;

const PAUSE_POLL: Duration = Duration::from_millis(100);
const LIVE_YIELD: Duration = Duration::from_millis(1);
const STOP_WAIT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(10);

/// Raw frame producer.
///
/// Implementations own the underlying device or file handle; the OpenCV one
/// lives in the `froth-cv` crate.
pub trait Capture: Send {
    /// Read the next frame.
    ///
    /// Returns `Ok(None)` at the end of the stream. A mid-stream read failure
    /// is also treated as end-of-stream by the capture loop.
    fn grab(&mut self) -> Result<Option<Frame>>;

    /// Native frame rate of the source, if known.
    fn frame_rate(&self) -> Option<f64>;

    /// Frame dimensions `(width, height)`, if known.
    fn dimensions(&self) -> Option<(u32, u32)>;
}

/// Pacing behaviour of a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    /// Live device; the loop only yields briefly between reads.
    Live,
    /// Pre-recorded file; emission is paced to the native frame rate.
    File,
}

/// Create a connected drop-on-busy gate pair.
///
/// The pair shares one release flag. A frame passes only when the sender can
/// take the flag; the receiver gives it back once processing completes, so at
/// most one frame is ever in flight.
pub fn frame_gate() -> (GateSender, GateReceiver) {
    let release = Arc::new(AtomicBool::new(true));
    let (tx, rx) = mpsc::channel();

    (
        GateSender {
            release: release.clone(),
            tx,
        },
        GateReceiver { release, rx },
    )
}

/// Producer half of the gate.
pub struct GateSender {
    release: Arc<AtomicBool>,
    tx: Sender<Frame>,
}

impl GateSender {
    /// Offer a frame to the consumer.
    ///
    /// Returns `true` when the frame was delivered. A busy consumer or a
    /// dropped receiver drops the frame on the floor.
    pub fn offer(&self, frame: Frame) -> bool {
        if self
            .release
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.tx.send(frame).is_ok()
    }
}

/// Consumer half of the gate.
pub struct GateReceiver {
    release: Arc<AtomicBool>,
    rx: Receiver<Frame>,
}

impl GateReceiver {
    /// Block until the next delivered frame, or `None` once every sender is
    /// gone.
    pub fn recv(&self) -> Option<Frame> {
        self.rx.recv().ok()
    }

    /// Block for the next frame up to a timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Frame> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Signal that processing of the last frame completed.
    ///
    /// Until called, every offered frame is dropped.
    pub fn release(&self) {
        self.release.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct FeedFlags {
    running: AtomicBool,
    paused: AtomicBool,
}

/// Background frame producer.
///
/// At most one capture thread is alive at a time; starting a new capture
/// stops any previous one first. Pause, resume and stop are cooperative and
/// observed at loop-iteration granularity.
#[derive(Default)]
pub struct FrameFeed {
    flags: Arc<FeedFlags>,
    handle: Option<JoinHandle<()>>,
    frame_rate: f64,
    dimensions: (u32, u32),
}

impl FrameFeed {
    pub fn new() -> Self {
        Default::default()
    }

    /// Start capturing on a background thread.
    ///
    /// File sources are paced to their native frame rate, with
    /// [`DEFAULT_FRAME_RATE`] as the fallback when the rate is unreadable or
    /// non-positive.
    ///
    /// # Arguments
    ///
    /// * `capture` - an opened capture source; it moves into the thread and
    ///   is released by it on exit.
    /// * `kind` - pacing behaviour of the source.
    /// * `sink` - gate through which frames reach the consumer.
    pub fn start<C: Capture + 'static>(&mut self, capture: C, kind: SourceKind, sink: GateSender) {
        if self.is_running() {
            self.stop();
        }

        self.frame_rate = capture
            .frame_rate()
            .filter(|&rate| rate > 0.0)
            .unwrap_or(DEFAULT_FRAME_RATE);
        self.dimensions = capture.dimensions().unwrap_or((0, 0));

        let delay = match kind {
            SourceKind::File => Some(Duration::from_secs_f64(1.0 / self.frame_rate)),
            SourceKind::Live => None,
        };

        let flags = Arc::new(FeedFlags {
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
        });

        self.flags = flags.clone();
        self.handle = Some(std::thread::spawn(move || {
            capture_loop(capture, flags, delay, sink)
        }));
    }

    /// Stop the capture thread.
    ///
    /// Blocks up to a bounded wait for the thread to exit. The capture handle
    /// is owned and dropped by the thread itself, so a thread that outlives
    /// the wait is detached with a warning rather than having its handle
    /// pulled out from under a read.
    pub fn stop(&mut self) {
        self.flags.running.store(false, Ordering::Release);
        self.flags.paused.store(false, Ordering::Release);

        if let Some(handle) = self.handle.take() {
            let deadline = Instant::now() + STOP_WAIT;

            while !handle.is_finished() && Instant::now() < deadline {
                std::thread::sleep(STOP_POLL);
            }

            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("capture thread still running after {:?}, detaching", STOP_WAIT);
            }
        }
    }

    /// Pause capture without releasing the source.
    pub fn pause(&self) {
        self.flags.paused.store(true, Ordering::Release);
    }

    /// Resume capture from the live/next position.
    pub fn resume(&self) {
        self.flags.paused.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.flags.running.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.flags.paused.load(Ordering::Acquire)
    }

    /// Frame rate in effect, cached at start.
    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    /// Frame dimensions `(width, height)` cached at start, `(0, 0)` when
    /// unknown.
    pub fn dimensions(&self) -> (u32, u32) {
        self.dimensions
    }
}

impl Drop for FrameFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop<C: Capture>(
    mut capture: C,
    flags: Arc<FeedFlags>,
    delay: Option<Duration>,
    sink: GateSender,
) {
    let mut last_emit = Instant::now();

    while flags.running.load(Ordering::Acquire) {
        if flags.paused.load(Ordering::Acquire) {
            std::thread::sleep(PAUSE_POLL);
            continue;
        }

        let frame = match capture.grab() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!("end of stream");
                break;
            }
            Err(err) => {
                // Treated as end-of-stream, not an error.
                warn!("frame read failed: {}", err);
                break;
            }
        };

        match delay {
            Some(delay) => {
                let elapsed = last_emit.elapsed();
                if elapsed < delay {
                    std::thread::sleep(delay - elapsed);
                }
            }
            None => std::thread::sleep(LIVE_YIELD),
        }

        // The frame was still read above even if it gets dropped here; that
        // keeps the decoder position current across busy spells.
        sink.offer(frame);

        last_emit = Instant::now();
    }

    flags.running.store(false, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Capture producing a fixed number of frames.
    struct SyntheticCapture {
        frames_left: usize,
        grabbed: Arc<AtomicUsize>,
        frame_rate: Option<f64>,
    }

    impl SyntheticCapture {
        fn new(frames: usize, frame_rate: Option<f64>) -> (Self, Arc<AtomicUsize>) {
            let grabbed = Arc::new(AtomicUsize::new(0));

            (
                Self {
                    frames_left: frames,
                    grabbed: grabbed.clone(),
                    frame_rate,
                },
                grabbed,
            )
        }
    }

    impl Capture for SyntheticCapture {
        fn grab(&mut self) -> Result<Option<Frame>> {
            if self.frames_left == 0 {
                return Ok(None);
            }

            self.frames_left -= 1;
            self.grabbed.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Frame::filled(4, 4, Bgr { b: 0, g: 0, r: 0 })))
        }

        fn frame_rate(&self) -> Option<f64> {
            self.frame_rate
        }

        fn dimensions(&self) -> Option<(u32, u32)> {
            Some((4, 4))
        }
    }

    fn wait_until_stopped(feed: &FrameFeed) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while feed.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn gate_passes_one_frame_at_a_time() {
        let (tx, rx) = frame_gate();
        let frame = Frame::filled(4, 4, Bgr { b: 0, g: 0, r: 0 });

        assert!(tx.offer(frame.clone()));
        // Busy consumer, frames are shed.
        assert!(!tx.offer(frame.clone()));
        assert!(!tx.offer(frame.clone()));

        assert!(rx.recv().is_some());
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_none());

        rx.release();
        assert!(tx.offer(frame));
        assert!(rx.recv().is_some());
    }

    #[test]
    fn prompt_consumer_sees_every_frame() {
        // 20 fps leaves the consumer ample time to release between frames.
        let (capture, _) = SyntheticCapture::new(10, Some(20.0));

        let (tx, rx) = frame_gate();
        let mut feed = FrameFeed::new();
        feed.start(capture, SourceKind::File, tx);

        let mut delivered = 0;
        while let Some(_frame) = rx.recv_timeout(Duration::from_secs(1)) {
            delivered += 1;
            rx.release();
        }

        wait_until_stopped(&feed);
        assert_eq!(delivered, 10);
        assert!(!feed.is_running());
    }

    #[test]
    fn busy_consumer_sheds_frames_without_queueing() {
        let (capture, grabbed) = SyntheticCapture::new(50, Some(1000.0));

        let (tx, rx) = frame_gate();
        let mut feed = FrameFeed::new();
        feed.start(capture, SourceKind::File, tx);

        wait_until_stopped(&feed);

        // The consumer never released, so exactly one frame can be in the
        // channel while all 50 were captured.
        assert_eq!(grabbed.load(Ordering::SeqCst), 50);
        let mut delivered = 0;
        while rx.recv_timeout(Duration::from_millis(10)).is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 1);
    }

    #[test]
    fn unreadable_rate_falls_back_to_default() {
        let (capture, _) = SyntheticCapture::new(1, None);

        let (tx, _rx) = frame_gate();
        let mut feed = FrameFeed::new();
        feed.start(capture, SourceKind::File, tx);

        assert_eq!(feed.frame_rate(), DEFAULT_FRAME_RATE);
        assert_eq!(feed.dimensions(), (4, 4));
        feed.stop();
    }

    #[test]
    fn stop_terminates_the_loop() {
        // Endless source.
        let (capture, _) = SyntheticCapture::new(usize::MAX, Some(1000.0));

        let (tx, rx) = frame_gate();
        let mut feed = FrameFeed::new();
        feed.start(capture, SourceKind::File, tx);

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_some());
        assert!(feed.is_running());

        feed.stop();
        assert!(!feed.is_running());
    }

    #[test]
    fn pause_suspends_capture_and_keeps_the_source() {
        let (capture, grabbed) = SyntheticCapture::new(usize::MAX, Some(1000.0));

        let (tx, rx) = frame_gate();
        let mut feed = FrameFeed::new();
        feed.start(capture, SourceKind::Live, tx);

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_some());

        feed.pause();
        assert!(feed.is_paused());
        // Give the loop time to observe the flag, then check reads stopped.
        std::thread::sleep(Duration::from_millis(250));
        let grabbed_at_pause = grabbed.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(grabbed.load(Ordering::SeqCst), grabbed_at_pause);
        assert!(feed.is_running());

        feed.resume();
        rx.release();
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_some());

        feed.stop();
    }

    #[test]
    fn restart_replaces_the_previous_capture() {
        let (first, _) = SyntheticCapture::new(usize::MAX, Some(1000.0));
        let (second, _) = SyntheticCapture::new(3, Some(20.0));

        let (tx, rx) = frame_gate();
        let (tx2, rx2) = frame_gate();

        let mut feed = FrameFeed::new();
        feed.start(first, SourceKind::File, tx);
        assert!(rx.recv_timeout(Duration::from_secs(1)).is_some());

        // Starting again stops the first thread before spawning.
        feed.start(second, SourceKind::File, tx2);

        let mut delivered = 0;
        while rx2.recv_timeout(Duration::from_secs(1)).is_some() {
            delivered += 1;
            rx2.release();
        }

        assert_eq!(delivered, 3);
        wait_until_stopped(&feed);
    }
}
