//! Video frame stream worker.
//!
//! A dedicated thread owns the video socket, decodes length-prefixed binary
//! frames, and publishes the newest one into a single-slot buffer.
//!
//! # Wire Format
//!
//! ```text
//! ┌────────────────────┬─────────────────────┐
//! │ Length (4 bytes)   │ Frame payload       │
//! │ Little-endian u32  │ (JPEG, variable)    │
//! └────────────────────┴─────────────────────┘
//! ```
//!
//! The robot's camera feed emits the length in little-endian byte order.
//! Frames larger than [`MAX_FRAME_LEN`] indicate a desynchronized stream
//! and are treated as a link failure.
//!
//! # Backpressure
//!
//! The buffer holds one slot: a newly decoded frame unconditionally
//! overwrites an unread predecessor. The worker never blocks on a slow
//! consumer and never accumulates frames; freshness wins over completeness.

use crate::error::{is_poll_timeout, Error, Result};
use crate::link::FailureHook;
use crate::sync::ThreadSafeCounter;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::Read;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest frame accepted from the wire (10 MB).
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

/// Poll interval for the decode loop; bounds cancellation latency.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// One decoded video frame.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    /// Raw frame bytes as received (typically JPEG); decoding is the
    /// consumer's job.
    pub payload: Vec<u8>,
    /// Monotonically increasing frame number, 1-based.
    pub sequence: u64,
    /// Receive timestamp, microseconds since the Unix epoch.
    pub timestamp_us: u64,
}

/// Single-slot drop-oldest buffer.
///
/// Reading does not consume: two reads without a new frame in between
/// return the same frame.
#[derive(Default)]
pub struct FrameSlot {
    slot: Mutex<Option<Arc<VideoFrame>>>,
}

impl FrameSlot {
    /// Publish a frame, overwriting any unread predecessor.
    pub fn publish(&self, frame: VideoFrame) {
        *self.slot.lock() = Some(Arc::new(frame));
    }

    /// Newest frame, or `None` if nothing has arrived yet. Non-blocking.
    pub fn latest(&self) -> Option<Arc<VideoFrame>> {
        self.slot.lock().clone()
    }

    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}

/// Owns the video socket reader thread and the frame slot.
pub struct VideoStreamWorker {
    slot: Arc<FrameSlot>,
    sequence: Arc<ThreadSafeCounter>,
    cancel: Arc<AtomicBool>,
    stream: Option<TcpStream>,
    thread: Option<JoinHandle<()>>,
}

impl VideoStreamWorker {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(FrameSlot::default()),
            sequence: Arc::new(ThreadSafeCounter::new(0)),
            cancel: Arc::new(AtomicBool::new(false)),
            stream: None,
            thread: None,
        }
    }

    /// Handle to the frame slot, shared with the manager so reads never
    /// contend with worker start/stop.
    pub fn frames(&self) -> Arc<FrameSlot> {
        Arc::clone(&self.slot)
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    /// Total frames decoded since construction.
    pub fn frames_received(&self) -> u64 {
        self.sequence.get()
    }

    /// Spawn the reader thread on a connected video socket.
    /// Returns immediately.
    pub fn start(&mut self, stream: TcpStream, on_failure: FailureHook) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::State("video worker already running".to_string()));
        }
        stream.set_read_timeout(Some(READ_POLL_TIMEOUT))?;
        self.cancel.store(false, Ordering::SeqCst);

        let reader = stream.try_clone()?;
        let slot = Arc::clone(&self.slot);
        let sequence = Arc::clone(&self.sequence);
        let cancel = Arc::clone(&self.cancel);

        self.thread = Some(
            thread::Builder::new()
                .name("video-stream".to_string())
                .spawn(move || decode_loop(reader, slot, sequence, cancel, on_failure))?,
        );
        self.stream = Some(stream);
        info!("video stream worker started");
        Ok(())
    }

    /// Signal cancellation and join the reader thread. Idempotent.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
            debug!("video stream worker joined");
        }
    }

    /// Newest fully decoded frame; non-blocking.
    pub fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.slot.latest()
    }
}

impl Default for VideoStreamWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for VideoStreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outcome of filling a fixed-size buffer from the socket.
enum ReadOutcome {
    Done,
    Cancelled,
    Eof,
    Failed(std::io::Error),
}

/// Read exactly `buf.len()` bytes, rechecking the cancellation flag every
/// time the poll timeout elapses.
fn read_full(stream: &mut TcpStream, buf: &mut [u8], cancel: &AtomicBool) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        if cancel.load(Ordering::Relaxed) {
            return ReadOutcome::Cancelled;
        }
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return ReadOutcome::Eof,
            Ok(n) => filled += n,
            Err(e) if is_poll_timeout(&e) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Failed(e),
        }
    }
    ReadOutcome::Done
}

fn decode_loop(
    mut stream: TcpStream,
    slot: Arc<FrameSlot>,
    sequence: Arc<ThreadSafeCounter>,
    cancel: Arc<AtomicBool>,
    on_failure: FailureHook,
) {
    let mut payload = Vec::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }

        let mut len_buf = [0u8; 4];
        match read_full(&mut stream, &mut len_buf, &cancel) {
            ReadOutcome::Done => {}
            ReadOutcome::Cancelled => break,
            ReadOutcome::Eof => {
                // A close at a frame boundary is a normal shutdown unless
                // nobody asked for one.
                if !cancel.load(Ordering::Relaxed) {
                    info!("video peer closed the stream");
                    on_failure();
                }
                break;
            }
            ReadOutcome::Failed(e) => {
                if !cancel.load(Ordering::Relaxed) {
                    warn!("video socket read failed: {}", e);
                    on_failure();
                }
                break;
            }
        }

        let len = u32::from_le_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME_LEN {
            if !cancel.load(Ordering::Relaxed) {
                warn!("invalid video frame length {}, stream desynchronized", len);
                on_failure();
            }
            break;
        }

        payload.clear();
        payload.resize(len, 0);
        match read_full(&mut stream, &mut payload, &cancel) {
            ReadOutcome::Done => {
                let frame = VideoFrame {
                    payload: payload.clone(),
                    sequence: sequence.increment(),
                    timestamp_us: now_us(),
                };
                slot.publish(frame);
            }
            ReadOutcome::Cancelled => break,
            ReadOutcome::Eof => {
                if !cancel.load(Ordering::Relaxed) {
                    warn!("video stream truncated mid-frame ({} bytes expected)", len);
                    on_failure();
                }
                break;
            }
            ReadOutcome::Failed(e) => {
                if !cancel.load(Ordering::Relaxed) {
                    warn!("video socket read failed: {}", e);
                    on_failure();
                }
                break;
            }
        }
    }

    debug!(
        "video decode loop exiting after {} frame(s)",
        sequence.get()
    );
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64, byte: u8) -> VideoFrame {
        VideoFrame {
            payload: vec![byte; 8],
            sequence,
            timestamp_us: now_us(),
        }
    }

    #[test]
    fn slot_starts_empty() {
        let slot = FrameSlot::default();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn slot_overwrites_unread_frame() {
        let slot = FrameSlot::default();
        slot.publish(frame(10, 0xAA));
        slot.publish(frame(11, 0xBB));
        let latest = slot.latest().unwrap();
        assert_eq!(latest.sequence, 11);
        assert_eq!(latest.payload, vec![0xBB; 8]);
    }

    #[test]
    fn slot_read_is_idempotent() {
        let slot = FrameSlot::default();
        slot.publish(frame(1, 0x01));
        let first = slot.latest().unwrap();
        let second = slot.latest().unwrap();
        assert_eq!(first.sequence, second.sequence);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn slot_clear_drops_frame() {
        let slot = FrameSlot::default();
        slot.publish(frame(1, 0x01));
        slot.clear();
        assert!(slot.latest().is_none());
    }

    #[test]
    fn worker_stop_is_idempotent_when_never_started() {
        let mut worker = VideoStreamWorker::new();
        worker.stop();
        worker.stop();
        assert!(!worker.is_running());
        assert_eq!(worker.frames_received(), 0);
    }
}
