//! Newline-delimited command channel.
//!
//! Carries ASCII control commands to the robot and status lines back on one
//! TCP connection.
//!
//! # Wire Format
//!
//! ```text
//! ┌───────────────────────────────┬──────┐
//! │ ASCII command / status line   │ '\n' │
//! └───────────────────────────────┴──────┘
//! ```
//!
//! There is no correlation token; ordering on the wire is the only
//! correlation mechanism. Commands are transmitted in submission order
//! (concurrent senders are serialized through the writer lock, never
//! interleaved mid-command), and status lines are delivered in arrival
//! order.
//!
//! A dedicated reader thread polls the socket with a short read timeout so
//! it can observe the cancellation flag promptly, assembles complete lines
//! (partials are buffered across reads, never delivered truncated), and
//! hands them to callers through a bounded queue.

use crate::error::{is_poll_timeout, Error, Result};
use crate::link::FailureHook;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval for the reader thread; bounds cancellation latency.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Status lines buffered ahead of the consumer before the oldest are dropped.
const LINE_QUEUE_DEPTH: usize = 64;

/// Longest status line accepted before the reader resynchronizes.
const MAX_LINE_LEN: usize = 4096;

/// Bidirectional command channel over one TCP connection.
pub struct CommandChannel {
    stream: TcpStream,
    writer: Mutex<TcpStream>,
    lines: Receiver<String>,
    cancel: Arc<AtomicBool>,
    on_failure: FailureHook,
    reader: Option<JoinHandle<()>>,
}

impl CommandChannel {
    /// Take ownership of a connected stream and spawn the reader thread.
    pub fn open(stream: TcpStream, on_failure: FailureHook) -> Result<Self> {
        // Commands are small and latency-sensitive.
        let _ = stream.set_nodelay(true);

        let reader_stream = stream.try_clone()?;
        reader_stream.set_read_timeout(Some(READ_POLL_TIMEOUT))?;

        let (tx, rx) = bounded(LINE_QUEUE_DEPTH);
        let cancel = Arc::new(AtomicBool::new(false));
        let reader_cancel = Arc::clone(&cancel);
        let reader_hook = Arc::clone(&on_failure);

        let writer = stream.try_clone()?;
        let reader = thread::Builder::new()
            .name("command-reader".to_string())
            .spawn(move || reader_loop(reader_stream, tx, reader_cancel, reader_hook))?;

        Ok(Self {
            stream,
            writer: Mutex::new(writer),
            lines: rx,
            cancel,
            on_failure,
            reader: Some(reader),
        })
    }

    /// Transmit one newline-terminated command.
    ///
    /// The trailing newline is appended if missing. Fails with
    /// [`Error::Command`] before any byte is written when the payload is
    /// empty, non-ASCII, or contains an embedded newline.
    pub fn send(&self, command: &str, timeout: Duration) -> Result<()> {
        let payload = frame_command(command)?;

        let mut writer = self.writer.lock();
        writer.set_write_timeout(Some(timeout))?;
        match writer.write_all(&payload) {
            Ok(()) => Ok(()),
            Err(e) if is_poll_timeout(&e) => Err(Error::Timeout(format!(
                "command write did not complete within {:?}",
                timeout
            ))),
            Err(e) => {
                // The link is gone; let the manager start recovering while
                // the caller still sees the synchronous error.
                (self.on_failure)();
                Err(Error::Io(e))
            }
        }
    }

    /// Wait for the next complete status line.
    ///
    /// Blocks the calling thread, not the reader, up to `timeout`.
    pub fn receive(&self, timeout: Duration) -> Result<String> {
        match self.lines.recv_timeout(timeout) {
            Ok(line) => Ok(line),
            Err(RecvTimeoutError::Timeout) => Err(Error::Timeout(format!(
                "no status line within {:?}",
                timeout
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Connection("command reader stopped".to_string()))
            }
        }
    }

    /// Request shutdown without joining the reader thread.
    ///
    /// Safe to call from any thread; the join happens on drop.
    pub fn signal_close(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        self.signal_close();
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

/// Validate a command and return the framed bytes to put on the wire.
fn frame_command(command: &str) -> Result<Vec<u8>> {
    let body = command.strip_suffix('\n').unwrap_or(command);
    if body.is_empty() {
        return Err(Error::Command("empty command".to_string()));
    }
    if body.contains('\n') {
        return Err(Error::Command(
            "embedded newline in command payload".to_string(),
        ));
    }
    if !body.is_ascii() {
        return Err(Error::Command("command must be ASCII".to_string()));
    }
    let mut payload = Vec::with_capacity(body.len() + 1);
    payload.extend_from_slice(body.as_bytes());
    payload.push(b'\n');
    Ok(payload)
}

/// Splits a byte stream into complete lines, buffering partials.
struct LineAssembler {
    pending: Vec<u8>,
}

impl LineAssembler {
    fn new() -> Self {
        Self {
            pending: Vec::with_capacity(256),
        }
    }

    /// Feed received bytes; returns every line completed by them.
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop(); // newline
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            match String::from_utf8(line) {
                Ok(text) => lines.push(text),
                Err(e) => warn!("discarding non-UTF-8 status line: {}", e),
            }
        }
        if self.pending.len() > MAX_LINE_LEN {
            warn!(
                "status line exceeded {} bytes without terminator, resynchronizing",
                MAX_LINE_LEN
            );
            self.pending.clear();
        }
        lines
    }
}

fn reader_loop(
    mut stream: TcpStream,
    lines: Sender<String>,
    cancel: Arc<AtomicBool>,
    on_failure: FailureHook,
) {
    let mut assembler = LineAssembler::new();
    let mut buf = [0u8; 1024];

    loop {
        if cancel.load(Ordering::Relaxed) {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                if !cancel.load(Ordering::Relaxed) {
                    info!("command peer closed the connection");
                    on_failure();
                }
                break;
            }
            Ok(n) => {
                for line in assembler.push(&buf[..n]) {
                    match lines.try_send(line) {
                        Ok(()) => {}
                        Err(TrySendError::Full(line)) => {
                            warn!("status line queue full, dropping: {}", line);
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
            }
            Err(e) if is_poll_timeout(&e) => continue,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if !cancel.load(Ordering::Relaxed) {
                    warn!("command socket read failed: {}", e);
                    on_failure();
                }
                break;
            }
        }
    }
    debug!("command reader exiting");
}
