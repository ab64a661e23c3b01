//! Connection lifecycle management.
//!
//! [`ConnectionManager`] owns both sockets' lifecycles: it drives
//! connect/disconnect, delegates command and video traffic to the channel
//! workers, and runs the reconnection loop when a previously working link
//! drops.
//!
//! # Failure semantics
//!
//! Transient I/O errors while connected are recovered locally: the only
//! thing a caller observes is the state moving through `Reconnecting` and,
//! if the retry budget runs out, landing in `Failed`. Errors during an
//! explicit `connect`/`send`/`receive` call surface synchronously. A first
//! `connect()` that cannot resolve or dial the endpoint fails fast with no
//! retry; the retry loop only serves a link that was working before.

use crate::config::{Endpoint, RetryPolicy};
use crate::error::{Error, Result};
use crate::link::command::CommandChannel;
use crate::link::state::ConnectionState;
use crate::link::video::{FrameSlot, VideoFrame, VideoStreamWorker};
use crate::link::FailureHook;
use crate::sync::{ThreadSafeCounter, ThreadSafeValue};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Granularity of cancellable sleeps in the reconnection loop.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// State machine and socket owner for one robot link.
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    /// The single lock guarding state transitions.
    state: Mutex<ConnectionState>,
    endpoint: ThreadSafeValue<Option<Endpoint>>,
    retry: RetryPolicy,
    connect_timeout: Duration,
    /// Set by `disconnect()`; every blocking loop rechecks it.
    cancel: AtomicBool,
    /// Whether the caller wants the video channel re-established on reconnect.
    video_enabled: AtomicBool,
    /// Consecutive failed reconnection attempts.
    attempt: ThreadSafeCounter,
    command: Mutex<Option<Arc<CommandChannel>>>,
    video: Mutex<VideoStreamWorker>,
    frames: Arc<FrameSlot>,
    reconnect_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(retry: RetryPolicy, connect_timeout: Duration) -> Self {
        let video = VideoStreamWorker::new();
        let frames = video.frames();
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                endpoint: ThreadSafeValue::new(None),
                retry,
                connect_timeout,
                cancel: AtomicBool::new(false),
                video_enabled: AtomicBool::new(false),
                attempt: ThreadSafeCounter::new(0),
                command: Mutex::new(None),
                video: Mutex::new(video),
                frames,
                reconnect_thread: Mutex::new(None),
            }),
        }
    }

    /// Current connection state; lock-protected read.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Consecutive failed reconnection attempts so far. Resets on every
    /// successful connection and on every explicit `connect()`.
    pub fn attempts(&self) -> u64 {
        self.shared.attempt.get()
    }

    /// Open the command socket to `endpoint`.
    ///
    /// A no-op when already connected. Refused with [`Error::State`] while
    /// a connect or reconnect is in flight. Resolve and dial errors fail
    /// fast with no retry.
    pub fn connect(&self, endpoint: Endpoint, timeout: Duration) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            match *state {
                ConnectionState::Connected => {
                    debug!("connect: already connected");
                    return Ok(());
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    return Err(Error::State(format!(
                        "connect refused while {}",
                        *state
                    )));
                }
                ConnectionState::Disconnected | ConnectionState::Failed => {
                    info!("connection state {} -> {}", *state, ConnectionState::Connecting);
                    *state = ConnectionState::Connecting;
                }
            }
        }

        // A finished retry loop may still need collecting from a prior
        // session; its thread has already returned by the time state was
        // Failed or Disconnected.
        if let Some(handle) = self.shared.reconnect_thread.lock().take() {
            let _ = handle.join();
        }

        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.attempt.reset();
        self.shared.endpoint.set(Some(endpoint.clone()));

        match self.shared.open_command_channel(&endpoint, timeout) {
            Ok(()) => {
                self.shared.set_state(ConnectionState::Connected);
                info!(
                    "connected to {} (command), video on {}",
                    endpoint.command_addr(),
                    endpoint.video_port
                );
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Tear the link down from any state.
    ///
    /// Sets the cancellation flag, closes both sockets, joins every owned
    /// thread, and lands in `Disconnected`. Idempotent.
    pub fn disconnect(&self) {
        let shared = &self.shared;
        shared.cancel.store(true, Ordering::SeqCst);

        // Stop a running retry loop first so it cannot race the teardown.
        if let Some(handle) = shared.reconnect_thread.lock().take() {
            let _ = handle.join();
        }

        shared.teardown_channels();
        shared.video_enabled.store(false, Ordering::SeqCst);
        shared.frames.clear();
        shared.attempt.reset();
        shared.set_state(ConnectionState::Disconnected);
    }

    /// Transmit one command line in submission order.
    pub fn send(&self, command: &str, timeout: Duration) -> Result<()> {
        let channel = self.usable_command_channel()?;
        channel.send(command, timeout)
    }

    /// Wait up to `timeout` for the next status line.
    pub fn receive(&self, timeout: Duration) -> Result<String> {
        let channel = self.usable_command_channel()?;
        channel.receive(timeout)
    }

    /// Open the video socket and start the stream worker.
    ///
    /// A no-op when the worker is already running. Once started, the video
    /// channel is re-established automatically on reconnect until
    /// [`stop_video`](Self::stop_video) is called.
    pub fn start_video(&self) -> Result<()> {
        let state = self.state();
        if !state.is_connected() {
            return Err(Error::Connection(format!(
                "cannot start video while {}",
                state
            )));
        }
        if self.shared.video.lock().is_running() {
            debug!("start_video: worker already running");
            return Ok(());
        }
        let endpoint = self
            .shared
            .endpoint
            .get()
            .ok_or_else(|| Error::State("no endpoint recorded".to_string()))?;

        self.shared.open_video_stream(&endpoint)?;
        self.shared.video_enabled.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the video worker and keep it stopped across reconnects.
    /// Idempotent.
    pub fn stop_video(&self) {
        self.shared.video_enabled.store(false, Ordering::SeqCst);
        self.shared.video.lock().stop();
    }

    /// Newest fully decoded video frame, or `None` if nothing has arrived
    /// yet. Non-blocking; reading twice without a new frame returns the
    /// same frame.
    pub fn latest_frame(&self) -> Option<Arc<VideoFrame>> {
        self.shared.frames.latest()
    }

    fn usable_command_channel(&self) -> Result<Arc<CommandChannel>> {
        let state = self.state();
        if !state.is_connected() {
            return Err(Error::Connection(format!(
                "command channel unusable while {}",
                state
            )));
        }
        self.shared
            .command
            .lock()
            .clone()
            .ok_or_else(|| Error::Connection("command channel not open".to_string()))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Shared {
    /// Apply a state transition, refusing illegal ones.
    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        if !state.can_transition_to(next) {
            error!("refusing illegal state transition {} -> {}", *state, next);
            return;
        }
        info!("connection state {} -> {}", *state, next);
        *state = next;
    }

    /// Atomically transition `from` -> `to`; false if the state moved on.
    fn transition_if(&self, from: ConnectionState, to: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state != from || !state.can_transition_to(to) {
            return false;
        }
        info!("connection state {} -> {}", *state, to);
        *state = to;
        true
    }

    /// Hook handed to channel workers. Holds a weak reference so a worker
    /// thread outliving the manager cannot keep it alive.
    fn failure_hook(self: &Arc<Self>) -> FailureHook {
        let weak: Weak<Shared> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.report_failure();
            }
        })
    }

    /// Entry point for worker-reported link failures.
    ///
    /// Only the first report after `Connected` starts the retry loop, which
    /// keeps at most one loop instance alive per manager.
    fn report_failure(self: &Arc<Self>) {
        if self.cancel.load(Ordering::Relaxed) {
            return;
        }
        if !self.transition_if(ConnectionState::Connected, ConnectionState::Reconnecting) {
            return;
        }
        warn!("link lost, starting reconnection loop");
        self.spawn_reconnect_loop();
    }

    fn spawn_reconnect_loop(self: &Arc<Self>) {
        let mut guard = self.reconnect_thread.lock();
        if let Some(handle) = guard.take() {
            // A previous loop already returned; collect its thread.
            let _ = handle.join();
        }
        let shared = Arc::clone(self);
        match thread::Builder::new()
            .name("reconnect-loop".to_string())
            .spawn(move || shared.reconnect_loop())
        {
            Ok(handle) => *guard = Some(handle),
            Err(e) => {
                error!("failed to spawn reconnection loop: {}", e);
                self.set_state(ConnectionState::Failed);
            }
        }
    }

    fn reconnect_loop(self: &Arc<Self>) {
        // Drop the dead channels before dialing again.
        self.teardown_channels();

        let endpoint = match self.endpoint.get() {
            Some(endpoint) => endpoint,
            None => {
                error!("reconnection loop started without an endpoint");
                self.set_state(ConnectionState::Failed);
                return;
            }
        };

        while !self.cancel.load(Ordering::Relaxed) {
            let attempt = self.attempt.get() as u32;
            if attempt >= self.retry.max_attempts {
                error!(
                    "giving up on {} after {} reconnection attempts",
                    endpoint.command_addr(),
                    attempt
                );
                self.set_state(ConnectionState::Failed);
                return;
            }

            let delay = self.retry.jittered_delay(attempt);
            debug!(
                "reconnection attempt {}/{} in {:?}",
                attempt + 1,
                self.retry.max_attempts,
                delay
            );
            if !self.sleep_cancellable(delay) {
                break;
            }

            match self.reestablish(&endpoint) {
                Ok(()) => {
                    self.attempt.reset();
                    self.set_state(ConnectionState::Connected);
                    info!("link to {} restored", endpoint.command_addr());
                    return;
                }
                Err(e) => {
                    self.attempt.increment();
                    warn!(
                        "reconnection attempt {} failed: {}",
                        self.attempt.get(),
                        e
                    );
                }
            }
        }
        debug!("reconnection loop cancelled");
    }

    /// Sleep in short slices so `disconnect()` aborts a pending backoff
    /// delay promptly. Returns false when cancelled.
    fn sleep_cancellable(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(remaining));
        }
    }

    /// Re-open the command socket, plus the video socket when the caller
    /// had video running. Leaves nothing half-open on failure.
    fn reestablish(self: &Arc<Self>, endpoint: &Endpoint) -> Result<()> {
        self.open_command_channel(endpoint, self.connect_timeout)?;
        if self.video_enabled.load(Ordering::Relaxed) {
            if let Err(e) = self.open_video_stream(endpoint) {
                self.teardown_channels();
                return Err(e);
            }
        }
        Ok(())
    }

    fn open_command_channel(self: &Arc<Self>, endpoint: &Endpoint, timeout: Duration) -> Result<()> {
        let stream = dial(&endpoint.command_addr(), timeout)?;
        let channel = CommandChannel::open(stream, self.failure_hook())?;
        *self.command.lock() = Some(Arc::new(channel));
        Ok(())
    }

    fn open_video_stream(self: &Arc<Self>, endpoint: &Endpoint) -> Result<()> {
        let stream = dial(&endpoint.video_addr(), self.connect_timeout)?;
        self.video.lock().start(stream, self.failure_hook())
    }

    /// Close and join both channel workers.
    fn teardown_channels(&self) {
        let channel = self.command.lock().take();
        if let Some(channel) = channel {
            // Wake the reader before dropping so a caller blocked in
            // receive() fails over promptly too.
            channel.signal_close();
            drop(channel);
        }
        self.video.lock().stop();
    }
}

/// Resolve and dial with a deadline. Everything that goes wrong here is a
/// `Connection` error: resolve failures, no addresses, refused or timed-out
/// dials.
fn dial(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|e| Error::Connection(format!("resolve {}: {}", addr, e)))?;
    let target: SocketAddr = addrs
        .next()
        .ok_or_else(|| Error::Connection(format!("no address for {}", addr)))?;
    TcpStream::connect_timeout(&target, timeout)
        .map_err(|e| Error::Connection(format!("connect to {}: {}", addr, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manager_starts_disconnected() {
        let manager = ConnectionManager::new(RetryPolicy::default(), Duration::from_secs(1));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.attempts(), 0);
        assert!(manager.latest_frame().is_none());
    }

    #[test]
    fn send_while_disconnected_is_a_connection_error() {
        let manager = ConnectionManager::new(RetryPolicy::default(), Duration::from_secs(1));
        let err = manager.send("PING", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    }

    #[test]
    fn dial_fails_fast_on_unresolvable_host() {
        let err = dial("robot.invalid.:5002", Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, Error::Connection(_)), "got {:?}", err);
    }

    #[test]
    fn disconnect_is_idempotent_without_a_connection() {
        let manager = ConnectionManager::new(RetryPolicy::default(), Duration::from_secs(1));
        manager.disconnect();
        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
