//! SetuLink - connection core for the hexapod robot desktop client
//!
//! Owns a long-lived bidirectional link to the robot: an ASCII command
//! channel and a binary video channel on two TCP connections. Survives
//! transient link loss through an exponential-backoff reconnection loop and
//! is safe under concurrent access from UI, command, and video threads.
//!
//! The GUI, PID controller, and recognition models are consumers of this
//! crate: they call connect/send/receive/disconnect and poll for frames,
//! and never touch sockets or locks directly.
//!
//! # Example
//!
//! ```no_run
//! use setu_link::{ConnectionManager, Endpoint, RetryPolicy};
//! use std::time::Duration;
//!
//! let manager = ConnectionManager::new(RetryPolicy::default(), Duration::from_secs(5));
//! manager.connect(Endpoint::new("192.168.1.100", 5002, 8002), Duration::from_secs(2))?;
//! manager.send("CMD_MOVE#1#0#0#8", Duration::from_secs(1))?;
//! let status = manager.receive(Duration::from_secs(1))?;
//! println!("robot replied: {}", status);
//!
//! manager.start_video()?;
//! if let Some(frame) = manager.latest_frame() {
//!     println!("frame {} ({} bytes)", frame.sequence, frame.payload.len());
//! }
//! manager.disconnect();
//! # Ok::<(), setu_link::Error>(())
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod link;
pub mod sync;

// Re-export commonly used types
pub use client::Client;
pub use config::{Endpoint, LinkConfig, RetryPolicy};
pub use error::{Error, Result};
pub use link::manager::ConnectionManager;
pub use link::state::ConnectionState;
pub use link::video::VideoFrame;
