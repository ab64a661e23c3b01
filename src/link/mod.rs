//! Connection-management core: state machine, command channel, video stream.

pub mod command;
pub mod manager;
pub mod state;
pub mod video;

use std::sync::Arc;

/// Invoked by a worker thread when a non-timeout I/O error drops the link.
///
/// The manager installs a hook that flips the state machine into
/// reconnection; workers never touch manager internals directly.
pub type FailureHook = Arc<dyn Fn() + Send + Sync>;
