//! Backward-compatible client facade.
//!
//! Preserves the method names the GUI and control loop already call
//! (`turn_on_client`, `send_data`, `receive_data`, `receiving_video`,
//! `get_video_frame`, `turn_off_client`) while delegating all state and
//! concurrency handling to [`ConnectionManager`]. The legacy surface
//! swallows traffic errors and logs them; call sites that want typed errors
//! should use [`Client::manager`] directly.

use crate::config::{Endpoint, LinkConfig};
use crate::error::Result;
use crate::link::manager::ConnectionManager;
use crate::link::state::ConnectionState;
use log::warn;

/// Legacy-shaped robot client.
pub struct Client {
    manager: ConnectionManager,
    config: LinkConfig,
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(LinkConfig::default())
    }

    pub fn with_config(config: LinkConfig) -> Self {
        let manager = ConnectionManager::new(config.retry.clone(), config.connect_timeout());
        Self { manager, config }
    }

    /// Open the command link to the robot at `ip`, using the configured
    /// ports and connect timeout.
    pub fn turn_on_client(&self, ip: &str) -> Result<()> {
        let endpoint = Endpoint::new(
            ip,
            self.config.endpoint.command_port,
            self.config.endpoint.video_port,
        );
        self.manager.connect(endpoint, self.config.connect_timeout())
    }

    /// Tear down the link and join all worker threads. Safe from any state.
    pub fn turn_off_client(&self) {
        self.manager.disconnect();
    }

    /// Send one command line. Failures are logged and swallowed, matching
    /// the legacy surface.
    pub fn send_data(&self, data: &str) {
        if let Err(e) = self.manager.send(data, self.config.command_timeout()) {
            warn!("send_data dropped command: {}", e);
        }
    }

    /// Receive one status line, or an empty string when nothing arrived in
    /// time, matching the legacy surface.
    pub fn receive_data(&self) -> String {
        match self.manager.receive(self.config.command_timeout()) {
            Ok(line) => line,
            Err(e) => {
                warn!("receive_data: {}", e);
                String::new()
            }
        }
    }

    /// Start the video stream on the second channel.
    pub fn receiving_video(&self) -> Result<()> {
        self.manager.start_video()
    }

    /// Newest decoded frame payload, if any. Non-blocking.
    pub fn get_video_frame(&self) -> Option<Vec<u8>> {
        self.manager.latest_frame().map(|frame| frame.payload.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// The underlying manager, for call sites that want typed errors and
    /// explicit timeouts.
    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_surface_swallows_errors_while_disconnected() {
        let client = Client::new();
        assert_eq!(client.state(), ConnectionState::Disconnected);
        // Neither call panics or errors without a connection.
        client.send_data("CMD_MOVE#1#0#0#8");
        assert_eq!(client.receive_data(), "");
        assert!(client.get_video_frame().is_none());
        client.turn_off_client();
    }
}
