//! Configuration for the robot link
//!
//! Connection parameters and the retry policy, loadable from a TOML file.
//! The GUI reads its own calibration files and hands this core plain
//! connection parameters only.

use crate::error::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Remote robot address: one host, two TCP ports.
///
/// Immutable once a connection attempt begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Robot hostname or IP address
    pub host: String,
    /// TCP port for the ASCII command channel
    pub command_port: u16,
    /// TCP port for the binary video channel
    pub video_port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, command_port: u16, video_port: u16) -> Self {
        Self {
            host: host.into(),
            command_port,
            video_port,
        }
    }

    /// `host:port` string for the command socket
    pub fn command_addr(&self) -> String {
        format!("{}:{}", self.host, self.command_port)
    }

    /// `host:port` string for the video socket
    pub fn video_addr(&self) -> String {
        format!("{}:{}", self.host, self.video_port)
    }
}

/// Reconnection backoff policy. Pure configuration, no mutable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first reconnection attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Cap applied to the exponential delay, in milliseconds
    pub max_delay_ms: u64,
    /// Consecutive failed attempts before the link is declared failed
    pub max_attempts: u32,
    /// Random jitter applied to each delay, as a fraction of the delay.
    /// A value of 0.1 scales each delay by a factor in [0.9, 1.1].
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 8,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay for the given zero-based attempt number:
    /// `min(base * 2^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let scaled = match 1u64.checked_shl(attempt) {
            Some(factor) => self.base_delay_ms.saturating_mul(factor),
            None => u64::MAX,
        };
        Duration::from_millis(scaled.min(self.max_delay_ms))
    }

    /// Backoff delay with random jitter applied, to avoid synchronized
    /// retry storms against a recovering peer.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        if self.jitter_fraction <= 0.0 {
            return base;
        }
        let mut rng = rand::thread_rng();
        let scale = rng.gen_range(1.0 - self.jitter_fraction..=1.0 + self.jitter_fraction);
        base.mul_f64(scale.max(0.0))
    }
}

/// Top-level link configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub endpoint: Endpoint,
    /// Socket establishment deadline, in milliseconds
    pub connect_timeout_ms: u64,
    /// Default deadline for command send/receive, in milliseconds
    pub command_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl LinkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: LinkConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Default configuration for the hexapod robot.
    ///
    /// Ports and timeouts match the robot firmware's defaults. Deployments
    /// with a different network layout should use a TOML file instead.
    pub fn hexapod_defaults() -> Self {
        Self {
            endpoint: Endpoint::new("192.168.1.100", 5002, 8002),
            connect_timeout_ms: 5_000,
            command_timeout_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::hexapod_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LinkConfig::hexapod_defaults();
        assert_eq!(config.endpoint.command_port, 5002);
        assert_eq!(config.endpoint.video_port, 8002);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.retry.max_attempts, 8);
    }

    #[test]
    fn test_endpoint_addrs() {
        let ep = Endpoint::new("10.0.0.5", 5002, 8002);
        assert_eq!(ep.command_addr(), "10.0.0.5:5002");
        assert_eq!(ep.video_addr(), "10.0.0.5:8002");
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 10,
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(5), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(63), Duration::from_secs(30));
        assert_eq!(policy.backoff_delay(200), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 0..40 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= previous, "delay shrank at attempt {}", attempt);
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter_fraction: 0.1,
        };
        for _ in 0..100 {
            let delay = policy.jittered_delay(0);
            assert!(delay >= Duration::from_millis(900), "delay {:?}", delay);
            assert!(delay <= Duration::from_millis(1_100), "delay {:?}", delay);
        }
    }

    #[test]
    fn test_zero_jitter_is_deterministic() {
        let policy = RetryPolicy {
            jitter_fraction: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.jittered_delay(1), policy.backoff_delay(1));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = LinkConfig::hexapod_defaults();
        let toml_string = toml::to_string_pretty(&config).unwrap();

        assert!(toml_string.contains("[endpoint]"));
        assert!(toml_string.contains("[retry]"));
        assert!(toml_string.contains("command_port = 5002"));

        let parsed: LinkConfig = toml::from_str(&toml_string).unwrap();
        assert_eq!(parsed.endpoint, config.endpoint);
        assert_eq!(parsed.retry.max_attempts, config.retry.max_attempts);
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_content = r#"
connect_timeout_ms = 2000
command_timeout_ms = 1000

[endpoint]
host = "10.0.0.5"
command_port = 5002
video_port = 8002

[retry]
base_delay_ms = 500
max_delay_ms = 10000
max_attempts = 5
jitter_fraction = 0.2
"#;
        let config: LinkConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.endpoint.host, "10.0.0.5");
        assert_eq!(config.retry.base_delay_ms, 500);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.connect_timeout(), Duration::from_secs(2));
    }
}
