//! Client Configuration
//!
//! Session tuning knobs with defaults matching stock firmware behavior.
//! Deserializes from any serde format; every field is optional.

use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_max_retries() -> u32 {
    3
}

fn default_retry_interval_secs() -> u64 {
    5
}

fn default_handshake_timeout_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Session tuning parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Recovery attempts before the session is declared failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Seconds between recovery attempts.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,

    /// Seconds to wait for each handshake artifact.
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Milliseconds between handshake polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_interval_secs: default_retry_interval_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ClientConfig {
    /// Pause between recovery attempts.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    /// Deadline for each handshake artifact.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Pause between handshake polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
