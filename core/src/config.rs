//! Transport configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Client-side rendezvous transport configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Base interval for reconnection attempts (with exponential backoff)
    pub reconnect_interval_ms: u64,
    /// Reconnection attempts before the control channel is given up
    pub max_reconnect_attempts: u32,
    /// Challenge rounds accepted during one join before it is a protocol fault
    pub max_challenge_rounds: u32,
    /// Capacity of the listener lifecycle and discovery broadcast channels
    pub event_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_ms: 5_000,
            max_reconnect_attempts: 10,
            max_challenge_rounds: 2,
            event_buffer: 64,
        }
    }
}

impl TransportConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Calculate exponential backoff for reconnection
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let base_ms = self.reconnect_interval_ms;
        let backoff_ms = base_ms.saturating_mul(2u64.pow(std::cmp::min(attempt, 5)));
        Duration::from_millis(std::cmp::min(backoff_ms, 60_000)) // Cap at 60 seconds
    }
}
