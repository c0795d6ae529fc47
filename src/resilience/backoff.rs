//! Delays between attempts to reach the bus relay.
//!
//! Every node on a channel loses the relay at the same moment when it
//! restarts, so the delays grow exponentially and carry up to 10% jitter to
//! spread the reconnects out.

use std::time::Duration;

use rand::Rng;

use crate::config::schema::TransportConfig;

/// Exponential delay with jitter. `attempt` is 1-based; 0 means no delay.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped = base_ms.saturating_mul(exponential_base).min(max_ms);

    let jitter_range = capped / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped + jitter)
}

/// Reconnect schedule for one relay connection.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: max_ms.max(base_ms),
            attempt: 0,
        }
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(config.reconnect_base_delay_ms, config.reconnect_max_delay_ms)
    }

    /// Failed attempts since the last successful connect.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Count a failed attempt and return how long to wait before the next.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        calculate_backoff(self.attempt, self.base_ms, self.max_ms)
    }

    /// The relay answered; start over from the base delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
