//! Back-off policy for reconnecting the live-update channel.
//!
//! The push endpoint keeps no subscription state across connections, so
//! after an abnormal drop the channel retries with a growing delay and
//! replays its subscriptions once reconnected. Retries stop after
//! [`ReconnectPolicy::max_attempts`] consecutive failures; the channel
//! then parks in its failed state and leaves recovery to the caller.

use std::time::Duration;

/// Tunable parameters for the reconnect back-off.
///
/// The delay grows linearly: attempt `n` waits `base_delay × n`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay unit; attempt `n` waits `base_delay × n`.
    pub base_delay: Duration,
    /// Upper bound on consecutive reconnect attempts.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(2000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }

    /// Whether another attempt is allowed after `completed_attempts`
    /// consecutive failures.
    pub fn should_retry(&self, completed_attempts: u32) -> bool {
        completed_attempts < self.max_attempts
    }
}
