//! Reconnect backoff
//!
//! Exponential backoff with optional ±25% jitter. The MQTT event loop uses it
//! between failed polls of a dropped broker connection, the PLC link worker
//! between attempts to reopen a lost field-bus session.

use std::time::Duration;

use rand::Rng;
use tracing::debug;

/// Connection state as seen by the backoff helper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
    /// Attempts exhausted
    Failed,
}

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Maximum retry attempts (0 means unlimited)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Tracks consecutive failures and hands out the next delay
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
    state: ConnectionState,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.attempt = 0;
        debug!("Connection marked as successful");
    }

    /// Record a failure; `None` once the policy's attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if self.policy.max_attempts > 0 && self.attempt > self.policy.max_attempts {
            self.state = ConnectionState::Failed;
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        Some(self.delay_for(self.attempt))
    }

    /// Delay before retry number `attempt` (1-based)
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let mut delay = self
            .policy
            .initial_delay
            .mul_f64(self.policy.backoff_multiplier.powi(exponent));

        if delay > self.policy.max_delay {
            delay = self.policy.max_delay;
        }

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }
}
