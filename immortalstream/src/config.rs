//! Typed configuration for streams, reconnectors and supervisors.

use std::time::Duration;

use crate::replay::DEFAULT_REPLAY_CAPACITY;

/// Per-stream settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Maximum bytes retained for replay after a reconnect.
    pub replay_capacity: usize,
}

impl StreamConfig {
    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }
}

/// Settings for one dial attempt.
#[derive(Debug, Clone)]
pub struct ReconnectorConfig {
    /// Upper bound on a single dial, independent of any outer retry loop.
    pub dial_timeout: Duration,
}

impl ReconnectorConfig {
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }
}

impl Default for ReconnectorConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// How long the supervisor waits after a failed reconnect before the next
/// poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Retry at the next poll tick.
    None,
    /// `initial * 2^(failures-1)`, capped at `max`, plus up to `jitter`
    /// times the delay of random spread.
    Exponential {
        initial: Duration,
        max: Duration,
        jitter: f64,
    },
}

/// Cap on the exponent so the multiplication cannot overflow.
const MAX_DOUBLINGS: u32 = 16;

impl Backoff {
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Backoff::Exponential {
            initial,
            max,
            jitter: 0.2,
        }
    }

    /// Delay before retrying after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Exponential {
                initial,
                max,
                jitter,
            } => {
                if failures == 0 {
                    return Duration::ZERO;
                }
                let doublings = (failures - 1).min(MAX_DOUBLINGS);
                let base = initial.saturating_mul(1 << doublings).min(*max);
                let spread = jitter.clamp(0.0, 1.0) * rand::random::<f64>();
                base.mul_f64(1.0 + spread).min(*max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::None
    }
}

/// Supervisor loop settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between health checks.
    pub poll_interval: Duration,
    /// Extra delay after failed reconnects.
    pub backoff: Backoff,
    /// Also react to disconnect notifications instead of only the poll tick.
    pub wake_on_disconnect: bool,
}

impl SupervisorConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_wake_on_disconnect(mut self, wake: bool) -> Self {
        self.wake_on_disconnect = wake;
        self
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            backoff: Backoff::None,
            wake_on_disconnect: false,
        }
    }
}
