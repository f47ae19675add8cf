use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tokio::time::Instant;

/// Shortest delay before a retry.
pub const MIN_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Longest delay before a retry.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(3600);

/// Multiplier of the delay for failures caused by a network outage.
pub const OFFLINE_BACKOFF_FACTOR: u32 = 10;

/// Seconds per backoff slot.
const SLOT_SECONDS: f64 = 10.0;

/// Source of the random factor in [`RetryBackoff`].
#[derive(Debug)]
enum Jitter {
    Random(Pcg32),
    Fixed(f64),
}

/// Exponential backoff with random jitter.
///
/// After `n` consecutive failures the delay is `random(0, (2^n - 1) / 2)` slots of ten seconds,
/// multiplied by a linear factor and clamped to `[10s, 3600s]`.
#[derive(Debug)]
pub struct RetryBackoff {
    jitter: Jitter,
}

impl RetryBackoff {
    /// Creates a backoff with random jitter.
    pub fn new() -> Self {
        Self {
            jitter: Jitter::Random(Pcg32::from_rng(&mut rand::rng())),
        }
    }

    /// Creates a backoff that always uses the given random factor in `[0, 1]`.
    pub fn fixed(factor: f64) -> Self {
        Self {
            jitter: Jitter::Fixed(factor.clamp(0.0, 1.0)),
        }
    }

    /// Computes the delay after `failures` consecutive failures.
    pub fn delay(&mut self, failures: u32, linear_factor: u32) -> Duration {
        let random = match self.jitter {
            Jitter::Random(ref mut rng) => rng.random::<f64>(),
            Jitter::Fixed(factor) => factor,
        };

        let slots = (2f64.powi(failures.min(31) as i32) - 1.0) / 2.0;
        let seconds = f64::from(linear_factor.max(1)) * random * slots * SLOT_SECONDS;

        Duration::from_secs_f64(seconds.clamp(
            MIN_RETRY_DELAY.as_secs_f64(),
            MAX_RETRY_DELAY.as_secs_f64(),
        ))
    }
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Consecutive failures of a sender and the earliest time of the next retry.
///
/// Delays never decrease while failures continue. Any full success resets the state.
#[derive(Debug)]
pub struct RetryState {
    consecutive_failures: u32,
    retry_at: Option<Instant>,
    last_delay: Duration,
    backoff: RetryBackoff,
}

impl RetryState {
    /// Creates a state without failures.
    pub fn new(backoff: RetryBackoff) -> Self {
        Self {
            consecutive_failures: 0,
            retry_at: None,
            last_delay: Duration::ZERO,
            backoff,
        }
    }

    /// Returns the number of consecutive failures.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Records a failure and returns the delay until the next retry is permitted.
    pub fn record_failure(&mut self, linear_factor: u32) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        let delay = self
            .backoff
            .delay(self.consecutive_failures, linear_factor)
            .max(self.last_delay);

        self.last_delay = delay;
        self.retry_at = Some(Instant::now() + delay);
        delay
    }

    /// Clears all failures.
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.retry_at = None;
        self.last_delay = Duration::ZERO;
    }

    /// Returns the time left until a retry is permitted.
    pub fn remaining(&self) -> Duration {
        self.retry_at
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or_default()
    }
}

impl Default for RetryState {
    fn default() -> Self {
        Self::new(RetryBackoff::new())
    }
}
