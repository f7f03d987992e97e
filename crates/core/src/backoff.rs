//! Exponential backoff with jitter for worker restarts.
//!
//! The delay for attempt `n` (1-based) is
//! `initial_delay * multiplier^(n-1)`, clamped to `max_delay`. The
//! jittered delay is drawn uniformly from `[delay / 2, delay]` so that
//! several workers crashing together do not restart in lockstep.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the restart backoff strategy.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first restart attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Attempts allowed before the worker is given up on.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 5,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Un-jittered delay before the given 1-based attempt.
pub fn delay_for_attempt(attempt: u32, config: &BackoffConfig) -> Duration {
    let mut delay = config.initial_delay.min(config.max_delay);
    for _ in 1..attempt {
        delay = next_delay(delay, config);
        if delay == config.max_delay {
            break;
        }
    }
    delay
}

/// Draw a jittered delay in `[delay / 2, delay]`.
pub fn jittered(delay: Duration) -> Duration {
    let half = delay / 2;
    let spread = (delay - half).as_millis() as u64;
    if spread == 0 {
        return delay;
    }
    let extra = rand::rng().random_range(0..=spread);
    half + Duration::from_millis(extra)
}
