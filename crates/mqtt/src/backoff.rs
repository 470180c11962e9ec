//! Retry delay schedule for broker reconnects.
//!
//! The delay grows geometrically and saturates:
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max_delay)
//! ```
//!
//! With `multiplier = 1.0` the schedule is a fixed delay, which is the
//! default (10 seconds). There is no attempt limit: the session layer must
//! keep retrying for as long as the process lives, so `next_sleep` always
//! yields a delay.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use speedtest2mqtt_mqtt::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8), 2.0);
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(1));
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(2));
//! backoff.reset();
//! assert_eq!(backoff.next_sleep(), Duration::from_secs(1));
//! ```

use std::time::Duration;

/// Reconnect delay controller.
///
/// Reset it once a connection succeeds so the next outage starts again from
/// the initial delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
}

impl Backoff {
    /// Creates a schedule starting at `initial`, growing by `multiplier` per
    /// attempt and capped at `max`.
    ///
    /// A multiplier below 1.0 is treated as 1.0, and a cap below the initial
    /// delay is raised to it, so the delay never shrinks.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier > 1.0 {
            multiplier
        } else {
            1.0
        };
        let max_delay = max.max(initial);
        Self {
            initial_delay: initial,
            current_delay: initial,
            max_delay,
            multiplier,
            attempt: 0,
        }
    }

    /// Fixed delay between every attempt.
    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay, 1.0)
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.current_delay = self.initial_delay;
        self.attempt = 0;
    }

    /// Returns the delay before the next attempt and advances the schedule.
    pub fn next_sleep(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let sleep = self.current_delay;

        let next_delay_secs = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next_delay_secs).min(self.max_delay);

        sleep
    }

    /// Attempts since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// The delay the next `next_sleep` call will return.
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    /// Ten seconds between every attempt.
    fn default() -> Self {
        Self::fixed(Duration::from_secs(10))
    }
}
