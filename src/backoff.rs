//! Reconnect backoff.
//!
//! Interval for attempt `n` (0-indexed):
//!
//! ```text
//! base(n)  = initial * multiplier^n
//! delay(n) = min(base(n) * (1 + jitter * r), max)     r in [0, 1)
//! ```
//!
//! Jitter only ever lengthens the interval and is applied before clamping,
//! so for a fixed `r` the sequence is non-decreasing and never exceeds `max`.

use crate::config::ClientConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential reconnect schedule with upward jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction in [0, 1].
    pub jitter: f64,
}

impl ReconnectBackoff {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            initial: config.initial_reconnect_interval,
            max: config.max_reconnect_interval,
            multiplier: config.reconnect_multiplier,
            jitter: config.reconnect_jitter,
        }
    }

    /// Interval before attempt `attempt`, with a fresh random jitter sample.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let sample: f64 = rand::thread_rng().gen();
        self.delay_for_attempt_with_sample(attempt, sample)
    }

    /// Interval with an explicit jitter sample in [0, 1].
    pub fn delay_for_attempt_with_sample(&self, attempt: u32, sample: f64) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let sample = sample.clamp(0.0, 1.0);
        let jittered = base * (1.0 + self.jitter.clamp(0.0, 1.0) * sample);

        // powi overflows to infinity for large attempts
        if !jittered.is_finite() || jittered >= max_secs {
            return self.max;
        }
        Duration::from_secs_f64(jittered)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}
