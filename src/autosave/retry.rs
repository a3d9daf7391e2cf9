//! Exponential backoff for failed saves.

use rand::Rng;
use std::time::Duration;

/// Largest share of a delay added as random jitter
const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based): `base * 2^(attempt - 1)`, capped at `max`, plus jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self
            .base
            .saturating_mul(1u32 << exponent)
            .min(self.max);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0.0..JITTER_RATIO);
        delay + delay.mul_f64(jitter)
    }
}
