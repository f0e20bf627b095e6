//! Exponential backoff for reconnects and entry publishes.

use crate::config::BackoffConfig;
use rand::Rng;
use std::time::Duration;

/// Attempt counter producing growing, capped delays
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start at attempt zero
    #[must_use]
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay for the current attempt, then advance.
    pub fn next_delay(&mut self) -> Duration {
        let exp = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let base = self.config.initial.as_millis() as f64 * self.config.multiplier.powi(exp);
        let capped = base.min(self.config.max.as_millis() as f64);

        let millis = if self.config.jitter {
            // Up to 25% on top
            capped * (1.0 + rand::thread_rng().gen_range(0.0..0.25))
        } else {
            capped
        };
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis(millis as u64)
    }

    /// Success: start over from the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failed attempts since the last reset
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The first delay
    #[must_use]
    pub fn initial(&self) -> Duration {
        self.config.initial
    }
}
