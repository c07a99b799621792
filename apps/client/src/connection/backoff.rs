use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential reconnect delays, bounded by `max_attempts`
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    attempt: usize,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let delay = config.min_delay;
        Self {
            config,
            attempt: 0,
            delay,
        }
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self
            .config
            .max_attempts
            .is_some_and(|max| self.attempt >= max)
        {
            return None;
        }

        self.attempt += 1;
        let delay = self.delay;
        self.delay = Duration::from_millis(
            ((self.delay.as_millis() as f64 * self.config.multiplier)
                .min(self.config.max_delay.as_millis() as f64)) as u64,
        );
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.min_delay;
    }
}
