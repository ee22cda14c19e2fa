//! Exponential restart backoff for failing controllers.

use std::time::Duration;

use rand::Rng;

/// Configuration for restart backoff.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first restart (default: 100ms).
    pub initial_backoff: Duration,
    /// Maximum delay between restarts (default: 30 seconds).
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff (default: 2.0).
    pub backoff_multiplier: f64,
    /// Whether to add random jitter of up to half the delay (default: true).
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Accumulated backoff state of one controller.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Creates a fresh backoff.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Clears accumulated backoff.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failures recorded.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Records a failure and returns the delay before the next restart.
    pub fn next_delay(&mut self) -> Duration {
        let base_delay_ms = self.config.initial_backoff.as_millis() as f64;
        let max_delay_ms = self.config.max_backoff.as_millis() as f64;

        let computed = base_delay_ms * self.config.backoff_multiplier.powi(self.attempt.min(64) as i32);
        let capped = computed.min(max_delay_ms);
        self.attempt = self.attempt.saturating_add(1);

        if self.config.jitter && capped >= 2.0 {
            let jitter_ms = rand::thread_rng().gen_range(0..(capped as u64 / 2));
            Duration::from_millis((capped as u64).saturating_add(jitter_ms).min(max_delay_ms as u64))
        } else {
            Duration::from_millis(capped as u64)
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig {
            jitter: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_exponential_growth() {
        let mut b = Backoff::new(no_jitter());
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(400));
        assert_eq!(b.attempts(), 3);
    }

    #[test]
    fn test_capped() {
        let mut b = Backoff::new(no_jitter());
        for _ in 0..100 {
            b.next_delay();
        }
        assert_eq!(b.next_delay(), Duration::from_secs(30));
    }

    #[test]
    fn test_reset() {
        let mut b = Backoff::new(no_jitter());
        b.next_delay();
        b.next_delay();
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let mut b = Backoff::default();
        for _ in 0..20 {
            let d = b.next_delay();
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_secs(30));
        }
    }
}
