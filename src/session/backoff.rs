//! Reconnect delay policy.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

use crate::config::ConnectionConfig;

/// Exponential backoff with jitter.
///
/// Delays never decrease within a failure streak and never exceed `max`.
/// A connection that stayed up for the stability window resets the streak.
#[derive(Debug)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    stability_window: Duration,
    attempt: u32,
    last_delay: Duration,
    connected_since: Option<Instant>,
    rng: StdRng,
}

impl Backoff {
    pub fn new(config: &ConnectionConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    #[cfg(test)]
    pub fn seeded(config: &ConnectionConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: &ConnectionConfig, rng: StdRng) -> Self {
        Self {
            min: config.backoff_min(),
            max: config.backoff_max(),
            stability_window: config.backoff_stability_window(),
            attempt: 0,
            last_delay: Duration::ZERO,
            connected_since: None,
            rng,
        }
    }

    /// Failures in the current streak.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn connected(&mut self, at: Instant) {
        self.connected_since = Some(at);
    }

    pub fn disconnected(&mut self, at: Instant) {
        if let Some(since) = self.connected_since.take() {
            if at.saturating_duration_since(since) >= self.stability_window {
                self.reset();
            }
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Delay before the next attempt after an ordinary failure.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);

        let factor = 2u32.saturating_pow(self.attempt - 1);
        let base = self.min.saturating_mul(factor).min(self.max);
        let spread = base.as_millis() as u64 / 2;
        let jitter = Duration::from_millis(self.rng.gen_range(0..=spread));

        let delay = (base + jitter).max(self.last_delay).min(self.max);
        self.last_delay = delay;
        delay
    }

    /// Jump straight to the maximum delay (rejected credentials).
    pub fn escalate(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.last_delay = self.max;
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(min: u64, max: u64) -> ConnectionConfig {
        ConnectionConfig {
            backoff_min_ms: min,
            backoff_max_ms: max,
            backoff_stability_window_ms: 10_000,
            ..ConnectionConfig::default()
        }
    }

    #[test]
    fn five_failures_are_non_decreasing_and_capped() {
        for seed in 0..50 {
            let mut backoff = Backoff::seeded(&config(1_000, 8_000), seed);
            let delays: Vec<_> = (0..5).map(|_| backoff.next_delay()).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
            assert!(delays.iter().all(|d| *d <= Duration::from_secs(8)));
            assert!(delays[0] >= Duration::from_secs(1));
            assert_eq!(backoff.attempt(), 5);
        }
    }

    #[test]
    fn long_streak_saturates_at_max() {
        let mut backoff = Backoff::seeded(&config(100, 5_000), 7);
        let last = (0..100).map(|_| backoff.next_delay()).last().unwrap();
        assert_eq!(last, Duration::from_secs(5));
    }

    #[test]
    fn stable_connection_resets_streak() {
        let mut backoff = Backoff::seeded(&config(1_000, 60_000), 1);
        for _ in 0..4 {
            backoff.next_delay();
        }

        let t0 = Instant::now();
        backoff.connected(t0);
        backoff.disconnected(t0 + Duration::from_secs(10));

        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(1_500));
    }

    #[test]
    fn flaky_connection_keeps_escalating() {
        let mut backoff = Backoff::seeded(&config(1_000, 60_000), 1);
        let first = backoff.next_delay();

        let t0 = Instant::now();
        backoff.connected(t0);
        backoff.disconnected(t0 + Duration::from_secs(2));

        assert_eq!(backoff.attempt(), 1);
        assert!(backoff.next_delay() >= first);
    }

    #[test]
    fn escalate_goes_to_max() {
        let mut backoff = Backoff::seeded(&config(1_000, 30_000), 3);
        assert_eq!(backoff.escalate(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
    }
}
