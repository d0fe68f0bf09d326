//! Reconnect backoff.
//!
//! Exponential window with random jitter so that several devices dropped by
//! the same access point reboot do not reconnect in lockstep.

use rand_core::{OsRng, RngCore};
use std::time::Duration;

/// Exponent cap, keeps the shift in range.
const MAX_EXPONENT: u32 = 16;

/// Reconnect delay generator.
#[derive(Debug, Clone)]
pub struct Backoff {
    min_ms: u32,
    max_ms: u32,
    failures: u32,
    rng_state: u32,
}

impl Backoff {
    /// Create a generator seeded from the OS RNG.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_seed(min, max, OsRng.next_u32())
    }

    /// Create a generator with a fixed seed (for deterministic tests).
    pub fn with_seed(min: Duration, max: Duration, seed: u32) -> Self {
        let min_ms = u32::try_from(min.as_millis()).unwrap_or(u32::MAX).max(1);
        let max_ms = u32::try_from(max.as_millis())
            .unwrap_or(u32::MAX)
            .max(min_ms);
        Self {
            min_ms,
            max_ms,
            failures: 0,
            rng_state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next attempt. Each call counts one failure.
    ///
    /// window = min * 2^failures, capped at max; result in [window/2, window].
    pub fn next_delay(&mut self) -> Duration {
        let window = self
            .min_ms
            .saturating_mul(1 << self.failures.min(MAX_EXPONENT))
            .min(self.max_ms);
        self.failures = self.failures.saturating_add(1);

        let floor = window / 2;
        let range = window - floor;
        if range == 0 {
            return Duration::from_millis(u64::from(window));
        }

        let random = self.next_random();
        Duration::from_millis(u64::from(floor + random % (range + 1)))
    }

    /// The link came up: start over from the minimum window.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Simple LCG random number generator (Numerical Recipes parameters).
    fn next_random(&mut self) -> u32 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(1664525)
            .wrapping_add(1013904223);
        self.rng_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let mut backoff = Backoff::with_seed(ms(500), ms(30_000), 42);
        let mut windows = Vec::new();
        for _ in 0..10 {
            let failures = backoff.failures();
            let delay = backoff.next_delay();
            let window = (500u64 << failures).min(30_000);
            assert!(delay >= ms(window / 2), "{:?} below {}", delay, window / 2);
            assert!(delay <= ms(window), "{:?} above {}", delay, window);
            windows.push(window);
        }
        assert_eq!(windows[0], 500);
        assert_eq!(windows[1], 1000);
        assert_eq!(*windows.last().unwrap(), 30_000);
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::with_seed(ms(500), ms(30_000), 7);
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.failures(), 5);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert!(backoff.next_delay() <= ms(500));
    }

    #[test]
    fn test_many_failures_do_not_overflow() {
        let mut backoff = Backoff::with_seed(ms(500), ms(30_000), 1);
        for _ in 0..1000 {
            assert!(backoff.next_delay() <= ms(30_000));
        }
    }

    #[test]
    fn test_max_below_min_is_clamped() {
        let mut backoff = Backoff::with_seed(ms(100), ms(10), 3);
        assert_eq!(backoff.max_ms, 100);
        for _ in 0..4 {
            let delay = backoff.next_delay();
            assert!(delay >= ms(50) && delay <= ms(100));
        }
    }

    #[test]
    fn test_same_seed_same_delays() {
        let mut a = Backoff::with_seed(ms(500), ms(30_000), 99);
        let mut b = Backoff::with_seed(ms(500), ms(30_000), 99);
        for _ in 0..8 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }
}
