//! Exponential backoff for reconnect attempts.
//!
//! `delay[n] = min(initial * multiplier^(n-1), max)`, so with the defaults
//! the schedule is 1s, 2s, 4s, 8s, 16s, 30s, 30s, ...

use std::time::Duration;

use crate::error::{Result, TransportError};

/// Exponential backoff controller.
///
/// Call [`Backoff::next_delay`] after each failure and [`Backoff::reset`]
/// once a connection succeeds.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff with an unlimited number of attempts.
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier: if multiplier < 1.0 { 1.0 } else { multiplier },
            max_attempts: None,
            attempt: 0,
        }
    }

    /// Give up after `max_attempts` consecutive failures.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait before the next attempt.
    ///
    /// Returns `RetriesExhausted` once the attempt limit has been passed.
    pub fn next_delay(&mut self) -> Result<Duration> {
        self.attempt = self.attempt.saturating_add(1);

        if let Some(limit) = self.max_attempts {
            if self.attempt > limit {
                return Err(TransportError::RetriesExhausted(limit));
            }
        }

        Ok(self.delay_for(self.attempt))
    }

    /// Delay for a given 1-based attempt number without advancing state.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of consecutive failures recorded since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for Backoff {
    /// 1s initial delay, doubling, capped at 30s, unlimited attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_schedule() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..7)
            .map(|_| backoff.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut backoff = Backoff::default();
        backoff.next_delay().unwrap();
        backoff.next_delay().unwrap();
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_max_attempts() {
        let mut backoff = Backoff::default().with_max_attempts(Some(2));
        assert!(backoff.next_delay().is_ok());
        assert!(backoff.next_delay().is_ok());
        assert!(matches!(
            backoff.next_delay(),
            Err(TransportError::RetriesExhausted(2))
        ));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(attempt in 1u32..10_000, max_secs in 1u64..120) {
            let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(max_secs), 2.0);
            prop_assert!(backoff.delay_for(attempt) <= Duration::from_secs(max_secs));
        }

        #[test]
        fn prop_delay_is_monotonic(attempt in 1u32..200) {
            let backoff = Backoff::default();
            prop_assert!(backoff.delay_for(attempt) <= backoff.delay_for(attempt + 1));
        }
    }
}
