//! Wait time computation for retry loops.
//!
//! The exponential strategy uses "full jitter": the wait is drawn uniformly
//! from `[0, initial * 2^retry_count]`, optionally clamped to a ceiling.

use std::time::Duration;

use rand::Rng;

/// Largest exponent applied to the initial period.
///
/// Larger retry counts would overflow the shift; the multiplication saturates
/// long before this bound matters.
const MAX_EXPONENT: u32 = 32;

/// Computes how long to wait before the next retry attempt.
pub trait BackdownStrategy: Send + Sync {
    /// Wait time before retry number `retry_count + 1`.
    ///
    /// `retry_count` is the number of retries already attempted, so the first
    /// retry passes 0.
    fn wait_time(&self, initial_period: Duration, retry_count: u32) -> Duration;
}

impl<F> BackdownStrategy for F
where
    F: Fn(Duration, u32) -> Duration + Send + Sync,
{
    fn wait_time(&self, initial_period: Duration, retry_count: u32) -> Duration {
        self(initial_period, retry_count)
    }
}

/// Exponential backdown with full jitter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExponentialBackdownStrategy {
    cap: Option<Duration>,
}

impl ExponentialBackdownStrategy {
    /// Create an uncapped strategy.
    #[must_use]
    pub fn new() -> Self {
        Self { cap: None }
    }

    /// Create a strategy whose waits never exceed `cap`.
    #[must_use]
    pub fn with_cap(cap: Duration) -> Self {
        Self { cap: Some(cap) }
    }

    /// Upper bound of the jitter window for the given retry.
    ///
    /// The window is computed in nanoseconds and saturates at
    /// `u64::MAX` nanoseconds.
    #[must_use]
    pub fn max_wait_time(&self, initial_period: Duration, retry_count: u32) -> Duration {
        let initial_ns = u64::try_from(initial_period.as_nanos()).unwrap_or(u64::MAX);
        let exponent = retry_count.min(MAX_EXPONENT);
        let exponential = Duration::from_nanos(initial_ns.saturating_mul(1_u64 << exponent));

        match self.cap {
            Some(cap) => exponential.min(cap),
            None => exponential,
        }
    }
}

impl BackdownStrategy for ExponentialBackdownStrategy {
    fn wait_time(&self, initial_period: Duration, retry_count: u32) -> Duration {
        let max_ns = u64::try_from(self.max_wait_time(initial_period, retry_count).as_nanos())
            .unwrap_or(u64::MAX);
        Duration::from_nanos(rand::rng().random_range(0..=max_ns))
    }
}
