// SPDX-License-Identifier: MIT
//! Per-worker rate limiting.
//!
//! A [`RateLimiter`] hands out one token every `1 / rate` seconds with a burst
//! of one, so a worker never runs ahead of its schedule after a slow export.
//! A rate of zero (or less) disables throttling entirely. The bucket itself is
//! a `governor` GCRA limiter driven by [`TokioClock`].
use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::Clock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use tokio_util::sync::CancellationToken;

// Keeps absurdly small rates from overflowing `Instant` arithmetic.
const MAX_INTERVAL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The wait for a token was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LimiterError {
    #[error("rate limiter wait cancelled")]
    Cancelled,
}

/// Reads time from the tokio runtime so waits follow a paused test clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now().into_std()
    }
}

type Bucket = governor::RateLimiter<NotKeyed, InMemoryState, TokioClock, NoOpMiddleware<std::time::Instant>>;

/// Token bucket with a burst size of one.
pub struct RateLimiter {
    interval: Option<Duration>,
    bucket: Option<Bucket>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").field("interval", &self.interval).finish()
    }
}

impl RateLimiter {
    /// Creates a limiter emitting `rate` tokens per second.
    pub fn new(rate: f64) -> Self {
        let quota = (rate.is_finite() && rate > 0.0)
            .then(|| {
                Duration::try_from_secs_f64(1.0 / rate)
                    .unwrap_or(MAX_INTERVAL)
                    .min(MAX_INTERVAL)
            })
            .and_then(|interval| Some((interval, Quota::with_period(interval)?.allow_burst(NonZeroU32::MIN))));
        match quota {
            Some((interval, quota)) => Self {
                interval: Some(interval),
                bucket: Some(Bucket::direct_with_clock(quota, TokioClock)),
            },
            None => Self::unbounded(),
        }
    }

    /// Creates a limiter that never waits.
    pub fn unbounded() -> Self {
        Self {
            interval: None,
            bucket: None,
        }
    }

    /// Time between two tokens, `None` when unthrottled.
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Waits for the next token.
    ///
    /// The first token is available immediately. Cancellation is checked before
    /// anything else, so an unthrottled limiter still stops on interrupt.
    ///
    /// # Errors
    /// Returns [`LimiterError::Cancelled`] once `cancel` fires.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), LimiterError> {
        if cancel.is_cancelled() {
            return Err(LimiterError::Cancelled);
        }
        let Some(bucket) = &self.bucket else {
            return Ok(());
        };
        while let Err(not_until) = bucket.check() {
            let delay = not_until.wait_time_from(TokioClock.now());
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LimiterError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;
    use tokio_test::{assert_err, assert_ok, assert_pending, assert_ready_ok};

    #[tokio::test(start_paused = true)]
    async fn tokens_are_spaced_by_the_interval() {
        let cancel = CancellationToken::new();
        let mut limiter = RateLimiter::new(10.0);
        assert_eq!(limiter.interval(), Some(Duration::from_millis(100)));

        let start = Instant::now();
        for _ in 0..5 {
            limiter.wait(&cancel).await.unwrap();
        }
        // first token is free, four more at 100ms each
        assert_eq!(start.elapsed(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_consumers_do_not_accumulate_a_burst() {
        let cancel = CancellationToken::new();
        let mut limiter = RateLimiter::new(10.0);
        limiter.wait(&cancel).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let start = Instant::now();
        limiter.wait(&cancel).await.unwrap();
        limiter.wait(&cancel).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn next_token_is_pending_until_the_interval_elapses() {
        let cancel = CancellationToken::new();
        let mut limiter = RateLimiter::new(10.0);
        assert_ok!(limiter.wait(&cancel).await);

        let mut wait = tokio_test::task::spawn(limiter.wait(&cancel));
        assert_pending!(wait.poll());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_pending!(wait.poll());
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_ready_ok!(wait.poll());
    }

    #[tokio::test]
    async fn zero_rate_never_waits() {
        let cancel = CancellationToken::new();
        for mut limiter in [RateLimiter::new(0.0), RateLimiter::new(-3.0), RateLimiter::unbounded()] {
            assert_eq!(limiter.interval(), None);
            for _ in 0..1000 {
                limiter.wait(&cancel).await.unwrap();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_pending_wait() {
        let cancel = CancellationToken::new();
        let mut limiter = RateLimiter::new(0.001);
        limiter.wait(&cancel).await.unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        assert_eq!(limiter.wait(&cancel).await, Err(LimiterError::Cancelled));
    }

    #[tokio::test]
    async fn cancelled_token_stops_unthrottled_limiters() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut limiter = RateLimiter::unbounded();
        assert_err!(limiter.wait(&cancel).await);
    }
}
