//! Bounded retry with exponential backoff for remote session calls.
//!
//! The executor itself is generic over the operation and its error type;
//! callers pass a [`RetryPolicy`] and a predicate that decides which failures
//! are worth another attempt. Two call sites use it with different policies:
//!
//! - [`navigate_with_retry`]: page loads, [`RetryPolicy::NAVIGATION`] by default
//! - [`extract_with_retry`]: structured extraction, [`RetryPolicy::EXTRACTION`]
//!
//! # Backoff
//!
//! ```text
//! delay(attempt) = min(base_delay * 2^(attempt-1), max_delay) + jitter(0..=jitter)
//! ```
//!
//! The first try never waits. Once `max_retries` retries have failed the last
//! error is returned unchanged.

use crate::error::{Result, SnapshotError};
use crate::session::{self, BrowserSession, ExtractSchema, NavigateOptions};
use rand::{Rng, rng};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,
    /// Delay before the first retry; doubles for each later one.
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    /// Upper bound of the random delay added to each backoff.
    pub jitter: Duration,
}

impl RetryPolicy {
    pub const NAVIGATION: Self = Self::new(2, Duration::from_secs(1));
    pub const EXTRACTION: Self = Self::new(1, Duration::from_secs(1));

    pub const fn new(max_retries: usize, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: None,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `attempt` (1-based), jitter excluded.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as u32;
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        match self.max_delay {
            Some(cap) if delay > cap => cap,
            _ => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter.is_zero() {
            return delay;
        }
        let jitter_ms: u64 = rng().random_range(0..=self.jitter.as_millis() as u64);
        delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::NAVIGATION
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of retries.
pub async fn retry_async<T, E, F, Fut, P>(
    label: &str,
    policy: &RetryPolicy,
    is_retryable: P,
    mut op: F,
) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    P: Fn(&E) -> bool,
    E: fmt::Display,
{
    let total_t0 = Instant::now();
    let mut attempt = 0usize;

    loop {
        let attempt_t0 = Instant::now();
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if !is_retryable(&e) {
                    return Err(e);
                }

                attempt += 1;
                let attempt_dt = attempt_t0.elapsed();
                let total_dt = total_t0.elapsed();

                if attempt > policy.max_retries {
                    error!(
                        %label,
                        attempt,
                        max = policy.max_retries,
                        elapsed_ms_attempt = attempt_dt.as_millis(),
                        elapsed_ms_total = total_dt.as_millis(),
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }

                let delay = policy.jittered(policy.delay_for(attempt));
                warn!(
                    %label,
                    attempt,
                    max = policy.max_retries,
                    elapsed_ms_attempt = attempt_dt.as_millis(),
                    elapsed_ms_total = total_dt.as_millis(),
                    ?delay,
                    error = %e,
                    "Attempt failed; backing off"
                );
                sleep(delay).await;
            }
        }
    }
}

pub fn is_navigation_retryable(e: &SnapshotError) -> bool {
    matches!(e, SnapshotError::Navigation { .. }) || e.is_transient()
}

pub fn is_extraction_retryable(e: &SnapshotError) -> bool {
    matches!(e, SnapshotError::Extraction(_) | SnapshotError::Parse { .. }) || e.is_transient()
}

/// Navigate with backoff; the same policy applies to every skill.
#[instrument(level = "debug", skip(session, options, policy), fields(session_id = %session.id()))]
pub async fn navigate_with_retry(
    session: &dyn BrowserSession,
    url: &str,
    options: NavigateOptions,
    policy: &RetryPolicy,
) -> Result<()> {
    retry_async("navigate", policy, is_navigation_retryable, || {
        session.goto(url, options)
    })
    .await
}

/// Structured extraction with a small retry budget, for the flakier pages.
pub async fn extract_with_retry<T: ExtractSchema>(
    session: &dyn BrowserSession,
    instruction: &str,
    selector: Option<&str>,
    policy: &RetryPolicy,
) -> Result<T> {
    retry_async("extract", policy, is_extraction_retryable, || {
        session::extract::<T>(session, instruction, selector)
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tokio::time::Instant as TokioInstant;

    fn transient(n: usize) -> SnapshotError {
        SnapshotError::Extraction(format!("flaky #{n}"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_r_failures_with_doubling_delays() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let stamps = RefCell::new(Vec::new());

        let result = retry_async("test", &policy, is_extraction_retryable, || {
            stamps.borrow_mut().push(TokioInstant::now());
            let n = stamps.borrow().len();
            async move { if n <= 3 { Err(transient(n)) } else { Ok(n) } }
        })
        .await;

        assert_eq!(result.unwrap(), 4);
        let stamps = stamps.into_inner();
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        let expected = [1, 2, 4].map(Duration::from_secs);
        for (gap, want) in gaps.iter().zip(expected) {
            assert!(*gap >= want && *gap < want + Duration::from_millis(50), "{gap:?} vs {want:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_without_extra_delay() {
        let policy = RetryPolicy::new(2, Duration::from_secs(1));
        let calls = RefCell::new(0usize);
        let t0 = TokioInstant::now();

        let result: std::result::Result<(), _> =
            retry_async("test", &policy, is_extraction_retryable, || {
                *calls.borrow_mut() += 1;
                let n = *calls.borrow();
                async move { Err(transient(n)) }
            })
            .await;

        assert_eq!(*calls.borrow(), 3);
        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "extraction failed: flaky #3");
        // 1s + 2s of backoff, nothing after the final failure
        let elapsed = t0.elapsed();
        assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3050));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_immediately() {
        let calls = RefCell::new(0usize);
        let t0 = TokioInstant::now();

        let result: std::result::Result<(), _> =
            retry_async("test", &RetryPolicy::NAVIGATION, is_navigation_retryable, || {
                *calls.borrow_mut() += 1;
                async { Err(SnapshotError::Config("bad".into())) }
            })
            .await;

        assert!(matches!(result, Err(SnapshotError::Config(_))));
        assert_eq!(*calls.borrow(), 1);
        assert!(t0.elapsed() < Duration::from_millis(1));
    }

    #[test]
    fn test_delay_for_caps_at_max_delay() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(30));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(8), Duration::from_secs(30));
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(RetryPolicy::NAVIGATION.max_retries, 2);
        assert_eq!(RetryPolicy::EXTRACTION.max_retries, 1);
        assert_eq!(RetryPolicy::EXTRACTION.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy::new(1, Duration::from_secs(1)).with_jitter(Duration::from_millis(250));
        for _ in 0..50 {
            let d = policy.jittered(policy.delay_for(1));
            assert!(d >= Duration::from_secs(1) && d <= Duration::from_millis(1250));
        }
    }
}
