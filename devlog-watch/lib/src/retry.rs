//! Retry and backoff policy for project fetches.
//!
//! Two layers:
//!
//! - [`fetch_with_retry`] retries a rate-limited fetch within one pass using
//!   exponential delays, and bounds every attempt with a timeout.
//! - [`ProjectBackoff`] spreads repeated failures of the same project across
//!   passes, skipping a failing project for an exponentially growing (capped)
//!   number of ticks.
//!
//! Notifications are never retried.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::FetchError;

/// In-pass retry settings for rate-limited fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Timeout applied to every attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            attempt_timeout: Duration::from_secs(20),
        }
    }
}

/// Check if a fetch error is worth retrying within the same pass.
///
/// Only rate limiting qualifies; other failures wait for the next pass.
pub fn is_retriable(error: &FetchError) -> bool {
    matches!(error, FetchError::RateLimited)
}

/// Runs a fetch with timeout and exponential backoff on rate limiting.
///
/// ## Retry Strategy
///
/// - Every attempt is bounded by `policy.attempt_timeout`; a timeout is
///   returned immediately as [`FetchError::Timeout`].
/// - Rate-limited attempts are retried up to `policy.max_retries` times,
///   doubling the delay each time up to `policy.max_delay`.
/// - Any other error is returned immediately.
///
/// ## Errors
///
/// Returns the last [`FetchError`] once retries are exhausted, or the first
/// non-retriable error.
pub async fn fetch_with_retry<F, Fut, T>(
    fetch_fn: F,
    policy: &RetryPolicy,
    project: &str,
) -> Result<T, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let mut delay = policy.initial_delay;

    for attempt in 0..=policy.max_retries {
        match tokio::time::timeout(policy.attempt_timeout, fetch_fn()).await {
            Ok(Ok(result)) => return Ok(result),
            Ok(Err(e)) if is_retriable(&e) && attempt < policy.max_retries => {
                warn!(
                    project,
                    retry = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Fetch rate limited, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay.saturating_mul(2), policy.max_delay);
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(FetchError::Timeout(policy.attempt_timeout)),
        }
    }

    Err(FetchError::RateLimited)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FailureState {
    consecutive: u32,
    next_allowed_tick: u64,
}

/// Tracks consecutive fetch failures per project across passes.
///
/// After the `k`-th consecutive failure at tick `t`, the project is next
/// polled at tick `t + min(2^(k-1), max_skip)`. The first failure therefore
/// retries on the very next tick. Any non-failure outcome clears the record.
#[derive(Debug, Clone, Default)]
pub struct ProjectBackoff {
    max_skip: u64,
    failures: HashMap<String, FailureState>,
}

impl ProjectBackoff {
    /// Creates a tracker whose skip window never exceeds `max_skip` ticks.
    ///
    /// A cap of 0 or 1 disables backoff.
    pub fn new(max_skip: u32) -> Self {
        Self {
            max_skip: u64::from(max_skip.max(1)),
            failures: HashMap::new(),
        }
    }

    /// Whether `project` should sit out `tick`.
    pub fn should_skip(&self, project: &str, tick: u64) -> bool {
        self.failures
            .get(project)
            .is_some_and(|state| tick < state.next_allowed_tick)
    }

    /// Records a failed fetch of `project` during `tick`.
    pub fn record_failure(&mut self, project: &str, tick: u64) {
        let state = self
            .failures
            .entry(project.to_string())
            .or_insert(FailureState {
                consecutive: 0,
                next_allowed_tick: 0,
            });
        state.consecutive = state.consecutive.saturating_add(1);
        let exponent = state.consecutive.saturating_sub(1).min(63);
        let window = 1u64.checked_shl(exponent).unwrap_or(u64::MAX).min(self.max_skip);
        state.next_allowed_tick = tick.saturating_add(window);
    }

    /// Clears the failure record of `project`.
    pub fn record_success(&mut self, project: &str) {
        self.failures.remove(project);
    }

    /// Consecutive failures recorded for `project`.
    pub fn consecutive_failures(&self, project: &str) -> u32 {
        self.failures.get(project).map_or(0, |state| state.consecutive)
    }

    /// Drops records of projects that are no longer watched.
    pub fn retain_projects(&mut self, active: &BTreeSet<String>) {
        self.failures.retain(|project, _| active.contains(project));
    }
}
