//! Bounded retry primitive for control-plane calls that race eventual
//! consistency.

use std::fmt::Display;
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;

use tracing::{debug, warn};

use crate::pacing::{Pacing, Phase};

const DEFAULT_ATTEMPTS: NonZeroU32 = match NonZeroU32::new(6) {
    Some(attempts) => attempts,
    None => NonZeroU32::MIN,
};
const DEFAULT_DELAY: Duration = Duration::from_secs(5);

/// Fixed-delay retry policy with a bounded number of attempts.
///
/// A policy is a plain value; every call to [`RetryPolicy::execute`] starts
/// with the full attempt budget.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    max_attempts: NonZeroU32,
    delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ATTEMPTS, DEFAULT_DELAY)
    }
}

impl RetryPolicy {
    /// Creates a policy allowing `max_attempts` invocations separated by
    /// `delay`.
    #[must_use]
    pub const fn new(max_attempts: NonZeroU32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Total number of invocations the policy allows.
    #[must_use]
    pub const fn max_attempts(&self) -> NonZeroU32 {
        self.max_attempts
    }

    /// Delay slept between a failed attempt and the next one.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Runs `operation` until it succeeds, fails fatally, or the budget is
    /// spent.
    ///
    /// A failure for which `is_retryable` returns `false` is returned
    /// immediately. A retryable failure sleeps `delay` and tries again while
    /// attempts remain. No sleep happens after the final attempt.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error, or the last retryable error once the
    /// attempt budget is exhausted.
    pub async fn execute<T, E, F, Fut, P>(
        &self,
        pacing: &Pacing,
        phase: Phase,
        is_retryable: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut remaining = self.max_attempts.get();
        loop {
            remaining = remaining.saturating_sub(1);
            pacing.progress().attempt(phase);
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !is_retryable(&err) {
                debug!(%phase, error = %err, "attempt failed with a fatal error");
                return Err(err);
            }
            if remaining == 0 {
                warn!(%phase, error = %err, "retry budget exhausted");
                return Err(err);
            }

            warn!(%phase, remaining, error = %err, "attempt failed; retrying");
            pacing
                .progress()
                .retrying(phase, remaining, &err.to_string());
            pacing.pause(self.delay).await;
        }
    }
}
