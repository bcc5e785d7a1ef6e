//! Delays between delivery attempts of a record and between reconnect attempts.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// Exponential backoff parameters. The n-th delay is `initial_interval * factor^(n-1)`, scaled by a
/// random factor in `[1 - jitter, 1 + jitter]` and capped at `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub factor: f64,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Delay sequence yielding at most `retries` delays, or forever with `None`.
    pub(crate) fn delays(&self, retries: Option<u32>) -> Exponential {
        Exponential {
            policy: self.clone(),
            retries,
            attempt: 0,
        }
    }
}

pub(crate) struct Exponential {
    policy: BackoffPolicy,
    retries: Option<u32>,
    attempt: u32,
}

impl Exponential {
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_ms =
            self.policy.initial_interval.as_millis() as f64 * self.policy.factor.powi(exponent);
        let max_ms = self.policy.max_interval.as_millis() as f64;

        let delay_ms = if self.policy.jitter > 0.0 {
            let jitter = self.policy.jitter.min(1.0);
            base_ms * rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
        } else {
            base_ms
        };
        // Float to int casts saturate, so an overflowing power still lands on the cap.
        Duration::from_millis(delay_ms.min(max_ms) as u64)
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.retries.is_some_and(|retries| self.attempt >= retries) {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay(self.attempt))
    }
}

/// Sleeps for `delay`. Returns `false` if the token was cancelled first.
pub(crate) async fn sleep_or_cancelled(delay: Duration, cln_token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = cln_token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
