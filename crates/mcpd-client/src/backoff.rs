//! Reconnection backoff policy.
//!
//! Exponential backoff with full jitter for the connection manager,
//! and a separate retry-after-aware path for rate limited responses.

use rand::Rng;
use std::time::Duration;

/// Initial reconnect delay in milliseconds.
pub const BACKOFF_INITIAL_DELAY_MS: u64 = 1000;

/// Backoff factor for exponential delay.
pub const BACKOFF_FACTOR: u64 = 2;

/// Maximum reconnect delay.
pub const BACKOFF_MAX_DELAY_MS: u64 = 30_000;

/// Maximum number of reconnect attempts before giving up.
pub const BACKOFF_MAX_ATTEMPTS: u32 = 5;

/// Backoff policy for reconnection attempts.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied per attempt.
    pub factor: u64,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Bounded number of attempts; after this the connection goes to
    /// the error state and stops retrying.
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(BACKOFF_INITIAL_DELAY_MS),
            factor: BACKOFF_FACTOR,
            max_delay: Duration::from_millis(BACKOFF_MAX_DELAY_MS),
            max_attempts: BACKOFF_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Compute the jittered delay before the given attempt (1-based).
    ///
    /// Full jitter: a uniform draw between zero and the capped
    /// exponential delay, which avoids thundering-herd reconnects.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_delay
            .as_millis()
            .saturating_mul(u128::from(self.factor.saturating_pow(attempt.saturating_sub(1))));
        let capped = exp.min(self.max_delay.as_millis()) as u64;
        let jittered = rand::thread_rng().gen_range(0..=capped);
        Duration::from_millis(jittered)
    }

    /// Upper bound of the delay for the given attempt, without jitter.
    pub fn max_delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_delay
            .as_millis()
            .saturating_mul(u128::from(self.factor.saturating_pow(attempt.saturating_sub(1))));
        Duration::from_millis(exp.min(self.max_delay.as_millis()) as u64)
    }

    /// Whether another attempt is allowed.
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts
    }
}

/// Rate limit information from response headers.
#[derive(Debug, Clone, Default)]
pub struct RateLimitInfo {
    /// Retry after (milliseconds).
    pub retry_after_ms: Option<u64>,
    /// Retry after (seconds).
    pub retry_after_secs: Option<u64>,
}

impl RateLimitInfo {
    /// Parse rate limit info from response headers.
    pub fn from_headers<'a>(
        headers: impl Iterator<Item = (&'a str, &'a str)>,
    ) -> Option<Self> {
        let mut info = RateLimitInfo::default();
        let mut has_info = false;

        for (key, value) in headers {
            let key_lower = key.to_lowercase();
            if key_lower == "retry-after-ms" {
                if let Ok(ms) = value.parse::<u64>() {
                    info.retry_after_ms = Some(ms);
                    has_info = true;
                }
            } else if key_lower == "retry-after" {
                if let Ok(secs) = value.parse::<u64>() {
                    info.retry_after_secs = Some(secs);
                    has_info = true;
                }
            }
        }

        has_info.then_some(info)
    }

    /// The delay the server asked us to wait.
    pub fn retry_after(&self) -> Option<Duration> {
        if let Some(ms) = self.retry_after_ms {
            return Some(Duration::from_millis(ms));
        }
        self.retry_after_secs.map(Duration::from_secs)
    }
}
