//! Client configuration.
//!
//! One `ClientConfig` instance parameterizes the whole core: endpoints,
//! timeouts, the shared retry policy, cache behavior, and the token
//! refresh margin. The realtime channel reuses the same retry policy as
//! HTTP dispatch so backoff behavior stays consistent across transports.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// HTTP request timeout in seconds.
/// 30s allows for slow API responses while failing fast enough for good UX.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum dispatch attempts per request (first try plus retries).
const MAX_ATTEMPTS: u32 = 4;

/// Initial backoff delay in milliseconds.
/// 500ms is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 500;

/// Backoff ceiling in milliseconds.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Buffer time before token expiry that triggers a proactive refresh.
const REFRESH_MARGIN_MINUTES: i64 = 5;

/// Transient retries allowed inside a single refresh call before the
/// refresh is treated as terminal.
const REFRESH_RETRY_LIMIT: u32 = 1;

/// Default TTL for cached read responses.
const CACHE_TTL_MINUTES: i64 = 5;

/// Cached entries kept before the oldest is evicted.
const CACHE_CAPACITY: usize = 512;

/// Window during which same-tick reads are coalesced into one batch call.
const BATCH_WINDOW_MS: u64 = 50;

/// Retry behavior shared by the dispatcher, the refresh path, and the
/// realtime channel's reconnect loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, counting the initial one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff in milliseconds.
    pub initial_delay_ms: u64,
    /// Ceiling for the computed delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_delay_ms: INITIAL_BACKOFF_MS,
            max_delay_ms: MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry `attempt` (1-based): doubles each attempt,
    /// capped at `max_delay_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL for REST endpoints.
    pub api_base_url: String,
    /// WebSocket URL for the realtime channel.
    pub ws_url: String,
    /// Per-request timeout; individual requests may override it.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Minutes before `expires_at` at which a token counts as stale.
    pub refresh_margin_minutes: i64,
    /// Transient retries inside one refresh before it becomes terminal.
    pub refresh_retry_limit: u32,
    pub cache_ttl_minutes: i64,
    pub cache_capacity: usize,
    pub batch_window: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://api.loopline.app".to_string(),
            ws_url: "wss://api.loopline.app/realtime".to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            refresh_margin_minutes: REFRESH_MARGIN_MINUTES,
            refresh_retry_limit: REFRESH_RETRY_LIMIT,
            cache_ttl_minutes: CACHE_TTL_MINUTES,
            cache_capacity: CACHE_CAPACITY,
            batch_window: Duration::from_millis(BATCH_WINDOW_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 500,
            max_delay_ms: 4_000,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay(4), Duration::from_millis(4_000));
        assert_eq!(policy.delay(5), Duration::from_millis(4_000));
    }

    #[test]
    fn test_backoff_monotonic_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = policy.delay(attempt);
            assert!(delay >= last, "delay shrank at attempt {attempt}");
            assert!(delay <= Duration::from_millis(policy.max_delay_ms));
            last = delay;
        }
    }

    #[test]
    fn test_backoff_survives_large_attempt_numbers() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay(u32::MAX),
            Duration::from_millis(policy.max_delay_ms)
        );
    }
}
