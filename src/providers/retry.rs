use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Backoff schedule for rate-limited oracle calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }

    /// Sleeps for the current delay (or the server's hint, if longer) and
    /// returns the next delay.
    pub(crate) async fn wait(
        &self,
        provider: &str,
        attempt: usize,
        delay: Duration,
        retry_after: Option<Duration>,
    ) -> Duration {
        let wait = match retry_after {
            Some(hint) if hint > delay => hint.min(self.max_delay),
            _ => delay,
        };
        warn!(
            "{} rate limited; retrying in {:.1}s (attempt {}/{})",
            provider,
            wait.as_secs_f32(),
            attempt,
            self.max_attempts
        );
        sleep(wait).await;
        self.next_delay(delay)
    }

    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .saturating_mul(2)
            .max(self.base_delay)
            .min(self.max_delay)
    }
}

pub(crate) fn is_rate_limited(status: StatusCode, body: &str) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    if matches!(status.as_u16(), 503 | 529) {
        return true;
    }
    let lower = body.to_lowercase();
    [
        "rate limit",
        "rate_limit",
        "too many requests",
        "resource_exhausted",
        "overloaded",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get("retry-after")?.to_str().ok()?.trim();
    value.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy::default();
        let mut delay = policy.base_delay;
        let mut seen = Vec::new();
        for _ in 0..6 {
            delay = policy.next_delay(delay);
            seen.push(delay.as_secs());
        }
        assert_eq!(seen, vec![4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn zero_delay_restarts_at_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(Duration::ZERO), policy.base_delay);
    }

    #[test]
    fn rate_limits_are_recognised() {
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS, ""));
        assert!(is_rate_limited(StatusCode::SERVICE_UNAVAILABLE, ""));
        assert!(is_rate_limited(
            StatusCode::BAD_REQUEST,
            r#"{"error":{"status":"RESOURCE_EXHAUSTED"}}"#
        ));
        assert!(!is_rate_limited(StatusCode::UNAUTHORIZED, "invalid key"));
    }

    #[test]
    fn retry_after_reads_seconds() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn attempts_are_bounded() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(policy.max_attempts));
    }
}
