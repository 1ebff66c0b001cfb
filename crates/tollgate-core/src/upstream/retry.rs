use std::collections::HashSet;
use std::time::Duration;

use rand::Rng;
use tollgate_common::HttpClientConfig;

/// Retry/backoff parameters lifted straight from `HttpClientConfig`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retryable_statuses: HashSet<u16>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &HttpClientConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retryable_statuses: config.retryable_statuses.clone(),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// `min(max_delay, base_delay * 2^attempt + U(0, 1s))`, unless the caller
/// supplies a `Retry-After` value, in which case that takes precedence
/// (still capped at `max_delay`).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
        return Duration::from_secs(secs).min(policy.max_delay);
    }
    let exp = policy.base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let jitter_ms = rand::thread_rng().gen_range(0..1000);
    (exp + Duration::from_millis(jitter_ms)).min(policy.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retryable_statuses: [429, 500, 502, 503, 504].into_iter().collect(),
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }

    #[test]
    fn retry_after_takes_precedence_and_is_capped() {
        let p = policy();
        assert_eq!(backoff_delay(&p, 0, Some(1)), Duration::from_secs(1));
        assert_eq!(backoff_delay(&p, 0, Some(3600)), Duration::from_secs(30));
    }

    #[test]
    fn exponential_backoff_grows_and_is_capped() {
        let p = policy();
        let d0 = backoff_delay(&p, 0, None);
        let d1 = backoff_delay(&p, 1, None);
        assert!(d0 >= Duration::from_millis(500) && d0 < Duration::from_millis(1500));
        assert!(d1 >= Duration::from_millis(1000) && d1 < Duration::from_millis(2000));
        let d_large = backoff_delay(&p, 20, None);
        assert_eq!(d_large, Duration::from_secs(30));
    }

    #[test]
    fn max_attempts_is_retries_plus_one() {
        assert_eq!(policy().max_attempts(), 4);
    }
}
