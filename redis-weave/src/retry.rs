//! Retry policy for failed commands
//!
//! Read-only commands are retried on transport failures and on the
//! transient server errors `TRYAGAIN`, `LOADING` and `CLUSTERDOWN`. Writes
//! are only retried when [`RetryConfig::retry_writes`] is set, so a write
//! that may have reached the server is never applied twice by accident.

use rand::Rng;
use redis_weave_core::{config::RetryConfig, error::RedisError};
use std::time::Duration;
use tracing::debug;

/// Whether `err` may go away by itself
pub(crate) fn is_retryable(err: &RedisError) -> bool {
    match err {
        RedisError::Io(_)
        | RedisError::Timeout
        | RedisError::Connection(_)
        | RedisError::ConnExpired => true,
        RedisError::Server(_) => err.is_try_again() || err.is_loading() || err.is_cluster_down(),
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Whether attempt number `attempt` (1-based) may follow `err`
    pub fn should_retry(&self, attempt: usize, readonly: bool, err: &RedisError) -> bool {
        self.config.enabled
            && (readonly || self.config.retry_writes)
            && self.config.max_attempts.map_or(true, |max| attempt <= max)
            && is_retryable(err)
    }

    /// Jittered exponential delay before retry number `attempt`
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.config.initial_delay.as_secs_f64() * self.config.backoff_multiplier.powi(exp);
        let ceiling = scaled.min(self.config.max_delay.as_secs_f64()).max(0.0);
        if ceiling == 0.0 {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(ceiling / 2.0..=ceiling);
        Duration::from_secs_f64(secs)
    }

    /// Sleep for the backoff of `attempt`
    pub async fn wait(&self, attempt: usize, err: &RedisError) {
        let delay = self.backoff(attempt);
        debug!(attempt, delay = ?delay, error = %err, "retrying command");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(
            RetryConfig::default().with_delays(Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let policy = policy();
        for _ in 0..100 {
            let first = policy.backoff(1);
            assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(100));

            let third = policy.backoff(3);
            assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(400));

            let late = policy.backoff(20);
            assert!(late >= Duration::from_millis(500) && late <= Duration::from_secs(1));
        }
    }

    #[test]
    fn test_writes_are_not_retried_by_default() {
        let policy = policy();
        let err = RedisError::Timeout;
        assert!(policy.should_retry(1, true, &err));
        assert!(!policy.should_retry(1, false, &err));

        let writes = RetryPolicy::new(RetryConfig {
            retry_writes: true,
            ..RetryConfig::default()
        });
        assert!(writes.should_retry(1, false, &err));
    }

    #[test]
    fn test_attempt_limit() {
        let policy = policy();
        let err = RedisError::Connection("reset".into());
        assert!(policy.should_retry(3, true, &err));
        assert!(!policy.should_retry(4, true, &err));
        assert!(!RetryPolicy::new(RetryConfig::disabled()).should_retry(1, true, &err));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&RedisError::from_server("TRYAGAIN Multiple keys request during rehashing")));
        assert!(is_retryable(&RedisError::from_server("LOADING Redis is loading the dataset")));
        assert!(is_retryable(&RedisError::from_server("CLUSTERDOWN The cluster is down")));
        assert!(!is_retryable(&RedisError::from_server("ERR wrong number of arguments")));
        assert!(!is_retryable(&RedisError::Closing));
        assert!(!is_retryable(&RedisError::Nil));
    }
}
