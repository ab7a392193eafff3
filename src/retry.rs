//! Retry policy for provisioning and key requests.
use std::cmp::min;
use std::time::Duration;

use crate::transport::TransportError;

/// Kind of data a load belongs to. Only DRM requests go through this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Drm,
}

/// Everything a policy gets to see about a failed attempt.
#[derive(Debug, Clone, Copy)]
pub struct LoadErrorInfo<'a> {
    pub task_id: u64,
    pub data_type: DataType,
    pub error: &'a TransportError,
    /// Failures of this task so far, including this one.
    pub error_count: u32,
    /// Time since the task was first posted.
    pub load_duration: Duration,
}

/// Decides whether and when a failed request is attempted again.
pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, or `None` if the error is fatal.
    fn retry_delay(&self, info: &LoadErrorInfo<'_>) -> Option<Duration>;

    /// Retries allowed before an error is treated as fatal.
    fn minimum_retry_count(&self, data_type: DataType) -> u32;

    /// Called once per task when it succeeds, fails for good or is cancelled.
    fn on_task_concluded(&self, _task_id: u64) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
        }
    }

    /// Exponential backoff for the `error_count`-th failure, capped at `max_delay`.
    pub fn delay_for_attempt(&self, error_count: u32) -> Duration {
        if error_count == 0 {
            return Duration::ZERO;
        }

        let factor = 2_u32.saturating_pow(error_count - 1);
        min(self.base_delay.saturating_mul(factor), self.max_delay)
    }
}

/// Retries transient failures with exponential backoff.
///
/// HTTP client errors other than 408 and 429 are fatal.
#[derive(Clone, Debug, Default)]
pub struct DefaultRetryPolicy {
    config: RetryConfig,
}

impl DefaultRetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn retry_delay(&self, info: &LoadErrorInfo<'_>) -> Option<Duration> {
        if !info.error.is_retryable() {
            return None;
        }
        Some(self.config.delay_for_attempt(info.error_count))
    }

    fn minimum_retry_count(&self, _data_type: DataType) -> u32 {
        self.config.max_retries
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn info(error: &TransportError, error_count: u32) -> LoadErrorInfo<'_> {
        LoadErrorInfo {
            task_id: 1,
            data_type: DataType::Drm,
            error,
            error_count,
            load_duration: Duration::from_millis(10),
        }
    }

    #[rstest]
    #[case::first_failure(1, Duration::from_secs(1))]
    #[case::second_failure(2, Duration::from_secs(2))]
    #[case::third_failure(3, Duration::from_secs(4))]
    #[case::capped(4, Duration::from_secs(5))]
    #[case::far_beyond_cap(40, Duration::from_secs(5))]
    fn backoff_doubles_up_to_cap(#[case] error_count: u32, #[case] expected: Duration) {
        let policy = DefaultRetryPolicy::default();
        let error = TransportError::new("connection reset");
        assert_eq!(policy.retry_delay(&info(&error, error_count)), Some(expected));
    }

    #[test]
    fn client_errors_are_fatal() {
        let policy = DefaultRetryPolicy::default();
        let error = TransportError::http_status(403, "https://license.example/");
        assert_eq!(policy.retry_delay(&info(&error, 1)), None);
    }

    #[test]
    fn retry_count_follows_config() {
        let policy = DefaultRetryPolicy::new(RetryConfig::new(
            7,
            Duration::from_millis(5),
            Duration::from_millis(50),
        ));
        assert_eq!(policy.minimum_retry_count(DataType::Drm), 7);
    }
}
