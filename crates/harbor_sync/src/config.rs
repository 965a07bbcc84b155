//! Configuration for the sync engine.

use std::time::Duration;

/// Default number of failed deliveries after which an operation leaves the
/// queue.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Timeout applied to every remote call.
    pub request_timeout: Duration,
    /// Failed deliveries after which a queued operation is abandoned.
    pub max_attempts: u32,
    /// Backoff between failed background drain cycles.
    pub retry: RetryConfig,
    /// How often the background loop retries a non-empty queue.
    pub poll_interval: Duration,
    /// Connectivity belief at startup.
    pub start_online: bool,
    /// Whether the background loop reloads in-memory views on storage
    /// change notifications.
    pub watch_storage: bool,
    /// Lifetime of cached order statistics.
    pub stats_ttl: Duration,
    /// Numeric record field summed into order statistics.
    pub amount_field: String,
}

impl SyncConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryConfig::default(),
            poll_interval: Duration::from_secs(30),
            start_online: true,
            watch_storage: false,
            stats_ttl: Duration::from_secs(60),
            amount_field: "price".to_string(),
        }
    }

    /// Sets the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the attempt limit for queued operations.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the background poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the connectivity belief at startup.
    pub fn start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }

    /// Enables storage change watching in the background loop.
    pub fn with_storage_watch(mut self, watch: bool) -> Self {
        self.watch_storage = watch;
        self
    }

    /// Sets the lifetime of cached statistics.
    pub fn with_stats_ttl(mut self, ttl: Duration) -> Self {
        self.stats_ttl = ttl;
        self
    }

    /// Sets the field summed into statistics.
    pub fn with_amount_field(mut self, field: impl Into<String>) -> Self {
        self.amount_field = field.into();
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before retry number `attempt` (0 means the first
    /// try, which has no delay).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(capped + capped * 0.25 * rand::random::<f64>())
        } else {
            Duration::from_secs_f64(capped)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new()
            .with_timeout(Duration::from_secs(3))
            .with_max_attempts(4)
            .start_online(false)
            .with_amount_field("total");

        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.max_attempts, 4);
        assert!(!config.start_online);
        assert_eq!(config.amount_field, "total");
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(config.start_online);
        assert!(!config.watch_storage);
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(SyncConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay <= Duration::from_millis(6250));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let config = RetryConfig::new(3).with_initial_delay(Duration::from_millis(400));
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(399));
            assert!(delay <= Duration::from_millis(500));
        }
    }
}
