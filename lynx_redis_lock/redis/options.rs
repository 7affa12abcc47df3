use chrono::Duration;

/// Backoff policy applied by the retry engine to a contended or transport-failing `Acquire`.
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    /// Ceiling on the number of retry attempts.
    pub max_retries: usize,
    /// Base delay before the first retry.
    pub retry_delay: Duration,
    /// Delay never grows past this, regardless of `multiplier`.
    pub max_interval: Duration,
    /// Exponential growth factor applied to `retry_delay` each attempt.
    pub multiplier: f64,
    /// Cumulative delay ceiling across all attempts.
    pub max_elapsed_time: Duration,
    /// Perturb each computed delay by a uniform factor in `[0.5, 1.5]`.
    pub jitter: bool,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::milliseconds(100),
            max_interval: Duration::seconds(5),
            multiplier: 2.0,
            max_elapsed_time: Duration::seconds(30),
            jitter: true,
        }
    }
}

/// Tuning for the background renewal service's behaviour towards a single tick.
#[derive(Debug, Clone)]
pub struct RenewalConfig {
    /// Transport-failure retries attempted within the same tick before giving up until next
    /// tick.
    pub max_retries: usize,
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

/// Per-handle configuration. Immutable once a [`super::LockHandle`] is constructed from it.
#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Lease duration granted by each successful `Acquire`/`Renew`.
    pub expiration: Duration,
    /// Retry policy applied by `AcquireWithRetry`.
    pub retry_strategy: RetryStrategy,
    /// Whether the renewal service should keep this handle's lease alive.
    pub renewal_enabled: bool,
    /// Fraction of `expiration` remaining at which the renewal service renews.
    pub renewal_threshold: f64,
    /// Parallelism of the renewal service's worker pool.
    pub worker_pool_size: usize,
    /// Transport-retry tuning used by the renewal service.
    pub renewal_config: RenewalConfig,
    /// Per-script-call timeout.
    pub script_call_timeout: std::time::Duration,
    /// Maximum reentry depth before further `Acquire` calls fail with `InvalidArgument`.
    pub max_reentry: i64,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            expiration: Duration::seconds(30),
            retry_strategy: RetryStrategy::default(),
            renewal_enabled: true,
            renewal_threshold: 0.5,
            worker_pool_size: default_worker_pool_size(),
            renewal_config: RenewalConfig::default(),
            script_call_timeout: std::time::Duration::from_secs(5),
            max_reentry: 1024,
        }
    }
}

fn default_worker_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .max(4)
}
