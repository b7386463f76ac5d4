//! Config schema types (store, idempotency, queue, locks, breaker, rate limit, workers).
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub store: StoreConfig,
    pub idempotency: IdempotencyConfig,
    pub queue: QueueConfig,
    pub locks: LockConfig,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub workers: WorkerConfig,
    pub metrics: MetricsConfig,
}

/// Shared-state backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// sqlx SQLite URL. Defaults to `sqlite://switchboard.db?mode=rwc`.
    pub database_url: String,
    /// Maximum pooled connections.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://switchboard.db?mode=rwc".into(),
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a seen external id is remembered. Defaults to 300.
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_secs: 300 }
    }
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Total runs allowed per job before it is dead-lettered. Defaults to 3.
    pub max_attempts: u32,
    /// First retry delay. Defaults to 1000.
    pub backoff_base_ms: u64,
    /// Growth factor between retries. Defaults to 2.0.
    pub backoff_multiplier: f64,
    /// Upper bound on a single retry delay. Defaults to 300000 (5 minutes).
    pub backoff_max_ms: u64,
    /// Fractional jitter applied to each delay (0.3 = ±30%).
    pub backoff_jitter: f64,
    /// An active job older than this is considered stalled. Defaults to 120.
    pub stall_timeout_secs: u64,
    /// How many times a stalled job is returned to pending. Defaults to 1.
    pub max_stalled: u32,
    /// Maximum pending + active jobs before enqueue is rejected.
    pub capacity: u64,
    /// Idle poll interval for workers waiting on due jobs.
    pub poll_interval_ms: u64,
    /// Interval between stall sweeps and retention purges.
    pub maintenance_interval_secs: u64,
    /// Completed jobs are kept this long. Defaults to 3600.
    pub retain_completed_secs: u64,
    /// ...and at most this many.
    pub retain_completed_count: u64,
    /// Dead-lettered jobs are kept this long. Defaults to 7 days.
    pub retain_dead_letter_secs: u64,
    /// ...and at most this many.
    pub retain_dead_letter_count: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 300_000,
            backoff_jitter: 0.3,
            stall_timeout_secs: 120,
            max_stalled: 1,
            capacity: 10_000,
            poll_interval_ms: 500,
            maintenance_interval_secs: 30,
            retain_completed_secs: 3_600,
            retain_completed_count: 1_000,
            retain_dead_letter_secs: 7 * 24 * 3_600,
            retain_dead_letter_count: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lease length for a session lock. Must comfortably exceed the longest
    /// protected work (downstream call plus reply send). Defaults to 60.
    pub ttl_secs: u64,
    /// Extra acquisition attempts after the first. Defaults to 3.
    pub retry_count: u32,
    /// Delay between acquisition attempts. Defaults to 200.
    pub retry_delay_ms: u64,
    /// Random extra delay added to each retry. Defaults to 100.
    pub retry_jitter_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            retry_count: 3,
            retry_delay_ms: 200,
            retry_jitter_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Hard timeout for each protected call. Defaults to 10000.
    pub timeout_ms: u64,
    /// Failure percentage above which the circuit opens. Defaults to 50.
    pub error_threshold_percentage: u8,
    /// Minimum calls in the window before the percentage is considered.
    pub volume_threshold: u32,
    /// Time spent open before probing. Defaults to 30000.
    pub reset_timeout_ms: u64,
    /// Statistical window length. Defaults to 10000.
    pub rolling_window_ms: u64,
    /// Buckets the window is divided into. Defaults to 10.
    pub rolling_buckets: u32,
    /// Concurrent probes allowed while half-open. Defaults to 1.
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            error_threshold_percentage: 50,
            volume_threshold: 5,
            reset_timeout_ms: 30_000,
            rolling_window_ms: 10_000,
            rolling_buckets: 10,
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Replies per destination per clock hour. Defaults to 20.
    pub hourly_max: u32,
    /// Replies per destination per UTC day. Defaults to 200.
    pub daily_max: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            hourly_max: 20,
            daily_max: 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Parallel workers pulling from the queue. Defaults to 10.
    pub concurrency: usize,
    /// Account (sending number) the rate limiter counts against.
    pub account_id: String,
    /// Hard timeout for one outbound reply send. Defaults to 10000.
    pub send_timeout_ms: u64,
    /// How long a job may keep waiting on a busy or unreachable session lock
    /// before each further wait costs an attempt. Defaults to 600.
    pub max_defer_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            account_id: "default".into(),
            send_timeout_ms: 10_000,
            max_defer_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Install the Prometheus recorder. Defaults to false.
    pub enabled: bool,
    /// Labels added to every metric.
    pub labels: BTreeMap<String, String>,
}
