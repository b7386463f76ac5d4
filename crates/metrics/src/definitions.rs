//! Metric name and label definitions.
//!
//! Every metric the switchboard crates emit is named here so dashboards and
//! alerts have a single place to look.

/// Idempotency gate metrics
pub mod idempotency {
    /// Events admitted on first sight
    pub const ADMITTED_TOTAL: &str = "switchboard_idempotency_admitted_total";
    /// Events rejected as duplicates within the idempotency window
    pub const DUPLICATES_TOTAL: &str = "switchboard_idempotency_duplicates_total";
    /// Admissions granted because the store was unreachable (fail-open)
    pub const FAIL_OPEN_TOTAL: &str = "switchboard_idempotency_fail_open_total";
}

/// Work queue metrics
pub mod queue {
    /// Jobs enqueued
    pub const ENQUEUED_TOTAL: &str = "switchboard_queue_enqueued_total";
    /// Enqueue attempts that hit an existing job key
    pub const DUPLICATES_TOTAL: &str = "switchboard_queue_duplicates_total";
    /// Enqueue attempts rejected because the queue was at capacity
    pub const REJECTED_FULL_TOTAL: &str = "switchboard_queue_rejected_full_total";
    /// Jobs completed
    pub const COMPLETED_TOTAL: &str = "switchboard_queue_completed_total";
    /// Jobs rescheduled after a retryable failure
    pub const RETRIES_TOTAL: &str = "switchboard_queue_retries_total";
    /// Jobs moved to the dead-letter set
    pub const DEAD_LETTERED_TOTAL: &str = "switchboard_queue_dead_lettered_total";
    /// Jobs postponed without consuming an attempt
    pub const DEFERRED_TOTAL: &str = "switchboard_queue_deferred_total";
    /// Stalled jobs returned to pending
    pub const STALLED_RECOVERED_TOTAL: &str = "switchboard_queue_stalled_recovered_total";
    /// Finished jobs purged by retention
    pub const PURGED_TOTAL: &str = "switchboard_queue_purged_total";
    /// Time from claim to acknowledgement in seconds
    pub const PROCESSING_DURATION_SECONDS: &str = "switchboard_queue_processing_duration_seconds";
}

/// Session lock metrics
pub mod locks {
    /// Locks acquired
    pub const ACQUIRED_TOTAL: &str = "switchboard_locks_acquired_total";
    /// Acquisitions that gave up after exhausting retries
    pub const UNAVAILABLE_TOTAL: &str = "switchboard_locks_unavailable_total";
    /// Releases that found the lock held by another token or already expired
    pub const STALE_RELEASES_TOTAL: &str = "switchboard_locks_stale_releases_total";
    /// Store errors seen while acquiring or releasing
    pub const STORE_ERRORS_TOTAL: &str = "switchboard_locks_store_errors_total";
}

/// Circuit breaker metrics
pub mod breaker {
    /// Calls that ran the protected function
    pub const CALLS_TOTAL: &str = "switchboard_breaker_calls_total";
    /// Calls that failed (error or timeout)
    pub const FAILURES_TOTAL: &str = "switchboard_breaker_failures_total";
    /// Calls that exceeded the hard timeout
    pub const TIMEOUTS_TOTAL: &str = "switchboard_breaker_timeouts_total";
    /// Calls short-circuited while open
    pub const REJECTS_TOTAL: &str = "switchboard_breaker_rejects_total";
    /// State transitions
    pub const TRANSITIONS_TOTAL: &str = "switchboard_breaker_transitions_total";
    /// Current state (0 = closed, 1 = half-open, 2 = open)
    pub const STATE: &str = "switchboard_breaker_state";
    /// Duration of protected calls in seconds
    pub const CALL_DURATION_SECONDS: &str = "switchboard_breaker_call_duration_seconds";
}

/// Outbound rate limiter metrics
pub mod rate_limit {
    /// Sends allowed by the limiter
    pub const ALLOWED_TOTAL: &str = "switchboard_rate_limit_allowed_total";
    /// Sends blocked, labelled by reason
    pub const BLOCKED_TOTAL: &str = "switchboard_rate_limit_blocked_total";
    /// Store errors seen while checking or incrementing
    pub const STORE_ERRORS_TOTAL: &str = "switchboard_rate_limit_store_errors_total";
}

/// Pipeline metrics
pub mod pipeline {
    /// Inbound events handed to the ingress
    pub const EVENTS_RECEIVED_TOTAL: &str = "switchboard_pipeline_events_received_total";
    /// Replies delivered through the outbound sender
    pub const REPLIES_SENT_TOTAL: &str = "switchboard_pipeline_replies_sent_total";
    /// Replies suppressed by the rate limiter
    pub const REPLIES_SUPPRESSED_TOTAL: &str = "switchboard_pipeline_replies_suppressed_total";
    /// Number of workers currently processing a job
    pub const WORKERS_BUSY: &str = "switchboard_pipeline_workers_busy";
    /// Job runs that ended in a panic inside a collaborator
    pub const JOBS_PANICKED_TOTAL: &str = "switchboard_pipeline_jobs_panicked_total";
}

/// Common label keys
pub mod labels {
    pub const BREAKER: &str = "breaker";
    pub const FROM: &str = "from";
    pub const TO: &str = "to";
    pub const REASON: &str = "reason";
    pub const OUTCOME: &str = "outcome";
}

/// Histogram bucket boundaries
pub mod buckets {
    use once_cell::sync::Lazy;

    /// Downstream call durations, 10ms to 2 minutes
    pub static CALL_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0,
        ]
    });

    /// Job processing durations, including lock waits and the reply send
    pub static JOB_DURATION: Lazy<Vec<f64>> = Lazy::new(|| {
        vec![
            0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
        ]
    });
}
