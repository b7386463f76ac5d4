//! Semantic validation of a loaded configuration.

use crate::schema::SwitchboardConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "queue.max_attempts"
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}: {}", self.severity, self.path, self.message)
    }
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: &str, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.to_string(),
            message: message.into(),
        });
    }
}

/// Check value ranges and cross-field constraints.
pub fn validate(config: &SwitchboardConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.store.database_url.trim().is_empty() {
        result.push(Severity::Error, "store.database_url", "must not be empty");
    }
    if config.store.max_connections == 0 {
        result.push(Severity::Error, "store.max_connections", "must be at least 1");
    }

    if config.idempotency.ttl_secs == 0 {
        result.push(
            Severity::Error,
            "idempotency.ttl_secs",
            "must be positive, duplicates would never be detected",
        );
    }

    let queue = &config.queue;
    if queue.max_attempts == 0 {
        result.push(Severity::Error, "queue.max_attempts", "must be at least 1");
    }
    if queue.backoff_multiplier < 1.0 || !queue.backoff_multiplier.is_finite() {
        result.push(
            Severity::Error,
            "queue.backoff_multiplier",
            "must be a finite value of at least 1.0",
        );
    }
    if !(0.0..1.0).contains(&queue.backoff_jitter) {
        result.push(
            Severity::Error,
            "queue.backoff_jitter",
            "must be in the range [0.0, 1.0)",
        );
    }
    if queue.backoff_max_ms < queue.backoff_base_ms {
        result.push(
            Severity::Warning,
            "queue.backoff_max_ms",
            "is below backoff_base_ms, every retry will use the cap",
        );
    }
    if queue.capacity == 0 {
        result.push(Severity::Error, "queue.capacity", "must be at least 1");
    }
    if queue.poll_interval_ms == 0 {
        result.push(Severity::Error, "queue.poll_interval_ms", "must be positive");
    }
    if queue.maintenance_interval_secs == 0 {
        result.push(
            Severity::Error,
            "queue.maintenance_interval_secs",
            "must be positive",
        );
    }

    let breaker = &config.breaker;
    if breaker.error_threshold_percentage == 0 || breaker.error_threshold_percentage > 100 {
        result.push(
            Severity::Error,
            "breaker.error_threshold_percentage",
            "must be between 1 and 100",
        );
    }
    if breaker.timeout_ms == 0 {
        result.push(Severity::Error, "breaker.timeout_ms", "must be positive");
    }
    if breaker.rolling_buckets == 0 || breaker.rolling_window_ms < u64::from(breaker.rolling_buckets)
    {
        result.push(
            Severity::Error,
            "breaker.rolling_buckets",
            "must be at least 1 and no larger than rolling_window_ms",
        );
    }
    if breaker.half_open_max_calls == 0 {
        result.push(
            Severity::Error,
            "breaker.half_open_max_calls",
            "must be at least 1 or the circuit can never close again",
        );
    }

    // A lock that expires while the downstream call is still running lets a
    // second worker into the same session.
    let lock_ttl_ms = config.locks.ttl_secs.saturating_mul(1_000);
    let protected_ms = breaker
        .timeout_ms
        .saturating_add(config.workers.send_timeout_ms);
    if lock_ttl_ms == 0 {
        result.push(Severity::Error, "locks.ttl_secs", "must be positive");
    } else if lock_ttl_ms < protected_ms.saturating_mul(2) {
        result.push(
            Severity::Warning,
            "locks.ttl_secs",
            format!(
                "{}s is less than twice the downstream and send timeouts ({}ms)",
                config.locks.ttl_secs, protected_ms
            ),
        );
    }
    if queue.stall_timeout_secs < config.locks.ttl_secs {
        result.push(
            Severity::Warning,
            "queue.stall_timeout_secs",
            "is shorter than locks.ttl_secs, healthy jobs may be reclaimed as stalled",
        );
    }

    if config.rate_limit.hourly_max > config.rate_limit.daily_max {
        result.push(
            Severity::Warning,
            "rate_limit.hourly_max",
            "exceeds daily_max, the daily limit will always bind first",
        );
    }

    if config.workers.concurrency == 0 {
        result.push(Severity::Error, "workers.concurrency", "must be at least 1");
    }
    if config.workers.account_id.trim().is_empty() {
        result.push(Severity::Error, "workers.account_id", "must not be empty");
    }
    if config.workers.send_timeout_ms == 0 {
        result.push(Severity::Error, "workers.send_timeout_ms", "must be positive");
    }
    if config.workers.max_defer_secs == 0 {
        result.push(
            Severity::Error,
            "workers.max_defer_secs",
            "must be positive, every busy session would cost an attempt",
        );
    }

    result
}
