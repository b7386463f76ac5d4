use std::{
    fmt,
    future::Future,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use {
    serde::Serialize,
    switchboard_config::BreakerConfig,
    tokio::time::Instant,
    tracing::{debug, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{breaker as breaker_metrics, counter, gauge, histogram, labels};

use crate::{
    BreakerError,
    window::{Outcome, RollingWindow, WindowCounts},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOptions {
    /// Hard limit on each protected call.
    pub timeout: Duration,
    /// Open when the failure share of the window exceeds this percentage.
    pub error_threshold_percentage: u8,
    /// Calls required in the window before the percentage is considered.
    pub volume_threshold: u32,
    /// Time spent open before probes are allowed.
    pub reset_timeout: Duration,
    pub rolling_window: Duration,
    pub rolling_buckets: u32,
    pub half_open_max_calls: u32,
}

impl Default for BreakerOptions {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

impl From<&BreakerConfig> for BreakerOptions {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            timeout: Duration::from_millis(config.timeout_ms),
            error_threshold_percentage: config.error_threshold_percentage,
            volume_threshold: config.volume_threshold,
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            rolling_window: Duration::from_millis(config.rolling_window_ms),
            rolling_buckets: config.rolling_buckets,
            half_open_max_calls: config.half_open_max_calls.max(1),
        }
    }
}

/// Point-in-time view for status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub counts: WindowCounts,
    pub failure_percentage: f64,
    /// Milliseconds since the circuit last opened, while not closed.
    pub opened_ms_ago: Option<u64>,
}

struct Inner {
    state: CircuitState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

pub struct CircuitBreaker {
    name: String,
    options: BreakerOptions,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, options: BreakerOptions) -> Self {
        let window = RollingWindow::new(options.rolling_window, options.rolling_buckets);
        Self {
            name: name.into(),
            options,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                window,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BreakerOptions {
        &self.options
    }

    /// Current state, moving OPEN to HALF_OPEN if the reset timeout passed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, now);
        let counts = inner.window.counts(now);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            counts,
            failure_percentage: counts.failure_percentage(),
            opened_ms_ago: inner
                .opened_at
                .map(|at| now.duration_since(at).as_millis() as u64),
        }
    }

    /// Run `call` through the breaker.
    ///
    /// Fails fast with [`BreakerError::Open`] while open. Otherwise the call
    /// runs under the configured timeout and its outcome feeds the window.
    pub async fn execute<T, E, F, Fut>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut permit = self.admit()?;
        let started = Instant::now();
        let result = tokio::time::timeout(self.options.timeout, call()).await;

        #[cfg(feature = "metrics")]
        histogram!(breaker_metrics::CALL_DURATION_SECONDS, labels::BREAKER => self.name.clone())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(value)) => {
                permit.settle(Outcome::Success);
                Ok(value)
            },
            Ok(Err(e)) => {
                permit.settle(Outcome::Failure);
                Err(BreakerError::Failed(e))
            },
            Err(_) => {
                warn!(
                    breaker = %self.name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "protected call timed out"
                );
                permit.settle(Outcome::Timeout);
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    timeout: self.options.timeout,
                })
            },
        }
    }

    /// Like [`execute`](Self::execute), but answers with `fallback()` instead
    /// of an error while the circuit is open.
    pub async fn execute_with_fallback<T, E, F, Fut, Fb>(
        &self,
        call: F,
        fallback: Fb,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Fb: FnOnce() -> T,
    {
        match self.execute(call).await {
            Err(BreakerError::Open { .. }) => Ok(fallback()),
            other => other,
        }
    }

    /// Force the circuit closed and forget the window.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.window.clear();
        inner.probes_in_flight = 0;
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
    }

    /// Force the circuit open, as if it had just tripped.
    pub fn trip(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, CircuitState::Open, Instant::now());
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn admit<E>(&self) -> Result<Permit<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut inner = self.lock();
        self.maybe_half_open(&mut inner, now);

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if inner.probes_in_flight < self.options.half_open_max_calls => {
                inner.probes_in_flight += 1;
                true
            },
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.window.record(now, Outcome::Reject);
                debug!(breaker = %self.name, state = %inner.state, "call rejected");
                #[cfg(feature = "metrics")]
                counter!(breaker_metrics::REJECTS_TOTAL, labels::BREAKER => self.name.clone())
                    .increment(1);
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                });
            },
        };
        Ok(Permit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record(&self, outcome: Outcome, probe: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        if probe {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
        inner.window.record(now, outcome);

        #[cfg(feature = "metrics")]
        {
            let name = self.name.clone();
            counter!(breaker_metrics::CALLS_TOTAL, labels::BREAKER => name.clone()).increment(1);
            match outcome {
                Outcome::Failure => {
                    counter!(breaker_metrics::FAILURES_TOTAL, labels::BREAKER => name)
                        .increment(1)
                },
                Outcome::Timeout => {
                    counter!(breaker_metrics::TIMEOUTS_TOTAL, labels::BREAKER => name)
                        .increment(1)
                },
                Outcome::Success | Outcome::Reject => {},
            }
        }

        match (inner.state, outcome) {
            (CircuitState::HalfOpen, Outcome::Success) if probe => {
                inner.window.clear();
                inner.probes_in_flight = 0;
                self.transition(&mut inner, CircuitState::Closed, now);
            },
            (CircuitState::HalfOpen, Outcome::Failure | Outcome::Timeout) if probe => {
                inner.probes_in_flight = 0;
                self.transition(&mut inner, CircuitState::Open, now);
            },
            (CircuitState::Closed, Outcome::Failure | Outcome::Timeout) => {
                let counts = inner.window.counts(now);
                let percentage = counts.failure_percentage();
                if counts.calls() >= u64::from(self.options.volume_threshold)
                    && percentage > f64::from(self.options.error_threshold_percentage)
                {
                    warn!(
                        breaker = %self.name,
                        calls = counts.calls(),
                        failure_percentage = percentage,
                        "failure threshold exceeded"
                    );
                    self.transition(&mut inner, CircuitState::Open, now);
                }
            },
            _ => {},
        }
    }

    fn maybe_half_open(&self, inner: &mut Inner, now: Instant) {
        let elapsed = inner
            .opened_at
            .is_some_and(|at| now.duration_since(at) >= self.options.reset_timeout);
        if inner.state == CircuitState::Open && elapsed {
            inner.probes_in_flight = 0;
            self.transition(inner, CircuitState::HalfOpen, now);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, now: Instant) {
        let from = inner.state;
        match to {
            CircuitState::Open => inner.opened_at = Some(now),
            CircuitState::Closed => inner.opened_at = None,
            CircuitState::HalfOpen => {},
        }
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, "circuit opened"),
            CircuitState::HalfOpen => info!(breaker = %self.name, "circuit half-open, probing"),
            CircuitState::Closed => info!(breaker = %self.name, %from, "circuit closed"),
        }
        #[cfg(feature = "metrics")]
        {
            counter!(
                breaker_metrics::TRANSITIONS_TOTAL,
                labels::BREAKER => self.name.clone(),
                labels::FROM => from.as_str(),
                labels::TO => to.as_str()
            )
            .increment(1);
            let level = match to {
                CircuitState::Closed => 0.0,
                CircuitState::HalfOpen => 1.0,
                CircuitState::Open => 2.0,
            };
            gauge!(breaker_metrics::STATE, labels::BREAKER => self.name.clone()).set(level);
        }
    }
}

/// Admission ticket for one call. A probe that is dropped before it settles
/// (the caller's future was cancelled) gives its slot back.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(outcome, self.probe);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut inner = self.breaker.lock();
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        rstest::rstest,
        std::sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
    };

    fn options() -> BreakerOptions {
        BreakerOptions {
            timeout: Duration::from_secs(1),
            error_threshold_percentage: 50,
            volume_threshold: 4,
            reset_timeout: Duration::from_secs(30),
            rolling_window: Duration::from_secs(10),
            rolling_buckets: 10,
            half_open_max_calls: 1,
        }
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        breaker.execute(|| async { Ok(1) }).await
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        breaker.execute(|| async { Err("boom".to_string()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn trips_after_volume_and_threshold() {
        let breaker = CircuitBreaker::new("nlp", options());
        for _ in 0..3 {
            assert!(fail(&breaker).await.is_err());
        }
        // Three calls are below the volume threshold.
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(fail(&breaker).await.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[rstest]
    #[case(2, 2, CircuitState::Closed)]
    #[case(1, 3, CircuitState::Open)]
    #[case(4, 0, CircuitState::Closed)]
    #[tokio::test(start_paused = true)]
    async fn threshold_must_be_exceeded(
        #[case] successes: usize,
        #[case] failures: usize,
        #[case] expected: CircuitState,
    ) {
        let breaker = CircuitBreaker::new("nlp", options());
        for _ in 0..successes {
            succeed(&breaker).await.unwrap();
        }
        for _ in 0..failures {
            let _ = fail(&breaker).await;
        }
        assert_eq!(breaker.state(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_until_reset_timeout() {
        let breaker = CircuitBreaker::new("nlp", options());
        breaker.trip();

        let invoked = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let invoked = Arc::clone(&invoked);
            let result: Result<(), BreakerError<String>> = breaker
                .execute(|| async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await;
            assert!(result.unwrap_err().is_open());
        }
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.snapshot().counts.rejects, 5);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_probe_reopens() {
        let breaker = CircuitBreaker::new("nlp", options());
        breaker.trip();
        tokio::time::advance(Duration::from_secs(31)).await;

        assert!(matches!(fail(&breaker).await, Err(BreakerError::Failed(_))));
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(succeed(&breaker).await.unwrap_err().is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_concurrent_probes() {
        let breaker = Arc::new(CircuitBreaker::new("nlp", options()));
        breaker.trip();
        tokio::time::advance(Duration::from_secs(30)).await;

        let slow = {
            let breaker = Arc::clone(&breaker);
            tokio::spawn(async move {
                breaker
                    .execute(|| async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(())
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(succeed(&breaker).await.unwrap_err().is_open());
        slow.await.unwrap().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("nlp", BreakerOptions {
            volume_threshold: 1,
            ..options()
        });
        let result: Result<(), BreakerError<String>> = breaker
            .execute(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(result.unwrap_err().is_timeout());
        assert_eq!(breaker.snapshot().counts.timeouts, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_answers_while_open() {
        let breaker = CircuitBreaker::new("nlp", options());
        breaker.trip();
        let reply: Result<String, BreakerError<String>> = breaker
            .execute_with_fallback(
                || async { Ok("live".to_string()) },
                || "try again later".to_string(),
            )
            .await;
        assert_eq!(reply.unwrap(), "try again later");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_age_out_of_window() {
        let breaker = CircuitBreaker::new("nlp", options());
        for _ in 0..3 {
            let _ = fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(11)).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_and_clears() {
        let breaker = CircuitBreaker::new("nlp", options());
        breaker.trip();
        breaker.reset();
        let snapshot = breaker.snapshot();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.counts, WindowCounts::default());
        assert_eq!(snapshot.opened_ms_ago, None);
    }
}
