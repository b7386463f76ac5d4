//! Worker pool that drives queued jobs to completion.
//!
//! Each job runs under its sender's session lock: the processor call goes
//! through the circuit breaker, the reply is checked against the rate
//! limiter, sent, and only then counted. Failures before the send go back to
//! the queue for a retry; a suppressed reply completes the job.
//!
//! Every job runs on its own task. A collaborator that panics costs the job
//! an attempt and leaves the worker running.

use std::{sync::Arc, time::Duration};

use {
    switchboard_breaker::{BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker},
    switchboard_common::{InboundEvent, duration_ms, now_ms},
    switchboard_config::SwitchboardConfig,
    switchboard_locks::{ExclusiveError, SessionKey},
    switchboard_queue::{Job, NackOutcome},
    switchboard_ratelimit::{BlockReason, RateDecision},
    thiserror::Error,
    tokio::task::{JoinError, JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{counter, gauge, labels, pipeline as pipeline_metrics};

use crate::{Processor, ReplySender, Result, Services};

/// Breaker name guarding the processor.
pub const PROCESSOR_BREAKER: &str = "processor";

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    /// Account the rate limiter counts replies against.
    pub account_id: String,
    pub lock_ttl: Duration,
    /// How long a job waits before retrying when its session is busy.
    pub defer_delay: Duration,
    /// Once a job is this old, a busy session costs it an attempt instead
    /// of a free deferral.
    pub max_defer: Duration,
    pub send_timeout: Duration,
    /// Interval between marker and lock purges.
    pub housekeeping_interval: Duration,
}

impl From<&SwitchboardConfig> for WorkerOptions {
    fn from(config: &SwitchboardConfig) -> Self {
        let locks = &config.locks;
        let workers = &config.workers;
        Self {
            concurrency: workers.concurrency.max(1),
            account_id: workers.account_id.clone(),
            lock_ttl: locks.ttl(),
            defer_delay: Duration::from_millis(
                locks
                    .retry_delay_ms
                    .max(1)
                    .saturating_mul(u64::from(locks.retry_count.saturating_add(1))),
            ),
            max_defer: Duration::from_secs(workers.max_defer_secs),
            send_timeout: Duration::from_millis(workers.send_timeout_ms.max(1)),
            housekeeping_interval: Duration::from_secs(
                config.queue.maintenance_interval_secs.max(1),
            ),
        }
    }
}

/// Final disposition of one claimed job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Reply sent, or no reply was due.
    Completed,
    /// Processed, but the reply was withheld by the rate limiter.
    Suppressed(BlockReason),
    Retrying { attempt: u32, delay: Duration },
    DeadLettered,
    /// The session was busy; the job waits without spending an attempt.
    Deferred,
    /// The lease was lost to stall recovery before the job could be settled.
    Stale,
}

enum Delivery {
    Sent,
    NoReply,
    Suppressed(BlockReason),
}

#[derive(Debug, Error)]
enum DeliveryError {
    #[error("processor: {0}")]
    Processor(BreakerError<anyhow::Error>),

    #[error("reply send failed: {0}")]
    Send(anyhow::Error),

    #[error("reply send timed out after {0:?}")]
    SendTimeout(Duration),
}

/// Rows removed by one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Housekeeping {
    markers: u64,
    locks: u64,
}

pub struct WorkerPool {
    services: Services,
    processor: Arc<dyn Processor>,
    sender: Arc<dyn ReplySender>,
    breaker: Arc<CircuitBreaker>,
    options: WorkerOptions,
}

impl WorkerPool {
    pub fn new(
        services: Services,
        processor: Arc<dyn Processor>,
        sender: Arc<dyn ReplySender>,
        options: WorkerOptions,
    ) -> Self {
        let breaker = services.breakers.get(PROCESSOR_BREAKER);
        Self {
            services,
            processor,
            sender,
            breaker,
            options,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Spawn the workers and the maintenance tasks.
    pub fn start(self) -> PoolHandle {
        let cancel = CancellationToken::new();
        let pool = Arc::new(self);

        let workers = (0..pool.options.concurrency)
            .map(|worker| {
                let pool = Arc::clone(&pool);
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run_worker(worker, cancel).await })
            })
            .collect();

        let maintenance = vec![
            pool.services.queue.spawn_maintenance(cancel.clone()),
            spawn_housekeeping(Arc::clone(&pool), cancel.clone()),
        ];

        info!(
            concurrency = pool.options.concurrency,
            account_id = %pool.options.account_id,
            "worker pool started"
        );
        PoolHandle {
            cancel,
            workers,
            maintenance,
            breakers: Arc::clone(&pool.services.breakers),
        }
    }

    async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(worker, "worker started");
        loop {
            let job = match self.services.queue.dequeue(&cancel).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker, error = %e, "dequeue failed");
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep(self.services.queue.options().poll_interval) => {},
                    }
                    continue;
                },
            };

            #[cfg(feature = "metrics")]
            gauge!(pipeline_metrics::WORKERS_BUSY).increment(1.0);

            let task = {
                let pool = Arc::clone(&self);
                let job = job.clone();
                tokio::spawn(async move { pool.handle_job(&job).await })
            };
            match task.await {
                Ok(Ok(outcome)) => debug!(worker, job_id = %job.id, ?outcome, "job settled"),
                Ok(Err(e)) => {
                    error!(worker, job_id = %job.id, error = %e, "job could not be settled");
                },
                Err(e) => {
                    let reason = crash_reason(e);
                    error!(worker, job_id = %job.id, reason = %reason, "job crashed");
                    #[cfg(feature = "metrics")]
                    counter!(pipeline_metrics::JOBS_PANICKED_TOTAL).increment(1);
                    if let Err(e) = self.fail_attempt(&job, &reason).await {
                        error!(worker, job_id = %job.id, error = %e, "job could not be settled");
                    }
                },
            }

            #[cfg(feature = "metrics")]
            gauge!(pipeline_metrics::WORKERS_BUSY).decrement(1.0);
        }
        debug!(worker, "worker stopped");
    }

    /// Process one claimed job and settle it in the queue.
    pub async fn handle_job(&self, job: &Job) -> Result<JobOutcome> {
        let queue = &self.services.queue;

        let event: InboundEvent = match job.decode() {
            Ok(event) => event,
            Err(e) => {
                error!(job_id = %job.id, error = %e, "undecodable job payload");
                let moved = queue
                    .fail_terminal(job, &format!("undecodable payload: {e}"))
                    .await?;
                return Ok(if moved {
                    JobOutcome::DeadLettered
                } else {
                    JobOutcome::Stale
                });
            },
        };
        let sender = event.sender();
        let key = SessionKey::for_sender(&sender, None);

        let delivered = self
            .services
            .mutex
            .run_exclusive(&key, self.options.lock_ttl, || {
                self.deliver(&event, &sender)
            })
            .await;

        match delivered {
            Ok(delivery) => {
                let settled = queue.ack(job).await?;
                Ok(match (settled, delivery) {
                    (false, _) => JobOutcome::Stale,
                    (true, Delivery::Suppressed(reason)) => JobOutcome::Suppressed(reason),
                    (true, Delivery::Sent | Delivery::NoReply) => JobOutcome::Completed,
                })
            },
            Err(ExclusiveError::Unavailable { .. }) => {
                let waited = Duration::from_millis(now_ms().saturating_sub(job.enqueued_at_ms));
                if waited >= self.options.max_defer {
                    warn!(
                        job_id = %job.id,
                        session = %key,
                        waited_ms = duration_ms(waited),
                        "session lock unavailable for too long"
                    );
                    return self
                        .fail_attempt(job, &format!("session {key} unavailable"))
                        .await;
                }
                debug!(job_id = %job.id, session = %key, "session busy, deferring");
                Ok(if queue.defer(job, self.options.defer_delay).await? {
                    JobOutcome::Deferred
                } else {
                    JobOutcome::Stale
                })
            },
            Err(ExclusiveError::Inner(e)) => {
                warn!(
                    job_id = %job.id,
                    external_id = %event.external_id,
                    sender = %sender,
                    attempt = job.attempt(),
                    error = %e,
                    "job attempt failed"
                );
                self.fail_attempt(job, &e.to_string()).await
            },
        }
    }

    /// Spend an attempt: retry later or dead-letter once the budget is gone.
    async fn fail_attempt(&self, job: &Job, reason: &str) -> Result<JobOutcome> {
        Ok(match self.services.queue.nack(job, reason).await? {
            NackOutcome::Retrying { attempt, delay } => JobOutcome::Retrying { attempt, delay },
            NackOutcome::DeadLettered => {
                error!(
                    job_id = %job.id,
                    attempts = job.attempt(),
                    error = %reason,
                    "job exhausted its retries, moved to dead letter"
                );
                JobOutcome::DeadLettered
            },
            NackOutcome::Stale => JobOutcome::Stale,
        })
    }

    /// Steps that must not interleave with other work for the same sender.
    async fn deliver(
        &self,
        event: &InboundEvent,
        sender: &str,
    ) -> std::result::Result<Delivery, DeliveryError> {
        let reply = self
            .breaker
            .execute(|| self.processor.process(sender, &event.payload))
            .await
            .map_err(DeliveryError::Processor)?;

        let reply = reply.trim();
        if reply.is_empty() {
            debug!(external_id = %event.external_id, "processor produced no reply");
            return Ok(Delivery::NoReply);
        }

        let account = &self.options.account_id;
        if let RateDecision::Blocked(reason) = self.services.limiter.check(account, sender).await {
            info!(
                external_id = %event.external_id,
                destination = %sender,
                reason = %reason,
                "reply suppressed by rate limit"
            );
            #[cfg(feature = "metrics")]
            counter!(
                pipeline_metrics::REPLIES_SUPPRESSED_TOTAL,
                labels::REASON => reason.as_str()
            )
            .increment(1);
            return Ok(Delivery::Suppressed(reason));
        }

        // A send that hangs past the lock TTL would let a second worker in.
        tokio::time::timeout(
            self.options.send_timeout,
            self.sender.send(&event.sender_id, reply),
        )
        .await
        .map_err(|_| DeliveryError::SendTimeout(self.options.send_timeout))?
        .map_err(DeliveryError::Send)?;
        self.services.limiter.increment(account, sender).await;

        #[cfg(feature = "metrics")]
        counter!(pipeline_metrics::REPLIES_SENT_TOTAL).increment(1);

        debug!(external_id = %event.external_id, destination = %sender, "reply sent");
        Ok(Delivery::Sent)
    }

    async fn housekeep(&self) -> Housekeeping {
        let mut swept = Housekeeping::default();
        match self.services.gate.purge_expired().await {
            Ok(purged) => swept.markers = purged,
            Err(e) => warn!(error = %e, "idempotency marker purge failed"),
        }
        match self.services.mutex.purge_expired().await {
            Ok(purged) => swept.locks = purged,
            Err(e) => warn!(error = %e, "session lock purge failed"),
        }
        if swept != Housekeeping::default() {
            debug!(markers = swept.markers, locks = swept.locks, "housekeeping pass");
        }
        swept
    }
}

fn crash_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("job task ended abnormally: {err}");
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".into());
    format!("job panicked: {message}")
}

fn spawn_housekeeping(pool: Arc<WorkerPool>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(pool.options.housekeeping_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {},
            }
            pool.housekeep().await;
        }
    })
}

/// Running pool. Dropping the handle leaves the tasks running; call
/// [`shutdown`](Self::shutdown) to stop them.
pub struct PoolHandle {
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    maintenance: Vec<JoinHandle<()>>,
    breakers: Arc<BreakerRegistry>,
}

impl PoolHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop taking new jobs and wait for in-flight jobs to settle. Returns
    /// the final breaker states.
    pub async fn shutdown(self) -> Vec<BreakerSnapshot> {
        self.cancel.cancel();
        for handle in self.workers.into_iter().chain(self.maintenance) {
            if let Err(e) = handle.await {
                warn!(error = %e, "pool task ended abnormally");
            }
        }
        let snapshots = self.breakers.snapshots();
        for breaker in &snapshots {
            info!(
                breaker = %breaker.name,
                state = %breaker.state,
                successes = breaker.counts.successes,
                failures = breaker.counts.failures,
                timeouts = breaker.counts.timeouts,
                rejects = breaker.counts.rejects,
                "breaker state at shutdown"
            );
        }
        info!("worker pool stopped");
        snapshots
    }
}
