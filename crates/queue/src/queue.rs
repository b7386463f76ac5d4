//! Queue service: enqueue, claim, acknowledge, and background maintenance.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    switchboard_common::{duration_ms, now_ms},
    switchboard_config::QueueConfig,
    tokio::{sync::Notify, task::JoinHandle},
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{counter, histogram, queue as queue_metrics};

use crate::{
    BackoffPolicy, Error, Result,
    store::{InsertOutcome, QueueStore},
    types::{EnqueueOutcome, Job, JobId, JobState, NackOutcome, QueueCounts, StallSweep},
};

/// How long finished jobs are kept around for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retention {
    pub completed_age: Duration,
    pub completed_count: u64,
    pub dead_letter_age: Duration,
    pub dead_letter_count: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub stall_timeout: Duration,
    pub max_stalled: u32,
    pub capacity: u64,
    pub poll_interval: Duration,
    pub maintenance_interval: Duration,
    pub retention: Retention,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for QueueOptions {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: BackoffPolicy::from(config),
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            max_stalled: config.max_stalled,
            capacity: config.capacity,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            maintenance_interval: Duration::from_secs(config.maintenance_interval_secs.max(1)),
            retention: Retention {
                completed_age: Duration::from_secs(config.retain_completed_secs),
                completed_count: config.retain_completed_count,
                dead_letter_age: Duration::from_secs(config.retain_dead_letter_secs),
                dead_letter_count: config.retain_dead_letter_count,
            },
        }
    }
}

/// Handle to a shared job store. Cheap to clone; clones share the wake-up
/// signal so an enqueue wakes a worker blocked in [`WorkQueue::dequeue`].
#[derive(Clone)]
pub struct WorkQueue {
    store: Arc<dyn QueueStore>,
    options: Arc<QueueOptions>,
    wake: Arc<Notify>,
}

impl WorkQueue {
    pub fn new(store: Arc<dyn QueueStore>, options: QueueOptions) -> Self {
        Self {
            store,
            options: Arc::new(options),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Add a job unless one with the same id already exists.
    ///
    /// Returns [`Error::Full`] when the queue is at capacity.
    pub async fn enqueue<T: Serialize>(&self, id: JobId, payload: &T) -> Result<EnqueueOutcome> {
        self.enqueue_at(id, payload, now_ms()).await
    }

    pub async fn enqueue_at<T: Serialize>(
        &self,
        id: JobId,
        payload: &T,
        now_ms: u64,
    ) -> Result<EnqueueOutcome> {
        let job = Job::new(
            id,
            serde_json::to_value(payload)?,
            self.options.max_attempts,
            now_ms,
        );
        match self.store.insert(&job, self.options.capacity).await? {
            InsertOutcome::Inserted => {
                debug!(job_id = %job.id, "job enqueued");
                #[cfg(feature = "metrics")]
                counter!(queue_metrics::ENQUEUED_TOTAL).increment(1);
                self.wake.notify_one();
                Ok(EnqueueOutcome::Enqueued)
            },
            InsertOutcome::Duplicate => {
                debug!(job_id = %job.id, "job already queued");
                #[cfg(feature = "metrics")]
                counter!(queue_metrics::DUPLICATES_TOTAL).increment(1);
                Ok(EnqueueOutcome::Duplicate)
            },
            InsertOutcome::Full => {
                warn!(job_id = %job.id, capacity = self.options.capacity, "queue full, rejecting job");
                #[cfg(feature = "metrics")]
                counter!(queue_metrics::REJECTED_FULL_TOTAL).increment(1);
                Err(Error::Full {
                    capacity: self.options.capacity,
                })
            },
        }
    }

    /// Claim the next due job, if any, without waiting.
    pub async fn try_dequeue(&self) -> Result<Option<Job>> {
        self.try_dequeue_at(now_ms()).await
    }

    pub async fn try_dequeue_at(&self, now_ms: u64) -> Result<Option<Job>> {
        let lease = uuid::Uuid::new_v4().to_string();
        let job = self.store.claim(now_ms, &lease).await?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, attempt = job.attempt(), "job claimed");
        }
        Ok(job)
    }

    /// Wait for a due job. Returns `Ok(None)` once `cancel` fires.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Job>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(job) = self.try_dequeue().await? {
                return Ok(Some(job));
            }
            tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                () = self.wake.notified() => {},
                () = tokio::time::sleep(self.options.poll_interval) => {},
            }
        }
    }

    /// Mark a claimed job completed. `false` if the lease was lost.
    pub async fn ack(&self, job: &Job) -> Result<bool> {
        self.ack_at(job, now_ms()).await
    }

    pub async fn ack_at(&self, job: &Job, now_ms: u64) -> Result<bool> {
        let done = self.store.complete(&job.id, job.lease(), now_ms).await?;
        if done {
            debug!(job_id = %job.id, attempt = job.attempt(), "job completed");
            #[cfg(feature = "metrics")]
            {
                counter!(queue_metrics::COMPLETED_TOTAL).increment(1);
                record_duration(job, now_ms);
            }
        } else {
            warn!(job_id = %job.id, "ack ignored, lease no longer held");
        }
        Ok(done)
    }

    /// Record a failed run: retry after backoff, or dead-letter once the
    /// attempt budget is spent.
    pub async fn nack(&self, job: &Job, reason: &str) -> Result<NackOutcome> {
        self.nack_at(job, reason, now_ms()).await
    }

    pub async fn nack_at(&self, job: &Job, reason: &str, now_ms: u64) -> Result<NackOutcome> {
        let failed = job.attempts_made + 1;
        if failed >= job.max_attempts {
            return Ok(if self.dead_letter_at(job, reason, now_ms).await? {
                NackOutcome::DeadLettered
            } else {
                NackOutcome::Stale
            });
        }

        let delay = self.options.backoff.delay(failed);
        let run_at = now_ms.saturating_add(duration_ms(delay));
        if !self.store.retry(&job.id, job.lease(), run_at, reason).await? {
            warn!(job_id = %job.id, "nack ignored, lease no longer held");
            return Ok(NackOutcome::Stale);
        }
        info!(
            job_id = %job.id,
            attempt = failed,
            max_attempts = job.max_attempts,
            delay_ms = duration_ms(delay),
            reason,
            "job failed, retrying"
        );
        #[cfg(feature = "metrics")]
        {
            counter!(queue_metrics::RETRIES_TOTAL).increment(1);
            record_duration(job, now_ms);
        }
        Ok(NackOutcome::Retrying {
            attempt: failed,
            delay,
        })
    }

    /// Dead-letter a job that can never succeed (e.g. an undecodable payload).
    pub async fn fail_terminal(&self, job: &Job, reason: &str) -> Result<bool> {
        self.dead_letter_at(job, reason, now_ms()).await
    }

    async fn dead_letter_at(&self, job: &Job, reason: &str, now_ms: u64) -> Result<bool> {
        let moved = self
            .store
            .dead_letter(&job.id, job.lease(), now_ms, reason)
            .await?;
        if moved {
            error!(
                job_id = %job.id,
                attempts = job.attempts_made + 1,
                reason,
                "job moved to dead-letter"
            );
            #[cfg(feature = "metrics")]
            {
                counter!(queue_metrics::DEAD_LETTERED_TOTAL).increment(1);
                record_duration(job, now_ms);
            }
        }
        Ok(moved)
    }

    /// Put a claimed job back without spending an attempt.
    pub async fn defer(&self, job: &Job, delay: Duration) -> Result<bool> {
        self.defer_at(job, delay, now_ms()).await
    }

    pub async fn defer_at(&self, job: &Job, delay: Duration, now_ms: u64) -> Result<bool> {
        let run_at = now_ms.saturating_add(duration_ms(delay));
        let deferred = self.store.defer(&job.id, job.lease(), run_at).await?;
        if deferred {
            debug!(job_id = %job.id, delay_ms = duration_ms(delay), "job deferred");
            #[cfg(feature = "metrics")]
            counter!(queue_metrics::DEFERRED_TOTAL).increment(1);
        }
        Ok(deferred)
    }

    /// Recover jobs whose worker stopped responding.
    pub async fn reap_stalled(&self) -> Result<StallSweep> {
        self.reap_stalled_at(now_ms()).await
    }

    pub async fn reap_stalled_at(&self, now_ms: u64) -> Result<StallSweep> {
        let cutoff = now_ms.saturating_sub(duration_ms(self.options.stall_timeout));
        let sweep = self
            .store
            .recover_stalled(cutoff, self.options.max_stalled, now_ms)
            .await?;
        if sweep.requeued > 0 {
            warn!(count = sweep.requeued, "requeued stalled jobs");
            self.wake.notify_one();
        }
        if sweep.dead_lettered > 0 {
            error!(
                count = sweep.dead_lettered,
                "dead-lettered jobs that stalled repeatedly"
            );
        }
        #[cfg(feature = "metrics")]
        {
            counter!(queue_metrics::STALLED_RECOVERED_TOTAL).increment(sweep.requeued);
            counter!(queue_metrics::DEAD_LETTERED_TOTAL).increment(sweep.dead_lettered);
        }
        Ok(sweep)
    }

    /// Apply the retention policy to completed and dead-lettered jobs.
    pub async fn purge(&self) -> Result<u64> {
        self.purge_at(now_ms()).await
    }

    pub async fn purge_at(&self, now_ms: u64) -> Result<u64> {
        let retention = &self.options.retention;
        let completed = self
            .store
            .purge(
                JobState::Completed,
                now_ms.saturating_sub(duration_ms(retention.completed_age)),
                retention.completed_count,
            )
            .await?;
        let dead = self
            .store
            .purge(
                JobState::DeadLetter,
                now_ms.saturating_sub(duration_ms(retention.dead_letter_age)),
                retention.dead_letter_count,
            )
            .await?;
        let purged = completed + dead;
        if purged > 0 {
            debug!(completed, dead_letter = dead, "purged finished jobs");
            #[cfg(feature = "metrics")]
            counter!(queue_metrics::PURGED_TOTAL).increment(purged);
        }
        Ok(purged)
    }

    /// Operator action: give a dead-lettered job a fresh attempt budget.
    pub async fn requeue_dead_letter(&self, id: &JobId) -> Result<bool> {
        let requeued = self.store.requeue_dead_letter(id, now_ms()).await?;
        if requeued {
            info!(job_id = %id, "dead-lettered job requeued");
            self.wake.notify_one();
        }
        Ok(requeued)
    }

    pub async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        self.store.get(id).await
    }

    pub async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        self.store.list(state, limit).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<Job>> {
        self.store.list(Some(JobState::DeadLetter), limit).await
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.store.counts().await
    }

    /// Run stall recovery and retention on an interval until cancelled.
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.options.maintenance_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {},
                }
                if let Err(e) = queue.reap_stalled().await {
                    warn!(error = %e, "stall recovery failed");
                }
                if let Err(e) = queue.purge().await {
                    warn!(error = %e, "queue retention purge failed");
                }
            }
            debug!("queue maintenance stopped");
        })
    }
}

#[cfg(feature = "metrics")]
fn record_duration(job: &Job, now_ms: u64) {
    if let Some(claimed) = job.claimed_at_ms {
        histogram!(queue_metrics::PROCESSING_DURATION_SECONDS)
            .record(now_ms.saturating_sub(claimed) as f64 / 1_000.0);
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::InMemoryStore,
        serde_json::json,
    };

    fn options() -> QueueOptions {
        QueueOptions {
            max_attempts: 3,
            backoff: BackoffPolicy {
                base: Duration::from_millis(1_000),
                multiplier: 2.0,
                max: Duration::from_secs(60),
                jitter: 0.0,
            },
            stall_timeout: Duration::from_secs(120),
            max_stalled: 1,
            capacity: 100,
            poll_interval: Duration::from_millis(10),
            maintenance_interval: Duration::from_secs(1),
            retention: Retention {
                completed_age: Duration::from_secs(3_600),
                completed_count: 1_000,
                dead_letter_age: Duration::from_secs(86_400),
                dead_letter_count: 1_000,
            },
        }
    }

    fn queue_with(options: QueueOptions) -> WorkQueue {
        WorkQueue::new(Arc::new(InMemoryStore::new()), options)
    }

    fn queue() -> WorkQueue {
        queue_with(options())
    }

    #[tokio::test]
    async fn redelivery_while_pending_is_duplicate() {
        let queue = queue();
        let id = JobId::from_external_id("msg-1");
        assert_eq!(
            queue.enqueue_at(id.clone(), &json!({"n": 1}), 0).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue_at(id.clone(), &json!({"n": 2}), 5).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert_eq!(queue.counts().await.unwrap().pending, 1);
        // The first payload wins.
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.payload["n"], 1);
    }

    #[tokio::test]
    async fn completed_job_is_never_redelivered() {
        let queue = queue();
        let id = JobId::from_external_id("msg-1");
        queue.enqueue_at(id.clone(), &json!({}), 0).await.unwrap();
        let job = queue.try_dequeue_at(0).await.unwrap().unwrap();
        assert!(queue.ack_at(&job, 10).await.unwrap());

        assert_eq!(
            queue.enqueue_at(id, &json!({}), 20).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        assert!(queue.try_dequeue_at(1_000_000).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn retries_then_dead_letters_exactly_once() {
        let queue = queue();
        let id = JobId::from_external_id("flaky");
        queue.enqueue_at(id.clone(), &json!({}), 0).await.unwrap();

        let mut now = 0;
        let mut runs = 0;
        let mut outcomes = Vec::new();
        while let Some(job) = queue.try_dequeue_at(now).await.unwrap() {
            runs += 1;
            let outcome = queue.nack_at(&job, "downstream timeout", now).await.unwrap();
            outcomes.push(outcome);
            now += 1_000_000;
        }

        assert_eq!(runs, 3);
        assert_eq!(outcomes, vec![
            NackOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_millis(1_000)
            },
            NackOutcome::Retrying {
                attempt: 2,
                delay: Duration::from_millis(2_000)
            },
            NackOutcome::DeadLettered,
        ]);

        let dead = queue.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].attempts_made, 3);
        assert_eq!(dead[0].last_error.as_deref(), Some("downstream timeout"));
    }

    #[tokio::test]
    async fn retry_waits_for_backoff() {
        let queue = queue();
        queue
            .enqueue_at(JobId::from_external_id("a"), &json!({}), 0)
            .await
            .unwrap();
        let job = queue.try_dequeue_at(0).await.unwrap().unwrap();
        queue.nack_at(&job, "err", 100).await.unwrap();

        assert!(queue.try_dequeue_at(1_099).await.unwrap().is_none());
        let again = queue.try_dequeue_at(1_100).await.unwrap().unwrap();
        assert_eq!(again.attempt(), 2);
        assert_ne!(again.lease, job.lease);
    }

    #[tokio::test]
    async fn defer_does_not_spend_an_attempt() {
        let queue = queue();
        queue
            .enqueue_at(JobId::from_external_id("a"), &json!({}), 0)
            .await
            .unwrap();
        for round in 0..5 {
            let now = round * 10_000;
            let job = queue.try_dequeue_at(now).await.unwrap().unwrap();
            assert_eq!(job.attempts_made, 0);
            assert!(
                queue
                    .defer_at(&job, Duration::from_millis(500), now)
                    .await
                    .unwrap()
            );
        }
    }

    #[tokio::test]
    async fn stalled_job_recovered_once_and_stale_ack_ignored() {
        let queue = queue();
        let id = JobId::from_external_id("crashy");
        queue.enqueue_at(id.clone(), &json!({}), 0).await.unwrap();
        let lost = queue.try_dequeue_at(0).await.unwrap().unwrap();

        let sweep = queue.reap_stalled_at(120_000).await.unwrap();
        assert_eq!(sweep.requeued, 1);

        let second = queue.try_dequeue_at(120_000).await.unwrap().unwrap();
        assert_eq!(second.stalled_count, 1);

        // The first worker wakes up and tries to finish: it no longer owns the job.
        assert!(!queue.ack_at(&lost, 121_000).await.unwrap());
        assert_eq!(
            queue.nack_at(&lost, "late", 121_000).await.unwrap(),
            NackOutcome::Stale
        );

        let sweep = queue.reap_stalled_at(240_000).await.unwrap();
        assert_eq!(sweep.dead_lettered, 1);
        let job = queue.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let queue = queue_with(QueueOptions {
            capacity: 1,
            ..options()
        });
        queue
            .enqueue_at(JobId::from_external_id("a"), &json!({}), 0)
            .await
            .unwrap();
        let err = queue
            .enqueue_at(JobId::from_external_id("b"), &json!({}), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Full { capacity: 1 }));
    }

    #[tokio::test]
    async fn purge_applies_age_and_count() {
        let queue = queue_with(QueueOptions {
            retention: Retention {
                completed_age: Duration::from_secs(10),
                completed_count: 1,
                dead_letter_age: Duration::from_secs(10),
                dead_letter_count: 10,
            },
            ..options()
        });
        for (i, name) in ["a", "b", "c"].into_iter().enumerate() {
            let now = i as u64 * 1_000;
            queue
                .enqueue_at(JobId::from_external_id(name), &json!({}), now)
                .await
                .unwrap();
            let job = queue.try_dequeue_at(now).await.unwrap().unwrap();
            queue.ack_at(&job, now).await.unwrap();
        }
        // "a" finished at 0 and is older than 10s at t=10s; of b and c only
        // the newest is kept.
        assert_eq!(queue.purge_at(10_000).await.unwrap(), 2);
        let left = queue.list(Some(JobState::Completed), 10).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, JobId::from_external_id("c"));
    }

    #[tokio::test]
    async fn requeue_dead_letter_resets_budget() {
        let queue = queue_with(QueueOptions {
            max_attempts: 1,
            ..options()
        });
        let id = JobId::from_external_id("a");
        queue.enqueue_at(id.clone(), &json!({}), 0).await.unwrap();
        let job = queue.try_dequeue_at(0).await.unwrap().unwrap();
        assert_eq!(
            queue.nack_at(&job, "boom", 0).await.unwrap(),
            NackOutcome::DeadLettered
        );
        assert!(queue.requeue_dead_letter(&id).await.unwrap());
        let job = queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(job.attempts_made, 0);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_enqueue_and_stops_on_cancel() {
        let queue = queue_with(QueueOptions {
            poll_interval: Duration::from_secs(3_600),
            ..options()
        });
        let cancel = CancellationToken::new();

        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&cancel).await })
        };
        tokio::task::yield_now().await;
        queue
            .enqueue(JobId::from_external_id("wake"), &json!({}))
            .await
            .unwrap();
        let job = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(job.is_some());

        cancel.cancel();
        assert!(queue.dequeue(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_cancel() {
        let queue = queue();
        let cancel = CancellationToken::new();
        let handle = queue.spawn_maintenance(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
