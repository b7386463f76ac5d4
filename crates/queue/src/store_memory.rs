//! In-memory queue store for tests and single-process deployments.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    Result,
    store::{InsertOutcome, QueueStore},
    types::{Job, JobId, JobState, QueueCounts, StallSweep},
};

/// Jobs behind one mutex; every operation holds it for its full duration.
#[derive(Default)]
pub struct InMemoryStore {
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut HashMap<JobId, Job>) -> T) -> T {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut jobs)
    }

    fn with_leased(&self, id: &JobId, lease: &str, f: impl FnOnce(&mut Job)) -> bool {
        self.with_jobs(|jobs| match jobs.get_mut(id) {
            Some(job) if job.state == JobState::Active && job.lease.as_deref() == Some(lease) => {
                f(job);
                true
            },
            _ => false,
        })
    }
}

fn release_to_pending(job: &mut Job, run_at_ms: u64) {
    job.state = JobState::Pending;
    job.run_at_ms = run_at_ms;
    job.claimed_at_ms = None;
    job.lease = None;
}

fn finish(job: &mut Job, state: JobState, now_ms: u64) {
    job.state = state;
    job.finished_at_ms = Some(now_ms);
    job.lease = None;
}

fn recency(job: &Job) -> u64 {
    job.finished_at_ms.unwrap_or(job.enqueued_at_ms)
}

#[async_trait]
impl QueueStore for InMemoryStore {
    async fn insert(&self, job: &Job, capacity: u64) -> Result<InsertOutcome> {
        Ok(self.with_jobs(|jobs| {
            if jobs.contains_key(&job.id) {
                return InsertOutcome::Duplicate;
            }
            let in_flight = jobs
                .values()
                .filter(|j| matches!(j.state, JobState::Pending | JobState::Active))
                .count() as u64;
            if in_flight >= capacity {
                return InsertOutcome::Full;
            }
            jobs.insert(job.id.clone(), job.clone());
            InsertOutcome::Inserted
        }))
    }

    async fn claim(&self, now_ms: u64, lease: &str) -> Result<Option<Job>> {
        Ok(self.with_jobs(|jobs| {
            let job = jobs
                .values_mut()
                .filter(|j| j.state == JobState::Pending && j.run_at_ms <= now_ms)
                .min_by_key(|j| (j.run_at_ms, j.enqueued_at_ms))?;
            job.state = JobState::Active;
            job.claimed_at_ms = Some(now_ms);
            job.lease = Some(lease.to_string());
            Some(job.clone())
        }))
    }

    async fn complete(&self, id: &JobId, lease: &str, now_ms: u64) -> Result<bool> {
        Ok(self.with_leased(id, lease, |job| {
            finish(job, JobState::Completed, now_ms);
        }))
    }

    async fn retry(&self, id: &JobId, lease: &str, run_at_ms: u64, error: &str) -> Result<bool> {
        Ok(self.with_leased(id, lease, |job| {
            job.attempts_made += 1;
            job.last_error = Some(error.to_string());
            release_to_pending(job, run_at_ms);
        }))
    }

    async fn defer(&self, id: &JobId, lease: &str, run_at_ms: u64) -> Result<bool> {
        Ok(self.with_leased(id, lease, |job| release_to_pending(job, run_at_ms)))
    }

    async fn dead_letter(
        &self,
        id: &JobId,
        lease: &str,
        now_ms: u64,
        error: &str,
    ) -> Result<bool> {
        Ok(self.with_leased(id, lease, |job| {
            job.attempts_made += 1;
            job.last_error = Some(error.to_string());
            finish(job, JobState::DeadLetter, now_ms);
        }))
    }

    async fn recover_stalled(
        &self,
        claimed_before_ms: u64,
        max_stalled: u32,
        now_ms: u64,
    ) -> Result<StallSweep> {
        Ok(self.with_jobs(|jobs| {
            let mut sweep = StallSweep::default();
            for job in jobs.values_mut() {
                let stalled = job.state == JobState::Active
                    && job.claimed_at_ms.is_some_and(|at| at <= claimed_before_ms);
                if !stalled {
                    continue;
                }
                if job.stalled_count >= max_stalled {
                    job.last_error = Some("stalled".into());
                    finish(job, JobState::DeadLetter, now_ms);
                    sweep.dead_lettered += 1;
                } else {
                    job.stalled_count += 1;
                    release_to_pending(job, now_ms);
                    sweep.requeued += 1;
                }
            }
            sweep
        }))
    }

    async fn purge(&self, state: JobState, finished_before_ms: u64, keep: u64) -> Result<u64> {
        Ok(self.with_jobs(|jobs| {
            let before = jobs.len();
            jobs.retain(|_, j| {
                !(j.state == state && j.finished_at_ms.is_some_and(|at| at <= finished_before_ms))
            });

            let mut remaining: Vec<(u64, JobId)> = jobs
                .values()
                .filter(|j| j.state == state)
                .map(|j| (recency(j), j.id.clone()))
                .collect();
            remaining.sort_by(|a, b| b.cmp(a));
            for (_, id) in remaining.into_iter().skip(keep as usize) {
                jobs.remove(&id);
            }
            before.saturating_sub(jobs.len()) as u64
        }))
    }

    async fn requeue_dead_letter(&self, id: &JobId, now_ms: u64) -> Result<bool> {
        Ok(self.with_jobs(|jobs| match jobs.get_mut(id) {
            Some(job) if job.state == JobState::DeadLetter => {
                job.attempts_made = 0;
                job.stalled_count = 0;
                job.finished_at_ms = None;
                job.last_error = None;
                release_to_pending(job, now_ms);
                true
            },
            _ => false,
        }))
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.with_jobs(|jobs| jobs.get(id).cloned()))
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        Ok(self.with_jobs(|jobs| {
            let mut selected: Vec<Job> = jobs
                .values()
                .filter(|j| state.is_none_or(|s| j.state == s))
                .cloned()
                .collect();
            selected.sort_by_key(|j| std::cmp::Reverse(recency(j)));
            selected.truncate(limit);
            selected
        }))
    }

    async fn counts(&self) -> Result<QueueCounts> {
        Ok(self.with_jobs(|jobs| {
            let mut counts = QueueCounts::default();
            for job in jobs.values() {
                counts.add(job.state, 1);
            }
            counts
        }))
    }
}
