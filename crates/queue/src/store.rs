//! Persistence trait for queue jobs.

use async_trait::async_trait;

use crate::{
    Result,
    types::{Job, JobId, JobState, QueueCounts, StallSweep},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
    Full,
}

/// Shared backend for queue jobs.
///
/// Each method is one atomic operation against the backing store. Methods
/// that take a `lease` only act on a job that is still `active` under that
/// lease and return `false` otherwise.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a pending job unless the id exists or `capacity` pending plus
    /// active jobs are already queued.
    async fn insert(&self, job: &Job, capacity: u64) -> Result<InsertOutcome>;

    /// Claim the earliest due pending job under `lease`.
    async fn claim(&self, now_ms: u64, lease: &str) -> Result<Option<Job>>;

    async fn complete(&self, id: &JobId, lease: &str, now_ms: u64) -> Result<bool>;

    /// Back to pending at `run_at_ms`, counting one failed attempt.
    async fn retry(&self, id: &JobId, lease: &str, run_at_ms: u64, error: &str) -> Result<bool>;

    /// Back to pending at `run_at_ms` without counting an attempt.
    async fn defer(&self, id: &JobId, lease: &str, run_at_ms: u64) -> Result<bool>;

    /// Move to dead-letter, counting one failed attempt.
    async fn dead_letter(&self, id: &JobId, lease: &str, now_ms: u64, error: &str)
    -> Result<bool>;

    /// Recover active jobs claimed at or before `claimed_before_ms`.
    ///
    /// Jobs already recovered `max_stalled` times are dead-lettered, the rest
    /// return to pending.
    async fn recover_stalled(
        &self,
        claimed_before_ms: u64,
        max_stalled: u32,
        now_ms: u64,
    ) -> Result<StallSweep>;

    /// Delete finished jobs in `state` that finished at or before
    /// `finished_before_ms`, then all but the newest `keep` of the rest.
    async fn purge(&self, state: JobState, finished_before_ms: u64, keep: u64) -> Result<u64>;

    /// Return a dead-lettered job to pending with a fresh attempt budget.
    async fn requeue_dead_letter(&self, id: &JobId, now_ms: u64) -> Result<bool>;

    async fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Most recent jobs first, optionally filtered by state.
    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>>;

    async fn counts(&self) -> Result<QueueCounts>;
}
