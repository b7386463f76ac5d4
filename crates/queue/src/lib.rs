//! Durable work queue for admitted inbound events.
//!
//! Jobs move `pending → active → completed | dead_letter`. A failed attempt
//! goes back to `pending` with an exponential, jittered delay until the
//! attempt budget is spent. Every transition out of `active` is fenced by the
//! lease handed out with the claim, so a worker that lost its job to stall
//! recovery cannot complete or fail it afterwards.

pub mod backoff;
pub mod error;
pub mod queue;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod types;

pub use {
    backoff::BackoffPolicy,
    error::{Error, Result},
    queue::{QueueOptions, Retention, WorkQueue},
    store::{InsertOutcome, QueueStore},
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
    types::{EnqueueOutcome, Job, JobId, JobState, NackOutcome, QueueCounts, StallSweep},
};

/// Run database migrations for the queue tables.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
