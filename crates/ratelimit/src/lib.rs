//! Outbound send throttling per (account, destination).
//!
//! Two fixed buckets are kept per pair: the current clock hour and the
//! current UTC day. A send is allowed while both counts are under their
//! limits and no explicit block is active. Checking and counting are
//! separate calls so that only sends that actually happened are counted.

pub mod error;
pub mod limiter;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;
pub mod window;

pub use {
    error::{Error, Result},
    limiter::{BlockReason, RateDecision, RateLimiter, RateLimits},
    store::RateStore,
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
    window::{DAY_MS, HOUR_MS, RateWindow, day_start, hour_start},
};

/// Run database migrations for the rate window table.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
