//! Lease-based mutual exclusion per end-user session.
//!
//! A lock is a row keyed by the session with a random holder token and an
//! absolute expiry. Acquisition succeeds only when no live row exists;
//! release and extension present the token they were granted, so a caller
//! never touches a lock that has since passed to someone else.
//!
//! Leases have no fencing token. If protected work outlives the TTL a second
//! worker can acquire the same session while the first is still running, so
//! the TTL must exceed the slowest protected work with margin.

pub mod error;
pub mod key;
pub mod mutex;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    error::{Error, ExclusiveError, Result},
    key::SessionKey,
    mutex::{LockOptions, LockToken, SessionMutex},
    store::{LockRecord, LockStore},
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
};

/// Run database migrations for the lock table.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
