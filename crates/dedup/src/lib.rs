//! Idempotent admission of inbound events.
//!
//! The gate remembers each event key for a TTL window using a single atomic
//! set-if-absent against a shared store. When the store is unreachable the
//! gate admits: processing a duplicate is cheaper than dropping a message the
//! channel will never redeliver.

pub mod error;
pub mod gate;
pub mod key;
pub mod store;
pub mod store_memory;
pub mod store_sqlite;

pub use {
    error::{Error, Result},
    gate::IdempotencyGate,
    key::IdempotencyKey,
    store::{IdempotencyMarker, IdempotencyStore},
    store_memory::InMemoryStore,
    store_sqlite::SqliteStore,
};

/// Run database migrations for the idempotency tables.
pub async fn run_migrations(pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .set_ignore_missing(true)
        .run(pool)
        .await?;
    Ok(())
}
