//! SQLite-backed marker store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{
    Result,
    store::{IdempotencyMarker, IdempotencyStore},
};

/// Durable markers shared by every process using the same database.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a store with its own connection pool and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        crate::run_migrations(&pool).await?;

        Ok(Self { pool })
    }

    /// Create a store on a shared pool. Call [`crate::run_migrations`] first.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for SqliteStore {
    async fn set_if_absent(&self, key: &str, now_ms: u64, ttl_ms: u64) -> Result<bool> {
        // One statement: insert, or take over the row only if it has expired.
        let result = sqlx::query(
            "INSERT INTO idempotency_markers (key, created_at_ms, expires_at_ms)
             VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 created_at_ms = excluded.created_at_ms,
                 expires_at_ms = excluded.expires_at_ms
             WHERE idempotency_markers.expires_at_ms <= ?",
        )
        .bind(key)
        .bind(now_ms as i64)
        .bind(now_ms.saturating_add(ttl_ms) as i64)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyMarker>> {
        let row = sqlx::query(
            "SELECT key, created_at_ms, expires_at_ms FROM idempotency_markers WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| IdempotencyMarker {
            key: row.get("key"),
            created_at_ms: row.get::<i64, _>("created_at_ms") as u64,
            expires_at_ms: row.get::<i64, _>("expires_at_ms") as u64,
        }))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM idempotency_markers WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_markers WHERE expires_at_ms <= ?")
            .bind(now_ms as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
