//! SQLite-backed lock store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{Row, SqlitePool, sqlite::SqlitePoolOptions},
};

use crate::{
    Result,
    store::{LockRecord, LockStore},
};

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
impl LockStore for SqliteStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO session_locks (key, token, acquired_at_ms, expires_at_ms)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET
                 token = excluded.token,
                 acquired_at_ms = excluded.acquired_at_ms,
                 expires_at_ms = excluded.expires_at_ms
             WHERE session_locks.expires_at_ms <= ?",
        )
        .bind(key)
        .bind(token)
        .bind(now_ms as i64)
        .bind(now_ms.saturating_add(ttl_ms) as i64)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM session_locks WHERE key = ? AND token = ?")
            .bind(key)
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn extend(&self, key: &str, token: &str, now_ms: u64, ttl_ms: u64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE session_locks SET expires_at_ms = ?
             WHERE key = ? AND token = ? AND expires_at_ms > ?",
        )
        .bind(now_ms.saturating_add(ttl_ms) as i64)
        .bind(key)
        .bind(token)
        .bind(now_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn holder(&self, key: &str, now_ms: u64) -> Result<Option<LockRecord>> {
        let row = sqlx::query(
            "SELECT key, token, acquired_at_ms, expires_at_ms FROM session_locks
             WHERE key = ? AND expires_at_ms > ?",
        )
        .bind(key)
        .bind(now_ms as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| LockRecord {
            key: row.get("key"),
            token: row.get("token"),
            acquired_at_ms: row.get::<i64, _>("acquired_at_ms") as u64,
            expires_at_ms: row.get::<i64, _>("expires_at_ms") as u64,
        }))
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM session_locks WHERE expires_at_ms <= ?")
            .bind(now_ms as i64)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
