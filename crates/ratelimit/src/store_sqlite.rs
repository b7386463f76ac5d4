//! SQLite-backed rate store using sqlx.

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{RateWindow, Result, day_start, hour_start, store::RateStore};

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

fn window_from_row(row: &SqliteRow) -> RateWindow {
    RateWindow {
        account_id: row.get("account_id"),
        destination_id: row.get("destination_id"),
        hour_start_ms: row.get::<i64, _>("hour_start_ms") as u64,
        hour_count: row.get::<i64, _>("hour_count") as u32,
        day_start_ms: row.get::<i64, _>("day_start_ms") as u64,
        day_count: row.get::<i64, _>("day_count") as u32,
        blocked_until_ms: row
            .get::<Option<i64>, _>("blocked_until_ms")
            .map(|v| v as u64),
    }
}

#[async_trait]
impl RateStore for SqliteStore {
    async fn increment(
        &self,
        account_id: &str,
        destination_id: &str,
        now_ms: u64,
    ) -> Result<RateWindow> {
        // SET expressions read the pre-update row, so both CASEs see the old
        // bucket starts.
        let row = sqlx::query(
            "INSERT INTO rate_windows
                 (account_id, destination_id, hour_start_ms, hour_count, day_start_ms, day_count)
             VALUES (?, ?, ?, 1, ?, 1)
             ON CONFLICT(account_id, destination_id) DO UPDATE SET
                 hour_count = CASE WHEN excluded.hour_start_ms > rate_windows.hour_start_ms
                                   THEN 1 ELSE rate_windows.hour_count + 1 END,
                 hour_start_ms = MAX(rate_windows.hour_start_ms, excluded.hour_start_ms),
                 day_count = CASE WHEN excluded.day_start_ms > rate_windows.day_start_ms
                                  THEN 1 ELSE rate_windows.day_count + 1 END,
                 day_start_ms = MAX(rate_windows.day_start_ms, excluded.day_start_ms)
             RETURNING account_id, destination_id, hour_start_ms, hour_count,
                       day_start_ms, day_count, blocked_until_ms",
        )
        .bind(account_id)
        .bind(destination_id)
        .bind(hour_start(now_ms) as i64)
        .bind(day_start(now_ms) as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(window_from_row(&row))
    }

    async fn window(&self, account_id: &str, destination_id: &str) -> Result<Option<RateWindow>> {
        let row = sqlx::query(
            "SELECT account_id, destination_id, hour_start_ms, hour_count,
                    day_start_ms, day_count, blocked_until_ms
             FROM rate_windows WHERE account_id = ? AND destination_id = ?",
        )
        .bind(account_id)
        .bind(destination_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(window_from_row))
    }

    async fn reset(&self, account_id: &str, destination_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM rate_windows WHERE account_id = ? AND destination_id = ?")
                .bind(account_id)
                .bind(destination_id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn block_until(
        &self,
        account_id: &str,
        destination_id: &str,
        until_ms: u64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO rate_windows (account_id, destination_id, blocked_until_ms)
             VALUES (?, ?, ?)
             ON CONFLICT(account_id, destination_id) DO UPDATE SET
                 blocked_until_ms = excluded.blocked_until_ms",
        )
        .bind(account_id)
        .bind(destination_id)
        .bind(until_ms as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
