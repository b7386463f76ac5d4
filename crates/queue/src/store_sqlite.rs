//! SQLite-backed queue store using sqlx.
//!
//! Every state change is a single `UPDATE … WHERE … [RETURNING]` so that
//! concurrent workers in separate processes never both win the same job.

use {
    async_trait::async_trait,
    sqlx::{
        Row, SqlitePool,
        sqlite::{SqlitePoolOptions, SqliteRow},
    },
};

use crate::{
    Result,
    store::{InsertOutcome, QueueStore},
    types::{Job, JobId, JobState, QueueCounts, StallSweep},
};

const JOB_COLUMNS: &str = "id, payload, state, attempts_made, max_attempts, stalled_count, \
                           enqueued_at_ms, run_at_ms, claimed_at_ms, finished_at_ms, lease, \
                           last_error";

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

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let payload: String = row.get("payload");
    let state: String = row.get("state");
    Ok(Job {
        id: JobId::from(row.get::<String, _>("id")),
        payload: serde_json::from_str(&payload)?,
        state: state.parse()?,
        attempts_made: row.get::<i64, _>("attempts_made") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        stalled_count: row.get::<i64, _>("stalled_count") as u32,
        enqueued_at_ms: row.get::<i64, _>("enqueued_at_ms") as u64,
        run_at_ms: row.get::<i64, _>("run_at_ms") as u64,
        claimed_at_ms: row.get::<Option<i64>, _>("claimed_at_ms").map(|v| v as u64),
        finished_at_ms: row.get::<Option<i64>, _>("finished_at_ms").map(|v| v as u64),
        lease: row.get("lease"),
        last_error: row.get("last_error"),
    })
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn insert(&self, job: &Job, capacity: u64) -> Result<InsertOutcome> {
        let payload = serde_json::to_string(&job.payload)?;
        // The WHERE clause also keeps SQLite from parsing ON CONFLICT as a join.
        let result = sqlx::query(
            "INSERT INTO queue_jobs (id, payload, state, max_attempts, enqueued_at_ms, run_at_ms)
             SELECT ?, ?, 'pending', ?, ?, ?
             WHERE (SELECT COUNT(*) FROM queue_jobs WHERE state IN ('pending', 'active')) < ?
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(job.id.as_str())
        .bind(&payload)
        .bind(i64::from(job.max_attempts))
        .bind(job.enqueued_at_ms as i64)
        .bind(job.run_at_ms as i64)
        .bind(capacity.min(i64::MAX as u64) as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(InsertOutcome::Inserted);
        }
        let exists = sqlx::query("SELECT 1 FROM queue_jobs WHERE id = ?")
            .bind(job.id.as_str())
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Ok(if exists {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Full
        })
    }

    async fn claim(&self, now_ms: u64, lease: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            "UPDATE queue_jobs
             SET state = 'active', claimed_at_ms = ?, lease = ?
             WHERE id = (
                 SELECT id FROM queue_jobs
                 WHERE state = 'pending' AND run_at_ms <= ?
                 ORDER BY run_at_ms, enqueued_at_ms
                 LIMIT 1
             ) AND state = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(now_ms as i64)
        .bind(lease)
        .bind(now_ms as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, id: &JobId, lease: &str, now_ms: u64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'completed', finished_at_ms = ?, lease = NULL
             WHERE id = ? AND state = 'active' AND lease = ?",
        )
        .bind(now_ms as i64)
        .bind(id.as_str())
        .bind(lease)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn retry(&self, id: &JobId, lease: &str, run_at_ms: u64, error: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'pending', attempts_made = attempts_made + 1, run_at_ms = ?,
                 claimed_at_ms = NULL, lease = NULL, last_error = ?
             WHERE id = ? AND state = 'active' AND lease = ?",
        )
        .bind(run_at_ms as i64)
        .bind(error)
        .bind(id.as_str())
        .bind(lease)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn defer(&self, id: &JobId, lease: &str, run_at_ms: u64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'pending', run_at_ms = ?, claimed_at_ms = NULL, lease = NULL
             WHERE id = ? AND state = 'active' AND lease = ?",
        )
        .bind(run_at_ms as i64)
        .bind(id.as_str())
        .bind(lease)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn dead_letter(
        &self,
        id: &JobId,
        lease: &str,
        now_ms: u64,
        error: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'dead_letter', attempts_made = attempts_made + 1,
                 finished_at_ms = ?, lease = NULL, last_error = ?
             WHERE id = ? AND state = 'active' AND lease = ?",
        )
        .bind(now_ms as i64)
        .bind(error)
        .bind(id.as_str())
        .bind(lease)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recover_stalled(
        &self,
        claimed_before_ms: u64,
        max_stalled: u32,
        now_ms: u64,
    ) -> Result<StallSweep> {
        // Dead-letter repeat offenders first so the requeue below only sees
        // jobs that still have stall budget left.
        let dead = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'dead_letter', finished_at_ms = ?, lease = NULL, last_error = 'stalled'
             WHERE state = 'active' AND claimed_at_ms <= ? AND stalled_count >= ?",
        )
        .bind(now_ms as i64)
        .bind(claimed_before_ms as i64)
        .bind(i64::from(max_stalled))
        .execute(&self.pool)
        .await?;

        let requeued = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'pending', stalled_count = stalled_count + 1, run_at_ms = ?,
                 claimed_at_ms = NULL, lease = NULL
             WHERE state = 'active' AND claimed_at_ms <= ?",
        )
        .bind(now_ms as i64)
        .bind(claimed_before_ms as i64)
        .execute(&self.pool)
        .await?;

        Ok(StallSweep {
            requeued: requeued.rows_affected(),
            dead_lettered: dead.rows_affected(),
        })
    }

    async fn purge(&self, state: JobState, finished_before_ms: u64, keep: u64) -> Result<u64> {
        let aged = sqlx::query("DELETE FROM queue_jobs WHERE state = ? AND finished_at_ms <= ?")
            .bind(state.as_str())
            .bind(finished_before_ms as i64)
            .execute(&self.pool)
            .await?;

        let overflow = sqlx::query(
            "DELETE FROM queue_jobs
             WHERE state = ? AND id NOT IN (
                 SELECT id FROM queue_jobs
                 WHERE state = ?
                 ORDER BY COALESCE(finished_at_ms, enqueued_at_ms) DESC
                 LIMIT ?
             )",
        )
        .bind(state.as_str())
        .bind(state.as_str())
        .bind(keep.min(i64::MAX as u64) as i64)
        .execute(&self.pool)
        .await?;

        Ok(aged.rows_affected() + overflow.rows_affected())
    }

    async fn requeue_dead_letter(&self, id: &JobId, now_ms: u64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE queue_jobs
             SET state = 'pending', attempts_made = 0, stalled_count = 0, run_at_ms = ?,
                 claimed_at_ms = NULL, finished_at_ms = NULL, lease = NULL, last_error = NULL
             WHERE id = ? AND state = 'dead_letter'",
        )
        .bind(now_ms as i64)
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, id: &JobId) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM queue_jobs WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM queue_jobs
             WHERE ?1 IS NULL OR state = ?1
             ORDER BY COALESCE(finished_at_ms, enqueued_at_ms) DESC
             LIMIT ?2"
        ))
        .bind(state.map(JobState::as_str))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM queue_jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let state: String = row.get("state");
            counts.add(state.parse()?, row.get::<i64, _>("n") as u64);
        }
        Ok(counts)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    async fn make_store() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.unwrap()
    }

    fn job(external_id: &str, now_ms: u64) -> Job {
        Job::new(
            JobId::from_external_id(external_id),
            json!({ "external_id": external_id }),
            3,
            now_ms,
        )
    }

    #[tokio::test]
    async fn test_sqlite_insert_duplicate_and_full() {
        let store = make_store().await;
        assert_eq!(
            store.insert(&job("a", 0), 2).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert(&job("a", 5), 2).await.unwrap(),
            InsertOutcome::Duplicate
        );
        assert_eq!(
            store.insert(&job("b", 0), 2).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert(&job("c", 0), 2).await.unwrap(),
            InsertOutcome::Full
        );
    }

    #[tokio::test]
    async fn test_sqlite_claim_respects_run_at_and_order() {
        let store = make_store().await;
        store.insert(&job("first", 10), 10).await.unwrap();
        store.insert(&job("second", 20), 10).await.unwrap();

        assert!(store.claim(5, "early").await.unwrap().is_none());

        let claimed = store.claim(100, "l1").await.unwrap().unwrap();
        assert_eq!(claimed.id, JobId::from_external_id("first"));
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.lease.as_deref(), Some("l1"));
        assert_eq!(claimed.payload["external_id"], "first");

        let next = store.claim(100, "l2").await.unwrap().unwrap();
        assert_eq!(next.id, JobId::from_external_id("second"));
        assert!(store.claim(100, "l3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_lease_fencing() {
        let store = make_store().await;
        store.insert(&job("a", 0), 10).await.unwrap();
        let claimed = store.claim(0, "mine").await.unwrap().unwrap();

        assert!(!store.complete(&claimed.id, "theirs", 1).await.unwrap());
        assert!(store.retry(&claimed.id, "mine", 50, "boom").await.unwrap());
        assert!(!store.complete(&claimed.id, "mine", 60).await.unwrap());

        let pending = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(pending.state, JobState::Pending);
        assert_eq!(pending.attempts_made, 1);
        assert_eq!(pending.run_at_ms, 50);
        assert_eq!(pending.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_sqlite_stall_recovery_once_then_dead_letter() {
        let store = make_store().await;
        store.insert(&job("a", 0), 10).await.unwrap();
        store.claim(0, "w1").await.unwrap().unwrap();

        let sweep = store.recover_stalled(100, 1, 200).await.unwrap();
        assert_eq!(sweep, StallSweep {
            requeued: 1,
            dead_lettered: 0
        });

        store.claim(200, "w2").await.unwrap().unwrap();
        let sweep = store.recover_stalled(300, 1, 400).await.unwrap();
        assert_eq!(sweep, StallSweep {
            requeued: 0,
            dead_lettered: 1
        });

        let job = store.get(&JobId::from_external_id("a")).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::DeadLetter);
        assert_eq!(job.last_error.as_deref(), Some("stalled"));
    }

    #[tokio::test]
    async fn test_sqlite_purge_and_counts() {
        let store = make_store().await;
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store.insert(&job(id, i as u64), 10).await.unwrap();
            let claimed = store.claim(i as u64, id).await.unwrap().unwrap();
            store
                .complete(&claimed.id, id, 1_000 + i as u64)
                .await
                .unwrap();
        }
        store.insert(&job("d", 0), 10).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.completed, 3);
        assert_eq!(counts.pending, 1);

        // Nothing is old enough; keep only the newest two.
        assert_eq!(store.purge(JobState::Completed, 0, 2).await.unwrap(), 1);
        assert!(
            store
                .get(&JobId::from_external_id("a"))
                .await
                .unwrap()
                .is_none()
        );

        let listed = store.list(Some(JobState::Completed), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, JobId::from_external_id("c"));
    }

    #[tokio::test]
    async fn test_sqlite_requeue_dead_letter() {
        let store = make_store().await;
        store.insert(&job("a", 0), 10).await.unwrap();
        let claimed = store.claim(0, "w").await.unwrap().unwrap();
        assert!(store.dead_letter(&claimed.id, "w", 5, "bad payload").await.unwrap());

        assert!(store.requeue_dead_letter(&claimed.id, 10).await.unwrap());
        assert!(!store.requeue_dead_letter(&claimed.id, 10).await.unwrap());
        let job = store.get(&claimed.id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts_made, 0);
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_claims_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("queue.db").display());
        let store = std::sync::Arc::new(SqliteStore::new(&url).await.unwrap());
        store.insert(&job("only", 0), 10).await.unwrap();

        let claims: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                tokio::spawn(async move { store.claim(1, &format!("w{i}")).await })
            })
            .collect();
        let mut winners = 0;
        for claim in claims {
            if claim.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
