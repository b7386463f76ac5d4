//! Construction of the shared components from configuration.

use std::sync::Arc;

use {
    sqlx::{SqlitePool, sqlite::SqlitePoolOptions},
    switchboard_breaker::{BreakerOptions, BreakerRegistry},
    switchboard_config::SwitchboardConfig,
    switchboard_dedup::IdempotencyGate,
    switchboard_locks::{LockOptions, SessionMutex},
    switchboard_queue::{QueueOptions, WorkQueue},
    switchboard_ratelimit::{RateLimiter, RateLimits},
    tracing::info,
};

use crate::{Ingress, Result};

/// Apply every component's migrations to one pool.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    switchboard_dedup::run_migrations(pool).await?;
    switchboard_queue::run_migrations(pool).await?;
    switchboard_locks::run_migrations(pool).await?;
    switchboard_ratelimit::run_migrations(pool).await?;
    Ok(())
}

/// The idempotency gate, queue, session mutex, breakers and rate limiter,
/// all backed by the same store.
#[derive(Clone)]
pub struct Services {
    pub gate: IdempotencyGate,
    pub queue: WorkQueue,
    pub mutex: SessionMutex,
    pub breakers: Arc<BreakerRegistry>,
    pub limiter: RateLimiter,
    pool: Option<SqlitePool>,
}

impl Services {
    /// Open the configured SQLite database, migrate it and build every
    /// component on the shared pool.
    pub async fn open_sqlite(config: &SwitchboardConfig) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.store.max_connections.max(1))
            .connect(&config.store.database_url)
            .await?;
        run_migrations(&pool).await?;
        info!(url = %config.store.database_url, "shared store ready");

        Ok(Self::build(
            config,
            Arc::new(switchboard_dedup::SqliteStore::with_pool(pool.clone())),
            Arc::new(switchboard_queue::SqliteStore::with_pool(pool.clone())),
            Arc::new(switchboard_locks::SqliteStore::with_pool(pool.clone())),
            Arc::new(switchboard_ratelimit::SqliteStore::with_pool(pool.clone())),
            Some(pool),
        ))
    }

    /// Process-local stores. Nothing is shared with other processes.
    pub fn in_memory(config: &SwitchboardConfig) -> Self {
        Self::build(
            config,
            Arc::new(switchboard_dedup::InMemoryStore::new()),
            Arc::new(switchboard_queue::InMemoryStore::new()),
            Arc::new(switchboard_locks::InMemoryStore::new()),
            Arc::new(switchboard_ratelimit::InMemoryStore::new()),
            None,
        )
    }

    fn build(
        config: &SwitchboardConfig,
        markers: Arc<dyn switchboard_dedup::IdempotencyStore>,
        jobs: Arc<dyn switchboard_queue::QueueStore>,
        locks: Arc<dyn switchboard_locks::LockStore>,
        windows: Arc<dyn switchboard_ratelimit::RateStore>,
        pool: Option<SqlitePool>,
    ) -> Self {
        Self {
            gate: IdempotencyGate::new(markers, config.idempotency.ttl()),
            queue: WorkQueue::new(jobs, QueueOptions::from(&config.queue)),
            mutex: SessionMutex::new(locks, LockOptions::from(&config.locks)),
            breakers: Arc::new(BreakerRegistry::new(BreakerOptions::from(&config.breaker))),
            limiter: RateLimiter::new(windows, RateLimits::from(&config.rate_limit)),
            pool,
        }
    }

    pub fn ingress(&self) -> Ingress {
        Ingress::new(self.gate.clone(), self.queue.clone())
    }

    /// The shared pool, when backed by SQLite.
    pub fn pool(&self) -> Option<&SqlitePool> {
        self.pool.as_ref()
    }

    pub async fn close(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, switchboard_common::InboundEvent};

    #[tokio::test]
    async fn sqlite_services_share_one_database() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SwitchboardConfig::default();
        config.store.database_url = format!(
            "sqlite://{}?mode=rwc",
            dir.path().join("switchboard.db").display()
        );

        let services = Services::open_sqlite(&config).await.unwrap();
        services
            .ingress()
            .admit(&InboundEvent::text("msg-1", "5511987654321", "oi"))
            .await
            .unwrap();
        services.close().await;

        // A second process opening the same file sees the job and the marker.
        let reopened = Services::open_sqlite(&config).await.unwrap();
        assert_eq!(reopened.queue.counts().await.unwrap().pending, 1);
        let again = reopened
            .ingress()
            .admit(&InboundEvent::text("msg-1", "5511987654321", "oi"))
            .await
            .unwrap();
        assert!(again.is_duplicate());
        reopened.close().await;
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
