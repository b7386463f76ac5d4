//! The idempotency gate in front of the work queue.

use std::{sync::Arc, time::Duration};

use {
    switchboard_common::{duration_ms, now_ms},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{counter, idempotency as idempotency_metrics};

use crate::{IdempotencyKey, IdempotencyStore, Result};

/// Admits each logical event at most once per TTL window.
#[derive(Clone)]
pub struct IdempotencyGate {
    store: Arc<dyn IdempotencyStore>,
    default_ttl: Duration,
}

impl IdempotencyGate {
    pub fn new(store: Arc<dyn IdempotencyStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// `true` if this is the first sighting of `key` within `ttl`.
    ///
    /// Fails open: a store error is logged and the event is admitted.
    pub async fn admit(&self, key: &IdempotencyKey, ttl: Duration) -> bool {
        self.admit_at(key, ttl, now_ms()).await
    }

    /// [`admit`](Self::admit) with the gate's configured TTL.
    pub async fn admit_default(&self, key: &IdempotencyKey) -> bool {
        self.admit(key, self.default_ttl).await
    }

    pub async fn admit_at(&self, key: &IdempotencyKey, ttl: Duration, now_ms: u64) -> bool {
        match self
            .store
            .set_if_absent(key.as_str(), now_ms, duration_ms(ttl))
            .await
        {
            Ok(true) => {
                #[cfg(feature = "metrics")]
                counter!(idempotency_metrics::ADMITTED_TOTAL).increment(1);
                true
            },
            Ok(false) => {
                debug!(key = %key, "duplicate event suppressed");
                #[cfg(feature = "metrics")]
                counter!(idempotency_metrics::DUPLICATES_TOTAL).increment(1);
                false
            },
            Err(e) => {
                warn!(key = %key, error = %e, "idempotency store unavailable, admitting event");
                #[cfg(feature = "metrics")]
                counter!(idempotency_metrics::FAIL_OPEN_TOTAL).increment(1);
                true
            },
        }
    }

    /// Drop the marker so a later redelivery is admitted again.
    ///
    /// Used when an admitted event could not be enqueued.
    pub async fn forget(&self, key: &IdempotencyKey) -> bool {
        match self.store.remove(key.as_str()).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to remove idempotency marker");
                false
            },
        }
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.store.purge_expired(now_ms()).await?;
        if purged > 0 {
            debug!(purged, "purged expired idempotency markers");
        }
        Ok(purged)
    }
}
