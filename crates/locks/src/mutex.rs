//! Session mutex service: bounded acquisition, token-checked release, and
//! run-under-lock.

use std::{future::Future, sync::Arc, time::Duration};

use {
    rand::Rng,
    switchboard_common::{duration_ms, now_ms},
    switchboard_config::LockConfig,
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use switchboard_metrics::{counter, locks as lock_metrics};

use crate::{ExclusiveError, LockRecord, LockStore, Result, SessionKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOptions {
    /// Default lease length used by callers that do not pass their own.
    pub ttl: Duration,
    /// Attempts after the first before giving up.
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Upper bound of the random delay added to each retry.
    pub retry_jitter: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from(&LockConfig::default())
    }
}

impl From<&LockConfig> for LockOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            ttl: config.ttl(),
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            retry_jitter: Duration::from_millis(config.retry_jitter_ms),
        }
    }
}

/// Proof of a granted lease. Present it to release or extend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: SessionKey,
    pub token: String,
    pub expires_at_ms: u64,
}

impl LockToken {
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Clone)]
pub struct SessionMutex {
    store: Arc<dyn LockStore>,
    options: LockOptions,
}

impl SessionMutex {
    pub fn new(store: Arc<dyn LockStore>, options: LockOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> &LockOptions {
        &self.options
    }

    /// Try to take the lock, retrying a bounded number of times.
    ///
    /// Returns `None` when the lock stays held or the store keeps failing;
    /// the caller should treat the work as not yet processable.
    pub async fn acquire(&self, key: &SessionKey, ttl: Duration) -> Option<LockToken> {
        let attempts = self.options.retry_count.saturating_add(1);
        for attempt in 1..=attempts {
            match self.try_acquire(key, ttl).await {
                Ok(Some(token)) => {
                    debug!(key = %key, attempt, "session lock acquired");
                    #[cfg(feature = "metrics")]
                    counter!(lock_metrics::ACQUIRED_TOTAL).increment(1);
                    return Some(token);
                },
                Ok(None) => {},
                Err(e) => {
                    warn!(key = %key, attempt, error = %e, "lock store error during acquire");
                    #[cfg(feature = "metrics")]
                    counter!(lock_metrics::STORE_ERRORS_TOTAL).increment(1);
                },
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry_delay()).await;
            }
        }
        debug!(key = %key, attempts, "session lock unavailable");
        #[cfg(feature = "metrics")]
        counter!(lock_metrics::UNAVAILABLE_TOTAL).increment(1);
        None
    }

    /// A single acquisition attempt with no retries.
    pub async fn try_acquire(&self, key: &SessionKey, ttl: Duration) -> Result<Option<LockToken>> {
        let token = uuid::Uuid::new_v4().to_string();
        let now = now_ms();
        let ttl_ms = duration_ms(ttl);
        if self
            .store
            .try_acquire(key.as_str(), &token, now, ttl_ms)
            .await?
        {
            Ok(Some(LockToken {
                key: key.clone(),
                token,
                expires_at_ms: now.saturating_add(ttl_ms),
            }))
        } else {
            Ok(None)
        }
    }

    /// Release a lease. `false` if it had already expired and passed on, or
    /// the store could not be reached (the lease then lapses at its TTL).
    pub async fn release(&self, token: &LockToken) -> bool {
        match self
            .store
            .release(token.key.as_str(), &token.token)
            .await
        {
            Ok(true) => {
                debug!(key = %token.key, "session lock released");
                true
            },
            Ok(false) => {
                warn!(key = %token.key, "session lock expired before release");
                #[cfg(feature = "metrics")]
                counter!(lock_metrics::STALE_RELEASES_TOTAL).increment(1);
                false
            },
            Err(e) => {
                warn!(key = %token.key, error = %e, "failed to release session lock");
                #[cfg(feature = "metrics")]
                counter!(lock_metrics::STORE_ERRORS_TOTAL).increment(1);
                false
            },
        }
    }

    /// Refresh a held lease to `ttl` from now.
    pub async fn extend(&self, token: &mut LockToken, ttl: Duration) -> bool {
        let now = now_ms();
        let ttl_ms = duration_ms(ttl);
        match self
            .store
            .extend(token.key.as_str(), &token.token, now, ttl_ms)
            .await
        {
            Ok(true) => {
                token.expires_at_ms = now.saturating_add(ttl_ms);
                true
            },
            Ok(false) => false,
            Err(e) => {
                warn!(key = %token.key, error = %e, "failed to extend session lock");
                false
            },
        }
    }

    pub async fn holder(&self, key: &SessionKey) -> Result<Option<LockRecord>> {
        self.store.holder(key.as_str(), now_ms()).await
    }

    /// Delete lease records that have lapsed. Holders that crashed leave
    /// their row behind until this runs.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.store.purge_expired(now_ms()).await?;
        if purged > 0 {
            debug!(purged, "expired session locks purged");
        }
        Ok(purged)
    }

    /// Run `work` while holding the session lock.
    ///
    /// The lock is released whether `work` returns `Ok`, returns `Err`, or
    /// unwinds. If the returned future is dropped mid-flight the release is
    /// spawned onto the current runtime.
    pub async fn run_exclusive<T, E, F, Fut>(
        &self,
        key: &SessionKey,
        ttl: Duration,
        work: F,
    ) -> std::result::Result<T, ExclusiveError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let Some(token) = self.acquire(key, ttl).await else {
            return Err(ExclusiveError::Unavailable {
                key: key.to_string(),
            });
        };
        let guard = HeldLock {
            mutex: self.clone(),
            token: Some(token),
        };
        let outcome = work().await;
        guard.release().await;
        outcome.map_err(ExclusiveError::Inner)
    }

    fn retry_delay(&self) -> Duration {
        let jitter_ms = duration_ms(self.options.retry_jitter);
        let jitter = if jitter_ms > 0 {
            rand::rng().random_range(0..=jitter_ms)
        } else {
            0
        };
        self.options.retry_delay + Duration::from_millis(jitter)
    }
}

/// Releases its lease when dropped without an explicit release.
struct HeldLock {
    mutex: SessionMutex,
    token: Option<LockToken>,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(token) = self.token.take() {
            self.mutex.release(&token).await;
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        // Without a runtime the lease simply lapses at its TTL.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mutex = self.mutex.clone();
        handle.spawn(async move {
            mutex.release(&token).await;
        });
    }
}
