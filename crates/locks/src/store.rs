//! Persistence trait for session locks.

use async_trait::async_trait;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub token: String,
    pub acquired_at_ms: u64,
    pub expires_at_ms: u64,
}

impl LockRecord {
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Shared backend for lease records.
///
/// `try_acquire` is a single compare-and-set: it writes only if no live
/// record exists for the key.
#[async_trait]
pub trait LockStore: Send + Sync {
    async fn try_acquire(&self, key: &str, token: &str, now_ms: u64, ttl_ms: u64)
    -> Result<bool>;

    /// Delete the record only if it still carries `token`.
    async fn release(&self, key: &str, token: &str) -> Result<bool>;

    /// Push the expiry out to `now_ms + ttl_ms` if `token` still holds a live lease.
    async fn extend(&self, key: &str, token: &str, now_ms: u64, ttl_ms: u64) -> Result<bool>;

    /// The live holder, if any.
    async fn holder(&self, key: &str, now_ms: u64) -> Result<Option<LockRecord>>;

    async fn purge_expired(&self, now_ms: u64) -> Result<u64>;
}
