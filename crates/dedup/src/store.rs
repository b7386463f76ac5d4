//! Persistence trait for idempotency markers.

use async_trait::async_trait;

use crate::Result;

/// A remembered admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyMarker {
    pub key: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl IdempotencyMarker {
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms < self.expires_at_ms
    }
}

/// Shared backend for idempotency markers.
///
/// `set_if_absent` must be a single atomic check-and-set: of any number of
/// concurrent callers for the same absent (or expired) key, exactly one
/// observes `true`.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn set_if_absent(&self, key: &str, now_ms: u64, ttl_ms: u64) -> Result<bool>;
    async fn get(&self, key: &str) -> Result<Option<IdempotencyMarker>>;
    async fn remove(&self, key: &str) -> Result<bool>;
    async fn purge_expired(&self, now_ms: u64) -> Result<u64>;
}
