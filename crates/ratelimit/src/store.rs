//! Persistence trait for rate windows.

use async_trait::async_trait;

use crate::{Result, RateWindow};

/// Shared backend for rate windows.
///
/// `increment` is one atomic read-and-bump; callers never read, add and
/// write back.
#[async_trait]
pub trait RateStore: Send + Sync {
    /// Count one send at `now_ms` and return the updated window.
    async fn increment(&self, account_id: &str, destination_id: &str, now_ms: u64)
    -> Result<RateWindow>;

    async fn window(&self, account_id: &str, destination_id: &str) -> Result<Option<RateWindow>>;

    /// Forget counters and any block for the pair.
    async fn reset(&self, account_id: &str, destination_id: &str) -> Result<bool>;

    async fn block_until(&self, account_id: &str, destination_id: &str, until_ms: u64)
    -> Result<()>;
}
