//! In-memory lock store for tests and single-process deployments.

use {
    async_trait::async_trait,
    dashmap::{DashMap, mapref::entry::Entry},
};

use crate::{
    Result,
    store::{LockRecord, LockStore},
};

#[derive(Default)]
pub struct InMemoryStore {
    locks: DashMap<String, LockRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LockStore for InMemoryStore {
    async fn try_acquire(
        &self,
        key: &str,
        token: &str,
        now_ms: u64,
        ttl_ms: u64,
    ) -> Result<bool> {
        let record = LockRecord {
            key: key.to_string(),
            token: token.to_string(),
            acquired_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        Ok(match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut held) if !held.get().is_live(now_ms) => {
                held.insert(record);
                true
            },
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            },
        })
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, record| record.token == token)
            .is_some())
    }

    async fn extend(&self, key: &str, token: &str, now_ms: u64, ttl_ms: u64) -> Result<bool> {
        Ok(match self.locks.get_mut(key) {
            Some(mut record) if record.token == token && record.is_live(now_ms) => {
                record.expires_at_ms = now_ms.saturating_add(ttl_ms);
                true
            },
            _ => false,
        })
    }

    async fn holder(&self, key: &str, now_ms: u64) -> Result<Option<LockRecord>> {
        Ok(self
            .locks
            .get(key)
            .filter(|record| record.is_live(now_ms))
            .map(|record| record.clone()))
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64> {
        let before = self.locks.len();
        self.locks.retain(|_, record| record.is_live(now_ms));
        Ok(before.saturating_sub(self.locks.len()) as u64)
    }
}
