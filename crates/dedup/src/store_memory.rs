//! In-memory marker store for tests and single-process deployments.

use {
    async_trait::async_trait,
    dashmap::{DashMap, mapref::entry::Entry},
};

use crate::{
    Result,
    store::{IdempotencyMarker, IdempotencyStore},
};

/// Markers in a `DashMap`; the entry guard makes check-and-set atomic.
#[derive(Default)]
pub struct InMemoryStore {
    markers: DashMap<String, IdempotencyMarker>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn set_if_absent(&self, key: &str, now_ms: u64, ttl_ms: u64) -> Result<bool> {
        let marker = IdempotencyMarker {
            key: key.to_string(),
            created_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        };
        let inserted = match self.markers.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_live(now_ms) {
                    false
                } else {
                    occupied.insert(marker);
                    true
                }
            },
            Entry::Vacant(vacant) => {
                vacant.insert(marker);
                true
            },
        };
        Ok(inserted)
    }

    async fn get(&self, key: &str) -> Result<Option<IdempotencyMarker>> {
        Ok(self.markers.get(key).map(|m| m.clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.markers.remove(key).is_some())
    }

    async fn purge_expired(&self, now_ms: u64) -> Result<u64> {
        let before = self.markers.len();
        self.markers.retain(|_, marker| marker.is_live(now_ms));
        Ok(before.saturating_sub(self.markers.len()) as u64)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, std::sync::Arc};

    #[tokio::test]
    async fn first_writer_wins() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("k", 1_000, 500).await.unwrap());
        assert!(!store.set_if_absent("k", 1_200, 500).await.unwrap());
    }

    #[tokio::test]
    async fn expired_marker_can_be_replaced() {
        let store = InMemoryStore::new();
        assert!(store.set_if_absent("k", 1_000, 500).await.unwrap());
        assert!(store.set_if_absent("k", 1_500, 500).await.unwrap());
        let marker = store.get("k").await.unwrap().unwrap();
        assert_eq!(marker.created_at_ms, 1_500);
        assert_eq!(marker.expires_at_ms, 2_000);
    }

    #[tokio::test]
    async fn concurrent_writers_see_single_winner() {
        let store = Arc::new(InMemoryStore::new());
        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.set_if_absent("k", 10, 1_000).await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_expired() {
        let store = InMemoryStore::new();
        store.set_if_absent("old", 0, 100).await.unwrap();
        store.set_if_absent("new", 0, 10_000).await.unwrap();
        assert_eq!(store.purge_expired(5_000).await.unwrap(), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get("new").await.unwrap().is_some());
    }
}
