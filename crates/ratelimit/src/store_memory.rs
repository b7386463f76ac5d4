//! In-memory rate store for tests and single-process deployments.

use {async_trait::async_trait, dashmap::DashMap};

use crate::{RateWindow, Result, store::RateStore};

#[derive(Default)]
pub struct InMemoryStore {
    windows: DashMap<(String, String), RateWindow>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn pair(account_id: &str, destination_id: &str) -> (String, String) {
    (account_id.to_string(), destination_id.to_string())
}

#[async_trait]
impl RateStore for InMemoryStore {
    async fn increment(
        &self,
        account_id: &str,
        destination_id: &str,
        now_ms: u64,
    ) -> Result<RateWindow> {
        let mut window = self
            .windows
            .entry(pair(account_id, destination_id))
            .or_insert_with(|| RateWindow::new(account_id, destination_id));
        window.bump(now_ms);
        Ok(window.clone())
    }

    async fn window(&self, account_id: &str, destination_id: &str) -> Result<Option<RateWindow>> {
        Ok(self
            .windows
            .get(&pair(account_id, destination_id))
            .map(|w| w.clone()))
    }

    async fn reset(&self, account_id: &str, destination_id: &str) -> Result<bool> {
        Ok(self
            .windows
            .remove(&pair(account_id, destination_id))
            .is_some())
    }

    async fn block_until(
        &self,
        account_id: &str,
        destination_id: &str,
        until_ms: u64,
    ) -> Result<()> {
        self.windows
            .entry(pair(account_id, destination_id))
            .or_insert_with(|| RateWindow::new(account_id, destination_id))
            .blocked_until_ms = Some(until_ms);
        Ok(())
    }
}
