use std::sync::Arc;

use dashmap::DashMap;

use crate::{BreakerOptions, BreakerSnapshot, CircuitBreaker};

/// One breaker per protected-call name, created on first use.
#[derive(Default)]
pub struct BreakerRegistry {
    options: BreakerOptions,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(options: BreakerOptions) -> Self {
        Self {
            options,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(name) {
            return Arc::clone(&breaker);
        }
        Arc::clone(
            &self
                .breakers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.options.clone()))),
        )
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }
}
