//! In-memory state store.

use super::{EnrichmentStateStore, StoreError};
use crate::state::{EnrichmentStage, EnrichmentState};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Process-local store for tests and single-instance deployments.
pub struct InMemoryStateStore {
    states: Arc<RwLock<HashMap<String, EnrichmentState>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            states: Arc::new(RwLock::new(HashMap::new())),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Creates a store pre-populated with states.
    pub fn with_states(states: Vec<EnrichmentState>) -> Self {
        let map = states
            .into_iter()
            .map(|s| (s.ticket_id.clone(), s))
            .collect();
        Self {
            states: Arc::new(RwLock::new(map)),
            ..Self::new()
        }
    }

    /// Makes subsequent upserts fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful upserts.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> Vec<EnrichmentState> {
        self.states.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl EnrichmentStateStore for InMemoryStateStore {
    async fn get(&self, ticket_id: &str) -> Result<Option<EnrichmentState>, StoreError> {
        Ok(self.states.read().await.get(ticket_id).cloned())
    }

    async fn upsert(&self, state: &EnrichmentState) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Query("simulated write failure".to_string()));
        }
        self.states
            .write()
            .await
            .insert(state.ticket_id.clone(), state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, ticket_id: &str) -> Result<bool, StoreError> {
        Ok(self.states.write().await.remove(ticket_id).is_some())
    }

    async fn list_by_stages(
        &self,
        stages: &[EnrichmentStage],
    ) -> Result<Vec<EnrichmentState>, StoreError> {
        let mut states: Vec<EnrichmentState> = self
            .states
            .read()
            .await
            .values()
            .filter(|s| stages.contains(&s.stage))
            .cloned()
            .collect();
        states.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.ticket_id.cmp(&b.ticket_id))
        });
        Ok(states)
    }
}
