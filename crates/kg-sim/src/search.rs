//! A search client whose visibility lags entity creation by a fixed delay,
//! modelling the real vector index's indexing latency. Runs against tokio's
//! paused clock so the lag is deterministic under a given seed and the test
//! advances instantly rather than sleeping in real time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kg_core::store::EntityStore;
use kg_core::FakeEntityStore;
use kg_search::{SearchClient, SearchError, SearchHit};
use parking_lot::Mutex;
use tokio::time::Instant;

pub struct IndexDelaySearch {
    store: Arc<FakeEntityStore>,
    index_delay: Duration,
    indexed_at: Mutex<HashMap<String, Instant>>,
}

impl IndexDelaySearch {
    pub fn new(store: Arc<FakeEntityStore>, index_delay: Duration) -> Self {
        Self {
            store,
            index_delay,
            indexed_at: Mutex::new(HashMap::new()),
        }
    }

    /// Call once per entity at the moment it becomes visible to the index
    /// (i.e. right after creation) - records the logical time it will clear
    /// `index_delay`.
    pub fn mark_created(&self, entity_id: &str) {
        self.indexed_at
            .lock()
            .insert(entity_id.to_string(), Instant::now() + self.index_delay);
    }

    fn visible_now(&self, id: &str) -> bool {
        self.indexed_at
            .lock()
            .get(id)
            .is_some_and(|ready_at| Instant::now() >= *ready_at)
    }
}

#[async_trait]
impl SearchClient for IndexDelaySearch {
    async fn search(
        &self,
        _query: &str,
        layer: u32,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let ids = self
            .store
            .list_layer(layer)
            .await
            .map_err(|e| SearchError::Status {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: e.to_string(),
            })?;
        let mut hits: Vec<SearchHit> = ids
            .into_iter()
            .filter(|id| self.visible_now(id))
            .map(|id| SearchHit { peer_id: id, score: 1.0 })
            .collect();
        if let Some(limit) = limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }
}
