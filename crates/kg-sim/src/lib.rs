//! Discrete-event simulation fixture: drives many `kg_cluster::ClusterWorker`
//! instances concurrently against a synthetic store and index-delayed search
//! client, under tokio's paused clock so runs are deterministic and instant.

pub mod properties;
pub mod search;

use std::sync::Arc;
use std::time::Duration;

use kg_cluster::{ClusterOutcome, ClusterWorker, ClusterWorkerConfig, RealTimers};
use kg_core::model::EntityKind;
use kg_core::FakeEntityStore;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use search::IndexDelaySearch;

pub struct ScenarioConfig {
    pub seed: u64,
    pub search_k: usize,
    pub arrival_spread: Duration,
    pub index_delay: Duration,
    pub follower_wait_min: Duration,
    pub follower_wait_max: Duration,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            search_k: 5,
            arrival_spread: Duration::from_millis(100),
            index_delay: Duration::from_secs(1),
            follower_wait_min: Duration::from_secs(30),
            follower_wait_max: Duration::from_secs(90),
        }
    }
}

pub struct ScenarioReport {
    pub entities: Vec<kg_core::Entity>,
    pub outcomes: Vec<ClusterOutcome>,
}

/// Seeds `count` layer-0 entities with staggered arrival, runs each through
/// a cluster worker concurrently, and returns the final entity snapshot.
/// Must run inside a test with `tokio::time::pause()` active so the
/// arrival stagger and follower-wait timers resolve deterministically.
pub async fn run_scenario(count: usize, config: ScenarioConfig) -> ScenarioReport {
    let store = Arc::new(FakeEntityStore::new());
    let search = Arc::new(IndexDelaySearch::new(Arc::clone(&store), config.index_delay));

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let id = store
            .create_with_relationships(
                EntityKind::TEXT_CHUNK,
                serde_json::json!({"label": format!("entity-{i}"), "_kg_layer": 0u32})
                    .as_object()
                    .unwrap()
                    .clone(),
                vec![],
            )
            .await
            .unwrap();
        search.mark_created(&id);
        ids.push(id);
        tokio::time::sleep(config.arrival_spread).await;
    }

    let mut handles = Vec::with_capacity(count);
    for (i, id) in ids.into_iter().enumerate() {
        let store = Arc::clone(&store);
        let search = Arc::clone(&search);
        let rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(i as u64));
        let worker_config = ClusterWorkerConfig {
            search_k: config.search_k,
            recheck_delay: Duration::from_millis(500),
            follower_wait_min: config.follower_wait_min,
            follower_wait_max: config.follower_wait_max,
        };
        let worker = ClusterWorker::new(store, search, RealTimers::new(rng), worker_config);
        handles.push(tokio::spawn(async move { worker.run(&id, 0).await }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    let entities = store.all_entities();
    ScenarioReport { entities, outcomes }
}
