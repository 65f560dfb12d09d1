//! Entity store client: the HTTP collaborator backing all entity CRUD and
//! the additive (merge, never overwrite) update operation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::backoff;
use crate::error::StoreError;
use crate::model::{Entity, EntityId, Relationship};

/// One additive update: deep-merge `properties` into the target entity's
/// property bag, union `relationships` into its relationship set. Never a
/// replace - see the workflow engine's "additive update payload" contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdditiveUpdate {
    pub entity_id: EntityId,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Entity, StoreError>;
    async fn batch_get(&self, ids: &[EntityId]) -> Result<Vec<Entity>, StoreError>;
    async fn create_with_relationships(
        &self,
        kind: &str,
        properties: Map<String, Value>,
        relationships: Vec<Relationship>,
    ) -> Result<EntityId, StoreError>;
    async fn additive_update(&self, updates: Vec<AdditiveUpdate>) -> Result<(), StoreError>;
    /// Entities at a given layer, in ascending lexicographic id order - the
    /// second step of the cluster worker's fallback.
    async fn list_layer(&self, layer: u32) -> Result<Vec<EntityId>, StoreError>;
    /// Entities with an outgoing `summarized_by` edge to `leader_id` - the
    /// reverse-relationship query backing membership counts and the describe
    /// worker's member lookup. `summarized_by` edges are written on the
    /// member side only, so this cannot be read off the leader entity
    /// itself.
    async fn members_of(&self, leader_id: &str) -> Result<Vec<EntityId>, StoreError>;
    /// Replaces any existing `summarized_by` edge on `entity_id` with one
    /// pointing at `leader_id`. The membership invariant ("at most one
    /// summarized_by") means this one edge is a replace, not a union, unlike
    /// every other relationship the additive service manages - the fallback
    /// procedure depends on a follower being able to leave one cluster and
    /// join another atomically.
    async fn set_summarized_by(&self, entity_id: &str, leader_id: &str) -> Result<(), StoreError>;
    /// Removes any `summarized_by` edge on `entity_id` without replacing it -
    /// used when a solo cluster dissolves and its sole member ends up
    /// clusterless at this layer.
    async fn clear_summarized_by(&self, entity_id: &str) -> Result<(), StoreError>;
    /// Deletes an entity outright - used to remove an abandoned solo cluster
    /// leader once its sole member has left (fallback) or dissolved it.
    async fn delete_entity(&self, id: &str) -> Result<(), StoreError>;
}

pub struct HttpEntityStore {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpEntityStore {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn url(&self, path: &str) -> url::Url {
        self.base_url.join(path).expect("valid relative path")
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(StoreError::Status { status, body })
        }
    }
}

#[async_trait]
impl EntityStore for HttpEntityStore {
    async fn get(&self, id: &str) -> Result<Entity, StoreError> {
        let url = self.url(&format!("entities/{id}"));
        backoff::retry(|| async {
            let resp = self.client.get(url.clone()).send().await?;
            if resp.status() == reqwest::StatusCode::NOT_FOUND {
                return Err(StoreError::NotFound(id.to_string()));
            }
            let resp = Self::check_status(resp).await?;
            resp.json::<Entity>().await.map_err(StoreError::Transport)
        })
        .await
    }

    async fn batch_get(&self, ids: &[EntityId]) -> Result<Vec<Entity>, StoreError> {
        let url = self.url("entities/batch_get");
        backoff::retry(|| async {
            let resp = self.client.post(url.clone()).json(&ids).send().await?;
            let resp = Self::check_status(resp).await?;
            resp.json::<Vec<Entity>>().await.map_err(StoreError::Transport)
        })
        .await
    }

    async fn create_with_relationships(
        &self,
        kind: &str,
        properties: Map<String, Value>,
        relationships: Vec<Relationship>,
    ) -> Result<EntityId, StoreError> {
        #[derive(Serialize)]
        struct Req<'a> {
            kind: &'a str,
            properties: &'a Map<String, Value>,
            relationships: &'a [Relationship],
        }
        #[derive(Deserialize)]
        struct Resp {
            id: EntityId,
        }
        let url = self.url("entities");
        let body = Req {
            kind,
            properties: &properties,
            relationships: &relationships,
        };
        backoff::retry(|| async {
            let resp = self.client.post(url.clone()).json(&body).send().await?;
            let resp = Self::check_status(resp).await?;
            let parsed: Resp = resp.json().await.map_err(StoreError::Transport)?;
            Ok(parsed.id)
        })
        .await
    }

    async fn additive_update(&self, updates: Vec<AdditiveUpdate>) -> Result<(), StoreError> {
        let url = self.url("entities/additive_update");
        backoff::retry(|| async {
            let resp = self.client.post(url.clone()).json(&updates).send().await?;
            Self::check_status(resp).await?;
            Ok(())
        })
        .await
    }

    async fn list_layer(&self, layer: u32) -> Result<Vec<EntityId>, StoreError> {
        let url = self.url(&format!("entities/by_layer/{layer}"));
        backoff::retry(|| async {
            let resp = self.client.get(url.clone()).send().await?;
            let resp = Self::check_status(resp).await?;
            let mut ids: Vec<EntityId> = resp.json().await.map_err(StoreError::Transport)?;
            ids.sort();
            Ok(ids)
        })
        .await
    }

    async fn members_of(&self, leader_id: &str) -> Result<Vec<EntityId>, StoreError> {
        let url = self.url(&format!("entities/members_of/{leader_id}"));
        backoff::retry(|| async {
            let resp = self.client.get(url.clone()).send().await?;
            let resp = Self::check_status(resp).await?;
            resp.json::<Vec<EntityId>>().await.map_err(StoreError::Transport)
        })
        .await
    }

    async fn set_summarized_by(&self, entity_id: &str, leader_id: &str) -> Result<(), StoreError> {
        #[derive(Serialize)]
        struct Req<'a> {
            leader_id: &'a str,
        }
        let url = self.url(&format!("entities/{entity_id}/summarized_by"));
        backoff::retry(|| async {
            let resp = self
                .client
                .put(url.clone())
                .json(&Req { leader_id })
                .send()
                .await?;
            Self::check_status(resp).await?;
            Ok(())
        })
        .await
    }

    async fn clear_summarized_by(&self, entity_id: &str) -> Result<(), StoreError> {
        let url = self.url(&format!("entities/{entity_id}/summarized_by"));
        backoff::retry(|| async {
            let resp = self.client.delete(url.clone()).send().await?;
            Self::check_status(resp).await?;
            Ok(())
        })
        .await
    }

    async fn delete_entity(&self, id: &str) -> Result<(), StoreError> {
        let url = self.url(&format!("entities/{id}"));
        backoff::retry(|| async {
            let resp = self.client.delete(url.clone()).send().await?;
            Self::check_status(resp).await?;
            Ok(())
        })
        .await
    }
}

/// In-memory store used by unit tests and the simulator. Never used outside
/// `#[cfg(test)]` or the `test-support` feature.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use parking_lot::RwLock;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    pub struct FakeEntityStore {
        entities: RwLock<HashMap<EntityId, Entity>>,
        next_id: AtomicU64,
    }

    impl FakeEntityStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, entity: Entity) {
            self.entities.write().insert(entity.id.clone(), entity);
        }

        /// Snapshot of every entity currently in the store - used by the
        /// simulator to run invariant checks after a scenario completes.
        pub fn all_entities(&self) -> Vec<Entity> {
            self.entities.read().values().cloned().collect()
        }
    }

    #[async_trait]
    impl EntityStore for FakeEntityStore {
        async fn get(&self, id: &str) -> Result<Entity, StoreError> {
            self.entities
                .read()
                .get(id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        }

        async fn batch_get(&self, ids: &[EntityId]) -> Result<Vec<Entity>, StoreError> {
            let guard = self.entities.read();
            ids.iter()
                .map(|id| {
                    guard
                        .get(id)
                        .cloned()
                        .ok_or_else(|| StoreError::NotFound(id.clone()))
                })
                .collect()
        }

        async fn create_with_relationships(
            &self,
            kind: &str,
            properties: Map<String, Value>,
            relationships: Vec<Relationship>,
        ) -> Result<EntityId, StoreError> {
            let id = format!("e{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let layer = properties
                .get("_kg_layer")
                .and_then(|v| v.as_u64())
                .map(|v| v as u32);
            self.entities.write().insert(
                id.clone(),
                Entity {
                    id: id.clone(),
                    kind: crate::model::EntityKind::new(kind),
                    properties,
                    layer,
                    relationships: relationships.into_iter().collect(),
                },
            );
            Ok(id)
        }

        async fn additive_update(&self, updates: Vec<AdditiveUpdate>) -> Result<(), StoreError> {
            let mut guard = self.entities.write();
            for update in updates {
                let entity = guard
                    .get_mut(&update.entity_id)
                    .ok_or_else(|| StoreError::NotFound(update.entity_id.clone()))?;
                for (k, v) in update.properties {
                    entity.properties.insert(k, v);
                }
                entity.relationships.extend(update.relationships);
            }
            Ok(())
        }

        async fn list_layer(&self, layer: u32) -> Result<Vec<EntityId>, StoreError> {
            let mut ids: Vec<EntityId> = self
                .entities
                .read()
                .values()
                .filter(|e| e.layer == Some(layer))
                .map(|e| e.id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        }

        async fn members_of(&self, leader_id: &str) -> Result<Vec<EntityId>, StoreError> {
            let mut ids: Vec<EntityId> = self
                .entities
                .read()
                .values()
                .filter(|e| {
                    e.incoming(&crate::model::Predicate::SummarizedBy)
                        .any(|p| p == leader_id)
                })
                .map(|e| e.id.clone())
                .collect();
            ids.sort();
            Ok(ids)
        }

        async fn set_summarized_by(&self, entity_id: &str, leader_id: &str) -> Result<(), StoreError> {
            let mut guard = self.entities.write();
            let entity = guard
                .get_mut(entity_id)
                .ok_or_else(|| StoreError::NotFound(entity_id.to_string()))?;
            entity
                .relationships
                .retain(|r| r.predicate != crate::model::Predicate::SummarizedBy);
            entity.relationships.insert(crate::model::Relationship {
                predicate: crate::model::Predicate::SummarizedBy,
                peer: leader_id.to_string(),
            });
            Ok(())
        }

        async fn clear_summarized_by(&self, entity_id: &str) -> Result<(), StoreError> {
            let mut guard = self.entities.write();
            let entity = guard
                .get_mut(entity_id)
                .ok_or_else(|| StoreError::NotFound(entity_id.to_string()))?;
            entity
                .relationships
                .retain(|r| r.predicate != crate::model::Predicate::SummarizedBy);
            Ok(())
        }

        async fn delete_entity(&self, id: &str) -> Result<(), StoreError> {
            self.entities.write().remove(id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeEntityStore;
    use super::*;
    use crate::model::EntityKind;
    use serde_json::json;

    #[tokio::test]
    async fn additive_update_merges_not_overwrites() {
        let store = FakeEntityStore::new();
        let id = store
            .create_with_relationships(
                EntityKind::CLUSTER_LEADER,
                json!({"label": "old"}).as_object().unwrap().clone(),
                vec![],
            )
            .await
            .unwrap();

        store
            .additive_update(vec![AdditiveUpdate {
                entity_id: id.clone(),
                properties: json!({"description": "new"}).as_object().unwrap().clone(),
                relationships: vec![],
            }])
            .await
            .unwrap();

        let entity = store.get(&id).await.unwrap();
        assert_eq!(entity.label(), Some("old"));
        assert_eq!(entity.description(), Some("new"));
    }

    #[tokio::test]
    async fn list_layer_returns_sorted_ids() {
        let store = FakeEntityStore::new();
        for (label, layer) in [("c", 1u64), ("a", 1), ("b", 1), ("z", 2)] {
            store
                .create_with_relationships(
                    EntityKind::TEXT_CHUNK,
                    json!({"label": label, "_kg_layer": layer})
                        .as_object()
                        .unwrap()
                        .clone(),
                    vec![],
                )
                .await
                .unwrap();
        }
        let ids = store.list_layer(1).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn set_summarized_by_replaces_rather_than_unions() {
        let store = FakeEntityStore::new();
        let member = store
            .create_with_relationships(EntityKind::TEXT_CHUNK, Default::default(), vec![])
            .await
            .unwrap();
        store.set_summarized_by(&member, "leader_a").await.unwrap();
        store.set_summarized_by(&member, "leader_b").await.unwrap();

        let entity = store.get(&member).await.unwrap();
        let leaders: Vec<_> = entity
            .incoming(&crate::model::Predicate::SummarizedBy)
            .collect();
        assert_eq!(leaders, vec!["leader_b"]);
    }

    #[tokio::test]
    async fn clear_summarized_by_removes_the_edge() {
        let store = FakeEntityStore::new();
        let member = store
            .create_with_relationships(EntityKind::TEXT_CHUNK, Default::default(), vec![])
            .await
            .unwrap();
        store.set_summarized_by(&member, "leader_a").await.unwrap();
        store.clear_summarized_by(&member).await.unwrap();

        let entity = store.get(&member).await.unwrap();
        assert_eq!(entity.incoming(&crate::model::Predicate::SummarizedBy).count(), 0);
    }

    #[tokio::test]
    async fn delete_entity_removes_it_from_the_store() {
        let store = FakeEntityStore::new();
        let id = store
            .create_with_relationships(EntityKind::CLUSTER_LEADER, Default::default(), vec![])
            .await
            .unwrap();
        store.delete_entity(&id).await.unwrap();
        assert!(matches!(store.get(&id).await, Err(StoreError::NotFound(_))));
    }
}
