//! Fire-and-forget log writer. Every write is an additive update spawned
//! onto its own task; a transport failure is logged and dropped, never
//! retried by the caller's logical step, and never blocks the worker that
//! issued it.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::model::{Handoff, LogMessage, LogStatus, Predicate, Relationship};
use crate::store::{AdditiveUpdate, EntityStore};
use crate::model::EntityKind;

pub struct LogWriter<S: EntityStore + 'static> {
    store: Arc<S>,
}

impl<S: EntityStore + 'static> LogWriter<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Creates the log entity up front and links it to its parents via
    /// `received_from`. Returns the new log's id - callers await this one
    /// call since later handoff/completion writes need the id.
    pub async fn create(
        &self,
        parent_logs: &[String],
        klados_id: &str,
    ) -> Result<String, crate::error::StoreError> {
        let relationships = parent_logs
            .iter()
            .map(|p| Relationship {
                predicate: Predicate::ReceivedFrom,
                peer: p.clone(),
            })
            .collect();
        self.store
            .create_with_relationships(
                EntityKind::KLADOS_LOG,
                json!({
                    "klados_id": klados_id,
                    "status": "running",
                    "started_at": Utc::now().to_rfc3339(),
                })
                .as_object()
                .unwrap()
                .clone(),
                relationships,
            )
            .await
    }

    /// Fire-and-forget: records the handoffs this log produced, plus
    /// `sent_to` edges to the new child entities.
    pub fn set_handoffs(&self, log_id: String, handoffs: Vec<Handoff>) {
        let store = Arc::clone(&self.store);
        let relationships = handoffs
            .iter()
            .flat_map(handoff_targets)
            .map(|peer| Relationship {
                predicate: Predicate::SentTo,
                peer,
            })
            .collect();
        tokio::spawn(async move {
            let update = AdditiveUpdate {
                entity_id: log_id,
                properties: json!({ "handoffs": handoffs })
                    .as_object()
                    .unwrap()
                    .clone(),
                relationships,
            };
            if let Err(e) = store.additive_update(vec![update]).await {
                tracing::warn!(%e, "failed to record handoffs on log entry");
            }
        });
    }

    /// Fire-and-forget: marks the log complete (or failed) with an optional
    /// set of messages (carrying `num_copies` for delegated scatters).
    pub fn complete(
        &self,
        log_id: String,
        status: LogStatus,
        error: Option<String>,
        messages: Vec<LogMessage>,
    ) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut properties = json!({
                "status": status,
                "completed_at": Utc::now().to_rfc3339(),
                "messages": messages,
            })
            .as_object()
            .unwrap()
            .clone();
            if let Some(err) = error {
                properties.insert("error".to_string(), err.into());
            }
            let update = AdditiveUpdate {
                entity_id: log_id,
                properties,
                relationships: vec![],
            };
            if let Err(e) = store.additive_update(vec![update]).await {
                tracing::warn!(%e, "failed to complete log entry");
            }
        });
    }
}

fn handoff_targets(handoff: &Handoff) -> Vec<String> {
    match handoff {
        Handoff::Invoke { outputs } | Handoff::Pass { outputs } | Handoff::Gather { outputs } => {
            outputs.to_vec()
        }
        Handoff::Scatter { outputs, .. } => outputs.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fake::FakeEntityStore;

    #[tokio::test]
    async fn create_links_parent_logs() {
        let store = Arc::new(FakeEntityStore::new());
        let writer = LogWriter::new(Arc::clone(&store));
        let parent = writer.create(&[], "kg-scatter").await.unwrap();
        let child = writer.create(&[parent.clone()], "kg-cluster").await.unwrap();
        let entity = store.get(&child).await.unwrap();
        assert!(entity
            .incoming(&Predicate::ReceivedFrom)
            .any(|p| p == &parent));
    }

    #[tokio::test]
    async fn complete_is_fire_and_forget() {
        let store = Arc::new(FakeEntityStore::new());
        let writer = LogWriter::new(Arc::clone(&store));
        let log_id = writer.create(&[], "kg-cluster").await.unwrap();
        writer.complete(log_id.clone(), LogStatus::Completed, None, vec![]);
        // give the spawned task a chance to run
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let entity = store.get(&log_id).await.unwrap();
        assert_eq!(
            entity.properties.get("status").and_then(|v| v.as_str()),
            Some("completed")
        );
    }
}
