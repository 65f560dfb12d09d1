//! Scatter coordinator: turns an input list of entity ids into N parallel
//! branches, each entering extract -> dedupe -> cluster -> describe ->
//! (recurse cluster).

pub mod collaborators;

use std::sync::Arc;

use kg_core::log_writer::LogWriter;
use kg_core::model::{Handoff, LogStatus};
use kg_core::store::EntityStore;
use kg_core::{EntityId, JobCollection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScatterError {
    #[error("entity store error: {0}")]
    Store(#[from] kg_core::StoreError),
}

pub struct ScatterResult {
    pub job_collection: JobCollection,
    pub root_log: EntityId,
}

/// Creates the job collection and the root scatter log (status `running`,
/// no handoffs yet) and links `first_log` on the collection. Does not fan
/// out - the caller creates one branch log per entity id first (so their
/// ids exist to record as `sent_to` children), then calls [`finish`] with
/// those branch log ids. Splitting start/finish this way is what lets the
/// completion oracle's `sent_to` walk reach real per-branch logs instead of
/// the bare input entities, which carry no `status`/`handoffs` of their own.
pub async fn start<S: EntityStore + 'static>(
    store: Arc<S>,
    target_entity: &str,
) -> Result<ScatterResult, ScatterError> {
    let collection_id = store
        .create_with_relationships(
            "job_collection",
            serde_json::json!({ "target_entity": target_entity })
                .as_object()
                .unwrap()
                .clone(),
            vec![],
        )
        .await?;

    let writer = LogWriter::new(Arc::clone(&store));
    let root_log = writer.create(&[], "kg-scatter").await?;

    store
        .additive_update(vec![kg_core::AdditiveUpdate {
            entity_id: collection_id.clone(),
            properties: Default::default(),
            relationships: vec![kg_core::model::Relationship {
                predicate: kg_core::model::Predicate::FirstLog,
                peer: root_log.clone(),
            }],
        }])
        .await?;

    Ok(ScatterResult {
        job_collection: JobCollection {
            id: collection_id,
            first_log: root_log.clone(),
        },
        root_log,
    })
}

/// Records the single `scatter` handoff on the root log, with `outputs`
/// equal to the per-branch log ids, and seals the log `done` - so the
/// completion oracle knows to expect exactly that many children.
pub async fn finish<S: EntityStore + 'static>(
    store: Arc<S>,
    root_log: EntityId,
    branch_log_ids: Vec<EntityId>,
) -> Result<(), ScatterError> {
    let writer = LogWriter::new(store);
    writer.set_handoffs(
        root_log.clone(),
        vec![Handoff::Scatter {
            outputs: Some(branch_log_ids),
            invocations: None,
            delegated: false,
        }],
    );
    writer.complete(root_log, LogStatus::Completed, None, vec![]);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_core::FakeEntityStore;

    #[tokio::test]
    async fn start_links_first_log_on_the_collection() {
        let store = Arc::new(FakeEntityStore::new());
        let result = start(Arc::clone(&store), "target").await.unwrap();
        let collection = store.get(&result.job_collection.id).await.unwrap();
        assert!(collection
            .incoming(&kg_core::model::Predicate::FirstLog)
            .any(|p| p == &result.root_log));
    }

    #[tokio::test]
    async fn finish_records_scatter_handoff_with_branch_log_ids() {
        let store = Arc::new(FakeEntityStore::new());
        let result = start(Arc::clone(&store), "target").await.unwrap();
        finish(
            Arc::clone(&store),
            result.root_log.clone(),
            vec!["b1".to_string(), "b2".to_string(), "b3".to_string()],
        )
        .await
        .unwrap();

        // give the fire-and-forget writes a turn to land
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let root_log = store.get(&result.root_log).await.unwrap();
        let handoffs: Vec<Handoff> = serde_json::from_value(
            root_log.properties.get("handoffs").cloned().unwrap(),
        )
        .unwrap();
        match &handoffs[0] {
            Handoff::Scatter { outputs, .. } => {
                assert_eq!(outputs.as_ref().unwrap().len(), 3);
            }
            other => panic!("expected scatter handoff, got {other:?}"),
        }
    }
}
