//! Workflow-tree observer: resolves a job collection's `first_log` to root,
//! DFS over `sent_to`, and decides whether the run is complete.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use kg_core::model::{Handoff, LogStatus, Predicate};
use kg_core::store::EntityStore;
use kg_core::{Entity, EntityId, JobCollection};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("entity store error: {0}")]
    Store(#[from] kg_core::StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStatus {
    Complete,
    Incomplete,
}

/// Expected-child count for a log, per the completion oracle's formula.
/// `None` means UNKNOWN (a delegated scatter with no outputs written yet).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedChildren {
    Count(usize),
    Unknown,
}

struct ObservedLog {
    status: LogStatus,
    handoffs: Vec<Handoff>,
    num_copies_override: Option<u32>,
    children: Vec<EntityId>,
}

pub struct Observer<S: EntityStore> {
    store: std::sync::Arc<S>,
}

impl<S: EntityStore> Observer<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    pub async fn poll(&self, job_collection: &JobCollection) -> Result<TreeStatus, ObserverError> {
        let mut logs: HashMap<EntityId, ObservedLog> = HashMap::new();
        let mut visited = HashSet::new();
        let mut stack = vec![job_collection.first_log.clone()];

        while let Some(log_id) = stack.pop() {
            if !visited.insert(log_id.clone()) {
                continue;
            }
            let entity = self.store.get(&log_id).await?;
            let observed = parse_log(&entity);
            stack.extend(observed.children.iter().cloned());
            logs.insert(log_id, observed);
        }

        for log in logs.values() {
            if log.status == LogStatus::Running {
                return Ok(TreeStatus::Incomplete);
            }
            match expected_children(log) {
                ExpectedChildren::Unknown => return Ok(TreeStatus::Incomplete),
                ExpectedChildren::Count(expected) => {
                    if log.children.len() < expected {
                        return Ok(TreeStatus::Incomplete);
                    }
                }
            }
        }

        Ok(TreeStatus::Complete)
    }

    /// Polls at `interval` until complete or `deadline` elapses.
    pub async fn wait_until_complete(
        &self,
        job_collection: &JobCollection,
        interval: Duration,
        deadline: Duration,
    ) -> Result<TreeStatus, ObserverError> {
        let start = tokio::time::Instant::now();
        loop {
            if self.poll(job_collection).await? == TreeStatus::Complete {
                return Ok(TreeStatus::Complete);
            }
            if start.elapsed() >= deadline {
                return Ok(TreeStatus::Incomplete);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

fn parse_log(entity: &Entity) -> ObservedLog {
    let status = entity
        .properties
        .get("status")
        .and_then(|v| v.as_str())
        .and_then(|s| match s {
            "running" => Some(LogStatus::Running),
            "completed" | "done" => Some(LogStatus::Completed),
            "error" => Some(LogStatus::Failed),
            _ => None,
        })
        .unwrap_or(LogStatus::Running);

    let handoffs: Vec<Handoff> = entity
        .properties
        .get("handoffs")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    let num_copies_override = entity
        .properties
        .get("messages")
        .and_then(|v| v.as_array())
        .and_then(|msgs| {
            msgs.iter()
                .find_map(|m| m.get("num_copies").and_then(|n| n.as_u64()))
        })
        .map(|n| n as u32);

    let children: Vec<EntityId> = entity.incoming(&Predicate::SentTo).cloned().collect();

    ObservedLog {
        status,
        handoffs,
        num_copies_override,
        children,
    }
}

fn expected_children(log: &ObservedLog) -> ExpectedChildren {
    if let Some(n) = log.num_copies_override {
        return ExpectedChildren::Count(n as usize);
    }
    let mut total = 0usize;
    for handoff in &log.handoffs {
        match handoff {
            Handoff::Invoke { .. } | Handoff::Pass { .. } | Handoff::Gather { .. } => total += 1,
            Handoff::Scatter {
                outputs,
                invocations,
                delegated,
            } => {
                if let Some(outputs) = outputs {
                    total += outputs.len();
                } else if let Some(invocations) = invocations {
                    total += invocations.len();
                } else if *delegated {
                    return ExpectedChildren::Unknown;
                } else {
                    total += 1;
                }
            }
        }
    }
    ExpectedChildren::Count(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kg_core::model::{EntityKind, Relationship};
    use kg_core::FakeEntityStore;
    use serde_json::json;
    use std::sync::Arc;

    fn log_entity(id: &str, status: &str, handoffs: serde_json::Value) -> Entity {
        Entity {
            id: id.to_string(),
            kind: EntityKind::new(EntityKind::KLADOS_LOG),
            properties: json!({"status": status, "handoffs": handoffs})
                .as_object()
                .unwrap()
                .clone(),
            layer: None,
            relationships: Default::default(),
        }
    }

    fn link(parent: &mut Entity, child_id: &str) {
        parent.relationships.insert(Relationship {
            predicate: Predicate::SentTo,
            peer: child_id.to_string(),
        });
    }

    #[tokio::test]
    async fn single_terminal_log_with_no_handoffs_is_complete() {
        let store = Arc::new(FakeEntityStore::new());
        store.seed(log_entity("root", "done", json!([])));
        let jc = JobCollection {
            id: "jc".to_string(),
            first_log: "root".to_string(),
        };
        let observer = Observer::new(store);
        assert_eq!(observer.poll(&jc).await.unwrap(), TreeStatus::Complete);
    }

    #[tokio::test]
    async fn running_leaf_is_incomplete() {
        let store = Arc::new(FakeEntityStore::new());
        store.seed(log_entity("root", "running", json!([])));
        let jc = JobCollection {
            id: "jc".to_string(),
            first_log: "root".to_string(),
        };
        let observer = Observer::new(store);
        assert_eq!(observer.poll(&jc).await.unwrap(), TreeStatus::Incomplete);
    }

    #[tokio::test]
    async fn scatter_with_fewer_children_than_outputs_is_incomplete() {
        let store = Arc::new(FakeEntityStore::new());
        let mut root = log_entity(
            "root",
            "done",
            json!([{"type": "scatter", "outputs": ["c1", "c2"]}]),
        );
        link(&mut root, "c1");
        store.seed(root);
        store.seed(log_entity("c1", "done", json!([])));
        let jc = JobCollection {
            id: "jc".to_string(),
            first_log: "root".to_string(),
        };
        let observer = Observer::new(store);
        assert_eq!(observer.poll(&jc).await.unwrap(), TreeStatus::Incomplete);
    }

    #[tokio::test]
    async fn delegated_scatter_without_outputs_is_unknown_and_incomplete() {
        let store = Arc::new(FakeEntityStore::new());
        let root = log_entity("root", "done", json!([{"type": "scatter", "delegated": true}]));
        store.seed(root);
        let jc = JobCollection {
            id: "jc".to_string(),
            first_log: "root".to_string(),
        };
        let observer = Observer::new(store);
        assert_eq!(observer.poll(&jc).await.unwrap(), TreeStatus::Incomplete);
    }

    #[tokio::test]
    async fn complete_tree_with_invoke_chain() {
        let store = Arc::new(FakeEntityStore::new());
        let mut root = log_entity("root", "done", json!([{"type": "invoke", "outputs": ["child"]}]));
        link(&mut root, "child");
        store.seed(root);
        store.seed(log_entity("child", "done", json!([])));
        let jc = JobCollection {
            id: "jc".to_string(),
            first_log: "root".to_string(),
        };
        let observer = Observer::new(store);
        assert_eq!(observer.poll(&jc).await.unwrap(), TreeStatus::Complete);
    }
}
