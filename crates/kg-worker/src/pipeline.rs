//! Wires the stages the core crates leave to their caller: scatter -> extract
//! -> dedupe -> cluster -> describe -> (cluster again at layer+1), one
//! concurrent branch per entry and per surviving cluster. Extract/dedupe are
//! the external-collaborator stand-ins from `kg_scatter::collaborators`; the
//! cluster/describe stages are the real core crates.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use kg_cluster::{ClusterOutcome, ClusterState, ClusterWorker, ClusterWorkerConfig, RealTimers};
use kg_core::log_writer::LogWriter;
use kg_core::model::{EntityKind, Handoff, LogStatus, Predicate, Relationship};
use kg_core::store::EntityStore;
use kg_core::EntityId;
use kg_describe::{DescribeWorker, LlmClient};
use kg_scatter::collaborators::{Deduper, Extractor};
use kg_search::SearchClient;
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;

use crate::metrics::{ClusterOutcomeLabel, HandoffTypeLabel, WorkerMetrics};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("entity store error: {0}")]
    Store(#[from] kg_core::StoreError),
    #[error("scatter error: {0}")]
    Scatter(#[from] kg_scatter::ScatterError),
}

impl PipelineConfig {
    /// Builds the pipeline-level config from the shared env-driven
    /// `ClusterConfig`, translating millisecond env vars into `Duration`s
    /// once at startup rather than on every cluster-worker invocation.
    pub fn from_cluster_config(cfg: &kg_core::config::ClusterConfig) -> Self {
        Self {
            extract_klados: cfg.extract_klados.clone(),
            dedupe_klados: cfg.dedupe_klados.clone(),
            cluster_klados: cfg.cluster_klados.clone(),
            describe_klados: cfg.describe_klados.clone(),
            cluster: ClusterWorkerConfig {
                search_k: cfg.search_k,
                recheck_delay: Duration::from_millis(cfg.recheck_delay_ms),
                follower_wait_min: Duration::from_millis(cfg.follower_wait_min_ms),
                follower_wait_max: Duration::from_millis(cfg.follower_wait_max_ms),
            },
            max_recursion_depth: cfg.max_recursion_depth,
            describe_max_retries: cfg.describe_max_retries,
        }
    }
}

/// Builds a [`PipelineDeps`] wired to the real HTTP entity store, HTTP search
/// client and env-configured LLM client - the shared construction both the
/// `kg-worker` binary and `kg-server`'s invocation handler use so neither
/// duplicates the other's wiring.
pub fn build_deps(
    cfg: &kg_core::config::ClusterConfig,
) -> anyhow::Result<Arc<PipelineDeps<kg_core::HttpEntityStore, kg_search::HttpSearchClient>>> {
    let store = Arc::new(kg_core::HttpEntityStore::new(cfg.arke_api_base.clone()));
    let search = Arc::new(kg_search::HttpSearchClient::new(cfg.arke_api_base.clone()));
    let llm = Arc::new(LlmClient::from_env()?);
    Ok(Arc::new(PipelineDeps {
        store,
        search,
        llm,
        extractor: Arc::new(kg_scatter::collaborators::HeuristicExtractor),
        deduper: Arc::new(kg_scatter::collaborators::FingerprintDeduper),
        metrics: Arc::new(WorkerMetrics::new()),
        config: PipelineConfig::from_cluster_config(cfg),
    }))
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub extract_klados: String,
    pub dedupe_klados: String,
    pub cluster_klados: String,
    pub describe_klados: String,
    pub cluster: ClusterWorkerConfig,
    pub max_recursion_depth: u32,
    pub describe_max_retries: u32,
}

/// Everything a pipeline run needs, bundled so `kg-server` and `kg-worker`'s
/// binary can both build one of these from `kg_core::ClusterConfig` and call
/// [`run_scatter`] without duplicating the wiring.
pub struct PipelineDeps<S: EntityStore, C: SearchClient> {
    pub store: Arc<S>,
    pub search: Arc<C>,
    pub llm: Arc<LlmClient>,
    pub extractor: Arc<dyn Extractor>,
    pub deduper: Arc<dyn Deduper>,
    pub metrics: Arc<WorkerMetrics>,
    pub config: PipelineConfig,
}

#[derive(Debug, Default)]
pub struct ScatterRunSummary {
    pub branches: usize,
    pub clusters_formed: usize,
    pub branch_errors: usize,
}

/// One input entity id paired with the branch log already created for it -
/// the unit [`run_branches`] fans out over.
pub struct StartedBranch {
    pub entity_id: EntityId,
    pub branch_log: EntityId,
}

/// Creates the job collection, root log, and one branch log per input
/// entity id, then records the root log's `scatter` handoff - everything
/// the completion oracle needs to exist before the caller can report a
/// `job_collection` to its own caller. Does not run any branch; see
/// [`run_branches`]. Split out of [`run_scatter`] so the HTTP invocation API
/// can return `{status: "started", job_collection}` synchronously and only
/// then hand the branches off to a detached task, without creating two job
/// collections for one invocation.
pub async fn start_scatter<S, C>(
    deps: &PipelineDeps<S, C>,
    target_entity: &str,
    entity_ids: Vec<EntityId>,
) -> Result<(kg_core::JobCollection, Vec<StartedBranch>), PipelineError>
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    let scatter = kg_scatter::start(Arc::clone(&deps.store), target_entity).await?;
    let writer = LogWriter::new(Arc::clone(&deps.store));

    let mut branch_log_ids = Vec::with_capacity(entity_ids.len());
    for _ in &entity_ids {
        branch_log_ids.push(
            writer
                .create(&[scatter.root_log.clone()], &deps.config.extract_klados)
                .await?,
        );
    }
    kg_scatter::finish(
        Arc::clone(&deps.store),
        scatter.root_log.clone(),
        branch_log_ids.clone(),
    )
    .await?;

    deps.metrics
        .handoffs_recorded
        .get_or_create(&HandoffTypeLabel("scatter".to_string()))
        .inc();

    let branches = entity_ids
        .into_iter()
        .zip(branch_log_ids)
        .map(|(entity_id, branch_log)| StartedBranch { entity_id, branch_log })
        .collect();

    Ok((scatter.job_collection, branches))
}

/// Runs every already-started branch concurrently and awaits them all.
/// Separated from [`start_scatter`] so a caller that already reported
/// `job_collection` to its own caller can run this part in a detached task.
pub async fn run_branches<S, C>(
    deps: Arc<PipelineDeps<S, C>>,
    branches: Vec<StartedBranch>,
) -> ScatterRunSummary
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    let mut handles = Vec::with_capacity(branches.len());
    for branch in branches {
        let deps = Arc::clone(&deps);
        deps.metrics.active_branches.inc();
        handles.push(tokio::spawn(async move {
            let result = run_branch(&deps, branch.entity_id, branch.branch_log).await;
            deps.metrics.active_branches.dec();
            result
        }));
    }

    let mut summary = ScatterRunSummary {
        branches: handles.len(),
        ..Default::default()
    };
    for handle in handles {
        match handle.await {
            Ok(Ok(clusters)) => summary.clusters_formed += clusters,
            Ok(Err(e)) => {
                tracing::error!(%e, "scatter branch failed");
                summary.branch_errors += 1;
            }
            Err(join_err) => {
                tracing::error!(%join_err, "scatter branch task panicked");
                summary.branch_errors += 1;
            }
        }
    }
    summary
}

/// Runs one full scatter invocation to completion: creates the job
/// collection and root log, fans out one branch per input entity id, and
/// awaits every branch (each of which may itself recurse many cluster
/// layers deep). Returns once every branch has sealed its own logs -
/// callers that want fire-and-forget semantics (the HTTP invocation API)
/// should use [`start_scatter`] followed by a detached [`run_branches`]
/// rather than awaiting this whole function inline.
pub async fn run_scatter<S, C>(
    deps: Arc<PipelineDeps<S, C>>,
    target_entity: &str,
    entity_ids: Vec<EntityId>,
) -> Result<(kg_core::JobCollection, ScatterRunSummary), PipelineError>
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    let (job_collection, branches) =
        start_scatter(&deps, target_entity, entity_ids).await?;
    let summary = run_branches(deps, branches).await;
    Ok((job_collection, summary))
}

/// One scatter branch: extract entities from the input text chunk, dedupe
/// them, then run each surviving entity through cluster -> describe ->
/// recurse. Returns the number of clusters this branch formed.
async fn run_branch<S, C>(
    deps: &PipelineDeps<S, C>,
    entity_id: EntityId,
    extract_log: EntityId,
) -> Result<usize, PipelineError>
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    let writer = LogWriter::new(Arc::clone(&deps.store));

    let entity = match deps.store.get(&entity_id).await {
        Ok(e) => e,
        Err(e) => {
            writer.set_handoffs(extract_log.clone(), vec![]);
            writer.complete(extract_log, LogStatus::Failed, Some(e.to_string()), vec![]);
            return Err(e.into());
        }
    };
    let text = entity
        .properties
        .get("text")
        .and_then(|v| v.as_str())
        .or_else(|| entity.label())
        .unwrap_or_default()
        .to_string();

    let extracted = deps.extractor.extract(&text).await;

    let dedupe_log = writer
        .create(&[extract_log.clone()], &deps.config.dedupe_klados)
        .await?;
    writer.set_handoffs(
        extract_log.clone(),
        vec![Handoff::Invoke {
            outputs: [dedupe_log.clone()],
        }],
    );
    writer.complete(extract_log, LogStatus::Completed, None, vec![]);
    deps.metrics
        .handoffs_recorded
        .get_or_create(&HandoffTypeLabel("invoke".to_string()))
        .inc();

    let mut candidates = Vec::with_capacity(extracted.len());
    for extracted_entity in extracted {
        let id = deps
            .store
            .create_with_relationships(
                &extracted_entity.kind,
                serde_json::json!({
                    "label": extracted_entity.label,
                    "_kg_layer": 0u32,
                })
                .as_object()
                .unwrap()
                .clone(),
                vec![Relationship {
                    predicate: Predicate::ExtractedFrom,
                    peer: entity_id.clone(),
                }],
            )
            .await?;
        candidates.push((id, extracted_entity));
    }

    let kept_ids = deps.deduper.dedupe(candidates).await;

    if kept_ids.is_empty() {
        writer.set_handoffs(dedupe_log.clone(), vec![]);
        writer.complete(dedupe_log, LogStatus::Completed, None, vec![]);
        return Ok(0);
    }

    let mut cluster_log_ids = Vec::with_capacity(kept_ids.len());
    for _ in &kept_ids {
        cluster_log_ids.push(
            writer
                .create(&[dedupe_log.clone()], &deps.config.cluster_klados)
                .await?,
        );
    }
    writer.set_handoffs(
        dedupe_log.clone(),
        vec![Handoff::Scatter {
            outputs: Some(cluster_log_ids.clone()),
            invocations: None,
            delegated: false,
        }],
    );
    writer.complete(dedupe_log, LogStatus::Completed, None, vec![]);
    deps.metrics
        .handoffs_recorded
        .get_or_create(&HandoffTypeLabel("scatter".to_string()))
        .inc();

    let mut handles = Vec::with_capacity(kept_ids.len());
    for (kept_id, cluster_log) in kept_ids.into_iter().zip(cluster_log_ids) {
        let store = Arc::clone(&deps.store);
        let search = Arc::clone(&deps.search);
        let llm = Arc::clone(&deps.llm);
        let metrics = Arc::clone(&deps.metrics);
        let config = deps.config.clone();
        handles.push(tokio::spawn(async move {
            run_cluster_recursion(store, search, llm, metrics, config, kept_id, 0, cluster_log, 0)
                .await
        }));
    }

    let mut clusters_formed = 0;
    for handle in handles {
        if matches!(handle.await, Ok(Ok(true))) {
            clusters_formed += 1;
        }
    }
    Ok(clusters_formed)
}

/// Drives one entity through the cluster worker, then (if it survives as a
/// cluster leader) through describe and the next recursion at `layer + 1`.
/// Returns `true` if this call formed a surviving cluster (i.e. the
/// terminal branch of the recursion, not an intermediate layer).
///
/// Written as a plain fn returning a boxed future (rather than `async fn`)
/// because it calls itself - an `async fn` can't recurse directly, its
/// desugared future type would have to contain itself.
#[allow(clippy::too_many_arguments)]
fn run_cluster_recursion<S, C>(
    store: Arc<S>,
    search: Arc<C>,
    llm: Arc<LlmClient>,
    metrics: Arc<WorkerMetrics>,
    config: PipelineConfig,
    entity_id: EntityId,
    layer: u32,
    cluster_log: EntityId,
    depth: u32,
) -> Pin<Box<dyn Future<Output = Result<bool, PipelineError>> + Send>>
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    Box::pin(async move {
        let writer = LogWriter::new(Arc::clone(&store));

        if depth >= config.max_recursion_depth {
            metrics.recursion_cap_hits_total.inc();
            writer.set_handoffs(cluster_log.clone(), vec![]);
            writer.complete(
                cluster_log,
                LogStatus::Failed,
                Some("recursion safety cap reached".to_string()),
                vec![],
            );
            return Ok(false);
        }

        let rng = StdRng::from_entropy();
        let timers = RealTimers::new(rng);
        let worker = ClusterWorker::new(
            Arc::clone(&store),
            Arc::clone(&search),
            timers,
            config.cluster.clone(),
        );

        let outcome = match worker.run(&entity_id, layer).await {
            Ok(outcome) => outcome,
            Err(e) => {
                writer.set_handoffs(cluster_log.clone(), vec![]);
                writer.complete(cluster_log, LogStatus::Failed, Some(e.to_string()), vec![]);
                return Ok(false);
            }
        };

        match outcome {
            ClusterOutcome::Empty { final_state } => {
                metrics
                    .cluster_outcomes
                    .get_or_create(&ClusterOutcomeLabel(outcome_label(final_state).to_string()))
                    .inc();
                writer.set_handoffs(cluster_log.clone(), vec![]);
                writer.complete(cluster_log, LogStatus::Completed, None, vec![]);
                Ok(false)
            }
            ClusterOutcome::Terminated { cluster_leader } => {
                metrics
                    .cluster_outcomes
                    .get_or_create(&ClusterOutcomeLabel("terminated".to_string()))
                    .inc();

                let describe_log = writer
                    .create(&[cluster_log.clone()], &config.describe_klados)
                    .await?;
                writer.set_handoffs(
                    cluster_log.clone(),
                    vec![Handoff::Invoke {
                        outputs: [describe_log.clone()],
                    }],
                );
                writer.complete(cluster_log, LogStatus::Completed, None, vec![]);

                let describe = DescribeWorker::new(
                    Arc::clone(&store),
                    Arc::clone(&llm),
                    config.describe_max_retries,
                );
                let outcome = match describe.run(&cluster_leader).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        metrics.describe_failures_total.inc();
                        writer.set_handoffs(describe_log.clone(), vec![]);
                        writer.complete(describe_log, LogStatus::Failed, Some(e.to_string()), vec![]);
                        return Ok(false);
                    }
                };
                metrics
                    .describe_retries_total
                    .inc_by(outcome.retries_used as u64);

                let next_cluster_log = writer
                    .create(&[describe_log.clone()], &config.cluster_klados)
                    .await?;
                writer.set_handoffs(
                    describe_log.clone(),
                    vec![Handoff::Invoke {
                        outputs: [next_cluster_log.clone()],
                    }],
                );
                writer.complete(describe_log, LogStatus::Completed, None, vec![]);

                run_cluster_recursion(
                    store,
                    search,
                    llm,
                    metrics,
                    config,
                    cluster_leader,
                    layer + 1,
                    next_cluster_log,
                    depth + 1,
                )
                .await?;
                Ok(true)
            }
        }
    })
}

fn outcome_label(state: ClusterState) -> &'static str {
    match state {
        ClusterState::Joined => "joined",
        ClusterState::Dissolved => "dissolved",
        _ => "empty",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kg_core::FakeEntityStore;
    use kg_describe::LlmProvider;
    use kg_scatter::collaborators::{FingerprintDeduper, HeuristicExtractor};

    struct NoHitsSearch;
    #[async_trait]
    impl SearchClient for NoHitsSearch {
        async fn search(
            &self,
            _query: &str,
            _layer: u32,
            _limit: Option<usize>,
        ) -> Result<Vec<kg_search::SearchHit>, kg_search::SearchError> {
            Ok(vec![])
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            extract_klados: "extract".to_string(),
            dedupe_klados: "dedupe".to_string(),
            cluster_klados: "cluster".to_string(),
            describe_klados: "describe".to_string(),
            cluster: ClusterWorkerConfig {
                search_k: 5,
                recheck_delay: Duration::from_millis(1),
                follower_wait_min: Duration::from_millis(1),
                follower_wait_max: Duration::from_millis(2),
            },
            max_recursion_depth: 10,
            describe_max_retries: 3,
        }
    }

    #[tokio::test]
    async fn branch_with_no_extracted_entities_completes_with_zero_clusters() {
        let store = Arc::new(FakeEntityStore::new());
        let entity_id = store
            .create_with_relationships(
                EntityKind::TEXT_CHUNK,
                serde_json::json!({"text": "lowercase only text"}).as_object().unwrap().clone(),
                vec![],
            )
            .await
            .unwrap();

        let deps = Arc::new(PipelineDeps {
            store: Arc::clone(&store),
            search: Arc::new(NoHitsSearch),
            llm: Arc::new(LlmClient::new(LlmProvider::OpenAI {
                api_key: "test-key".to_string(),
                model: "gpt-4o".to_string(),
                base_url: "http://127.0.0.1:0".to_string(),
            })),
            extractor: Arc::new(HeuristicExtractor),
            deduper: Arc::new(FingerprintDeduper),
            metrics: Arc::new(WorkerMetrics::new()),
            config: test_config(),
        });

        let (_, summary) = run_scatter(deps, "target", vec![entity_id]).await.unwrap();
        assert_eq!(summary.branches, 1);
        assert_eq!(summary.clusters_formed, 0);
        assert_eq!(summary.branch_errors, 0);
    }
}
