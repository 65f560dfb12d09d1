//! REST invocation API for the recursive hierarchical clustering
//! coordinator. Accepts an invocation request, starts the scatter pipeline
//! in the background, and returns immediately per the workflow engine's
//! "no retries; failure to start is surfaced immediately" contract (Section
//! 4.1) - the caller polls `/jobs/:id` (backed by the completion oracle) for
//! the eventual result rather than awaiting the whole run inline.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use uuid::Uuid;

use kg_core::store::EntityStore;
use kg_core::{EntityId, JobCollection};
use kg_observer::{Observer, TreeStatus};
use kg_search::SearchClient;
use kg_worker::pipeline::{self, PipelineDeps};

pub struct AppState<S: EntityStore, C: SearchClient> {
    pub deps: Arc<PipelineDeps<S, C>>,
    pub observer: Observer<S>,
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl<S: EntityStore + 'static, C: SearchClient + 'static> AppState<S, C> {
    pub fn new(deps: Arc<PipelineDeps<S, C>>) -> Self {
        let observer = Observer::new(Arc::clone(&deps.store));
        Self {
            deps,
            observer,
            jobs: RwLock::new(HashMap::new()),
        }
    }
}

#[derive(Clone)]
struct JobRecord {
    job_collection: JobCollection,
}

#[derive(Debug, Deserialize)]
pub struct InvokeInput {
    pub entity_ids: Vec<EntityId>,
}

#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    #[serde(rename = "rhizaId")]
    #[allow(dead_code)]
    pub rhiza_id: String,
    #[serde(rename = "targetEntity")]
    pub target_entity: String,
    #[serde(rename = "targetCollection")]
    #[allow(dead_code)]
    pub target_collection: Option<String>,
    pub input: InvokeInput,
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct InvokeResponse {
    pub status: &'static str,
    pub job_id: Uuid,
    pub job_collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn router<S, C>(state: Arc<AppState<S, C>>) -> Router
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/invoke", post(invoke::<S, C>))
        .route("/workflows/:job_id/status", get(job_status::<S, C>))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// `POST /invoke` - Section 6's invocation request. Validation failures
/// (missing `confirm`, empty `entity_ids`) are surfaced synchronously with
/// `status: "error"`; once the scatter coordinator has created its job
/// collection and root log, the branches run in a detached task and this
/// handler returns `status: "started"` without waiting on them.
async fn invoke<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Json(req): Json<InvokeRequest>,
) -> Result<Json<InvokeResponse>, (StatusCode, Json<InvokeResponse>)>
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    let job_id = Uuid::new_v4();

    if !req.confirm {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(InvokeResponse {
                status: "error",
                job_id,
                job_collection: None,
                error: Some("confirm must be true".to_string()),
            }),
        ));
    }
    if req.input.entity_ids.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(InvokeResponse {
                status: "error",
                job_id,
                job_collection: None,
                error: Some("input.entity_ids must not be empty".to_string()),
            }),
        ));
    }

    let (job_collection, branches) = match pipeline::start_scatter(
        &state.deps,
        &req.target_entity,
        req.input.entity_ids.clone(),
    )
    .await
    {
        Ok(started) => started,
        Err(e) => {
            error!(%e, "invocation failed to start");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(InvokeResponse {
                    status: "error",
                    job_id,
                    job_collection: None,
                    error: Some(e.to_string()),
                }),
            ));
        }
    };

    state.jobs.write().await.insert(
        job_id,
        JobRecord {
            job_collection: job_collection.clone(),
        },
    );

    let deps = Arc::clone(&state.deps);
    tokio::spawn(async move {
        let summary = pipeline::run_branches(deps, branches).await;
        info!(
            branches = summary.branches,
            clusters_formed = summary.clusters_formed,
            branch_errors = summary.branch_errors,
            "background scatter run complete"
        );
    });

    Ok(Json(InvokeResponse {
        status: "started",
        job_id,
        job_collection: Some(job_collection.id),
        error: None,
    }))
}

#[derive(Debug, Serialize)]
struct JobStatusResponse {
    job_id: Uuid,
    job_collection: String,
    is_complete: bool,
}

async fn job_status<S, C>(
    State(state): State<Arc<AppState<S, C>>>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, (StatusCode, String)>
where
    S: EntityStore + 'static,
    C: SearchClient + 'static,
{
    let record = {
        let jobs = state.jobs.read().await;
        jobs.get(&job_id)
            .cloned()
            .ok_or((StatusCode::NOT_FOUND, "job not found".to_string()))?
    };

    let status = state
        .observer
        .poll(&record.job_collection)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(JobStatusResponse {
        job_id,
        job_collection: record.job_collection.id,
        is_complete: status == TreeStatus::Complete,
    }))
}
