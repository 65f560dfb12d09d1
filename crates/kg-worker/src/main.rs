//! kg-worker binary - runs one scatter invocation end to end (scatter ->
//! extract -> dedupe -> cluster -> describe -> recurse) against the
//! entity-store/search collaborators configured in the environment, serving
//! health/metrics alongside it. Takes the place of the teacher's NATS job
//! loop: this system's job model is the handoff graph itself, not a queue,
//! so there is nothing to poll - the worker drives its one job to
//! completion and exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use kg_core::config::ClusterConfig;
use kg_worker::health::{self, HealthState};
use kg_worker::pipeline;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ClusterConfig::from_env()?;
    let entity_ids = input_entity_ids()?;
    let target_entity =
        std::env::var("KG_TARGET_ENTITY").unwrap_or_else(|_| "kg-worker-run".to_string());

    info!(count = entity_ids.len(), "starting scatter invocation");

    let deps = pipeline::build_deps(&config)?;

    let ready = Arc::new(AtomicBool::new(false));
    let health_state = Arc::new(HealthState {
        metrics: (*deps.metrics).clone(),
        ready: Arc::clone(&ready),
    });
    let metrics_port = config.metrics_port;
    let health_router = health::health_router(health_state);
    tokio::spawn(async move {
        let addr = format!("0.0.0.0:{metrics_port}");
        info!(%addr, "health/metrics server listening");
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, health_router).await.unwrap();
    });
    ready.store(true, Ordering::Relaxed);

    let (job_collection, summary) =
        pipeline::run_scatter(Arc::clone(&deps), &target_entity, entity_ids).await?;

    info!(
        branches = summary.branches,
        clusters_formed = summary.clusters_formed,
        branch_errors = summary.branch_errors,
        job_collection = %job_collection.id,
        "scatter invocation finished fanning out; branches have completed"
    );

    let observer = kg_observer::Observer::new(Arc::clone(&deps.store));
    let status = observer
        .poll(&job_collection)
        .await
        .context("polling completion oracle")?;
    info!(?status, "final workflow-tree status");

    Ok(())
}

/// Reads the scatter invocation's input entity ids from `KG_INPUT_ENTITY_IDS`
/// (comma-separated) - the worker-binary equivalent of the invocation
/// request's `input: {entity_ids: [...]}` body (Section 6).
fn input_entity_ids() -> Result<Vec<String>> {
    let raw = std::env::var("KG_INPUT_ENTITY_IDS")
        .context("KG_INPUT_ENTITY_IDS required (comma-separated entity ids)")?;
    let ids: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if ids.is_empty() {
        anyhow::bail!("KG_INPUT_ENTITY_IDS must contain at least one entity id");
    }
    Ok(ids)
}
