//! kg-cli - command-line interface for workflow registration and scatter
//! invocation.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "kg-cli")]
#[command(about = "Register workflows and invoke the clustering coordinator")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the action that would be taken and exit without mutating anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register (or update) a workflow definition with the Arke network
    Register {
        /// Path to the workflow definition JSON file
        #[arg(short, long)]
        workflow: PathBuf,

        /// Name used in the local state file and registration request
        #[arg(short, long)]
        name: String,
    },

    /// Invoke the scatter coordinator for a set of entity ids
    Invoke {
        /// Rhiza handle to invoke (defaults to SCATTER_KG_RHIZA)
        #[arg(long)]
        rhiza_id: Option<String>,

        /// Target entity label for the job collection
        #[arg(long)]
        target_entity: String,

        /// Target collection id, if the caller already has one
        #[arg(long)]
        target_collection: Option<String>,

        /// Comma-separated entity ids to fan out over
        #[arg(long)]
        entity_ids: String,

        /// Base URL of a running kg-server (e.g. http://localhost:3900)
        #[arg(long, default_value = "http://localhost:3900")]
        server: String,
    },

    /// Poll the completion oracle for a job's status
    Status {
        /// Job id returned by `invoke`
        job_id: String,

        /// Base URL of a running kg-server
        #[arg(long, default_value = "http://localhost:3900")]
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Register { workflow, name } => register(&workflow, &name, cli.dry_run).await,
        Commands::Invoke {
            rhiza_id,
            target_entity,
            target_collection,
            entity_ids,
            server,
        } => {
            let entity_ids: Vec<String> = entity_ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if entity_ids.is_empty() {
                bail!("--entity-ids must contain at least one id");
            }
            invoke(
                rhiza_id,
                target_entity,
                target_collection,
                entity_ids,
                &server,
                cli.dry_run,
            )
            .await
        }
        Commands::Status { job_id, server } => status(&job_id, &server).await,
    }
}

/// State persisted next to the CLI invocation per spec.md's `.rhiza-state-
/// <workflow>-<network>` file: read at registration to decide create vs.
/// update, rewritten with whatever the registration response returns.
#[derive(Debug, Serialize, Deserialize, Clone)]
struct RhizaState {
    rhiza_id: String,
    collection_id: String,
    version: u32,
}

fn state_file_path(workflow: &str, network: &str) -> PathBuf {
    PathBuf::from(format!(".rhiza-state-{workflow}-{network}"))
}

async fn register(workflow_path: &std::path::Path, name: &str, dry_run: bool) -> Result<()> {
    let api_base =
        std::env::var("ARKE_API_BASE").context("ARKE_API_BASE required for registration")?;
    let user_key = std::env::var("ARKE_USER_KEY").context("ARKE_USER_KEY required for registration")?;
    let network = std::env::var("ARKE_NETWORK").context("ARKE_NETWORK required for registration")?;

    let definition: Value = kg_core::workflow_def::load(workflow_path)
        .with_context(|| format!("loading workflow definition {}", workflow_path.display()))?;

    let state_path = state_file_path(name, &network);
    let existing = read_state(&state_path)?;

    if dry_run {
        match &existing {
            Some(state) => println!(
                "would UPDATE rhiza '{}' (collection {}, version {}) at {}",
                state.rhiza_id, state.collection_id, state.version, api_base
            ),
            None => println!("would CREATE rhiza '{name}' at {api_base}"),
        }
        println!("{}", serde_json::to_string_pretty(&definition)?);
        return Ok(());
    }

    let client = reqwest::Client::new();
    let state = match existing {
        Some(state) => {
            info!(rhiza_id = %state.rhiza_id, "updating existing rhiza registration");
            let url = format!("{}/rhizas/{}", api_base.trim_end_matches('/'), state.rhiza_id);
            let resp = client
                .put(&url)
                .bearer_auth(&user_key)
                .json(&serde_json::json!({ "name": name, "definition": definition }))
                .send()
                .await
                .context("sending rhiza update request")?;
            parse_registration_response(resp).await?
        }
        None => {
            info!(%name, "registering new rhiza");
            let url = format!("{}/rhizas", api_base.trim_end_matches('/'));
            let resp = client
                .post(&url)
                .bearer_auth(&user_key)
                .json(&serde_json::json!({ "name": name, "definition": definition }))
                .send()
                .await
                .context("sending rhiza registration request")?;
            parse_registration_response(resp).await?
        }
    };

    write_state(&state_path, &state)?;
    println!(
        "registered rhiza '{}' (collection {}, version {})",
        state.rhiza_id, state.collection_id, state.version
    );
    Ok(())
}

async fn parse_registration_response(resp: reqwest::Response) -> Result<RhizaState> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("registration request failed with status {status}: {body}");
    }
    resp.json::<RhizaState>()
        .await
        .context("decoding registration response")
}

fn read_state(path: &std::path::Path) -> Result<Option<RhizaState>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading state file {}", path.display()))?;
    let state: RhizaState = serde_json::from_str(&raw)
        .with_context(|| format!("parsing state file {}", path.display()))?;
    Ok(Some(state))
}

fn write_state(path: &std::path::Path, state: &RhizaState) -> Result<()> {
    let raw = serde_json::to_string_pretty(state)?;
    std::fs::write(path, raw).with_context(|| format!("writing state file {}", path.display()))
}

#[derive(Debug, Serialize)]
struct InvokeInput {
    entity_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct InvokeRequest {
    #[serde(rename = "rhizaId")]
    rhiza_id: String,
    #[serde(rename = "targetEntity")]
    target_entity: String,
    #[serde(rename = "targetCollection")]
    target_collection: Option<String>,
    input: InvokeInput,
    confirm: bool,
}

#[derive(Debug, Deserialize)]
struct InvokeResponse {
    status: String,
    job_id: String,
    job_collection: Option<String>,
    error: Option<String>,
}

async fn invoke(
    rhiza_id: Option<String>,
    target_entity: String,
    target_collection: Option<String>,
    entity_ids: Vec<String>,
    server: &str,
    dry_run: bool,
) -> Result<()> {
    let rhiza_id = match rhiza_id {
        Some(id) => id,
        None => std::env::var("SCATTER_KG_RHIZA")
            .context("--rhiza-id or SCATTER_KG_RHIZA required")?,
    };

    let request = InvokeRequest {
        rhiza_id,
        target_entity,
        target_collection,
        input: InvokeInput { entity_ids },
        confirm: true,
    };

    if dry_run {
        println!("would POST {}/invoke with body:", server.trim_end_matches('/'));
        println!("{}", serde_json::to_string_pretty(&request)?);
        return Ok(());
    }

    let client = reqwest::Client::new();
    let url = format!("{}/invoke", server.trim_end_matches('/'));
    let resp = client
        .post(&url)
        .json(&request)
        .send()
        .await
        .context("sending invocation request")?;

    let body: InvokeResponse = resp.json().await.context("decoding invocation response")?;

    if body.status == "error" {
        bail!(
            "invocation failed: {}",
            body.error.unwrap_or_else(|| "unknown error".to_string())
        );
    }

    println!("status: {}", body.status);
    println!("job_id: {}", body.job_id);
    if let Some(collection) = body.job_collection {
        println!("job_collection: {collection}");
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    job_id: String,
    job_collection: String,
    is_complete: bool,
}

async fn status(job_id: &str, server: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/workflows/{}/status",
        server.trim_end_matches('/'),
        job_id
    );
    let resp = client
        .get(&url)
        .send()
        .await
        .context("sending status request")?;

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("status request failed with {status}: {body}");
    }

    let body: JobStatusResponse = resp.json().await.context("decoding status response")?;
    println!("job_id: {}", body.job_id);
    println!("job_collection: {}", body.job_collection);
    println!("complete: {}", body.is_complete);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".rhiza-state-demo-test");
        assert!(read_state(&path).unwrap().is_none());

        let state = RhizaState {
            rhiza_id: "r1".to_string(),
            collection_id: "c1".to_string(),
            version: 1,
        };
        write_state(&path, &state).unwrap();

        let loaded = read_state(&path).unwrap().unwrap();
        assert_eq!(loaded.rhiza_id, "r1");
        assert_eq!(loaded.collection_id, "c1");
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn state_file_path_includes_workflow_and_network() {
        let path = state_file_path("demo", "test");
        assert_eq!(path.to_str().unwrap(), ".rhiza-state-demo-test");
    }
}
