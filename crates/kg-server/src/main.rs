//! kg-server binary - builds the real HTTP-backed dependencies and serves
//! the invocation API defined in `kg_server::router`.

use std::sync::Arc;

use kg_core::config::ClusterConfig;
use kg_worker::pipeline;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ClusterConfig::from_env()?;
    let deps = pipeline::build_deps(&config)?;
    let state = Arc::new(kg_server::AppState::new(deps));
    let app = kg_server::router(state);

    let addr = std::env::var("KG_SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:3900".to_string());
    info!(%addr, "starting kg-server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
