//! Environment-driven configuration shared by the worker, server and CLI
//! binaries.

use anyhow::{Context, Result};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub arke_api_base: url::Url,
    pub arke_user_key: String,
    pub arke_network: String,

    pub scatter_klados: String,
    pub extract_klados: String,
    pub dedupe_klados: String,
    pub cluster_klados: String,
    pub describe_klados: String,
    pub scatter_kg_rhiza: String,

    pub search_k: usize,
    pub recheck_delay_ms: u64,
    pub follower_wait_min_ms: u64,
    pub follower_wait_max_ms: u64,
    pub max_recursion_depth: u32,
    pub describe_max_retries: u32,
    pub observer_poll_interval_secs: u64,
    pub metrics_port: u16,
}

impl ClusterConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            arke_api_base: std::env::var("ARKE_API_BASE")
                .context("ARKE_API_BASE required")?
                .parse()
                .context("invalid ARKE_API_BASE")?,
            arke_user_key: std::env::var("ARKE_USER_KEY").context("ARKE_USER_KEY required")?,
            arke_network: std::env::var("ARKE_NETWORK").context("ARKE_NETWORK required")?,

            scatter_klados: std::env::var("SCATTER_KLADOS").context("SCATTER_KLADOS required")?,
            extract_klados: std::env::var("EXTRACT_KLADOS").context("EXTRACT_KLADOS required")?,
            dedupe_klados: std::env::var("DEDUPE_KLADOS").context("DEDUPE_KLADOS required")?,
            cluster_klados: std::env::var("CLUSTER_KLADOS").context("CLUSTER_KLADOS required")?,
            describe_klados: std::env::var("DESCRIBE_KLADOS")
                .context("DESCRIBE_KLADOS required")?,
            scatter_kg_rhiza: std::env::var("SCATTER_KG_RHIZA")
                .context("SCATTER_KG_RHIZA required")?,

            search_k: std::env::var("SEARCH_K")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("invalid SEARCH_K")?,
            recheck_delay_ms: std::env::var("RECHECK_DELAY_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .context("invalid RECHECK_DELAY_MS")?,
            follower_wait_min_ms: std::env::var("FOLLOWER_WAIT_MIN_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()
                .context("invalid FOLLOWER_WAIT_MIN_MS")?,
            follower_wait_max_ms: std::env::var("FOLLOWER_WAIT_MAX_MS")
                .unwrap_or_else(|_| "90000".to_string())
                .parse()
                .context("invalid FOLLOWER_WAIT_MAX_MS")?,
            max_recursion_depth: std::env::var("MAX_RECURSION_DEPTH")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("invalid MAX_RECURSION_DEPTH")?,
            describe_max_retries: std::env::var("DESCRIBE_MAX_RETRIES")
                .unwrap_or_else(|_| "3".to_string())
                .parse()
                .context("invalid DESCRIBE_MAX_RETRIES")?,
            observer_poll_interval_secs: std::env::var("OBSERVER_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("invalid OBSERVER_POLL_INTERVAL_SECS")?,
            metrics_port: std::env::var("METRICS_PORT")
                .unwrap_or_else(|_| "9090".to_string())
                .parse()
                .context("invalid METRICS_PORT")?,
        })
    }
}
