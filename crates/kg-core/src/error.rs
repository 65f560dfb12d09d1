//! Typed errors for the HTTP collaborator clients (store, search, LLM all
//! share this shape - see `kg_core::backoff` for the retry policy that acts
//! on the `Transport` variant).

use thiserror::Error;

use crate::backoff::Retryable;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transport error calling entity store: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("entity store returned status {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },

    #[error("failed to decode entity store response: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("entity not found: {0}")]
    NotFound(String),
}

impl Retryable for StoreError {
    /// Transient transport failures and 5xx responses are retried by the
    /// caller; 4xx and decode errors are not.
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transport(e) => !e.is_builder() && !e.is_request(),
            StoreError::Status { status, .. } => status.is_server_error(),
            StoreError::Decode(_) | StoreError::NotFound(_) => false,
        }
    }
}
