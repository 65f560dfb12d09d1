//! Describe worker: one call per surviving cluster. Calls the LLM, parses
//! JSON with retry-with-feedback, writes the description, and emits the
//! handoff that feeds the next recursion of the cluster worker.

pub mod llm;
pub mod prompt;

use std::sync::Arc;

use kg_core::store::{AdditiveUpdate, EntityStore};
use kg_core::EntityId;
use serde::Deserialize;
use thiserror::Error;

pub use llm::{LlmClient, LlmProvider};

#[derive(Debug, Error)]
pub enum DescribeError {
    #[error("entity store error: {0}")]
    Store(#[from] kg_core::StoreError),
    #[error("LLM call failed: {0}")]
    Llm(#[from] anyhow::Error),
    #[error("LLM returned invalid JSON after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClusterDescription {
    pub title: String,
    pub label: String,
    pub description: String,
}

pub struct DescribeOutcome {
    pub cluster_leader: EntityId,
    pub description: ClusterDescription,
    /// Number of malformed-JSON retries consumed before success - surfaced
    /// so the caller can record it on the log's `messages`.
    pub retries_used: u32,
}

pub struct DescribeWorker<S: EntityStore> {
    store: Arc<S>,
    llm: Arc<LlmClient>,
    max_retries: u32,
}

impl<S: EntityStore> DescribeWorker<S> {
    pub fn new(store: Arc<S>, llm: Arc<LlmClient>, max_retries: u32) -> Self {
        Self {
            store,
            llm,
            max_retries,
        }
    }

    pub async fn run(&self, cluster_leader_id: &str) -> Result<DescribeOutcome, DescribeError> {
        let member_ids = self.store.members_of(cluster_leader_id).await?;
        let members = self.store.batch_get(&member_ids).await?;
        let member_labels: Vec<(String, Option<String>)> = members
            .iter()
            .map(|m| {
                (
                    m.label().unwrap_or(m.id.as_str()).to_string(),
                    m.description().map(|s| s.to_string()),
                )
            })
            .collect();

        let base_prompt = prompt::build_user_prompt(&member_labels);
        let (description, retries_used) = self.generate_with_retry(&base_prompt).await?;

        self.store
            .additive_update(vec![AdditiveUpdate {
                entity_id: cluster_leader_id.to_string(),
                properties: serde_json::json!({
                    "title": description.title,
                    "label": description.label,
                    "description": description.description,
                })
                .as_object()
                .unwrap()
                .clone(),
                relationships: vec![],
            }])
            .await?;

        Ok(DescribeOutcome {
            cluster_leader: cluster_leader_id.to_string(),
            description,
            retries_used,
        })
    }

    async fn generate_with_retry(
        &self,
        base_prompt: &str,
    ) -> Result<(ClusterDescription, u32), DescribeError> {
        let mut user_prompt = base_prompt.to_string();
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            let response = self
                .llm
                .generate(prompt::SYSTEM_PROMPT, &user_prompt)
                .await?;
            match parse_description(&response) {
                Ok(desc) => return Ok((desc, attempt)),
                Err(parse_error) => {
                    tracing::warn!(attempt, %parse_error, "describe worker: malformed LLM JSON");
                    last_error = parse_error.clone();
                    user_prompt = prompt::append_retry_feedback(base_prompt, &parse_error, &response);
                }
            }
        }

        Err(DescribeError::ExhaustedRetries {
            attempts: self.max_retries,
            last_error,
        })
    }
}

fn parse_description(response: &str) -> Result<ClusterDescription, String> {
    let trimmed = response.trim();
    let json_slice = extract_json_object(trimmed).unwrap_or(trimmed);
    serde_json::from_str(json_slice).map_err(|e| e.to_string())
}

/// LLMs frequently wrap JSON in prose or code fences; take the first
/// balanced `{...}` span as a best-effort extraction before parsing.
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0i32;
    for (i, c) in s[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let resp = r#"{"title": "Whaling crew", "label": "Pequod crew", "description": "Ahab's crew"}"#;
        let desc = parse_description(resp).unwrap();
        assert_eq!(desc.title, "Whaling crew");
    }

    #[test]
    fn extracts_json_wrapped_in_prose() {
        let resp = "Sure, here you go:\n```json\n{\"title\":\"a\",\"label\":\"b\",\"description\":\"c\"}\n```";
        let desc = parse_description(resp).unwrap();
        assert_eq!(desc.label, "b");
    }

    #[test]
    fn rejects_malformed_json() {
        let resp = "{\"title\": \"a\", \"label\": ";
        assert!(parse_description(resp).is_err());
    }
}
