//! Semantic search collaborator: given a query and a layer, returns the
//! nearest candidate peers and their similarity scores. The cluster worker
//! uses this both for the initial search and for the unrestricted-by-K
//! semantic fallback.

use async_trait::async_trait;
use kg_core::EntityId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("transport error calling search service: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("search service returned status {status}: {body}")]
    Status { status: reqwest::StatusCode, body: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub peer_id: EntityId,
    pub score: f64,
}

#[async_trait]
pub trait SearchClient: Send + Sync {
    /// `limit = None` means unrestricted - used by the semantic fallback,
    /// which re-queries without the normal top-K cap.
    async fn search(
        &self,
        query: &str,
        layer: u32,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, SearchError>;
}

pub struct HttpSearchClient {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpSearchClient {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    layer: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<usize>,
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn search(
        &self,
        query: &str,
        layer: u32,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let url = self.base_url.join("search").expect("valid relative path");
        let resp = self
            .client
            .post(url)
            .json(&SearchRequest { query, layer, limit })
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(SearchError::Status { status, body });
        }
        Ok(resp.json::<Vec<SearchHit>>().await?)
    }
}

/// Fixed-result stand-in used by unit tests and the simulator.
pub struct FakeSearchClient {
    pub hits: Vec<SearchHit>,
}

#[async_trait]
impl SearchClient for FakeSearchClient {
    async fn search(
        &self,
        _query: &str,
        _layer: u32,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        match limit {
            Some(k) => Ok(self.hits.iter().take(k).cloned().collect()),
            None => Ok(self.hits.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn search_deserializes_hits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vec![SearchHit {
                peer_id: "e1".to_string(),
                score: 0.92,
            }]))
            .mount(&server)
            .await;

        let client = HttpSearchClient::new(format!("{}/", server.uri()).parse().unwrap());
        let hits = client.search("some query", 0, Some(5)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].peer_id, "e1");
    }

    #[tokio::test]
    async fn search_surfaces_non_success_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/search"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpSearchClient::new(format!("{}/", server.uri()).parse().unwrap());
        let err = client.search("q", 0, None).await.unwrap_err();
        assert!(matches!(err, SearchError::Status { .. }));
    }

    #[tokio::test]
    async fn fake_client_respects_limit() {
        let client = FakeSearchClient {
            hits: vec![
                SearchHit { peer_id: "a".into(), score: 0.9 },
                SearchHit { peer_id: "b".into(), score: 0.8 },
            ],
        };
        let hits = client.search("q", 0, Some(1)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].peer_id, "a");
    }
}
