//! End-to-end retry-with-feedback behaviour against a mocked OpenAI-style
//! endpoint: malformed JSON twice, then a valid response.

use std::sync::Arc;

use kg_core::model::{EntityKind, Predicate, Relationship};
use kg_core::{Entity, EntityStore, FakeEntityStore};
use kg_describe::{DescribeWorker, LlmClient, LlmProvider};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn chat_completion_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{ "message": { "content": content } }]
    })
}

#[tokio::test]
async fn recovers_after_two_malformed_responses() {
    let server = MockServer::start().await;

    let responses = Arc::new(std::sync::Mutex::new(vec![
        "not json at all".to_string(),
        "{\"title\": \"incomplete\"".to_string(),
        json!({"title": "Pequod crew", "label": "Pequod crew", "description": "Ahab's crew"})
            .to_string(),
    ]));

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(move |_: &Request| {
            let mut guard = responses.lock().unwrap();
            let content = guard.remove(0);
            ResponseTemplate::new(200).set_body_json(chat_completion_body(&content))
        })
        .mount(&server)
        .await;

    let store = Arc::new(FakeEntityStore::new());
    let mut member = Entity {
        id: "member1".to_string(),
        kind: EntityKind::new(EntityKind::TEXT_CHUNK),
        properties: json!({"label": "Ahab"}).as_object().unwrap().clone(),
        layer: Some(0),
        relationships: Default::default(),
    };
    member.relationships.insert(Relationship {
        predicate: Predicate::SummarizedBy,
        peer: "leader1".to_string(),
    });
    store.seed(member);
    store.seed(Entity {
        id: "leader1".to_string(),
        kind: EntityKind::new(EntityKind::CLUSTER_LEADER),
        properties: Default::default(),
        layer: Some(1),
        relationships: Default::default(),
    });

    let llm = Arc::new(LlmClient::new(LlmProvider::OpenAI {
        api_key: "test".to_string(),
        model: "gpt-4o".to_string(),
        base_url: server.uri(),
    }));

    let worker = DescribeWorker::new(Arc::clone(&store), llm, 3);
    let outcome = worker.run("leader1").await.unwrap();

    assert_eq!(outcome.retries_used, 2);
    assert_eq!(outcome.description.title, "Pequod crew");

    let updated = store.get("leader1").await.unwrap();
    assert_eq!(updated.label(), Some("Pequod crew"));
}

#[tokio::test]
async fn fails_hard_after_exhausting_retries() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_completion_body("never valid json")))
        .mount(&server)
        .await;

    let store = Arc::new(FakeEntityStore::new());
    store.seed(Entity {
        id: "leader1".to_string(),
        kind: EntityKind::new(EntityKind::CLUSTER_LEADER),
        properties: Default::default(),
        layer: Some(1),
        relationships: Default::default(),
    });

    let llm = Arc::new(LlmClient::new(LlmProvider::OpenAI {
        api_key: "test".to_string(),
        model: "gpt-4o".to_string(),
        base_url: server.uri(),
    }));

    let worker = DescribeWorker::new(Arc::clone(&store), llm, 3);
    let result = worker.run("leader1").await;
    assert!(matches!(
        result,
        Err(kg_describe::DescribeError::ExhaustedRetries { attempts: 3, .. })
    ));
}
