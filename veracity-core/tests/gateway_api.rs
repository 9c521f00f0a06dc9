//! HTTP gateway driven end to end with scripted collaborators.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;
use veracity_core::embeddings::LocalEmbedder;
use veracity_core::error::ProviderError;
use veracity_core::gateway::router;
use veracity_core::llm::{CompletionRequest, LlmClient, MockLlmProvider};
use veracity_core::rate_limit::ResourcePools;
use veracity_core::research::crawler::StaticFetcher;
use veracity_core::research::search::{SearchCoordinator, SearchProvider, StaticSearch};
use veracity_core::retry::{ProviderChain, RetryPolicy};
use veracity_core::{Pipeline, ResearchEngine, SessionStore, VeracityConfig};

const PAGE_URL: &str = "https://library.example.edu/sleep-memory";
const CLAIM: &str = "Sleep deprivation impairs memory consolidation.";
const PAGE_TEXT: &str = "Sleep deprivation impairs memory consolidation. In a controlled study \
    forty students were kept awake overnight before recall tests and performed markedly worse than \
    rested peers on word-pair tasks the following afternoon, even after a recovery nap.";

fn answer(request: &CompletionRequest) -> Result<String, ProviderError> {
    let prompt = &request.prompt;
    let reply = if prompt.contains("executive summary") {
        json!({"summary": "Sleep loss hurts recall."})
    } else if prompt.contains("Premise:") {
        json!({"label": "neutral", "entailment": 0.1, "contradiction": 0.1})
    } else if let Some(rest) = prompt.split("Source [").nth(1) {
        let source_id = rest.split(']').next().unwrap_or_default();
        json!({"claims": [{
            "source_id": source_id,
            "text": CLAIM,
            "confidence": 0.9,
            "entities": ["sleep", "memory"],
            "stance": "positive"
        }]})
    } else {
        return Err(ProviderError::Request {
            provider: "mock".into(),
            message: "unexpected prompt".into(),
        });
    };
    Ok(reply.to_string())
}

fn engine() -> Arc<ResearchEngine> {
    let mut config = VeracityConfig::default();
    config.curation.min_relevance = 0.05;
    config.concurrency.domain_min_interval_ms = 0;
    config.concurrency.domain_jitter_ms = 0;
    config.retry.max_retries = 0;

    let chain: ProviderChain<dyn SearchProvider> = ProviderChain::new("search", RetryPolicy::none())
        .with_provider("static", Arc::new(StaticSearch::new("static").with_urls(&[PAGE_URL])) as Arc<dyn SearchProvider>);
    let pipeline = Pipeline::assemble(
        &config,
        SearchCoordinator::new(chain, 10),
        Arc::new(StaticFetcher::new().with_page(PAGE_URL, "Sleep and memory", PAGE_TEXT)),
        Arc::new(LocalEmbedder::default()),
        Arc::new(LlmClient::single(Arc::new(MockLlmProvider::with_handler(answer)))),
        ResourcePools::from_config(&config.concurrency),
    );
    Arc::new(ResearchEngine::new(config, pipeline, SessionStore::in_memory()))
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(request).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), 10_000_000).await.unwrap();
    (status, body.to_vec())
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_research_lifecycle_over_http() {
    let engine = engine();
    let app = router(Arc::clone(&engine));

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/research")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"query": "Does sleep deprivation affect memory?", "mode": "quick"}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let started: Value = serde_json::from_slice(&body).unwrap();
    let id = started["session_id"].as_str().unwrap().to_string();
    assert_eq!(started["session"]["mode"], "quick");

    engine.wait_idle().await;

    let (status, detail) = get_json(&app, &format!("/api/sessions/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["session"]["phase"], "complete", "detail: {detail}");
    assert_eq!(detail["session"]["progress_percent"], 100);
    assert_eq!(detail["running"], false);

    let (_, report) = get_json(&app, &format!("/api/sessions/{id}/report")).await;
    assert_eq!(report["complete"], true);
    assert!(report["markdown"].as_str().unwrap().starts_with("# Research Report"));

    let (_, sources) = get_json(&app, &format!("/api/sessions/{id}/sources")).await;
    assert_eq!(sources.as_array().unwrap().len(), 1);
    assert_eq!(sources[0]["url"], PAGE_URL);

    let (_, claims) = get_json(&app, &format!("/api/sessions/{id}/claims")).await;
    assert_eq!(claims[0]["text"], CLAIM);
    assert_eq!(claims[0]["verified"], true);

    let (_, graph) = get_json(&app, &format!("/api/sessions/{id}/graph")).await;
    assert_eq!(graph["statistics"]["claim_nodes"], 1);
    assert_eq!(graph["statistics"]["source_nodes"], 1);
    assert!(graph["nodes"].as_array().unwrap().len() >= 3);

    let (_, stats) = get_json(&app, "/api/stats").await;
    assert_eq!(stats["total_sessions"], 1);
    assert_eq!(stats["by_phase"]["complete"], 1);
}

#[tokio::test]
async fn test_event_stream_replays_finished_session() {
    let engine = engine();
    let record = engine
        .run("Does sleep deprivation affect memory?", veracity_core::ResearchMode::Quick, None)
        .await
        .unwrap();
    let app = router(Arc::clone(&engine));

    let (status, body) = send(
        &app,
        Request::builder()
            .uri(format!("/api/sessions/{}/events", record.id()))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("event: session_created"));
    assert!(text.contains("event: report"));
    let statuses = text.matches("event: status").count();
    assert_eq!(statuses, record.session.phases().len());
}

#[tokio::test]
async fn test_cancel_and_delete_rules() {
    let engine = engine();
    let app = router(Arc::clone(&engine));
    let record = engine
        .run("Does sleep deprivation affect memory?", veracity_core::ResearchMode::Quick, None)
        .await
        .unwrap();
    let id = record.id();

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri(format!("/api/sessions/{id}/cancel"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/sessions/{id}"))
            .body(Body::empty())
            .unwrap()
    };
    assert_eq!(send(&app, delete()).await.0, StatusCode::NO_CONTENT);
    assert_eq!(send(&app, delete()).await.0, StatusCode::NOT_FOUND);
    assert!(engine.events().history(id).is_empty());
}
