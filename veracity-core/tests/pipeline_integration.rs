//! End-to-end sessions against scripted search, fetch, and LLM collaborators.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;
use veracity_core::embeddings::{Embedder, LocalEmbedder};
use veracity_core::error::{FetchError, ProviderError};
use veracity_core::events::ResearchEvent;
use veracity_core::llm::{CompletionRequest, LlmClient, LlmProvider, MockLlmProvider};
use veracity_core::rate_limit::ResourcePools;
use veracity_core::research::crawler::{FetchedPage, Fetcher, StaticFetcher};
use veracity_core::research::search::{SearchCoordinator, SearchProvider, StaticSearch};
use veracity_core::research::synthesis::citations;
use veracity_core::retry::{ProviderChain, RetryPolicy};
use veracity_core::{Pipeline, ResearchEngine, ResearchMode, ResearchPhase, SessionStore, VeracityConfig};

const QUERY: &str = "Does coffee consumption raise heart disease risk?";

const STUDY_URL: &str = "https://research.example.edu/coffee-cohort";
const AGENCY_URL: &str = "https://health.example.gov/coffee-review";
const SMOKERS_URL: &str = "https://research.example.edu/coffee-smokers";

const STUDY_CLAIM: &str = "Coffee consumption raises heart disease risk.";
const AGENCY_CLAIM: &str = "Coffee consumption never raises heart disease risk.";
const SMOKERS_CLAIM: &str = "Coffee consumption raises heart disease risk in smokers.";

const STUDY_TEXT: &str = "Coffee consumption raises heart disease risk. A cohort study at the \
    university followed twelve thousand adults for a decade and measured blood pressure, \
    cholesterol and arterial stiffness. Participants drinking more than four cups per day showed \
    elevated systolic readings after adjusting for smoking and diet.";

const AGENCY_TEXT: &str = "Coffee consumption never raises heart disease risk. The national \
    health agency reviewed forty randomized trials covering cardiovascular outcomes in older \
    populations. Moderate intake was associated with neutral or slightly protective effects on \
    arrhythmia and stroke incidence across several registries.";

const SMOKERS_TEXT: &str = "Coffee consumption raises heart disease risk in smokers. Laboratory \
    researchers examined vascular inflammation markers among habitual tobacco users who also drank \
    espresso daily. Combined exposure amplified endothelial damage compared with either habit \
    alone in the sampled group of volunteers.";

/// Claim text and stance scripted per source URL.
fn scripted_claim(prompt: &str) -> (&'static str, &'static str) {
    if prompt.contains(AGENCY_URL) {
        (AGENCY_CLAIM, "negative")
    } else if prompt.contains(SMOKERS_URL) {
        (SMOKERS_CLAIM, "positive")
    } else {
        (STUDY_CLAIM, "positive")
    }
}

fn answer(request: &CompletionRequest) -> Result<String, ProviderError> {
    let prompt = &request.prompt;
    let reply = if prompt.contains("Other positions:") {
        json!({"rebuttal": "The trial evidence outweighs the cohort.", "new_confidence": 0.7})
    } else if prompt.contains("Claim under debate") {
        json!({
            "position": "Randomized evidence does not support a causal increase.",
            "stance": "oppose",
            "confidence": 0.7,
            "reasoning": "Trials outweigh a single cohort."
        })
    } else if prompt.contains("Premise:") {
        json!({"label": "neutral", "entailment": 0.2, "contradiction": 0.1})
    } else if prompt.contains("executive summary") {
        let cited: Vec<&str> = prompt
            .split('[')
            .filter_map(|s| s.split(']').next())
            .filter(|s| s.starts_with("src-"))
            .collect();
        let first = cited.first().copied().unwrap_or("src-none");
        json!({"summary": format!("Findings conflict [{first}] and remain open [src-made-up].")})
    } else if prompt.contains("Source [") {
        let source_id = prompt
            .split("Source [")
            .nth(1)
            .and_then(|s| s.split(']').next())
            .unwrap_or_default();
        let (text, stance) = scripted_claim(prompt);
        json!({"claims": [{
            "source_id": source_id,
            "text": text,
            "confidence": 0.8,
            "entities": ["coffee", "heart disease"],
            "stance": stance
        }]})
    } else {
        return Err(ProviderError::Request {
            provider: "mock".into(),
            message: "unexpected prompt".into(),
        });
    };
    Ok(reply.to_string())
}

fn test_config() -> VeracityConfig {
    let mut config = VeracityConfig::default();
    config.curation.min_relevance = 0.05;
    config.concurrency.domain_min_interval_ms = 0;
    config.concurrency.domain_jitter_ms = 0;
    config.retry.max_retries = 0;
    config.retry.base_backoff_ms = 1;
    config.retry.max_backoff_ms = 1;
    config.retry.jitter = false;
    config.extraction.batch_size = 1;
    config
}

fn search_for(urls: &[&str]) -> SearchCoordinator {
    search_with(StaticSearch::new("static").with_urls(urls))
}

fn search_with(provider: StaticSearch) -> SearchCoordinator {
    let chain: ProviderChain<dyn SearchProvider> =
        ProviderChain::new("search", RetryPolicy::none()).with_provider("static", Arc::new(provider) as Arc<dyn SearchProvider>);
    SearchCoordinator::new(chain, 10)
}

fn pages() -> StaticFetcher {
    StaticFetcher::new()
        .with_page(STUDY_URL, "Coffee cohort study", STUDY_TEXT)
        .with_page(AGENCY_URL, "Coffee evidence review", AGENCY_TEXT)
        .with_page(SMOKERS_URL, "Coffee and smoking", SMOKERS_TEXT)
}

fn engine_with(
    config: VeracityConfig,
    search: SearchCoordinator,
    fetcher: Arc<dyn Fetcher>,
    llm: MockLlmProvider,
    store: SessionStore,
) -> ResearchEngine {
    let pools = ResourcePools::from_config(&config.concurrency);
    let pipeline = Pipeline::assemble(
        &config,
        search,
        fetcher,
        Arc::new(LocalEmbedder::default()),
        Arc::new(LlmClient::single(Arc::new(llm))),
        pools,
    );
    ResearchEngine::new(config, pipeline, store)
}

fn engine_parts(
    config: VeracityConfig,
    urls: &[&str],
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn LlmProvider>,
) -> ResearchEngine {
    let pools = ResourcePools::from_config(&config.concurrency);
    let pipeline = Pipeline::assemble(
        &config,
        search_for(urls),
        Arc::new(pages()),
        embedder,
        Arc::new(LlmClient::single(llm)),
        pools,
    );
    ResearchEngine::new(config, pipeline, SessionStore::in_memory())
}

fn engine(urls: &[&str]) -> ResearchEngine {
    engine_with(
        test_config(),
        search_for(urls),
        Arc::new(pages()),
        MockLlmProvider::with_handler(answer),
        SessionStore::in_memory(),
    )
}

#[tokio::test]
async fn test_contradiction_triggers_single_debate() {
    let dir = TempDir::new().unwrap();
    let engine = engine_with(
        test_config(),
        search_for(&[STUDY_URL, AGENCY_URL]),
        Arc::new(pages()),
        MockLlmProvider::with_handler(answer),
        SessionStore::open(dir.path()).unwrap(),
    );

    let record = engine.run(QUERY, ResearchMode::Quick, None).await.unwrap();
    let session = &record.session;
    assert_eq!(session.phase, ResearchPhase::Complete, "error: {:?}", session.error);
    assert_eq!(session.progress_percent, 100);
    assert_eq!(
        session.phases(),
        vec![
            ResearchPhase::Planning,
            ResearchPhase::Searching,
            ResearchPhase::Crawling,
            ResearchPhase::Curating,
            ResearchPhase::Extracting,
            ResearchPhase::BuildingGraph,
            ResearchPhase::Verifying,
            ResearchPhase::Debating,
            ResearchPhase::Synthesizing,
            ResearchPhase::Complete,
        ]
    );

    assert_eq!(record.sources.len(), 2);
    assert_eq!(record.claims.len(), 2);
    assert!(record.claims.iter().all(|c| c.verified));

    assert_eq!(record.debates.len(), 1);
    let debate = &record.debates[0];
    assert_eq!(debate.claim_ids.len(), 2);
    // Quick mode allows a single round.
    assert_eq!(debate.rounds, 1);
    assert_eq!(session.debate_rounds, 1);

    let report = session.report.as_deref().unwrap();
    assert!(report.contains("## Agreements and Disagreements"));
    let curated: HashSet<&str> = record.sources.iter().map(|s| s.id.as_str()).collect();
    let cited = citations(report);
    assert!(!cited.is_empty());
    assert!(cited.iter().all(|id| curated.contains(id.as_str())), "cited {cited:?}");
    assert!(!report.contains("src-made-up"));

    let stats = record.graph_statistics();
    assert_eq!(stats.claim_nodes, 2);
    assert_eq!(stats.source_nodes, 2);
    assert_eq!(stats.contradicts_edges, 1);

    let reopened = SessionStore::open(dir.path()).unwrap();
    let persisted = reopened.session(session.id).unwrap();
    assert_eq!(persisted.phase, ResearchPhase::Complete);
    assert_eq!(reopened.debates(session.id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_event_stream_is_ordered_and_complete() {
    let engine = engine(&[STUDY_URL, AGENCY_URL]);
    let record = engine.run(QUERY, ResearchMode::Quick, None).await.unwrap();
    let events = engine.events().history(record.id());

    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (0..events.len() as u64).collect::<Vec<_>>());
    assert!(matches!(events[0].event, ResearchEvent::SessionCreated { .. }));
    assert!(events.last().unwrap().event.is_final());

    let statuses: Vec<ResearchPhase> = events
        .iter()
        .filter_map(|e| match &e.event {
            ResearchEvent::Status { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, record.session.phases());

    let count = |kind: &str| events.iter().filter(|e| e.event.kind() == kind).count();
    assert_eq!(count("source"), record.sources.len());
    assert_eq!(count("claim"), record.claims.len());
    assert_eq!(count("report"), 1);
    assert!(count("debate") >= 2);
    assert!(count("graph") >= 1);

    let progress: Vec<u8> = events
        .iter()
        .filter_map(|e| match &e.event {
            ResearchEvent::Status { progress_percent, .. } => Some(*progress_percent),
            _ => None,
        })
        .collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_agreeing_sources_skip_debate() {
    let engine = engine(&[STUDY_URL, SMOKERS_URL]);
    let record = engine.run(QUERY, ResearchMode::Quick, None).await.unwrap();

    assert_eq!(record.session.phase, ResearchPhase::Complete, "error: {:?}", record.session.error);
    assert!(!record.session.phases().contains(&ResearchPhase::Debating));
    assert!(record.debates.is_empty());
    assert_eq!(record.graph_statistics().contradicts_edges, 0);
}

#[tokio::test]
async fn test_debate_disabled_per_session() {
    let engine = engine(&[STUDY_URL, AGENCY_URL]);
    let record = engine.run(QUERY, ResearchMode::Quick, Some(false)).await.unwrap();

    assert_eq!(record.session.phase, ResearchPhase::Complete);
    assert!(!record.session.phases().contains(&ResearchPhase::Debating));
    let report = record.session.report.unwrap();
    assert!(report.contains("## Sources"));
}

#[tokio::test]
async fn test_search_outage_fails_session() {
    let engine = engine_with(
        test_config(),
        search_with(StaticSearch::new("static").failing(ProviderError::Request {
            provider: "static".into(),
            message: "offline".into(),
        })),
        Arc::new(pages()),
        MockLlmProvider::with_handler(answer),
        SessionStore::in_memory(),
    );
    let record = engine.run(QUERY, ResearchMode::Quick, None).await.unwrap();

    assert_eq!(record.session.phase, ResearchPhase::Error);
    assert_eq!(record.session.error_cause.as_deref(), Some("external_provider_unavailable"));
    assert!(record.sources.is_empty());
    assert!(record.session.report.is_none());

    let events = engine.events().history(record.id());
    match &events.last().unwrap().event {
        ResearchEvent::Error { details, .. } => {
            assert_eq!(details.as_deref(), Some("external_provider_unavailable"))
        }
        other => panic!("Expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn test_llm_outage_keeps_partial_results() {
    let engine = engine_with(
        test_config(),
        search_for(&[STUDY_URL, AGENCY_URL]),
        Arc::new(pages()),
        MockLlmProvider::new(),
        SessionStore::in_memory(),
    );
    let record = engine.run(QUERY, ResearchMode::Quick, None).await.unwrap();

    assert_eq!(record.session.phase, ResearchPhase::Error);
    assert_eq!(record.session.error_cause.as_deref(), Some("external_provider_unavailable"));
    assert_eq!(record.sources.len(), 2);
    assert!(record.claims.is_empty());
    assert_eq!(engine.store().sources(record.id()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_empty_query_rejected() {
    let engine = engine(&[STUDY_URL]);
    assert!(engine.run("   ", ResearchMode::Quick, None).await.is_err());
    assert!(engine.store().list().is_empty());
}

#[tokio::test]
async fn test_cancelled_session_records_cause() {
    let engine = engine(&[STUDY_URL, AGENCY_URL]);
    let session = engine.start(QUERY, ResearchMode::Quick, None).unwrap();
    assert!(engine.cancel(session.id));
    engine.wait_idle().await;

    let stored = engine.store().session(session.id).unwrap();
    assert_eq!(stored.phase, ResearchPhase::Error);
    assert_eq!(stored.error_cause.as_deref(), Some("cancelled"));
    assert!(!engine.is_running(session.id));
}

struct SlowFetcher;

#[async_trait]
impl Fetcher for SlowFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Err(FetchError::Network {
            url: url.to_string(),
            message: "unreachable".into(),
        })
    }
}

#[tokio::test]
async fn test_crawl_deadline_forces_error() {
    let mut config = test_config();
    config.deadlines.crawling_secs = 1;
    let engine = engine_with(
        config,
        search_for(&[STUDY_URL]),
        Arc::new(SlowFetcher),
        MockLlmProvider::with_handler(answer),
        SessionStore::in_memory(),
    );

    let record = tokio::time::timeout(Duration::from_secs(10), engine.run(QUERY, ResearchMode::Quick, None))
        .await
        .expect("deadline should end the session")
        .unwrap();
    assert_eq!(record.session.phase, ResearchPhase::Error);
    assert_eq!(record.session.error_cause.as_deref(), Some("phase_deadline_exceeded"));
    assert_eq!(record.session.phases().last(), Some(&ResearchPhase::Error));
}

/// Hangs on claim-sized texts so the session stalls once claims exist.
struct StallingEmbedder(LocalEmbedder);

#[async_trait]
impl Embedder for StallingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        if text.len() < 100 && text.starts_with("Coffee consumption") {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        self.0.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.0.dimensions()
    }

    fn provider_name(&self) -> &str {
        "stalling"
    }
}

/// Scripted answers, except extraction for the agency page never returns.
struct StallingLlm;

#[async_trait]
impl LlmProvider for StallingLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        if request.prompt.contains("Source [") && request.prompt.contains(AGENCY_URL) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        answer(&request)
    }

    fn model_name(&self) -> &str {
        "stalling"
    }
}

fn claim_events(engine: &ResearchEngine, id: uuid::Uuid) -> usize {
    engine
        .events()
        .history(id)
        .iter()
        .filter(|e| e.event.kind() == "claim")
        .count()
}

#[tokio::test]
async fn test_verify_deadline_keeps_claims() {
    let mut config = test_config();
    config.deadlines.verifying_secs = 1;
    let engine = engine_parts(
        config,
        &[STUDY_URL, AGENCY_URL],
        Arc::new(StallingEmbedder(LocalEmbedder::default())),
        Arc::new(MockLlmProvider::with_handler(answer)),
    );

    let record = tokio::time::timeout(Duration::from_secs(10), engine.run(QUERY, ResearchMode::Quick, None))
        .await
        .expect("deadline should end the session")
        .unwrap();
    assert_eq!(record.session.phase, ResearchPhase::Error);
    assert_eq!(record.session.error_cause.as_deref(), Some("phase_deadline_exceeded"));
    assert_eq!(record.session.phases().iter().rev().nth(1), Some(&ResearchPhase::Verifying));

    assert_eq!(record.sources.len(), 2);
    assert_eq!(record.claims.len(), 2);
    assert_eq!(record.session.claim_count, 2);
    assert_eq!(claim_events(&engine, record.id()), 2);
    assert_eq!(engine.store().claims(record.id()).unwrap().len(), 2);
    assert_eq!(record.graph_statistics().claim_nodes, 2);
}

#[tokio::test]
async fn test_extraction_deadline_keeps_admitted_claims() {
    let mut config = test_config();
    config.deadlines.extracting_secs = 1;
    let engine = engine_parts(
        config,
        &[STUDY_URL, AGENCY_URL],
        Arc::new(LocalEmbedder::default()),
        Arc::new(StallingLlm),
    );

    let record = tokio::time::timeout(Duration::from_secs(10), engine.run(QUERY, ResearchMode::Quick, None))
        .await
        .expect("deadline should end the session")
        .unwrap();
    assert_eq!(record.session.phase, ResearchPhase::Error);
    assert_eq!(record.session.error_cause.as_deref(), Some("phase_deadline_exceeded"));

    assert_eq!(record.sources.len(), 2);
    let texts: Vec<&str> = record.claims.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(texts, vec![STUDY_CLAIM]);
    assert_eq!(record.session.claim_count, 1);
    assert_eq!(claim_events(&engine, record.id()), 1);
    assert_eq!(engine.store().claims(record.id()).unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_during_verification_keeps_partial_results() {
    let engine = engine_parts(
        test_config(),
        &[STUDY_URL, AGENCY_URL],
        Arc::new(StallingEmbedder(LocalEmbedder::default())),
        Arc::new(MockLlmProvider::with_handler(answer)),
    );
    let mut events = engine.events().subscribe();
    let session = engine.start(QUERY, ResearchMode::Quick, None).unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let envelope = events.recv().await.unwrap();
            if envelope.session_id == session.id
                && matches!(envelope.event, ResearchEvent::Status { phase: ResearchPhase::Verifying, .. })
            {
                break;
            }
        }
    })
    .await
    .expect("session should reach verification");
    assert!(engine.cancel(session.id));
    engine.wait_idle().await;

    let record = engine.store().get(session.id).unwrap();
    assert_eq!(record.session.phase, ResearchPhase::Error);
    assert_eq!(record.session.error_cause.as_deref(), Some("cancelled"));
    assert_eq!(record.sources.len(), 2);
    assert_eq!(record.claims.len(), 2);
    assert_eq!(claim_events(&engine, session.id), 2);
}
