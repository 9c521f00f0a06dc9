//! The collaborators a session runs against.
//!
//! A [`Pipeline`] is built once per process and shared by every session.
//! Per-session stage objects (curator, verifier, graph builder, ...) are
//! created from it and the configuration when a session starts.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::agents::{AgentRole, LlmResearchAgent, ResearchAgent, parse_roles};
use super::crawler::{Crawler, Fetcher, HttpFetcher};
use super::credibility::{CredibilityScorer, DomainCredibilityCache};
use super::curator::Curator;
use super::debate::DebateCoordinator;
use super::extraction::ExtractionOrchestrator;
use super::graph::GraphBuilder;
use super::search::SearchCoordinator;
use super::synthesis::Synthesizer;
use super::verifier::{EntailmentClassifier, LlmEntailmentClassifier, Verifier};
use crate::config::VeracityConfig;
use crate::embeddings::{Embedder, GuardedEmbedder, embedder_from_config};
use crate::error::VeracityError;
use crate::llm::LlmClient;
use crate::rate_limit::ResourcePools;
use crate::retry::RetryPolicy;

pub struct Pipeline {
    pub search: SearchCoordinator,
    pub crawler: Crawler,
    pub embedder: Arc<dyn Embedder>,
    pub extraction_agents: Vec<Arc<dyn ResearchAgent>>,
    pub debate_agents: Vec<Arc<dyn ResearchAgent>>,
    pub synthesizer_agent: Option<Arc<dyn ResearchAgent>>,
    pub classifier: Option<Arc<dyn EntailmentClassifier>>,
    pub credibility: Arc<DomainCredibilityCache>,
    pub pools: ResourcePools,
}

impl Pipeline {
    /// Network-backed pipeline: DuckDuckGo search, HTTP crawling, the
    /// configured embedder, and an OpenAI-compatible LLM.
    pub fn from_config(config: &VeracityConfig) -> Result<Self, VeracityError> {
        let pools = ResourcePools::from_config(&config.concurrency);
        let search = SearchCoordinator::from_config(&config.search, &config.retry, &config.crawler.user_agent)?;
        let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::from_config(&config.crawler, &config.retry)?);

        let embed_policy = RetryPolicy::from_config(
            &config.retry,
            Duration::from_secs(config.retry.embedding_timeout_secs),
        );
        let embedder: Arc<dyn Embedder> = Arc::new(GuardedEmbedder::new(
            embedder_from_config(&config.embedding),
            Arc::clone(&pools.embedding),
            embed_policy,
        ));
        let llm = Arc::new(LlmClient::from_config(&config.llm, &config.retry, Arc::clone(&pools.llm))?);

        let pipeline = Self::assemble(config, search, fetcher, embedder, llm, pools);
        info!(
            search = ?pipeline.search_providers(),
            embedder = pipeline.embedder.provider_name(),
            model = %config.llm.model,
            "Pipeline ready"
        );
        Ok(pipeline)
    }

    /// Wire agents, classifier, and crawler around the given collaborators.
    pub fn assemble(
        config: &VeracityConfig,
        search: SearchCoordinator,
        fetcher: Arc<dyn Fetcher>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<LlmClient>,
        pools: ResourcePools,
    ) -> Self {
        let fetch_policy =
            RetryPolicy::from_config(&config.retry, Duration::from_secs(config.retry.fetch_timeout_secs));
        let crawler = Crawler::new(
            fetcher,
            Arc::clone(&pools.crawl),
            Arc::clone(&pools.domains),
            fetch_policy,
        )
        .with_text_limits(config.crawler.min_text_chars, config.crawler.max_text_chars);

        let role_models = &config.llm.role_models;
        let extraction_agents =
            LlmResearchAgent::for_roles(&parse_roles(&config.extraction.roles), Arc::clone(&llm), role_models);
        let debate_agents =
            LlmResearchAgent::for_roles(&parse_roles(&config.extraction.debate_roles), Arc::clone(&llm), role_models);
        let synthesizer_agent = LlmResearchAgent::for_roles(&[AgentRole::Synthesizer], Arc::clone(&llm), role_models)
            .into_iter()
            .next();
        let classifier: Option<Arc<dyn EntailmentClassifier>> = config
            .verification
            .enable_nli
            .then(|| Arc::new(LlmEntailmentClassifier::new(Arc::clone(&llm))) as Arc<dyn EntailmentClassifier>);

        Self {
            search,
            crawler,
            embedder,
            extraction_agents,
            debate_agents,
            synthesizer_agent,
            classifier,
            credibility: Arc::new(DomainCredibilityCache::new()),
            pools,
        }
    }

    pub fn search_providers(&self) -> Vec<String> {
        self.search.provider_names()
    }

    pub fn curator(&self, config: &VeracityConfig) -> Curator {
        Curator::new(
            config.curation.clone(),
            CredibilityScorer::new(config.credibility.clone(), Arc::clone(&self.credibility)),
            Arc::clone(&self.embedder),
        )
    }

    pub fn extractor(&self, config: &VeracityConfig) -> ExtractionOrchestrator {
        ExtractionOrchestrator::new(
            self.extraction_agents.clone(),
            Arc::clone(&self.pools.extraction),
            config.extraction.clone(),
        )
    }

    pub fn verifier(&self, config: &VeracityConfig) -> Verifier {
        let verifier = Verifier::new(config.verification.clone(), Arc::clone(&self.embedder));
        match (&self.classifier, config.verification.enable_nli) {
            (Some(classifier), true) => verifier.with_classifier(Arc::clone(classifier)),
            _ => verifier,
        }
    }

    pub fn graph_builder(&self, config: &VeracityConfig) -> GraphBuilder {
        GraphBuilder::new(config.graph.clone(), Arc::clone(&self.embedder))
    }

    pub fn debater(&self, config: &VeracityConfig) -> DebateCoordinator {
        DebateCoordinator::new(self.debate_agents.clone(), config.debate.clone())
    }

    pub fn synthesizer(&self) -> Synthesizer {
        match &self.synthesizer_agent {
            Some(agent) => Synthesizer::new().with_agent(Arc::clone(agent)),
            None => Synthesizer::new(),
        }
    }
}
