//! Claim extraction: fan curated sources out to the extraction agents.
//!
//! Every (agent, batch) pair is an independent unit of work. A unit that
//! fails is logged and skipped; the others carry on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use super::agents::{AgentOutput, AgentRole, AgentTask, ResearchAgent, SourceBrief};
use super::sources::{Claim, ClaimCandidate, Source, Stance, VerificationMethod};
use crate::config::ExtractionConfig;
use crate::error::AgentError;
use crate::text;

/// Outcome of one agent working through one batch of sources.
#[derive(Debug)]
pub struct BatchResult {
    pub agent: AgentRole,
    /// Ids of the sources in the batch, in batch order.
    pub source_ids: Vec<String>,
    pub result: Result<Vec<ClaimCandidate>, AgentError>,
}

pub struct ExtractionOrchestrator {
    agents: Vec<Arc<dyn ResearchAgent>>,
    pool: Arc<Semaphore>,
    config: ExtractionConfig,
}

impl ExtractionOrchestrator {
    pub fn new(agents: Vec<Arc<dyn ResearchAgent>>, pool: Arc<Semaphore>, config: ExtractionConfig) -> Self {
        Self { agents, pool, config }
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    /// Run every agent over every batch.
    ///
    /// Batches finish independently, but a batch's results are yielded
    /// together and in agent order, so the per-source cap keeps the same
    /// claims on every run.
    pub fn extract_stream<'a>(
        &'a self,
        sources: &'a [Source],
        query: &'a str,
    ) -> impl Stream<Item = BatchResult> + 'a {
        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.pool.available_permits().max(1);

        stream::iter(sources.chunks(batch_size))
            .map(move |batch| {
                join_all(
                    self.agents
                        .iter()
                        .map(move |agent| self.run_unit(Arc::clone(agent), batch, query)),
                )
            })
            .buffer_unordered(concurrency)
            .flat_map(stream::iter)
    }

    async fn run_unit(&self, agent: Arc<dyn ResearchAgent>, batch: &[Source], query: &str) -> BatchResult {
        let source_ids: Vec<String> = batch.iter().map(|s| s.id.clone()).collect();
        let task = AgentTask::ExtractClaims {
            query: query.to_string(),
            sources: batch
                .iter()
                .map(|s| SourceBrief {
                    id: s.id.clone(),
                    title: s.title.clone(),
                    url: s.url.clone(),
                    text: text::truncate_chars(&s.text, self.config.source_chars).to_string(),
                })
                .collect(),
            max_claims_per_source: self.config.max_claims_per_source,
        };

        let result = match self.pool.acquire().await {
            Ok(_permit) => agent.run(&task).await.and_then(|output| match output {
                AgentOutput::Claims(claims) => Ok(claims),
                _ => Err(AgentError::UnsupportedTask {
                    agent: agent.name(),
                    task: task.kind().to_string(),
                }),
            }),
            Err(_) => Err(AgentError::OutputParse {
                agent: agent.name(),
                message: "extraction pool closed".into(),
            }),
        };

        match &result {
            Ok(claims) => debug!(agent = %agent.role(), sources = batch.len(), claims = claims.len(), "Batch extracted"),
            Err(e) => warn!(agent = %agent.role(), sources = batch.len(), error = %e, "Dropping batch contribution"),
        }
        BatchResult {
            agent: agent.role(),
            source_ids,
            result,
        }
    }

    /// Extract and admit claims from every source.
    pub async fn extract(&self, sources: &[Source], query: &str) -> Vec<Claim> {
        let mut collector = ClaimCollector::new(sources, self.config.max_claims_per_source);
        let mut results = std::pin::pin!(self.extract_stream(sources, query));
        while let Some(batch) = results.next().await {
            collector.admit_batch(&batch);
        }
        let claims = collector.into_claims();
        info!(sources = sources.len(), claims = claims.len(), "Extraction complete");
        claims
    }
}

/// Turns agent candidates into admitted claims.
///
/// Drops candidates for unknown sources, collapses duplicate texts per source,
/// and enforces the per-source cap.
pub struct ClaimCollector {
    source_rank: HashMap<String, usize>,
    max_per_source: usize,
    per_source: HashMap<String, usize>,
    seen: HashSet<String>,
    claims: Vec<Claim>,
    pub dropped_unknown: usize,
    pub failed_batches: usize,
}

impl ClaimCollector {
    pub fn new(sources: &[Source], max_per_source: usize) -> Self {
        Self {
            source_rank: sources
                .iter()
                .enumerate()
                .map(|(i, s)| (s.id.clone(), i))
                .collect(),
            max_per_source: max_per_source.max(1),
            per_source: HashMap::new(),
            seen: HashSet::new(),
            claims: Vec::new(),
            dropped_unknown: 0,
            failed_batches: 0,
        }
    }

    /// Admit a batch's candidates; returns the newly admitted claims.
    pub fn admit_batch(&mut self, batch: &BatchResult) -> Vec<Claim> {
        let candidates = match &batch.result {
            Ok(candidates) => candidates,
            Err(_) => {
                self.failed_batches += 1;
                return Vec::new();
            }
        };
        let sole_source = match batch.source_ids.as_slice() {
            [only] => Some(only.as_str()),
            _ => None,
        };

        let mut admitted = Vec::new();
        for candidate in candidates {
            let source_id = match candidate.source_id.as_deref().or(sole_source) {
                Some(id) if self.source_rank.contains_key(id) => id.to_string(),
                other => {
                    self.dropped_unknown += 1;
                    debug!(source_id = ?other, claim = %candidate.text, "Dropping claim for unknown source");
                    continue;
                }
            };
            if let Some(claim) = self.admit(candidate, source_id, batch.agent) {
                admitted.push(claim);
            }
        }
        admitted
    }

    fn admit(&mut self, candidate: &ClaimCandidate, source_id: String, agent: AgentRole) -> Option<Claim> {
        let id = Claim::id_for(&source_id, &candidate.text);
        if self.seen.contains(&id) {
            return None;
        }
        let count = self.per_source.entry(source_id.clone()).or_insert(0);
        if *count >= self.max_per_source {
            return None;
        }
        *count += 1;
        self.seen.insert(id.clone());

        let keywords = text::keywords(&candidate.text);
        let entities = if candidate.entities.is_empty() {
            keywords.iter().take(3).cloned().collect()
        } else {
            candidate.entities.clone()
        };
        let claim = Claim {
            id,
            source_id,
            text: candidate.text.clone(),
            confidence: candidate.confidence.clamp(0.0, 1.0),
            entities,
            keywords,
            stance: candidate.stance.unwrap_or_else(|| Stance::of(&candidate.text)),
            agent,
            verified: false,
            verification_method: VerificationMethod::None,
            verification_confidence: 0.0,
            excerpt: None,
            refuted: false,
        };
        self.claims.push(claim.clone());
        Some(claim)
    }

    /// Admitted claims ordered by source rank, then id.
    pub fn into_claims(mut self) -> Vec<Claim> {
        let rank = &self.source_rank;
        self.claims.sort_by(|a, b| {
            rank.get(&a.source_id)
                .cmp(&rank.get(&b.source_id))
                .then_with(|| a.id.cmp(&b.id))
        });
        self.claims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmClient, MockLlmProvider};
    use crate::research::agents::LlmResearchAgent;
    use crate::research::sources::{CredibilityBreakdown, SourceType};
    use chrono::Utc;

    fn source(id: &str, text: &str) -> Source {
        Source {
            id: id.into(),
            url: format!("https://example.org/{id}"),
            title: id.into(),
            content_hash: id.into(),
            text: text.into(),
            word_count: text::word_count(text),
            domain: "example.org".into(),
            source_type: SourceType::Webpage,
            credibility: 0.5,
            credibility_breakdown: CredibilityBreakdown::default(),
            has_citations: false,
            has_methodology: false,
            published_at: None,
            fetched_at: Utc::now(),
            relevance: 0.5,
            sub_query: "q".into(),
        }
    }

    fn candidate(source_id: Option<&str>, text: &str) -> ClaimCandidate {
        ClaimCandidate {
            source_id: source_id.map(String::from),
            text: text.into(),
            confidence: 0.8,
            entities: Vec::new(),
            stance: None,
        }
    }

    fn batch(source_ids: &[&str], candidates: Vec<ClaimCandidate>) -> BatchResult {
        BatchResult {
            agent: AgentRole::Scout,
            source_ids: source_ids.iter().map(|s| s.to_string()).collect(),
            result: Ok(candidates),
        }
    }

    #[test]
    fn test_collector_drops_unknown_and_duplicates() {
        let sources = vec![source("src-a", "a"), source("src-b", "b")];
        let mut collector = ClaimCollector::new(&sources, 10);

        let admitted = collector.admit_batch(&batch(
            &["src-a", "src-b"],
            vec![
                candidate(Some("src-a"), "Coffee raises alertness."),
                candidate(Some("src-a"), "coffee RAISES alertness"),
                candidate(Some("src-zzz"), "Unknown source claim."),
                candidate(None, "Ambiguous in a two-source batch."),
                candidate(Some("src-b"), "Tea does not raise alertness."),
            ],
        ));
        assert_eq!(admitted.len(), 2);
        assert_eq!(collector.dropped_unknown, 2);

        let claims = collector.into_claims();
        assert_eq!(claims[0].source_id, "src-a");
        assert_eq!(claims[1].stance, Stance::Negative);
        // Entities fall back to leading keywords.
        assert_eq!(claims[0].entities, vec!["coffee".to_string(), "raises".to_string(), "alertness".to_string()]);
    }

    #[test]
    fn test_single_source_batch_fills_missing_id() {
        let sources = vec![source("src-a", "a")];
        let mut collector = ClaimCollector::new(&sources, 10);
        let admitted = collector.admit_batch(&batch(&["src-a"], vec![candidate(None, "A claim.")]));
        assert_eq!(admitted[0].source_id, "src-a");
    }

    #[test]
    fn test_per_source_cap_and_failed_batches() {
        let sources = vec![source("src-a", "a")];
        let mut collector = ClaimCollector::new(&sources, 2);
        collector.admit_batch(&batch(
            &["src-a"],
            vec![candidate(None, "One."), candidate(None, "Two."), candidate(None, "Three.")],
        ));
        collector.admit_batch(&BatchResult {
            agent: AgentRole::Skeptic,
            source_ids: vec!["src-a".into()],
            result: Err(AgentError::OutputParse {
                agent: "skeptic".into(),
                message: "bad".into(),
            }),
        });
        assert_eq!(collector.failed_batches, 1);
        assert_eq!(collector.into_claims().len(), 2);
    }

    struct DelayedAgent {
        role: AgentRole,
        delay_ms: u64,
        claim: &'static str,
    }

    #[async_trait::async_trait]
    impl ResearchAgent for DelayedAgent {
        fn role(&self) -> AgentRole {
            self.role
        }

        async fn run(&self, _task: &AgentTask) -> Result<AgentOutput, AgentError> {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            Ok(AgentOutput::Claims(vec![candidate(None, self.claim)]))
        }
    }

    #[tokio::test]
    async fn test_capped_claims_follow_agent_order_not_completion_order() {
        // The scout finishes last but is listed first, so its claim wins the single slot.
        let agents: Vec<Arc<dyn ResearchAgent>> = vec![
            Arc::new(DelayedAgent {
                role: AgentRole::Scout,
                delay_ms: 60,
                claim: "Scout finding.",
            }),
            Arc::new(DelayedAgent {
                role: AgentRole::Skeptic,
                delay_ms: 0,
                claim: "Skeptic finding.",
            }),
        ];
        let config = ExtractionConfig {
            batch_size: 1,
            max_claims_per_source: 1,
            ..Default::default()
        };
        let orchestrator = ExtractionOrchestrator::new(agents, Arc::new(Semaphore::new(4)), config);

        let sources = vec![source("src-a", "A text")];
        for _ in 0..3 {
            let claims = orchestrator.extract(&sources, "q").await;
            assert_eq!(claims.len(), 1);
            assert_eq!(claims[0].text, "Scout finding.");
            assert_eq!(claims[0].agent, AgentRole::Scout);
        }
    }

    #[tokio::test]
    async fn test_extract_runs_every_agent_over_every_batch() {
        let mock = Arc::new(MockLlmProvider::with_handler(|request| {
            if request.prompt.contains("Source [src-b]") {
                Ok(r#"{"claims": [{"text": "B finding.", "confidence": 0.7}]}"#.to_string())
            } else {
                Ok(r#"{"claims": [{"text": "A finding.", "confidence": 0.9}]}"#.to_string())
            }
        }));
        let llm = Arc::new(LlmClient::single(mock.clone()));
        let agents: Vec<Arc<dyn ResearchAgent>> = vec![
            Arc::new(LlmResearchAgent::new(AgentRole::Scout, Arc::clone(&llm))),
            Arc::new(LlmResearchAgent::new(AgentRole::Analyst, llm)),
        ];
        let config = ExtractionConfig {
            batch_size: 1,
            ..Default::default()
        };
        let orchestrator = ExtractionOrchestrator::new(agents, Arc::new(Semaphore::new(2)), config);

        let sources = vec![source("src-a", "A text"), source("src-b", "B text")];
        let claims = orchestrator.extract(&sources, "q").await;

        // Two agents x two batches, duplicates collapsed per source.
        assert_eq!(mock.requests().len(), 4);
        let texts: Vec<&str> = claims.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["A finding.", "B finding."]);
    }
}
