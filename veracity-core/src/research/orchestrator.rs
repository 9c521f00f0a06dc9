//! Per-session state machine.
//!
//! The orchestrator is the only writer of its session. It walks the phases in
//! canonical order, relays every produced item as its own event, persists the
//! record after each phase, and turns any phase failure into a terminal ERROR
//! with the partial results kept.

use std::collections::HashMap;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::extraction::ClaimCollector;
use super::graph::{GraphBuilder, GraphDelta};
use super::pipeline::Pipeline;
use super::planner::QueryPlanner;
use super::search::SearchHit;
use super::session::{ResearchPhase, ResearchSession};
use super::sources::{RawSource, Source};
use super::synthesis::ReportInput;
use crate::config::VeracityConfig;
use crate::error::{AgentError, PhaseError, ProviderError};
use crate::events::{EventSink, ResearchEvent, SourcePreview};
use crate::store::{SessionRecord, SessionStore};

/// Run `work` under the phase deadline, racing cancellation.
async fn bounded<T>(
    phase: ResearchPhase,
    deadline: Option<Duration>,
    cancel: CancellationToken,
    work: impl Future<Output = Result<T, PhaseError>>,
) -> Result<T, PhaseError> {
    let limited = async {
        match deadline {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| PhaseError::DeadlineExceeded {
                    phase,
                    deadline_secs: limit.as_secs(),
                })?,
            None => work.await,
        }
    };
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PhaseError::Cancelled { phase }),
        result = limited => result,
    }
}

fn unavailable(phase: ResearchPhase) -> impl FnOnce(ProviderError) -> PhaseError {
    move |source| PhaseError::ProviderUnavailable { phase, source }
}

pub struct SessionOrchestrator {
    config: Arc<VeracityConfig>,
    pipeline: Arc<Pipeline>,
    store: Arc<SessionStore>,
    sink: EventSink,
    cancel: CancellationToken,
    record: SessionRecord,
    graph: GraphBuilder,
}

impl SessionOrchestrator {
    pub fn new(
        config: Arc<VeracityConfig>,
        pipeline: Arc<Pipeline>,
        store: Arc<SessionStore>,
        sink: EventSink,
        cancel: CancellationToken,
        session: ResearchSession,
    ) -> Self {
        let graph = pipeline.graph_builder(&config);
        Self {
            config,
            pipeline,
            store,
            sink,
            cancel,
            record: SessionRecord::new(session),
            graph,
        }
    }

    pub fn session(&self) -> &ResearchSession {
        &self.record.session
    }

    /// Drive the session to COMPLETE or ERROR and return the final record.
    pub async fn run(mut self) -> SessionRecord {
        let session_id = self.record.id();
        self.sink.emit(ResearchEvent::SessionCreated {
            query: self.record.session.query.clone(),
            mode: self.record.session.mode,
        });
        info!(%session_id, query = %self.record.session.query, mode = %self.record.session.mode, "Session started");

        match self.drive().await {
            Ok(()) => info!(
                %session_id,
                sources = self.record.session.source_count,
                claims = self.record.session.claim_count,
                debate_rounds = self.record.session.debate_rounds,
                "Session complete"
            ),
            Err(e) => self.fail(&e),
        }
        self.record.graph = self.graph.graph().snapshot();
        self.persist();
        self.record
    }

    async fn drive(&mut self) -> Result<(), PhaseError> {
        self.enter(ResearchPhase::Planning)?;
        self.plan()?;

        let phase = ResearchPhase::Searching;
        self.enter(phase)?;
        let (deadline, cancel) = self.limits(phase);
        let hits = bounded(phase, deadline, cancel, self.search()).await?;

        let phase = ResearchPhase::Crawling;
        self.enter(phase)?;
        let (deadline, cancel) = self.limits(phase);
        let raw = bounded(phase, deadline, cancel, self.crawl(hits)).await?;

        let phase = ResearchPhase::Curating;
        self.enter(phase)?;
        let (deadline, cancel) = self.limits(phase);
        bounded(phase, deadline, cancel, self.curate(raw)).await?;

        let phase = ResearchPhase::Extracting;
        self.enter(phase)?;
        let (deadline, cancel) = self.limits(phase);
        bounded(phase, deadline, cancel, self.extract()).await?;

        let phase = ResearchPhase::BuildingGraph;
        self.enter(phase)?;
        self.build_graph()?;

        let phase = ResearchPhase::Verifying;
        self.enter(phase)?;
        let (deadline, cancel) = self.limits(phase);
        bounded(phase, deadline, cancel, self.verify()).await?;

        if self.should_debate() {
            let phase = ResearchPhase::Debating;
            self.enter(phase)?;
            let (deadline, cancel) = self.limits(phase);
            bounded(phase, deadline, cancel, self.debate()).await?;
        } else {
            debug!(session_id = %self.record.id(), "No contradiction above threshold, skipping debate");
        }

        let phase = ResearchPhase::Synthesizing;
        self.enter(phase)?;
        let (deadline, cancel) = self.limits(phase);
        let markdown = bounded(phase, deadline, cancel, self.synthesize()).await?;

        self.record.session.complete(markdown)?;
        self.announce(ResearchPhase::Complete);
        self.record.graph = self.graph.graph().snapshot();
        self.persist();
        Ok(())
    }

    fn limits(&self, phase: ResearchPhase) -> (Option<Duration>, CancellationToken) {
        (self.config.deadlines.for_phase(phase), self.cancel.clone())
    }

    fn check_cancelled(&self, phase: ResearchPhase) -> Result<(), PhaseError> {
        if self.cancel.is_cancelled() {
            Err(PhaseError::Cancelled { phase })
        } else {
            Ok(())
        }
    }

    fn enter(&mut self, phase: ResearchPhase) -> Result<(), PhaseError> {
        self.check_cancelled(phase)?;
        self.record.session.transition(phase)?;
        self.announce(phase);
        self.persist();
        Ok(())
    }

    fn announce(&self, phase: ResearchPhase) {
        let session = &self.record.session;
        info!(
            session_id = %session.id,
            phase = %phase,
            progress = session.progress_percent,
            "Phase started"
        );
        self.sink.emit(ResearchEvent::Status {
            phase,
            message: phase.status_message().to_string(),
            progress_percent: session.progress_percent,
        });
    }

    fn emit_delta(&self, delta: GraphDelta) {
        if !delta.is_empty() {
            self.sink.emit(ResearchEvent::graph(delta));
        }
    }

    fn persist(&self) {
        if let Err(e) = self.store.save(&self.record) {
            warn!(session_id = %self.record.id(), error = %e, "Failed to persist session");
        }
    }

    fn fail(&mut self, e: &PhaseError) {
        let session_id = self.record.id();
        error!(%session_id, cause = e.cause(), error = %e, "Session failed");
        self.record.session.fail(e.cause(), e.to_string());
        self.announce(ResearchPhase::Error);
        self.sink.emit(ResearchEvent::Error {
            message: e.to_string(),
            details: Some(e.cause().to_string()),
        });
    }

    fn plan(&mut self) -> Result<(), PhaseError> {
        let session = &mut self.record.session;
        let sub_queries = QueryPlanner::new().plan(&session.query, session.mode);
        if sub_queries.is_empty() {
            return Err(PhaseError::failed(ResearchPhase::Planning, "no sub-queries for an empty query"));
        }
        debug!(session_id = %session.id, sub_queries = ?sub_queries, "Planned");
        session.sub_queries = sub_queries;
        Ok(())
    }

    async fn search(&mut self) -> Result<Vec<SearchHit>, PhaseError> {
        let phase = ResearchPhase::Searching;
        let outcome = self
            .pipeline
            .search
            .search_all(&self.record.session.sub_queries, self.record.session.max_sources)
            .await
            .map_err(unavailable(phase))?;
        if !outcome.failed_queries.is_empty() {
            warn!(failed = ?outcome.failed_queries, "Some sub-queries returned nothing");
        }
        if outcome.hits.is_empty() {
            return Err(PhaseError::failed(phase, "search returned no results"));
        }
        Ok(outcome.hits)
    }

    async fn crawl(&mut self, hits: Vec<SearchHit>) -> Result<Vec<RawSource>, PhaseError> {
        let phase = ResearchPhase::Crawling;
        let attempted = hits.len();
        let pipeline = Arc::clone(&self.pipeline);
        let mut outcomes = pin!(pipeline.crawler.crawl(hits));

        let mut raw = Vec::new();
        let mut last_error = None;
        while let Some(outcome) = outcomes.next().await {
            self.check_cancelled(phase)?;
            match outcome.result {
                Ok(source) => raw.push(source),
                Err(e) => {
                    debug!(url = %outcome.url, error = %e, "Dropping source");
                    last_error = Some(e.to_string());
                }
            }
        }

        info!(attempted, fetched = raw.len(), "Crawl complete");
        if raw.is_empty() {
            return Err(PhaseError::ProviderUnavailable {
                phase,
                source: ProviderError::Unavailable {
                    capability: "crawler".into(),
                    attempts: attempted,
                    last_error: last_error.unwrap_or_else(|| "nothing to crawl".into()),
                },
            });
        }
        Ok(raw)
    }

    async fn curate(&mut self, raw: Vec<RawSource>) -> Result<(), PhaseError> {
        let phase = ResearchPhase::Curating;
        let curator = self.pipeline.curator(&self.config);
        let outcome = curator
            .curate(raw, &self.record.session.query, self.record.session.target_sources)
            .await
            .map_err(unavailable(phase))?;

        for source in &outcome.sources {
            self.sink.emit(ResearchEvent::Source {
                source: SourcePreview::from(source),
            });
        }
        info!(stats = ?outcome.stats, "Curation complete");
        self.record.session.source_count = outcome.sources.len();
        self.record.sources = outcome.sources;
        self.record.curation = Some(outcome.stats);

        if self.record.sources.is_empty() {
            return Err(PhaseError::failed(phase, "no source passed curation"));
        }
        Ok(())
    }

    async fn extract(&mut self) -> Result<(), PhaseError> {
        let phase = ResearchPhase::Extracting;
        let extractor = self.pipeline.extractor(&self.config);
        if extractor.agent_count() == 0 {
            return Err(PhaseError::failed(phase, "no extraction agents configured"));
        }
        let sources = self.record.sources.clone();
        let query = self.record.session.query.clone();
        let mut collector = ClaimCollector::new(&sources, self.config.extraction.max_claims_per_source);
        let mut batches = pin!(extractor.extract_stream(&sources, &query));

        let (mut succeeded, mut failed) = (0usize, 0usize);
        let mut provider_error = None;
        while let Some(batch) = batches.next().await {
            self.check_cancelled(phase)?;
            match &batch.result {
                Ok(_) => succeeded += 1,
                Err(AgentError::Provider(e)) => {
                    failed += 1;
                    provider_error = Some(e.clone());
                }
                Err(_) => failed += 1,
            }
            for claim in collector.admit_batch(&batch) {
                self.record.claims.push(claim.clone());
                self.record.session.claim_count = self.record.claims.len();
                self.sink.emit(ResearchEvent::Claim {
                    agent: claim.agent.to_string(),
                    claim,
                });
            }
        }

        if succeeded == 0
            && let Some(source) = provider_error
        {
            return Err(PhaseError::ProviderUnavailable { phase, source });
        }
        self.record.claims = collector.into_claims();
        self.record.session.claim_count = self.record.claims.len();
        info!(succeeded, failed, claims = self.record.claims.len(), "Extraction complete");
        Ok(())
    }

    fn build_graph(&mut self) -> Result<(), PhaseError> {
        let sources: HashMap<&str, &Source> = self.record.sources.iter().map(|s| (s.id.as_str(), s)).collect();
        for source in &self.record.sources {
            let delta = self.graph.add_source(source);
            self.emit_delta(delta);
        }
        for claim in &self.record.claims {
            let source = sources.get(claim.source_id.as_str()).ok_or_else(|| {
                PhaseError::failed(
                    ResearchPhase::BuildingGraph,
                    format!("claim {} references unknown source {}", claim.id, claim.source_id),
                )
            })?;
            let delta = self.graph.add_claim(claim, source);
            self.emit_delta(delta);
        }
        self.record.graph = self.graph.graph().snapshot();
        info!(stats = ?self.graph.graph().statistics(), "Graph built");
        Ok(())
    }

    async fn verify(&mut self) -> Result<(), PhaseError> {
        let verifier = self.pipeline.verifier(&self.config);
        // In place: a deadline or cancel mid-phase leaves the claims in the record.
        let results = verifier
            .verify_all(&mut self.record.claims, &self.record.sources)
            .await;
        debug!(verified = results.iter().filter(|r| r.verified).count(), "Claims verified");

        let delta = self.graph.relate_claims(&self.record.claims).await;
        self.emit_delta(delta);
        self.record.graph = self.graph.graph().snapshot();
        Ok(())
    }

    fn should_debate(&self) -> bool {
        let debate = &self.config.debate;
        debate.enabled
            && self.record.session.debate_enabled
            && self.record.session.mode.debate_rounds(debate.max_rounds) > 0
            && self.graph.graph().has_contradiction_above(debate.contradiction_threshold)
    }

    async fn debate(&mut self) -> Result<(), PhaseError> {
        let threshold = self.config.debate.contradiction_threshold;
        let clusters = self.graph.graph().contradiction_clusters(threshold);
        let rounds = self
            .record
            .session
            .mode
            .debate_rounds(self.config.debate.max_rounds);
        let debater = self.pipeline.debater(&self.config);
        let sink = self.sink.clone();

        let outcomes = debater
            .debate_all(
                &self.record.session.query,
                &clusters,
                &self.record.claims,
                rounds,
                |argument| {
                    sink.emit(ResearchEvent::debate(argument));
                },
            )
            .await;

        self.record.session.debate_rounds = outcomes.iter().map(|o| o.rounds).sum();
        info!(
            clusters = clusters.len(),
            debated = outcomes.len(),
            consensus = outcomes.iter().filter(|o| o.is_consensus()).count(),
            "Debate complete"
        );
        self.record.debates = outcomes;
        Ok(())
    }

    async fn synthesize(&mut self) -> Result<String, PhaseError> {
        let stats = self.graph.graph().statistics();
        let input = ReportInput {
            query: &self.record.session.query,
            sources: &self.record.sources,
            claims: &self.record.claims,
            outcomes: &self.record.debates,
            graph: &stats,
            curation: self.record.curation.as_ref(),
        };
        let report = self.pipeline.synthesizer().synthesize(&input).await;
        self.sink.emit(ResearchEvent::Report {
            markdown: report.markdown.clone(),
            complete: true,
        });
        Ok(report.markdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let result = bounded(
            ResearchPhase::Planning,
            Some(Duration::from_secs(5)),
            CancellationToken::new(),
            async { Ok::<_, PhaseError>(7) },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_bounded_deadline() {
        let result = bounded(
            ResearchPhase::Crawling,
            Some(Duration::from_millis(20)),
            CancellationToken::new(),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, PhaseError>(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.cause(), "phase_deadline_exceeded");
        assert!(matches!(
            err,
            PhaseError::DeadlineExceeded {
                phase: ResearchPhase::Crawling,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_bounded_cancellation_wins() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = bounded(ResearchPhase::Extracting, None, cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, PhaseError>(())
        })
        .await;
        assert!(matches!(
            result,
            Err(PhaseError::Cancelled {
                phase: ResearchPhase::Extracting
            })
        ));
    }
}
