//! Layered claim verification against the claim's own source.
//!
//! Layers run cheapest first and stop at the first success:
//!
//! 1. exact: the normalized claim is a substring of the normalized source
//! 2. semantic: a sentence-aligned window of the source is close enough in
//!    embedding space
//! 3. entailment: a classifier says one of the best windows entails the claim
//!
//! A failing embedder or classifier leaves the claim unverified. It never
//! fails the session.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::sources::{Claim, Source, VerificationMethod};
use crate::config::VerificationConfig;
use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::ProviderError;
use crate::llm::{CompletionRequest, LlmClient, extract_json};
use crate::text::{self, NormalizedText, TextWindow};

/// Classifier probabilities for one premise/hypothesis pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entailment {
    pub entailment: f64,
    pub contradiction: f64,
}

#[async_trait]
pub trait EntailmentClassifier: Send + Sync {
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<Entailment, ProviderError>;
}

/// Entailment classification delegated to a language model.
pub struct LlmEntailmentClassifier {
    llm: Arc<LlmClient>,
}

impl LlmEntailmentClassifier {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

const NLI_SYSTEM: &str = "You are a natural language inference classifier. Decide whether the \
     premise entails, contradicts, or is neutral toward the hypothesis. Judge only from the premise.";

#[async_trait]
impl EntailmentClassifier for LlmEntailmentClassifier {
    async fn classify(&self, premise: &str, hypothesis: &str) -> Result<Entailment, ProviderError> {
        let prompt = format!(
            "Premise:\n{premise}\n\nHypothesis:\n{hypothesis}\n\n\
             Respond with JSON: {{\"label\": \"entailment|neutral|contradiction\", \
             \"entailment\": 0.0-1.0, \"contradiction\": 0.0-1.0}}"
        );
        let mut request = CompletionRequest::new(NLI_SYSTEM, prompt);
        request.temperature = Some(0.0);
        let reply = self.llm.complete(request).await?;
        parse_entailment(&reply).ok_or_else(|| ProviderError::ResponseParse {
            provider: "nli".into(),
            message: "expected {label, entailment, contradiction}".into(),
        })
    }
}

fn parse_entailment(reply: &str) -> Option<Entailment> {
    let value = extract_json(reply)?;
    let prob = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_f64)
            .filter(|p| p.is_finite())
            .map(|p| p.clamp(0.0, 1.0))
    };
    let label = value
        .get("label")
        .and_then(Value::as_str)
        .map(|l| l.trim().to_ascii_lowercase());
    let from_label = |target: &str| {
        label
            .as_deref()
            .map(|l| if l.starts_with(target) { 1.0 } else { 0.0 })
    };
    Some(Entailment {
        entailment: prob("entailment").or_else(|| from_label("entail"))?,
        contradiction: prob("contradiction").or_else(|| from_label("contradict"))?,
    })
}

/// Outcome of verifying one claim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verified: bool,
    /// The layer that succeeded, or the last layer attempted.
    pub method: VerificationMethod,
    /// Score of the deciding layer; the best score seen when unverified.
    pub confidence: f64,
    pub excerpt: Option<String>,
    /// The classifier found the source contradicting the claim.
    pub refuted: bool,
    /// A collaborator failed, so the result is not a real negative.
    pub inconclusive: bool,
}

impl VerificationResult {
    fn unverified(method: VerificationMethod, confidence: f64) -> Self {
        Self {
            verified: false,
            method,
            confidence,
            excerpt: None,
            refuted: false,
            inconclusive: false,
        }
    }

    /// Copy the result onto the claim.
    pub fn apply_to(&self, claim: &mut Claim) {
        claim.verified = self.verified;
        claim.verification_method = self.method;
        claim.verification_confidence = self.confidence;
        claim.excerpt = self.excerpt.clone();
        claim.refuted = self.refuted;
    }
}

/// Per-source material reused across all of that source's claims.
struct SourceEvidence<'a> {
    source: &'a Source,
    normalized: NormalizedText,
    windows: Vec<TextWindow>,
    window_embeddings: Vec<Option<Vec<f32>>>,
}

/// Counts by outcome, for logs and the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub exact: usize,
    pub semantic: usize,
    pub nli: usize,
    pub unverified: usize,
    pub refuted: usize,
    pub inconclusive: usize,
}

pub struct Verifier {
    config: VerificationConfig,
    embedder: Arc<dyn Embedder>,
    classifier: Option<Arc<dyn EntailmentClassifier>>,
}

impl Verifier {
    pub fn new(config: VerificationConfig, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            embedder,
            classifier: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn EntailmentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Minimum confidence for a verified result of `method`.
    pub fn threshold(&self, method: VerificationMethod) -> f64 {
        match method {
            VerificationMethod::Exact => 1.0,
            VerificationMethod::Semantic => self.config.semantic_threshold as f64,
            VerificationMethod::Nli => self.config.nli_threshold,
            VerificationMethod::None => 0.0,
        }
    }

    /// Verify a single claim against its source.
    pub async fn verify(&self, claim: &Claim, source: &Source) -> VerificationResult {
        let evidence = self.prepare(source).await;
        self.verify_with(claim, &evidence).await
    }

    /// Verify every claim in place and return the results in claim order.
    ///
    /// Claims whose source is missing from `sources` stay unverified.
    pub async fn verify_all(&self, claims: &mut [Claim], sources: &[Source]) -> Vec<VerificationResult> {
        let by_id: HashMap<&str, &Source> = sources.iter().map(|s| (s.id.as_str(), s)).collect();

        let mut needed: Vec<&Source> = Vec::new();
        for claim in claims.iter() {
            if let Some(source) = by_id.get(claim.source_id.as_str())
                && !needed.iter().any(|s| s.id == source.id)
            {
                needed.push(*source);
            }
        }
        let prepared = join_all(needed.iter().map(|s| self.prepare(*s))).await;
        let evidence: HashMap<&str, SourceEvidence<'_>> = prepared
            .into_iter()
            .map(|e| (e.source.id.as_str(), e))
            .collect();

        let results = join_all(claims.iter().map(|claim| async {
            match evidence.get(claim.source_id.as_str()) {
                Some(ev) => self.verify_with(claim, ev).await,
                None => VerificationResult::unverified(VerificationMethod::None, 0.0),
            }
        }))
        .await;

        let mut summary = VerificationSummary::default();
        for (claim, result) in claims.iter_mut().zip(&results) {
            result.apply_to(claim);
            match (result.verified, result.method) {
                (true, VerificationMethod::Exact) => summary.exact += 1,
                (true, VerificationMethod::Semantic) => summary.semantic += 1,
                (true, VerificationMethod::Nli) => summary.nli += 1,
                _ => summary.unverified += 1,
            }
            summary.refuted += usize::from(result.refuted);
            summary.inconclusive += usize::from(result.inconclusive);
        }
        info!(
            claims = claims.len(),
            exact = summary.exact,
            semantic = summary.semantic,
            nli = summary.nli,
            unverified = summary.unverified,
            refuted = summary.refuted,
            "Verification complete"
        );
        results
    }

    async fn prepare<'a>(&self, source: &'a Source) -> SourceEvidence<'a> {
        let windows = text::sentence_windows(
            &source.text,
            self.config.window_chars,
            self.config.window_overlap,
        );
        let embedded = join_all(windows.iter().map(|w| self.embedder.embed(&w.text))).await;
        let window_embeddings = embedded
            .into_iter()
            .map(|r| match r {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!(source = %source.id, error = %e, "Window embedding failed");
                    None
                }
            })
            .collect();
        SourceEvidence {
            source,
            normalized: NormalizedText::new(&source.text),
            windows,
            window_embeddings,
        }
    }

    async fn verify_with(&self, claim: &Claim, evidence: &SourceEvidence<'_>) -> VerificationResult {
        // Layer 1: exact.
        if let Some((start, end)) = evidence.normalized.find(&text::normalize(&claim.text)) {
            return VerificationResult {
                verified: true,
                method: VerificationMethod::Exact,
                confidence: 1.0,
                excerpt: Some(text::excerpt_around(
                    &evidence.source.text,
                    start,
                    end,
                    self.config.excerpt_context_chars,
                )),
                refuted: false,
                inconclusive: false,
            };
        }

        // Layer 2: semantic windows.
        let claim_embedding = match self.embedder.embed(&claim.text).await {
            Ok(v) => v,
            Err(e) => {
                warn!(claim = %claim.id, error = %e, "Claim embedding failed, verification inconclusive");
                return VerificationResult {
                    inconclusive: true,
                    ..VerificationResult::unverified(VerificationMethod::Semantic, 0.0)
                };
            }
        };
        let mut ranked: Vec<(f32, &TextWindow)> = evidence
            .windows
            .iter()
            .zip(&evidence.window_embeddings)
            .filter_map(|(w, e)| e.as_ref().map(|e| (cosine_similarity(&claim_embedding, e), w)))
            .collect();
        ranked.sort_by(|a, b| b.0.total_cmp(&a.0).then_with(|| a.1.start.cmp(&b.1.start)));

        let best_semantic = ranked.first().map(|(s, _)| *s as f64).unwrap_or(0.0);
        if let Some((score, window)) = ranked.first()
            && *score >= self.config.semantic_threshold
        {
            return VerificationResult {
                verified: true,
                method: VerificationMethod::Semantic,
                confidence: *score as f64,
                excerpt: Some(window.text.clone()),
                refuted: false,
                inconclusive: false,
            };
        }

        // Layer 3: entailment over the best windows.
        let classifier = match &self.classifier {
            Some(c) if self.config.enable_nli && !ranked.is_empty() => c,
            _ => {
                let mut result = VerificationResult::unverified(VerificationMethod::Semantic, best_semantic);
                result.inconclusive = evidence.windows.len() != ranked.len();
                return result;
            }
        };
        let top: Vec<&TextWindow> = ranked
            .iter()
            .take(self.config.nli_top_windows.max(1))
            .map(|(_, w)| *w)
            .collect();
        let scores = join_all(top.iter().map(|w| classifier.classify(&w.text, &claim.text))).await;

        let mut best: Option<(Entailment, &TextWindow)> = None;
        let mut max_contradiction: f64 = 0.0;
        for (window, score) in top.iter().zip(scores) {
            match score {
                Ok(s) => {
                    max_contradiction = max_contradiction.max(s.contradiction);
                    if best.is_none_or(|(b, _)| s.entailment > b.entailment) {
                        best = Some((s, *window));
                    }
                }
                Err(e) => debug!(claim = %claim.id, error = %e, "Entailment check failed"),
            }
        }

        match best {
            Some((s, window)) if s.entailment >= self.config.nli_threshold => VerificationResult {
                verified: true,
                method: VerificationMethod::Nli,
                confidence: s.entailment,
                excerpt: Some(window.text.clone()),
                refuted: false,
                inconclusive: false,
            },
            Some((s, _)) => VerificationResult {
                refuted: max_contradiction >= self.config.nli_threshold,
                ..VerificationResult::unverified(VerificationMethod::Nli, best_semantic.max(s.entailment))
            },
            None => VerificationResult {
                inconclusive: true,
                ..VerificationResult::unverified(VerificationMethod::Nli, best_semantic)
            },
        }
    }
}
