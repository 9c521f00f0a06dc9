//! Source curation: exact dedup, credibility scoring, semantic dedup, and
//! relevance filtering, in that order.
//!
//! Every decision has a total tie-break, so curation is deterministic for
//! identical inputs, and re-curating a curated set returns it unchanged.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::credibility::{CredibilityAssessment, CredibilityScorer};
use super::sources::{RawSource, Source};
use crate::config::CurationConfig;
use crate::embeddings::{Embedder, cosine_similarity};
use crate::error::ProviderError;
use crate::text;

/// How many sources each curation step removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurationStats {
    pub input: usize,
    pub exact_duplicates: usize,
    pub embedding_failures: usize,
    pub semantic_duplicates: usize,
    pub low_credibility: usize,
    pub irrelevant: usize,
    /// Valid sources cut by the target count.
    pub over_target: usize,
    pub output: usize,
}

/// Curated sources, best first, plus what was dropped.
#[derive(Debug, Clone)]
pub struct CurationOutcome {
    pub sources: Vec<Source>,
    pub stats: CurationStats,
}

struct Candidate {
    raw: RawSource,
    id: String,
    assessment: CredibilityAssessment,
    embedding: Vec<f32>,
}

pub struct Curator {
    config: CurationConfig,
    scorer: CredibilityScorer,
    embedder: Arc<dyn Embedder>,
}

impl Curator {
    pub fn new(config: CurationConfig, scorer: CredibilityScorer, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            config,
            scorer,
            embedder,
        }
    }

    /// Curate raw sources for `query`, keeping at most `target` of them.
    ///
    /// A source whose embedding fails is dropped. Failing to embed the query
    /// itself fails the whole curation.
    pub async fn curate(
        &self,
        raw: Vec<RawSource>,
        query: &str,
        target: usize,
    ) -> Result<CurationOutcome, ProviderError> {
        let mut stats = CurationStats {
            input: raw.len(),
            ..Default::default()
        };

        let unique = exact_dedup(raw);
        stats.exact_duplicates = stats.input - unique.len();

        let query_embedding = self.embedder.embed(query).await?;
        let sub_query_embeddings = self.embed_sub_queries(&unique, query).await;

        let mut candidates = self.embed_candidates(unique).await;
        stats.embedding_failures = stats.input - stats.exact_duplicates - candidates.len();

        candidates.sort_by(canonical_order);
        let before = candidates.len();
        let candidates = self.semantic_dedup(candidates);
        stats.semantic_duplicates = before - candidates.len();

        let before = candidates.len();
        let candidates: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| c.assessment.score >= self.config.min_credibility)
            .collect();
        stats.low_credibility = before - candidates.len();

        let mut scored = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let mut relevance = cosine_similarity(&candidate.embedding, &query_embedding);
            if let Some(Some(sub)) = sub_query_embeddings.get(&candidate.raw.sub_query) {
                relevance = relevance.max(cosine_similarity(&candidate.embedding, sub));
            }
            if relevance < self.config.min_relevance {
                stats.irrelevant += 1;
                debug!(url = %candidate.raw.url, relevance, "Dropping irrelevant source");
                continue;
            }
            scored.push((candidate, relevance));
        }

        let weight = self.config.credibility_rank_weight;
        let rank = |(c, r): &(Candidate, f32)| weight * c.assessment.score + (1.0 - weight) * *r as f64;
        scored.sort_by(|a, b| {
            rank(b)
                .partial_cmp(&rank(a))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.id.cmp(&b.0.id))
        });
        if scored.len() > target {
            stats.over_target = scored.len() - target;
            scored.truncate(target);
        }

        let sources: Vec<Source> = scored
            .into_iter()
            .map(|(c, relevance)| into_source(c, relevance))
            .collect();
        stats.output = sources.len();

        info!(
            input = stats.input,
            exact = stats.exact_duplicates,
            semantic = stats.semantic_duplicates,
            low_credibility = stats.low_credibility,
            irrelevant = stats.irrelevant,
            output = stats.output,
            "Curation complete"
        );
        Ok(CurationOutcome { sources, stats })
    }

    async fn embed_candidates(&self, unique: Vec<RawSource>) -> Vec<Candidate> {
        let texts: Vec<String> = unique
            .iter()
            .map(|r| format!("{} {}", r.title, text::truncate_chars(&r.text, self.config.embed_chars)))
            .collect();
        let embeddings = join_all(texts.iter().map(|t| self.embedder.embed(t))).await;

        unique
            .into_iter()
            .zip(embeddings)
            .filter_map(|(raw, embedding)| match embedding {
                Ok(embedding) => Some(Candidate {
                    id: raw.source_id(),
                    assessment: self.scorer.assess(&raw),
                    raw,
                    embedding,
                }),
                Err(e) => {
                    warn!(url = %raw.url, error = %e, "Dropping source that could not be embedded");
                    None
                }
            })
            .collect()
    }

    /// Embeddings of each distinct sub-query other than the query itself.
    /// A failed sub-query embedding only loses that relevance signal.
    async fn embed_sub_queries(
        &self,
        sources: &[RawSource],
        query: &str,
    ) -> HashMap<String, Option<Vec<f32>>> {
        let distinct: Vec<&str> = sources
            .iter()
            .map(|s| s.sub_query.as_str())
            .filter(|q| !q.is_empty() && *q != query)
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let embeddings = join_all(distinct.iter().map(|q| self.embedder.embed(q))).await;
        distinct
            .into_iter()
            .zip(embeddings)
            .map(|(q, e)| (q.to_string(), e.ok()))
            .collect()
    }

    /// Keep a candidate only if it is not a near-duplicate of any candidate
    /// already kept. Input must be in canonical order, so the better-scored
    /// source of each near-duplicate pair survives.
    fn semantic_dedup(&self, ordered: Vec<Candidate>) -> Vec<Candidate> {
        let mut kept: Vec<Candidate> = Vec::with_capacity(ordered.len());
        for candidate in ordered {
            let duplicate_of = kept.iter().find(|k| {
                cosine_similarity(&k.embedding, &candidate.embedding)
                    > self.config.semantic_dedup_threshold
            });
            match duplicate_of {
                Some(kept_source) => debug!(
                    dropped = %candidate.raw.url,
                    kept = %kept_source.raw.url,
                    "Semantic duplicate"
                ),
                None => kept.push(candidate),
            }
        }
        kept
    }
}

/// One representative per content hash: earliest fetched, then longer text,
/// then smaller URL.
fn exact_dedup(raw: Vec<RawSource>) -> Vec<RawSource> {
    let mut groups: BTreeMap<String, RawSource> = BTreeMap::new();
    for source in raw {
        match groups.get(&source.content_hash) {
            Some(existing) if !preferred(&source, existing) => {}
            _ => {
                groups.insert(source.content_hash.clone(), source);
            }
        }
    }
    groups.into_values().collect()
}

fn preferred(a: &RawSource, b: &RawSource) -> bool {
    a.fetched_at
        .cmp(&b.fetched_at)
        .then_with(|| b.text.chars().count().cmp(&a.text.chars().count()))
        .then_with(|| a.url.cmp(&b.url))
        == Ordering::Less
}

/// Credibility descending, then fetched earliest, then id.
fn canonical_order(a: &Candidate, b: &Candidate) -> Ordering {
    b.assessment
        .score
        .partial_cmp(&a.assessment.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.raw.fetched_at.cmp(&b.raw.fetched_at))
        .then_with(|| a.id.cmp(&b.id))
}

fn into_source(candidate: Candidate, relevance: f32) -> Source {
    let Candidate {
        raw, id, assessment, ..
    } = candidate;
    Source {
        id,
        url: raw.url,
        title: raw.title,
        content_hash: raw.content_hash,
        text: raw.text,
        word_count: raw.word_count,
        domain: raw.domain,
        source_type: assessment.source_type,
        credibility: assessment.score,
        credibility_breakdown: assessment.breakdown,
        has_citations: assessment.has_citations,
        has_methodology: assessment.has_methodology,
        published_at: raw.published_at,
        fetched_at: raw.fetched_at,
        relevance,
        sub_query: raw.sub_query,
    }
}
