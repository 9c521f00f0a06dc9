//! Source credibility scoring.
//!
//! The score is a weighted sum of independent signals, clamped into `[0, 1]`.
//! Recency is measured against the fetch timestamp rather than the wall clock,
//! so identical inputs always score identically.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, RwLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::sources::{CredibilityBreakdown, RawSource, SourceType};
use crate::config::CredibilityWeights;

const INSTITUTIONAL_SUFFIXES: &[&str] = &[".edu", ".gov", ".mil"];

const INSTITUTIONAL_MARKERS: &[&str] = &[
    ".ac.uk", ".ac.jp", ".ac.au", ".edu.", ".gov.", ".gc.ca", "wikipedia.org", "wikidata.org",
];

const TRUSTED_DOMAINS: &[&str] = &[
    "reuters.com",
    "apnews.com",
    "bloomberg.com",
    "wsj.com",
    "nytimes.com",
    "washingtonpost.com",
    "theguardian.com",
    "bbc.com",
    "bbc.co.uk",
    "npr.org",
    "economist.com",
    "nature.com",
    "science.org",
    "cell.com",
    "thelancet.com",
    "nejm.org",
    "jamanetwork.com",
    "pubmed.ncbi.nlm.nih.gov",
    "arxiv.org",
    "github.com",
    "stackoverflow.com",
];

const LOW_QUALITY_MARKERS: &[&str] = &[
    "blogspot.",
    "wordpress.com",
    "medium.com",
    "forum",
    "reddit.com",
    "quora.com",
];

const METHODOLOGY_TERMS: &[&str] = &[
    "methodology",
    "methods",
    "study design",
    "participants",
    "sample size",
    "inclusion criteria",
    "exclusion criteria",
    "randomized controlled trial",
    "cohort study",
    "statistical analysis",
    "p-value",
    "confidence interval",
];

static CITATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\(\d{4}\)",
        r"\[\d+\]",
        r"et al\.",
        r"doi:\s*10\.\d+",
        r"https?://doi\.org/",
        r"references?:",
        r"bibliography:",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Authority tier of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainAuthority {
    Institutional,
    Trusted,
    Default,
    LowQuality,
}

impl DomainAuthority {
    pub fn classify(domain: &str) -> Self {
        let domain = domain.to_ascii_lowercase();
        if INSTITUTIONAL_SUFFIXES.iter().any(|s| domain.ends_with(s))
            || INSTITUTIONAL_MARKERS.iter().any(|m| domain.contains(m))
        {
            DomainAuthority::Institutional
        } else if TRUSTED_DOMAINS
            .iter()
            .any(|t| domain == *t || domain.ends_with(&format!(".{t}")))
        {
            DomainAuthority::Trusted
        } else if LOW_QUALITY_MARKERS.iter().any(|m| domain.contains(m)) {
            DomainAuthority::LowQuality
        } else {
            DomainAuthority::Default
        }
    }

    fn weight(self, weights: &CredibilityWeights) -> f64 {
        match self {
            DomainAuthority::Institutional => weights.authority_institutional,
            DomainAuthority::Trusted => weights.authority_trusted,
            DomainAuthority::Default => weights.authority_default,
            DomainAuthority::LowQuality => weights.authority_low,
        }
    }
}

/// Process-wide memo of domain authority tiers, shared by every session.
///
/// Read-mostly: lookups take the read lock, first sightings take the write lock.
#[derive(Debug, Default)]
pub struct DomainCredibilityCache {
    entries: RwLock<HashMap<String, DomainAuthority>>,
}

impl DomainCredibilityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authority(&self, domain: &str) -> DomainAuthority {
        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(tier) = entries.get(domain) {
                return *tier;
            }
        }
        let tier = DomainAuthority::classify(domain);
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(domain.to_string(), tier);
        tier
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Credibility of one raw source.
#[derive(Debug, Clone, PartialEq)]
pub struct CredibilityAssessment {
    pub score: f64,
    pub breakdown: CredibilityBreakdown,
    pub source_type: SourceType,
    pub has_citations: bool,
    pub has_methodology: bool,
}

pub fn has_citations(text: &str) -> bool {
    let lower = text.to_lowercase();
    CITATION_PATTERNS.iter().any(|re| re.is_match(&lower))
}

pub fn has_methodology(text: &str) -> bool {
    let lower = text.to_lowercase();
    METHODOLOGY_TERMS.iter().any(|t| lower.contains(t))
}

fn source_type_bonus(source_type: SourceType) -> f64 {
    match source_type {
        SourceType::Academic => 0.10,
        SourceType::Government => 0.08,
        SourceType::News | SourceType::Encyclopedia => 0.05,
        SourceType::Webpage => 0.02,
        SourceType::Blog | SourceType::Forum => 0.0,
    }
}

/// Scores raw sources against configurable weights.
#[derive(Debug, Clone)]
pub struct CredibilityScorer {
    weights: CredibilityWeights,
    cache: Arc<DomainCredibilityCache>,
}

impl CredibilityScorer {
    pub fn new(weights: CredibilityWeights, cache: Arc<DomainCredibilityCache>) -> Self {
        Self { weights, cache }
    }

    pub fn assess(&self, source: &RawSource) -> CredibilityAssessment {
        let w = &self.weights;
        let source_type = SourceType::from_domain(&source.domain);
        let cited = has_citations(&source.text);
        let methodical = has_methodology(&source.text);

        let saturation = w.depth_saturation_words.max(1) as f64;
        let breakdown = CredibilityBreakdown {
            domain_authority: self.cache.authority(&source.domain).weight(w),
            citations: if cited { w.citations } else { 0.0 },
            methodology: if methodical { w.methodology } else { 0.0 },
            depth: (source.word_count as f64 / saturation).min(1.0) * w.depth,
            source_type: source_type_bonus(source_type),
            recency: self.recency(source.published_at, source.fetched_at),
        };

        CredibilityAssessment {
            score: breakdown.total().clamp(0.0, 1.0),
            breakdown,
            source_type,
            has_citations: cited,
            has_methodology: methodical,
        }
    }

    fn recency(&self, published_at: Option<DateTime<Utc>>, fetched_at: DateTime<Utc>) -> f64 {
        let Some(published) = published_at else {
            return self.weights.undated_recency;
        };
        let age_days = (fetched_at - published).num_seconds().max(0) as f64 / 86_400.0;
        let half_life = self.weights.recency_half_life_days.max(1.0);
        self.weights.recency * 0.5f64.powf(age_days / half_life)
    }
}
