//! Sources and claims.
//!
//! A [`RawSource`] is what the crawler hands over; a [`Source`] is a curated,
//! scored, immutable record. [`Claim`]s always point at a curated source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::agents::AgentRole;
use crate::text;

/// Type of research source, inferred from its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Academic,
    News,
    Government,
    Encyclopedia,
    Webpage,
    Blog,
    Forum,
}

const ACADEMIC_HOSTS: &[&str] = &[
    "arxiv.org",
    "pubmed",
    "ncbi.nlm.nih.gov",
    "doi.org",
    "scholar.",
    "nature.com",
    "sciencedirect.com",
    "springer.com",
    "jstor.org",
    "semanticscholar.org",
    "thelancet.com",
    "nejm.org",
];

const NEWS_HOSTS: &[&str] = &[
    "news", "reuters", "bloomberg", "nytimes", "bbc.", "cnn.", "guardian", "apnews",
    "washingtonpost", "economist.com", "ft.com",
];

const BLOG_HOSTS: &[&str] = &["blog", "medium.com", "substack.com", "wordpress.com", "tumblr.com"];

const FORUM_HOSTS: &[&str] = &["reddit.com", "quora.com", "forum", "stackexchange.com", "4chan"];

impl SourceType {
    /// Classify a host name.
    pub fn from_domain(domain: &str) -> Self {
        let domain = domain.to_ascii_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| domain.contains(n));

        if domain.ends_with(".gov") || domain.contains(".gov.") {
            SourceType::Government
        } else if domain.ends_with(".edu") || domain.contains(".edu.") || has(ACADEMIC_HOSTS) {
            SourceType::Academic
        } else if domain.contains("wikipedia.org") || domain.contains("britannica.com") {
            SourceType::Encyclopedia
        } else if has(FORUM_HOSTS) {
            SourceType::Forum
        } else if has(NEWS_HOSTS) {
            SourceType::News
        } else if has(BLOG_HOSTS) {
            SourceType::Blog
        } else {
            SourceType::Webpage
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SourceType::Academic => "academic",
            SourceType::News => "news",
            SourceType::Government => "government",
            SourceType::Encyclopedia => "encyclopedia",
            SourceType::Webpage => "webpage",
            SourceType::Blog => "blog",
            SourceType::Forum => "forum",
        }
    }
}

/// Per-factor credibility contributions. They sum to the unclamped score.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CredibilityBreakdown {
    pub domain_authority: f64,
    pub citations: f64,
    pub methodology: f64,
    pub depth: f64,
    pub source_type: f64,
    pub recency: f64,
}

impl CredibilityBreakdown {
    pub fn total(&self) -> f64 {
        self.domain_authority
            + self.citations
            + self.methodology
            + self.depth
            + self.source_type
            + self.recency
    }
}

/// A fetched page before curation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSource {
    pub url: String,
    pub title: String,
    pub text: String,
    pub domain: String,
    pub content_hash: String,
    pub word_count: usize,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    /// The sub-query whose search produced this URL.
    pub sub_query: String,
}

impl RawSource {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        text: impl Into<String>,
        sub_query: impl Into<String>,
    ) -> Self {
        let url = url.into();
        let text = text.into();
        Self {
            domain: domain_of(&url),
            content_hash: text::content_hash(&text),
            word_count: text::word_count(&text),
            title: title.into(),
            url,
            text,
            published_at: None,
            fetched_at: Utc::now(),
            sub_query: sub_query.into(),
        }
    }

    pub fn with_published_at(mut self, published_at: DateTime<Utc>) -> Self {
        self.published_at = Some(published_at);
        self
    }

    pub fn with_fetched_at(mut self, fetched_at: DateTime<Utc>) -> Self {
        self.fetched_at = fetched_at;
        self
    }

    /// Stable id derived from the content hash.
    pub fn source_id(&self) -> String {
        format!("src-{}", self.content_hash)
    }
}

/// Host name of a URL, lowercased, without a leading `www.`.
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .map(|h| h.trim_start_matches("www.").to_string())
        .unwrap_or_default()
}

/// A curated research source. Immutable once admitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub url: String,
    pub title: String,
    pub content_hash: String,
    pub text: String,
    pub word_count: usize,
    pub domain: String,
    pub source_type: SourceType,
    /// Clamped to `[0, 1]`.
    pub credibility: f64,
    pub credibility_breakdown: CredibilityBreakdown,
    pub has_citations: bool,
    pub has_methodology: bool,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
    pub relevance: f32,
    pub sub_query: String,
}

impl Source {
    /// Convert back into crawler output, for re-curation.
    pub fn to_raw(&self) -> RawSource {
        RawSource {
            url: self.url.clone(),
            title: self.title.clone(),
            text: self.text.clone(),
            domain: self.domain.clone(),
            content_hash: self.content_hash.clone(),
            word_count: self.word_count,
            published_at: self.published_at,
            fetched_at: self.fetched_at,
            sub_query: self.sub_query.clone(),
        }
    }
}

/// Polarity of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stance {
    Positive,
    Negative,
}

impl Stance {
    /// Polarity implied by the wording of a statement.
    pub fn of(statement: &str) -> Self {
        if text::is_negated(statement) {
            Stance::Negative
        } else {
            Stance::Positive
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Stance::Positive => Stance::Negative,
            Stance::Negative => Stance::Positive,
        }
    }
}

/// Which verification layer produced the recorded result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    Exact,
    Semantic,
    Nli,
    #[default]
    None,
}

impl VerificationMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            VerificationMethod::Exact => "exact",
            VerificationMethod::Semantic => "semantic",
            VerificationMethod::Nli => "nli",
            VerificationMethod::None => "none",
        }
    }
}

/// A claim as an agent proposed it, before ids and verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimCandidate {
    /// Owning source; agents may omit it when a batch holds one source.
    pub source_id: Option<String>,
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub entities: Vec<String>,
    pub stance: Option<Stance>,
}

/// An atomic factual assertion extracted from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub source_id: String,
    pub text: String,
    /// Extraction confidence reported by the agent.
    pub confidence: f64,
    pub entities: Vec<String>,
    pub keywords: Vec<String>,
    pub stance: Stance,
    pub agent: AgentRole,
    pub verified: bool,
    pub verification_method: VerificationMethod,
    pub verification_confidence: f64,
    pub excerpt: Option<String>,
    /// The source's own text contradicts the claim.
    #[serde(default)]
    pub refuted: bool,
}

impl Claim {
    /// Deterministic claim id from the owning source and normalized text.
    pub fn id_for(source_id: &str, claim_text: &str) -> String {
        let hash = text::content_hash(&format!("{source_id} {claim_text}"));
        format!("clm-{}", &hash[..12])
    }
}
