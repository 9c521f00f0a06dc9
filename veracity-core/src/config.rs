//! Configuration system for Veracity.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> CLI overrides. Configuration is loaded
//! from `~/.config/veracity/config.toml` and/or `.veracity/config.toml` in the
//! working directory.
//!
//! Every numeric threshold the pipeline relies on lives here so deployments can
//! tune them without code changes.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::research::session::ResearchPhase;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeracityConfig {
    pub curation: CurationConfig,
    pub credibility: CredibilityWeights,
    pub verification: VerificationConfig,
    pub graph: GraphConfig,
    pub debate: DebateConfig,
    pub extraction: ExtractionConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
    pub deadlines: DeadlineConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub crawler: CrawlerConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

/// Source curation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CurationConfig {
    /// Cosine similarity above which two sources are near-duplicates.
    pub semantic_dedup_threshold: f32,
    /// Sources scoring below this credibility are discarded.
    pub min_credibility: f64,
    /// Sources less similar than this to their query are discarded.
    pub min_relevance: f32,
    /// Weight of credibility in the final ranking (relevance gets the remainder).
    pub credibility_rank_weight: f64,
    /// Characters of source text embedded for dedup and relevance.
    pub embed_chars: usize,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            semantic_dedup_threshold: 0.92,
            min_credibility: 0.3,
            min_relevance: 0.15,
            credibility_rank_weight: 0.6,
            embed_chars: 2_000,
        }
    }
}

/// Weights of the independent credibility signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CredibilityWeights {
    /// `.edu`, `.gov`, and encyclopedic domains.
    pub authority_institutional: f64,
    /// Curated list of reputable publishers.
    pub authority_trusted: f64,
    /// Anything not otherwise classified.
    pub authority_default: f64,
    /// User-generated content hosts.
    pub authority_low: f64,
    pub citations: f64,
    pub methodology: f64,
    /// Maximum contribution of word-count sufficiency.
    pub depth: f64,
    /// Word count at which depth saturates.
    pub depth_saturation_words: usize,
    /// Maximum contribution of recency.
    pub recency: f64,
    pub recency_half_life_days: f64,
    /// Recency credit for sources without a publish date.
    pub undated_recency: f64,
}

impl Default for CredibilityWeights {
    fn default() -> Self {
        Self {
            authority_institutional: 0.40,
            authority_trusted: 0.35,
            authority_default: 0.25,
            authority_low: 0.10,
            citations: 0.15,
            methodology: 0.15,
            depth: 0.20,
            depth_saturation_words: 2_000,
            recency: 0.10,
            recency_half_life_days: 365.0,
            undated_recency: 0.05,
        }
    }
}

/// Claim verification thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    pub semantic_threshold: f32,
    pub nli_threshold: f64,
    /// Run the entailment layer when a classifier is available.
    pub enable_nli: bool,
    pub window_chars: usize,
    pub window_overlap: usize,
    /// Number of best semantic windows handed to the entailment layer.
    pub nli_top_windows: usize,
    /// Characters of context kept around an exact match.
    pub excerpt_context_chars: usize,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            semantic_threshold: 0.8,
            nli_threshold: 0.7,
            enable_nli: true,
            window_chars: 500,
            window_overlap: 100,
            nli_top_windows: 3,
            excerpt_context_chars: 200,
        }
    }
}

/// Knowledge graph relation thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Minimum claim similarity before a SUPPORTS/CONTRADICTS edge is considered.
    pub relation_threshold: f32,
    /// Claims refuted by their own source take no part in polarity edges.
    pub exclude_refuted: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            relation_threshold: 0.6,
            exclude_refuted: true,
        }
    }
}

/// Debate protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebateConfig {
    pub enabled: bool,
    /// CONTRADICTS edges above this confidence trigger debate.
    pub contradiction_threshold: f64,
    pub max_rounds: u32,
    /// Maximum spread of implied belief for a consensus outcome.
    pub consensus_tolerance: f64,
    /// Minimum mean confidence in the agreed side for a consensus outcome.
    pub min_consensus_confidence: f64,
    pub max_clusters: usize,
    pub max_claims_per_cluster: usize,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            contradiction_threshold: 0.7,
            max_rounds: 2,
            consensus_tolerance: 0.2,
            min_consensus_confidence: 0.5,
            max_clusters: 5,
            max_claims_per_cluster: 6,
        }
    }
}

/// Claim extraction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Agent roles that extract claims, run concurrently over every batch.
    pub roles: Vec<String>,
    /// Agent roles that argue in debates, assigned round-robin to claims.
    pub debate_roles: Vec<String>,
    pub batch_size: usize,
    /// Characters of each source handed to an agent.
    pub source_chars: usize,
    pub max_claims_per_source: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            roles: vec!["scout".into(), "analyst".into()],
            debate_roles: vec!["analyst".into(), "skeptic".into()],
            batch_size: 3,
            source_chars: 6_000,
            max_claims_per_source: 8,
        }
    }
}

/// Worker pool sizes and per-host pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub crawl_workers: usize,
    pub extraction_workers: usize,
    pub embedding_workers: usize,
    pub llm_workers: usize,
    /// Minimum gap between two requests to the same host.
    pub domain_min_interval_ms: u64,
    /// Random extra gap added on top of the minimum.
    pub domain_jitter_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            crawl_workers: 10,
            extraction_workers: 4,
            embedding_workers: 8,
            llm_workers: 4,
            domain_min_interval_ms: 500,
            domain_jitter_ms: 1_500,
        }
    }
}

/// Retry and timeout policy for external calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: bool,
    pub search_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub llm_timeout_secs: u64,
    pub embedding_timeout_secs: u64,
    /// Consecutive failures before a provider is skipped.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff_ms: 500,
            max_backoff_ms: 8_000,
            jitter: true,
            search_timeout_secs: 15,
            fetch_timeout_secs: 20,
            llm_timeout_secs: 300,
            embedding_timeout_secs: 30,
            breaker_threshold: 5,
            breaker_cooldown_secs: 60,
        }
    }
}

/// Per-phase deadlines in seconds. Exceeding one forces the session to ERROR.
/// A value of 0 runs that phase without a deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadlineConfig {
    pub planning_secs: u64,
    pub searching_secs: u64,
    pub crawling_secs: u64,
    pub curating_secs: u64,
    pub extracting_secs: u64,
    pub building_graph_secs: u64,
    pub verifying_secs: u64,
    pub debating_secs: u64,
    pub synthesizing_secs: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            planning_secs: 60,
            searching_secs: 180,
            crawling_secs: 600,
            curating_secs: 300,
            extracting_secs: 1_200,
            building_graph_secs: 300,
            verifying_secs: 900,
            debating_secs: 900,
            synthesizing_secs: 600,
        }
    }
}

impl DeadlineConfig {
    /// Deadline for a phase; terminal phases and phases set to 0 have none.
    pub fn for_phase(&self, phase: ResearchPhase) -> Option<Duration> {
        let secs = match phase {
            ResearchPhase::Planning => self.planning_secs,
            ResearchPhase::Searching => self.searching_secs,
            ResearchPhase::Crawling => self.crawling_secs,
            ResearchPhase::Curating => self.curating_secs,
            ResearchPhase::Extracting => self.extracting_secs,
            ResearchPhase::BuildingGraph => self.building_graph_secs,
            ResearchPhase::Verifying => self.verifying_secs,
            ResearchPhase::Debating => self.debating_secs,
            ResearchPhase::Synthesizing => self.synthesizing_secs,
            ResearchPhase::Complete | ResearchPhase::Error => return None,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Model identifier sent to the chat completions endpoint.
    pub model: String,
    /// Base URL of an OpenAI-compatible endpoint.
    pub base_url: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Per-role model overrides, keyed by role name.
    #[serde(default)]
    pub role_models: std::collections::BTreeMap<String, String>,
    /// Providers tried in order after the primary fails.
    #[serde(default)]
    pub fallbacks: Vec<FallbackLlmConfig>,
}

/// A fallback LLM endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackLlmConfig {
    pub model: String,
    pub base_url: String,
    pub api_key_env: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "qwen2.5:14b".into(),
            base_url: "http://localhost:11434/v1".into(),
            api_key_env: "VERACITY_LLM_API_KEY".into(),
            temperature: 0.3,
            max_tokens: 2_048,
            role_models: Default::default(),
            fallbacks: Vec::new(),
        }
    }
}

/// Embedding provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider name: "local" (default) or "ollama".
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub base_url: String,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "local".into(),
            model: None,
            base_url: "http://localhost:11434".into(),
            dimensions: 384,
        }
    }
}

/// Web search configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Provider names in fallback order: "duckduckgo_html", "duckduckgo_instant".
    pub providers: Vec<String>,
    pub results_per_query: usize,
    /// Minimum gap between two requests to the same search provider.
    pub min_interval_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            providers: vec!["duckduckgo_html".into(), "duckduckgo_instant".into()],
            results_per_query: 10,
            min_interval_ms: 1_000,
        }
    }
}

/// Crawler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    pub user_agent: String,
    pub max_text_chars: usize,
    /// Pages with less extracted text than this are dropped.
    pub min_text_chars: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("Veracity/", env!("CARGO_PKG_VERSION")).into(),
            max_text_chars: 50_000,
            min_text_chars: 200,
        }
    }
}

/// Session storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Overrides the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the data directory, falling back to the platform default.
    pub fn resolve_data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            directories::ProjectDirs::from("dev", "veracity", "veracity")
                .map(|d| d.data_dir().to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".veracity"))
        })
    }
}

/// HTTP control surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Capacity of each session's event channel.
    pub event_buffer: usize,
    /// Most recent events replayed to late subscribers, per session.
    pub event_history_per_session: usize,
    /// Finished sessions whose history is kept for replay.
    pub finished_session_histories: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            event_buffer: 256,
            event_history_per_session: 10_000,
            finished_session_histories: 64,
        }
    }
}

/// Load configuration from all layers.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&VeracityConfig>,
) -> Result<VeracityConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(VeracityConfig::default()));

    if let Some(config_dir) = directories::ProjectDirs::from("dev", "veracity", "veracity") {
        let user_config = config_dir.config_dir().join("config.toml");
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(".veracity").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // VERACITY_CURATION__MIN_RELEVANCE, VERACITY_LLM__MODEL, ...
    figment = figment.merge(Env::prefixed("VERACITY_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_thresholds() {
        let config = VeracityConfig::default();
        assert!((config.curation.semantic_dedup_threshold - 0.92).abs() < f32::EPSILON);
        assert!((config.verification.semantic_threshold - 0.8).abs() < f32::EPSILON);
        assert_eq!(config.debate.max_rounds, 2);
        assert_eq!(config.concurrency.crawl_workers, 10);
    }

    #[test]
    fn test_deadline_for_terminal_phases() {
        let deadlines = DeadlineConfig::default();
        assert!(deadlines.for_phase(ResearchPhase::Complete).is_none());
        assert!(deadlines.for_phase(ResearchPhase::Error).is_none());
        assert_eq!(
            deadlines.for_phase(ResearchPhase::Crawling),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_zero_deadline_disables_phase_limit() {
        let deadlines = DeadlineConfig {
            verifying_secs: 0,
            ..Default::default()
        };
        assert_eq!(deadlines.for_phase(ResearchPhase::Verifying), None);
        assert_eq!(
            deadlines.for_phase(ResearchPhase::Debating),
            Some(Duration::from_secs(900))
        );
    }

    #[test]
    fn test_workspace_config_layer() {
        let dir = TempDir::new().unwrap();
        let cfg_dir = dir.path().join(".veracity");
        std::fs::create_dir_all(&cfg_dir).unwrap();
        std::fs::write(
            cfg_dir.join("config.toml"),
            "[debate]\nmax_rounds = 1\n\n[curation]\nmin_credibility = 0.45\n",
        )
        .unwrap();

        let config = load_config(Some(dir.path()), None).unwrap();
        assert_eq!(config.debate.max_rounds, 1);
        assert!((config.curation.min_credibility - 0.45).abs() < f64::EPSILON);
        // Untouched sections keep their defaults.
        assert_eq!(config.verification.window_chars, 500);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = VeracityConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: VeracityConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.search.providers, config.search.providers);
        assert_eq!(parsed.retry.max_retries, config.retry.max_retries);
    }

    #[test]
    fn test_explicit_data_dir() {
        let storage = StorageConfig {
            data_dir: Some(PathBuf::from("/tmp/veracity-test")),
        };
        assert_eq!(
            storage.resolve_data_dir(),
            PathBuf::from("/tmp/veracity-test")
        );
    }
}
