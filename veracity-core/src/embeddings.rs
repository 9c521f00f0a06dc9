//! Pluggable embedding providers.
//!
//! Provides a trait-based abstraction over embedding models, with a local
//! hashed term-frequency embedder (always available, deterministic) and an
//! Ollama HTTP embedder. [`GuardedEmbedder`] adds pool bounding, timeouts, and
//! retries around any provider.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::error::ProviderError;
use crate::retry::RetryPolicy;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// Generate embeddings for a batch of texts, in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize;

    fn provider_name(&self) -> &str;
}

/// Compute cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

/// Local hashed term-frequency embedder.
///
/// Deterministic and dependency-free; similarity reflects lexical overlap
/// rather than meaning.
#[derive(Debug, Clone)]
pub struct LocalEmbedder {
    dimensions: usize,
}

impl LocalEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Synchronous embedding; the async trait method delegates here.
    pub fn embed_now(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];

        let mut tf: HashMap<String, usize> = HashMap::new();
        for word in crate::text::tokens(text) {
            *tf.entry(word).or_insert(0) += 1;
        }
        if tf.is_empty() {
            return vector;
        }

        for (term, count) in &tf {
            let idx = djb2(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

impl Default for LocalEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

fn djb2(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(self.embed_now(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn provider_name(&self) -> &str {
        "local"
    }
}

/// Ollama embedder (uses the local Ollama API).
pub struct OllamaEmbedder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: Option<String>, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.unwrap_or_else(|| "nomic-embed-text".into()),
            dims,
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|e| ProviderError::Connection {
                provider: "ollama".into(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request {
                provider: "ollama".into(),
                message: format!("HTTP {status}: {body}"),
            });
        }

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| ProviderError::ResponseParse {
                    provider: "ollama".into(),
                    message: e.to_string(),
                })?;

        body.get("embedding")
            .and_then(|v| v.as_array())
            .map(|values| {
                values
                    .iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect::<Vec<f32>>()
            })
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ProviderError::ResponseParse {
                provider: "ollama".into(),
                message: "response has no embedding".into(),
            })
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }
}

/// Wraps an embedder with a shared concurrency pool and a retry policy.
pub struct GuardedEmbedder {
    inner: Arc<dyn Embedder>,
    pool: Arc<Semaphore>,
    policy: RetryPolicy,
}

impl GuardedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, pool: Arc<Semaphore>, policy: RetryPolicy) -> Self {
        Self {
            inner,
            pool,
            policy,
        }
    }
}

#[async_trait]
impl Embedder for GuardedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ProviderError::Connection {
                provider: self.inner.provider_name().to_string(),
                message: "embedding pool closed".into(),
            })?;
        self.policy
            .run("embed", || self.inner.embed(text))
            .await
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn provider_name(&self) -> &str {
        self.inner.provider_name()
    }
}

/// Build the configured embedding provider.
pub fn embedder_from_config(config: &crate::config::EmbeddingConfig) -> Arc<dyn Embedder> {
    match config.provider.as_str() {
        "ollama" => Arc::new(OllamaEmbedder::new(
            config.base_url.clone(),
            config.model.clone(),
            config.dimensions,
        )),
        "local" => Arc::new(LocalEmbedder::new(config.dimensions)),
        other => {
            tracing::warn!(provider = other, "Unknown embedding provider, using local");
            Arc::new(LocalEmbedder::new(config.dimensions))
        }
    }
}
