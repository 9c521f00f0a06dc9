//! Language-model access for research agents and entailment classification.
//!
//! Supports any endpoint that follows the OpenAI chat completions format
//! (OpenAI, OpenRouter, Ollama, vLLM, LM Studio). [`LlmClient`] puts a bounded
//! pool and an ordered fallback chain in front of the configured providers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::config::{LlmConfig, RetryConfig};
use crate::error::ProviderError;
use crate::retry::{ProviderChain, RetryPolicy};

/// A single-turn completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    /// Falls back to the client default when unset.
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Overrides the provider's default model.
    pub model: Option<String>,
    /// Ask the endpoint for a JSON object response when supported.
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            prompt: prompt.into(),
            temperature: None,
            max_tokens: None,
            model: None,
            json_mode: true,
        }
    }
}

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError>;

    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat completions provider.
pub struct OpenAiCompatProvider {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiCompatProvider {
    /// Create a provider, reading the API key from `api_key_env`.
    ///
    /// Local endpoints (localhost / 127.0.0.1) work without a key.
    pub fn new(model: &str, base_url: &str, api_key_env: &str) -> Result<Self, ProviderError> {
        let is_local = base_url.contains("localhost") || base_url.contains("127.0.0.1");
        let api_key = std::env::var(api_key_env)
            .ok()
            .or_else(|| {
                if is_local {
                    debug!("No API key set for local provider; using dummy bearer token");
                    Some("ollama".to_string())
                } else {
                    None
                }
            })
            .ok_or_else(|| ProviderError::AuthFailed {
                provider: format!("{base_url}: env var '{api_key_env}' not set"),
            })?;

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
        })
    }

    fn map_http_error(&self, status: reqwest::StatusCode, body: &str) -> ProviderError {
        let provider = self.model.clone();
        match status.as_u16() {
            401 | 403 => ProviderError::AuthFailed { provider },
            429 => {
                let retry_after_secs = serde_json::from_str::<Value>(body)
                    .ok()
                    .and_then(|v| {
                        v.get("error")?
                            .get("message")?
                            .as_str()
                            .map(|s| s.to_string())
                    })
                    .and_then(|msg| {
                        msg.split("in ")
                            .last()
                            .and_then(|s| s.trim_end_matches('s').trim().parse::<u64>().ok())
                    })
                    .unwrap_or(5);
                ProviderError::RateLimited {
                    provider,
                    retry_after_secs,
                }
            }
            code if code >= 500 => ProviderError::Request {
                provider,
                message: format!("Server error ({status}): {body}"),
            },
            code => ProviderError::Rejected {
                provider,
                status: code,
                message: body.chars().take(500).collect(),
            },
        }
    }
}

/// Pull the assistant text out of a chat completions response body.
fn parse_completion(body: &Value, provider: &str) -> Result<String, ProviderError> {
    body.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| ProviderError::ResponseParse {
            provider: provider.to_string(),
            message: "missing choices[0].message.content".into(),
        })
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let model = request.model.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.temperature.unwrap_or(0.3),
            "stream": false,
        });
        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if request.json_mode {
            body["response_format"] = json!({ "type": "json_object" });
        }

        debug!(url = %url, model, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Connection {
                provider: self.model.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Connection {
                provider: self.model.clone(),
                message: format!("Failed to read response body: {e}"),
            })?;
        if !status.is_success() {
            return Err(self.map_http_error(status, &text));
        }

        let json: Value = serde_json::from_str(&text).map_err(|e| ProviderError::ResponseParse {
            provider: self.model.clone(),
            message: format!("Invalid JSON: {e}"),
        })?;
        parse_completion(&json, &self.model)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

type MockHandler = dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync;

/// Scripted provider for tests and offline runs.
///
/// Queued responses are served first, in order; after that the handler (if
/// any) answers, and otherwise the call fails.
pub struct MockLlmProvider {
    model: String,
    queued: Mutex<VecDeque<Result<String, ProviderError>>>,
    handler: Option<Box<MockHandler>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".into(),
            queued: Mutex::new(VecDeque::new()),
            handler: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every request with the same text.
    pub fn with_response(text: &str) -> Self {
        let text = text.to_string();
        Self::with_handler(move |_| Ok(text.clone()))
    }

    /// Answer each request by inspecting it.
    pub fn with_handler(
        handler: impl Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Some(Box::new(handler)),
            ..Self::new()
        }
    }

    pub fn queue_response(&self, response: Result<String, ProviderError>) {
        self.queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(response);
    }

    /// Every request seen so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(request.clone());

        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front();
        if let Some(response) = queued {
            return response;
        }
        match &self.handler {
            Some(handler) => handler(&request),
            None => Err(ProviderError::Request {
                provider: self.model.clone(),
                message: "no scripted response".into(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Pool-bounded access to an ordered chain of LLM providers.
pub struct LlmClient {
    chain: ProviderChain<dyn LlmProvider>,
    pool: Arc<Semaphore>,
    temperature: f32,
    max_tokens: u32,
}

impl LlmClient {
    pub fn new(chain: ProviderChain<dyn LlmProvider>, pool: Arc<Semaphore>) -> Self {
        Self {
            chain,
            pool,
            temperature: 0.3,
            max_tokens: 2_048,
        }
    }

    /// Single-provider client with one attempt and no timeout. Used in tests.
    pub fn single(provider: Arc<dyn LlmProvider>) -> Self {
        let chain = ProviderChain::new("llm", RetryPolicy::none()).with_provider("primary", provider);
        Self::new(chain, Arc::new(Semaphore::new(4)))
    }

    /// Build the primary provider plus configured fallbacks.
    pub fn from_config(
        config: &LlmConfig,
        retry: &RetryConfig,
        pool: Arc<Semaphore>,
    ) -> Result<Self, ProviderError> {
        let policy = RetryPolicy::from_config(retry, Duration::from_secs(retry.llm_timeout_secs));
        let mut chain: ProviderChain<dyn LlmProvider> = ProviderChain::new("llm", policy)
            .with_breaker(
                retry.breaker_threshold,
                Duration::from_secs(retry.breaker_cooldown_secs),
            );

        let primary = OpenAiCompatProvider::new(&config.model, &config.base_url, &config.api_key_env)?;
        chain = chain.with_provider(config.model.clone(), Arc::new(primary) as Arc<dyn LlmProvider>);

        for fallback in &config.fallbacks {
            match OpenAiCompatProvider::new(&fallback.model, &fallback.base_url, &fallback.api_key_env) {
                Ok(provider) => {
                    chain = chain.with_provider(
                        fallback.model.clone(),
                        Arc::new(provider) as Arc<dyn LlmProvider>,
                    );
                }
                Err(e) => tracing::warn!(model = %fallback.model, error = %e, "Skipping fallback LLM"),
            }
        }

        Ok(Self {
            chain,
            pool,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }

    /// Send a request through the chain, applying client defaults.
    pub async fn complete(&self, mut request: CompletionRequest) -> Result<String, ProviderError> {
        if request.max_tokens.is_none() {
            request.max_tokens = Some(self.max_tokens);
        }
        if request.temperature.is_none() {
            request.temperature = Some(self.temperature);
        }

        let _permit = self
            .pool
            .acquire()
            .await
            .map_err(|_| ProviderError::Connection {
                provider: "llm".into(),
                message: "LLM pool closed".into(),
            })?;
        self.chain
            .call("complete", |provider| {
                let request = request.clone();
                async move { provider.complete(request).await }
            })
            .await
    }
}

/// Extract the JSON payload from a model reply, tolerating code fences and
/// surrounding prose.
pub fn extract_json(reply: &str) -> Option<Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let unfenced = trimmed
        .split("```")
        .nth(1)
        .map(|block| block.trim_start_matches("json").trim());
    if let Some(block) = unfenced
        && let Ok(value) = serde_json::from_str::<Value>(block)
    {
        return Some(value);
    }

    for (open, close) in [('{', '}'), ('[', ']')] {
        if let (Some(start), Some(end)) = (trimmed.find(open), trimmed.rfind(close))
            && start < end
            && let Ok(value) = serde_json::from_str::<Value>(&trimmed[start..=end])
        {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        let v = extract_json(r#"{"claims": []}"#).unwrap();
        assert!(v["claims"].is_array());
    }

    #[test]
    fn test_extract_json_fenced() {
        let reply = "Here you go:\n```json\n{\"position\": \"yes\", \"confidence\": 0.7}\n```\n";
        let v = extract_json(reply).unwrap();
        assert_eq!(v["position"], "yes");
    }

    #[test]
    fn test_extract_json_embedded_array() {
        let v = extract_json("Claims: [{\"text\": \"a\"}] done").unwrap();
        assert_eq!(v[0]["text"], "a");
    }

    #[test]
    fn test_extract_json_garbage() {
        assert!(extract_json("I cannot help with that.").is_none());
    }

    #[test]
    fn test_parse_completion() {
        let body = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(parse_completion(&body, "m").unwrap(), "hi");
        assert!(parse_completion(&json!({}), "m").is_err());
    }

    #[tokio::test]
    async fn test_mock_queue_then_handler() {
        let mock = MockLlmProvider::with_response("fallback");
        mock.queue_response(Ok("first".into()));
        let a = mock.complete(CompletionRequest::new("s", "p")).await.unwrap();
        let b = mock.complete(CompletionRequest::new("s", "p")).await.unwrap();
        assert_eq!(a, "first");
        assert_eq!(b, "fallback");
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_client_falls_back() {
        let failing = Arc::new(MockLlmProvider::new());
        let working = Arc::new(MockLlmProvider::with_response("ok"));
        let chain: ProviderChain<dyn LlmProvider> = ProviderChain::new("llm", RetryPolicy::none())
            .with_provider("failing", failing.clone() as Arc<dyn LlmProvider>)
            .with_provider("working", working as Arc<dyn LlmProvider>);
        let client = LlmClient::new(chain, Arc::new(Semaphore::new(1)));

        let reply = client.complete(CompletionRequest::new("s", "p")).await.unwrap();
        assert_eq!(reply, "ok");
        assert_eq!(failing.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_client_applies_max_tokens_default() {
        let mock = Arc::new(MockLlmProvider::with_response("ok"));
        let client = LlmClient::single(mock.clone());
        client.complete(CompletionRequest::new("s", "p")).await.unwrap();
        assert_eq!(mock.requests()[0].max_tokens, Some(2_048));
        assert_eq!(mock.requests()[0].temperature, Some(0.3));
    }

    #[test]
    fn test_local_provider_needs_no_key() {
        let provider = OpenAiCompatProvider::new(
            "qwen2.5:14b",
            "http://localhost:11434/v1/",
            "VERACITY_TEST_KEY_THAT_IS_NOT_SET",
        )
        .unwrap();
        assert_eq!(provider.model_name(), "qwen2.5:14b");
        assert_eq!(provider.base_url, "http://localhost:11434/v1");
    }

    #[test]
    fn test_remote_provider_requires_key() {
        let result = OpenAiCompatProvider::new(
            "gpt-4o",
            "https://api.openai.com/v1",
            "VERACITY_TEST_KEY_THAT_IS_NOT_SET",
        );
        assert!(matches!(result, Err(ProviderError::AuthFailed { .. })));
    }
}
