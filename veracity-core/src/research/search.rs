//! Web search providers and the sub-query fan-out.
//!
//! Providers sit in a [`ProviderChain`] in configured order. A sub-query only
//! fails when every provider failed for it; the search phase only fails when
//! every sub-query did.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use super::html;
use crate::config::{RetryConfig, SearchConfig};
use crate::error::ProviderError;
use crate::rate_limit::DomainRateLimiter;
use crate::retry::{ProviderChain, RetryPolicy};

/// A ranked URL candidate for one sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
    pub provider: String,
    /// Zero-based position in the provider's result list.
    pub rank: usize,
    pub sub_query: String,
}

#[async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ProviderError>;

    fn name(&self) -> &str;
}

fn http_client(user_agent: &str, timeout: Duration) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(user_agent)
        .build()
        .map_err(|e| ProviderError::Connection {
            provider: "search".into(),
            message: format!("Failed to create HTTP client: {e}"),
        })
}

fn map_status(provider: &str, status: reqwest::StatusCode) -> ProviderError {
    match status.as_u16() {
        // DuckDuckGo answers 202 with a challenge page when throttling.
        202 | 429 => ProviderError::RateLimited {
            provider: provider.into(),
            retry_after_secs: 5,
        },
        code if status.is_server_error() => ProviderError::Request {
            provider: provider.into(),
            message: format!("HTTP {code}"),
        },
        code => ProviderError::Rejected {
            provider: provider.into(),
            status: code,
            message: status.canonical_reason().unwrap_or("").to_string(),
        },
    }
}

static RESULT_LINK: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]+)"[^>]*>(.*?)</a>"#).ok()
});

static RESULT_SNIPPET: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"(?s)<(?:a|div)[^>]*class="result__snippet"[^>]*>(.*?)</(?:a|div)>"#).ok()
});

/// DuckDuckGo's JavaScript-free HTML results page.
pub struct DuckDuckGoHtml {
    client: reqwest::Client,
    endpoint: String,
}

impl DuckDuckGoHtml {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(user_agent, timeout)?,
            endpoint: "https://html.duckduckgo.com/html/".into(),
        })
    }

    /// Parse a results page into hits, in page order.
    pub fn parse_results(page: &str, query: &str, limit: usize) -> Vec<SearchHit> {
        let (Some(link_re), Some(snippet_re)) = (RESULT_LINK.as_ref(), RESULT_SNIPPET.as_ref())
        else {
            return Vec::new();
        };
        let snippets: Vec<String> = snippet_re
            .captures_iter(page)
            .filter_map(|c| c.get(1).map(|m| html::strip_tags(m.as_str())))
            .collect();

        link_re
            .captures_iter(page)
            .enumerate()
            .filter_map(|(i, caps)| {
                let href = caps.get(1)?.as_str();
                let url = resolve_redirect(&html::decode_entities(href))?;
                Some(SearchHit {
                    url,
                    title: html::strip_tags(caps.get(2)?.as_str()),
                    snippet: snippets.get(i).cloned().unwrap_or_default(),
                    provider: "duckduckgo_html".into(),
                    rank: i,
                    sub_query: query.to_string(),
                })
            })
            .take(limit)
            .collect()
    }
}

/// Unwrap DuckDuckGo's `/l/?uddg=` redirect links. Non-HTTP targets are dropped.
fn resolve_redirect(href: &str) -> Option<String> {
    let absolute = if href.starts_with("//") {
        format!("https:{href}")
    } else {
        href.to_string()
    };
    let parsed = url::Url::parse(&absolute).ok()?;
    let target = if parsed.path().starts_with("/l/") {
        let uddg = parsed
            .query_pairs()
            .find(|(k, _)| k == "uddg")
            .map(|(_, v)| v.into_owned())?;
        url::Url::parse(&uddg).ok()?
    } else {
        parsed
    };
    matches!(target.scheme(), "http" | "https").then(|| target.to_string())
}

#[async_trait]
impl SearchProvider for DuckDuckGoHtml {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("q", query)])
            .send()
            .await
            .map_err(|e| ProviderError::Connection {
                provider: self.name().into(),
                message: e.to_string(),
            })?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(map_status(self.name(), response.status()));
        }
        let page = response.text().await.map_err(|e| ProviderError::ResponseParse {
            provider: self.name().into(),
            message: e.to_string(),
        })?;
        Ok(Self::parse_results(&page, query, limit))
    }

    fn name(&self) -> &str {
        "duckduckgo_html"
    }
}

/// DuckDuckGo instant answer API. Sparse, but rarely throttled.
pub struct DuckDuckGoInstant {
    client: reqwest::Client,
}

impl DuckDuckGoInstant {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, ProviderError> {
        Ok(Self {
            client: http_client(user_agent, timeout)?,
        })
    }

    pub fn parse_results(body: &Value, query: &str, limit: usize) -> Vec<SearchHit> {
        let mut entries: Vec<(String, String)> = Vec::new();

        if let Some(url) = body.get("AbstractURL").and_then(Value::as_str)
            && !url.is_empty()
        {
            let text = body
                .get("AbstractText")
                .and_then(Value::as_str)
                .unwrap_or_default();
            entries.push((url.to_string(), text.to_string()));
        }

        let mut push_topics = |items: &[Value]| {
            for item in items {
                let nested = item.get("Topics").and_then(Value::as_array);
                let topics = nested.map(|t| t.as_slice()).unwrap_or(std::slice::from_ref(item));
                for topic in topics {
                    if let Some(url) = topic.get("FirstURL").and_then(Value::as_str) {
                        let text = topic.get("Text").and_then(Value::as_str).unwrap_or_default();
                        entries.push((url.to_string(), text.to_string()));
                    }
                }
            }
        };
        if let Some(results) = body.get("Results").and_then(Value::as_array) {
            push_topics(results);
        }
        if let Some(related) = body.get("RelatedTopics").and_then(Value::as_array) {
            push_topics(related);
        }

        entries
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(rank, (url, text))| SearchHit {
                title: text.split(" - ").next().unwrap_or_default().to_string(),
                snippet: text,
                url,
                provider: "duckduckgo_instant".into(),
                rank,
                sub_query: query.to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl SearchProvider for DuckDuckGoInstant {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let url = format!(
            "https://api.duckduckgo.com/?q={}&format=json&no_html=1&skip_disambig=1",
            urlencoding::encode(query)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Connection {
                provider: self.name().into(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(map_status(self.name(), response.status()));
        }
        let body: Value = response.json().await.map_err(|e| ProviderError::ResponseParse {
            provider: self.name().into(),
            message: e.to_string(),
        })?;
        Ok(Self::parse_results(&body, query, limit))
    }

    fn name(&self) -> &str {
        "duckduckgo_instant"
    }
}

/// Scripted search results, keyed by sub-query, for tests and offline runs.
#[derive(Default)]
pub struct StaticSearch {
    name: String,
    by_query: HashMap<String, Vec<SearchHit>>,
    fallback: Vec<SearchHit>,
    error: Option<ProviderError>,
    calls: Mutex<Vec<String>>,
}

impl StaticSearch {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Answer every sub-query with these URLs.
    pub fn with_urls(mut self, urls: &[&str]) -> Self {
        self.fallback = urls
            .iter()
            .enumerate()
            .map(|(rank, url)| SearchHit {
                url: url.to_string(),
                title: String::new(),
                snippet: String::new(),
                provider: self.name.clone(),
                rank,
                sub_query: String::new(),
            })
            .collect();
        self
    }

    pub fn with_query(mut self, query: &str, urls: &[&str]) -> Self {
        let hits = urls
            .iter()
            .enumerate()
            .map(|(rank, url)| SearchHit {
                url: url.to_string(),
                title: String::new(),
                snippet: String::new(),
                provider: self.name.clone(),
                rank,
                sub_query: query.to_string(),
            })
            .collect();
        self.by_query.insert(query.to_string(), hits);
        self
    }

    /// Fail every call with `error`.
    pub fn failing(mut self, error: ProviderError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl SearchProvider for StaticSearch {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, ProviderError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(query.to_string());
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let hits = self.by_query.get(query).unwrap_or(&self.fallback);
        Ok(hits
            .iter()
            .take(limit)
            .cloned()
            .map(|mut hit| {
                hit.sub_query = query.to_string();
                hit
            })
            .collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of searching every sub-query.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    /// Deduplicated by URL, interleaved by rank across sub-queries.
    pub hits: Vec<SearchHit>,
    pub failed_queries: Vec<String>,
}

/// Runs sub-queries through the provider chain.
pub struct SearchCoordinator {
    chain: ProviderChain<dyn SearchProvider>,
    results_per_query: usize,
    pacing: Arc<DomainRateLimiter>,
}

impl SearchCoordinator {
    pub fn new(chain: ProviderChain<dyn SearchProvider>, results_per_query: usize) -> Self {
        Self {
            chain,
            results_per_query,
            pacing: Arc::new(DomainRateLimiter::new(Duration::ZERO, Duration::ZERO)),
        }
    }

    /// Space out consecutive requests to the same provider.
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.pacing = Arc::new(DomainRateLimiter::new(interval, Duration::ZERO));
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.chain.provider_names().into_iter().map(String::from).collect()
    }

    /// Build the configured providers. Unknown names are skipped.
    pub fn from_config(
        config: &SearchConfig,
        retry: &RetryConfig,
        user_agent: &str,
    ) -> Result<Self, ProviderError> {
        let timeout = Duration::from_secs(retry.search_timeout_secs);
        let policy = RetryPolicy::from_config(retry, timeout);
        let mut chain: ProviderChain<dyn SearchProvider> = ProviderChain::new("search", policy)
            .with_breaker(
                retry.breaker_threshold,
                Duration::from_secs(retry.breaker_cooldown_secs),
            );
        for name in &config.providers {
            let provider: Arc<dyn SearchProvider> = match name.as_str() {
                "duckduckgo_html" => Arc::new(DuckDuckGoHtml::new(user_agent, timeout)?),
                "duckduckgo_instant" => Arc::new(DuckDuckGoInstant::new(user_agent, timeout)?),
                other => {
                    warn!(provider = other, "Unknown search provider, skipping");
                    continue;
                }
            };
            chain = chain.with_provider(name.clone(), provider);
        }
        Ok(Self::new(chain, config.results_per_query)
            .with_min_interval(Duration::from_millis(config.min_interval_ms)))
    }

    /// Search every sub-query concurrently and merge the results.
    ///
    /// Fails with [`ProviderError::Unavailable`] only when no sub-query
    /// could be answered by any provider.
    pub async fn search_all(
        &self,
        sub_queries: &[String],
        max_results: usize,
    ) -> Result<SearchOutcome, ProviderError> {
        if self.chain.is_empty() {
            return Err(ProviderError::Unavailable {
                capability: self.chain.capability().to_string(),
                attempts: 0,
                last_error: "no search providers configured".into(),
            });
        }

        let results = join_all(sub_queries.iter().map(|q| self.search_one(q))).await;

        let mut per_query: Vec<Vec<SearchHit>> = Vec::new();
        let mut failed_queries = Vec::new();
        let mut last_error = None;
        for (query, result) in sub_queries.iter().zip(results) {
            match result {
                Ok(hits) => per_query.push(hits),
                Err(e) => {
                    warn!(query = %query, error = %e, "Sub-query search failed");
                    failed_queries.push(query.clone());
                    last_error = Some(e);
                }
            }
        }

        if per_query.is_empty()
            && let Some(error) = last_error
        {
            return Err(error);
        }

        let hits = interleave_unique(per_query, max_results);
        info!(
            queries = sub_queries.len(),
            failed = failed_queries.len(),
            hits = hits.len(),
            "Search complete"
        );
        Ok(SearchOutcome {
            hits,
            failed_queries,
        })
    }

    async fn search_one(&self, query: &str) -> Result<Vec<SearchHit>, ProviderError> {
        let limit = self.results_per_query;
        let pacing = Arc::clone(&self.pacing);
        self.chain
            .call("search", |provider| {
                let pacing = Arc::clone(&pacing);
                let query = query.to_string();
                async move {
                    pacing.acquire(provider.name()).await;
                    provider.search(&query, limit).await
                }
            })
            .await
    }
}

/// Round-robin by rank across sub-queries, dropping repeated URLs.
fn interleave_unique(per_query: Vec<Vec<SearchHit>>, max_results: usize) -> Vec<SearchHit> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    let mut iters: Vec<_> = per_query.into_iter().map(Vec::into_iter).collect();
    loop {
        let mut progressed = false;
        for iter in iters.iter_mut() {
            if let Some(hit) = iter.next() {
                progressed = true;
                if merged.len() < max_results && seen.insert(url_key(&hit.url)) {
                    merged.push(hit);
                }
            }
        }
        if !progressed || merged.len() >= max_results {
            return merged;
        }
    }
}

/// URL identity for dedup: no fragment, no trailing slash, lowercase host.
fn url_key(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.to_string().trim_end_matches('/').to_string()
        }
        Err(_) => raw.trim_end_matches('/').to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn coordinator(providers: Vec<(&str, Arc<dyn SearchProvider>)>) -> SearchCoordinator {
        let mut chain: ProviderChain<dyn SearchProvider> =
            ProviderChain::new("search", RetryPolicy::none());
        for (name, provider) in providers {
            chain = chain.with_provider(name, provider);
        }
        SearchCoordinator::new(chain, 10)
    }

    fn down(name: &str) -> ProviderError {
        ProviderError::Connection {
            provider: name.into(),
            message: "connection refused".into(),
        }
    }

    #[test]
    fn test_parse_html_results() {
        let page = r#"
            <div class="result"><h2><a rel="nofollow" class="result__a" href="//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.org%2Fcoffee&amp;rut=abc">Coffee <b>and</b> health</a></h2>
            <a class="result__snippet" href="x">Moderate intake is <b>fine</b>.</a></div>
            <div class="result"><h2><a rel="nofollow" class="result__a" href="https://direct.example.com/page">Direct</a></h2>
            <a class="result__snippet" href="y">Second snippet</a></div>
            <div class="result"><a class="result__a" href="javascript:void(0)">Bad</a></div>"#;
        let hits = DuckDuckGoHtml::parse_results(page, "coffee", 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://example.org/coffee");
        assert_eq!(hits[0].title, "Coffee and health");
        assert_eq!(hits[0].snippet, "Moderate intake is fine.");
        assert_eq!(hits[1].url, "https://direct.example.com/page");
        assert_eq!(hits[1].rank, 1);
    }

    #[test]
    fn test_parse_instant_results() {
        let body = serde_json::json!({
            "AbstractURL": "https://en.wikipedia.org/wiki/Coffee",
            "AbstractText": "Coffee is a beverage.",
            "RelatedTopics": [
                {"FirstURL": "https://duckduckgo.com/Caffeine", "Text": "Caffeine - a stimulant"},
                {"Name": "Group", "Topics": [
                    {"FirstURL": "https://duckduckgo.com/Espresso", "Text": "Espresso"}
                ]}
            ]
        });
        let hits = DuckDuckGoInstant::parse_results(&body, "coffee", 10);
        let urls: Vec<&str> = hits.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://en.wikipedia.org/wiki/Coffee",
                "https://duckduckgo.com/Caffeine",
                "https://duckduckgo.com/Espresso",
            ]
        );
        assert_eq!(hits[1].title, "Caffeine");
    }

    #[tokio::test]
    async fn test_fallback_to_second_provider() {
        let primary = Arc::new(StaticSearch::new("primary").failing(down("primary")));
        let secondary = Arc::new(StaticSearch::new("secondary").with_urls(&["https://a.test/1"]));
        let search = coordinator(vec![("primary", primary.clone()), ("secondary", secondary)]);

        let outcome = search.search_all(&["q".to_string()], 10).await.unwrap();
        assert_eq!(outcome.hits.len(), 1);
        assert_eq!(outcome.hits[0].provider, "secondary");
        assert_eq!(primary.calls(), vec!["q".to_string()]);
    }

    #[tokio::test]
    async fn test_all_providers_down_is_unavailable() {
        let search = coordinator(vec![
            ("a", Arc::new(StaticSearch::new("a").failing(down("a")))),
            ("b", Arc::new(StaticSearch::new("b").failing(down("b")))),
        ]);
        let err = search
            .search_all(&["q1".to_string(), "q2".to_string()], 10)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_dedup_and_cap_across_sub_queries() {
        let provider = StaticSearch::new("s")
            .with_query("q1", &["https://a.test/1", "https://a.test/2", "https://a.test/3"])
            .with_query("q2", &["https://a.test/1/", "https://b.test/1#top", "https://b.test/2"]);
        let search = coordinator(vec![("s", Arc::new(provider))]);

        let outcome = search
            .search_all(&["q1".to_string(), "q2".to_string()], 4)
            .await
            .unwrap();
        let urls: Vec<&str> = outcome.hits.iter().map(|h| h.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["https://a.test/1", "https://a.test/2", "https://b.test/1#top", "https://a.test/3"]
        );
        assert_eq!(outcome.hits[1].sub_query, "q1");
    }

    #[tokio::test]
    async fn test_empty_results_are_not_an_error() {
        let search = coordinator(vec![("s", Arc::new(StaticSearch::new("s")))]);
        let outcome = search.search_all(&["q".to_string()], 10).await.unwrap();
        assert!(outcome.hits.is_empty());
        assert!(outcome.failed_queries.is_empty());
    }
}
