//! Page fetching with bounded concurrency and per-host pacing.
//!
//! Each URL is fetched independently: a failure only drops that URL. Results
//! stream out in completion order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::html;
use super::search::SearchHit;
use super::sources::{RawSource, domain_of};
use crate::config::{CrawlerConfig, RetryConfig};
use crate::error::FetchError;
use crate::rate_limit::DomainRateLimiter;
use crate::retry::RetryPolicy;
use crate::text;

/// Extracted content of one page.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPage {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub published_at: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Fetches pages over HTTP and extracts readable text from HTML.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::Network {
                url: String::new(),
                message: format!("Failed to create HTTP client: {e}"),
            })?;
        Ok(Self { client })
    }

    pub fn from_config(crawler: &CrawlerConfig, retry: &RetryConfig) -> Result<Self, FetchError> {
        Self::new(
            &crawler.user_agent,
            Duration::from_secs(retry.fetch_timeout_secs),
        )
    }
}

fn validate_url(url: &str) -> Result<(), FetchError> {
    let parsed = url::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FetchError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        validate_url(url)?;

        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: 0,
                }
            } else {
                FetchError::Network {
                    url: url.to_string(),
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let is_html = content_type.contains("text/html") || content_type.contains("application/xhtml");
        if !is_html && !content_type.starts_with("text/") && !content_type.is_empty() {
            return Err(FetchError::UnsupportedContent {
                url: url.to_string(),
                content_type,
            });
        }

        let body = response.text().await.map_err(|e| FetchError::Network {
            url: url.to_string(),
            message: format!("Failed to read response body: {e}"),
        })?;

        let page = if is_html || body.trim_start().starts_with('<') {
            FetchedPage {
                url: url.to_string(),
                title: html::extract_title(&body),
                text: html::extract_text(&body),
                published_at: html::extract_published_at(&body),
                fetched_at: Utc::now(),
            }
        } else {
            FetchedPage {
                url: url.to_string(),
                title: None,
                text: body,
                published_at: None,
                fetched_at: Utc::now(),
            }
        };
        Ok(page)
    }
}

/// Serves canned pages by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, Result<FetchedPage, FetchError>>,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, url: &str, title: &str, body_text: &str) -> Self {
        self.pages.insert(
            url.to_string(),
            Ok(FetchedPage {
                url: url.to_string(),
                title: Some(title.to_string()),
                text: body_text.to_string(),
                published_at: None,
                fetched_at: Utc::now(),
            }),
        );
        self
    }

    pub fn with_fetched_page(mut self, page: FetchedPage) -> Self {
        self.pages.insert(page.url.clone(), Ok(page));
        self
    }

    pub fn with_error(mut self, url: &str, error: FetchError) -> Self {
        self.pages.insert(url.to_string(), Err(error));
        self
    }

    /// URLs requested so far, in request order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(url.to_string());
        match self.pages.get(url) {
            Some(page) => page.clone(),
            None => Err(FetchError::Status {
                url: url.to_string(),
                status: 404,
            }),
        }
    }
}

/// Result of crawling one search hit.
#[derive(Debug, Clone)]
pub struct CrawlOutcome {
    pub url: String,
    pub result: Result<RawSource, FetchError>,
}

/// Crawls search hits through a [`Fetcher`].
pub struct Crawler {
    fetcher: Arc<dyn Fetcher>,
    pool: Arc<Semaphore>,
    domains: Arc<DomainRateLimiter>,
    policy: RetryPolicy,
    concurrency: usize,
    min_text_chars: usize,
    max_text_chars: usize,
}

impl Crawler {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        pool: Arc<Semaphore>,
        domains: Arc<DomainRateLimiter>,
        policy: RetryPolicy,
    ) -> Self {
        let concurrency = pool.available_permits().max(1);
        Self {
            fetcher,
            pool,
            domains,
            policy,
            concurrency,
            min_text_chars: CrawlerConfig::default().min_text_chars,
            max_text_chars: CrawlerConfig::default().max_text_chars,
        }
    }

    pub fn with_text_limits(mut self, min_chars: usize, max_chars: usize) -> Self {
        self.min_text_chars = min_chars;
        self.max_text_chars = max_chars.max(min_chars);
        self
    }

    /// Fetch every hit, yielding outcomes as they complete.
    pub fn crawl(&self, hits: Vec<SearchHit>) -> impl Stream<Item = CrawlOutcome> + '_ {
        stream::iter(hits)
            .map(move |hit| self.crawl_one(hit))
            .buffer_unordered(self.concurrency)
    }

    async fn crawl_one(&self, hit: SearchHit) -> CrawlOutcome {
        let result = self.fetch_source(&hit).await;
        match &result {
            Ok(source) => debug!(url = %hit.url, words = source.word_count, "Fetched source"),
            Err(e) => warn!(url = %hit.url, error = %e, "Dropping source"),
        }
        CrawlOutcome {
            url: hit.url,
            result,
        }
    }

    async fn fetch_source(&self, hit: &SearchHit) -> Result<RawSource, FetchError> {
        validate_url(&hit.url)?;
        let _permit = self.pool.acquire().await.map_err(|_| FetchError::Network {
            url: hit.url.clone(),
            message: "crawl pool closed".into(),
        })?;

        let domain = domain_of(&hit.url);
        let page = self
            .policy
            .run(&hit.url, || async {
                self.domains.acquire(&domain).await;
                self.fetcher.fetch(&hit.url).await
            })
            .await?;

        let body = text::truncate_chars(page.text.trim(), self.max_text_chars);
        let chars = body.chars().count();
        if chars < self.min_text_chars {
            return Err(FetchError::EmptyContent {
                url: hit.url.clone(),
                chars,
            });
        }

        let title = page
            .title
            .filter(|t| !t.trim().is_empty())
            .or_else(|| (!hit.title.is_empty()).then(|| hit.title.clone()))
            .unwrap_or_else(|| hit.url.clone());
        let mut source =
            RawSource::new(hit.url.clone(), title, body, hit.sub_query.clone()).with_fetched_at(page.fetched_at);
        if let Some(published) = page.published_at {
            source = source.with_published_at(published);
        }
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn hit(url: &str) -> SearchHit {
        SearchHit {
            url: url.to_string(),
            title: "Hit title".into(),
            snippet: String::new(),
            provider: "static".into(),
            rank: 0,
            sub_query: "coffee".into(),
        }
    }

    fn crawler(fetcher: Arc<dyn Fetcher>) -> Crawler {
        let policy = RetryPolicy {
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            timeout: None,
            jitter: false,
        };
        Crawler::new(
            fetcher,
            Arc::new(Semaphore::new(4)),
            Arc::new(DomainRateLimiter::new(Duration::ZERO, Duration::ZERO)),
            policy,
        )
        .with_text_limits(10, 40)
    }

    async fn collect(crawler: &Crawler, hits: Vec<SearchHit>) -> Vec<CrawlOutcome> {
        crawler.crawl(hits).collect().await
    }

    #[tokio::test]
    async fn test_successful_fetch_builds_raw_source() {
        let fetcher = StaticFetcher::new().with_page(
            "https://www.example.org/coffee",
            "Coffee facts",
            "Coffee is brewed from roasted beans of the coffee plant.",
        );
        let outcomes = collect(&crawler(Arc::new(fetcher)), vec![hit("https://www.example.org/coffee")]).await;
        let source = outcomes[0].result.as_ref().unwrap();
        assert_eq!(source.title, "Coffee facts");
        assert_eq!(source.domain, "example.org");
        assert_eq!(source.sub_query, "coffee");
        // Truncated to the configured maximum.
        assert_eq!(source.text.chars().count(), 40);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let fetcher = StaticFetcher::new()
            .with_page("https://a.test/ok", "", "Enough text to keep this page around.")
            .with_page("https://a.test/short", "", "tiny");
        let outcomes = collect(
            &crawler(Arc::new(fetcher)),
            vec![
                hit("https://a.test/ok"),
                hit("https://a.test/missing"),
                hit("https://a.test/short"),
                hit("ftp://a.test/file"),
            ],
        )
        .await;

        let by_url: HashMap<_, _> = outcomes.iter().map(|o| (o.url.as_str(), &o.result)).collect();
        let ok = by_url["https://a.test/ok"].as_ref().unwrap();
        assert_eq!(ok.title, "Hit title");
        assert!(matches!(by_url["https://a.test/missing"], Err(FetchError::Status { status: 404, .. })));
        assert!(matches!(by_url["https://a.test/short"], Err(FetchError::EmptyContent { chars: 4, .. })));
        assert!(matches!(by_url["ftp://a.test/file"], Err(FetchError::InvalidUrl { .. })));
    }

    struct Flaky {
        calls: AtomicU32,
        status: u16,
    }

    #[async_trait]
    impl Fetcher for Flaky {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                return Err(FetchError::Status {
                    url: url.to_string(),
                    status: self.status,
                });
            }
            Ok(FetchedPage {
                url: url.to_string(),
                title: None,
                text: "Recovered page text after throttling.".into(),
                published_at: None,
                fetched_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_rate_limited_fetch_is_retried() {
        // The policy allows one retry, but a 429 earns three.
        let fetcher = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            status: 429,
        });
        let outcomes = collect(&crawler(fetcher.clone()), vec![hit("https://a.test/busy")]).await;
        assert!(outcomes[0].result.is_ok());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let fetcher = Arc::new(Flaky {
            calls: AtomicU32::new(0),
            status: 403,
        });
        let outcomes = collect(&crawler(fetcher.clone()), vec![hit("https://a.test/forbidden")]).await;
        assert!(outcomes[0].result.is_err());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
