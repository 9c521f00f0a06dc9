//! Shared timeout/backoff policy and ordered provider fallback.
//!
//! Every external call in the pipeline (search, fetch, LLM, embedding, NLI)
//! goes through a [`RetryPolicy`]. Capabilities with several interchangeable
//! backends wrap them in a [`ProviderChain`], which tries each in priority
//! order, skipping any whose circuit breaker is open.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{ProviderError, Retryable};

/// Bounded retry with exponential backoff and an optional per-attempt timeout.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Option<Duration>,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig, timeout: Duration) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            timeout: Some(timeout),
            jitter: config.jitter,
        }
    }

    /// A policy that makes exactly one attempt with no timeout.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            timeout: None,
            jitter: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let mut wait = exp.min(self.max_backoff);
        if self.jitter && !self.base_backoff.is_zero() {
            let spread = self.base_backoff.as_millis() as u64 / 2;
            wait += Duration::from_millis(rand::thread_rng().gen_range(0..=spread));
        }
        wait
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the retry
    /// budget that the error itself reports.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(E::timed_out(operation, limit)),
                },
                None => op().await,
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let budget = err.retry_budget(self.max_retries);
            if attempt >= budget {
                return Err(err);
            }

            let wait = self
                .backoff(attempt)
                .max(err.retry_after().unwrap_or_default())
                .min(self.max_backoff.max(self.base_backoff));
            info!(
                operation,
                attempt = attempt + 1,
                budget,
                backoff_ms = wait.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );
            tokio::time::sleep(wait).await;
            attempt += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Circuit Breaker
// ---------------------------------------------------------------------------

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

/// Trips after consecutive failures and lets one trial request through after a cooldown.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    pub fn is_call_permitted(&mut self) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open { since } if since.elapsed() >= self.cooldown => {
                debug!("Circuit breaker half-open");
                self.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::Open { .. } => false,
        }
    }

    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        if self.state == CircuitState::HalfOpen || self.failure_count >= self.failure_threshold {
            warn!(
                failures = self.failure_count,
                threshold = self.failure_threshold,
                "Circuit breaker opening"
            );
            self.state = CircuitState::Open {
                since: Instant::now(),
            };
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }
}

// ---------------------------------------------------------------------------
// Provider Chain
// ---------------------------------------------------------------------------

struct ChainEntry<T: ?Sized> {
    name: String,
    provider: Arc<T>,
    breaker: Mutex<CircuitBreaker>,
}

/// An ordered list of interchangeable providers sharing one retry policy.
pub struct ProviderChain<T: ?Sized> {
    capability: String,
    policy: RetryPolicy,
    entries: Vec<ChainEntry<T>>,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
}

impl<T: ?Sized + Send + Sync> ProviderChain<T> {
    pub fn new(capability: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            capability: capability.into(),
            policy,
            entries: Vec::new(),
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }

    pub fn with_breaker(mut self, threshold: u32, cooldown: Duration) -> Self {
        self.breaker_threshold = threshold;
        self.breaker_cooldown = cooldown;
        self
    }

    /// Append a provider at the lowest priority.
    pub fn with_provider(mut self, name: impl Into<String>, provider: Arc<T>) -> Self {
        self.entries.push(ChainEntry {
            name: name.into(),
            provider,
            breaker: Mutex::new(CircuitBreaker::new(
                self.breaker_threshold,
                self.breaker_cooldown,
            )),
        });
        self
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Try each provider in order until one succeeds.
    ///
    /// Returns [`ProviderError::Unavailable`] when every provider failed or was
    /// skipped by its breaker.
    pub async fn call<R, F, Fut>(&self, operation: &str, f: F) -> Result<R, ProviderError>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = Result<R, ProviderError>>,
    {
        let mut attempts = 0;
        let mut last_error: Option<ProviderError> = None;

        for entry in &self.entries {
            let permitted = entry
                .breaker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .is_call_permitted();
            if !permitted {
                debug!(provider = %entry.name, operation, "Skipping provider with open circuit");
                continue;
            }

            attempts += 1;
            let result = self
                .policy
                .run(operation, || f(Arc::clone(&entry.provider)))
                .await;

            let mut breaker = entry
                .breaker
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            match result {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(e) => {
                    breaker.record_failure();
                    warn!(
                        capability = %self.capability,
                        provider = %entry.name,
                        operation,
                        error = %e,
                        "Provider failed, falling back"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(ProviderError::Unavailable {
            capability: self.capability.clone(),
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no provider permitted a call".to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            timeout: None,
            jitter: false,
        }
    }

    fn connection_error() -> ProviderError {
        ProviderError::Connection {
            provider: "test".into(),
            message: "refused".into(),
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(800),
            timeout: None,
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(9), Duration::from_millis(800));
        assert_eq!(policy.backoff(40), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, ProviderError> = fast_policy(3)
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err(connection_error()) } else { Ok(n) }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), ProviderError> = fast_policy(3)
            .run("auth", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(ProviderError::AuthFailed {
                        provider: "x".into(),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::AuthFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_specific_budget() {
        // A 429 earns three retries even when the policy default is zero.
        let calls = AtomicU32::new(0);
        let result: Result<(), FetchError> = fast_policy(0)
            .run("https://a.test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FetchError::Status {
                        url: "https://a.test".into(),
                        status: 429,
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let policy = fast_policy(0).with_timeout(Duration::from_millis(10));
        let result: Result<(), ProviderError> = policy
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        match result {
            Err(ProviderError::Timeout {
                operation,
                timeout_ms,
            }) => {
                assert_eq!(operation, "slow");
                assert_eq!(timeout_ms, 10);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_circuit_breaker_opens_and_recovers() {
        let mut breaker = CircuitBreaker::new(2, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert!(matches!(breaker.state(), CircuitState::Open { .. }));
        // Zero cooldown: the next check is a trial.
        assert!(breaker.is_call_permitted());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_breaker_blocks_during_cooldown() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_secs(3600));
        breaker.record_failure();
        assert!(!breaker.is_call_permitted());
    }

    struct Named(&'static str);

    #[tokio::test]
    async fn test_chain_falls_back_in_order() {
        let chain = ProviderChain::new("search", fast_policy(0))
            .with_provider("primary", Arc::new(Named("primary")))
            .with_provider("secondary", Arc::new(Named("secondary")));

        let result = chain
            .call("query", |p: Arc<Named>| async move {
                if p.0 == "primary" {
                    Err(connection_error())
                } else {
                    Ok(p.0)
                }
            })
            .await;
        assert_eq!(result.unwrap(), "secondary");
        assert_eq!(chain.provider_names(), vec!["primary", "secondary"]);
    }

    #[tokio::test]
    async fn test_chain_all_fail_is_unavailable() {
        let chain = ProviderChain::new("search", fast_policy(1))
            .with_provider("a", Arc::new(Named("a")))
            .with_provider("b", Arc::new(Named("b")));

        let result: Result<(), ProviderError> = chain
            .call("query", |_p: Arc<Named>| async { Err(connection_error()) })
            .await;
        match result {
            Err(ProviderError::Unavailable {
                capability,
                attempts,
                ..
            }) => {
                assert_eq!(capability, "search");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_chain_skips_open_breaker() {
        let chain = ProviderChain::new("llm", fast_policy(0))
            .with_breaker(1, Duration::from_secs(3600))
            .with_provider("flaky", Arc::new(Named("flaky")))
            .with_provider("stable", Arc::new(Named("stable")));
        let flaky_calls = AtomicU32::new(0);

        for _ in 0..3 {
            let result = chain
                .call("complete", |p: Arc<Named>| {
                    if p.0 == "flaky" {
                        flaky_calls.fetch_add(1, Ordering::SeqCst);
                    }
                    async move {
                        if p.0 == "flaky" {
                            Err(connection_error())
                        } else {
                            Ok(())
                        }
                    }
                })
                .await;
            assert!(result.is_ok());
        }
        // Breaker opened after the first failure.
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_chain_is_unavailable() {
        let chain: ProviderChain<Named> = ProviderChain::new("nli", fast_policy(0));
        let result: Result<(), ProviderError> = chain.call("x", |_p| async { Ok(()) }).await;
        assert!(matches!(result, Err(ProviderError::Unavailable { attempts: 0, .. })));
    }
}
