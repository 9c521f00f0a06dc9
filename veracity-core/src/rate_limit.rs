//! Worker pools and per-host request pacing.
//!
//! Pools are process-wide semaphores shared by every session, so the total
//! number of in-flight crawls, agent calls, and embedding calls stays bounded no
//! matter how many sessions run at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::config::ConcurrencyConfig;

/// Enforces a minimum gap between requests to the same key (usually a host).
///
/// Callers reserve a slot under the lock and sleep outside it, so waiting on one
/// host never blocks requests to another.
#[derive(Debug)]
pub struct DomainRateLimiter {
    min_interval: Duration,
    jitter: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl DomainRateLimiter {
    pub fn new(min_interval: Duration, jitter: Duration) -> Self {
        Self {
            min_interval,
            jitter,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `key` is allowed. Returns how long it waited.
    pub async fn acquire(&self, key: &str) -> Duration {
        let now = Instant::now();
        let slot = {
            let mut slots = self.next_slot.lock().await;
            // A slot already in the past no longer restricts its host.
            slots.retain(|_, s| *s > now);
            let slot = slots.get(key).copied().unwrap_or(now);
            slots.insert(key.to_string(), slot + self.interval());
            slot
        };
        if slot > now {
            tokio::time::sleep_until(slot).await;
        }
        slot.saturating_duration_since(now)
    }

    /// Hosts that still have a pending slot.
    pub async fn tracked_hosts(&self) -> usize {
        self.next_slot.lock().await.len()
    }

    fn interval(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.min_interval;
        }
        let extra = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.min_interval + Duration::from_millis(extra)
    }
}

/// Bounded worker pools shared across sessions.
#[derive(Debug, Clone)]
pub struct ResourcePools {
    pub crawl: Arc<Semaphore>,
    pub extraction: Arc<Semaphore>,
    pub embedding: Arc<Semaphore>,
    pub llm: Arc<Semaphore>,
    pub domains: Arc<DomainRateLimiter>,
}

impl ResourcePools {
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self {
            crawl: Arc::new(Semaphore::new(config.crawl_workers.max(1))),
            extraction: Arc::new(Semaphore::new(config.extraction_workers.max(1))),
            embedding: Arc::new(Semaphore::new(config.embedding_workers.max(1))),
            llm: Arc::new(Semaphore::new(config.llm_workers.max(1))),
            domains: Arc::new(DomainRateLimiter::new(
                Duration::from_millis(config.domain_min_interval_ms),
                Duration::from_millis(config.domain_jitter_ms),
            )),
        }
    }
}

impl Default for ResourcePools {
    fn default() -> Self {
        Self::from_config(&ConcurrencyConfig::default())
    }
}
