//! # Veracity Core
//!
//! Multi-agent research pipeline: search, crawl, curate, extract claims,
//! verify them against their sources, build a knowledge graph, debate
//! contradictions, and synthesize a cited report. Sessions stream their
//! progress as events and persist to a local store.

pub mod config;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod gateway;
pub mod llm;
pub mod persistence;
pub mod rate_limit;
pub mod research;
pub mod retry;
pub mod store;
pub mod text;

pub use config::{VeracityConfig, load_config};
pub use error::{PhaseError, ProviderError, Result, VeracityError};
pub use events::{EventEnvelope, EventHub, ResearchEvent};
pub use research::{Pipeline, ResearchEngine, ResearchMode, ResearchPhase, ResearchSession};
pub use store::{SessionRecord, SessionStore};
