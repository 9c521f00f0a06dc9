//! Research pipeline.
//!
//! A session moves through a fixed sequence of phases:
//! 1. **Plan** - expand the query into sub-queries
//! 2. **Search / Crawl** - gather candidate pages
//! 3. **Curate** - dedup, score credibility and relevance
//! 4. **Extract** - role-specialised agents pull claims from sources
//! 5. **Graph / Verify** - build the knowledge graph and check claims against their sources
//! 6. **Debate** - only when a strong contradiction exists
//! 7. **Synthesize** - the cited markdown report

pub mod agents;
pub mod crawler;
pub mod credibility;
pub mod curator;
pub mod debate;
pub mod engine;
pub mod extraction;
pub mod graph;
pub mod html;
pub mod orchestrator;
pub mod pipeline;
pub mod planner;
pub mod search;
pub mod session;
pub mod sources;
pub mod synthesis;
pub mod verifier;

pub use engine::ResearchEngine;
pub use pipeline::Pipeline;
pub use session::{ResearchMode, ResearchPhase, ResearchSession, SessionSummary};
pub use sources::{Claim, Source, SourceType, Stance};
