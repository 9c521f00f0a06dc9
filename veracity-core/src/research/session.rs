//! Research session state machine.
//!
//! A session walks a fixed phase order with fixed progress checkpoints. Only
//! the orchestrator mutates a session; every other component sees snapshots.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PhaseError;

/// Current phase of a research session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Planning,
    Searching,
    Crawling,
    Curating,
    Extracting,
    BuildingGraph,
    Verifying,
    /// Entered only when verification left a strong contradiction behind.
    Debating,
    Synthesizing,
    Complete,
    /// Reachable from any non-terminal phase.
    Error,
}

impl ResearchPhase {
    /// Canonical order, excluding `Error`.
    pub const CANONICAL: [ResearchPhase; 10] = [
        ResearchPhase::Planning,
        ResearchPhase::Searching,
        ResearchPhase::Crawling,
        ResearchPhase::Curating,
        ResearchPhase::Extracting,
        ResearchPhase::BuildingGraph,
        ResearchPhase::Verifying,
        ResearchPhase::Debating,
        ResearchPhase::Synthesizing,
        ResearchPhase::Complete,
    ];

    /// Fixed progress checkpoint reported on entering the phase.
    pub fn progress(self) -> u8 {
        match self {
            ResearchPhase::Planning => 5,
            ResearchPhase::Searching => 10,
            ResearchPhase::Crawling => 20,
            ResearchPhase::Curating => 30,
            ResearchPhase::Extracting => 45,
            ResearchPhase::BuildingGraph => 60,
            ResearchPhase::Verifying => 70,
            ResearchPhase::Debating => 80,
            ResearchPhase::Synthesizing => 90,
            ResearchPhase::Complete => 100,
            ResearchPhase::Error => 0,
        }
    }

    /// Position in the canonical order; `None` for `Error`.
    pub fn ordinal(self) -> Option<usize> {
        Self::CANONICAL.iter().position(|p| *p == self)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResearchPhase::Complete | ResearchPhase::Error)
    }

    /// Human-readable status line emitted on entering the phase.
    pub fn status_message(self) -> &'static str {
        match self {
            ResearchPhase::Planning => "Planning search strategy",
            ResearchPhase::Searching => "Searching for sources",
            ResearchPhase::Crawling => "Fetching source content",
            ResearchPhase::Curating => "Curating sources",
            ResearchPhase::Extracting => "Extracting claims",
            ResearchPhase::BuildingGraph => "Building knowledge graph",
            ResearchPhase::Verifying => "Verifying claims against sources",
            ResearchPhase::Debating => "Debating contradictions",
            ResearchPhase::Synthesizing => "Synthesizing report",
            ResearchPhase::Complete => "Research complete",
            ResearchPhase::Error => "Research failed",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResearchPhase::Planning => "planning",
            ResearchPhase::Searching => "searching",
            ResearchPhase::Crawling => "crawling",
            ResearchPhase::Curating => "curating",
            ResearchPhase::Extracting => "extracting",
            ResearchPhase::BuildingGraph => "building_graph",
            ResearchPhase::Verifying => "verifying",
            ResearchPhase::Debating => "debating",
            ResearchPhase::Synthesizing => "synthesizing",
            ResearchPhase::Complete => "complete",
            ResearchPhase::Error => "error",
        }
    }

    /// Whether `next` may follow `self` directly.
    pub fn can_advance_to(self, next: ResearchPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == ResearchPhase::Error {
            return true;
        }
        match (self.ordinal(), next.ordinal()) {
            (Some(from), Some(to)) => {
                to == from + 1
                    || (self == ResearchPhase::Verifying && next == ResearchPhase::Synthesizing)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ResearchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Research depth, selecting how many sources are gathered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResearchMode {
    Quick,
    #[default]
    Standard,
    Deep,
}

impl ResearchMode {
    /// Number of curated sources the session aims for.
    pub fn target_sources(self) -> usize {
        match self {
            ResearchMode::Quick => 15,
            ResearchMode::Standard => 30,
            ResearchMode::Deep => 50,
        }
    }

    /// Cap on search candidates handed to the crawler.
    pub fn max_sources(self) -> usize {
        self.target_sources() * 2
    }

    /// Debate rounds allowed in this mode, never above the configured maximum.
    pub fn debate_rounds(self, configured_max: u32) -> u32 {
        match self {
            ResearchMode::Quick => configured_max.min(1),
            ResearchMode::Standard | ResearchMode::Deep => configured_max,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResearchMode::Quick => "quick",
            ResearchMode::Standard => "standard",
            ResearchMode::Deep => "deep",
        }
    }
}

impl fmt::Display for ResearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResearchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(ResearchMode::Quick),
            "standard" => Ok(ResearchMode::Standard),
            "deep" => Ok(ResearchMode::Deep),
            other => Err(format!(
                "unknown research mode '{other}' (expected quick, standard, or deep)"
            )),
        }
    }
}

/// One entry of a session's phase history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: ResearchPhase,
    pub entered_at: DateTime<Utc>,
}

/// One end-to-end run of the pipeline for a single query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSession {
    pub id: Uuid,
    pub query: String,
    pub mode: ResearchMode,
    pub phase: ResearchPhase,
    /// Never decreases within a run.
    pub progress_percent: u8,
    pub target_sources: usize,
    pub max_sources: usize,
    pub debate_enabled: bool,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub source_count: usize,
    #[serde(default)]
    pub claim_count: usize,
    #[serde(default)]
    pub debate_rounds: u32,
    pub report: Option<String>,
    pub error: Option<String>,
    /// Machine-readable failure cause, e.g. `external_provider_unavailable`.
    pub error_cause: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub phase_history: Vec<PhaseRecord>,
}

impl ResearchSession {
    pub fn new(query: impl Into<String>, mode: ResearchMode, debate_enabled: bool) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            query: query.into(),
            mode,
            phase: ResearchPhase::Planning,
            progress_percent: 0,
            target_sources: mode.target_sources(),
            max_sources: mode.max_sources(),
            debate_enabled,
            sub_queries: Vec::new(),
            source_count: 0,
            claim_count: 0,
            debate_rounds: 0,
            report: None,
            error: None,
            error_cause: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            phase_history: Vec::new(),
        }
    }

    /// Enter `next`, enforcing the canonical order.
    ///
    /// The first transition must enter `Planning`. Progress only moves forward.
    pub fn transition(&mut self, next: ResearchPhase) -> Result<(), PhaseError> {
        let allowed = if self.phase_history.is_empty() {
            matches!(next, ResearchPhase::Planning | ResearchPhase::Error)
        } else {
            self.phase.can_advance_to(next)
        };
        if !allowed {
            return Err(PhaseError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }

        let now = Utc::now();
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.phase = next;
        self.progress_percent = self.progress_percent.max(next.progress());
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.phase_history.push(PhaseRecord {
            phase: next,
            entered_at: now,
        });
        Ok(())
    }

    /// Move to `Error`, keeping everything gathered so far.
    pub fn fail(&mut self, cause: impl Into<String>, message: impl Into<String>) {
        if self.phase.is_terminal() {
            return;
        }
        self.error_cause = Some(cause.into());
        self.error = Some(message.into());
        // Error is reachable from every non-terminal phase.
        let _ = self.transition(ResearchPhase::Error);
    }

    /// Finish the session with its report.
    pub fn complete(&mut self, report: String) -> Result<(), PhaseError> {
        self.transition(ResearchPhase::Complete)?;
        self.report = Some(report);
        self.progress_percent = 100;
        Ok(())
    }

    /// Phases entered so far, in order.
    pub fn phases(&self) -> Vec<ResearchPhase> {
        self.phase_history.iter().map(|r| r.phase).collect()
    }

    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id,
            query: self.query.clone(),
            mode: self.mode,
            phase: self.phase,
            progress_percent: self.progress_percent,
            source_count: self.source_count,
            claim_count: self.claim_count,
            error: self.error.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Summary of a research session for listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub query: String,
    pub mode: ResearchMode,
    pub phase: ResearchPhase,
    pub progress_percent: u8,
    pub source_count: usize,
    pub claim_count: usize,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
