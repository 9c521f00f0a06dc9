//! Session event protocol.
//!
//! Every session owns one ordered `mpsc` channel. The [`EventHub`] drains each
//! session channel into a per-session history (for late subscribers and
//! inspection) and a broadcast channel that transport adapters relay.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::research::debate::DebateArgument;
use crate::research::graph::{GraphDelta, GraphEdge, GraphNode};
use crate::research::session::{ResearchMode, ResearchPhase};
use crate::research::sources::{Claim, Source, SourceType};

/// Compact view of an admitted source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePreview {
    pub id: String,
    pub url: String,
    pub title: String,
    pub domain: String,
    pub source_type: SourceType,
    pub credibility: f64,
    pub relevance: f32,
    pub word_count: usize,
}

impl From<&Source> for SourcePreview {
    fn from(source: &Source) -> Self {
        Self {
            id: source.id.clone(),
            url: source.url.clone(),
            title: source.title.clone(),
            domain: source.domain.clone(),
            source_type: source.source_type,
            credibility: source.credibility,
            relevance: source.relevance,
            word_count: source.word_count,
        }
    }
}

/// Events emitted while a session runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    SessionCreated {
        query: String,
        mode: ResearchMode,
    },
    /// Emitted once on entering each phase.
    Status {
        phase: ResearchPhase,
        message: String,
        progress_percent: u8,
    },
    Source {
        source: SourcePreview,
    },
    Claim {
        claim: Claim,
        agent: String,
    },
    Graph {
        added_nodes: Vec<GraphNode>,
        added_edges: Vec<GraphEdge>,
    },
    Debate {
        round: u32,
        agent: String,
        claim_id: String,
        argument: String,
        confidence: f64,
    },
    Report {
        markdown: String,
        complete: bool,
    },
    Error {
        message: String,
        details: Option<String>,
    },
}

impl ResearchEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ResearchEvent::SessionCreated { .. } => "session_created",
            ResearchEvent::Status { .. } => "status",
            ResearchEvent::Source { .. } => "source",
            ResearchEvent::Claim { .. } => "claim",
            ResearchEvent::Graph { .. } => "graph",
            ResearchEvent::Debate { .. } => "debate",
            ResearchEvent::Report { .. } => "report",
            ResearchEvent::Error { .. } => "error",
        }
    }

    /// The last event a session emits: COMPLETE status or an error.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ResearchEvent::Status {
                phase: ResearchPhase::Complete,
                ..
            } | ResearchEvent::Error { .. }
        )
    }

    pub fn graph(delta: GraphDelta) -> Self {
        ResearchEvent::Graph {
            added_nodes: delta.added_nodes,
            added_edges: delta.added_edges,
        }
    }

    pub fn debate(argument: &DebateArgument) -> Self {
        ResearchEvent::Debate {
            round: argument.round,
            agent: argument.agent.clone(),
            claim_id: argument.claim_id.clone(),
            argument: argument.argument.clone(),
            confidence: argument.confidence,
        }
    }
}

/// An event with its session and position in that session's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: Uuid,
    /// Strictly increasing per session, starting at 0.
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: ResearchEvent,
}

/// Producer side of a session's event channel.
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: Uuid,
    sequence: Arc<AtomicU64>,
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl EventSink {
    pub fn channel(session_id: Uuid) -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                session_id,
                sequence: Arc::new(AtomicU64::new(0)),
                tx,
            },
            rx,
        )
    }

    /// Sink whose events go nowhere.
    pub fn detached(session_id: Uuid) -> Self {
        Self::channel(session_id).0
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Queue an event. Returns false once the receiving side is gone.
    pub fn emit(&self, event: ResearchEvent) -> bool {
        let envelope = EventEnvelope {
            session_id: self.session_id,
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        };
        trace!(session_id = %self.session_id, kind = envelope.event.kind(), seq = envelope.sequence, "Event");
        self.tx.send(envelope).is_ok()
    }
}

#[derive(Debug, Default)]
struct History {
    sessions: HashMap<Uuid, VecDeque<EventEnvelope>>,
    /// Sessions that emitted their final event, oldest first.
    finished: VecDeque<Uuid>,
}

/// Fan-in of all session channels.
///
/// History is bounded twice: each session keeps its most recent
/// `max_events_per_session` events, and only the latest
/// `max_finished_sessions` finished sessions keep any history at all.
#[derive(Debug)]
pub struct EventHub {
    tx: broadcast::Sender<EventEnvelope>,
    history: RwLock<History>,
    max_events_per_session: usize,
    max_finished_sessions: usize,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self {
            tx,
            history: RwLock::new(History::default()),
            max_events_per_session: 10_000,
            max_finished_sessions: 64,
        }
    }

    pub fn with_retention(mut self, max_events_per_session: usize, max_finished_sessions: usize) -> Self {
        self.max_events_per_session = max_events_per_session.max(1);
        self.max_finished_sessions = max_finished_sessions;
        self
    }

    /// Open a channel for `session_id` and drain it into the hub.
    pub fn attach(self: &Arc<Self>, session_id: Uuid) -> (EventSink, JoinHandle<()>) {
        let (sink, mut rx) = EventSink::channel(session_id);
        let hub = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                hub.publish(envelope);
            }
            debug!(%session_id, "Session event channel closed");
        });
        (sink, handle)
    }

    pub fn publish(&self, envelope: EventEnvelope) {
        {
            let mut history = self.history.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            let id = envelope.session_id;
            let events = history.sessions.entry(id).or_default();
            events.push_back(envelope.clone());
            while events.len() > self.max_events_per_session {
                events.pop_front();
            }
            if envelope.event.is_final() && !history.finished.contains(&id) {
                history.finished.push_back(id);
                while history.finished.len() > self.max_finished_sessions {
                    if let Some(evicted) = history.finished.pop_front() {
                        history.sessions.remove(&evicted);
                        trace!(session_id = %evicted, "Evicted event history");
                    }
                }
            }
        }
        // No subscribers is fine.
        let _ = self.tx.send(envelope);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    pub fn history(&self, session_id: Uuid) -> Vec<EventEnvelope> {
        self.history
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .sessions
            .get(&session_id)
            .map(|events| events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn forget(&self, session_id: Uuid) {
        let mut history = self.history.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        history.sessions.remove(&session_id);
        history.finished.retain(|id| *id != session_id);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}
