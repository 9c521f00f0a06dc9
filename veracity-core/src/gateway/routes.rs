//! Gateway routes built on axum.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt, future};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::error::ApiError;
use crate::events::EventEnvelope;
use crate::research::ResearchEngine;
use crate::research::curator::CurationStats;
use crate::research::graph::{GraphSnapshot, GraphStatistics, KnowledgeGraph};
use crate::research::session::{ResearchMode, ResearchPhase, ResearchSession, SessionSummary};
use crate::research::sources::{Claim, Source};
use crate::store::StoreStats;

type SharedEngine = Arc<ResearchEngine>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    #[serde(default)]
    pub mode: ResearchMode,
    /// Overrides `debate.enabled` for this session.
    #[serde(default)]
    pub debate: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchStarted {
    pub session_id: Uuid,
    pub session: SessionSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: ResearchSession,
    pub graph: GraphStatistics,
    pub curation: Option<CurationStats>,
    pub debates: usize,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphView {
    #[serde(flatten)]
    pub snapshot: GraphSnapshot,
    pub statistics: GraphStatistics,
}

/// Build the gateway router over a shared engine.
pub fn router(engine: SharedEngine) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/research", post(start_research))
        .route("/api/stats", get(stats))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", get(session_detail).delete(delete_session))
        .route("/api/sessions/{id}/cancel", post(cancel_session))
        .route("/api/sessions/{id}/report", get(session_report))
        .route("/api/sessions/{id}/graph", get(session_graph))
        .route("/api/sessions/{id}/sources", get(session_sources))
        .route("/api/sessions/{id}/claims", get(session_claims))
        .route("/api/sessions/{id}/events", get(session_events))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(engine)
}

/// Serve the gateway on `addr` until `shutdown` resolves, then stop all sessions.
pub async fn serve(
    engine: SharedEngine,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Gateway listening");
    axum::serve(listener, router(Arc::clone(&engine)))
        .with_graceful_shutdown(shutdown)
        .await?;
    engine.shutdown().await;
    Ok(())
}

async fn health(State(engine): State<SharedEngine>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "running": engine.running_count(),
        "sessions": engine.store().stats().total_sessions,
    }))
}

async fn start_research(
    State(engine): State<SharedEngine>,
    Json(request): Json<ResearchRequest>,
) -> Result<(StatusCode, Json<ResearchStarted>), ApiError> {
    let session = engine.start(&request.query, request.mode, request.debate)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ResearchStarted {
            session_id: session.id,
            session: session.summary(),
        }),
    ))
}

async fn stats(State(engine): State<SharedEngine>) -> Json<StoreStats> {
    Json(engine.store().stats())
}

async fn list_sessions(State(engine): State<SharedEngine>) -> Json<Vec<SessionSummary>> {
    Json(engine.store().list())
}

async fn session_detail(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionDetail>, ApiError> {
    let record = engine
        .store()
        .get(id)
        .ok_or_else(|| ApiError::not_found(format!("Session not found: {id}")))?;
    Ok(Json(SessionDetail {
        graph: record.graph_statistics(),
        curation: record.curation.clone(),
        debates: record.debates.len(),
        running: engine.is_running(id),
        session: record.session,
    }))
}

async fn delete_session(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if engine.is_running(id) {
        return Err(ApiError::conflict(format!("Session {id} is still running")));
    }
    if engine.delete(id)? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!("Session not found: {id}")))
    }
}

async fn cancel_session(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    engine.store().session(id)?;
    if engine.cancel(id) {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::conflict(format!("Session {id} is not running")))
    }
}

async fn session_report(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let session = engine.store().session(id)?;
    Ok(Json(json!({
        "session_id": id,
        "phase": session.phase,
        "complete": session.phase == ResearchPhase::Complete,
        "markdown": session.report,
    })))
}

async fn session_graph(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<Json<GraphView>, ApiError> {
    let snapshot = engine.store().graph(id)?;
    let statistics = KnowledgeGraph::from_snapshot(&snapshot).statistics();
    Ok(Json(GraphView { snapshot, statistics }))
}

async fn session_sources(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Source>>, ApiError> {
    Ok(Json(engine.store().sources(id)?))
}

async fn session_claims(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Claim>>, ApiError> {
    Ok(Json(engine.store().claims(id)?))
}

/// Replay the session's history, then follow it live until its final event.
async fn session_events(
    State(engine): State<SharedEngine>,
    Path(id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let session = engine.store().session(id)?;
    // Subscribe before reading history so nothing falls between the two.
    let live = engine.events().subscribe();
    let history = engine.events().history(id);
    let finished =
        !session.is_active() || !engine.is_running(id) || history.last().is_some_and(|e| e.event.is_final());
    let next_sequence = history.last().map_or(0, |e| e.sequence + 1);

    let replay = stream::iter(history);
    let envelopes: BoxStream<'static, EventEnvelope> = if finished {
        replay.boxed()
    } else {
        let follow = BroadcastStream::new(live).filter_map(move |item| {
            future::ready(match item {
                Ok(envelope) if envelope.session_id == id && envelope.sequence >= next_sequence => Some(envelope),
                Ok(_) => None,
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Event subscriber lagged");
                    None
                }
            })
        });
        until_final(replay.chain(follow)).boxed()
    };

    let events = envelopes.map(|envelope| {
        Event::default()
            .event(envelope.event.kind())
            .id(envelope.sequence.to_string())
            .json_data(&envelope)
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Pass envelopes through up to and including the first final one.
fn until_final(envelopes: impl Stream<Item = EventEnvelope>) -> impl Stream<Item = EventEnvelope> {
    envelopes.scan(false, |done, envelope| {
        if *done {
            return future::ready(None);
        }
        *done = envelope.event.is_final();
        future::ready(Some(envelope))
    })
}
