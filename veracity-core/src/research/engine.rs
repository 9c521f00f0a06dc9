//! Research engine: owns the shared pipeline and launches sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};
use uuid::Uuid;

use super::orchestrator::SessionOrchestrator;
use super::pipeline::Pipeline;
use super::session::{ResearchMode, ResearchSession};
use crate::config::VeracityConfig;
use crate::error::{Result, VeracityError};
use crate::events::EventHub;
use crate::store::{SessionRecord, SessionStore};

const MAX_QUERY_CHARS: usize = 2_000;

type Running = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

/// Entry point for starting, running, and cancelling research sessions.
pub struct ResearchEngine {
    config: Arc<VeracityConfig>,
    pipeline: Arc<Pipeline>,
    store: Arc<SessionStore>,
    events: Arc<EventHub>,
    tracker: TaskTracker,
    running: Running,
    shutdown: CancellationToken,
}

impl ResearchEngine {
    pub fn new(config: VeracityConfig, pipeline: Pipeline, store: SessionStore) -> Self {
        let events = Arc::new(EventHub::new(config.server.event_buffer).with_retention(
            config.server.event_history_per_session,
            config.server.finished_session_histories,
        ));
        Self {
            config: Arc::new(config),
            pipeline: Arc::new(pipeline),
            store: Arc::new(store),
            events,
            tracker: TaskTracker::new(),
            running: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    /// Network-backed engine persisting under the configured data directory.
    pub fn from_config(config: VeracityConfig) -> Result<Self> {
        let pipeline = Pipeline::from_config(&config)?;
        let data_dir = config.storage.resolve_data_dir();
        let store = SessionStore::open(&data_dir)?;
        info!(data_dir = %data_dir.display(), "Research engine ready");
        Ok(Self::new(config, pipeline, store))
    }

    pub fn config(&self) -> &VeracityConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventHub> {
        &self.events
    }

    /// Start a session in the background and return it in its initial state.
    pub fn start(&self, query: &str, mode: ResearchMode, debate: Option<bool>) -> Result<ResearchSession> {
        let (orchestrator, drain) = self.prepare(query, mode, debate)?;
        let session = orchestrator.session().clone();
        let id = session.id;
        let running = Arc::clone(&self.running);

        self.tracker.spawn(async move {
            let record = orchestrator.run().await;
            debug!(%id, phase = %record.session.phase, "Session task finished");
            running.lock().unwrap_or_else(|p| p.into_inner()).remove(&id);
            let _ = drain.await;
        });
        Ok(session)
    }

    /// Run a session to completion on the current task.
    pub async fn run(&self, query: &str, mode: ResearchMode, debate: Option<bool>) -> Result<SessionRecord> {
        let (orchestrator, drain) = self.prepare(query, mode, debate)?;
        let id = orchestrator.session().id;
        let record = orchestrator.run().await;
        self.lock_running().remove(&id);
        let _ = drain.await;
        Ok(record)
    }

    fn prepare(
        &self,
        query: &str,
        mode: ResearchMode,
        debate: Option<bool>,
    ) -> Result<(SessionOrchestrator, JoinHandle<()>)> {
        let query = query.trim();
        if query.is_empty() {
            return Err(VeracityError::InvalidRequest("query must not be empty".into()));
        }
        if query.chars().count() > MAX_QUERY_CHARS {
            return Err(VeracityError::InvalidRequest(format!(
                "query exceeds {MAX_QUERY_CHARS} characters"
            )));
        }

        let session = ResearchSession::new(query, mode, debate.unwrap_or(self.config.debate.enabled));
        self.store.save(&SessionRecord::new(session.clone()))?;

        let (sink, drain) = self.events.attach(session.id);
        let cancel = self.shutdown.child_token();
        self.lock_running().insert(session.id, cancel.clone());
        info!(id = %session.id, %mode, "Session created");

        let orchestrator = SessionOrchestrator::new(
            Arc::clone(&self.config),
            Arc::clone(&self.pipeline),
            Arc::clone(&self.store),
            sink,
            cancel,
            session,
        );
        Ok((orchestrator, drain))
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.running.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn is_running(&self, id: Uuid) -> bool {
        self.lock_running().contains_key(&id)
    }

    pub fn running_count(&self) -> usize {
        self.lock_running().len()
    }

    /// Request cancellation. Returns false if the session is not running.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock_running().get(&id) {
            Some(token) => {
                info!(%id, "Cancelling session");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove a finished session and its event history.
    pub fn delete(&self, id: Uuid) -> Result<bool> {
        if self.is_running(id) {
            return Err(VeracityError::InvalidRequest(format!(
                "session {id} is still running; cancel it first"
            )));
        }
        self.events.forget(id);
        Ok(self.store.delete(id)?)
    }

    /// Wait for every spawned session to finish.
    pub async fn wait_idle(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel all sessions and wait for them to record their final state.
    pub async fn shutdown(&self) {
        info!(running = self.running_count(), "Shutting down research engine");
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
