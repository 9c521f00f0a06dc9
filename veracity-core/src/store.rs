//! Session store: in-memory index backed by one JSON file per session.
//!
//! Records are written atomically under `{data_dir}/sessions/{id}.json` after
//! every phase, so a restarted process can list and inspect any session it
//! ever ran. Sessions found non-terminal on load are kept as-is; they are not
//! resumed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::persistence;
use crate::research::curator::CurationStats;
use crate::research::debate::DebateOutcome;
use crate::research::graph::{GraphSnapshot, GraphStatistics, KnowledgeGraph};
use crate::research::session::{ResearchSession, SessionSummary};
use crate::research::sources::{Claim, Source};

/// Everything known about one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session: ResearchSession,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub claims: Vec<Claim>,
    #[serde(default)]
    pub graph: GraphSnapshot,
    #[serde(default)]
    pub debates: Vec<DebateOutcome>,
    #[serde(default)]
    pub curation: Option<CurationStats>,
}

impl SessionRecord {
    pub fn new(session: ResearchSession) -> Self {
        Self {
            session,
            sources: Vec::new(),
            claims: Vec::new(),
            graph: GraphSnapshot::default(),
            debates: Vec::new(),
            curation: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.session.id
    }

    pub fn graph_statistics(&self) -> GraphStatistics {
        KnowledgeGraph::from_snapshot(&self.graph).statistics()
    }
}

/// Aggregate counters across all stored sessions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_sessions: usize,
    pub active_sessions: usize,
    pub by_phase: BTreeMap<String, usize>,
    pub total_sources: usize,
    pub total_claims: usize,
    pub total_debate_rounds: u64,
}

pub struct SessionStore {
    dir: Option<PathBuf>,
    records: RwLock<HashMap<Uuid, SessionRecord>>,
}

impl SessionStore {
    /// A store that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Open the store under `data_dir` and load every saved session.
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        let store = Self {
            dir: Some(data_dir.join("sessions")),
            records: RwLock::new(HashMap::new()),
        };
        store.load_all()?;
        Ok(store)
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn path_for(&self, id: Uuid) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{id}.json")))
    }

    /// Reload all records from disk. Unreadable files are skipped with a warning.
    pub fn load_all(&self) -> Result<usize, StoreError> {
        let Some(dir) = &self.dir else {
            return Ok(0);
        };
        let files = persistence::json_files(dir).map_err(|source| StoreError::Load {
            path: dir.clone(),
            source,
        })?;

        let mut loaded = HashMap::new();
        for path in files {
            match persistence::load_json::<SessionRecord>(&path) {
                Ok(Some(record)) => {
                    if record.session.is_active() {
                        debug!(id = %record.id(), phase = %record.session.phase, "Loaded unfinished session");
                    }
                    loaded.insert(record.id(), record);
                }
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable session file"),
            }
        }
        let count = loaded.len();
        *self.records.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = loaded;
        info!(count, dir = %dir.display(), "Loaded sessions");
        Ok(count)
    }

    /// Insert or replace a record, then persist it.
    pub fn save(&self, record: &SessionRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(record.id(), record.clone());
        if let Some(path) = self.path_for(record.id()) {
            persistence::atomic_write_json(&path, record).map_err(|source| StoreError::Persist {
                id: record.id(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Option<SessionRecord> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    fn with<T>(&self, id: Uuid, f: impl FnOnce(&SessionRecord) -> T) -> Result<T, StoreError> {
        self.records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .map(f)
            .ok_or(StoreError::NotFound { id })
    }

    pub fn session(&self, id: Uuid) -> Result<ResearchSession, StoreError> {
        self.with(id, |r| r.session.clone())
    }

    /// Newest first.
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .records
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|r| r.session.summary())
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    pub fn report(&self, id: Uuid) -> Result<Option<String>, StoreError> {
        self.with(id, |r| r.session.report.clone())
    }

    pub fn graph(&self, id: Uuid) -> Result<GraphSnapshot, StoreError> {
        self.with(id, |r| r.graph.clone())
    }

    pub fn sources(&self, id: Uuid) -> Result<Vec<Source>, StoreError> {
        self.with(id, |r| r.sources.clone())
    }

    pub fn claims(&self, id: Uuid) -> Result<Vec<Claim>, StoreError> {
        self.with(id, |r| r.claims.clone())
    }

    pub fn debates(&self, id: Uuid) -> Result<Vec<DebateOutcome>, StoreError> {
        self.with(id, |r| r.debates.clone())
    }

    /// Remove a session from memory and disk. Returns whether it existed.
    pub fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let existed = self
            .records
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
            .is_some();
        let removed = match self.path_for(id) {
            Some(path) => persistence::remove_if_exists(&path).map_err(|source| StoreError::Persist { id, source })?,
            None => false,
        };
        Ok(existed || removed)
    }

    pub fn stats(&self) -> StoreStats {
        let records = self.records.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats = StoreStats {
            total_sessions: records.len(),
            ..Default::default()
        };
        for record in records.values() {
            let session = &record.session;
            *stats.by_phase.entry(session.phase.as_str().to_string()).or_default() += 1;
            if session.is_active() {
                stats.active_sessions += 1;
            }
            stats.total_sources += session.source_count;
            stats.total_claims += session.claim_count;
            stats.total_debate_rounds += u64::from(session.debate_rounds);
        }
        stats
    }
}
