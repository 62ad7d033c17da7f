//! Session persistence with optimistic versioning.
//!
//! Every mutation of a [`WorkflowSession`] is written through a
//! [`SessionStore`]. On restart the session is loaded by id (the checkpoint
//! id) and work resumes from the persisted cursor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use waypoint_types::{Result, SessionStatus, WaypointError, WorkflowSession};

/// Listing entry for a persisted session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub workflow_type: String,
    pub scope_root: String,
    pub status: SessionStatus,
    pub current_phase: Option<String>,
    pub files_total: usize,
    pub files_completed: usize,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&WorkflowSession> for SessionSummary {
    fn from(s: &WorkflowSession) -> Self {
        Self {
            session_id: s.id.clone(),
            workflow_type: s.workflow_type.clone(),
            scope_root: s.scope_root.clone(),
            status: s.status,
            current_phase: s.current_phase_id.clone(),
            files_total: s.counters.files_total,
            files_completed: s.counters.files_completed,
            version: s.version,
            updated_at: s.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// SessionStore trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load a session by id; `Ok(None)` when it does not exist.
    async fn load(&self, session_id: &str) -> Result<Option<WorkflowSession>>;

    /// Persist `session`. Fails with `ConcurrentModification` when the stored
    /// version differs from `session.version`; on success the version is
    /// incremented in place.
    async fn save(&self, session: &mut WorkflowSession) -> Result<()>;

    /// Every stored session, most recently updated first.
    async fn list(&self) -> Result<Vec<SessionSummary>>;

    /// Remove a session. Returns whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool>;
}

fn check_version(session: &WorkflowSession, stored: Option<u64>) -> Result<()> {
    let found = stored.unwrap_or(0);
    if found != session.version {
        return Err(WaypointError::ConcurrentModification {
            session_id: session.id.clone(),
            expected: session.version,
            found,
        });
    }
    Ok(())
}

fn sort_summaries(summaries: &mut [SessionSummary]) {
    summaries.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
}

// ---------------------------------------------------------------------------
// FileSessionStore
// ---------------------------------------------------------------------------

/// One pretty-printed JSON document per session under a directory.
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of a session's document. Ids that could escape the directory are
    /// rejected as unknown sessions.
    fn path_for(&self, session_id: &str) -> Result<PathBuf> {
        let safe = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !safe {
            return Err(WaypointError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        }
        Ok(self.dir.join(format!("{session_id}.json")))
    }

    async fn read(path: &Path) -> Result<Option<WorkflowSession>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }
        let json = tokio::fs::read_to_string(path).await?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<WorkflowSession>> {
        let path = self.path_for(session_id)?;
        Self::read(&path).await
    }

    async fn save(&self, session: &mut WorkflowSession) -> Result<()> {
        let path = self.path_for(&session.id)?;
        let stored = Self::read(&path).await?.map(|s| s.version);
        check_version(session, stored)?;

        session.version += 1;
        session.touch();
        tokio::fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(session)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(
            session_id = %session.id,
            version = session.version,
            path = %path.display(),
            "Session saved"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        if !tokio::fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(session)) => summaries.push(SessionSummary::from(&session)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session file");
                }
            }
        }
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.path_for(session_id)?;
        if tokio::fs::try_exists(&path).await? {
            tokio::fs::remove_file(&path).await?;
            return Ok(true);
        }
        Ok(false)
    }
}

// ---------------------------------------------------------------------------
// MemorySessionStore
// ---------------------------------------------------------------------------

/// Sessions held in memory; for tests and embedding.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, WorkflowSession>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, session_id: &str) -> Result<Option<WorkflowSession>> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn save(&self, session: &mut WorkflowSession) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        check_version(session, sessions.get(&session.id).map(|s| s.version))?;
        session.version += 1;
        session.touch();
        sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(SessionSummary::from)
            .collect();
        sort_summaries(&mut summaries);
        Ok(summaries)
    }

    async fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
