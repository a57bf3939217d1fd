//! Task session store (C9): an append-only per-day log of `Pending` /
//! `Finished` / `Failed` sessions, replayed into the latest-status-per-id
//! view `listPending`/`getById` expose.
//!
//! Status transitions are themselves append-only records rather than
//! in-place updates -- `markFinished`/`markFailed` append a new record with
//! the same `id`; readers fold a day's records by id, keeping the latest,
//! which makes "Pending -> Finished/Failed, never the reverse" (§3) a
//! property of the fold rather than something every writer must remember to
//! enforce.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::daily_file::DailyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Finished,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub task_id: String,
    pub provider_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
}

pub struct SessionStore {
    store: DailyStore,
    /// How many days back `list_pending`/`get_by_id` scan in addition to
    /// today, per §4.C9 "up to a configurable horizon".
    horizon_days: u32,
}

impl SessionStore {
    pub fn new(dir: impl Into<std::path::PathBuf>, horizon_days: u32) -> Result<Self> {
        Ok(Self { store: DailyStore::new(dir, "sessions")?, horizon_days })
    }

    pub fn create(&self, task_id: impl Into<String>, provider_id: impl Into<String>, extras: Option<serde_json::Value>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let session = Session {
            id,
            task_id: task_id.into(),
            provider_id: provider_id.into(),
            status: SessionStatus::Pending,
            created_at: now,
            updated_at: now,
            extras,
        };
        self.store.append(now.date_naive(), &session)?;
        Ok(id)
    }

    /// Latest-status view of every session touched within the horizon,
    /// filtered to `Pending`, in the order each id was first created.
    pub fn list_pending(&self) -> Result<Vec<Session>> {
        let latest = self.latest_by_id()?;
        let mut pending: Vec<Session> = latest.into_values().filter(|s| s.status == SessionStatus::Pending).collect();
        pending.sort_by_key(|s| s.created_at);
        Ok(pending)
    }

    pub fn get_by_id(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.latest_by_id()?.remove(&id))
    }

    pub fn mark_finished(&self, id: Uuid, extras: Option<serde_json::Value>) -> Result<()> {
        self.transition(id, SessionStatus::Finished, extras)
    }

    pub fn mark_failed(&self, id: Uuid, reason: impl Into<String>) -> Result<()> {
        self.transition(id, SessionStatus::Failed, Some(serde_json::json!({ "reason": reason.into() })))
    }

    fn transition(&self, id: Uuid, status: SessionStatus, extras: Option<serde_json::Value>) -> Result<()> {
        let Some(existing) = self.get_by_id(id)? else {
            anyhow::bail!("no session with id {id}");
        };
        if existing.status != SessionStatus::Pending {
            anyhow::bail!("session {id} already terminal ({:?}); refusing transition to {:?}", existing.status, status);
        }
        let now = Utc::now();
        let updated = Session { status, updated_at: now, extras, ..existing };
        self.store.append(now.date_naive(), &updated)
    }

    fn latest_by_id(&self) -> Result<HashMap<Uuid, Session>> {
        let all: Vec<Session> = self.store.read_recent(self.horizon_days)?;
        let mut latest: HashMap<Uuid, Session> = HashMap::new();
        for session in all {
            latest
                .entry(session.id)
                .and_modify(|existing| {
                    if session.updated_at >= existing.updated_at {
                        *existing = session.clone();
                    }
                })
                .or_insert(session);
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_list_pending_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 0).unwrap();
        let id = store.create("task-1", "provider-a", None).unwrap();
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].status, SessionStatus::Pending);
    }

    #[test]
    fn mark_finished_removes_from_pending_and_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 0).unwrap();
        let id = store.create("task-1", "provider-a", None).unwrap();
        store.mark_finished(id, Some(serde_json::json!({"ok": true}))).unwrap();

        assert!(store.list_pending().unwrap().is_empty());
        let session = store.get_by_id(id).unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Finished);

        let err = store.mark_failed(id, "too late").unwrap_err();
        assert!(err.to_string().contains("already terminal"));
    }

    #[test]
    fn oldest_pending_sorts_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 0).unwrap();
        let first = store.create("task-1", "provider-a", None).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let _second = store.create("task-2", "provider-a", None).unwrap();
        let pending = store.list_pending().unwrap();
        assert_eq!(pending[0].id, first);
    }

    #[test]
    fn unknown_session_id_rejects_transition() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path(), 0).unwrap();
        let err = store.mark_finished(Uuid::new_v4(), None).unwrap_err();
        assert!(err.to_string().contains("no session with id"));
    }
}
