//! Request/response log (C12): three parallel per-day JSONL streams --
//! `requests`, `responses`, `index` -- keyed by a generated request id.
//!
//! The index is the single source of truth for a request's completion
//! state (§3 invariant): `start_request` appends a `pending` index record,
//! and exactly one of `complete_success`/`complete_failure` later appends
//! the matching `completed`/`failed` index record plus the response body.
//! Nothing ever rewrites an earlier line; readers fold by id same as C9.

use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::daily_file::{unix_seconds, DailyStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub request_id: Uuid,
    pub timestamp: f64,
    pub datetime: DateTime<Utc>,
    pub date: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub request_id: Uuid,
    pub timestamp: f64,
    pub datetime: DateTime<Utc>,
    pub date: String,
    pub execution_time: f64,
    pub success: bool,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRecord {
    pub request_id: Uuid,
    pub date: String,
    pub request_timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    pub status: RequestStatus,
}

pub struct LogStore {
    requests: DailyStore,
    responses: DailyStore,
    index: DailyStore,
}

impl LogStore {
    pub fn new(dir: impl Into<std::path::PathBuf> + Clone) -> Result<Self> {
        Ok(Self {
            requests: DailyStore::new(dir.clone(), "requests")?,
            responses: DailyStore::new(dir.clone(), "responses")?,
            index: DailyStore::new(dir, "index")?,
        })
    }

    /// Persist the outbound request under a freshly generated id and mark
    /// it `pending` in the index. Returns the id and the moment recorded,
    /// so `complete_success`/`complete_failure` can compute `execution_time`.
    pub fn start_request(&self, data: serde_json::Value) -> Result<(Uuid, DateTime<Utc>)> {
        let request_id = Uuid::new_v4();
        let now = Utc::now();
        let date = now.date_naive().format("%Y-%m-%d").to_string();
        let timestamp = unix_seconds(now);

        self.requests.append(
            now.date_naive(),
            &RequestRecord { request_id, timestamp, datetime: now, date: date.clone(), data },
        )?;
        self.index.append(
            now.date_naive(),
            &IndexRecord { request_id, date, request_timestamp: timestamp, response_timestamp: None, success: None, status: RequestStatus::Pending },
        )?;
        Ok((request_id, now))
    }

    pub fn complete_success(&self, request_id: Uuid, started_at: DateTime<Utc>, data: serde_json::Value) -> Result<()> {
        self.complete(request_id, started_at, true, data)
    }

    pub fn complete_failure(&self, request_id: Uuid, started_at: DateTime<Utc>, data: serde_json::Value) -> Result<()> {
        self.complete(request_id, started_at, false, data)
    }

    fn complete(&self, request_id: Uuid, started_at: DateTime<Utc>, success: bool, data: serde_json::Value) -> Result<()> {
        let now = Utc::now();
        let date = now.date_naive().format("%Y-%m-%d").to_string();
        let timestamp = unix_seconds(now);
        let execution_time = timestamp - unix_seconds(started_at);

        self.responses.append(
            now.date_naive(),
            &ResponseRecord { request_id, timestamp, datetime: now, date: date.clone(), execution_time, success, data },
        )?;
        self.index.append(
            now.date_naive(),
            &IndexRecord {
                request_id,
                date,
                request_timestamp: unix_seconds(started_at),
                response_timestamp: Some(timestamp),
                success: Some(success),
                status: if success { RequestStatus::Completed } else { RequestStatus::Failed },
            },
        )
    }

    /// Fold a day's index records by id, keeping the last (i.e. most
    /// complete) one -- `pending` -> `completed`/`failed`.
    pub fn index_for_day(&self, date: chrono::NaiveDate) -> Result<Vec<IndexRecord>> {
        let all: Vec<IndexRecord> = self.index.read_day(date)?;
        let mut latest: HashMap<Uuid, IndexRecord> = HashMap::new();
        for record in all {
            latest.insert(record.request_id, record);
        }
        Ok(latest.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_then_completed_has_one_coherent_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path()).unwrap();
        let (id, started) = store.start_request(serde_json::json!({"url": "https://x"})).unwrap();

        let today = Utc::now().date_naive();
        let index = store.index_for_day(today).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].status, RequestStatus::Pending);
        assert!(index[0].response_timestamp.is_none());

        store.complete_success(id, started, serde_json::json!({"claim": "..."})).unwrap();
        let index = store.index_for_day(today).unwrap();
        assert_eq!(index.len(), 1);
        assert_eq!(index[0].status, RequestStatus::Completed);
        assert_eq!(index[0].success, Some(true));
        assert!(index[0].response_timestamp.is_some());
    }

    #[test]
    fn failed_completion_records_success_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = LogStore::new(dir.path()).unwrap();
        let (id, started) = store.start_request(serde_json::json!({})).unwrap();
        store.complete_failure(id, started, serde_json::json!({"error": "timeout"})).unwrap();

        let today = Utc::now().date_naive();
        let index = store.index_for_day(today).unwrap();
        assert_eq!(index[0].status, RequestStatus::Failed);
        assert_eq!(index[0].success, Some(false));
    }
}
