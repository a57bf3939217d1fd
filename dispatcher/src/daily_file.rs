//! Per-day JSONL append-file helper shared by the session store (C9) and the
//! request/response log (C12).
//!
//! Grounded on `passport-for-ai`'s `store_proof_to_file` (serialize with
//! `serde_json`, write via `std::fs`, one artifact per unit of work):
//! generalized here from "one file per proof" into "one append-only file per
//! UTC day, one JSON object per line" so a reader recovers every record
//! written before a crash or partial write, per the data model's "single-line
//! JSON so partial file damage only loses individual lines" invariant.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fd_lock::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Today's UTC date, as the `YYYY-MM-DD` suffix used in every per-day file name.
pub fn today() -> NaiveDate {
    Utc::now().date_naive()
}

pub fn date_suffix(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// A directory of `{prefix}_{YYYY-MM-DD}.jsonl` files, append-only, one
/// process-wide writer lock per file (advisory, via `fd-lock`; multiple
/// readers are always safe since reads never truncate or seek-write).
pub struct DailyStore {
    dir: PathBuf,
    prefix: &'static str,
}

impl DailyStore {
    pub fn new(dir: impl Into<PathBuf>, prefix: &'static str) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
        Ok(Self { dir, prefix })
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}_{}.jsonl", self.prefix, date_suffix(date)))
    }

    /// Append one record to today's file under the writer lock.
    pub fn append<T: Serialize>(&self, date: NaiveDate, record: &T) -> Result<()> {
        let path = self.path_for(date);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;
        let mut locked = RwLock::new(file);
        let mut guard = locked.write().context("locking daily file for append")?;
        let line = serde_json::to_string(record).context("serializing record")?;
        guard.write_all(line.as_bytes())?;
        guard.write_all(b"\n")?;
        guard.flush()?;
        Ok(())
    }

    /// Replay every record in a single day's file, in append order.
    pub fn read_day<T: DeserializeOwned>(&self, date: NaiveDate) -> Result<Vec<T>> {
        read_jsonl(&self.path_for(date))
    }

    /// Replay today's file, then walk backwards up to `horizon_days`
    /// additional days (C9 `listPending`'s "scan today, then previous days on
    /// demand up to a configurable horizon").
    pub fn read_recent<T: DeserializeOwned>(&self, horizon_days: u32) -> Result<Vec<T>> {
        let mut all = Vec::new();
        let start = today();
        for offset in 0..=horizon_days {
            let date = start - chrono::Duration::days(offset as i64);
            all.extend(self.read_day(date)?);
        }
        Ok(all)
    }
}

fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let Ok(file) = std::fs::File::open(path) else {
        return Ok(Vec::new());
    };
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        // A damaged trailing line (e.g. the process was killed mid-write)
        // is skipped rather than failing the whole replay.
        match serde_json::from_str::<T>(&line) {
            Ok(record) => out.push(record),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping damaged JSONL line"),
        }
    }
    Ok(out)
}

pub fn unix_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp() as f64 + ts.timestamp_subsec_millis() as f64 / 1000.0
}
