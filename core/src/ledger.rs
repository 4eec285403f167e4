//! Repair history ledger.
//!
//! ```text
//! <state_dir>/repair-history.jsonl
//!   {"event":"start","id":"1718000000-connection_refused",...}
//!   {"event":"complete","id":"1718000000-connection_refused","status":"success",...}
//! ```
//!
//! The file is append-only. Loading folds each `complete` event into the most
//! recent `start` with the same id, so a record has exactly one completion.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::jsonl::{self, JsonlError};
use crate::lock::{LockError, LockGuard, LockName};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error(transparent)]
    Storage(#[from] JsonlError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("repair attempt not found: {id}")]
    NotFound { id: String },

    #[error("repair attempt {id} is already completed")]
    AlreadyCompleted { id: String },

    #[error("a repair attempt cannot be completed with status `started`")]
    InvalidStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairType {
    AutoFix,
    Agent,
}

impl RepairType {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairType::AutoFix => "auto_fix",
            RepairType::Agent => "agent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Started,
    Success,
    Failed,
}

impl RepairStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RepairStatus::Started => "started",
            RepairStatus::Success => "success",
            RepairStatus::Failed => "failed",
        }
    }
}

/// One repair attempt with its completion folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub fingerprint: String,
    pub diagnostic_exit: i32,
    pub repair_type: RepairType,
    pub status: RepairStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub cost_usd: f64,
    pub turns: u32,
    pub resolution: Option<String>,
}

/// Final figures for an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub status: RepairStatus,
    pub cost_usd: f64,
    pub turns: u32,
    pub resolution: Option<String>,
}

impl Completion {
    /// A zero-cost completion, as recorded for auto-fix attempts.
    pub fn free(status: RepairStatus, resolution: Option<String>) -> Self {
        Self {
            status,
            cost_usd: 0.0,
            turns: 0,
            resolution,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum LedgerEvent {
    Start {
        id: String,
        started_at: DateTime<Utc>,
        fingerprint: String,
        diagnostic_exit: i32,
        repair_type: RepairType,
    },
    Complete {
        id: String,
        completed_at: DateTime<Utc>,
        status: RepairStatus,
        cost_usd: f64,
        turns: u32,
        resolution: Option<String>,
    },
}

/// Aggregate view for `warden status`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SummaryStats {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub in_progress: usize,
    pub auto_fix: usize,
    pub agent: usize,
    pub total_cost_usd: f64,
    pub by_fingerprint: BTreeMap<String, usize>,
    pub last_attempt: Option<DateTime<Utc>>,
}

pub struct RepairLedger {
    path: PathBuf,
    records: Vec<RepairRecord>,
}

impl RepairLedger {
    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let events: Vec<LedgerEvent> = jsonl::read_all(&path)?;
        let mut ledger = Self {
            path,
            records: Vec::new(),
        };
        for event in events {
            if let Err(e) = ledger.apply(event) {
                tracing::warn!(file = %ledger.path.display(), error = %e, "ignoring ledger event");
            }
        }
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a `started` record and return its id.
    pub fn record_start(
        &mut self,
        guard: &LockGuard,
        fingerprint: &str,
        diagnostic_exit: i32,
        repair_type: RepairType,
    ) -> Result<String, LedgerError> {
        guard.ensure(LockName::Health)?;
        let started_at = Utc::now();
        let id = format!("{}-{fingerprint}", started_at.timestamp());
        let event = LedgerEvent::Start {
            id: id.clone(),
            started_at,
            fingerprint: fingerprint.to_string(),
            diagnostic_exit,
            repair_type,
        };
        jsonl::append(&self.path, &event)?;
        self.apply(event)?;
        tracing::info!(id = %id, repair_type = repair_type.as_str(), "repair attempt started");
        Ok(id)
    }

    /// Complete the most recent started record with `id`.
    pub fn record_complete(
        &mut self,
        guard: &LockGuard,
        id: &str,
        completion: Completion,
    ) -> Result<(), LedgerError> {
        guard.ensure(LockName::Health)?;
        let event = LedgerEvent::Complete {
            id: id.to_string(),
            completed_at: Utc::now(),
            status: completion.status,
            cost_usd: completion.cost_usd,
            turns: completion.turns,
            resolution: completion.resolution,
        };
        // Validate against the in-memory view before touching the file.
        self.completion_target(id, completion.status)?;
        jsonl::append(&self.path, &event)?;
        self.apply(event)?;
        tracing::info!(id, status = ?completion.status, "repair attempt completed");
        Ok(())
    }

    /// Attempts for `fingerprint` that started in the last `window_minutes`.
    pub fn count_recent(&self, fingerprint: &str, window_minutes: u64) -> usize {
        self.count_recent_at(fingerprint, window_minutes, Utc::now())
    }

    pub fn count_recent_at(&self, fingerprint: &str, window_minutes: u64, now: DateTime<Utc>) -> usize {
        let window = chrono::Duration::from_std(Duration::from_secs(window_minutes.saturating_mul(60)))
            .unwrap_or(chrono::Duration::MAX);
        let since = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.records
            .iter()
            .filter(|r| r.fingerprint == fingerprint && r.started_at >= since)
            .count()
    }

    pub fn summary_stats(&self) -> SummaryStats {
        let mut stats = SummaryStats::default();
        for record in &self.records {
            stats.total += 1;
            match record.status {
                RepairStatus::Started => stats.in_progress += 1,
                RepairStatus::Success => stats.success += 1,
                RepairStatus::Failed => stats.failed += 1,
            }
            match record.repair_type {
                RepairType::AutoFix => stats.auto_fix += 1,
                RepairType::Agent => stats.agent += 1,
            }
            stats.total_cost_usd += record.cost_usd;
            *stats
                .by_fingerprint
                .entry(record.fingerprint.clone())
                .or_default() += 1;
            stats.last_attempt = stats.last_attempt.max(Some(record.started_at));
        }
        stats
    }

    /// Newest records first.
    pub fn recent(&self, limit: usize) -> Vec<&RepairRecord> {
        self.records.iter().rev().take(limit).collect()
    }

    pub fn get(&self, id: &str) -> Option<&RepairRecord> {
        self.records.iter().rev().find(|r| r.id == id)
    }

    fn completion_target(&self, id: &str, status: RepairStatus) -> Result<usize, LedgerError> {
        if status == RepairStatus::Started {
            return Err(LedgerError::InvalidStatus);
        }
        let index = self
            .records
            .iter()
            .rposition(|r| r.id == id)
            .ok_or_else(|| LedgerError::NotFound { id: id.to_string() })?;
        if self.records[index].status != RepairStatus::Started {
            return Err(LedgerError::AlreadyCompleted { id: id.to_string() });
        }
        Ok(index)
    }

    fn apply(&mut self, event: LedgerEvent) -> Result<(), LedgerError> {
        match event {
            LedgerEvent::Start {
                id,
                started_at,
                fingerprint,
                diagnostic_exit,
                repair_type,
            } => {
                self.records.push(RepairRecord {
                    id,
                    started_at,
                    fingerprint,
                    diagnostic_exit,
                    repair_type,
                    status: RepairStatus::Started,
                    completed_at: None,
                    duration_secs: None,
                    cost_usd: 0.0,
                    turns: 0,
                    resolution: None,
                });
            }
            LedgerEvent::Complete {
                id,
                completed_at,
                status,
                cost_usd,
                turns,
                resolution,
            } => {
                let index = self.completion_target(&id, status)?;
                let record = &mut self.records[index];
                let elapsed = completed_at.signed_duration_since(record.started_at);
                record.status = status;
                record.completed_at = Some(completed_at);
                record.duration_secs = Some(elapsed.num_milliseconds().max(0) as f64 / 1000.0);
                record.cost_usd = cost_usd;
                record.turns = turns;
                record.resolution = resolution;
            }
        }
        Ok(())
    }
}
