//! `upgrade-history.jsonl`: one line per upgrade or rollback.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use warden_core::jsonl::{self, JsonlError};
use warden_core::lock::{LockError, LockGuard, LockName};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    Success,
    /// The upgrade failed and the previous version was put back.
    RolledBack,
    /// Nothing could be put back; the application may be broken.
    Failed,
}

impl UpgradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeStatus::Success => "success",
            UpgradeStatus::RolledBack => "rolled_back",
            UpgradeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeEntry {
    pub timestamp: DateTime<Utc>,
    pub from_version: String,
    pub to_version: String,
    pub package_manager: String,
    pub status: UpgradeStatus,
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_file: Option<PathBuf>,
    #[serde(default)]
    pub duration_secs: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error(transparent)]
    Storage(#[from] JsonlError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

#[derive(Debug, Clone)]
pub struct UpgradeHistory {
    path: PathBuf,
}

impl UpgradeHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Only the holder of the upgrade lock may write.
    pub fn append(&self, guard: &LockGuard, entry: &UpgradeEntry) -> Result<(), HistoryError> {
        guard.ensure(LockName::Upgrade)?;
        jsonl::append(&self.path, entry)?;
        Ok(())
    }

    /// Oldest first.
    pub fn entries(&self) -> Result<Vec<UpgradeEntry>, HistoryError> {
        Ok(jsonl::read_all(&self.path)?)
    }

    pub fn last_successful(&self) -> Result<Option<UpgradeEntry>, HistoryError> {
        Ok(self
            .entries()?
            .into_iter()
            .rev()
            .find(|entry| entry.status == UpgradeStatus::Success))
    }
}
