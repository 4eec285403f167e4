//! `manifest.json`, embedded at the root of every backup archive.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const MANIFEST_NAME: &str = "manifest.json";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Regular,
    /// Snapshot taken right before a restore. Never pruned.
    PreRestore,
    /// Guard snapshot taken before a package upgrade. Never pruned.
    PreUpgrade,
}

impl BackupKind {
    pub fn label(self) -> &'static str {
        match self {
            BackupKind::Regular => "backup",
            BackupKind::PreRestore => "pre-restore",
            BackupKind::PreUpgrade => "pre-upgrade",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFlags {
    pub core: bool,
    pub workspace: bool,
    pub extended: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: u32,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub created_at_local: String,
    pub app_name: String,
    pub app_version: Option<String>,
    pub tiers: TierFlags,
    /// SHA-256 of the primary config file, when it exists.
    pub config_sha256: Option<String>,
    /// Tier items present in the archive, relative to the application home.
    pub files: Vec<String>,
    pub hostname: String,
    pub created_by: String,
}

impl BackupManifest {
    pub fn new(kind: BackupKind, app_name: &str, tiers: TierFlags) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            kind,
            created_at: now,
            created_at_local: now.with_timezone(&Local).to_rfc3339(),
            app_name: app_name.to_string(),
            app_version: None,
            tiers,
            config_sha256: None,
            files: Vec::new(),
            hostname: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            created_by: format!("warden {}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
