//! Tiered backups of the monitored application's home directory.
//!
//! ```text
//! <backup_dir>/
//!   openclaw-backup-20250309-030000.tar.gz       regular, pruned to max_backups
//!   openclaw-pre-restore-20250310-120501.tar.gz  taken before a restore, kept
//! ```
//!
//! Every archive carries `manifest.json` as its first entry. Mutating
//! operations take the `backup` lock guard.

mod archive;
mod manifest;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use warden_core::Settings;
use warden_core::lock::{LockError, LockGuard, LockName};
use warden_core::service::{ServiceError, ServiceManager};

pub use archive::{ArchiveStamp, is_excluded, parse_archive_name};
pub use manifest::{BackupKind, BackupManifest, TierFlags, sha256_file};

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("backup I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backup archive not found: {0}")]
    NotFound(PathBuf),

    #[error("no backups found in {0}")]
    NoBackups(PathBuf),

    #[error("{0} has no manifest.json; refusing to restore from it")]
    MissingManifest(PathBuf),

    #[error("manifest lists an unsafe path: {0}")]
    UnsafePath(String),

    #[error("restore not confirmed")]
    NotConfirmed,

    #[error("service restart after restore failed: {0}")]
    Restart(#[from] ServiceError),
}

/// A named group of application state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Core,
    Workspace,
    Extended,
}

impl Tier {
    /// Items of this tier relative to the application home. Core also
    /// includes the primary config file, see [`BackupManager::tier_items`].
    pub fn items(self) -> &'static [&'static str] {
        match self {
            Tier::Core => &[".env", "credentials", "identity", "agents"],
            Tier::Workspace => &["workspace"],
            Tier::Extended => &["memory", "sessions", "extensions", "skills", "cron", "devices"],
        }
    }
}

/// One archive in the backup directory.
#[derive(Debug, Clone, Serialize)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub file_name: String,
    pub kind: BackupKind,
    pub timestamp: NaiveDateTime,
    #[serde(skip)]
    pub stamp: ArchiveStamp,
    pub size_bytes: u64,
    /// `None` when the manifest could not be read.
    pub manifest: Option<BackupManifest>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatedBackup {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub manifest: BackupManifest,
    pub pruned: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreTarget {
    File(PathBuf),
    Latest,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive: PathBuf,
    pub snapshot: PathBuf,
    pub restored: Vec<String>,
}

pub struct BackupManager {
    settings: Arc<Settings>,
    service: Arc<dyn ServiceManager>,
    app_version: Option<String>,
}

impl BackupManager {
    pub fn new(settings: Arc<Settings>, service: Arc<dyn ServiceManager>) -> Self {
        Self {
            settings,
            service,
            app_version: None,
        }
    }

    /// Version recorded in manifests of archives created from now on.
    pub fn with_app_version(mut self, version: Option<String>) -> Self {
        self.app_version = version;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.settings.backup_dir
    }

    /// Tier flags for a regular backup. `full` forces every tier on.
    pub fn tiers(&self, full: bool) -> TierFlags {
        TierFlags {
            core: true,
            workspace: full || self.settings.backup_include_workspace,
            extended: full || self.settings.backup_include_extended,
        }
    }

    /// All candidate items for `tiers`, present on disk or not.
    pub fn tier_items(&self, tiers: TierFlags) -> Vec<String> {
        let mut items = Vec::new();
        if tiers.core {
            if let Some(config) = self.config_item() {
                items.push(config);
            }
            items.extend(Tier::Core.items().iter().map(ToString::to_string));
        }
        if tiers.workspace {
            items.extend(Tier::Workspace.items().iter().map(ToString::to_string));
        }
        if tiers.extended {
            items.extend(Tier::Extended.items().iter().map(ToString::to_string));
        }
        items
    }

    /// Create a regular backup, then prune.
    pub fn create(&self, guard: &LockGuard, full: bool) -> Result<CreatedBackup, BackupError> {
        guard.ensure(LockName::Backup)?;
        let (path, manifest) = self.write_backup(BackupKind::Regular, self.tiers(full))?;
        let size_bytes = std::fs::metadata(&path)?.len();
        tracing::info!(
            archive = %path.display(),
            size_bytes,
            items = manifest.files.len(),
            "backup created"
        );
        let pruned = self.prune(guard)?;
        Ok(CreatedBackup {
            path,
            size_bytes,
            manifest,
            pruned,
        })
    }

    /// Full snapshot taken before a package upgrade. Kept out of pruning so
    /// a later manual rollback can still find it.
    pub fn create_pre_upgrade(&self, guard: &LockGuard) -> Result<CreatedBackup, BackupError> {
        guard.ensure(LockName::Backup)?;
        let (path, manifest) = self.write_backup(BackupKind::PreUpgrade, self.tiers(true))?;
        let size_bytes = std::fs::metadata(&path)?.len();
        tracing::info!(archive = %path.display(), size_bytes, "pre-upgrade snapshot created");
        Ok(CreatedBackup {
            path,
            size_bytes,
            manifest,
            pruned: Vec::new(),
        })
    }

    /// Archives in the backup directory, newest first.
    pub fn list(&self) -> Result<Vec<BackupEntry>, BackupError> {
        let dir = self.backup_dir();
        let read = match std::fs::read_dir(dir) {
            Ok(read) => read,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for dirent in read.filter_map(Result::ok) {
            let file_name = dirent.file_name().to_string_lossy().to_string();
            let Some((kind, stamp)) = parse_archive_name(&self.settings.app_name, &file_name)
            else {
                continue;
            };
            let path = dirent.path();
            let size_bytes = dirent.metadata().map(|m| m.len()).unwrap_or(0);
            let manifest = match archive::read_manifest(&path) {
                Ok(manifest) => manifest,
                Err(e) => {
                    tracing::debug!(archive = %path.display(), error = %e, "manifest unreadable");
                    None
                }
            };
            entries.push(BackupEntry {
                path,
                file_name,
                kind,
                timestamp: stamp.timestamp,
                stamp,
                size_bytes,
                manifest,
            });
        }
        entries.sort_by(|a, b| b.stamp.cmp(&a.stamp));
        Ok(entries)
    }

    /// Newest regular backup.
    pub fn latest(&self) -> Result<Option<BackupEntry>, BackupError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|entry| entry.kind == BackupKind::Regular))
    }

    /// Delete regular backups beyond the newest `max_backups`. Zero keeps all.
    /// Pre-restore and pre-upgrade snapshots are never touched.
    pub fn prune(&self, guard: &LockGuard) -> Result<Vec<PathBuf>, BackupError> {
        guard.ensure(LockName::Backup)?;
        let keep = self.settings.max_backups;
        if keep == 0 {
            return Ok(Vec::new());
        }
        let mut removed = Vec::new();
        for entry in self
            .list()?
            .into_iter()
            .filter(|entry| entry.kind == BackupKind::Regular)
            .skip(keep)
        {
            std::fs::remove_file(&entry.path)?;
            tracing::info!(archive = %entry.file_name, "pruned old backup");
            removed.push(entry.path);
        }
        Ok(removed)
    }

    /// Restore the application home from an archive and restart the service.
    ///
    /// A full pre-restore snapshot is taken first so the restore itself can
    /// be undone.
    pub async fn restore(
        &self,
        guard: &LockGuard,
        target: RestoreTarget,
        confirmed: bool,
    ) -> Result<RestoreReport, BackupError> {
        guard.ensure(LockName::Backup)?;
        let archive = self.resolve(target)?;
        if !confirmed {
            return Err(BackupError::NotConfirmed);
        }
        if archive::read_manifest(&archive)?.is_none() {
            return Err(BackupError::MissingManifest(archive));
        }

        let (snapshot, _) = self.write_backup(BackupKind::PreRestore, self.tiers(true))?;
        tracing::info!(snapshot = %snapshot.display(), "pre-restore snapshot taken");

        let restored = self.restore_files(guard, &archive)?;
        self.service.restart().await?;
        tracing::info!(archive = %archive.display(), items = restored.len(), "restore complete");
        Ok(RestoreReport {
            archive,
            snapshot,
            restored,
        })
    }

    /// Replace each manifest item in the application home with the archived
    /// copy. No snapshot, no restart.
    pub fn restore_files(&self, guard: &LockGuard, archive: &Path) -> Result<Vec<String>, BackupError> {
        guard.ensure(LockName::Backup)?;
        let manifest = archive::read_manifest(archive)?
            .ok_or_else(|| BackupError::MissingManifest(archive.to_path_buf()))?;
        for item in &manifest.files {
            if !is_safe_item(item) {
                return Err(BackupError::UnsafePath(item.clone()));
            }
        }

        let app_home = &self.settings.app_home;
        std::fs::create_dir_all(app_home)?;
        // Staging beside the home keeps the final renames on one filesystem.
        let staging_parent = app_home.parent().unwrap_or(app_home);
        let staging = tempfile::Builder::new()
            .prefix(".warden-restore-")
            .tempdir_in(staging_parent)?;
        archive::unpack(archive, staging.path())?;

        let mut restored = Vec::new();
        for item in &manifest.files {
            let source = staging.path().join(item);
            if std::fs::symlink_metadata(&source).is_err() {
                tracing::warn!(item = %item, "manifest item missing from archive");
                continue;
            }
            let target = app_home.join(item);
            remove_existing(&target)?;
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::rename(&source, &target)?;
            restored.push(item.clone());
        }
        Ok(restored)
    }

    pub fn resolve(&self, target: RestoreTarget) -> Result<PathBuf, BackupError> {
        match target {
            RestoreTarget::File(path) => {
                let path = if path.is_relative() && !path.exists() {
                    self.backup_dir().join(path)
                } else {
                    path
                };
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(BackupError::NotFound(path))
                }
            }
            RestoreTarget::Latest => self
                .latest()?
                .map(|entry| entry.path)
                .ok_or_else(|| BackupError::NoBackups(self.backup_dir().to_path_buf())),
        }
    }

    fn config_item(&self) -> Option<String> {
        let config = &self.settings.app_config_file;
        match config.strip_prefix(&self.settings.app_home) {
            Ok(relative) => Some(relative.to_string_lossy().to_string()),
            Err(_) => {
                tracing::debug!(
                    config = %config.display(),
                    "config file lives outside the application home; not archived"
                );
                None
            }
        }
    }

    fn write_backup(
        &self,
        kind: BackupKind,
        tiers: TierFlags,
    ) -> Result<(PathBuf, BackupManifest), BackupError> {
        let app_home = &self.settings.app_home;
        let mut manifest = BackupManifest::new(kind, &self.settings.app_name, tiers);
        manifest.app_version = self.app_version.clone();
        manifest.files = self
            .tier_items(tiers)
            .into_iter()
            .filter(|item| std::fs::symlink_metadata(app_home.join(item)).is_ok())
            .collect();
        manifest.config_sha256 = sha256_file(&self.settings.app_config_file).ok();

        let dir = self.backup_dir();
        std::fs::create_dir_all(dir)?;
        let final_path = self.unused_name(kind)?;

        let tmp = tempfile::Builder::new()
            .prefix(".partial-")
            .suffix(".tar.gz")
            .tempfile_in(dir)?;
        let file = archive::write_archive(tmp.reopen()?, app_home, &manifest)?;
        file.sync_all()?;
        set_private(tmp.path())?;
        tmp.persist(&final_path).map_err(|e| BackupError::Io(e.error))?;
        Ok((final_path, manifest))
    }

    fn unused_name(&self, kind: BackupKind) -> Result<PathBuf, BackupError> {
        let now = Local::now().naive_local();
        for seq in 0..1000 {
            let name = archive::archive_name(&self.settings.app_name, kind, now, seq);
            let path = self.backup_dir().join(name);
            if !path.exists() {
                return Ok(path);
            }
        }
        Err(BackupError::Io(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "too many backups within one second",
        )))
    }
}

fn is_safe_item(item: &str) -> bool {
    let path = Path::new(item);
    !item.is_empty()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

fn remove_existing(path: &Path) -> std::io::Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn set_private(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_private(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use warden_core::LockManager;

    #[derive(Default)]
    struct CountingService {
        restarts: AtomicUsize,
    }

    #[async_trait]
    impl ServiceManager for CountingService {
        async fn restart(&self) -> Result<(), ServiceError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        settings: Arc<Settings>,
        service: Arc<CountingService>,
        locks: LockManager,
    }

    impl Fixture {
        fn new(include_workspace: bool, include_extended: bool) -> Self {
            let dir = TempDir::new().unwrap();
            let app_home = dir.path().join("app");
            std::fs::create_dir_all(&app_home).unwrap();
            let settings = Settings {
                app_config_file: app_home.join("openclaw.json"),
                app_home,
                backup_dir: dir.path().join("backups"),
                backup_include_workspace: include_workspace,
                backup_include_extended: include_extended,
                state_dir: dir.path().to_path_buf(),
                ..Settings::default()
            };
            let locks = LockManager::new(settings.lock_dir(), Duration::from_secs(3600));
            Self {
                _dir: dir,
                settings: Arc::new(settings),
                service: Arc::default(),
                locks,
            }
        }

        fn manager(&self) -> BackupManager {
            BackupManager::new(self.settings.clone(), self.service.clone())
                .with_app_version(Some("2.3.1".to_string()))
        }

        fn home(&self) -> &Path {
            &self.settings.app_home
        }

        fn write(&self, relative: &str, contents: &str) {
            let path = self.home().join(relative);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
    }

    #[test]
    fn full_backup_includes_every_present_tier_item() {
        let fx = Fixture::new(false, false);
        fx.write("openclaw.json", "{\"gateway\":{}}");
        fx.write(".env", "TOKEN=1");
        fx.write("credentials/discord.json", "{}");
        fx.write("workspace/AGENTS.md", "# agents");
        fx.write("memory/2025-03-09.md", "notes");
        fx.write("sessions/main.jsonl", "{}");
        fx.write("sessions/debug.log", "noise");

        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let created = fx.manager().create(&guard, true).unwrap();

        let mut files = created.manifest.files.clone();
        files.sort();
        assert_eq!(
            files,
            vec![".env", "credentials", "memory", "openclaw.json", "sessions", "workspace"]
        );
        assert_eq!(
            created.manifest.tiers,
            TierFlags {
                core: true,
                workspace: true,
                extended: true
            }
        );
        assert_eq!(created.manifest.app_version.as_deref(), Some("2.3.1"));
        assert!(created.manifest.config_sha256.is_some());
        assert!(created.path.file_name().unwrap().to_string_lossy().starts_with("openclaw-backup-"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&created.path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn regular_backup_follows_tier_flags() {
        let fx = Fixture::new(false, false);
        fx.write("openclaw.json", "{}");
        fx.write("workspace/AGENTS.md", "# agents");
        fx.write("memory/today.md", "notes");

        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let created = fx.manager().create(&guard, false).unwrap();
        assert_eq!(created.manifest.files, vec!["openclaw.json"]);
    }

    #[test]
    fn create_requires_the_backup_lock() {
        let fx = Fixture::new(true, false);
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();
        assert!(matches!(
            fx.manager().create(&guard, false),
            Err(BackupError::Lock(LockError::WrongLock { .. }))
        ));
    }

    #[test]
    fn prune_keeps_newest_regular_backups() {
        let fx = Fixture::new(true, false);
        let dir = fx.settings.backup_dir.clone();
        std::fs::create_dir_all(&dir).unwrap();
        for day in 1..=20 {
            let name = format!("openclaw-backup-202501{day:02}-030000.tar.gz");
            std::fs::write(dir.join(name), "x").unwrap();
        }
        std::fs::write(dir.join("openclaw-pre-restore-20241201-120000.tar.gz"), "x").unwrap();
        std::fs::write(dir.join("unrelated.txt"), "x").unwrap();

        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let mut removed: Vec<String> = fx
            .manager()
            .prune(&guard)
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        removed.sort();

        let expected: Vec<String> = (1..=6)
            .map(|day| format!("openclaw-backup-202501{day:02}-030000.tar.gz"))
            .collect();
        assert_eq!(removed, expected);
        assert!(dir.join("openclaw-pre-restore-20241201-120000.tar.gz").exists());
        assert!(dir.join("unrelated.txt").exists());
        assert_eq!(fx.manager().list().unwrap().len(), 15);
    }

    #[test]
    fn pre_upgrade_snapshot_outlives_pruning() {
        let fx = Fixture::new(true, false);
        fx.write("openclaw.json", "{}");
        let settings = Arc::new(Settings {
            max_backups: 2,
            ..(*fx.settings).clone()
        });
        let manager = BackupManager::new(settings, fx.service.clone());
        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();

        let snapshot = manager.create_pre_upgrade(&guard).unwrap();
        assert!(snapshot.path.file_name().unwrap().to_string_lossy().starts_with("openclaw-pre-upgrade-"));
        assert_eq!(snapshot.manifest.kind, BackupKind::PreUpgrade);

        for _ in 0..4 {
            manager.create(&guard, false).unwrap();
        }

        assert!(snapshot.path.exists());
        let kinds: Vec<BackupKind> = manager.list().unwrap().iter().map(|e| e.kind).collect();
        assert_eq!(kinds.iter().filter(|k| **k == BackupKind::Regular).count(), 2);
        assert!(kinds.contains(&BackupKind::PreUpgrade));
        // The snapshot is not a candidate for `restore --latest`.
        assert_eq!(manager.latest().unwrap().unwrap().kind, BackupKind::Regular);
    }

    #[test]
    fn list_is_newest_first_with_manifests() {
        let fx = Fixture::new(true, false);
        fx.write("openclaw.json", "{}");
        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let manager = fx.manager();
        let first = manager.create(&guard, false).unwrap();
        let second = manager.create(&guard, false).unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, second.path);
        assert_eq!(listed[1].path, first.path);
        assert!(listed.iter().all(|e| e.manifest.is_some()));
        assert_eq!(manager.latest().unwrap().map(|e| e.path), Some(second.path));
    }

    #[tokio::test]
    async fn restore_replaces_items_and_restarts() {
        let fx = Fixture::new(true, false);
        fx.write("openclaw.json", "{\"version\":1}");
        fx.write("workspace/AGENTS.md", "original");
        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let manager = fx.manager();
        manager.create(&guard, false).unwrap();

        fx.write("openclaw.json", "{\"version\":2}");
        fx.write("workspace/AGENTS.md", "edited");
        fx.write("workspace/new-file.md", "added later");

        let report = manager
            .restore(&guard, RestoreTarget::Latest, true)
            .await
            .unwrap();

        let home = fx.home();
        assert_eq!(
            std::fs::read_to_string(home.join("openclaw.json")).unwrap(),
            "{\"version\":1}"
        );
        assert_eq!(
            std::fs::read_to_string(home.join("workspace/AGENTS.md")).unwrap(),
            "original"
        );
        assert!(!home.join("workspace/new-file.md").exists());
        assert_eq!(fx.service.restarts.load(Ordering::SeqCst), 1);
        assert!(report.snapshot.exists());
        assert!(
            report
                .snapshot
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("openclaw-pre-restore-")
        );

        // The snapshot captured the edited state and is not pruned.
        let snapshot_manifest = archive::read_manifest(&report.snapshot).unwrap().unwrap();
        assert_eq!(snapshot_manifest.kind, BackupKind::PreRestore);
    }

    #[tokio::test]
    async fn restore_requires_confirmation() {
        let fx = Fixture::new(true, false);
        fx.write("openclaw.json", "{}");
        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let manager = fx.manager();
        manager.create(&guard, false).unwrap();

        let err = manager
            .restore(&guard, RestoreTarget::Latest, false)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::NotConfirmed));
        assert_eq!(fx.service.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn archive_without_manifest_is_rejected() {
        let fx = Fixture::new(true, false);
        let dir = fx.settings.backup_dir.clone();
        std::fs::create_dir_all(&dir).unwrap();
        let bogus = dir.join("openclaw-backup-20250101-000000.tar.gz");
        {
            let file = std::fs::File::create(&bogus).unwrap();
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let builder = tar::Builder::new(encoder);
            builder.into_inner().unwrap().finish().unwrap();
        }

        let guard = fx.locks.try_acquire(LockName::Backup).unwrap();
        let err = fx
            .manager()
            .restore(&guard, RestoreTarget::File(bogus), true)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::MissingManifest(_)));
    }

    #[test]
    fn unsafe_items_are_detected() {
        assert!(is_safe_item("workspace"));
        assert!(is_safe_item("credentials/discord.json"));
        assert!(!is_safe_item("../etc"));
        assert!(!is_safe_item("/etc/passwd"));
        assert!(!is_safe_item(""));
    }
}
