//! Package upgrades of the monitored application, guarded by a backup.
//!
//! An upgrade runs under the `upgrade` lock:
//!
//! 1. full backup under the `backup` lock (abort on failure)
//! 2. install `<package>@<latest>`
//! 3. restart, wait `verify_delay_secs`, probe and re-read the version
//!
//! Any failure after step 1 restores the backup, reinstalls the previous
//! version and restarts. Every attempt ends as one line in
//! `upgrade-history.jsonl`.

pub mod history;
mod package;
mod version;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use warden_backup::{BackupError, BackupManager};
use warden_core::Settings;
use warden_core::lock::{LockError, LockGuard, LockManager, LockName};
use warden_core::notify::{Notify, NotifyEvent};
use warden_core::probe::{HealthProbe, ProbeOutcome};
use warden_core::service::ServiceManager;

pub use history::{HistoryError, UpgradeEntry, UpgradeHistory, UpgradeStatus};
pub use package::{CommandPackageManager, PackageError, PackageManager};
pub use version::{Version, is_newer};

/// Exit code for "update available"; advisory, not a failure.
pub const EXIT_UPDATE_AVAILABLE: i32 = 10;

#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Package(#[from] PackageError),

    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("`{0}` is not a version number")]
    BadVersion(String),

    #[error("no successful upgrade with a backup to roll back")]
    NothingToRollBack,

    #[error("pre-upgrade backup {} no longer exists", .0.display())]
    BackupMissing(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub package: String,
    pub installed: String,
    pub latest: String,
    pub update_available: bool,
}

impl CheckResult {
    pub fn exit_code(&self) -> i32 {
        if self.update_available {
            EXIT_UPDATE_AVAILABLE
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpgradeOutcome {
    /// `upgrade_enabled` is off.
    Disabled,
    /// Another upgrade holds the lock.
    LockBusy,
    UpToDate { version: String },
    /// Found by `auto` with auto-apply off; nothing was installed.
    UpdateAvailable(CheckResult),
    Upgraded(UpgradeEntry),
    ManualRollback(UpgradeEntry),
}

impl UpgradeOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            UpgradeOutcome::Disabled | UpgradeOutcome::LockBusy | UpgradeOutcome::UpToDate { .. } => 0,
            UpgradeOutcome::UpdateAvailable(_) => EXIT_UPDATE_AVAILABLE,
            UpgradeOutcome::Upgraded(entry) => i32::from(entry.status != UpgradeStatus::Success),
            UpgradeOutcome::ManualRollback(entry) => {
                i32::from(entry.status != UpgradeStatus::RolledBack)
            }
        }
    }
}

/// External collaborators of the upgrade manager.
pub struct UpgradeParts {
    pub packages: Arc<dyn PackageManager>,
    pub service: Arc<dyn ServiceManager>,
    pub probe: Arc<dyn HealthProbe>,
    pub notifier: Arc<dyn Notify>,
}

pub struct UpgradeManager {
    settings: Arc<Settings>,
    locks: LockManager,
    history: UpgradeHistory,
    packages: Arc<dyn PackageManager>,
    service: Arc<dyn ServiceManager>,
    probe: Arc<dyn HealthProbe>,
    notifier: Arc<dyn Notify>,
}

impl UpgradeManager {
    pub fn new(settings: Arc<Settings>, parts: UpgradeParts) -> Self {
        Self {
            locks: LockManager::new(settings.lock_dir(), settings.lock_staleness()),
            history: UpgradeHistory::new(settings.upgrade_history_path()),
            settings,
            packages: parts.packages,
            service: parts.service,
            probe: parts.probe,
            notifier: parts.notifier,
        }
    }

    pub fn history(&self) -> &UpgradeHistory {
        &self.history
    }

    pub async fn check(&self) -> Result<CheckResult, UpgradeError> {
        let package = self.settings.package_name.clone();
        let installed = self
            .packages
            .installed_version()
            .await?
            .ok_or_else(|| UpgradeError::NotInstalled(package.clone()))?;
        let latest = self.packages.latest_version().await?;

        let installed_v =
            Version::parse(&installed).ok_or_else(|| UpgradeError::BadVersion(installed.clone()))?;
        let latest_v =
            Version::parse(&latest).ok_or_else(|| UpgradeError::BadVersion(latest.clone()))?;
        let update_available = is_newer(&latest_v, &installed_v);
        tracing::info!(
            package = %package,
            installed = %installed,
            latest = %latest,
            update_available,
            "version check"
        );
        Ok(CheckResult {
            package,
            installed,
            latest,
            update_available,
        })
    }

    /// Upgrade to the latest version. `force` reinstalls even when current.
    pub async fn upgrade(&self, force: bool) -> Result<UpgradeOutcome, UpgradeError> {
        let Some(guard) = self.acquire_upgrade_lock()? else {
            return Ok(UpgradeOutcome::LockBusy);
        };
        let check = self.check().await?;
        if !check.update_available && !force {
            return Ok(UpgradeOutcome::UpToDate {
                version: check.installed,
            });
        }
        let entry = self.apply(&guard, &check.installed, &check.latest).await?;
        Ok(UpgradeOutcome::Upgraded(entry))
    }

    /// Scheduled entry point.
    pub async fn auto(&self) -> Result<UpgradeOutcome, UpgradeError> {
        if !self.settings.upgrade_enabled {
            tracing::info!("upgrades disabled; nothing to do");
            return Ok(UpgradeOutcome::Disabled);
        }
        let check = self.check().await?;
        if !check.update_available {
            return Ok(UpgradeOutcome::UpToDate {
                version: check.installed,
            });
        }
        if !self.settings.upgrade_auto_apply {
            self.notifier
                .notify(
                    NotifyEvent::Start,
                    &format!(
                        "{} {} is available (installed {}); auto-apply is off",
                        check.package, check.latest, check.installed
                    ),
                )
                .await;
            return Ok(UpgradeOutcome::UpdateAvailable(check));
        }
        self.upgrade(false).await
    }

    /// Put back the version and backup recorded by the last successful upgrade.
    pub async fn rollback(&self) -> Result<UpgradeOutcome, UpgradeError> {
        let Some(guard) = self.acquire_upgrade_lock()? else {
            return Ok(UpgradeOutcome::LockBusy);
        };
        let last = self
            .history
            .last_successful()?
            .ok_or(UpgradeError::NothingToRollBack)?;
        let backup = last
            .backup_file
            .clone()
            .ok_or(UpgradeError::NothingToRollBack)?;
        if !backup.is_file() {
            return Err(UpgradeError::BackupMissing(backup));
        }
        let current = self
            .packages
            .installed_version()
            .await?
            .unwrap_or_else(|| last.to_version.clone());

        let started = Instant::now();
        let package = &self.settings.package_name;
        self.notifier
            .notify(
                NotifyEvent::Start,
                &format!("rolling back {package} {current} -> {}", last.from_version),
            )
            .await;

        let (status, notes) = match self.roll_back_to(&last.from_version, &backup).await {
            Ok(()) => {
                self.notifier
                    .notify(
                        NotifyEvent::Success,
                        &format!("{package} rolled back to {}", last.from_version),
                    )
                    .await;
                (UpgradeStatus::RolledBack, "manual rollback".to_string())
            }
            Err(reason) => {
                tracing::error!(reason = %reason, "manual rollback failed");
                self.notifier
                    .notify(
                        NotifyEvent::Failure,
                        &format!("ROLLBACK FAILED for {package}: {reason}"),
                    )
                    .await;
                (UpgradeStatus::Failed, format!("manual rollback failed: {reason}"))
            }
        };
        let entry = self.entry(&current, &last.from_version, status, notes, Some(backup), started);
        self.history.append(&guard, &entry)?;
        Ok(UpgradeOutcome::ManualRollback(entry))
    }

    fn acquire_upgrade_lock(&self) -> Result<Option<LockGuard>, UpgradeError> {
        match self.locks.try_acquire(LockName::Upgrade) {
            Ok(guard) => Ok(Some(guard)),
            Err(LockError::Busy { holder, .. }) => {
                tracing::info!(holder = %holder, "another upgrade is running; skipping");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(
        &self,
        guard: &LockGuard,
        from: &str,
        to: &str,
    ) -> Result<UpgradeEntry, UpgradeError> {
        let started = Instant::now();
        let package = &self.settings.package_name;
        self.notifier
            .notify(NotifyEvent::Start, &format!("upgrading {package} {from} -> {to}"))
            .await;

        let backup = match self.guard_backup(from) {
            Ok(path) => path,
            Err(e) => {
                tracing::error!(error = %e, "pre-upgrade backup failed; upgrade aborted");
                self.notifier
                    .notify(
                        NotifyEvent::Failure,
                        &format!("upgrade of {package} aborted: pre-upgrade backup failed: {e}"),
                    )
                    .await;
                let entry = self.entry(
                    from,
                    to,
                    UpgradeStatus::Failed,
                    format!("pre-upgrade backup failed: {e}"),
                    None,
                    started,
                );
                self.history.append(guard, &entry)?;
                return Ok(entry);
            }
        };
        tracing::info!(backup = %backup.display(), "pre-upgrade backup taken");

        let (status, notes) = match self.install_and_verify(to).await {
            Ok(()) => {
                tracing::info!(from = %from, to = %to, "upgrade verified");
                self.notifier
                    .notify(NotifyEvent::Success, &format!("{package} upgraded {from} -> {to}"))
                    .await;
                (UpgradeStatus::Success, "upgrade verified".to_string())
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "upgrade failed; rolling back");
                match self.roll_back_to(from, &backup).await {
                    Ok(()) => {
                        self.notifier
                            .notify(
                                NotifyEvent::Failure,
                                &format!(
                                    "upgrade of {package} to {to} failed ({reason}); rolled back to {from}"
                                ),
                            )
                            .await;
                        (UpgradeStatus::RolledBack, format!("{reason}; rolled back to {from}"))
                    }
                    Err(rollback_reason) => {
                        tracing::error!(
                            reason = %reason,
                            rollback_error = %rollback_reason,
                            backup = %backup.display(),
                            "ROLLBACK FAILED; {package} may be broken"
                        );
                        self.notifier
                            .notify(
                                NotifyEvent::Failure,
                                &format!(
                                    "ROLLBACK FAILED for {package}: upgrade to {to} failed ({reason}), \
                                     rollback failed ({rollback_reason}); backup at {}",
                                    backup.display()
                                ),
                            )
                            .await;
                        (
                            UpgradeStatus::Failed,
                            format!("{reason}; rollback failed: {rollback_reason}"),
                        )
                    }
                }
            }
        };

        let entry = self.entry(from, to, status, notes, Some(backup), started);
        self.history.append(guard, &entry)?;
        Ok(entry)
    }

    fn backups(&self, app_version: Option<&str>) -> BackupManager {
        BackupManager::new(self.settings.clone(), self.service.clone())
            .with_app_version(app_version.map(ToString::to_string))
    }

    /// Always full, independent of `backup_enabled`, and exempt from pruning.
    fn guard_backup(&self, from: &str) -> Result<PathBuf, BackupError> {
        let guard = self.locks.try_acquire(LockName::Backup)?;
        let created = self.backups(Some(from)).create_pre_upgrade(&guard)?;
        Ok(created.path)
    }

    async fn install_and_verify(&self, to: &str) -> Result<(), String> {
        self.packages
            .install(to)
            .await
            .map_err(|e| format!("install of {to} failed: {e}"))?;
        self.restart_and_probe().await?;

        let installed = self
            .packages
            .installed_version()
            .await
            .map_err(|e| format!("could not read installed version: {e}"))?;
        match installed {
            Some(version) if same_version(&version, to) => Ok(()),
            Some(version) => Err(format!("installed version is {version}, expected {to}")),
            None => Err("package missing after install".to_string()),
        }
    }

    async fn roll_back_to(&self, version: &str, backup: &Path) -> Result<(), String> {
        let guard = self
            .locks
            .try_acquire(LockName::Backup)
            .map_err(|e| format!("could not take backup lock: {e}"))?;
        let restored = self
            .backups(None)
            .restore_files(&guard, backup)
            .map_err(|e| format!("restore of {} failed: {e}", backup.display()))?;
        tracing::info!(items = restored.len(), "application state restored");
        drop(guard);

        self.packages
            .install(version)
            .await
            .map_err(|e| format!("reinstall of {version} failed: {e}"))?;
        self.restart_and_probe().await
    }

    async fn restart_and_probe(&self) -> Result<(), String> {
        self.service
            .restart()
            .await
            .map_err(|e| format!("restart failed: {e}"))?;
        tokio::time::sleep(self.settings.verify_delay()).await;
        match self.probe.probe().await {
            ProbeOutcome::Healthy => Ok(()),
            ProbeOutcome::Unhealthy(reason) => Err(format!("gateway unhealthy: {reason}")),
        }
    }

    fn entry(
        &self,
        from: &str,
        to: &str,
        status: UpgradeStatus,
        notes: String,
        backup_file: Option<PathBuf>,
        started: Instant,
    ) -> UpgradeEntry {
        UpgradeEntry {
            timestamp: Utc::now(),
            from_version: from.to_string(),
            to_version: to.to_string(),
            package_manager: self.packages.name().to_string(),
            status,
            notes,
            backup_file,
            duration_secs: started.elapsed().as_secs_f64(),
        }
    }
}

fn same_version(a: &str, b: &str) -> bool {
    match (Version::parse(a), Version::parse(b)) {
        (Some(a), Some(b)) => a.same_release(&b),
        _ => a.trim() == b.trim(),
    }
}
