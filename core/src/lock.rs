//! Named lock markers that serialize the scheduled workflows.
//!
//! Each workflow (`health`, `backup`, `upgrade`) owns one marker file under
//! `<state_dir>/locks/`. A marker is created with `create_new`, so exactly one
//! process wins. A marker whose age exceeds the staleness threshold is taken
//! to belong to a crashed holder and is removed. A marker written by a
//! process on this host that no longer exists is reclaimed right away.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock names. Different names never contend with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockName {
    Health,
    Backup,
    Upgrade,
}

impl LockName {
    pub const ALL: [LockName; 3] = [LockName::Health, LockName::Backup, LockName::Upgrade];

    pub fn as_str(self) -> &'static str {
        match self {
            LockName::Health => "health",
            LockName::Backup => "backup",
            LockName::Upgrade => "upgrade",
        }
    }
}

impl std::fmt::Display for LockName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("{name} lock is held ({holder})")]
    Busy { name: LockName, holder: String },

    #[error("operation requires the {expected} lock, but the {actual} lock was supplied")]
    WrongLock {
        expected: LockName,
        actual: LockName,
    },

    #[error("lock I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Contents of a marker file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockOwner {
    pub pid: u32,
    pub host: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockOwner {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            host: current_host(),
            acquired_at: Utc::now(),
        }
    }

    /// True when the owner is known to be gone. Only answerable on this host.
    fn is_dead(&self) -> bool {
        self.host == current_host() && !is_process_running(self.pid)
    }
}

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pid {} on {} since {}",
            self.pid,
            self.host,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Observed state of one lock, for `warden status`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LockStatus {
    pub name: LockName,
    pub held: bool,
    pub owner: Option<LockOwner>,
    pub age_secs: Option<u64>,
    pub stale: bool,
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    pub fn marker_path(&self, name: LockName) -> PathBuf {
        self.dir.join(format!("{}.lock", name.as_str()))
    }

    /// Acquire `name`, recovering an abandoned marker if necessary.
    pub fn try_acquire(&self, name: LockName) -> Result<LockGuard, LockError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.marker_path(name);

        match self.create_marker(&path) {
            Ok(guard_owner) => return Ok(LockGuard::new(name, path, guard_owner)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }

        let owner = read_owner(&path);
        let age = marker_age(&path)?;
        let Some(reason) = self.reclaim_reason(owner.as_ref(), age) else {
            return Err(LockError::Busy {
                name,
                holder: describe_holder(owner.as_ref(), age),
            });
        };

        if reason != "vanished" {
            tracing::warn!(
                lock = %name,
                reason,
                age_secs = age.map(|a| a.as_secs()),
                holder = ?owner,
                "forcibly recovering lock"
            );
            if let Some(current) = self.set_aside(&path, owner.as_ref())? {
                return Err(LockError::Busy {
                    name,
                    holder: describe_holder(current.as_ref(), None),
                });
            }
        }

        // One retry: a racing process that recovers the same marker first wins.
        match self.create_marker(&path) {
            Ok(guard_owner) => Ok(LockGuard::new(name, path, guard_owner)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(LockError::Busy {
                name,
                holder: describe_holder(read_owner(&path).as_ref(), None),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn reclaim_reason(&self, owner: Option<&LockOwner>, age: Option<Duration>) -> Option<&'static str> {
        match (owner, age) {
            (_, Some(age)) if age > self.stale_after => Some("stale"),
            (Some(owner), _) if owner.is_dead() => Some("owner exited"),
            // Marker vanished between create and stat.
            (_, None) => Some("vanished"),
            _ => None,
        }
    }

    /// Move an abandoned marker out of the way under a name only this call
    /// knows, then confirm it is still the marker judged abandoned. A marker
    /// re-created by another process in the meantime is put back and its
    /// owner returned as `Some`.
    fn set_aside(
        &self,
        path: &Path,
        expected: Option<&LockOwner>,
    ) -> Result<Option<Option<LockOwner>>, LockError> {
        let aside = path.with_extension(format!(
            "lock.reclaim-{}-{}",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        match std::fs::rename(path, &aside) {
            Ok(()) => {}
            // Another process reclaimed it first; the create below decides.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let owner = read_owner(&aside);
        let age = marker_age(&aside)?;
        let abandoned = owner.as_ref() == expected
            && matches!(self.reclaim_reason(owner.as_ref(), age), Some(r) if r != "vanished");
        if !abandoned {
            tracing::debug!(holder = ?owner, "marker was re-created during recovery; restoring it");
            // `hard_link` never replaces an existing marker.
            if let Err(e) = std::fs::hard_link(&aside, path) {
                tracing::warn!(error = %e, "could not restore live lock marker");
            }
        }
        remove_marker(&aside)?;
        Ok(if abandoned { None } else { Some(owner) })
    }

    /// Remove the marker for `name`. Removing an absent marker is not an error.
    pub fn release(&self, name: LockName) -> Result<(), LockError> {
        remove_marker(&self.marker_path(name))
    }

    pub fn status(&self, name: LockName) -> Result<LockStatus, LockError> {
        let path = self.marker_path(name);
        let Some(age) = marker_age(&path)? else {
            return Ok(LockStatus {
                name,
                held: false,
                owner: None,
                age_secs: None,
                stale: false,
            });
        };
        let owner = read_owner(&path);
        let stale = age > self.stale_after || owner.as_ref().is_some_and(LockOwner::is_dead);
        Ok(LockStatus {
            name,
            held: true,
            owner,
            age_secs: Some(age.as_secs()),
            stale,
        })
    }

    fn create_marker(&self, path: &Path) -> std::io::Result<LockOwner> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let owner = LockOwner::current();
        let json = serde_json::to_string(&owner).map_err(std::io::Error::other)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(owner)
    }
}

/// Proof that a named lock is held. The marker is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    name: LockName,
    path: PathBuf,
    owner: LockOwner,
    released: bool,
}

impl LockGuard {
    fn new(name: LockName, path: PathBuf, owner: LockOwner) -> Self {
        tracing::debug!(lock = %name, pid = owner.pid, "lock acquired");
        Self {
            name,
            path,
            owner,
            released: false,
        }
    }

    pub fn name(&self) -> LockName {
        self.name
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Fail unless this guard holds `expected`.
    pub fn ensure(&self, expected: LockName) -> Result<(), LockError> {
        if self.name == expected {
            Ok(())
        } else {
            Err(LockError::WrongLock {
                expected,
                actual: self.name,
            })
        }
    }

    /// Release now and surface any error, instead of waiting for drop.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        remove_marker(&self.path)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_marker(&self.path) {
            tracing::warn!(lock = %self.name, error = %e, "failed to release lock");
        } else {
            tracing::debug!(lock = %self.name, "lock released");
        }
    }
}

fn remove_marker(path: &Path) -> Result<(), LockError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn read_owner(path: &Path) -> Option<LockOwner> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Age by file mtime, or `None` when the marker does not exist.
fn marker_age(path: &Path) -> Result<Option<Duration>, LockError> {
    let modified = match std::fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    // A clock that moved backwards yields zero age rather than an error.
    Ok(Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default(),
    ))
}

fn describe_holder(owner: Option<&LockOwner>, age: Option<Duration>) -> String {
    match (owner, age) {
        (Some(owner), Some(age)) => format!("{owner}, age {}s", age.as_secs()),
        (Some(owner), None) => owner.to_string(),
        (None, Some(age)) => format!("unknown holder, age {}s", age.as_secs()),
        (None, None) => "unknown holder".to_string(),
    }
}

fn current_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 probes for existence. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const HOUR: Duration = Duration::from_secs(3600);

    fn age_marker(path: &Path, by: Duration) {
        let file = OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - by).unwrap();
    }

    #[test]
    fn acquire_then_release_round_trip() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);

        let guard = locks.try_acquire(LockName::Health).unwrap();
        assert!(locks.marker_path(LockName::Health).exists());
        assert_eq!(guard.owner().pid, std::process::id());

        guard.release().unwrap();
        assert!(!locks.marker_path(LockName::Health).exists());
        locks.try_acquire(LockName::Health).unwrap();
    }

    #[test]
    fn second_acquire_is_busy_while_fresh() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);

        let _held = locks.try_acquire(LockName::Backup).unwrap();
        let err = locks.try_acquire(LockName::Backup).unwrap_err();
        assert!(
            matches!(err, LockError::Busy { name: LockName::Backup, .. }),
            "{err}"
        );
    }

    #[test]
    fn names_are_independent() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);

        let _health = locks.try_acquire(LockName::Health).unwrap();
        let _backup = locks.try_acquire(LockName::Backup).unwrap();
        let _upgrade = locks.try_acquire(LockName::Upgrade).unwrap();
    }

    #[test]
    fn stale_marker_is_recovered() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);

        let held = locks.try_acquire(LockName::Health).unwrap();
        // Simulate a crashed holder: the marker stays behind.
        std::mem::forget(held);
        age_marker(&locks.marker_path(LockName::Health), Duration::from_secs(2 * 3600));

        let guard = locks.try_acquire(LockName::Health).unwrap();
        assert_eq!(guard.name(), LockName::Health);
    }

    #[test]
    fn recovery_does_not_remove_a_recreated_marker() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);
        let path = locks.marker_path(LockName::Health);

        // The abandoned marker another process judged stale...
        let abandoned = LockOwner {
            pid: 4_194_305,
            host: current_host(),
            acquired_at: Utc::now() - chrono::Duration::hours(2),
        };
        // ...was already replaced by a live holder before the removal.
        let live = locks.try_acquire(LockName::Health).unwrap();
        let live_owner = live.owner().clone();

        let kept = locks.set_aside(&path, Some(&abandoned)).unwrap();
        assert_eq!(kept, Some(Some(live_owner.clone())));
        assert_eq!(read_owner(&path), Some(live_owner));
        assert!(matches!(
            locks.try_acquire(LockName::Health),
            Err(LockError::Busy { .. })
        ));

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(leftovers, vec!["health.lock".to_string()]);
        drop(live);
    }

    #[test]
    fn stale_recovery_cleans_up_after_itself() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);
        std::mem::forget(locks.try_acquire(LockName::Backup).unwrap());
        age_marker(&locks.marker_path(LockName::Backup), Duration::from_secs(2 * 3600));

        let guard = locks.try_acquire(LockName::Backup).unwrap();
        assert_eq!(guard.owner().pid, std::process::id());
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["backup.lock".to_string()]);
    }

    #[test]
    fn unreadable_marker_falls_back_to_age() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);
        let path = locks.marker_path(LockName::Upgrade);
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(
            locks.try_acquire(LockName::Upgrade),
            Err(LockError::Busy { .. })
        ));

        age_marker(&path, Duration::from_secs(3601));
        locks.try_acquire(LockName::Upgrade).unwrap();
    }

    #[test]
    fn dead_owner_on_this_host_is_reclaimed_early() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);
        std::fs::create_dir_all(dir.path()).unwrap();
        let owner = LockOwner {
            // Above the default pid_max on Linux; never a live process.
            pid: 4_194_305,
            host: current_host(),
            acquired_at: Utc::now(),
        };
        std::fs::write(
            locks.marker_path(LockName::Health),
            serde_json::to_string(&owner).unwrap(),
        )
        .unwrap();

        locks.try_acquire(LockName::Health).unwrap();
    }

    #[test]
    fn release_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);

        locks.release(LockName::Backup).unwrap();
        let guard = locks.try_acquire(LockName::Backup).unwrap();
        locks.release(LockName::Backup).unwrap();
        locks.release(LockName::Backup).unwrap();
        drop(guard);
    }

    #[test]
    fn guard_drop_releases() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);
        {
            let _guard = locks.try_acquire(LockName::Health).unwrap();
        }
        assert!(!locks.marker_path(LockName::Health).exists());
    }

    #[test]
    fn ensure_checks_the_lock_name() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);
        let guard = locks.try_acquire(LockName::Backup).unwrap();

        guard.ensure(LockName::Backup).unwrap();
        assert!(matches!(
            guard.ensure(LockName::Health),
            Err(LockError::WrongLock { .. })
        ));
    }

    #[test]
    fn status_reports_holder() {
        let dir = TempDir::new().unwrap();
        let locks = LockManager::new(dir.path(), HOUR);

        assert!(!locks.status(LockName::Health).unwrap().held);
        let _guard = locks.try_acquire(LockName::Health).unwrap();
        let status = locks.status(LockName::Health).unwrap();
        assert!(status.held);
        assert!(!status.stale);
        assert_eq!(status.owner.map(|o| o.pid), Some(std::process::id()));
    }
}
