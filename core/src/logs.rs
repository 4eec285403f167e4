//! Retention for the daily text logs under `<state_dir>/logs`.

use std::path::Path;
use std::time::{Duration, SystemTime};

/// File name prefix of the rolling log (`warden.log.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "warden.log";

/// Remove log files last modified more than `retention_days` before `now`.
/// Zero keeps everything. Returns the number of files removed.
pub fn prune_logs(dir: &Path, retention_days: u32, now: SystemTime) -> std::io::Result<usize> {
    if retention_days == 0 {
        return Ok(0);
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let max_age = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);
    let mut removed = 0;
    for entry in entries.filter_map(Result::ok) {
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let age = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age > max_age {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(file = %entry.path().display(), error = %e, "failed to remove old log"),
            }
        }
    }
    if removed > 0 {
        tracing::debug!(removed, retention_days, "pruned old log files");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn touch(path: &Path, age: Duration) {
        std::fs::write(path, "log line\n").unwrap();
        let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
    }

    #[test]
    fn removes_only_expired_log_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let day = Duration::from_secs(86_400);
        touch(&dir.path().join("warden.log.2024-01-01"), day * 40);
        touch(&dir.path().join("warden.log.2024-02-05"), day * 2);
        touch(&dir.path().join("notes.txt"), day * 40);

        let removed = prune_logs(dir.path(), 30, SystemTime::now()).unwrap();
        assert_eq!(removed, 1);
        assert!(!dir.path().join("warden.log.2024-01-01").exists());
        assert!(dir.path().join("warden.log.2024-02-05").exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let dir = tempfile::TempDir::new().unwrap();
        touch(&dir.path().join("warden.log.old"), Duration::from_secs(86_400 * 400));
        assert_eq!(prune_logs(dir.path(), 0, SystemTime::now()).unwrap(), 0);
    }

    #[test]
    fn missing_directory_is_fine() {
        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(prune_logs(&dir.path().join("logs"), 7, SystemTime::now()).unwrap(), 0);
    }
}
