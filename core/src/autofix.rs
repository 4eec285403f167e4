//! Zero-cost remedies tried before paying for the repair agent.
//!
//! Two remedies, in order:
//! 1. Inline a missing environment variable into the application config when
//!    the diagnostics name both the variable and the config path, and a
//!    literal value is available in the application's env store.
//! 2. Restart the service when it merely looks stopped and nothing else in
//!    the diagnostics points at a deeper problem.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::fingerprint::{self, MissingEnvVar};
use crate::lock::{LockError, LockGuard, LockName};
use crate::service::ServiceManager;

#[derive(Debug, thiserror::Error)]
pub enum AutoFixError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path} is not valid JSON: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoFixOutcome {
    /// A remedy was applied; the description is safe to log and notify.
    Fixed(String),
    NeedsEscalation,
}

pub struct AutoFixEngine {
    config_file: PathBuf,
    app_home: PathBuf,
    service: Arc<dyn ServiceManager>,
}

impl AutoFixEngine {
    pub fn new(
        config_file: impl Into<PathBuf>,
        app_home: impl Into<PathBuf>,
        service: Arc<dyn ServiceManager>,
    ) -> Self {
        Self {
            config_file: config_file.into(),
            app_home: app_home.into(),
            service,
        }
    }

    /// Try each remedy in order. Never escalates with side effects applied
    /// unless the remedy itself succeeded.
    pub async fn try_auto_fix(
        &self,
        diagnostic_text: &str,
        guard: &LockGuard,
    ) -> Result<AutoFixOutcome, AutoFixError> {
        guard.ensure(LockName::Health)?;
        let signals = fingerprint::analyze(diagnostic_text);

        if let Some(missing) = &signals.missing_env {
            match self.inline_env_var(missing) {
                Ok(Some(description)) => {
                    if let Err(e) = self.service.restart().await {
                        tracing::warn!(error = %e, "restart after config rewrite failed");
                        return Ok(AutoFixOutcome::NeedsEscalation);
                    }
                    return Ok(AutoFixOutcome::Fixed(description));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "env var inlining skipped"),
            }
        }

        if signals.looks_stopped() && !signals.has_corroborating_error() {
            tracing::info!("gateway looks stopped with no other errors; restarting");
            return match self.service.restart().await {
                Ok(()) => Ok(AutoFixOutcome::Fixed("restarted the stopped service".to_string())),
                Err(e) => {
                    tracing::warn!(error = %e, "bare restart failed");
                    Ok(AutoFixOutcome::NeedsEscalation)
                }
            };
        }

        Ok(AutoFixOutcome::NeedsEscalation)
    }

    /// Rewrite `${NAME}` at the reported config path with its literal value.
    ///
    /// `Ok(None)` means a precondition did not hold and nothing was touched.
    fn inline_env_var(&self, missing: &MissingEnvVar) -> Result<Option<String>, AutoFixError> {
        let Some(config_path) = missing.config_path.as_deref() else {
            tracing::debug!(var = %missing.name, "no config path reported");
            return Ok(None);
        };

        let path = &self.config_file;
        let original = std::fs::read_to_string(path).map_err(|source| AutoFixError::Read {
            path: path.clone(),
            source,
        })?;
        let mut config: Value =
            serde_json::from_str(&original).map_err(|source| AutoFixError::Parse {
                path: path.clone(),
                source,
            })?;

        let reference = format!("${{{}}}", missing.name);
        match lookup(&config, config_path).and_then(Value::as_str) {
            Some(current) if current.trim() == reference => {}
            _ => {
                tracing::debug!(
                    var = %missing.name,
                    config_path,
                    "config value does not reference the variable"
                );
                return Ok(None);
            }
        }

        let Some(literal) = self.literal_value(&config, &missing.name) else {
            tracing::debug!(var = %missing.name, "no literal value available");
            return Ok(None);
        };

        let Some(slot) = lookup_mut(&mut config, config_path) else {
            return Ok(None);
        };
        *slot = Value::String(literal);

        let backup = backup_path(path);
        std::fs::copy(path, &backup).map_err(|source| AutoFixError::Write {
            path: backup.clone(),
            source,
        })?;

        let mut rendered = serde_json::to_string_pretty(&config).map_err(|source| {
            AutoFixError::Parse {
                path: path.clone(),
                source,
            }
        })?;
        rendered.push('\n');
        atomic_replace(path, rendered.as_bytes())?;

        tracing::info!(
            var = %missing.name,
            config_path,
            backup = %backup.display(),
            "inlined environment variable into config"
        );
        Ok(Some(format!(
            "inlined {} at {config_path} (backup: {})",
            missing.name,
            backup.display()
        )))
    }

    /// `env.vars.NAME`, then `env.NAME`, then the application's `.env` file.
    fn literal_value(&self, config: &Value, name: &str) -> Option<String> {
        let from_config = config
            .pointer(&format!("/env/vars/{name}"))
            .or_else(|| config.pointer(&format!("/env/{name}")))
            .and_then(Value::as_str)
            .map(str::to_string);

        from_config
            .or_else(|| self.dotenv_value(name))
            .filter(|v| !v.is_empty() && !v.starts_with("${"))
    }

    fn dotenv_value(&self, name: &str) -> Option<String> {
        let iter = dotenvy::from_path_iter(self.app_home.join(".env")).ok()?;
        iter.filter_map(Result::ok)
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }
}

fn lookup<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, dotted: &str) -> Option<&'a mut Value> {
    dotted.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get_mut(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(move |i| items.get_mut(i)),
        _ => None,
    })
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".bak-{stamp}"));
    PathBuf::from(name)
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn atomic_replace(path: &Path, data: &[u8]) -> Result<(), AutoFixError> {
    let write_err = |source| AutoFixError::Write {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions()).map_err(write_err)?;
    }
    tmp.write_all(data).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManager;
    use crate::service::ServiceError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

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
        dir: TempDir,
        service: Arc<CountingService>,
        engine: AutoFixEngine,
        locks: LockManager,
    }

    fn fixture(config: &Value) -> Fixture {
        let dir = TempDir::new().unwrap();
        let app_home = dir.path().join("app");
        std::fs::create_dir_all(&app_home).unwrap();
        let config_file = app_home.join("openclaw.json");
        std::fs::write(&config_file, serde_json::to_string_pretty(config).unwrap()).unwrap();
        let service = Arc::new(CountingService::default());
        let engine = AutoFixEngine::new(&config_file, &app_home, service.clone());
        let locks = LockManager::new(dir.path().join("locks"), Duration::from_secs(3600));
        Fixture {
            dir,
            service,
            engine,
            locks,
        }
    }

    impl Fixture {
        fn config(&self) -> Value {
            let text = std::fs::read_to_string(self.dir.path().join("app/openclaw.json")).unwrap();
            serde_json::from_str(&text).unwrap()
        }

        fn restarts(&self) -> usize {
            self.service.restarts.load(Ordering::SeqCst)
        }

        fn backups(&self) -> usize {
            std::fs::read_dir(self.dir.path().join("app"))
                .unwrap()
                .filter_map(Result::ok)
                .filter(|e| e.file_name().to_string_lossy().contains(".bak-"))
                .count()
        }
    }

    const MISSING: &str =
        "Error: missing env var DISCORD_TOKEN (config path: channels.discord.token)";

    #[tokio::test]
    async fn inlines_value_from_config_env_store() {
        let fx = fixture(&serde_json::json!({
            "env": { "vars": { "DISCORD_TOKEN": "abc123" } },
            "channels": { "discord": { "token": "${DISCORD_TOKEN}" } }
        }));
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();

        let outcome = fx.engine.try_auto_fix(MISSING, &guard).await.unwrap();
        assert!(matches!(outcome, AutoFixOutcome::Fixed(ref d) if d.contains("DISCORD_TOKEN")));
        assert!(!format!("{outcome:?}").contains("abc123"));
        assert_eq!(fx.config()["channels"]["discord"]["token"], "abc123");
        assert_eq!(fx.restarts(), 1);
        assert_eq!(fx.backups(), 1);
    }

    #[tokio::test]
    async fn inlines_value_from_dotenv_file() {
        let fx = fixture(&serde_json::json!({
            "channels": [{ "token": "${SLACK_TOKEN}" }]
        }));
        std::fs::write(fx.dir.path().join("app/.env"), "SLACK_TOKEN=xoxb-1\n").unwrap();
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();

        let text = "missing env var SLACK_TOKEN\nconfig path: channels.0.token";
        let outcome = fx.engine.try_auto_fix(text, &guard).await.unwrap();
        assert!(matches!(outcome, AutoFixOutcome::Fixed(_)));
        assert_eq!(fx.config()["channels"][0]["token"], "xoxb-1");
    }

    #[tokio::test]
    async fn no_literal_means_escalation_without_side_effects() {
        let original = serde_json::json!({
            "channels": { "discord": { "token": "${DISCORD_TOKEN}" } }
        });
        let fx = fixture(&original);
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();

        let outcome = fx.engine.try_auto_fix(MISSING, &guard).await.unwrap();
        assert_eq!(outcome, AutoFixOutcome::NeedsEscalation);
        assert_eq!(fx.config(), original);
        assert_eq!(fx.restarts(), 0);
        assert_eq!(fx.backups(), 0);
    }

    #[tokio::test]
    async fn value_not_referencing_variable_is_left_alone() {
        let original = serde_json::json!({
            "env": { "DISCORD_TOKEN": "abc123" },
            "channels": { "discord": { "token": "hardcoded" } }
        });
        let fx = fixture(&original);
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();

        let outcome = fx.engine.try_auto_fix(MISSING, &guard).await.unwrap();
        assert_eq!(outcome, AutoFixOutcome::NeedsEscalation);
        assert_eq!(fx.config(), original);
    }

    #[tokio::test]
    async fn stopped_gateway_gets_a_bare_restart() {
        let fx = fixture(&serde_json::json!({}));
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();

        let outcome = fx
            .engine
            .try_auto_fix("gateway not running", &guard)
            .await
            .unwrap();
        assert!(matches!(outcome, AutoFixOutcome::Fixed(_)));
        assert_eq!(fx.restarts(), 1);
    }

    #[tokio::test]
    async fn corroborating_error_blocks_restart() {
        let fx = fixture(&serde_json::json!({}));
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();

        let outcome = fx
            .engine
            .try_auto_fix("connect ECONNREFUSED\nEADDRINUSE: address already in use", &guard)
            .await
            .unwrap();
        assert_eq!(outcome, AutoFixOutcome::NeedsEscalation);
        assert_eq!(fx.restarts(), 0);
    }

    #[tokio::test]
    async fn unknown_failure_escalates() {
        let fx = fixture(&serde_json::json!({}));
        let guard = fx.locks.try_acquire(LockName::Health).unwrap();
        let outcome = fx.engine.try_auto_fix("segfault", &guard).await.unwrap();
        assert_eq!(outcome, AutoFixOutcome::NeedsEscalation);
    }

    #[tokio::test]
    async fn requires_the_health_lock() {
        let fx = fixture(&serde_json::json!({}));
        let guard = fx.locks.try_acquire(LockName::Upgrade).unwrap();
        assert!(fx.engine.try_auto_fix("gateway not running", &guard).await.is_err());
        assert_eq!(fx.restarts(), 0);
    }

    #[test]
    fn dotted_paths_walk_objects_and_arrays() {
        let v = serde_json::json!({ "a": { "b": [1, { "c": "x" }] } });
        assert_eq!(lookup(&v, "a.b.1.c"), Some(&Value::String("x".to_string())));
        assert_eq!(lookup(&v, "a.b.9"), None);
        assert_eq!(lookup(&v, "a.z"), None);
    }
}
