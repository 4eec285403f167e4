//! Layered settings loader.
//!
//! Precedence (later layers override earlier ones):
//! 1. Built-in defaults (`Settings::default()`)
//! 2. Settings file (`$WARDEN_HOME/config.toml`, or an explicit path)
//! 3. Environment overrides (`WARDEN_*`, lists comma separated)
//!
//! The result is an immutable [`Settings`] value. Keys the defaults do not
//! know about are ignored with a warning, so a typo can never switch a
//! safety-relevant value away from its default.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Deserializer, Serialize};

/// Environment prefix for overrides (`WARDEN_MAX_TURNS`, ...).
pub const ENV_PREFIX: &str = "WARDEN";

/// Environment variable that relocates the state directory.
pub const HOME_ENV: &str = "WARDEN_HOME";

/// Settings file name inside the state directory.
pub const CONFIG_FILENAME: &str = "config.toml";

/// Errors that can occur while loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("settings file {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),

    #[error("could not determine a home directory; set {HOME_ENV}")]
    NoHome,
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Invalid(err.to_string())
    }
}

/// How the notification command receives its message.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotifyMethod {
    /// Message appended as the final argument.
    #[default]
    Arg,
    /// Message piped on stdin.
    Stdin,
}

/// Package manager used to install the monitored application.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PackageManagerKind {
    #[default]
    Npm,
    Pnpm,
    Bun,
}

impl PackageManagerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageManagerKind::Npm => "npm",
            PackageManagerKind::Pnpm => "pnpm",
            PackageManagerKind::Bun => "bun",
        }
    }
}

/// Fully resolved, read-only settings for one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interval the external scheduler uses between `warden check` runs.
    pub check_interval_secs: u64,
    pub gateway_url: String,
    /// Delay before the confirmation probe after a first failure.
    pub confirm_delay_secs: u64,
    /// Delay before the verification probe after a repair.
    pub verify_delay_secs: u64,
    pub probe_timeout_secs: u64,

    /// Spend ceiling handed to the repair agent, in USD.
    pub max_budget_usd: f64,
    /// Turn ceiling handed to the repair agent.
    pub max_turns: u32,
    #[serde(deserialize_with = "string_or_list")]
    pub allowed_tools: Vec<String>,
    /// Hard wall-clock limit for one agent run; 0 disables it.
    pub agent_timeout_secs: u64,
    /// Diagnostic output longer than this is cut to a head+tail window.
    pub diagnostic_max_lines: usize,

    /// Lock markers older than this are treated as abandoned.
    pub lock_stale_secs: u64,
    /// Days of text logs to keep; 0 keeps everything.
    pub log_retention_days: u32,

    /// Empty disables notifications.
    pub notify_command: String,
    pub notify_method: NotifyMethod,
    pub notify_on_start: bool,
    pub notify_on_success: bool,
    pub notify_on_failure: bool,

    pub diagnostic_command: String,
    pub agent_command: String,
    pub restart_command: String,

    pub app_name: String,
    pub app_home: PathBuf,
    /// Primary application config, relative to `app_home` unless absolute.
    pub app_config_file: PathBuf,

    pub backup_enabled: bool,
    /// Relative paths resolve against the state directory.
    pub backup_dir: PathBuf,
    pub backup_include_workspace: bool,
    pub backup_include_extended: bool,
    pub max_backups: usize,
    pub backup_hour: u8,

    pub upgrade_enabled: bool,
    pub upgrade_auto_apply: bool,
    pub upgrade_hour: u8,
    pub package_name: String,
    pub package_manager: PackageManagerKind,

    /// Where locks, ledgers, prompts and logs live. Set by the loader.
    #[serde(skip)]
    pub state_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            check_interval_secs: 300,
            gateway_url: "http://127.0.0.1:18789/".to_string(),
            confirm_delay_secs: 30,
            verify_delay_secs: 15,
            probe_timeout_secs: 10,
            max_budget_usd: 5.0,
            max_turns: 25,
            allowed_tools: ["Read", "Edit", "Write", "Bash", "Grep", "Glob"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            agent_timeout_secs: 1800,
            diagnostic_max_lines: 200,
            lock_stale_secs: 3600,
            log_retention_days: 30,
            notify_command: String::new(),
            notify_method: NotifyMethod::Arg,
            notify_on_start: true,
            notify_on_success: true,
            notify_on_failure: true,
            diagnostic_command: "openclaw doctor".to_string(),
            agent_command: "claude".to_string(),
            restart_command: "systemctl --user restart openclaw-gateway".to_string(),
            app_name: "openclaw".to_string(),
            app_home: PathBuf::from("~/.openclaw"),
            app_config_file: PathBuf::from("openclaw.json"),
            backup_enabled: true,
            backup_dir: PathBuf::from("backups"),
            backup_include_workspace: true,
            backup_include_extended: false,
            max_backups: 14,
            backup_hour: 3,
            upgrade_enabled: true,
            upgrade_auto_apply: false,
            upgrade_hour: 4,
            package_name: "openclaw".to_string(),
            package_manager: PackageManagerKind::Npm,
            state_dir: PathBuf::new(),
        }
    }
}

impl Settings {
    pub fn confirm_delay(&self) -> Duration {
        Duration::from_secs(self.confirm_delay_secs)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_secs(self.verify_delay_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn lock_staleness(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }

    /// `None` when the agent may run without a wall-clock limit.
    pub fn agent_timeout(&self) -> Option<Duration> {
        (self.agent_timeout_secs > 0).then(|| Duration::from_secs(self.agent_timeout_secs))
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn prompt_dir(&self) -> PathBuf {
        self.state_dir.join("prompts")
    }

    pub fn repair_ledger_path(&self) -> PathBuf {
        self.state_dir.join("repair-history.jsonl")
    }

    pub fn upgrade_history_path(&self) -> PathBuf {
        self.state_dir.join("upgrade-history.jsonl")
    }

    /// Port of the gateway URL, used for the port-occupancy snapshot.
    pub fn gateway_port(&self) -> Option<u16> {
        reqwest::Url::parse(&self.gateway_url)
            .ok()
            .and_then(|url| url.port_or_known_default())
    }

    fn resolve_paths(&mut self, state_dir: &Path) {
        self.app_home = expand_home(&self.app_home);
        if self.app_config_file.is_relative() {
            self.app_config_file = self.app_home.join(&self.app_config_file);
        }
        let backup_dir = expand_home(&self.backup_dir);
        self.backup_dir = if backup_dir.is_relative() {
            state_dir.join(backup_dir)
        } else {
            backup_dir
        };
        self.state_dir = state_dir.to_path_buf();
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if reqwest::Url::parse(&self.gateway_url).is_err() {
            return Err(ConfigError::Invalid(format!(
                "gateway_url is not a valid URL: {}",
                self.gateway_url
            )));
        }
        if self.probe_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "probe_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid(
                "max_turns must be greater than 0".to_string(),
            ));
        }
        if !self.max_budget_usd.is_finite() || self.max_budget_usd < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "max_budget_usd must be a non-negative amount, got {}",
                self.max_budget_usd
            )));
        }
        if self.lock_stale_secs == 0 {
            return Err(ConfigError::Invalid(
                "lock_stale_secs must be greater than 0".to_string(),
            ));
        }
        if self.backup_hour > 23 || self.upgrade_hour > 23 {
            return Err(ConfigError::Invalid(
                "backup_hour and upgrade_hour must be between 0 and 23".to_string(),
            ));
        }
        for (key, value) in [
            ("diagnostic_command", &self.diagnostic_command),
            ("agent_command", &self.agent_command),
            ("restart_command", &self.restart_command),
        ] {
            if shlex::split(value).is_none_or(|argv| argv.is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "{key} must be a non-empty command line"
                )));
            }
        }
        if self.agent_timeout_secs > 0 && self.lock_stale_secs <= self.agent_timeout_secs {
            tracing::warn!(
                lock_stale_secs = self.lock_stale_secs,
                agent_timeout_secs = self.agent_timeout_secs,
                "lock staleness does not exceed the agent timeout; a long repair may lose its lock"
            );
        }
        Ok(())
    }
}

/// Accept either a TOML/env list or a single comma separated string.
fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        One(String),
        Many(Vec<String>),
    }

    let items = match Raw::deserialize(deserializer)? {
        Raw::One(s) => s.split(',').map(str::to_string).collect(),
        Raw::Many(v) => v,
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Resolve the state directory: `$WARDEN_HOME`, else `~/.warden`.
pub fn resolve_home() -> Result<PathBuf, ConfigError> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(expand_home(Path::new(&home)));
    }
    dirs::home_dir()
        .map(|home| home.join(".warden"))
        .ok_or(ConfigError::NoHome)
}

/// Builder for layered settings loading.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    home: Option<PathBuf>,
    config_file: Option<PathBuf>,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an explicit state directory instead of `$WARDEN_HOME`.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Use an explicit settings file. Unlike the default location, an
    /// explicit file must exist.
    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_file = Some(path.into());
        self
    }

    /// Ignore `WARDEN_*` environment overrides.
    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(&self) -> Result<Settings, ConfigError> {
        let home = match &self.home {
            Some(home) => home.clone(),
            None => resolve_home()?,
        };

        let defaults = serde_json::to_value(Settings::default())?;
        let known: BTreeSet<String> = defaults
            .as_object()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();

        let mut builder = Config::builder().add_source(File::from_str(
            &defaults.to_string(),
            FileFormat::Json,
        ));

        let (path, required) = match &self.config_file {
            Some(path) => (path.clone(), true),
            None => (home.join(CONFIG_FILENAME), false),
        };
        if let Some(content) = read_settings_file(&path, required)? {
            let table: toml::Table =
                toml::from_str(&content).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
            for key in table.keys().filter(|key| !known.contains(*key)) {
                tracing::warn!(
                    key = key.as_str(),
                    file = %path.display(),
                    "ignoring unknown settings key"
                );
            }
            builder = builder.add_source(File::from_str(&content, FileFormat::Toml));
        }

        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_tools"),
            );
        }

        let mut settings: Settings = builder.build()?.try_deserialize()?;
        settings.resolve_paths(&home);
        settings.validate()?;
        Ok(settings)
    }
}

fn read_settings_file(path: &Path, required: bool) -> Result<Option<String>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(None),
        Err(source) => Err(ConfigError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}
