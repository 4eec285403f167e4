//! Classification of diagnostic output into stable failure categories.
//!
//! The rules are plain data evaluated in order; the first category whose
//! pattern matches wins. Auto-fix guards use [`analyze`] so they look at the
//! text through exactly the same patterns.

use std::sync::LazyLock;

use regex_lite::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    MissingEnvVar,
    ConnectionRefused,
    GatewayNotRunning,
    InvalidAuth,
    ConfigInvalid,
    PortConflict,
}

impl Category {
    pub fn label(self) -> &'static str {
        match self {
            Category::MissingEnvVar => "missing_env_var",
            Category::ConnectionRefused => "connection_refused",
            Category::GatewayNotRunning => "gateway_not_running",
            Category::InvalidAuth => "invalid_auth",
            Category::ConfigInvalid => "config_invalid",
            Category::PortConflict => "port_conflict",
        }
    }
}

/// Precedence order. Earlier entries win when several match.
const RULES: &[(Category, &str)] = &[
    (
        Category::MissingEnvVar,
        r#"(?i)(?:missing|undefined|unset)\s+env(?:ironment)?\s+var(?:iable)?\s*:?\s*["'`]?\$?\{?([A-Za-z_][A-Za-z0-9_]*)|env(?:ironment)?\s+var(?:iable)?\s+["'`]?\$?\{?([A-Za-z_][A-Za-z0-9_]*)\}?["'`]?\s+(?:is\s+)?(?:not\s+set|not\s+defined|missing|undefined)"#,
    ),
    (Category::ConnectionRefused, r"(?i)ECONNREFUSED|connection refused"),
    (
        Category::GatewayNotRunning,
        r"(?i)\b(?:gateway|service)\s+(?:is\s+)?(?:not\s+running|stopped|inactive)\b|\bnot\s+running\b",
    ),
    (
        Category::InvalidAuth,
        r"(?i)invalid\s+(?:api\s+)?(?:key|token|credentials?)|unauthori[sz]ed|authentication\s+failed|\b401\b",
    ),
    (
        Category::ConfigInvalid,
        r"(?i)(?:invalid|malformed)\s+config(?:uration)?|config(?:uration)?\s+(?:is\s+)?invalid|failed\s+to\s+parse\s+config|JSON\s+parse\s+error|SyntaxError",
    ),
    (
        Category::PortConflict,
        r"(?i)EADDRINUSE|address\s+already\s+in\s+use|port\s+\d+\s+(?:is\s+)?(?:already\s+)?in\s+use",
    ),
];

const CONFIG_PATH_PATTERN: &str = r"(?i)config\s+path:\s*([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)";

static COMPILED: LazyLock<Vec<(Category, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .filter_map(|(category, pattern)| match Regex::new(pattern) {
            Ok(re) => Some((*category, re)),
            Err(e) => {
                tracing::error!(category = category.label(), error = %e, "invalid fingerprint rule");
                None
            }
        })
        .collect()
});

static CONFIG_PATH: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(CONFIG_PATH_PATTERN).ok());

/// Stable label for a class of failure, e.g. `connection_refused`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A missing environment variable reported by the diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingEnvVar {
    pub name: String,
    /// Dotted location in the application config, when reported.
    pub config_path: Option<String>,
}

/// Every category that matched, not just the winner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub missing_env: Option<MissingEnvVar>,
    pub connection_refused: bool,
    pub not_running: bool,
    pub invalid_auth: bool,
    pub config_invalid: bool,
    pub port_conflict: bool,
}

impl Signals {
    /// Errors that point at something a restart cannot fix.
    pub fn has_corroborating_error(&self) -> bool {
        self.missing_env.is_some() || self.config_invalid || self.invalid_auth || self.port_conflict
    }

    /// The gateway looks stopped or unreachable.
    pub fn looks_stopped(&self) -> bool {
        self.not_running || self.connection_refused
    }
}

/// Run every rule against `text`.
pub fn analyze(text: &str) -> Signals {
    let mut signals = Signals::default();
    for (category, re) in COMPILED.iter() {
        match category {
            Category::MissingEnvVar => {
                if let Some(caps) = re.captures(text) {
                    let name = caps.get(1).or_else(|| caps.get(2));
                    if let Some(name) = name {
                        signals.missing_env = Some(MissingEnvVar {
                            name: name.as_str().to_string(),
                            config_path: config_path(text),
                        });
                    }
                }
            }
            Category::ConnectionRefused => signals.connection_refused = re.is_match(text),
            Category::GatewayNotRunning => signals.not_running = re.is_match(text),
            Category::InvalidAuth => signals.invalid_auth = re.is_match(text),
            Category::ConfigInvalid => signals.config_invalid = re.is_match(text),
            Category::PortConflict => signals.port_conflict = re.is_match(text),
        }
    }
    signals
}

fn config_path(text: &str) -> Option<String> {
    CONFIG_PATH
        .as_ref()?
        .captures(text)?
        .get(1)
        .map(|m| m.as_str().to_string())
}

/// Classify diagnostic output. Pure and total: every input gets a label.
pub fn classify(text: &str, exit_code: i32) -> Fingerprint {
    let signals = analyze(text);
    let hit = |category: Category| match category {
        Category::MissingEnvVar => signals.missing_env.is_some(),
        Category::ConnectionRefused => signals.connection_refused,
        Category::GatewayNotRunning => signals.not_running,
        Category::InvalidAuth => signals.invalid_auth,
        Category::ConfigInvalid => signals.config_invalid,
        Category::PortConflict => signals.port_conflict,
    };

    for (category, _) in RULES {
        if !hit(*category) {
            continue;
        }
        return match (&signals.missing_env, category) {
            (Some(missing), Category::MissingEnvVar) => {
                Fingerprint(format!("{}:{}", category.label(), missing.name))
            }
            _ => Fingerprint(category.label().to_string()),
        };
    }

    if exit_code != 0 {
        Fingerprint(format!("doctor_exit_{exit_code}"))
    } else {
        Fingerprint("gateway_unhealthy".to_string())
    }
}
