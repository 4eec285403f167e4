//! Global package installs through npm, pnpm or bun.

use std::time::Duration;

use async_trait::async_trait;
use warden_core::config::PackageManagerKind;
use warden_core::process::{self, CommandError, CommandOutput, StdinSource};

const QUERY_TIMEOUT: Duration = Duration::from_secs(120);
const INSTALL_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("`{command}` exited with {exit_code}: {output}")]
    Failed {
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("could not read a version from `{command}` output: {output}")]
    Unparseable { command: String, output: String },
}

#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Short name recorded in upgrade history (`npm`, `pnpm`, `bun`).
    fn name(&self) -> &str;

    /// Globally installed version, `None` when the package is absent.
    async fn installed_version(&self) -> Result<Option<String>, PackageError>;

    /// Newest version published to the registry.
    async fn latest_version(&self) -> Result<String, PackageError>;

    async fn install(&self, version: &str) -> Result<(), PackageError>;
}

#[derive(Debug, Clone)]
pub struct CommandPackageManager {
    kind: PackageManagerKind,
    package: String,
}

impl CommandPackageManager {
    pub fn new(kind: PackageManagerKind, package: impl Into<String>) -> Self {
        Self {
            kind,
            package: package.into(),
        }
    }

    fn list_argv(&self) -> Vec<String> {
        let json_ls = |tool: &str| -> Vec<String> {
            [tool, "ls", "-g", "--depth=0", "--json", self.package.as_str()]
                .iter()
                .map(ToString::to_string)
                .collect()
        };
        match self.kind {
            PackageManagerKind::Npm => json_ls("npm"),
            PackageManagerKind::Pnpm => json_ls("pnpm"),
            PackageManagerKind::Bun => ["bun", "pm", "ls", "-g"]
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    fn view_argv(&self) -> Vec<String> {
        let tool = match self.kind {
            PackageManagerKind::Pnpm => "pnpm",
            // bun reads the same registry and has no stable `view`.
            PackageManagerKind::Npm | PackageManagerKind::Bun => "npm",
        };
        vec![
            tool.to_string(),
            "view".to_string(),
            self.package.clone(),
            "version".to_string(),
        ]
    }

    fn install_argv(&self, version: &str) -> Vec<String> {
        let spec = format!("{}@{version}", self.package);
        let prefix: &[&str] = match self.kind {
            PackageManagerKind::Npm => &["npm", "install", "-g"],
            PackageManagerKind::Pnpm => &["pnpm", "add", "-g"],
            PackageManagerKind::Bun => &["bun", "add", "-g"],
        };
        prefix
            .iter()
            .map(ToString::to_string)
            .chain(std::iter::once(spec))
            .collect()
    }
}

async fn run_checked(argv: &[String], timeout: Duration) -> Result<CommandOutput, PackageError> {
    let out = process::run(argv, StdinSource::Null, Some(timeout)).await?;
    if out.success() {
        Ok(out)
    } else {
        Err(PackageError::Failed {
            command: argv.join(" "),
            exit_code: out.exit_code,
            output: out.combined().trim().to_string(),
        })
    }
}

#[async_trait]
impl PackageManager for CommandPackageManager {
    fn name(&self) -> &str {
        self.kind.as_str()
    }

    async fn installed_version(&self) -> Result<Option<String>, PackageError> {
        let argv = self.list_argv();
        // `npm ls` exits 1 when the package is missing; the JSON still parses.
        let out = process::run(&argv, StdinSource::Null, Some(QUERY_TIMEOUT)).await?;
        let found = match self.kind {
            PackageManagerKind::Npm | PackageManagerKind::Pnpm => {
                parse_ls_json(&out.stdout, &self.package)
            }
            PackageManagerKind::Bun => parse_ls_text(&out.stdout, &self.package),
        };
        if found.is_none() && !out.success() && out.stdout.trim().is_empty() {
            return Err(PackageError::Failed {
                command: argv.join(" "),
                exit_code: out.exit_code,
                output: out.combined().trim().to_string(),
            });
        }
        Ok(found)
    }

    async fn latest_version(&self) -> Result<String, PackageError> {
        let argv = self.view_argv();
        let out = run_checked(&argv, QUERY_TIMEOUT).await?;
        parse_view(&out.stdout).ok_or_else(|| PackageError::Unparseable {
            command: argv.join(" "),
            output: out.stdout.trim().to_string(),
        })
    }

    async fn install(&self, version: &str) -> Result<(), PackageError> {
        let argv = self.install_argv(version);
        tracing::info!(command = %argv.join(" "), "installing package");
        run_checked(&argv, INSTALL_TIMEOUT).await.map(|_| ())
    }
}

/// `npm ls --json` prints an object; `pnpm ls --json` prints an array of them.
fn parse_ls_json(stdout: &str, package: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).ok()?;
    let roots = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    roots.iter().find_map(|root| {
        root.get("dependencies")?
            .get(package)?
            .get("version")?
            .as_str()
            .map(ToString::to_string)
    })
}

/// `bun pm ls -g` prints a tree such as `├── openclaw@2.3.1`.
fn parse_ls_text(stdout: &str, package: &str) -> Option<String> {
    let needle = format!("{package}@");
    stdout.lines().find_map(|line| {
        let start = line.find(&needle)?;
        // Reject `@scope/openclaw@…` matching `openclaw@…`.
        if start > 0 && !line[..start].ends_with(char::is_whitespace) {
            return None;
        }
        let version = line[start + needle.len()..].split_whitespace().next()?;
        (!version.is_empty()).then(|| version.to_string())
    })
}

fn parse_view(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(|line| line.trim().trim_matches(|c| c == '\'' || c == '"'))
        .find(|line| !line.is_empty())
        .map(ToString::to_string)
}
