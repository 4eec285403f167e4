//! Evidence gathering for a failing gateway.
//!
//! Nothing here is fatal: a missing tool or a crashing doctor command turns
//! into text in the report, never into an error for the cycle.

use std::time::Duration;

use async_trait::async_trait;

use crate::process::{self, CommandOutput, StdinSource};

const DOCTOR_TIMEOUT: Duration = Duration::from_secs(120);
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of the configured diagnostic command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticReport {
    /// `-1` when the command could not be run to completion.
    pub exit_code: i32,
    pub output: String,
}

#[async_trait]
pub trait Diagnostics: Send + Sync {
    async fn run_doctor(&self) -> DiagnosticReport;
    async fn process_list(&self) -> String;
    async fn port_snapshot(&self, port: Option<u16>) -> String;
}

/// Runs the configured doctor command plus `ps` and `ss` snapshots.
#[derive(Debug, Clone)]
pub struct CommandDiagnostics {
    doctor_command: String,
    app_name: String,
}

impl CommandDiagnostics {
    pub fn new(doctor_command: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            doctor_command: doctor_command.into(),
            app_name: app_name.into(),
        }
    }
}

async fn capture(argv: &[String], timeout: Duration) -> Result<CommandOutput, process::CommandError> {
    process::run(argv, StdinSource::Null, Some(timeout)).await
}

fn to_argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

#[async_trait]
impl Diagnostics for CommandDiagnostics {
    async fn run_doctor(&self) -> DiagnosticReport {
        let argv = match process::split_command(&self.doctor_command) {
            Ok(argv) => argv,
            Err(e) => {
                return DiagnosticReport {
                    exit_code: -1,
                    output: format!("diagnostic command unusable: {e}"),
                };
            }
        };
        match capture(&argv, DOCTOR_TIMEOUT).await {
            Ok(out) => {
                tracing::info!(exit_code = out.exit_code, "diagnostic command finished");
                DiagnosticReport {
                    exit_code: out.exit_code,
                    output: out.combined(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "diagnostic command failed to run");
                DiagnosticReport {
                    exit_code: -1,
                    output: format!("diagnostic command failed to run: {e}"),
                }
            }
        }
    }

    async fn process_list(&self) -> String {
        match capture(&to_argv(&["ps", "-eo", "pid,ppid,etime,args"]), SNAPSHOT_TIMEOUT).await {
            Ok(out) => {
                let needle = self.app_name.to_lowercase();
                let mut lines = out.stdout.lines();
                let header = lines.next().unwrap_or_default();
                let matching: Vec<&str> = lines
                    .filter(|line| line.to_lowercase().contains(&needle))
                    .collect();
                if matching.is_empty() {
                    format!("no processes matching '{}'", self.app_name)
                } else {
                    std::iter::once(header)
                        .chain(matching)
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
            Err(e) => format!("process list unavailable: {e}"),
        }
    }

    async fn port_snapshot(&self, port: Option<u16>) -> String {
        let Some(port) = port else {
            return "gateway port unknown".to_string();
        };
        let filter = format!("sport = :{port}");
        match capture(&to_argv(&["ss", "-ltnp", &filter]), SNAPSHOT_TIMEOUT).await {
            Ok(out) if out.success() => {
                if out.stdout.lines().count() <= 1 {
                    format!("nothing listening on port {port}")
                } else {
                    out.stdout
                }
            }
            Ok(out) => format!("port snapshot failed: {}", out.combined().trim()),
            Err(e) => format!("port snapshot unavailable: {e}"),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn doctor_output_and_exit_code_are_captured() {
        let diag = CommandDiagnostics::new("sh -c 'echo ECONNREFUSED; exit 2'", "openclaw");
        let report = diag.run_doctor().await;
        assert_eq!(report.exit_code, 2);
        assert_eq!(report.output.trim(), "ECONNREFUSED");
    }

    #[tokio::test]
    async fn missing_doctor_is_informative() {
        let diag = CommandDiagnostics::new("warden-test-no-such-doctor", "openclaw");
        let report = diag.run_doctor().await;
        assert_eq!(report.exit_code, -1);
        assert!(report.output.contains("failed to run"));
    }

    #[tokio::test]
    async fn unknown_port_is_reported() {
        let diag = CommandDiagnostics::new("true", "openclaw");
        assert_eq!(diag.port_snapshot(None).await, "gateway port unknown");
    }
}
