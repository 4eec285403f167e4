//! Command-line front end of the watchdog.
//!
//! Exit codes:
//! - 0: success, nothing to do, or another run holds the lock
//! - 1: needs attention (unresolved repair, failed backup or upgrade, bad config)
//! - 10: update available (advisory)

mod backup_cmd;
mod check_cmd;
mod logging;
mod status_cmd;
mod upgrade_cmd;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use clap::{Parser, Subcommand};
use warden_core::config::{ConfigLoader, Settings, resolve_home};

pub use backup_cmd::BackupCli;
pub use check_cmd::CheckArgs;
pub use status_cmd::{HistoryArgs, StatusArgs};
pub use upgrade_cmd::UpgradeCli;

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Gateway watchdog with automated repair")]
pub struct Cli {
    /// Settings file (default: $WARDEN_HOME/config.toml).
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run one health-check cycle.
    Check(CheckArgs),
    /// Create, list, restore and prune backups.
    Backup(BackupCli),
    /// Check for and apply package upgrades.
    Upgrade(UpgradeCli),
    /// Repair statistics, lock states, last backup and upgrade.
    Status(StatusArgs),
    /// Recent repair attempts.
    History(HistoryArgs),
}

/// Run a parsed command line and return the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    let home = resolve_home().context("cannot determine the warden state directory")?;
    let _log_guard = logging::init(&home.join("logs"));

    let mut loader = ConfigLoader::new().with_home(&home);
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let settings = Arc::new(loader.load().context("failed to load settings")?);
    prune_old_logs(&settings);

    match cli.command {
        Command::Check(args) => check_cmd::run(settings, &args).await,
        Command::Backup(backup) => backup.run(settings).await,
        Command::Upgrade(upgrade) => upgrade.run(settings).await,
        Command::Status(args) => status_cmd::run_status(&settings, &args),
        Command::History(args) => status_cmd::run_history(&settings, &args),
    }
}

fn prune_old_logs(settings: &Settings) {
    match warden_core::logs::prune_logs(
        &settings.log_dir(),
        settings.log_retention_days,
        SystemTime::now(),
    ) {
        Ok(0) => {}
        Ok(removed) => tracing::debug!(removed, "pruned old log files"),
        Err(e) => tracing::warn!(error = %e, "could not prune old log files"),
    }
}

/// Pretty JSON on stdout.
fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
