//! `warden upgrade {check|upgrade|rollback|auto}`

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use warden_core::{Collaborators, Settings};
use warden_upgrade::{
    CommandPackageManager, UpgradeEntry, UpgradeManager, UpgradeOutcome, UpgradeParts,
    UpgradeStatus,
};

#[derive(Debug, Parser)]
pub struct UpgradeCli {
    #[command(subcommand)]
    pub command: UpgradeSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum UpgradeSubcommand {
    /// Compare installed and latest versions. Exits 10 when an update exists.
    Check,
    /// Back up, install the latest version, verify, roll back on failure.
    Upgrade(UpgradeArgs),
    /// Return to the version before the last successful upgrade.
    Rollback,
    /// Scheduled run: honours `upgrade_enabled` and `upgrade_auto_apply`.
    Auto,
}

#[derive(Debug, Parser)]
pub struct UpgradeArgs {
    /// Reinstall even when already on the latest version.
    #[arg(long = "force")]
    pub force: bool,
}

impl UpgradeCli {
    pub(crate) async fn run(self, settings: Arc<Settings>) -> anyhow::Result<i32> {
        let parts = Collaborators::from_settings(&settings).context("failed to build HTTP client")?;
        let manager = UpgradeManager::new(
            settings.clone(),
            UpgradeParts {
                packages: Arc::new(CommandPackageManager::new(
                    settings.package_manager,
                    settings.package_name.clone(),
                )),
                service: parts.service,
                probe: parts.probe,
                notifier: parts.notifier,
            },
        );

        let outcome = match self.command {
            UpgradeSubcommand::Check => {
                let check = manager.check().await?;
                if check.update_available {
                    println!(
                        "{} {} is available (installed {})",
                        check.package, check.latest, check.installed
                    );
                } else {
                    println!("{} {} is up to date", check.package, check.installed);
                }
                return Ok(check.exit_code());
            }
            UpgradeSubcommand::Upgrade(args) => manager.upgrade(args.force).await?,
            UpgradeSubcommand::Rollback => manager.rollback().await?,
            UpgradeSubcommand::Auto => manager.auto().await?,
        };
        println!("{}", describe(&outcome));
        Ok(outcome.exit_code())
    }
}

fn describe(outcome: &UpgradeOutcome) -> String {
    match outcome {
        UpgradeOutcome::Disabled => "upgrades are disabled (upgrade_enabled = false)".to_string(),
        UpgradeOutcome::LockBusy => "another upgrade is running; skipped".to_string(),
        UpgradeOutcome::UpToDate { version } => format!("already on {version}"),
        UpgradeOutcome::UpdateAvailable(check) => format!(
            "{} {} is available (installed {}); auto-apply is off",
            check.package, check.latest, check.installed
        ),
        UpgradeOutcome::Upgraded(entry) | UpgradeOutcome::ManualRollback(entry) => {
            describe_entry(entry)
        }
    }
}

fn describe_entry(entry: &UpgradeEntry) -> String {
    let verb = match entry.status {
        UpgradeStatus::Success => "upgraded",
        UpgradeStatus::RolledBack => "rolled back",
        UpgradeStatus::Failed => "FAILED",
    };
    format!(
        "{verb}: {} -> {} via {} in {:.0}s ({})",
        entry.from_version, entry.to_version, entry.package_manager, entry.duration_secs, entry.notes
    )
}
