//! `warden status` and `warden history`

use std::sync::Arc;

use clap::Parser;
use serde::Serialize;
use warden_backup::{BackupEntry, BackupManager};
use warden_core::ledger::{RepairLedger, RepairRecord, SummaryStats};
use warden_core::lock::{LockManager, LockName, LockStatus};
use warden_core::service::CommandServiceManager;
use warden_core::Settings;
use warden_upgrade::{UpgradeEntry, UpgradeHistory};

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct HistoryArgs {
    /// Number of attempts to show, newest first.
    #[arg(long = "limit", short = 'n', default_value_t = 20)]
    pub limit: usize,

    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct StatusReport {
    gateway_url: String,
    repairs: SummaryStats,
    locks: Vec<LockStatus>,
    last_backup: Option<BackupEntry>,
    last_upgrade: Option<UpgradeEntry>,
}

pub(crate) fn run_status(settings: &Arc<Settings>, args: &StatusArgs) -> anyhow::Result<i32> {
    let ledger = RepairLedger::open(settings.repair_ledger_path())?;
    let locks = LockManager::new(settings.lock_dir(), settings.lock_staleness());
    let lock_states = LockName::ALL
        .iter()
        .map(|name| locks.status(*name))
        .collect::<Result<Vec<_>, _>>()?;
    let backups = BackupManager::new(
        settings.clone(),
        Arc::new(CommandServiceManager::new(settings.restart_command.clone())),
    );
    let report = StatusReport {
        gateway_url: settings.gateway_url.clone(),
        repairs: ledger.summary_stats(),
        locks: lock_states,
        last_backup: backups.latest()?,
        last_upgrade: UpgradeHistory::new(settings.upgrade_history_path())
            .entries()?
            .pop(),
    };

    if args.json {
        crate::print_json(&report)?;
    } else {
        print_status(&report);
    }
    Ok(0)
}

fn print_status(report: &StatusReport) {
    let stats = &report.repairs;
    println!("gateway:   {}", report.gateway_url);
    println!(
        "repairs:   {} total, {} succeeded, {} failed, {} in progress (auto-fix {}, agent {}), ${:.2} spent",
        stats.total,
        stats.success,
        stats.failed,
        stats.in_progress,
        stats.auto_fix,
        stats.agent,
        stats.total_cost_usd
    );
    if let Some(last) = stats.last_attempt {
        println!("last:      {}", last.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    for (fingerprint, count) in &stats.by_fingerprint {
        println!("           {count:>4}  {fingerprint}");
    }

    for lock in &report.locks {
        let state = match (&lock.owner, lock.held) {
            (_, false) => "free".to_string(),
            (Some(owner), true) if lock.stale => format!("stale ({owner})"),
            (Some(owner), true) => format!("held by {owner}"),
            (None, true) => "held (owner unknown)".to_string(),
        };
        println!("lock {:<7} {state}", lock.name.as_str());
    }

    match &report.last_backup {
        Some(entry) => println!("backup:    {} ({} bytes)", entry.file_name, entry.size_bytes),
        None => println!("backup:    none"),
    }
    match &report.last_upgrade {
        Some(entry) => println!(
            "upgrade:   {} -> {} {} at {}",
            entry.from_version,
            entry.to_version,
            entry.status.as_str(),
            entry.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        None => println!("upgrade:   none"),
    }
}

pub(crate) fn run_history(settings: &Settings, args: &HistoryArgs) -> anyhow::Result<i32> {
    let ledger = RepairLedger::open(settings.repair_ledger_path())?;
    let records: Vec<&RepairRecord> = ledger.recent(args.limit);

    if args.json {
        crate::print_json(&records)?;
        return Ok(0);
    }
    if records.is_empty() {
        println!("no repair attempts recorded");
        return Ok(0);
    }
    for record in records {
        println!(
            "{}  {:<8}  {:<8}  ${:>6.2}  {:>3} turns  {}",
            record.started_at.format("%Y-%m-%d %H:%M:%S"),
            record.status.as_str(),
            record.repair_type.as_str(),
            record.cost_usd,
            record.turns,
            record.fingerprint
        );
        if let Some(resolution) = &record.resolution {
            println!("    {resolution}");
        }
    }
    Ok(0)
}
