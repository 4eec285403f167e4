//! `warden backup {create|list|restore|prune}`

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use warden_backup::{BackupError, BackupManager, RestoreTarget};
use warden_core::service::CommandServiceManager;
use warden_core::{LockError, LockGuard, LockManager, LockName, Settings};

#[derive(Debug, Parser)]
pub struct BackupCli {
    #[command(subcommand)]
    pub command: BackupSubcommand,
}

#[derive(Debug, Subcommand)]
pub enum BackupSubcommand {
    /// Archive the application state and prune old archives.
    Create(CreateArgs),
    /// List archives, newest first.
    List(ListArgs),
    /// Restore the application state from an archive.
    Restore(RestoreArgs),
    /// Delete regular archives beyond `max_backups`.
    Prune,
}

#[derive(Debug, Parser)]
pub struct CreateArgs {
    /// Include every tier regardless of settings. Runs even when
    /// `backup_enabled = false`.
    #[arg(long = "full")]
    pub full: bool,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RestoreArgs {
    /// Archive path, or a file name inside the backup directory.
    #[arg(required_unless_present = "latest", conflicts_with = "latest")]
    pub file: Option<PathBuf>,

    /// Restore the newest regular archive.
    #[arg(long = "latest")]
    pub latest: bool,

    /// Skip the confirmation prompt.
    #[arg(long = "yes", short = 'y')]
    pub yes: bool,
}

impl BackupCli {
    pub(crate) async fn run(self, settings: Arc<Settings>) -> anyhow::Result<i32> {
        let service = Arc::new(CommandServiceManager::new(settings.restart_command.clone()));
        let manager = BackupManager::new(settings.clone(), service);

        match self.command {
            BackupSubcommand::List(args) => list(&manager, &args),
            BackupSubcommand::Create(args) => {
                if !settings.backup_enabled && !args.full {
                    println!("backups are disabled (backup_enabled = false); nothing to do");
                    return Ok(0);
                }
                let Some(guard) = acquire(&settings)? else {
                    return Ok(0);
                };
                let created = manager.create(&guard, args.full)?;
                println!(
                    "created {} ({} items, {})",
                    created.path.display(),
                    created.manifest.files.len(),
                    human_size(created.size_bytes)
                );
                for path in &created.pruned {
                    println!("pruned {}", path.display());
                }
                Ok(0)
            }
            BackupSubcommand::Prune => {
                let Some(guard) = acquire(&settings)? else {
                    return Ok(0);
                };
                let pruned = manager.prune(&guard)?;
                for path in &pruned {
                    println!("pruned {}", path.display());
                }
                println!("{} archive(s) removed", pruned.len());
                Ok(0)
            }
            BackupSubcommand::Restore(args) => {
                let Some(guard) = acquire(&settings)? else {
                    return Ok(0);
                };
                let target = match args.file {
                    Some(file) => RestoreTarget::File(file),
                    None => RestoreTarget::Latest,
                };
                let archive = manager.resolve(target)?;
                let confirmed = args.yes || confirm(&archive, &settings)?;
                match manager
                    .restore(&guard, RestoreTarget::File(archive), confirmed)
                    .await
                {
                    Ok(report) => {
                        println!(
                            "restored {} item(s) from {}",
                            report.restored.len(),
                            report.archive.display()
                        );
                        println!("pre-restore snapshot: {}", report.snapshot.display());
                        Ok(0)
                    }
                    Err(BackupError::NotConfirmed) => {
                        eprintln!("restore not confirmed; nothing changed");
                        Ok(1)
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

/// `None` when another backup run holds the lock.
fn acquire(settings: &Settings) -> anyhow::Result<Option<LockGuard>> {
    let locks = LockManager::new(settings.lock_dir(), settings.lock_staleness());
    match locks.try_acquire(LockName::Backup) {
        Ok(guard) => Ok(Some(guard)),
        Err(LockError::Busy { holder, .. }) => {
            println!("another backup operation is running ({holder}); skipped");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Ask on stderr, read one line from stdin. Only `yes` confirms.
fn confirm(archive: &std::path::Path, settings: &Settings) -> anyhow::Result<bool> {
    eprint!(
        "Restore {} into {}? Current state is snapshotted first. Type 'yes' to continue: ",
        archive.display(),
        settings.app_home.display()
    );
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(answer.trim() == "yes")
}

fn list(manager: &BackupManager, args: &ListArgs) -> anyhow::Result<i32> {
    let entries = manager.list()?;
    if args.json {
        crate::print_json(&entries)?;
        return Ok(0);
    }
    if entries.is_empty() {
        println!("no backups in {}", manager.backup_dir().display());
        return Ok(0);
    }
    for entry in &entries {
        let kind = entry.kind.label();
        let version = entry
            .manifest
            .as_ref()
            .and_then(|m| m.app_version.as_deref())
            .unwrap_or("-");
        println!(
            "{}  {:<11}  {:>9}  {:<10}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            kind,
            human_size(entry.size_bytes),
            version,
            entry.file_name
        );
    }
    Ok(0)
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.1} {}", UNITS[unit])
    }
}
