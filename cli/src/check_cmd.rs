//! `warden check`

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use warden_core::{Collaborators, CycleOutcome, CycleReport, Orchestrator, Settings};

#[derive(Debug, Parser)]
pub struct CheckArgs {
    /// Print the cycle report as JSON.
    #[arg(long = "json", short = 'j')]
    pub json: bool,
}

pub(crate) async fn run(settings: Arc<Settings>, args: &CheckArgs) -> anyhow::Result<i32> {
    let parts = Collaborators::from_settings(&settings).context("failed to build HTTP client")?;
    let report = Orchestrator::new(settings, parts).run_cycle().await?;

    if args.json {
        crate::print_json(&report)?;
    } else {
        println!("{}", describe(&report));
    }
    Ok(report.exit_code())
}

fn describe(report: &CycleReport) -> String {
    let fingerprint = report.fingerprint.as_deref().unwrap_or("unknown");
    match &report.outcome {
        CycleOutcome::Healthy => "gateway healthy".to_string(),
        CycleOutcome::Transient => "gateway recovered before repair (transient failure)".to_string(),
        CycleOutcome::LockBusy => "another repair cycle is running; skipped".to_string(),
        CycleOutcome::Resolved {
            repair_type,
            attempt_id,
        } => format!(
            "gateway repaired by {} ({fingerprint}, attempt {attempt_id})",
            repair_type.as_str()
        ),
        CycleOutcome::Unresolved { attempt_id } => format!(
            "gateway still unhealthy after repair ({fingerprint}, attempt {attempt_id}); needs attention"
        ),
    }
}
