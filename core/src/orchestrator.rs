//! One health-check cycle: probe, confirm, repair, verify.
//!
//! ```text
//! Idle -> Probing -(ok)-> Idle
//!            |fail
//!            v
//!      DiagnosingSlow -> Probing -(ok)-> Idle            (transient)
//!                           |fail, health lock taken
//!                           v
//!                 Escalating{AutoFix} -(fixed)-> Verifying -(ok)-> Resolved
//!                           |needs escalation            |fail
//!                           v                            v
//!                 Escalating{Agent} ---------------> Verifying -> Resolved | Unresolved
//! ```
//!
//! The health lock is held from escalation until the cycle returns; the
//! guard is dropped on every path.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::agent::{self, AgentConfig, AgentOutcome, CliRepairAgent, RepairAgent, RepairContext};
use crate::autofix::{AutoFixEngine, AutoFixOutcome};
use crate::config::Settings;
use crate::diagnostics::{CommandDiagnostics, DiagnosticReport, Diagnostics};
use crate::fingerprint::{self, Fingerprint};
use crate::ledger::{Completion, LedgerError, RepairLedger, RepairStatus, RepairType};
use crate::lock::{LockError, LockGuard, LockManager, LockName};
use crate::notify::{CommandNotifier, Notify, NotifyEvent};
use crate::probe::{HealthProbe, HttpProbe};
use crate::service::{CommandServiceManager, ServiceManager};

/// Window used when counting earlier attempts for the same fingerprint.
pub const RECENT_WINDOW_MINUTES: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Probing,
    DiagnosingSlow,
    EscalatingAutoFix,
    EscalatingAgent,
    Verifying,
    Resolved,
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Healthy,
    /// First probe failed, the confirmation probe passed.
    Transient,
    /// Another cycle holds the health lock.
    LockBusy,
    Resolved {
        repair_type: RepairType,
        attempt_id: String,
    },
    Unresolved {
        attempt_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub outcome: CycleOutcome,
    pub fingerprint: Option<String>,
    pub states: Vec<CycleState>,
}

impl CycleReport {
    /// Process exit code for `warden check`.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            CycleOutcome::Unresolved { .. } => 1,
            _ => 0,
        }
    }
}

/// External collaborators of the orchestrator.
pub struct Collaborators {
    pub probe: Arc<dyn HealthProbe>,
    pub diagnostics: Arc<dyn Diagnostics>,
    pub service: Arc<dyn ServiceManager>,
    pub agent: Arc<dyn RepairAgent>,
    pub notifier: Arc<dyn Notify>,
}

impl Collaborators {
    /// The production wiring: HTTP probe, configured commands.
    pub fn from_settings(settings: &Settings) -> Result<Self, reqwest::Error> {
        Ok(Self {
            probe: Arc::new(HttpProbe::new(
                settings.gateway_url.clone(),
                settings.probe_timeout(),
            )?),
            diagnostics: Arc::new(CommandDiagnostics::new(
                settings.diagnostic_command.clone(),
                settings.app_name.clone(),
            )),
            service: Arc::new(CommandServiceManager::new(settings.restart_command.clone())),
            agent: Arc::new(CliRepairAgent::new(AgentConfig::from_settings(settings))),
            notifier: Arc::new(CommandNotifier::from_settings(settings)),
        })
    }
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    locks: LockManager,
    autofix: AutoFixEngine,
    probe: Arc<dyn HealthProbe>,
    diagnostics: Arc<dyn Diagnostics>,
    agent: Arc<dyn RepairAgent>,
    notifier: Arc<dyn Notify>,
}

/// Mutable bookkeeping for a cycle in progress.
struct Cycle {
    states: Vec<CycleState>,
    fingerprint: Option<Fingerprint>,
}

impl Cycle {
    fn enter(&mut self, state: CycleState) {
        tracing::debug!(?state, "cycle state");
        self.states.push(state);
    }

    fn finish(mut self, state: CycleState, outcome: CycleOutcome) -> CycleReport {
        self.enter(state);
        CycleReport {
            outcome,
            fingerprint: self.fingerprint.map(|f| f.to_string()),
            states: self.states,
        }
    }
}

impl Orchestrator {
    pub fn new(settings: Arc<Settings>, parts: Collaborators) -> Self {
        let locks = LockManager::new(settings.lock_dir(), settings.lock_staleness());
        let autofix = AutoFixEngine::new(
            settings.app_config_file.clone(),
            settings.app_home.clone(),
            parts.service,
        );
        Self {
            settings,
            locks,
            autofix,
            probe: parts.probe,
            diagnostics: parts.diagnostics,
            agent: parts.agent,
            notifier: parts.notifier,
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport, OrchestratorError> {
        let mut cycle = Cycle {
            states: vec![CycleState::Idle],
            fingerprint: None,
        };

        cycle.enter(CycleState::Probing);
        if let crate::probe::ProbeOutcome::Unhealthy(reason) = self.probe.probe().await {
            tracing::warn!(reason = %reason, "gateway health check failed");
        } else {
            tracing::debug!("gateway healthy");
            return Ok(cycle.finish(CycleState::Idle, CycleOutcome::Healthy));
        }

        cycle.enter(CycleState::DiagnosingSlow);
        let report = self.diagnostics.run_doctor().await;
        tokio::time::sleep(self.settings.confirm_delay()).await;

        cycle.enter(CycleState::Probing);
        if self.probe.probe().await.is_healthy() {
            tracing::info!("gateway recovered on confirmation probe; treating as transient");
            return Ok(cycle.finish(CycleState::Idle, CycleOutcome::Transient));
        }

        let guard = match self.locks.try_acquire(LockName::Health) {
            Ok(guard) => guard,
            Err(LockError::Busy { holder, .. }) => {
                tracing::info!(holder = %holder, "another repair cycle is running; skipping");
                return Ok(cycle.finish(CycleState::Idle, CycleOutcome::LockBusy));
            }
            Err(e) => return Err(e.into()),
        };

        self.escalate(cycle, &report, &guard).await
    }

    async fn escalate(
        &self,
        mut cycle: Cycle,
        report: &DiagnosticReport,
        guard: &LockGuard,
    ) -> Result<CycleReport, OrchestratorError> {
        let mut ledger = RepairLedger::open(self.settings.repair_ledger_path())?;
        let fingerprint = fingerprint::classify(&report.output, report.exit_code);
        let recent = ledger.count_recent(fingerprint.as_str(), RECENT_WINDOW_MINUTES);
        tracing::warn!(
            fingerprint = %fingerprint,
            diagnostic_exit = report.exit_code,
            recent_attempts = recent,
            "gateway down after confirmation; escalating"
        );
        cycle.fingerprint = Some(fingerprint.clone());

        self.notifier
            .notify(
                NotifyEvent::Start,
                &format!(
                    "{} gateway is down ({fingerprint}); starting repair",
                    self.settings.app_name
                ),
            )
            .await;

        cycle.enter(CycleState::EscalatingAutoFix);
        match self.autofix.try_auto_fix(&report.output, guard).await {
            Ok(AutoFixOutcome::Fixed(description)) => {
                let id = ledger.record_start(
                    guard,
                    fingerprint.as_str(),
                    report.exit_code,
                    RepairType::AutoFix,
                )?;
                cycle.enter(CycleState::Verifying);
                tokio::time::sleep(self.settings.verify_delay()).await;
                if self.probe.probe().await.is_healthy() {
                    ledger.record_complete(
                        guard,
                        &id,
                        Completion::free(RepairStatus::Success, Some(description.clone())),
                    )?;
                    self.notifier
                        .notify(
                            NotifyEvent::Success,
                            &format!(
                                "{} gateway recovered by auto-fix: {description}",
                                self.settings.app_name
                            ),
                        )
                        .await;
                    return Ok(cycle.finish(
                        CycleState::Resolved,
                        CycleOutcome::Resolved {
                            repair_type: RepairType::AutoFix,
                            attempt_id: id,
                        },
                    ));
                }
                tracing::warn!(fix = %description, "auto-fix applied but gateway is still down");
                ledger.record_complete(
                    guard,
                    &id,
                    Completion::free(
                        RepairStatus::Failed,
                        Some(format!("{description}; gateway still unhealthy")),
                    ),
                )?;
            }
            Ok(AutoFixOutcome::NeedsEscalation) => {
                tracing::info!(fingerprint = %fingerprint, "no auto-fix applies");
            }
            Err(e) => tracing::warn!(error = %e, "auto-fix aborted"),
        }

        cycle.enter(CycleState::EscalatingAgent);
        let id = ledger.record_start(guard, fingerprint.as_str(), report.exit_code, RepairType::Agent)?;
        let prompt = agent::build_prompt(&RepairContext {
            app_name: self.settings.app_name.clone(),
            gateway_url: self.settings.gateway_url.clone(),
            fingerprint: fingerprint.to_string(),
            diagnostic_exit: report.exit_code,
            diagnostic_output: report.output.clone(),
            process_list: self.diagnostics.process_list().await,
            port_snapshot: self
                .diagnostics
                .port_snapshot(self.settings.gateway_port())
                .await,
            recent_attempts: recent,
            max_lines: self.settings.diagnostic_max_lines,
        });

        let started = Instant::now();
        let outcome = match self.agent.run(&prompt).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "repair agent did not complete");
                AgentOutcome {
                    success: Some(false),
                    resolution: Some(format!("agent did not complete: {e}")),
                    exit_code: -1,
                    ..AgentOutcome::default()
                }
            }
        };
        tracing::info!(
            reported_success = ?outcome.success,
            cost_usd = outcome.cost_usd,
            turns = outcome.turns,
            elapsed_secs = started.elapsed().as_secs(),
            "repair agent finished"
        );

        cycle.enter(CycleState::Verifying);
        tokio::time::sleep(self.settings.verify_delay()).await;
        let healthy = self.probe.probe().await.is_healthy();
        let status = if healthy {
            RepairStatus::Success
        } else {
            RepairStatus::Failed
        };
        // The outcome is notified even when it cannot be recorded.
        let recorded = ledger.record_complete(
            guard,
            &id,
            Completion {
                status,
                cost_usd: outcome.cost_usd,
                turns: outcome.turns,
                resolution: outcome.resolution.clone(),
            },
        );
        if let Err(e) = &recorded {
            tracing::error!(id = %id, error = %e, "could not record repair outcome");
        }

        let summary = outcome
            .resolution
            .as_deref()
            .unwrap_or("no summary from agent");
        if healthy {
            tracing::info!(fingerprint = %fingerprint, "gateway recovered after agent repair");
            self.notifier
                .notify(
                    NotifyEvent::Success,
                    &format!(
                        "{} gateway recovered ({fingerprint}, ${:.2}, {} turns): {summary}",
                        self.settings.app_name, outcome.cost_usd, outcome.turns
                    ),
                )
                .await;
            recorded?;
            Ok(cycle.finish(
                CycleState::Resolved,
                CycleOutcome::Resolved {
                    repair_type: RepairType::Agent,
                    attempt_id: id,
                },
            ))
        } else {
            tracing::error!(fingerprint = %fingerprint, "gateway still down after repair; needs attention");
            self.notifier
                .notify(
                    NotifyEvent::Failure,
                    &format!(
                        "{} gateway repair FAILED ({fingerprint}); manual attention needed: {summary}",
                        self.settings.app_name
                    ),
                )
                .await;
            recorded?;
            Ok(cycle.finish(CycleState::Unresolved, CycleOutcome::Unresolved { attempt_id: id }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentError;
    use crate::ledger::RepairRecord;
    use crate::probe::ProbeOutcome;
    use crate::service::ServiceError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Returns scripted results, repeating the last one when exhausted.
    struct ScriptedProbe {
        script: Mutex<VecDeque<bool>>,
        last: Mutex<bool>,
    }

    impl ScriptedProbe {
        fn new(script: &[bool]) -> Self {
            Self {
                script: Mutex::new(script.iter().copied().collect()),
                last: Mutex::new(true),
            }
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self) -> ProbeOutcome {
            let next = self.script.lock().unwrap().pop_front();
            let healthy = match next {
                Some(v) => {
                    *self.last.lock().unwrap() = v;
                    v
                }
                None => *self.last.lock().unwrap(),
            };
            if healthy {
                ProbeOutcome::Healthy
            } else {
                ProbeOutcome::Unhealthy("connection refused".to_string())
            }
        }
    }

    struct FixedDiagnostics {
        output: String,
        exit_code: i32,
    }

    #[async_trait]
    impl Diagnostics for FixedDiagnostics {
        async fn run_doctor(&self) -> DiagnosticReport {
            DiagnosticReport {
                exit_code: self.exit_code,
                output: self.output.clone(),
            }
        }

        async fn process_list(&self) -> String {
            "PID PPID ELAPSED COMMAND".to_string()
        }

        async fn port_snapshot(&self, port: Option<u16>) -> String {
            format!("nothing listening on port {}", port.unwrap_or_default())
        }
    }

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

    #[derive(Default)]
    struct RecordingAgent {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RepairAgent for RecordingAgent {
        async fn run(&self, prompt: &str) -> Result<AgentOutcome, AgentError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(AgentOutcome {
                success: Some(true),
                cost_usd: 0.75,
                turns: 9,
                resolution: Some("freed the port".to_string()),
                exit_code: 0,
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(NotifyEvent, String)>>,
    }

    #[async_trait]
    impl Notify for RecordingNotifier {
        async fn notify(&self, event: NotifyEvent, message: &str) {
            self.sent.lock().unwrap().push((event, message.to_string()));
        }
    }

    struct Harness {
        dir: TempDir,
        settings: Arc<Settings>,
        service: Arc<CountingService>,
        agent: Arc<RecordingAgent>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let app_home = dir.path().join("app");
            std::fs::create_dir_all(&app_home).unwrap();
            let settings = Settings {
                confirm_delay_secs: 0,
                verify_delay_secs: 0,
                max_turns: 7,
                app_config_file: app_home.join("openclaw.json"),
                app_home,
                state_dir: dir.path().to_path_buf(),
                ..Settings::default()
            };
            Self {
                dir,
                settings: Arc::new(settings),
                service: Arc::default(),
                agent: Arc::default(),
                notifier: Arc::default(),
            }
        }

        fn orchestrator(&self, probes: &[bool], doctor_output: &str) -> Orchestrator {
            self.orchestrator_with_agent(probes, doctor_output, self.agent.clone())
        }

        fn orchestrator_with_agent(
            &self,
            probes: &[bool],
            doctor_output: &str,
            agent: Arc<dyn RepairAgent>,
        ) -> Orchestrator {
            Orchestrator::new(
                self.settings.clone(),
                Collaborators {
                    probe: Arc::new(ScriptedProbe::new(probes)),
                    diagnostics: Arc::new(FixedDiagnostics {
                        output: doctor_output.to_string(),
                        exit_code: 1,
                    }),
                    service: self.service.clone(),
                    agent,
                    notifier: self.notifier.clone(),
                },
            )
        }

        fn records(&self) -> Vec<RepairRecord> {
            let ledger = RepairLedger::open(self.settings.repair_ledger_path()).unwrap();
            ledger.recent(usize::MAX).into_iter().rev().cloned().collect()
        }

        fn events(&self) -> Vec<NotifyEvent> {
            self.notifier.sent.lock().unwrap().iter().map(|(e, _)| *e).collect()
        }
    }

    #[tokio::test]
    async fn healthy_gateway_is_a_no_op() {
        let h = Harness::new();
        let report = h.orchestrator(&[true], "").run_cycle().await.unwrap();

        assert_eq!(report.outcome, CycleOutcome::Healthy);
        assert_eq!(
            report.states,
            vec![CycleState::Idle, CycleState::Probing, CycleState::Idle]
        );
        assert!(h.records().is_empty());
    }

    #[tokio::test]
    async fn transient_failure_leaves_no_trace() {
        let h = Harness::new();
        let report = h
            .orchestrator(&[false, true], "connect ECONNREFUSED")
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.outcome, CycleOutcome::Transient);
        assert_eq!(report.states.last(), Some(&CycleState::Idle));
        assert!(h.records().is_empty());
        assert!(h.events().is_empty());
        assert_eq!(h.service.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stopped_gateway_is_fixed_by_restart() {
        let h = Harness::new();
        let report = h
            .orchestrator(&[false, false, true], "gateway not running")
            .run_cycle()
            .await
            .unwrap();

        assert!(matches!(
            report.outcome,
            CycleOutcome::Resolved {
                repair_type: RepairType::AutoFix,
                ..
            }
        ));
        assert_eq!(report.fingerprint.as_deref(), Some("gateway_not_running"));
        assert_eq!(h.service.restarts.load(Ordering::SeqCst), 1);
        assert!(h.agent.prompts.lock().unwrap().is_empty());

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].repair_type, RepairType::AutoFix);
        assert_eq!(records[0].status, RepairStatus::Success);
        assert_eq!(records[0].cost_usd, 0.0);
        assert_eq!(h.events(), vec![NotifyEvent::Start, NotifyEvent::Success]);
        assert!(!h.settings.lock_dir().join("health.lock").exists());
    }

    #[tokio::test]
    async fn failed_auto_fix_falls_through_to_agent() {
        let h = Harness::new();
        let report = h
            .orchestrator(&[false, false, false, true], "gateway not running")
            .run_cycle()
            .await
            .unwrap();

        assert!(matches!(
            report.outcome,
            CycleOutcome::Resolved {
                repair_type: RepairType::Agent,
                ..
            }
        ));
        let records = h.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].repair_type, RepairType::AutoFix);
        assert_eq!(records[0].status, RepairStatus::Failed);
        assert_eq!(records[1].repair_type, RepairType::Agent);
        assert_eq!(records[1].status, RepairStatus::Success);
    }

    #[tokio::test]
    async fn unknown_failure_escalates_to_agent() {
        let h = Harness::new();
        let report = h
            .orchestrator(&[false, false, true], "plugin crashed: segfault")
            .run_cycle()
            .await
            .unwrap();

        assert_eq!(report.fingerprint.as_deref(), Some("doctor_exit_1"));
        assert!(report.states.contains(&CycleState::EscalatingAgent));
        assert_eq!(report.exit_code(), 0);

        let prompts = h.agent.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("plugin crashed: segfault"));

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, RepairStatus::Success);
        assert_eq!(records[0].turns, 9);
        assert_eq!(records[0].cost_usd, 0.75);
        assert_eq!(records[0].resolution.as_deref(), Some("freed the port"));
    }

    #[tokio::test]
    async fn unresolved_repair_is_recorded_and_notified() {
        let h = Harness::new();
        let report = h
            .orchestrator(&[false], "plugin crashed: segfault")
            .run_cycle()
            .await
            .unwrap();

        assert!(matches!(report.outcome, CycleOutcome::Unresolved { .. }));
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.states.last(), Some(&CycleState::Unresolved));
        assert_eq!(h.records()[0].status, RepairStatus::Failed);
        assert_eq!(h.events(), vec![NotifyEvent::Start, NotifyEvent::Failure]);
        assert!(!h.settings.lock_dir().join("health.lock").exists());
    }

    /// Makes the ledger unwritable while the repair runs.
    struct LedgerBreakingAgent {
        ledger: PathBuf,
    }

    #[async_trait]
    impl RepairAgent for LedgerBreakingAgent {
        async fn run(&self, _prompt: &str) -> Result<AgentOutcome, AgentError> {
            std::fs::remove_file(&self.ledger).unwrap();
            std::fs::create_dir(&self.ledger).unwrap();
            Ok(AgentOutcome::default())
        }
    }

    #[tokio::test]
    async fn failure_is_notified_even_when_the_ledger_write_fails() {
        let h = Harness::new();
        let agent = Arc::new(LedgerBreakingAgent {
            ledger: h.settings.repair_ledger_path(),
        });
        let result = h
            .orchestrator_with_agent(&[false], "plugin crashed", agent)
            .run_cycle()
            .await;

        assert!(matches!(result, Err(OrchestratorError::Ledger(_))));
        assert_eq!(h.events(), vec![NotifyEvent::Start, NotifyEvent::Failure]);
        assert!(!h.settings.lock_dir().join("health.lock").exists());
    }

    #[tokio::test]
    async fn busy_lock_ends_cycle_quietly() {
        let h = Harness::new();
        let locks = LockManager::new(h.settings.lock_dir(), h.settings.lock_staleness());
        let _held = locks.try_acquire(LockName::Health).unwrap();

        let report = h
            .orchestrator(&[false], "gateway not running")
            .run_cycle()
            .await
            .unwrap();
        assert_eq!(report.outcome, CycleOutcome::LockBusy);
        assert_eq!(report.exit_code(), 0);
        assert!(h.records().is_empty());
        assert!(h.events().is_empty());
    }

    #[tokio::test]
    async fn earlier_attempts_are_mentioned_in_prompt() {
        let h = Harness::new();
        for _ in 0..2 {
            h.orchestrator(&[false], "plugin crashed")
                .run_cycle()
                .await
                .unwrap();
        }
        let prompts = h.agent.prompts.lock().unwrap();
        assert!(prompts[0].contains("first repair attempt"));
        assert!(prompts[1].contains("1 earlier repair attempt(s)"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn agent_reads_prompt_from_stdin_with_turn_ceiling() {
        let h = Harness::new();
        let script = h.dir.path().join("agent.sh");
        let args_file = h.dir.path().join("args.txt");
        let stdin_file = h.dir.path().join("stdin.txt");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho \"$@\" > {}\ncat > {}\necho '{{\"is_error\":false,\"total_cost_usd\":0.1,\"num_turns\":4,\"result\":\"ok\"}}'\n",
                args_file.display(),
                stdin_file.display()
            ),
        )
        .unwrap();
        let agent_settings = Settings {
            agent_command: format!("sh {}", script.display()),
            ..(*h.settings).clone()
        };
        let agent = Arc::new(CliRepairAgent::new(AgentConfig::from_settings(&agent_settings)));

        let report = h
            .orchestrator_with_agent(&[false, false, true], "plugin crashed: segfault", agent)
            .run_cycle()
            .await
            .unwrap();
        assert!(matches!(report.outcome, CycleOutcome::Resolved { .. }));

        let args = std::fs::read_to_string(&args_file).unwrap();
        assert!(args.contains("--max-turns 7"), "{args}");
        assert!(!args.contains("segfault"), "prompt leaked into argv: {args}");
        let stdin = std::fs::read_to_string(&stdin_file).unwrap();
        assert!(stdin.contains("plugin crashed: segfault"));

        let records = h.records();
        assert_eq!(records[0].turns, 4);
        assert_eq!(records[0].status, RepairStatus::Success);
    }
}
