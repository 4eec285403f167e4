//! The external repair agent: prompt assembly, invocation and result parsing.
//!
//! The agent is an opaque subprocess. It gets a turn ceiling, a spend ceiling
//! and a tool allow-list on its command line, reads the prompt on stdin and
//! prints a JSON result object as its last stdout line.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use warden_utils_string::{head_tail_lines, truncate_with_marker};

use crate::process::{self, CommandError, StdinSource};

/// Longest resolution summary kept from the agent's result.
pub const MAX_RESOLUTION_BYTES: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("failed to stage the repair prompt: {0}")]
    Prompt(#[from] std::io::Error),
}

/// What the agent reported about its own run.
///
/// Every field is tolerant of a missing or malformed result: success stays
/// unknown, cost and turns default to zero.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutcome {
    pub success: Option<bool>,
    pub cost_usd: f64,
    pub turns: u32,
    pub resolution: Option<String>,
    pub exit_code: i32,
}

#[async_trait]
pub trait RepairAgent: Send + Sync {
    async fn run(&self, prompt: &str) -> Result<AgentOutcome, AgentError>;
}

/// Evidence handed to the agent.
#[derive(Debug, Clone, Default)]
pub struct RepairContext {
    pub app_name: String,
    pub gateway_url: String,
    pub fingerprint: String,
    pub diagnostic_exit: i32,
    pub diagnostic_output: String,
    pub process_list: String,
    pub port_snapshot: String,
    /// Attempts for the same fingerprint inside the recent window.
    pub recent_attempts: usize,
    pub max_lines: usize,
}

pub fn build_prompt(ctx: &RepairContext) -> String {
    let diagnostics = head_tail_lines(&ctx.diagnostic_output, ctx.max_lines);
    let history = match ctx.recent_attempts {
        0 => "This is the first repair attempt for this issue in the last hour.".to_string(),
        n => format!(
            "There have been {n} earlier repair attempt(s) for this issue in the last hour. \
             Previous fixes did not hold; look for a root cause rather than repeating them."
        ),
    };

    format!(
        "# {app} gateway repair\n\n\
         The {app} gateway at {url} failed two consecutive health checks.\n\n\
         Issue fingerprint: `{fingerprint}`\n\
         {history}\n\n\
         ## Diagnostic command output (exit code {exit})\n\n\
         ```\n{diagnostics}\n```\n\n\
         ## Processes\n\n\
         ```\n{processes}\n```\n\n\
         ## Port\n\n\
         ```\n{ports}\n```\n\n\
         ## Instructions\n\n\
         - Find and fix the cause so the gateway answers health checks again.\n\
         - Make the smallest change that restores service. Back up any file before editing it.\n\
         - Do not delete user data, credentials or sessions.\n\
         - Finish with a one-paragraph summary of what you changed.\n",
        app = ctx.app_name,
        url = ctx.gateway_url,
        fingerprint = ctx.fingerprint,
        exit = ctx.diagnostic_exit,
        processes = ctx.process_list.trim_end(),
        ports = ctx.port_snapshot.trim_end(),
    )
}

/// Command-line flags for one agent run.
pub fn build_args(max_turns: u32, max_budget_usd: f64, allowed_tools: &[String]) -> Vec<String> {
    let mut args = vec![
        "-p".to_string(),
        "--output-format".to_string(),
        "json".to_string(),
        "--max-turns".to_string(),
        max_turns.to_string(),
        "--max-budget-usd".to_string(),
        format!("{max_budget_usd:.2}"),
    ];
    if !allowed_tools.is_empty() {
        args.push("--allowedTools".to_string());
        args.push(allowed_tools.join(","));
    }
    args
}

/// Parse the last JSON object printed on stdout.
pub fn parse_output(stdout: &str, exit_code: i32) -> AgentOutcome {
    let mut outcome = AgentOutcome {
        exit_code,
        ..AgentOutcome::default()
    };

    let Some(result) = last_json_object(stdout) else {
        tracing::warn!(exit_code, "agent printed no JSON result");
        return outcome;
    };

    outcome.success = result
        .get("is_error")
        .and_then(Value::as_bool)
        .map(|is_error| !is_error);
    outcome.cost_usd = result
        .get("total_cost_usd")
        .and_then(Value::as_f64)
        .filter(|cost| cost.is_finite() && *cost >= 0.0)
        .unwrap_or(0.0);
    outcome.turns = result
        .get("num_turns")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);
    outcome.resolution = result
        .get("result")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| truncate_with_marker(s, MAX_RESOLUTION_BYTES).into_owned());
    outcome
}

fn last_json_object(stdout: &str) -> Option<Value> {
    let from_lines = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok().filter(Value::is_object));
    from_lines.or_else(|| {
        serde_json::from_str::<Value>(stdout.trim())
            .ok()
            .filter(Value::is_object)
    })
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub command: String,
    pub max_turns: u32,
    pub max_budget_usd: f64,
    pub allowed_tools: Vec<String>,
    pub timeout: Option<Duration>,
    /// Where prompt files are staged while the agent runs.
    pub prompt_dir: PathBuf,
}

impl AgentConfig {
    pub fn from_settings(settings: &crate::config::Settings) -> Self {
        Self {
            command: settings.agent_command.clone(),
            max_turns: settings.max_turns,
            max_budget_usd: settings.max_budget_usd,
            allowed_tools: settings.allowed_tools.clone(),
            timeout: settings.agent_timeout(),
            prompt_dir: settings.prompt_dir(),
        }
    }
}

/// Runs the configured agent command.
#[derive(Debug, Clone)]
pub struct CliRepairAgent {
    config: AgentConfig,
}

impl CliRepairAgent {
    pub fn new(config: AgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RepairAgent for CliRepairAgent {
    async fn run(&self, prompt: &str) -> Result<AgentOutcome, AgentError> {
        std::fs::create_dir_all(&self.config.prompt_dir)?;
        let mut prompt_file = tempfile::Builder::new()
            .prefix("repair-prompt-")
            .suffix(".md")
            .tempfile_in(&self.config.prompt_dir)?;
        std::io::Write::write_all(&mut prompt_file, prompt.as_bytes())?;
        prompt_file.as_file().sync_all()?;

        let mut argv = process::split_command(&self.config.command)?;
        argv.extend(build_args(
            self.config.max_turns,
            self.config.max_budget_usd,
            &self.config.allowed_tools,
        ));

        tracing::info!(
            command = %self.config.command,
            max_turns = self.config.max_turns,
            max_budget_usd = self.config.max_budget_usd,
            timeout_secs = self.config.timeout.map(|t| t.as_secs()),
            prompt_bytes = prompt.len(),
            "invoking repair agent"
        );

        let out = process::run(
            &argv,
            StdinSource::File(prompt_file.path().to_path_buf()),
            self.config.timeout,
        )
        .await?;

        if !out.success() {
            tracing::warn!(
                exit_code = out.exit_code,
                stderr = %truncate_with_marker(out.stderr.trim(), 2000),
                "repair agent exited with an error"
            );
        }
        Ok(parse_output(&out.stdout, out.exit_code))
    }
}
