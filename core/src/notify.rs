//! Best-effort operator notifications through a configured command.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::{NotifyMethod, Settings};
use crate::process::{self, StdinSource};

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyEvent {
    Start,
    Success,
    Failure,
}

impl NotifyEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyEvent::Start => "start",
            NotifyEvent::Success => "success",
            NotifyEvent::Failure => "failure",
        }
    }
}

/// Never fails: delivery problems are logged and swallowed.
#[async_trait]
pub trait Notify: Send + Sync {
    async fn notify(&self, event: NotifyEvent, message: &str);
}

#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: String,
    method: NotifyMethod,
    on_start: bool,
    on_success: bool,
    on_failure: bool,
}

impl CommandNotifier {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            command: settings.notify_command.clone(),
            method: settings.notify_method,
            on_start: settings.notify_on_start,
            on_success: settings.notify_on_success,
            on_failure: settings.notify_on_failure,
        }
    }

    fn enabled(&self, event: NotifyEvent) -> bool {
        if self.command.trim().is_empty() {
            return false;
        }
        match event {
            NotifyEvent::Start => self.on_start,
            NotifyEvent::Success => self.on_success,
            NotifyEvent::Failure => self.on_failure,
        }
    }
}

#[async_trait]
impl Notify for CommandNotifier {
    async fn notify(&self, event: NotifyEvent, message: &str) {
        if !self.enabled(event) {
            tracing::debug!(event = event.as_str(), "notification suppressed");
            return;
        }

        let mut argv = match process::split_command(&self.command) {
            Ok(argv) => argv,
            Err(e) => {
                tracing::warn!(error = %e, "notify_command is unusable");
                return;
            }
        };
        let stdin = match self.method {
            NotifyMethod::Arg => {
                argv.push(message.to_string());
                StdinSource::Null
            }
            NotifyMethod::Stdin => StdinSource::Bytes(message.as_bytes().to_vec()),
        };

        match process::run(&argv, stdin, Some(NOTIFY_TIMEOUT)).await {
            Ok(out) if out.success() => {
                tracing::debug!(event = event.as_str(), "notification sent");
            }
            Ok(out) => tracing::warn!(
                event = event.as_str(),
                exit_code = out.exit_code,
                output = %out.combined().trim(),
                "notification command failed"
            ),
            Err(e) => tracing::warn!(event = event.as_str(), error = %e, "notification not sent"),
        }
    }
}
