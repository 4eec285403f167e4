//! Restarting the monitored service.

use std::time::Duration;

use async_trait::async_trait;

use crate::process::{self, CommandError, StdinSource};

const RESTART_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("restart command exited with {exit_code}: {output}")]
    Failed { exit_code: i32, output: String },
}

#[async_trait]
pub trait ServiceManager: Send + Sync {
    async fn restart(&self) -> Result<(), ServiceError>;
}

/// Restarts the service with the configured command line.
#[derive(Debug, Clone)]
pub struct CommandServiceManager {
    restart_command: String,
}

impl CommandServiceManager {
    pub fn new(restart_command: impl Into<String>) -> Self {
        Self {
            restart_command: restart_command.into(),
        }
    }
}

#[async_trait]
impl ServiceManager for CommandServiceManager {
    async fn restart(&self) -> Result<(), ServiceError> {
        let argv = process::split_command(&self.restart_command)?;
        tracing::info!(command = %self.restart_command, "restarting service");
        let out = process::run(&argv, StdinSource::Null, Some(RESTART_TIMEOUT)).await?;
        if out.success() {
            Ok(())
        } else {
            Err(ServiceError::Failed {
                exit_code: out.exit_code,
                output: out.combined().trim().to_string(),
            })
        }
    }
}
