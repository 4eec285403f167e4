//! Running configured command lines as child processes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command line is empty")]
    Empty,

    #[error("command line has unbalanced quoting: {0}")]
    Unparseable(String),

    #[error("`{program}` was not found on PATH")]
    NotFound { program: String },

    #[error("failed to run `{program}`: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("`{program}` did not finish within {}s", .timeout.as_secs())]
    Timeout { program: String, timeout: Duration },
}

/// What the child reads on stdin.
#[derive(Debug, Clone, Default)]
pub enum StdinSource {
    #[default]
    Null,
    Bytes(Vec<u8>),
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `-1` when the child was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, the way a terminal would show them.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let sep = if self.stdout.ends_with('\n') { "" } else { "\n" };
                format!("{}{sep}{}", self.stdout, self.stderr)
            }
        }
    }
}

/// Split a configured command line into argv with shell quoting rules.
pub fn split_command(line: &str) -> Result<Vec<String>, CommandError> {
    let argv = shlex::split(line).ok_or_else(|| CommandError::Unparseable(line.to_string()))?;
    if argv.is_empty() {
        return Err(CommandError::Empty);
    }
    Ok(argv)
}

/// Run `argv` to completion, capturing output.
///
/// With a timeout the child is killed when the limit passes.
pub async fn run(
    argv: &[String],
    stdin: StdinSource,
    timeout: Option<Duration>,
) -> Result<CommandOutput, CommandError> {
    let (program, args) = argv.split_first().ok_or(CommandError::Empty)?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut bytes = None;
    match stdin {
        StdinSource::Null => {
            cmd.stdin(Stdio::null());
        }
        StdinSource::Bytes(b) => {
            cmd.stdin(Stdio::piped());
            bytes = Some(b);
        }
        StdinSource::File(path) => {
            let file = std::fs::File::open(&path).map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;
            cmd.stdin(Stdio::from(file));
        }
    }

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            CommandError::NotFound {
                program: program.clone(),
            }
        } else {
            CommandError::Spawn {
                program: program.clone(),
                source: e,
            }
        }
    })?;

    let pipe = child.stdin.take();
    let feed = async move {
        if let (Some(mut pipe), Some(bytes)) = (pipe, bytes) {
            // The child may exit without reading; a broken pipe is not fatal.
            if let Err(e) = pipe.write_all(&bytes).await {
                tracing::debug!(error = %e, "child closed stdin early");
            }
            let _ = pipe.shutdown().await;
        }
    };
    let finished = async {
        let ((), output) = tokio::join!(feed, child.wait_with_output());
        output
    };

    let output = match timeout {
        Some(limit) => tokio::time::timeout(limit, finished)
            .await
            .map_err(|_| CommandError::Timeout {
                program: program.clone(),
                timeout: limit,
            })?,
        None => finished.await,
    }
    .map_err(|source| CommandError::Spawn {
        program: program.clone(),
        source,
    })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
