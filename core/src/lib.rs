//! Root of the `warden-core` library: the health-check and repair engine.

// Library code reports through tracing; only the CLI writes to the terminal.
#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod agent;
pub mod autofix;
pub mod config;
pub mod diagnostics;
pub mod fingerprint;
pub mod jsonl;
pub mod ledger;
pub mod lock;
pub mod logs;
pub mod notify;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod service;

pub use config::{ConfigLoader, Settings};
pub use lock::{LockError, LockGuard, LockManager, LockName};
pub use orchestrator::{Collaborators, CycleOutcome, CycleReport, Orchestrator};
