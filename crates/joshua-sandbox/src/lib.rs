//! Per-run subprocess sandbox.
//!
//! Given a package blob, a command name, and a timeout, produce
//! (exit class, elapsed, captured output) with no leaked processes,
//! files, or descriptors. Test-visible failures become `fail` results;
//! only environmental faults (cannot create the run directory, cannot
//! materialise the package, cannot spawn at all) surface as errors,
//! and those kill the agent so the orchestrator restarts it clean.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod reaper;
pub mod runner;
pub mod workspace;

pub use reaper::become_subreaper;
pub use runner::{run_test, RunOutcome, RunSpec};
pub use workspace::RunWorkspace;

/// Default cap on captured output.
pub const OUTPUT_CAP: usize = 10 * 1024 * 1024;

/// Grace between SIGTERM and SIGKILL when tearing a run down.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Name of the executable a test package must provide at its top level.
pub const TEST_COMMAND: &str = "joshua_test";

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to prepare run directory {path}: {source}")]
    Workspace {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to materialise package: {0}")]
    Materialise(String),
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: PathBuf,
        source: std::io::Error,
    },
    #[error("descendants survived cleanup: {0}")]
    Cleanup(String),
    #[error("i/o error while supervising the test: {0}")]
    Io(#[from] std::io::Error),
}
