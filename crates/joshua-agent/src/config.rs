//! Agent configuration and identity.

use std::path::PathBuf;
use std::time::Duration;

/// How long discovery blocks on the index watch before re-polling.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub cluster_file: PathBuf,
    pub work_dir: PathBuf,
    /// Exit 0 after this much continuous emptiness; `None` never exits.
    pub idle_timeout: Option<Duration>,
    /// Schedule from the sanity index instead of the active index.
    pub sanity: bool,
    /// Retain the working directory of failed runs.
    pub keep_failed: bool,
    pub poll_interval: Duration,
    /// Whether this process is a registered child subreaper.
    pub reap_orphans: bool,
}

impl AgentConfig {
    pub fn new(cluster_file: PathBuf, work_dir: PathBuf) -> Self {
        Self {
            cluster_file,
            work_dir,
            idle_timeout: None,
            sanity: false,
            keep_failed: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            reap_orphans: false,
        }
    }
}

/// Identity reported in logs and the failure log. Container platforms
/// inject an instance id; plain hosts fall back to `HOSTNAME`.
pub fn hostname() -> String {
    std::env::var("PLATFORM_SHORT_INSTANCE_ID")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}
