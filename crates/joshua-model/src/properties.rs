//! Ensemble properties: the immutable key-value mapping written at
//! creation, plus the `stopped` marker recorded at stop/retirement time.
//!
//! Properties are stored one key per entry so partial reads stay cheap;
//! values are UTF-8 scalars. Decoding is permissive: unrecognized keys
//! are preserved verbatim and malformed numerics fall back to defaults,
//! because agents must keep scheduling even when a client writes a
//! property this build does not understand.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const PROP_MAX_RUNS: &str = "max_runs";
pub const PROP_FAIL_FAST: &str = "fail_fast";
pub const PROP_TIMEOUT: &str = "timeout";
pub const PROP_PRIORITY: &str = "priority";
pub const PROP_SANITY: &str = "sanity";
pub const PROP_USERNAME: &str = "username";
pub const PROP_SUBMITTED: &str = "submitted";
pub const PROP_COMPRESSED: &str = "compressed";
pub const PROP_USER_PRIORITY: &str = "username_tagged_priority";
pub const PROP_ENV: &str = "env";
pub const PROP_STOPPED: &str = "stopped";

pub const DEFAULT_PRIORITY: i64 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsembleProperties {
    /// Terminal when `ended >= max_runs`; 0 means unbounded.
    pub max_runs: u64,
    /// Terminal when `fail >= fail_fast`; 0 disables.
    pub fail_fast: u64,
    /// Per-run wall-clock limit in seconds.
    pub timeout: Option<u64>,
    /// Scheduling weight; non-positive makes the ensemble ineligible.
    pub priority: i64,
    /// Excluded from the default active listing; scheduled from the
    /// sanity index instead.
    pub sanity: bool,
    pub username: Option<String>,
    pub submitted: Option<DateTime<Utc>>,
    /// Whether package chunks and result outputs are stored compressed.
    pub compressed: bool,
    /// Per-user priority override; when present it replaces `priority`.
    pub username_tagged_priority: Option<i64>,
    /// Extra environment for the test process, `NAME=VALUE:NAME=VALUE`.
    pub env: BTreeMap<String, String>,
    /// Set when the ensemble was stopped or retired.
    pub stopped: Option<DateTime<Utc>>,
    /// Unrecognized properties, preserved verbatim.
    pub extra: BTreeMap<String, String>,
}

impl Default for EnsembleProperties {
    fn default() -> Self {
        Self {
            max_runs: 0,
            fail_fast: 0,
            timeout: None,
            priority: DEFAULT_PRIORITY,
            sanity: false,
            username: None,
            submitted: None,
            compressed: false,
            username_tagged_priority: None,
            env: BTreeMap::new(),
            stopped: None,
            extra: BTreeMap::new(),
        }
    }
}

impl EnsembleProperties {
    /// The weight the scheduler uses: the per-user override when present,
    /// otherwise `priority`.
    pub fn effective_priority(&self) -> i64 {
        self.username_tagged_priority.unwrap_or(self.priority)
    }

    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if self.max_runs != 0 {
            pairs.push((PROP_MAX_RUNS.into(), self.max_runs.to_string()));
        }
        if self.fail_fast != 0 {
            pairs.push((PROP_FAIL_FAST.into(), self.fail_fast.to_string()));
        }
        if let Some(timeout) = self.timeout {
            pairs.push((PROP_TIMEOUT.into(), timeout.to_string()));
        }
        if self.priority != DEFAULT_PRIORITY {
            pairs.push((PROP_PRIORITY.into(), self.priority.to_string()));
        }
        if self.sanity {
            pairs.push((PROP_SANITY.into(), "true".into()));
        }
        if let Some(username) = &self.username {
            pairs.push((PROP_USERNAME.into(), username.clone()));
        }
        if let Some(submitted) = self.submitted {
            pairs.push((PROP_SUBMITTED.into(), submitted.to_rfc3339()));
        }
        if self.compressed {
            pairs.push((PROP_COMPRESSED.into(), "true".into()));
        }
        if let Some(override_priority) = self.username_tagged_priority {
            pairs.push((PROP_USER_PRIORITY.into(), override_priority.to_string()));
        }
        if !self.env.is_empty() {
            let joined: Vec<String> = self
                .env
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            pairs.push((PROP_ENV.into(), joined.join(":")));
        }
        if let Some(stopped) = self.stopped {
            pairs.push((PROP_STOPPED.into(), stopped.to_rfc3339()));
        }
        for (name, value) in &self.extra {
            pairs.push((name.clone(), value.clone()));
        }
        pairs
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut props = Self::default();
        for (name, value) in pairs {
            let value = value.as_ref();
            match name.as_ref() {
                PROP_MAX_RUNS => props.max_runs = value.parse().unwrap_or(0),
                PROP_FAIL_FAST => props.fail_fast = value.parse().unwrap_or(0),
                PROP_TIMEOUT => props.timeout = value.parse().ok(),
                PROP_PRIORITY => {
                    props.priority = value.parse().unwrap_or(DEFAULT_PRIORITY);
                }
                PROP_SANITY => props.sanity = value == "true",
                PROP_USERNAME => props.username = Some(value.to_string()),
                PROP_SUBMITTED => {
                    props.submitted = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                PROP_COMPRESSED => props.compressed = value == "true",
                PROP_USER_PRIORITY => props.username_tagged_priority = value.parse().ok(),
                PROP_ENV => {
                    for entry in value.split(':') {
                        if let Some((name, value)) = entry.split_once('=') {
                            props.env.insert(name.to_string(), value.to_string());
                        }
                    }
                }
                PROP_STOPPED => {
                    props.stopped = DateTime::parse_from_rfc3339(value)
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                other => {
                    props.extra.insert(other.to_string(), value.to_string());
                }
            }
        }
        props
    }
}

/// Identity used when submitting or filtering ensembles: `JOSHUA_USER`
/// when set, otherwise the OS login name.
pub fn submitting_username() -> String {
    std::env::var("JOSHUA_USER")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}
