//! Ensemble data model and the transactional operations over it.
//!
//! This crate is the published surface between clients that submit
//! ensembles, the agents that run them, and the autoscaler that sizes
//! the fleet. Everything coordinates through the KV layout in
//! [schema::Layout]; no component holds a lock or a lease, and every
//! multi-key update is a single transaction.

mod codec;
mod retry;

pub mod counters;
pub mod ensemble;
pub mod error;
pub mod failures;
pub mod properties;
pub mod results;
pub mod scale;
pub mod schema;

pub use counters::{EnsembleCounters, COUNTER_NAMES, LONG_RUN_SECS};
pub use ensemble::{
    acquire_run, create, delete, list, read_package, resume, stop, stop_username,
    EnsembleSummary, ListFilter, PreparedRun, SortOrder,
};
pub use error::ModelError;
pub use failures::{agent_failures, log_agent_failure, AgentFailure};
pub use properties::{submitting_username, EnsembleProperties, DEFAULT_PRIORITY};
pub use results::{
    submit_result, CompletedRun, ExitClass, ReportOutcome, ResultRow, ResultTail, TailMode,
};
pub use scale::{desired_agents, queue_depth};
pub use schema::{EnsembleId, IndexKind, Layout, RunToken, CHUNK_BYTES, UPLOAD_TXN_BYTES};
