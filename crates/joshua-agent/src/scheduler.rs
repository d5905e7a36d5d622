//! The agent control loop.
//!
//! Idle → Discovering → Selecting → Preparing → Running → Reporting,
//! with retirement folded into the reporting transaction. The agent
//! holds no lock and no lease: several agents racing one ensemble is
//! expected, and every step tolerates the ensemble disappearing under
//! it. Fatal errors terminate the loop; the orchestrator restarts the
//! process.

use std::time::{Duration, Instant};

use joshua_kv::Database;
use joshua_model::{
    acquire_run, list, log_agent_failure, submit_result, CompletedRun, EnsembleProperties,
    ExitClass, IndexKind, Layout, ListFilter, ModelError, PreparedRun,
};
use joshua_sandbox::{run_test, RunOutcome, RunSpec, RunWorkspace, SandboxError, TEST_COMMAND};
use rand::rngs::StdRng;
use rand::SeedableRng;
use thiserror::Error;
use tokio::sync::watch;

use crate::config::{hostname, AgentConfig};
use crate::selection::{choose_weighted, Candidate};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("agent initialisation failed: {0}")]
    Init(String),
}

/// Why the loop ended without error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The active index stayed empty past the idle timeout.
    IdleTimeout,
    /// The shutdown signal was raised.
    Shutdown,
}

pub struct Agent<D: Database> {
    db: D,
    layout: Layout,
    config: AgentConfig,
    shutdown: watch::Receiver<bool>,
    rng: StdRng,
}

impl<D: Database> Agent<D> {
    pub fn new(db: D, layout: Layout, config: AgentConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            db,
            layout,
            config,
            shutdown,
            rng: StdRng::from_entropy(),
        }
    }

    /// Runs the loop until idle timeout or shutdown. Errors are fatal.
    pub async fn run(&mut self) -> Result<ExitReason, AgentError> {
        tokio::fs::create_dir_all(self.config.work_dir.join("runs"))
            .await
            .map_err(|e| {
                AgentError::Init(format!(
                    "cannot create work directory {}: {e}",
                    self.config.work_dir.display()
                ))
            })?;
        let kind = IndexKind::for_sanity(self.config.sanity);
        tracing::info!(
            work_dir = %self.config.work_dir.display(),
            sanity = self.config.sanity,
            "agent entering scheduling loop"
        );

        let mut idle_since = Instant::now();
        loop {
            if *self.shutdown.borrow() {
                return Ok(ExitReason::Shutdown);
            }

            let candidates = self.discover(kind).await?;
            let Some(chosen) = choose_weighted(&mut self.rng, &candidates) else {
                if let Some(limit) = self.config.idle_timeout {
                    if idle_since.elapsed() >= limit {
                        tracing::info!(idle_secs = limit.as_secs(), "idle timeout reached");
                        return Ok(ExitReason::IdleTimeout);
                    }
                }
                self.wait_for_index_change(kind).await;
                continue;
            };

            let Some(prepared) = acquire_run(&self.db, &self.layout, chosen, kind).await? else {
                // Retired between selection and prepare; nothing wasted.
                continue;
            };

            tracing::info!(ensemble = %prepared.id, "running ensemble");
            let outcome = self.execute(&prepared).await?;
            if outcome.cancelled {
                tracing::info!(ensemble = %prepared.id, "run cancelled by shutdown");
                return Ok(ExitReason::Shutdown);
            }

            let report = submit_result(
                &self.db,
                &self.layout,
                prepared.id,
                &CompletedRun {
                    class: outcome.class,
                    elapsed: outcome.elapsed,
                    output: outcome.output,
                },
            )
            .await?;
            tracing::info!(
                ensemble = %prepared.id,
                class = ?outcome.class,
                elapsed_secs = outcome.elapsed.as_secs(),
                recorded = report.recorded,
                retired = report.retired,
                ended = report.counters.ended,
                "run reported"
            );
            idle_since = Instant::now();
        }
    }

    /// Reads the index and turns it into weighted candidates.
    async fn discover(&self, kind: IndexKind) -> Result<Vec<Candidate>, AgentError> {
        let filter = ListFilter {
            sanity: kind == IndexKind::Sanity,
            ..ListFilter::default()
        };
        let summaries = list(&self.db, &self.layout, &filter).await?;
        Ok(summaries
            .iter()
            .map(|summary| Candidate {
                id: summary.id,
                weight: summary.properties.effective_priority(),
            })
            .collect())
    }

    /// Blocks until the index changes, the poll interval elapses, or
    /// shutdown is raised.
    async fn wait_for_index_change(&mut self, kind: IndexKind) {
        let index_changed = self.db.watch(self.layout.index(kind).key());
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = index_changed => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Materialises the package, runs the sandbox, applies retention.
    async fn execute(&self, prepared: &PreparedRun) -> Result<RunOutcome, AgentError> {
        let workspace =
            RunWorkspace::create(&self.config.work_dir, &prepared.id.to_string()).await?;
        workspace.materialise(&prepared.package, TEST_COMMAND)?;

        let spec = RunSpec {
            timeout: prepared.properties.timeout.map(Duration::from_secs),
            env: property_env(&prepared.properties),
            cluster_file: Some(self.config.cluster_file.clone()),
            reap_orphans: self.config.reap_orphans,
            ..RunSpec::default()
        };
        let outcome = run_test(&spec, workspace.path(), self.shutdown.clone()).await?;

        let retain =
            self.config.keep_failed && outcome.class == ExitClass::Fail && !outcome.cancelled;
        workspace.finish(retain).await?;
        Ok(outcome)
    }
}

/// Environment the test process sees beyond HOME/PATH: the user's `env`
/// property first, then `JOSHUA_<PROP>` reflections of every property
/// (so the reflections cannot be overridden), then a fresh seed.
fn property_env(properties: &EnsembleProperties) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = properties
        .env
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    for (name, value) in properties.to_pairs() {
        if name == joshua_model::properties::PROP_ENV {
            continue;
        }
        env.push((format!("JOSHUA_{}", name.to_uppercase()), value));
    }
    env.push((
        "JOSHUA_SEED".to_string(),
        (rand::random::<u64>() >> 1).to_string(),
    ));
    env
}

/// Drives an agent to completion, recording any fatal error in the
/// fabric's failure log before surfacing it.
pub async fn run_agent<D: Database>(
    db: D,
    layout: Layout,
    config: AgentConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<ExitReason, AgentError> {
    let mut agent = Agent::new(db.clone(), layout.clone(), config, shutdown);
    let result = agent.run().await;
    if let Err(error) = &result {
        tracing::error!(%error, "agent failed");
        if let Err(log_error) =
            log_agent_failure(&db, &layout, &hostname(), &error.to_string()).await
        {
            tracing::warn!(%log_error, "could not record agent failure");
        }
    }
    result
}
