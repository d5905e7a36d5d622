use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use joshua_agent::{run_agent, AgentConfig, ExitReason};
use joshua_kv::open_cluster;
use joshua_model::Layout;
use joshua_sandbox::become_subreaper;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "joshua-agent",
    about = "Stateless agent that pulls test ensembles from the fabric and runs them"
)]
struct Args {
    /// Cluster descriptor of the coordinating KV store.
    #[arg(long, short = 'C')]
    cluster_file: PathBuf,

    /// Local scratch root for per-run working directories.
    #[arg(long, short = 'W')]
    work_dir: PathBuf,

    /// Exit 0 after this many seconds of continuous emptiness.
    #[arg(long)]
    agent_idle_timeout: Option<u64>,

    /// Schedule from the sanity index instead of the active index.
    #[arg(long)]
    sanity: bool,

    /// Retain the working directory of failed runs.
    #[arg(long)]
    keep_failed: bool,

    /// Top-level namespace in the KV store.
    #[arg(long, default_value = "joshua")]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let reap_orphans = become_subreaper();

    let db = open_cluster(&args.cluster_file).context("opening fabric database")?;
    let layout = Layout::new(&args.namespace);

    let mut config = AgentConfig::new(args.cluster_file, args.work_dir);
    config.idle_timeout = args.agent_idle_timeout.map(Duration::from_secs);
    config.sanity = args.sanity;
    config.keep_failed = args.keep_failed;
    config.reap_orphans = reap_orphans;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let reason = run_agent(db, layout, config, shutdown_rx)
        .await
        .context("agent terminated on a fatal error")?;
    match reason {
        ExitReason::IdleTimeout => tracing::info!("exiting clean on idle timeout"),
        ExitReason::Shutdown => tracing::info!("exiting clean on shutdown"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::warn!(%error, "cannot listen for SIGTERM, relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
