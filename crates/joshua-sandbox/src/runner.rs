//! Supervised execution of one test process.
//!
//! The test runs in its own process group with stdout and stderr merged
//! into a single capped capture. A wall-clock timer starts at spawn; on
//! expiry (or agent shutdown) the whole group gets SIGTERM, then SIGKILL
//! after the grace period, and the runner does not return until every
//! descendant has been waited on.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use joshua_model::ExitClass;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;

use crate::reaper::reap_descendants;
use crate::{SandboxError, KILL_GRACE, OUTPUT_CAP, TEST_COMMAND};

/// Marker appended once when captured output hits the cap.
pub const TRUNCATED_MARKER: &[u8] = b"\n[TRUNCATED]\n";

/// How long the runner waits for SIGKILLed descendants to be reapable.
const REAP_PATIENCE: Duration = Duration::from_secs(10);

/// Everything the runner needs to execute one test.
#[derive(Clone, Debug)]
pub struct RunSpec {
    pub command: PathBuf,
    /// Wall-clock limit; `None` runs unbounded.
    pub timeout: Option<Duration>,
    pub grace: Duration,
    pub output_cap: usize,
    /// Extra environment on top of the minimal HOME/PATH base.
    pub env: Vec<(String, String)>,
    /// Cluster file exported to the test as `JOSHUA_CLUSTER_FILE`.
    pub cluster_file: Option<PathBuf>,
    /// Wait on re-parented orphans after the group is killed. Enable
    /// only when [crate::become_subreaper] succeeded.
    pub reap_orphans: bool,
}

impl Default for RunSpec {
    fn default() -> Self {
        Self {
            command: PathBuf::from(format!("./{TEST_COMMAND}")),
            timeout: None,
            grace: KILL_GRACE,
            output_cap: OUTPUT_CAP,
            env: Vec::new(),
            cluster_file: None,
            reap_orphans: false,
        }
    }
}

/// What one supervised run produced.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub class: ExitClass,
    /// Measured from just before spawn to just after the final reap.
    pub elapsed: Duration,
    pub output: Vec<u8>,
    pub timed_out: bool,
    /// The agent's shutdown signal interrupted the run; no result should
    /// be reported for it.
    pub cancelled: bool,
}

struct Capture {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl Capture {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.buf.len());
        if room >= bytes.len() {
            self.buf.extend_from_slice(bytes);
        } else {
            self.buf.extend_from_slice(&bytes[..room]);
            self.truncated = true;
        }
    }

    fn into_output(mut self) -> Vec<u8> {
        if self.truncated {
            self.buf.extend_from_slice(TRUNCATED_MARKER);
        }
        self.buf
    }
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runs the test command with `workdir` as CWD and supervises it to
/// completion. `shutdown` flipping to true cancels the run.
pub async fn run_test(
    spec: &RunSpec,
    workdir: &Path,
    mut shutdown: watch::Receiver<bool>,
) -> Result<RunOutcome, SandboxError> {
    let started = Instant::now();

    let mut command = Command::new(&spec.command);
    command.current_dir(workdir);
    command.env_clear();
    for name in ["HOME", "PATH"] {
        if let Ok(value) = std::env::var(name) {
            command.env(name, value);
        }
    }
    command.env("TMP", workdir.join("tmp"));
    if let Some(cluster_file) = &spec.cluster_file {
        command.env("JOSHUA_CLUSTER_FILE", cluster_file);
    }
    for (name, value) in &spec.env {
        command.env(name, value);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source)
            if matches!(
                source.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ) =>
        {
            // The package did not provide a runnable test command; that
            // is the test's failure, not the agent's.
            let message = format!("could not start {}: {source}\n", spec.command.display());
            return Ok(RunOutcome {
                class: ExitClass::Fail,
                elapsed: started.elapsed(),
                output: message.into_bytes(),
                timed_out: false,
                cancelled: false,
            });
        }
        Err(source) => {
            return Err(SandboxError::Spawn {
                command: spec.command.clone(),
                source,
            })
        }
    };
    let pid = child.id();
    tracing::debug!(command = %spec.command.display(), pid, "spawned test process");

    let capture = Arc::new(Mutex::new(Capture::new(spec.output_cap)));
    let stdout = child.stdout.take().expect("stdout piped above");
    let stderr = child.stderr.take().expect("stderr piped above");
    let stdout_task = tokio::spawn(drain(stdout, Arc::clone(&capture)));
    let stderr_task = tokio::spawn(drain(stderr, Arc::clone(&capture)));

    let deadline = spec.timeout.map(|t| tokio::time::Instant::now() + t);
    let first = tokio::select! {
        status = child.wait() => WaitResult::Exited(status?),
        _ = sleep_until_deadline(deadline) => WaitResult::TimedOut,
        _ = cancelled(&mut shutdown) => WaitResult::Cancelled,
    };

    let (status, timed_out, was_cancelled) = match first {
        WaitResult::Exited(status) => (Some(status), false, false),
        WaitResult::TimedOut => {
            tracing::info!(pid, timeout_secs = ?spec.timeout.map(|t| t.as_secs()), "test timed out, killing process group");
            (terminate_group(&mut child, pid, spec.grace).await?, true, false)
        }
        WaitResult::Cancelled => {
            tracing::info!(pid, "agent shutdown, killing process group");
            (terminate_group(&mut child, pid, spec.grace).await?, false, true)
        }
    };

    // The main process is reaped; kill whatever it left in the group so
    // the pipes reach EOF and nothing outlives the run.
    signal_group(pid, GroupSignal::Kill);
    let _ = stdout_task.await;
    let _ = stderr_task.await;
    if spec.reap_orphans {
        reap_descendants(REAP_PATIENCE).await?;
    }

    let elapsed = started.elapsed();
    let mut capture = Arc::try_unwrap(capture)
        .map_err(|_| ())
        .expect("capture tasks joined")
        .into_inner()
        .expect("capture lock");
    if timed_out {
        capture.push(format!("\njoshua: test timed out after {:.0?}\n", elapsed).as_bytes());
    }
    let output = capture.into_output();

    let passed = status.map(|s| s.success()).unwrap_or(false) && !timed_out && !was_cancelled;
    Ok(RunOutcome {
        class: if passed {
            ExitClass::Pass
        } else {
            ExitClass::Fail
        },
        elapsed,
        output,
        timed_out,
        cancelled: was_cancelled,
    })
}

async fn drain<R: tokio::io::AsyncRead + Unpin>(mut reader: R, capture: Arc<Mutex<Capture>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => capture.lock().expect("capture lock").push(&buf[..n]),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone; treat as shutdown.
            return;
        }
    }
}

/// SIGTERM the group, wait out the grace period, then SIGKILL it and
/// reap the main child.
async fn terminate_group(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
) -> Result<Option<std::process::ExitStatus>, SandboxError> {
    signal_group(pid, GroupSignal::Term);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => Ok(Some(status?)),
        Err(_) => {
            signal_group(pid, GroupSignal::Kill);
            let _ = child.start_kill();
            Ok(Some(child.wait().await?))
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum GroupSignal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let Ok(pgid) = i32::try_from(pid) else { return };
    let signal = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    if let Err(errno) = killpg(Pid::from_raw(pgid), signal) {
        // ESRCH just means the group is already gone.
        if errno != nix::errno::Errno::ESRCH {
            tracing::warn!(pgid, ?signal, %errno, "failed to signal process group");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}
