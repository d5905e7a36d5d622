//! Child-subreaper capability and descendant reaping.
//!
//! With the agent registered as subreaper, any grandchild orphaned by a
//! test script re-parents to the agent instead of PID 1, so the runner
//! can wait on the whole descendant tree after killing the process
//! group. Platforms without the capability log it and fall back to
//! process-group signalling alone.

use std::time::Duration;

use crate::SandboxError;

/// Declares this process the subreaper of its descendants. Returns
/// whether the capability is active; callers thread the answer into
/// [crate::RunSpec::reap_orphans].
pub fn become_subreaper() -> bool {
    #[cfg(target_os = "linux")]
    {
        match nix::sys::prctl::set_child_subreaper(true) {
            Ok(()) => {
                tracing::info!("registered as child subreaper");
                true
            }
            Err(errno) => {
                tracing::warn!(%errno, "prctl(PR_SET_CHILD_SUBREAPER) failed; orphaned grandchildren re-parent to init");
                false
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        tracing::warn!("child subreaper unavailable on this platform; orphaned grandchildren re-parent to init");
        false
    }
}

/// Waits on every re-parented descendant until none remain. Callable
/// only after the process group has been killed; anything still alive
/// here is a straggler that already received SIGKILL.
#[cfg(unix)]
pub(crate) async fn reap_descendants(patience: Duration) -> Result<(), SandboxError> {
    use nix::errno::Errno;
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::Pid;

    let started = std::time::Instant::now();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if started.elapsed() > patience {
                    return Err(SandboxError::Cleanup(
                        "descendants still alive after SIGKILL".to_string(),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Ok(status) => {
                tracing::debug!(?status, "reaped orphaned descendant");
            }
            Err(Errno::ECHILD) => return Ok(()),
            Err(errno) => {
                return Err(SandboxError::Cleanup(format!(
                    "waitpid on descendants failed: {errno}"
                )))
            }
        }
    }
}

#[cfg(not(unix))]
pub(crate) async fn reap_descendants(_patience: Duration) -> Result<(), SandboxError> {
    Ok(())
}
