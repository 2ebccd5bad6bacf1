// SPDX-License-Identifier: Apache-2.0
// Copyright Forwarder Agent Authors

//! Local switch backend supervision.
//!
//! The forwarder prefers a switch backend already running on the host,
//! detected through its control socket. When none is present it spawns the
//! configured supervisor command, which owns the backend's internal retry
//! and backoff, and waits a bounded time for the control socket to appear.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The supervisor retries each daemon internally, so this bounds the whole
/// startup rather than a single attempt.
pub const START_SWITCH_TIMEOUT: Duration = Duration::from_secs(30);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum SwitchError {
    #[error("failed to spawn switch launcher '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("switch launcher exited during startup ({0})")]
    LauncherExited(String),
    #[error("switch control socket {socket} did not appear within {timeout:?}")]
    Timeout { socket: PathBuf, timeout: Duration },
    #[error("cancelled while waiting for the switch control socket")]
    Cancelled,
}

/// A switch backend is considered running when its control socket exists.
#[must_use]
pub fn is_running(ctl_socket: &Path) -> bool {
    ctl_socket.exists()
}

/// Spawn the supervisor command and watch it.
///
/// The returned channel fires if the supervisor itself exits; it is meant
/// to run for the whole agent lifetime, so any exit is a failure. On
/// cancellation the supervisor is killed.
pub fn start_supervised(
    launcher: &str,
    scratch_dir: &Path,
    cancel: &CancellationToken,
) -> Result<oneshot::Receiver<SwitchError>, SwitchError> {
    let mut child = tokio::process::Command::new(launcher)
        .env("FWD_SCRATCH_DIR", scratch_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| SwitchError::Spawn {
            command: launcher.to_string(),
            source,
        })?;
    info!(command = launcher, "switch supervisor spawned");

    let (tx, rx) = oneshot::channel();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => format!("wait failed: {e}"),
                };
                let _ = tx.send(SwitchError::LauncherExited(status));
            }
            () = cancel.cancelled() => {
                debug!("stopping switch supervisor");
                let _ = child.kill().await;
            }
        }
    });
    Ok(rx)
}

/// Wait for the control socket to appear.
///
/// Returns early when the token is cancelled, which is how a supervisor
/// failure reported through the [`crate::monitor::FailureMonitor`] or a
/// termination signal cuts the wait short.
pub async fn wait_ready(
    ctl_socket: &Path,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), SwitchError> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !is_running(ctl_socket) {
        if tokio::time::Instant::now() >= deadline {
            return Err(SwitchError::Timeout {
                socket: ctl_socket.to_path_buf(),
                timeout,
            });
        }
        tokio::select! {
            () = cancel.cancelled() => return Err(SwitchError::Cancelled),
            () = tokio::time::sleep(READY_POLL_INTERVAL) => {}
        }
    }
    Ok(())
}
