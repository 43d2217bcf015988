//! Worker subprocess supervision: spawn, observe, terminate.
//!
//! The supervisor owns the OS process and its lifecycle state; it never
//! looks inside the wire protocol. Crash detection flips the status watch
//! to `Crashed`, which the agent relays to the bridge so every pending
//! call gets rejected.

use std::path::PathBuf;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch};

use crate::locate::{LocateError, RuntimeLocator};

/// Lifecycle state of the worker process handle.
///
/// At most one process backs the worker at a time: `Starting` and `Ready`
/// both refuse a second `start()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Absent,
    Starting,
    Ready,
    Crashed,
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    /// No runtime anywhere in the probe chain. Fatal until the user
    /// installs one or points the locator at it; never retried on its own.
    #[error(transparent)]
    Runtime(#[from] LocateError),

    #[error("worker is already running")]
    AlreadyRunning,

    #[error("failed to spawn worker process: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker stdio was not captured")]
    StdioUnavailable,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Entry script handed to the resolved runtime.
    pub script: PathBuf,
    pub locator: RuntimeLocator,
    /// How long a terminating worker gets between SIGTERM and SIGKILL.
    pub shutdown_grace: Duration,
}

impl WorkerConfig {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            locator: RuntimeLocator::default(),
            shutdown_grace: Duration::from_secs(3),
        }
    }
}

/// The spawned worker's stdio, handed to the bridge for attachment.
pub struct WorkerStdio {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

pub struct WorkerSupervisor {
    config: WorkerConfig,
    status_tx: watch::Sender<WorkerStatus>,
    kill_tx: StdMutex<Option<oneshot::Sender<()>>>,
}

impl WorkerSupervisor {
    pub fn new(config: WorkerConfig) -> Self {
        let (status_tx, _) = watch::channel(WorkerStatus::Absent);
        Self {
            config,
            status_tx,
            kill_tx: StdMutex::new(None),
        }
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status_tx.subscribe()
    }

    /// Resolve a runtime, spawn the worker and start observing it.
    ///
    /// On success the status moves to `Starting`; it is the agent's job to
    /// drive the handshake and then [`WorkerSupervisor::mark_ready`].
    pub async fn start(&self) -> Result<WorkerStdio, SpawnError> {
        if matches!(self.status(), WorkerStatus::Starting | WorkerStatus::Ready) {
            return Err(SpawnError::AlreadyRunning);
        }

        let runtime = self.config.locator.resolve()?;
        tracing::info!(
            runtime = %runtime.program.display(),
            script = %self.config.script.display(),
            "Spawning worker subprocess"
        );

        let mut child = Command::new(&runtime.program)
            .arg(&self.config.script)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(SpawnError::StdioUnavailable)?;
        let stdout = child.stdout.take().ok_or(SpawnError::StdioUnavailable)?;
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_forwarder(stderr);
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        *self.lock_kill() = Some(kill_tx);
        self.status_tx.send_replace(WorkerStatus::Starting);

        let status_tx = self.status_tx.clone();
        let grace = self.config.shutdown_grace;
        tokio::spawn(async move {
            monitor(child, kill_rx, status_tx, grace).await;
        });

        Ok(WorkerStdio { stdin, stdout })
    }

    /// Flip `Starting` to `Ready` once the handshake resolved.
    pub(crate) fn mark_ready(&self) {
        self.status_tx.send_if_modified(|status| {
            if *status == WorkerStatus::Starting {
                *status = WorkerStatus::Ready;
                true
            } else {
                false
            }
        });
    }

    /// Stop the worker if one is running. Idempotent and safe to call at
    /// any time; resolves once the process is gone.
    pub async fn terminate(&self) {
        let kill_tx = self.lock_kill().take();
        let Some(kill_tx) = kill_tx else {
            return;
        };
        if kill_tx.send(()).is_err() {
            // Monitor already saw the process exit.
            return;
        }
        let mut rx = self.status_tx.subscribe();
        let _ = rx
            .wait_for(|status| matches!(status, WorkerStatus::Absent | WorkerStatus::Crashed))
            .await;
    }

    fn lock_kill(&self) -> std::sync::MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.kill_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn monitor(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<WorkerStatus>,
    grace: Duration,
) {
    tokio::select! {
        exit = child.wait() => {
            match exit {
                Ok(exit_status) => {
                    tracing::warn!(code = ?exit_status.code(), "Worker exited unexpectedly");
                }
                Err(err) => {
                    tracing::error!(error = %err, "Failed to observe worker exit");
                }
            }
            status_tx.send_replace(WorkerStatus::Crashed);
        }
        _ = kill_rx => {
            graceful_stop(&mut child, grace).await;
            status_tx.send_replace(WorkerStatus::Absent);
        }
    }
}

async fn graceful_stop(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(_) => return,
                Err(_) => tracing::warn!("Worker ignored SIGTERM, killing"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    if let Err(err) = child.kill().await {
        tracing::error!(error = %err, "Failed to kill worker");
    }
}

fn spawn_stderr_forwarder(stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        tracing::info!(target: "clocklet::worker", "{}", line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "Worker stderr read error");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unresolvable_config() -> WorkerConfig {
        let mut config = WorkerConfig::new("/nonexistent/worker/main.py");
        config.locator = RuntimeLocator::default()
            .with_bundled("/nonexistent/bundled/python3")
            .with_well_known(vec![PathBuf::from("/nonexistent/well-known/python3")])
            .with_command("clocklet-test-no-such-runtime");
        config
    }

    #[tokio::test]
    async fn start_without_runtime_fails_with_locate_error() {
        let supervisor = WorkerSupervisor::new(unresolvable_config());
        match supervisor.start().await {
            Err(SpawnError::Runtime(err)) => assert_eq!(err.tried.len(), 3),
            other => panic!("expected runtime error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(supervisor.status(), WorkerStatus::Absent);
    }

    #[tokio::test]
    async fn terminate_is_idempotent_with_no_process() {
        let supervisor = WorkerSupervisor::new(unresolvable_config());
        supervisor.terminate().await;
        supervisor.terminate().await;
        assert_eq!(supervisor.status(), WorkerStatus::Absent);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::io::Write;

        fn shell_worker(body: &str) -> (tempfile::TempDir, WorkerConfig) {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("worker.sh");
            let mut file = std::fs::File::create(&script).unwrap();
            writeln!(file, "{body}").unwrap();
            drop(file);

            let mut config = WorkerConfig::new(&script);
            config.locator = RuntimeLocator::default().with_bundled("/bin/sh");
            config.shutdown_grace = Duration::from_secs(1);
            (dir, config)
        }

        #[tokio::test]
        async fn start_then_terminate_round_trip() {
            let (_dir, config) = shell_worker("while read -r line; do :; done");
            let supervisor = WorkerSupervisor::new(config);

            let _stdio = supervisor.start().await.unwrap();
            assert_eq!(supervisor.status(), WorkerStatus::Starting);

            assert!(matches!(
                supervisor.start().await,
                Err(SpawnError::AlreadyRunning)
            ));

            supervisor.terminate().await;
            assert_eq!(supervisor.status(), WorkerStatus::Absent);
            supervisor.terminate().await;
        }

        #[tokio::test]
        async fn unexpected_exit_is_observed_as_crash() {
            let (_dir, config) = shell_worker("exit 7");
            let supervisor = WorkerSupervisor::new(config);

            let _stdio = supervisor.start().await.unwrap();
            let mut rx = supervisor.subscribe();
            let status = tokio::time::timeout(
                Duration::from_secs(5),
                rx.wait_for(|status| *status == WorkerStatus::Crashed),
            )
            .await
            .expect("worker exit not observed")
            .unwrap();
            assert_eq!(*status, WorkerStatus::Crashed);
        }

        #[tokio::test]
        async fn mark_ready_only_applies_while_starting() {
            let (_dir, config) = shell_worker("while read -r line; do :; done");
            let supervisor = WorkerSupervisor::new(config);

            supervisor.mark_ready();
            assert_eq!(supervisor.status(), WorkerStatus::Absent);

            let _stdio = supervisor.start().await.unwrap();
            supervisor.mark_ready();
            assert_eq!(supervisor.status(), WorkerStatus::Ready);

            supervisor.terminate().await;
            assert_eq!(supervisor.status(), WorkerStatus::Absent);
        }
    }
}
