//! Pipeline executor
//!
//! Runs one engine invocation as a child process inside the session
//! workspace and reports how it ended. The child leads its own process
//! group, so cancellation and timeouts kill everything the engine spawned,
//! not just the top-level binary.
//!
//! The argument vector is passed straight to `execve`; no shell ever sees it.

use crate::types::FailureReason;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Default time allowed for output streams to close after the engine exits
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully resolved engine command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Engine binary
    pub program: String,
    /// Argument vector (already resolved, never shell-interpreted)
    pub args: Vec<String>,
    /// Working directory (the session workspace)
    pub workspace: PathBuf,
    /// Upper bound on run time
    pub timeout: Option<Duration>,
}

/// How the engine process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Process exited on its own (any code)
    Exited,
    /// Killed after a cancellation request
    Cancelled,
    /// Killed after exceeding the time bound
    TimedOut,
    /// Process never started
    SpawnFailed(String),
}

/// Result of one engine invocation
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// How the process ended
    pub termination: Termination,
    /// Exit code, absent when killed by a signal or never spawned
    pub exit_code: Option<i32>,
    /// Captured standard output (lossy UTF-8)
    pub stdout: String,
    /// Captured standard error (lossy UTF-8)
    pub stderr: String,
    /// When the process was started
    pub started_at: DateTime<Utc>,
    /// When the process was reaped
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    fn spawn_failed(message: String, started_at: DateTime<Utc>) -> Self {
        Self {
            termination: Termination::SpawnFailed(message),
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Exited on its own with status zero
    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    /// Failure reason, `None` on success
    #[must_use]
    pub fn failure(&self) -> Option<FailureReason> {
        match &self.termination {
            Termination::Exited if self.exit_code == Some(0) => None,
            Termination::Exited => Some(FailureReason::NonZeroExit),
            Termination::Cancelled => Some(FailureReason::Cancelled),
            Termination::TimedOut => Some(FailureReason::TimedOut),
            Termination::SpawnFailed(message) => Some(FailureReason::SpawnFailed {
                message: message.clone(),
            }),
        }
    }

    /// Human-readable description of the ending
    #[must_use]
    pub fn describe(&self) -> String {
        match (&self.termination, self.exit_code) {
            (Termination::Exited, Some(code)) => format!("engine exited with code {code}"),
            (Termination::Exited, None) => "engine terminated by signal".to_string(),
            (Termination::Cancelled, _) => "engine run cancelled".to_string(),
            (Termination::TimedOut, _) => "engine run timed out".to_string(),
            (Termination::SpawnFailed(message), _) => {
                format!("engine could not be started: {message}")
            }
        }
    }
}

/// Output stream being drained into a shared buffer
struct Capture {
    buffer: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl Capture {
    fn start<R>(stream: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buffer);
        let task = tokio::spawn(async move {
            let Some(mut stream) = stream else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => sink.lock().extend_from_slice(&chunk[..n]),
                }
            }
        });
        Self { buffer, task }
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

/// Spawns engine processes and supervises them to completion
#[derive(Debug, Clone)]
pub struct PipelineExecutor {
    drain_grace: Duration,
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineExecutor {
    /// Create executor with the default drain grace period
    #[must_use]
    pub fn new() -> Self {
        Self {
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }

    /// With drain grace period
    #[must_use]
    pub fn with_drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Run `invocation` until it exits, is cancelled or times out
    ///
    /// Cancellation is requested by sending `true` on the watch channel. A
    /// dropped sender never cancels. Never returns an error: every ending,
    /// including a failed spawn, is described by the outcome.
    pub async fn execute(
        &self,
        invocation: &Invocation,
        mut cancel: watch::Receiver<bool>,
    ) -> ExecutionOutcome {
        let started_at = Utc::now();

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.workspace)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(program = %invocation.program, error = %e, "engine spawn failed");
                return ExecutionOutcome::spawn_failed(e.to_string(), started_at);
            }
        };
        let pid = child.id();
        tracing::info!(
            program = %invocation.program,
            args = ?invocation.args,
            pid = ?pid,
            "engine started"
        );

        let mut stdout = Capture::start(child.stdout.take());
        let mut stderr = Capture::start(child.stderr.take());

        let timeout = invocation.timeout;
        let timed_out = async move {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async move {
            let sender_gone = cancel.wait_for(|requested| *requested).await.is_err();
            if sender_gone {
                std::future::pending::<()>().await;
            }
        };

        let (termination, status) = tokio::select! {
            status = child.wait() => (Termination::Exited, status.ok()),
            () = cancelled => {
                tracing::warn!(pid = ?pid, "cancelling engine run");
                kill_group(&mut child, pid);
                (Termination::Cancelled, child.wait().await.ok())
            }
            () = timed_out => {
                tracing::warn!(pid = ?pid, timeout = ?timeout, "engine run timed out");
                kill_group(&mut child, pid);
                (Termination::TimedOut, child.wait().await.ok())
            }
        };

        self.drain(&mut child, pid, &mut stdout.task, &mut stderr.task)
            .await;

        let outcome = ExecutionOutcome {
            termination,
            exit_code: status.and_then(|s| s.code()),
            stdout: stdout.text(),
            stderr: stderr.text(),
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            pid = ?pid,
            exit_code = ?outcome.exit_code,
            termination = ?outcome.termination,
            stderr_bytes = outcome.stderr.len(),
            "engine finished"
        );
        outcome
    }

    /// Wait for both output streams to close
    ///
    /// Leftover processes in the group can hold the pipes open after the
    /// engine exits; they are killed once the grace period lapses. Readers
    /// still blocked after a second grace period are abandoned.
    async fn drain(
        &self,
        child: &mut Child,
        pid: Option<u32>,
        stdout: &mut JoinHandle<()>,
        stderr: &mut JoinHandle<()>,
    ) {
        if join_within(self.drain_grace, stdout, stderr).await {
            return;
        }
        tracing::debug!(pid = ?pid, "output still open after engine exit, killing process group");
        kill_group(child, pid);
        if !join_within(self.drain_grace, stdout, stderr).await {
            tracing::warn!(pid = ?pid, "abandoning engine output readers");
            stdout.abort();
            stderr.abort();
        }
    }
}

async fn join_within(
    grace: Duration,
    a: &mut JoinHandle<()>,
    b: &mut JoinHandle<()>,
) -> bool {
    let both = async {
        let _ = tokio::join!(a, b);
    };
    tokio::time::timeout(grace, both).await.is_ok()
}

/// SIGKILL the engine's whole process group
#[cfg(unix)]
fn kill_group(_child: &mut Child, pid: Option<u32>) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, error = %e, "killpg failed"),
    }
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child, _pid: Option<u32>) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "kill failed");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::Path;
    use std::time::Instant;

    fn shell(workspace: &Path, script: &str, timeout: Option<Duration>) -> Invocation {
        Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            workspace: workspace.to_path_buf(),
            timeout,
        }
    }

    fn never_cancelled() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn captures_both_streams() {
        let ws = tempfile::tempdir().unwrap();
        let outcome = PipelineExecutor::new()
            .execute(&shell(ws.path(), "echo out; echo err >&2", None), never_cancelled())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "out\n");
        assert_eq!(outcome.stderr, "err\n");
        assert_eq!(outcome.failure(), None);
    }

    #[tokio::test]
    async fn runs_inside_workspace() {
        let ws = tempfile::tempdir().unwrap();
        let outcome = PipelineExecutor::new()
            .execute(&shell(ws.path(), "touch marker", None), never_cancelled())
            .await;
        assert!(outcome.succeeded());
        assert!(ws.path().join("marker").exists());
    }

    #[tokio::test]
    async fn non_zero_exit_keeps_stderr() {
        let ws = tempfile::tempdir().unwrap();
        let outcome = PipelineExecutor::new()
            .execute(
                &shell(ws.path(), "echo 'ERROR ~ missing index' >&2; exit 3", None),
                never_cancelled(),
            )
            .await;

        assert!(!outcome.succeeded());
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.failure(), Some(FailureReason::NonZeroExit));
        assert_eq!(outcome.stderr, "ERROR ~ missing index\n");
        assert_eq!(outcome.describe(), "engine exited with code 3");
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let ws = tempfile::tempdir().unwrap();
        let invocation = Invocation {
            program: "cahs-no-such-engine".into(),
            args: vec![],
            workspace: ws.path().to_path_buf(),
            timeout: None,
        };
        let outcome = PipelineExecutor::new().execute(&invocation, never_cancelled()).await;
        assert!(matches!(outcome.termination, Termination::SpawnFailed(_)));
        assert!(matches!(outcome.failure(), Some(FailureReason::SpawnFailed { .. })));
    }

    #[tokio::test]
    async fn timeout_kills_engine() {
        let ws = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let outcome = PipelineExecutor::new()
            .execute(
                &shell(ws.path(), "sleep 30", Some(Duration::from_millis(200))),
                never_cancelled(),
            )
            .await;

        assert_eq!(outcome.termination, Termination::TimedOut);
        assert_eq!(outcome.failure(), Some(FailureReason::TimedOut));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancellation_kills_whole_group() {
        let ws = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(false);
        let invocation = shell(ws.path(), "(sleep 1; touch late) & sleep 30", None);

        let executor = PipelineExecutor::new();
        let run = tokio::spawn(async move { executor.execute(&invocation, rx).await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();

        let outcome = run.await.unwrap();
        assert_eq!(outcome.termination, Termination::Cancelled);

        // the background child would have created the file after one second
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!ws.path().join("late").exists());
    }

    #[tokio::test]
    async fn cancel_before_start_is_honoured() {
        let ws = tempfile::tempdir().unwrap();
        let (tx, rx) = watch::channel(true);
        let outcome = PipelineExecutor::new()
            .execute(&shell(ws.path(), "sleep 30", None), rx)
            .await;
        drop(tx);
        assert_eq!(outcome.termination, Termination::Cancelled);
    }

    #[tokio::test]
    async fn orphans_holding_output_are_reaped() {
        let ws = tempfile::tempdir().unwrap();
        let start = Instant::now();
        let outcome = PipelineExecutor::new()
            .with_drain_grace(Duration::from_millis(200))
            .execute(&shell(ws.path(), "sleep 30 & echo done", None), never_cancelled())
            .await;

        assert!(outcome.succeeded());
        assert_eq!(outcome.stdout, "done\n");
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
