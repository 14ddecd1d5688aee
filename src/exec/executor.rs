//! Single-command execution over a [`Transport`].
//!
//! ## Execution Lifecycle
//!
//! 1. **Session open**: a fresh session per command. Failure is terminal
//!    (`SessionCreateFailed`); cancellation while the open is pending
//!    returns `Cancelled` at once.
//! 2. **Streams attached**: stdout and stderr are detached before the exec
//!    request so nothing the process writes early is lost.
//! 3. **Command started**: a completion task sends the exec request
//!    (`CommandStartFailed` on refusal), spawns one drain task per stream
//!    and waits for the exit record. Both streams are always drained
//!    concurrently; a process filling one pipe while the other is unread
//!    would otherwise stall forever.
//! 4. **Race**: completion, the caller's [`CancellationToken`] and the
//!    deadline are raced with a biased `select!`. Cancellation and deadline
//!    send `TERM` to the remote process (best effort) and report
//!    `Cancelled` / `DeadlineExceeded`. The losing completion task is not
//!    aborted; it ends by itself once the session is closed.
//! 5. **Session closed**: on every path, bounded by the cleanup timeout.
//!    After an interruption, `TERM` and the close share that one budget.
//!    Teardown artifacts are dropped, a close failure after success becomes
//!    `CloseFailed`, and after a failure it is attached as cleanup detail.
//!    If the caller drops the run future midway, a guard closes the session
//!    in the background.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::config::resolve_cleanup_timeout;
use super::error::{ExecError, StreamKind, is_teardown_error};
use super::transport::{OutputStream, RemoteSession, Transport};
use super::types::{CommandOutput, ExitStatus, Signal};

/// Bytes read from one stream, and the error that stopped it early, if any.
struct Drained {
    bytes: Vec<u8>,
    error: Option<io::Error>,
}

async fn drain(mut stream: OutputStream, capacity: usize) -> Drained {
    let mut bytes = Vec::with_capacity(capacity);
    let error = stream.read_to_end(&mut bytes).await.err();
    Drained { bytes, error }
}

fn propagate_panic(e: JoinError) -> io::Error {
    if e.is_panic() {
        std::panic::resume_unwind(e.into_panic());
    }
    io::Error::other(format!("task aborted: {}", e))
}

async fn join_drain(task: JoinHandle<Drained>) -> Drained {
    task.await.unwrap_or_else(|e| Drained {
        bytes: Vec::new(),
        error: Some(propagate_panic(e)),
    })
}

/// Drive one command to its outcome: exec, drain both streams, wait.
///
/// A non-zero or missing exit status takes precedence over a stream
/// failure, since it already says the command did not succeed.
async fn complete(
    session: Arc<dyn RemoteSession>,
    command: String,
    stdout: OutputStream,
    stderr: OutputStream,
) -> Result<CommandOutput, ExecError> {
    session
        .exec(&command)
        .await
        .map_err(|e| ExecError::CommandStartFailed(e.to_string()))?;
    debug!("Command started: {}", command);

    let stdout_task = tokio::spawn(drain(stdout, 4096));
    let stderr_task = tokio::spawn(drain(stderr, 1024));

    let status = match session.wait().await {
        Ok(status) => status,
        Err(e) => {
            debug!("No exit record for {:?}: {}", command, e);
            ExitStatus::Missing
        }
    };
    let stdout = join_drain(stdout_task).await;
    let stderr = join_drain(stderr_task).await;

    if !status.success() {
        return Err(ExecError::CommandFailed {
            status,
            stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        });
    }

    for (stream, drained) in [(StreamKind::Stdout, &stdout), (StreamKind::Stderr, &stderr)] {
        if let Some(e) = &drained.error {
            return Err(ExecError::StreamReadFailed {
                stream,
                reason: e.to_string(),
            });
        }
    }

    Ok(CommandOutput {
        stdout: stdout.bytes,
    })
}

/// Closes the session in the background unless disarmed.
///
/// Covers the run future being dropped between session open and the
/// explicit close.
struct SessionGuard {
    session: Option<Arc<dyn RemoteSession>>,
}

impl SessionGuard {
    fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self {
            session: Some(session),
        }
    }

    fn disarm(&mut self) {
        self.session = None;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.close().await {
                        debug!("Background session close failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("Session dropped outside a runtime; not closed"),
        }
    }
}

/// Best-effort `TERM` by `deadline`; never masks the outcome that triggered it.
async fn terminate(session: &dyn RemoteSession, deadline: Instant) {
    match tokio::time::timeout_at(deadline, session.signal(Signal::Term)).await {
        Ok(Ok(())) => debug!("Sent TERM to remote process"),
        Ok(Err(e)) => debug!("Could not deliver TERM: {}", e),
        Err(_) => warn!("TERM delivery did not complete within the cleanup budget"),
    }
}

/// The completion task ended without an outcome (runtime shutdown). The
/// command was already under way, so this is reported as lost output.
fn completion_aborted(e: JoinError) -> ExecError {
    ExecError::StreamReadFailed {
        stream: StreamKind::Stdout,
        reason: propagate_panic(e).to_string(),
    }
}

/// Fold a cleanup failure into the primary outcome.
fn settle(
    outcome: Result<CommandOutput, ExecError>,
    cleanup: Option<String>,
) -> Result<CommandOutput, ExecError> {
    match (outcome, cleanup) {
        (outcome, None) => outcome,
        (Ok(output), Some(reason)) => Err(ExecError::CloseFailed {
            reason,
            output: Some(output),
        }),
        (Err(e), Some(reason)) => Err(e.with_cleanup(reason)),
    }
}

/// Runs commands on sessions of a [`Transport`].
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    cleanup_timeout: Duration,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor {
    /// Executor with the cleanup bound from `SSH_CLEANUP_TIMEOUT_MS` or the default.
    pub fn new() -> Self {
        Self::with_cleanup_timeout(resolve_cleanup_timeout(None))
    }

    /// Executor with an explicit bound on signal delivery and session close.
    pub fn with_cleanup_timeout(cleanup_timeout: Duration) -> Self {
        Self { cleanup_timeout }
    }

    pub fn cleanup_timeout(&self) -> Duration {
        self.cleanup_timeout
    }

    /// Run `command` on a new session of `transport`.
    ///
    /// Exactly one outcome is produced, and the session is closed before it
    /// is returned. Cancellation is honoured from the first await, including
    /// while the session is still being opened.
    ///
    /// # Arguments
    ///
    /// * `transport` - Connection to open the session on
    /// * `command` - Command string, passed to the peer verbatim
    /// * `timeout` - One absolute budget from the start of the command, not an idle timeout
    /// * `cancel` - Caller's cancellation signal
    ///
    /// # Returns
    ///
    /// * `Ok(output)` - The command exited 0; `output.stdout` holds every byte it wrote
    /// * `Err(error)` - Exactly one classified failure; see [`ErrorKind`](super::error::ErrorKind)
    pub async fn run(
        &self,
        transport: &dyn Transport,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        let opened = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!("Command cancelled before its session opened: {}", command);
                return Err(ExecError::Cancelled);
            }

            opened = transport.open_session() => opened,
        };
        let mut session = opened.map_err(|e| ExecError::SessionCreateFailed(e.to_string()))?;
        let stdout = session.take_stdout();
        let stderr = session.take_stderr();
        let session: Arc<dyn RemoteSession> = Arc::from(session);
        let mut guard = SessionGuard::new(Arc::clone(&session));

        let (outcome, cleanup_deadline) = match (stdout, stderr) {
            (Some(stdout), Some(stderr)) => {
                self.race(&session, command, timeout, cancel, stdout, stderr)
                    .await
            }
            _ => (
                Err(ExecError::SessionCreateFailed(
                    "session output streams already taken".to_string(),
                )),
                None,
            ),
        };

        let cleanup_deadline =
            cleanup_deadline.unwrap_or_else(|| Instant::now() + self.cleanup_timeout);
        let cleanup = self.close_session(session.as_ref(), cleanup_deadline).await;
        guard.disarm();
        settle(outcome, cleanup)
    }

    /// Race completion against cancellation and the deadline.
    ///
    /// When the race is lost the cleanup budget starts at `TERM`, and the
    /// returned instant bounds the remaining cleanup.
    async fn race(
        &self,
        session: &Arc<dyn RemoteSession>,
        command: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        stdout: OutputStream,
        stderr: OutputStream,
    ) -> (Result<CommandOutput, ExecError>, Option<Instant>) {
        let deadline = Instant::now() + timeout;
        let mut completion = tokio::spawn(complete(
            Arc::clone(session),
            command.to_string(),
            stdout,
            stderr,
        ));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                warn!("Command cancelled: {}", command);
                let cleanup_deadline = Instant::now() + self.cleanup_timeout;
                terminate(session.as_ref(), cleanup_deadline).await;
                (Err(ExecError::Cancelled), Some(cleanup_deadline))
            }

            _ = tokio::time::sleep_until(deadline) => {
                warn!("Command timed out after {:?}: {}", timeout, command);
                let cleanup_deadline = Instant::now() + self.cleanup_timeout;
                terminate(session.as_ref(), cleanup_deadline).await;
                (Err(ExecError::DeadlineExceeded(timeout)), Some(cleanup_deadline))
            }

            joined = &mut completion => match joined {
                Ok(outcome) => (outcome, None),
                Err(e) => (Err(completion_aborted(e)), None),
            },
        }
    }

    /// Close the session by `deadline`, returning failure detail worth reporting.
    async fn close_session(
        &self,
        session: &dyn RemoteSession,
        deadline: Instant,
    ) -> Option<String> {
        match tokio::time::timeout_at(deadline, session.close()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) if is_teardown_error(&e) => {
                debug!("Session already torn down: {}", e);
                None
            }
            Ok(Err(e)) => {
                warn!("Failed to close session: {}", e);
                Some(e.to_string())
            }
            Err(_) => {
                warn!(
                    "Session close did not finish within the {:?} cleanup budget",
                    self.cleanup_timeout
                );
                Some(format!(
                    "session close timed out (cleanup budget {:?})",
                    self.cleanup_timeout
                ))
            }
        }
    }
}
