//! Error taxonomy for connection setup and command execution.
//!
//! Two layers of errors live here:
//!
//! - [`TransportError`] is what the pluggable transport capability reports
//!   (russh protocol errors, peer rejections, closed channels, I/O).
//! - [`ExecError`] is what callers see. Each variant maps to exactly one
//!   [`ErrorKind`], so callers can branch on the kind without parsing text.
//!
//! # Teardown artifacts
//!
//! Errors raised while tearing down a session or connection are often just
//! the echo of the peer having closed first: a reset socket, an EOF, a
//! channel that is already gone. [`is_teardown_error`] recognises these so
//! cleanup code can drop them instead of reporting a new failure.
//!
//! # Transient kinds
//!
//! Nothing in this crate retries. [`ErrorKind::is_transient`] marks the kinds
//! where a caller-level retry can reasonably succeed (connection setup
//! failures and deadline expiry); commands are not assumed idempotent, so the
//! decision stays with the caller.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use super::types::{CommandOutput, ExitStatus};

/// Message fragments that indicate the other side already tore the
/// channel or connection down.
///
/// Matched case-insensitively against the rendered error.
const TEARDOWN_PATTERNS: &[&str] = &[
    "already closed",
    "channel closed",
    "closed network connection",
    "connection reset",
    "connection aborted",
    "closed by the remote",
    "broken pipe",
    "not connected",
    "disconnected",
    "send error",
    "eof",
];

/// Failure reported by a [`Transport`](super::transport::Transport) or
/// [`RemoteSession`](super::transport::RemoteSession).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),

    #[error("request rejected by peer: {0}")]
    Rejected(String),

    #[error("channel already closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Which output stream a read failure happened on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => write!(f, "stdout"),
            StreamKind::Stderr => write!(f, "stderr"),
        }
    }
}

/// Fieldless classification of an [`ExecError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthKeyInvalid,
    ConnectTimeout,
    ConnectRefused,
    HandshakeFailed,
    AuthRejected,
    SessionCreateFailed,
    CommandStartFailed,
    StreamReadFailed,
    CommandFailed,
    Cancelled,
    DeadlineExceeded,
    CloseFailed,
}

impl ErrorKind {
    /// Whether a caller-level retry of the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectTimeout | ErrorKind::ConnectRefused | ErrorKind::DeadlineExceeded
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AuthKeyInvalid => "auth_key_invalid",
            ErrorKind::ConnectTimeout => "connect_timeout",
            ErrorKind::ConnectRefused => "connect_refused",
            ErrorKind::HandshakeFailed => "handshake_failed",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::SessionCreateFailed => "session_create_failed",
            ErrorKind::CommandStartFailed => "command_start_failed",
            ErrorKind::StreamReadFailed => "stream_read_failed",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::CloseFailed => "close_failed",
        };
        f.write_str(name)
    }
}

/// Failure of [`open`](super::client::open) or [`run`](super::executor::CommandExecutor::run).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid private key: {0}")]
    AuthKeyInvalid(String),

    #[error("connection to {address} timed out after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("connection to {address} failed: {reason}")]
    ConnectRefused { address: String, reason: String },

    #[error("SSH handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("public key for user {user} rejected by server")]
    AuthRejected { user: String },

    #[error("failed to create session: {0}")]
    SessionCreateFailed(String),

    #[error("failed to start command: {0}")]
    CommandStartFailed(String),

    #[error("failed to read {stream}: {reason}")]
    StreamReadFailed { stream: StreamKind, reason: String },

    #[error("command failed with {status}{}", stderr_suffix(.stderr))]
    CommandFailed { status: ExitStatus, stderr: String },

    #[error("command cancelled")]
    Cancelled,

    #[error("command exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    /// Cleanup failed with no primary failure to attach it to. For a
    /// successful command the captured output rides along.
    #[error("failed to close: {reason}")]
    CloseFailed {
        reason: String,
        output: Option<CommandOutput>,
    },

    /// A primary failure with a cleanup failure attached as detail.
    #[error("{primary} (cleanup: {cleanup})")]
    WithCleanup {
        primary: Box<ExecError>,
        cleanup: String,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}

impl ExecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::AuthKeyInvalid(_) => ErrorKind::AuthKeyInvalid,
            ExecError::ConnectTimeout { .. } => ErrorKind::ConnectTimeout,
            ExecError::ConnectRefused { .. } => ErrorKind::ConnectRefused,
            ExecError::HandshakeFailed(_) => ErrorKind::HandshakeFailed,
            ExecError::AuthRejected { .. } => ErrorKind::AuthRejected,
            ExecError::SessionCreateFailed(_) => ErrorKind::SessionCreateFailed,
            ExecError::CommandStartFailed(_) => ErrorKind::CommandStartFailed,
            ExecError::StreamReadFailed { .. } => ErrorKind::StreamReadFailed,
            ExecError::CommandFailed { .. } => ErrorKind::CommandFailed,
            ExecError::Cancelled => ErrorKind::Cancelled,
            ExecError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            ExecError::CloseFailed { .. } => ErrorKind::CloseFailed,
            ExecError::WithCleanup { primary, .. } => primary.kind(),
        }
    }

    /// Attach a cleanup failure to this error without changing its kind.
    pub fn with_cleanup(self, cleanup: impl Into<String>) -> Self {
        let cleanup = cleanup.into();
        match self {
            ExecError::WithCleanup {
                primary,
                cleanup: existing,
            } => ExecError::WithCleanup {
                primary,
                cleanup: format!("{}; {}", existing, cleanup),
            },
            primary => ExecError::WithCleanup {
                primary: Box::new(primary),
                cleanup,
            },
        }
    }

    /// The underlying failure, looking through any attached cleanup detail.
    pub fn primary(&self) -> &ExecError {
        match self {
            ExecError::WithCleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }

    /// Remote exit status, for command failures.
    pub fn exit_status(&self) -> Option<&ExitStatus> {
        match self.primary() {
            ExecError::CommandFailed { status, .. } => Some(status),
            _ => None,
        }
    }

    /// Captured standard error text, for command failures.
    pub fn stderr(&self) -> Option<&str> {
        match self.primary() {
            ExecError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Whether an error message looks like an artifact of an already torn down
/// channel or connection.
pub(crate) fn is_teardown_message(message: &str) -> bool {
    let message = message.to_lowercase();
    TEARDOWN_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Whether a transport error is an artifact of teardown rather than a new failure.
pub fn is_teardown_error(error: &TransportError) -> bool {
    match error {
        TransportError::Closed => true,
        TransportError::Rejected(_) => false,
        TransportError::Io(e) => {
            matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::NotConnected
            ) || is_teardown_message(&e.to_string())
        }
        TransportError::Protocol(e) => is_teardown_message(&e.to_string()),
    }
}
