//! Value types shared by the connection manager and the command executor.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use russh::keys::PublicKey;
use serde::Serialize;

/// How the server's host key is checked during the handshake.
///
/// There is deliberately no `Default`: every caller picks a policy.
#[derive(Debug, Clone)]
pub enum HostKeyPolicy {
    /// Accept whatever key the server presents. Only for tests and local development.
    AcceptAny,
    /// Verify against an OpenSSH known_hosts file (`~/.ssh/known_hosts` when `path` is `None`).
    /// Unknown and changed keys are rejected.
    KnownHosts { path: Option<PathBuf> },
    /// Accept exactly this key.
    Pinned(PublicKey),
}

/// Everything needed to open one authenticated connection.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// OpenSSH or PEM encoded private key, unencrypted.
    pub private_key: String,
    /// Setup budget for dial + handshake. `None` or zero resolves through
    /// [`resolve_connect_timeout`](super::config::resolve_connect_timeout).
    pub timeout: Option<Duration>,
    pub host_key_policy: HostKeyPolicy,
    /// Offer zlib compression. `None` resolves through the environment.
    pub compress: Option<bool>,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        private_key: impl Into<String>,
        host_key_policy: HostKeyPolicy,
    ) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
            private_key: private_key.into(),
            timeout: None,
            host_key_policy,
            compress: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    /// `host:port` as used in log lines and error messages.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("private_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("host_key_policy", &self.host_key_policy)
            .field("compress", &self.compress)
            .finish()
    }
}

/// How the remote process ended, as reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// An `exit-status` record.
    Code(u32),
    /// An `exit-signal` record.
    Signal {
        signal: String,
        core_dumped: bool,
        message: String,
    },
    /// The channel closed without either record.
    Missing,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "exit status {}", code),
            ExitStatus::Signal {
                signal,
                core_dumped,
                message,
            } => {
                write!(f, "killed by signal {}", signal)?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                if !message.is_empty() {
                    write!(f, ": {}", message)?;
                }
                Ok(())
            }
            ExitStatus::Missing => write!(f, "no exit status reported"),
        }
    }
}

/// Signals that can be delivered to the remote process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
    Int,
    Hup,
}

impl Signal {
    /// Signal name without the `SIG` prefix, as carried on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Signal::Term => "TERM",
            Signal::Kill => "KILL",
            Signal::Int => "INT",
            Signal::Hup => "HUP",
        }
    }
}

impl From<Signal> for russh::Sig {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Term => russh::Sig::TERM,
            Signal::Kill => russh::Sig::KILL,
            Signal::Int => russh::Sig::INT,
            Signal::Hup => russh::Sig::HUP,
        }
    }
}

/// Output of a command that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exactly the bytes written to standard output.
    pub stdout: Vec<u8>,
}

impl CommandOutput {
    /// Standard output decoded lossily as UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}
