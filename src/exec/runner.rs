//! Caller-facing facade: one transport, one default timeout.
//!
//! Code that merely needs "run this on the host" depends on
//! [`CommandRunner`] and can be tested against a fake; [`RemoteExecutor`]
//! is the implementation backed by a real [`Transport`].

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::client::Connection;
use super::config::resolve_command_timeout;
use super::error::ExecError;
use super::executor::CommandExecutor;
use super::transport::Transport;
use super::types::{CommandOutput, ConnectionConfig};

/// Runs a command on some remote host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError>;
}

/// A transport paired with the executor and timeout used for every command.
#[derive(Debug)]
pub struct RemoteExecutor<T: Transport = Connection> {
    transport: T,
    executor: CommandExecutor,
    timeout: Duration,
}

impl<T: Transport> RemoteExecutor<T> {
    /// Wrap `transport`. The timeout resolves through `SSH_COMMAND_TIMEOUT`
    /// and the 180 second default when `None`.
    pub fn new(transport: T, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            executor: CommandExecutor::new(),
            timeout: resolve_command_timeout(timeout),
        }
    }

    pub fn with_executor(mut self, executor: CommandExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }
}

impl RemoteExecutor<Connection> {
    /// Open a [`Connection`] and wrap it.
    ///
    /// # Arguments
    ///
    /// * `config` - Host, credentials and host-key policy for the connection
    /// * `timeout` - Per-command timeout; `None` resolves through
    ///   `SSH_COMMAND_TIMEOUT` and the default
    ///
    /// # Returns
    ///
    /// The executor on success, or any error [`Connection::open`] reports.
    pub async fn connect(
        config: &ConnectionConfig,
        timeout: Option<Duration>,
    ) -> Result<Self, ExecError> {
        let connection = Connection::open(config).await?;
        Ok(Self::new(connection, timeout))
    }

    /// Close the underlying connection.
    pub async fn close(&self) -> Result<(), ExecError> {
        self.transport.close().await
    }
}

#[async_trait]
impl<T: Transport> CommandRunner for RemoteExecutor<T> {
    async fn run(
        &self,
        command: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutput, ExecError> {
        self.executor
            .run(&self.transport, command, self.timeout, cancel)
            .await
    }
}
