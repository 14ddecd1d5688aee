//! The remote-shell capability the executor is written against.
//!
//! A [`Transport`] is one authenticated, multiplexed connection; each call to
//! [`Transport::open_session`] carves out a [`RemoteSession`] for exactly one
//! command. The production implementation is
//! [`Connection`](super::client::Connection) over russh; tests plug in an
//! in-process peer that follows the same contract.
//!
//! # Session contract
//!
//! - Both output streams are taken with [`RemoteSession::take_stdout`] and
//!   [`RemoteSession::take_stderr`] before [`RemoteSession::exec`], so no
//!   output is lost between process start and attachment. Each can be taken
//!   once.
//! - After the streams are taken every method takes `&self`, so the session
//!   can be shared between the task driving the command and the task racing
//!   it against cancellation.
//! - Streams end (EOF) when the peer closes its write side or the session is
//!   closed, and fail with an I/O error when the channel disappears without
//!   an orderly end.
//! - [`RemoteSession::close`] is idempotent.

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use super::error::TransportError;
use super::types::{ExitStatus, Signal};

/// One readable output stream of a remote process.
pub type OutputStream = Pin<Box<dyn AsyncRead + Send>>;

/// An authenticated connection that can open sessions.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new session channel. Many sessions may be open at once.
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// A single command's execution context.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Detach the standard output stream. Returns `None` if already taken.
    fn take_stdout(&mut self) -> Option<OutputStream>;

    /// Detach the standard error stream. Returns `None` if already taken.
    fn take_stderr(&mut self) -> Option<OutputStream>;

    /// Send an exec request for the literal command and wait for the peer's reply.
    async fn exec(&self, command: &str) -> Result<(), TransportError>;

    /// Wait for the peer's exit-status or exit-signal record.
    ///
    /// Fails if the channel goes away without one.
    async fn wait(&self) -> Result<ExitStatus, TransportError>;

    /// Deliver a signal to the remote process. Delivery only, not confirmation.
    async fn signal(&self, signal: Signal) -> Result<(), TransportError>;

    /// Close the channel. Calling it again is a no-op.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        (**self).open_session().await
    }
}
