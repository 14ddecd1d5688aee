//! Remote command execution over SSH.
//!
//! This module is organized into the following submodules:
//!
//! - `types`: connection configuration and command result types
//! - `config`: timeout and compression resolution with environment overrides
//! - `error`: error taxonomy and teardown classification
//! - `transport`: the session capability the executor is written against
//! - `channel`: russh channel adapter implementing that capability
//! - `session`: russh client handler and host-key verification
//! - `auth`: private key parsing and public key authentication
//! - `client`: connection manager (open, validate, close)
//! - `executor`: single-command execution with deadline and cancellation
//! - `runner`: caller-facing facade over one transport

pub mod auth;
pub(crate) mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod runner;
pub(crate) mod session;
#[cfg(test)]
pub(crate) mod simulated;
pub mod transport;
pub mod types;

pub use client::{Connection, open, parse_address, validate};
pub use error::{ErrorKind, ExecError, StreamKind, TransportError, is_teardown_error};
pub use executor::CommandExecutor;
pub use runner::{CommandRunner, RemoteExecutor};
pub use transport::{OutputStream, RemoteSession, Transport};
pub use types::{CommandOutput, ConnectionConfig, ExitStatus, HostKeyPolicy, Signal};
