#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Run one command on a remote host over SSH, with a deadline, explicit
//! cancellation and a classified result.
//!
//! ```no_run
//! use remote_exec::{CommandRunner, ConnectionConfig, HostKeyPolicy, RemoteExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(key: &str) -> Result<(), remote_exec::ExecError> {
//! let config = ConnectionConfig::new(
//!     "build.example.com",
//!     "deploy",
//!     key,
//!     HostKeyPolicy::KnownHosts { path: None },
//! );
//! let executor = RemoteExecutor::connect(&config, None).await?;
//! let output = executor.run("uname -a", &CancellationToken::new()).await?;
//! println!("{}", output.text());
//! executor.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod exec;

pub use exec::{
    CommandExecutor, CommandOutput, CommandRunner, Connection, ConnectionConfig, ErrorKind,
    ExecError, ExitStatus, HostKeyPolicy, RemoteExecutor, Signal,
};
