//! Connection manager: one authenticated, multiplexed connection per host.
//!
//! ## Connection Lifecycle
//!
//! 1. **Timeout resolution**: the setup budget comes from the config, the
//!    `SSH_CONNECT_TIMEOUT` environment variable, or the 30 second default.
//!
//! 2. **Key parsing**: the private key is decoded before any network I/O.
//!    Malformed material fails with `AuthKeyInvalid`.
//!
//! 3. **Dial**: a TCP connection is established within the budget
//!    (`ConnectTimeout` / `ConnectRefused`).
//!
//! 4. **Handshake**: key exchange, host-key verification under the
//!    configured [`HostKeyPolicy`](super::types::HostKeyPolicy) and public
//!    key authentication, all bounded by what is left of the same budget.
//!    A peer that accepts the socket but never speaks SSH fails with
//!    `HandshakeFailed` instead of hanging. The bound only wraps the
//!    handshake; the established connection carries no inactivity timeout,
//!    so later commands are timed independently.
//!
//! 5. **Use**: [`Connection`] implements [`Transport`]; many sessions may be
//!    open on it at once.
//!
//! 6. **Teardown**: [`Connection::close`] is idempotent.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use russh::{Disconnect, client};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::auth::{AuthStrategy, KeyAuth};
use super::channel::ChannelSession;
use super::config::{resolve_compression, resolve_connect_timeout};
use super::error::{ExecError, TransportError, is_teardown_error};
use super::session::ClientHandler;
use super::transport::{RemoteSession, Transport};
use super::types::ConnectionConfig;

/// Interval between keepalive requests on an idle connection
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Unanswered keepalives before the connection is considered dead
const KEEPALIVE_MAX: usize = 3;

/// Build russh client configuration.
///
/// No inactivity timeout is set: the setup deadline is applied around the
/// handshake only, and commands carry their own deadlines.
pub(crate) fn build_client_config(compress: bool) -> Arc<client::Config> {
    let compression = if compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(KEEPALIVE_INTERVAL),
        keepalive_max: KEEPALIVE_MAX,
        preferred,
        ..Default::default()
    })
}

/// Parse address string into host and port components.
///
/// Supports `host:port` and bare `host` (default port 22). Uses
/// `rsplit_once` so bracketed IPv6 addresses keep their colons.
pub fn parse_address(address: &str) -> Result<(String, u16), String> {
    if let Some((host, port_str)) = address.rsplit_once(':') {
        let port = port_str
            .parse::<u16>()
            .map_err(|e| format!("Invalid port number: {}", e))?;
        Ok((host.to_string(), port))
    } else {
        Ok((address.to_string(), 22))
    }
}

/// Establish the TCP transport within `timeout`.
async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ExecError> {
    let address = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Err(_) => Err(ExecError::ConnectTimeout { address, timeout }),
        Ok(Err(e)) if e.kind() == io::ErrorKind::TimedOut => {
            Err(ExecError::ConnectTimeout { address, timeout })
        }
        Ok(Err(e)) => Err(ExecError::ConnectRefused {
            address,
            reason: e.to_string(),
        }),
        Ok(Ok(stream)) => {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Failed to set TCP_NODELAY on {}: {}", address, e);
            }
            Ok(stream)
        }
    }
}

/// Open an authenticated connection.
///
/// # Arguments
///
/// * `config` - Host, port, user, private key, host-key policy and optional
///   setup timeout
///
/// # Returns
///
/// The [`Connection`], or `AuthKeyInvalid` before any network I/O,
/// `ConnectTimeout` / `ConnectRefused` while dialing, `HandshakeFailed` for
/// a failed or overdue handshake and `AuthRejected` when the key is refused.
pub async fn open(config: &ConnectionConfig) -> Result<Connection, ExecError> {
    let timeout = resolve_connect_timeout(config.timeout);
    let auth = KeyAuth::from_material(&config.private_key)?;
    let address = config.address();
    let deadline = Instant::now() + timeout;

    debug!("Connecting to {}@{} (timeout {:?})", config.user, address, timeout);
    let stream = dial(&config.host, config.port, timeout).await?;

    let handler = ClientHandler::new(
        config.host.clone(),
        config.port,
        config.host_key_policy.clone(),
    );
    let client_config = build_client_config(resolve_compression(config.compress));

    let handshake = async {
        let mut handle = client::connect_stream(client_config, stream, handler)
            .await
            .map_err(|e| ExecError::HandshakeFailed(e.to_string()))?;

        let accepted = auth
            .authenticate(&mut handle, &config.user)
            .await
            .map_err(|e| {
                ExecError::HandshakeFailed(format!("{} authentication failed: {}", auth.name(), e))
            })?;
        if !accepted {
            return Err(ExecError::AuthRejected {
                user: config.user.clone(),
            });
        }
        Ok(handle)
    };

    let handle = tokio::time::timeout_at(deadline, handshake)
        .await
        .map_err(|_| {
            ExecError::HandshakeFailed(format!(
                "no handshake with {} within {:?}",
                address, timeout
            ))
        })??;

    info!("Connected to {}@{}", config.user, address);
    Ok(Connection {
        handle,
        address,
        user: config.user.clone(),
        closed: AtomicBool::new(false),
    })
}

/// Prove the transport is alive by opening and discarding one session.
///
/// # Arguments
///
/// * `transport` - The connection (or any other [`Transport`]) to check
///
/// # Returns
///
/// `Ok(())` when a session could be opened, `SessionCreateFailed`
/// otherwise. A failure closing the throwaway session is only logged.
pub async fn validate(transport: &dyn Transport) -> Result<(), ExecError> {
    let session = transport
        .open_session()
        .await
        .map_err(|e| ExecError::SessionCreateFailed(e.to_string()))?;

    if let Err(e) = session.close().await {
        if is_teardown_error(&e) {
            debug!("Validation session already closed: {}", e);
        } else {
            warn!("Failed to close validation session: {}", e);
        }
    }
    Ok(())
}

/// One live SSH connection.
pub struct Connection {
    handle: client::Handle<ClientHandler>,
    address: String,
    user: String,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("user", &self.user)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Connection {
    /// Equivalent to [`open`].
    pub async fn open(config: &ConnectionConfig) -> Result<Self, ExecError> {
        open(config).await
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// See [`validate`].
    pub async fn validate(&self) -> Result<(), ExecError> {
        validate(self).await
    }

    /// Disconnect. Only the first call does anything; teardown artifacts
    /// (peer already gone) are not reported.
    pub async fn close(&self) -> Result<(), ExecError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            Ok(()) => {
                info!("Closed connection to {}@{}", self.user, self.address);
                Ok(())
            }
            Err(e) => {
                let e = TransportError::from(e);
                if is_teardown_error(&e) {
                    debug!("Connection to {} already torn down: {}", self.address, e);
                    Ok(())
                } else {
                    Err(ExecError::CloseFailed {
                        reason: e.to_string(),
                        output: None,
                    })
                }
            }
        }
    }
}

#[async_trait]
impl Transport for Connection {
    async fn open_session(&self) -> Result<Box<dyn RemoteSession>, TransportError> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Box::new(ChannelSession::new(channel)))
    }
}
