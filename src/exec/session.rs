//! russh client handler enforcing the caller's host-key policy.
//!
//! The handler is the only place the server's identity is checked. Which
//! check runs is decided by [`HostKeyPolicy`], chosen explicitly by whoever
//! builds the [`ConnectionConfig`](super::types::ConnectionConfig).

use russh::client;
use russh::keys::PublicKey;
use russh::keys::known_hosts::{check_known_hosts, check_known_hosts_path};
use russh::keys::ssh_key::HashAlg;
use tracing::{debug, warn};

use super::types::HostKeyPolicy;

/// Client handler for russh connections.
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl ClientHandler {
    pub(crate) fn new(host: impl Into<String>, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.into(),
            port,
            policy,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(verify_host_key(
            &self.policy,
            &self.host,
            self.port,
            server_public_key,
        ))
    }
}

/// Decide whether `key` is acceptable for `host:port` under `policy`.
pub(crate) fn verify_host_key(
    policy: &HostKeyPolicy,
    host: &str,
    port: u16,
    key: &PublicKey,
) -> bool {
    match policy {
        HostKeyPolicy::AcceptAny => {
            warn!(
                "Accepting unverified host key {} for {}:{}",
                key.fingerprint(HashAlg::Sha256),
                host,
                port
            );
            true
        }
        HostKeyPolicy::Pinned(expected) => {
            let matches = expected.key_data() == key.key_data();
            if !matches {
                warn!(
                    "Host key {} for {}:{} does not match pinned key {}",
                    key.fingerprint(HashAlg::Sha256),
                    host,
                    port,
                    expected.fingerprint(HashAlg::Sha256)
                );
            }
            matches
        }
        HostKeyPolicy::KnownHosts { path } => {
            let result = match path {
                Some(path) => check_known_hosts_path(host, port, key, path),
                None => check_known_hosts(host, port, key),
            };
            match result {
                Ok(true) => {
                    debug!("Host key for {}:{} found in known_hosts", host, port);
                    true
                }
                Ok(false) => {
                    warn!("Host {}:{} is not in known_hosts", host, port);
                    false
                }
                Err(e) => {
                    warn!("Host key verification for {}:{} failed: {}", host, port, e);
                    false
                }
            }
        }
    }
}
