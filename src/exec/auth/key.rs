//! In-memory private key authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::{self, PrivateKey, PrivateKeyWithHashAlg};
use tracing::debug;

use crate::exec::error::ExecError;
use crate::exec::session::ClientHandler;

use super::traits::AuthStrategy;

/// Parse unencrypted OpenSSH or PEM key material into a signing identity.
pub fn parse_private_key(material: &str) -> Result<PrivateKey, ExecError> {
    if material.trim().is_empty() {
        return Err(ExecError::AuthKeyInvalid("no key material supplied".to_string()));
    }
    keys::decode_secret_key(material, None).map_err(|e| ExecError::AuthKeyInvalid(e.to_string()))
}

/// Public key authentication with an already parsed identity.
pub struct KeyAuth {
    key: Arc<PrivateKey>,
}

impl KeyAuth {
    pub fn new(key: PrivateKey) -> Self {
        Self { key: Arc::new(key) }
    }

    /// Parse `material` and build the strategy from it.
    pub fn from_material(material: &str) -> Result<Self, ExecError> {
        parse_private_key(material).map(Self::new)
    }

    pub fn public_key(&self) -> &keys::PublicKey {
        self.key.public_key()
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, russh::Error> {
        // For RSA keys, use the best supported hash algorithm
        let hash_alg = handle.best_supported_rsa_hash().await?.flatten();
        debug!("Using RSA hash algorithm for key auth: {:?}", hash_alg);

        let key_with_hash = PrivateKeyWithHashAlg::new(Arc::clone(&self.key), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "key"
    }
}
