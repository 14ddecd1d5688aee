//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::client;

use crate::exec::session::ClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - The server rejected the credentials
    /// * `Err(error)` - The exchange itself failed
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, russh::Error>;

    /// Name of this strategy, for logging.
    fn name(&self) -> &'static str;
}
