//! Public-key authentication for remote connections.
//!
//! Authentication follows the Strategy pattern so the connection manager
//! only depends on [`AuthStrategy`]. The one strategy needed here is
//! [`KeyAuth`], built from private-key material already held in memory.
//!
//! Key material is parsed with [`parse_private_key`] before any network I/O,
//! so a malformed key never costs a connection attempt.

mod key;
mod traits;

pub use key::{KeyAuth, parse_private_key};
pub use traits::AuthStrategy;
