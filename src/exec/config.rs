//! Configuration resolution for remote execution.
//!
//! Every knob is resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided value (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 30s | Connection setup budget in seconds |
//! | `SSH_COMMAND_TIMEOUT` | 180s | Default command timeout in seconds |
//! | `SSH_CLEANUP_TIMEOUT_MS` | 500ms | Bound on signal delivery and session close |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//!
//! Zero durations are never returned: a zero parameter or env value falls
//! through to the next tier.

use std::env;
use std::time::Duration;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default command execution timeout in seconds
pub(crate) const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 180;

/// Default bound on cleanup steps (signal delivery, session close) in milliseconds
pub(crate) const DEFAULT_CLEANUP_TIMEOUT_MS: u64 = 500;

/// Environment variable name for SSH connection timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";

/// Environment variable name for command execution timeout
pub(crate) const COMMAND_TIMEOUT_ENV_VAR: &str = "SSH_COMMAND_TIMEOUT";

/// Environment variable name for the cleanup bound in milliseconds
pub(crate) const CLEANUP_TIMEOUT_MS_ENV_VAR: &str = "SSH_CLEANUP_TIMEOUT_MS";

/// Environment variable name for SSH compression
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";

/// Read a positive integer from the environment, ignoring unparsable and zero values.
fn positive_env(name: &str) -> Option<u64> {
    env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
}

/// Resolve the connection timeout with priority: parameter -> env var -> default
pub fn resolve_connect_timeout(timeout_param: Option<Duration>) -> Duration {
    // Priority 1: Use parameter if provided
    if let Some(timeout) = timeout_param
        && !timeout.is_zero()
    {
        return timeout;
    }

    // Priority 2: Use environment variable if set
    if let Some(secs) = positive_env(CONNECT_TIMEOUT_ENV_VAR) {
        return Duration::from_secs(secs);
    }

    // Priority 3: Default value
    Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the command timeout with priority: parameter -> env var -> default
pub fn resolve_command_timeout(timeout_param: Option<Duration>) -> Duration {
    if let Some(timeout) = timeout_param
        && !timeout.is_zero()
    {
        return timeout;
    }

    if let Some(secs) = positive_env(COMMAND_TIMEOUT_ENV_VAR) {
        return Duration::from_secs(secs);
    }

    Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS)
}

/// Resolve the cleanup bound with priority: parameter -> env var -> default
pub fn resolve_cleanup_timeout(timeout_param: Option<Duration>) -> Duration {
    if let Some(timeout) = timeout_param
        && !timeout.is_zero()
    {
        return timeout;
    }

    if let Some(ms) = positive_env(CLEANUP_TIMEOUT_MS_ENV_VAR) {
        return Duration::from_millis(ms);
    }

    Duration::from_millis(DEFAULT_CLEANUP_TIMEOUT_MS)
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}
