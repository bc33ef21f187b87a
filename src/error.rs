//! Error types for wireward.
//!
//! Fallible internals return `anyhow::Result` (see the pervasive
//! `anyhow::{Context, Result}` usage throughout this crate); this enum
//! exists at the binary boundary so callers outside the crate, and
//! `main`'s own exit-code logic, can match on the error taxonomy of §7
//! without parsing message strings.

use thiserror::Error;

/// Top-level error taxonomy for wireward.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error: missing env var, mismatched key derivation,
    /// malformed CIDR/address. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(anyhow::Error),

    /// A plugin failed to load (module not found, entry point missing,
    /// symbol/ABI mismatch). The offending plugin is skipped; this
    /// variant exists for the manager's own error reporting, not to
    /// abort the process.
    #[error("plugin load error: {0}")]
    PluginLoad(anyhow::Error),

    /// The underlying tunnel library failed to start or raised during
    /// accept/serve.
    #[error("tunnel error: {0}")]
    Tunnel(anyhow::Error),

    /// OS-level I/O failure outside the stream abstraction's own
    /// swallow-to-empty handling (e.g. binding a UDP socket).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_displays_source() {
        let err = ProxyError::Config(anyhow::anyhow!("missing NETWORK_OWN_PRIVATE"));
        assert_eq!(err.to_string(), "configuration error: missing NETWORK_OWN_PRIVATE");
    }

    #[test]
    fn io_error_wraps_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: ProxyError = io_err.into();
        assert!(matches!(err, ProxyError::Io(_)));
    }

    #[test]
    fn tunnel_and_plugin_load_display() {
        let err = ProxyError::Tunnel(anyhow::anyhow!("bind failed"));
        assert_eq!(err.to_string(), "tunnel error: bind failed");

        let err = ProxyError::PluginLoad(anyhow::anyhow!("missing symbol"));
        assert_eq!(err.to_string(), "plugin load error: missing symbol");
    }
}
