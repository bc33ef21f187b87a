//! Process configuration: CLI flags plus the environment-variable
//! tunnel credentials for both sides.
//!
//! Unlike the teacher's single TOML file, credentials here come from
//! the environment (`.env` loaded first, then overlaid by the real
//! process environment), per the conventional `NETWORK_*` / `PROXY_*`
//! variable names. CLI flags cover process-level knobs and win over
//! environment defaults for the values they touch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::error::ProxyError;
use crate::tunnel::WireguardConfig;

/// Default listen port for the network-side tunnel.
pub const DEFAULT_NETWORK_PORT: u16 = 51820;
/// Default listen port for the proxy-side tunnel.
pub const DEFAULT_PROXY_PORT: u16 = 51821;
/// Default plugin discovery directory.
pub const DEFAULT_PLUGIN_DIR: &str = "./plugins";

/// wireward: intercepting WireGuard proxy with a hot-reloadable plugin pipeline.
#[derive(Parser, Debug)]
#[command(name = "wireward")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    pub json_log: bool,

    /// Directory to scan for plugins
    #[arg(long, default_value = DEFAULT_PLUGIN_DIR, env = "PLUGIN_DIR")]
    pub plugin_dir: PathBuf,

    /// Listen port for the network-side tunnel
    #[arg(long, default_value_t = DEFAULT_NETWORK_PORT)]
    pub network_port: u16,

    /// Listen port for the proxy-side tunnel
    #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
    pub proxy_port: u16,

    /// Path to a `.env` file to load before reading the process environment
    #[arg(long)]
    pub env_file: Option<PathBuf>,
}

/// Both tunnel sides' configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub network: WireguardConfig,
    pub proxy: WireguardConfig,
}

impl ProxyConfig {
    /// Load `.env` (if present at `env_file`, else the default
    /// `./.env` location), then read both sides' credentials from the
    /// process environment. Validates both configs before returning.
    pub fn load(env_file: Option<&PathBuf>) -> Result<Self, ProxyError> {
        Self::try_load(env_file).map_err(ProxyError::Config)
    }

    fn try_load(env_file: Option<&PathBuf>) -> Result<Self> {
        match env_file {
            Some(path) => {
                dotenvy::from_path(path).with_context(|| format!("failed to load env file {path:?}"))?;
            }
            None => {
                // Missing `.env` in the default location is not an error;
                // real deployments may set the environment directly.
                let _ = dotenvy::dotenv();
            }
        }

        let network = side_config("network", "NETWORK")?;
        let proxy = side_config("proxy", "PROXY")?;

        network.validate().context("invalid NETWORK_* configuration")?;
        proxy.validate().context("invalid PROXY_* configuration")?;

        Ok(Self { network, proxy })
    }
}

fn side_config(side: &str, prefix: &str) -> Result<WireguardConfig> {
    let own_private = require_env(prefix, "OWN_PRIVATE")?;
    let own_public = require_env(prefix, "OWN_PUBLIC")?;
    let peer_public = require_env(prefix, "PEER_PUBLIC")?;
    let peer_endpoint = optional_env(prefix, "PEER_ENDPOINT");

    Ok(WireguardConfig {
        side: side.to_string(),
        own_private,
        own_public,
        peer_public,
        peer_endpoint,
        ..Default::default()
    })
}

fn require_env(prefix: &str, suffix: &str) -> Result<String> {
    let key = format!("{prefix}_{suffix}");
    std::env::var(&key).with_context(|| format!("missing required environment variable {key}"))
}

fn optional_env(prefix: &str, suffix: &str) -> Option<String> {
    std::env::var(format!("{prefix}_{suffix}")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use rand::rngs::OsRng;
    use std::sync::Mutex;
    use x25519_dalek::{PublicKey, StaticSecret};

    // Tests that touch process environment must not run concurrently
    // with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn keypair() -> (String, String) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (BASE64.encode(secret.to_bytes()), BASE64.encode(public.to_bytes()))
    }

    fn set_side_env(prefix: &str) {
        let (own_private, own_public) = keypair();
        let (_peer_private, peer_public) = keypair();
        std::env::set_var(format!("{prefix}_OWN_PRIVATE"), own_private);
        std::env::set_var(format!("{prefix}_OWN_PUBLIC"), own_public);
        std::env::set_var(format!("{prefix}_PEER_PUBLIC"), peer_public);
        std::env::remove_var(format!("{prefix}_PEER_ENDPOINT"));
    }

    fn clear_side_env(prefix: &str) {
        for suffix in ["OWN_PRIVATE", "OWN_PUBLIC", "PEER_PUBLIC", "PEER_ENDPOINT"] {
            std::env::remove_var(format!("{prefix}_{suffix}"));
        }
    }

    #[test]
    fn loads_both_sides_from_environment() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        set_side_env("NETWORK");
        set_side_env("PROXY");

        let config = ProxyConfig::load(None).unwrap();
        assert_eq!(config.network.side, "network");
        assert_eq!(config.proxy.side, "proxy");

        clear_side_env("NETWORK");
        clear_side_env("PROXY");
    }

    #[test]
    fn missing_variable_is_fatal() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        clear_side_env("NETWORK");
        clear_side_env("PROXY");
        set_side_env("PROXY");

        let err = ProxyConfig::load(None).unwrap_err();
        assert!(err.to_string().contains("NETWORK_OWN_PRIVATE"));

        clear_side_env("PROXY");
    }
}
