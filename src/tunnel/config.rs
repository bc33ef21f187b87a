//! WireGuard tunnel configuration, one instance per proxy side.
//!
//! Unlike a client transport with a single static peer, each side here
//! is itself a server: its own keypair plus the one peer it tunnels
//! with (the network-side peer, or the proxy-side peer). Values are
//! read from environment variables by [`crate::config`], not TOML —
//! this type only knows how to validate and decode what it's handed.

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};
use x25519_dalek::{PublicKey, StaticSecret};

fn default_keepalive() -> u16 {
    25
}

fn default_address() -> String {
    "10.0.0.1/24".to_string()
}

fn default_allowed_ips() -> Vec<String> {
    vec!["10.0.0.0/24".to_string()]
}

/// WireGuard configuration for one tunnel side (network or proxy).
#[derive(Debug, Clone)]
pub struct WireguardConfig {
    /// Human-readable side name, used only in log messages ("network", "proxy").
    pub side: String,

    /// This side's own private key (base64, 32 bytes decoded).
    pub own_private: String,

    /// This side's own public key, as declared in the environment.
    /// Validated to be the actual derivation of `own_private`.
    pub own_public: String,

    /// The single peer's public key.
    pub peer_public: String,

    /// The peer's real network endpoint (`host:port`), if this side
    /// dials out. A side that only listens may leave this unset.
    pub peer_endpoint: Option<String>,

    /// Persistent keepalive interval in seconds (0 = disabled).
    pub persistent_keepalive: u16,

    /// Virtual IPv4 address for this side, CIDR notation.
    pub address: String,

    /// Allowed IP ranges, CIDR notation.
    pub allowed_ips: Vec<String>,
}

impl Default for WireguardConfig {
    fn default() -> Self {
        Self {
            side: String::new(),
            own_private: String::new(),
            own_public: String::new(),
            peer_public: String::new(),
            peer_endpoint: None,
            persistent_keepalive: default_keepalive(),
            address: default_address(),
            allowed_ips: default_allowed_ips(),
        }
    }
}

impl WireguardConfig {
    /// Validate the configuration, including the own-key/peer-key
    /// derivation check mandated at config load time.
    pub fn validate(&self) -> Result<()> {
        let own_private = Self::validate_key(&self.own_private, "own_private")?;
        Self::validate_key(&self.own_public, "own_public")?;
        Self::validate_key(&self.peer_public, "peer_public")?;

        let derived = PublicKey::from(&StaticSecret::from(own_private));
        let declared = self.decode_own_public()?;
        if derived.to_bytes() != declared {
            bail!(
                "{}: own_public does not match the derivation of own_private",
                self.side
            );
        }

        if let Some(endpoint) = &self.peer_endpoint {
            endpoint
                .to_socket_addrs()
                .with_context(|| format!("{}: cannot resolve peer_endpoint", self.side))?
                .next()
                .with_context(|| format!("{}: no addresses for peer_endpoint", self.side))?;
        }

        self.parse_address()
            .with_context(|| format!("{}: invalid address", self.side))?;

        for cidr in &self.allowed_ips {
            Self::validate_cidr(cidr).with_context(|| format!("{}: invalid allowed_ips", self.side))?;
        }

        Ok(())
    }

    fn validate_key(key_b64: &str, field_name: &str) -> Result<[u8; 32]> {
        if key_b64.is_empty() {
            bail!("{field_name} must not be empty");
        }
        let decoded = BASE64
            .decode(key_b64)
            .with_context(|| format!("{field_name} is not valid base64"))?;
        if decoded.len() != 32 {
            bail!(
                "{field_name} must decode to exactly 32 bytes, got {}",
                decoded.len()
            );
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&decoded);
        Ok(arr)
    }

    /// Decode `own_private` to raw bytes.
    pub fn decode_own_private(&self) -> Result<[u8; 32]> {
        Self::validate_key(&self.own_private, "own_private")
    }

    /// Decode `own_public` to raw bytes.
    pub fn decode_own_public(&self) -> Result<[u8; 32]> {
        Self::validate_key(&self.own_public, "own_public")
    }

    /// Decode `peer_public` to raw bytes.
    pub fn decode_peer_public(&self) -> Result<[u8; 32]> {
        Self::validate_key(&self.peer_public, "peer_public")
    }

    /// Resolve `peer_endpoint`, if set.
    pub fn parse_peer_endpoint(&self) -> Result<Option<SocketAddr>> {
        match &self.peer_endpoint {
            None => Ok(None),
            Some(endpoint) => Ok(Some(
                endpoint
                    .to_socket_addrs()
                    .with_context(|| format!("cannot resolve peer_endpoint: {endpoint}"))?
                    .next()
                    .with_context(|| format!("no addresses for peer_endpoint: {endpoint}"))?,
            )),
        }
    }

    /// Parse `address` from CIDR notation, returning `(ip, prefix_len)`.
    pub fn parse_address(&self) -> Result<(Ipv4Addr, u8)> {
        let parts: Vec<&str> = self.address.split('/').collect();
        if parts.len() != 2 {
            bail!("invalid address CIDR notation: {}", self.address);
        }
        let ip = parts[0]
            .parse::<Ipv4Addr>()
            .with_context(|| format!("invalid IP in address: {}", self.address))?;
        let prefix: u8 = parts[1]
            .parse()
            .with_context(|| format!("invalid prefix in address: {}", self.address))?;
        if prefix > 32 {
            bail!("address prefix must be 0-32, got {prefix}");
        }
        Ok((ip, prefix))
    }

    /// Keepalive interval, `None` when disabled (0).
    pub fn keepalive_interval(&self) -> Option<u16> {
        if self.persistent_keepalive == 0 {
            None
        } else {
            Some(self.persistent_keepalive)
        }
    }

    fn validate_cidr(cidr: &str) -> Result<()> {
        let parts: Vec<&str> = cidr.split('/').collect();
        if parts.len() != 2 {
            bail!("invalid CIDR notation: {cidr}");
        }
        parts[0]
            .parse::<Ipv4Addr>()
            .with_context(|| format!("invalid IP in CIDR: {cidr}"))?;
        let prefix: u8 = parts[1]
            .parse()
            .with_context(|| format!("invalid prefix length in CIDR: {cidr}"))?;
        if prefix > 32 {
            bail!("CIDR prefix length must be 0-32, got {prefix} in {cidr}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (String, String) {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        (BASE64.encode(secret.to_bytes()), BASE64.encode(public.to_bytes()))
    }

    fn make_valid_config() -> WireguardConfig {
        let (own_private, own_public) = keypair();
        let (_peer_private, peer_public) = keypair();
        WireguardConfig {
            side: "network".to_string(),
            own_private,
            own_public,
            peer_public,
            peer_endpoint: Some("127.0.0.1:51820".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn valid_config_validates() {
        assert!(make_valid_config().validate().is_ok());
    }

    #[test]
    fn mismatched_own_public_rejected() {
        let mut cfg = make_valid_config();
        let (_other_private, other_public) = keypair();
        cfg.own_public = other_public;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn empty_private_key_rejected() {
        let cfg = WireguardConfig {
            own_private: String::new(),
            ..make_valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn missing_peer_endpoint_is_allowed() {
        let cfg = WireguardConfig {
            peer_endpoint: None,
            ..make_valid_config()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn invalid_address_rejected() {
        let cfg = WireguardConfig {
            address: "not-an-ip".to_string(),
            ..make_valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_cidr_rejected() {
        let cfg = WireguardConfig {
            allowed_ips: vec!["10.0.0.0".to_string()],
            ..make_valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn keepalive_zero_disables() {
        let cfg = WireguardConfig {
            persistent_keepalive: 0,
            ..make_valid_config()
        };
        assert_eq!(cfg.keepalive_interval(), None);
    }
}
