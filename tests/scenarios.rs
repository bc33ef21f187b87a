//! End-to-end scenarios driven against the public API, without a real
//! WireGuard peer or a compiled plugin dynamic library.
//!
//! Scenarios 1-3 and 6 of the plugin contract (pass-through, filter
//! reject, filter mutate, fault ejection) are covered as in-crate unit
//! tests in `src/connection.rs` and `src/plugin/manager.rs`, where
//! `#[cfg(test)]` test-only constructors are reachable. Here we can
//! only exercise what's public, so this file focuses on configuration
//! loading and plugin discovery/reload against real files on disk.

use std::fs;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use wireward::plugin::PluginManager;
use wireward::ProxyConfig;

// `ProxyConfig::load` reads process environment variables; integration
// test functions in one binary run concurrently by default, so every
// test touching the environment serializes through this lock.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn keypair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (BASE64.encode(secret.to_bytes()), BASE64.encode(public.to_bytes()))
}

fn set_side_env(prefix: &str, endpoint: Option<&str>) {
    let (own_private, own_public) = keypair();
    let (_peer_private, peer_public) = keypair();
    std::env::set_var(format!("{prefix}_OWN_PRIVATE"), own_private);
    std::env::set_var(format!("{prefix}_OWN_PUBLIC"), own_public);
    std::env::set_var(format!("{prefix}_PEER_PUBLIC"), peer_public);
    match endpoint {
        Some(e) => std::env::set_var(format!("{prefix}_PEER_ENDPOINT"), e),
        None => std::env::remove_var(format!("{prefix}_PEER_ENDPOINT")),
    }
}

fn clear_side_env(prefix: &str) {
    for suffix in ["OWN_PRIVATE", "OWN_PUBLIC", "PEER_PUBLIC", "PEER_ENDPOINT"] {
        std::env::remove_var(format!("{prefix}_{suffix}"));
    }
}

#[test]
fn proxy_config_loads_and_validates_both_sides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    set_side_env("NETWORK", Some("127.0.0.1:51820"));
    set_side_env("PROXY", Some("127.0.0.1:51821"));

    let config = ProxyConfig::load(None).expect("both sides present and valid");
    assert_eq!(config.network.side, "network");
    assert_eq!(config.proxy.side, "proxy");
    assert!(config.network.validate().is_ok());
    assert!(config.proxy.validate().is_ok());

    clear_side_env("NETWORK");
    clear_side_env("PROXY");
}

#[test]
fn proxy_config_rejects_mismatched_key_derivation() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    set_side_env("NETWORK", None);
    set_side_env("PROXY", None);
    // Overwrite NETWORK_OWN_PUBLIC with an unrelated key so it no
    // longer matches the derivation of NETWORK_OWN_PRIVATE.
    let (_other_private, other_public) = keypair();
    std::env::set_var("NETWORK_OWN_PUBLIC", other_public);

    let err = ProxyConfig::load(None).unwrap_err();
    assert!(err.to_string().contains("NETWORK"));

    clear_side_env("NETWORK");
    clear_side_env("PROXY");
}

#[tokio::test]
async fn plugin_manager_reload_on_empty_directory_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PluginManager::new(dir.path());
    assert!(manager.reload().await);
}

#[tokio::test]
async fn plugin_manager_reload_on_missing_directory_succeeds() {
    let manager = PluginManager::new("/nonexistent/wireward-test-plugins");
    assert!(manager.reload().await);
}

#[tokio::test]
async fn plugin_manager_skips_non_plugin_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("README.md"), b"not a plugin").unwrap();
    fs::write(dir.path().join(".hidden.plugin"), b"").unwrap();

    let manager = PluginManager::new(dir.path());
    // Neither file is a discoverable plugin candidate, so there's
    // nothing to fail to load.
    assert!(manager.reload().await);
}

#[tokio::test]
async fn plugin_manager_reports_failure_for_unloadable_plugin() {
    let dir = tempfile::tempdir().unwrap();
    // A file with the right extension but not a real dynamic library;
    // the manager discovers it, fails to load it, logs, and moves on.
    fs::write(dir.path().join("broken.plugin"), b"not an elf/dylib/dll").unwrap();

    let manager = PluginManager::new(dir.path());
    assert!(!manager.reload().await);

    // A second reload sees the same broken candidate and still fails
    // to load it, without panicking or wedging the manager.
    assert!(!manager.reload().await);
}

#[tokio::test]
async fn plugin_manager_with_no_plugins_passes_everything_through() {
    let dir = tempfile::tempdir().unwrap();
    let manager = PluginManager::new(dir.path());
    assert!(manager.reload().await);

    let metadata = wireward::shared::Metadata::new(
        "10.0.0.1".parse().unwrap(),
        1234,
        "10.0.0.2".parse().unwrap(),
        80,
        wireward::shared::MetadataDirection::Bare(wireward::shared::ProxyDirection::Inbound),
    );
    let data = bytes::Bytes::from_static(b"unchanged");

    assert!(manager.dispatch_udp_decrypt(&metadata, &data).await.is_none());
    assert!(manager.dispatch_udp_filter(&metadata, &data).await.is_none());
    assert!(manager.dispatch_other_decrypt(&metadata, &data).await.is_none());
    assert!(manager.dispatch_other_filter(&metadata, &data).await.is_none());
}
