//! Plugin contract: the hook set a dynamically-loaded module implements,
//! and the dispatch rule ([`HookKind`]) governing how each hook chains.
//!
//! A plugin sees a subset of these hooks — every default is a no-op pass
//! through, mirroring "do nothing" being a valid plugin in the source
//! system. [`loader`] turns a path on disk into a live [`LoadedPlugin`];
//! [`manager`] multiplexes calls across all currently-loaded plugins.

pub mod loader;
pub mod manager;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::connection::ProxyConnection;
use crate::shared::{FilterOutcome, Metadata};

pub use loader::{LoadedPlugin, PLUGIN_EXTENSION};
pub use manager::PluginManager;

/// Whether a hook's chain fans out to every plugin or short-circuits on
/// the first non-`None` answer. Purely descriptive — `PluginManager`'s
/// dispatch methods each hard-code the behavior for their own hook, but
/// this enum documents the table from the plugin contract in one place
/// and backs the manager's own tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Every registered plugin runs; the chain has no output.
    FanOut,
    /// Plugins run in registration order until one returns `Some`.
    ShortCircuit,
}

impl HookKind {
    /// Whether this kind's chain fans out to every plugin.
    pub fn fans_out(self) -> bool {
        matches!(self, HookKind::FanOut)
    }
}

/// The hook set a plugin implements. Every method defaults to a no-op
/// (or "decline") so a plugin only overrides what it cares about.
///
/// `tcp_*` hooks carry the owning [`ProxyConnection`] so a plugin can
/// call [`ProxyConnection::wrap`] or touch `connection.extra`. `udp_*`
/// and `other_*` hooks are stateless at this layer and carry no
/// connection.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    /// Fired once per connection, before any byte is dispatched.
    async fn tcp_new_connection(&self, _connection: Arc<ProxyConnection>) {}

    /// Fired once per connection, after both forwarding tasks exit.
    async fn tcp_connection_closed(&self, _connection: Arc<ProxyConnection>) {}

    /// Decrypt/transform inbound bytes before they enter the context
    /// window. `Some` substitutes; `None` passes `data` through.
    async fn tcp_decrypt(
        &self,
        _connection: Arc<ProxyConnection>,
        _metadata: &Metadata,
        _data: &Bytes,
    ) -> Option<Bytes> {
        None
    }

    /// Inspect `data` against the rolling `context` window and decide
    /// whether to accept, reject, or alert.
    async fn tcp_filter(
        &self,
        _connection: Arc<ProxyConnection>,
        _metadata: &Metadata,
        _data: &Bytes,
        _context: &Bytes,
    ) -> Option<FilterOutcome> {
        None
    }

    /// Observe the filter chain's outcome. Never short-circuits; never
    /// mutates the byte stream.
    async fn tcp_log(
        &self,
        _connection: Arc<ProxyConnection>,
        _metadata: &Metadata,
        _data: &Bytes,
        _outcome: &FilterOutcome,
    ) {
    }

    /// Re-encrypt/transform bytes immediately before the write.
    async fn tcp_encrypt(
        &self,
        _connection: Arc<ProxyConnection>,
        _metadata: &Metadata,
        _data: &Bytes,
    ) -> Option<Bytes> {
        None
    }

    /// UDP counterpart of `tcp_decrypt`.
    async fn udp_decrypt(&self, _metadata: &Metadata, _data: &Bytes) -> Option<Bytes> {
        None
    }

    /// UDP counterpart of `tcp_filter`. UDP has no context window —
    /// a plugin tracking flow state does so itself.
    async fn udp_filter(&self, _metadata: &Metadata, _data: &Bytes) -> Option<FilterOutcome> {
        None
    }

    /// UDP counterpart of `tcp_log`.
    async fn udp_log(&self, _metadata: &Metadata, _data: &Bytes, _outcome: &FilterOutcome) {}

    /// UDP counterpart of `tcp_encrypt`.
    async fn udp_encrypt(&self, _metadata: &Metadata, _data: &Bytes) -> Option<Bytes> {
        None
    }

    /// "Other" IP protocol counterpart of `tcp_decrypt`.
    async fn other_decrypt(&self, _metadata: &Metadata, _data: &Bytes) -> Option<Bytes> {
        None
    }

    /// "Other" IP protocol counterpart of `tcp_filter`.
    async fn other_filter(&self, _metadata: &Metadata, _data: &Bytes) -> Option<FilterOutcome> {
        None
    }

    /// "Other" IP protocol counterpart of `tcp_log`.
    async fn other_log(&self, _metadata: &Metadata, _data: &Bytes, _outcome: &FilterOutcome) {}

    /// "Other" IP protocol counterpart of `tcp_encrypt`.
    async fn other_encrypt(&self, _metadata: &Metadata, _data: &Bytes) -> Option<Bytes> {
        None
    }
}
