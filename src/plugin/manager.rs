//! Multiplexes hook calls across every loaded plugin: fan-out for
//! unit-return hooks, first-`Some`-wins for the rest, fault isolation
//! for both, plus disk rediscovery and the replay-on-load rule.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::{join_all, FutureExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::loader::{self, LoadedPlugin};
use super::PluginHooks;
use crate::connection::ProxyConnection;
use crate::error::ProxyError;
use crate::shared::{FilterOutcome, Metadata};

/// Holds every currently-loaded plugin (in registration order — that
/// order is the short-circuit chain's iteration order) and the set of
/// currently-open connections, for the replay-on-load rule.
pub struct PluginManager {
    plugins: Mutex<Vec<LoadedPlugin>>,
    open_connections: Mutex<HashMap<u64, Weak<ProxyConnection>>>,
    plugins_dir: PathBuf,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager").field("plugins_dir", &self.plugins_dir).finish()
    }
}

impl PluginManager {
    /// Build an empty manager watching `plugins_dir`. Call [`PluginManager::reload`]
    /// at least once to actually load anything.
    pub fn new(plugins_dir: impl Into<PathBuf>) -> Self {
        Self {
            plugins: Mutex::new(Vec::new()),
            open_connections: Mutex::new(HashMap::new()),
            plugins_dir: plugins_dir.into(),
        }
    }

    /// Register a connection so future plugin loads replay
    /// `tcp_new_connection` onto it. Called once, from
    /// `ProxyConnection::init`, before its own initial dispatch.
    pub async fn register_connection(&self, connection: &Arc<ProxyConnection>) {
        self.open_connections
            .lock()
            .await
            .insert(connection.id(), Arc::downgrade(connection));
    }

    /// Drop a connection from the replay set. Called once the
    /// connection's forwarding tasks have both exited.
    pub async fn unregister_connection(&self, id: u64) {
        self.open_connections.lock().await.remove(&id);
    }

    async fn live_connections(&self) -> Vec<Arc<ProxyConnection>> {
        self.open_connections.lock().await.values().filter_map(Weak::upgrade).collect()
    }

    /// Inject an already-constructed plugin directly, bypassing disk
    /// discovery. Lets other modules' tests exercise dispatch against a
    /// known hook implementation without a real cdylib fixture.
    #[cfg(test)]
    pub(crate) async fn push_plugin_for_test(&self, plugin: LoadedPlugin) {
        self.plugins.lock().await.push(plugin);
    }

    async fn snapshot(&self) -> Vec<(String, Arc<dyn PluginHooks>)> {
        self.plugins.lock().await.iter().map(|p| (p.name.clone(), p.hooks.clone())).collect()
    }

    /// Remove a plugin by name, logging why. Idempotent.
    async fn eject(&self, name: &str, reason: &str) {
        let mut plugins = self.plugins.lock().await;
        let before = plugins.len();
        plugins.retain(|p| p.name != name);
        if plugins.len() != before {
            error!(plugin = name, reason, "ejecting plugin after hook fault");
        }
    }

    /// Run a single hook invocation with panic and error isolation. A
    /// panic or an `Err` is logged, the plugin named `name` is
    /// unloaded, and `None` is returned so the caller treats this
    /// plugin's contribution as absent for the current event.
    async fn call_guarded<F, T>(&self, name: &str, fut: F) -> Option<T>
    where
        F: std::future::Future<Output = anyhow::Result<T>> + Send,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.eject(name, &format!("{e:#}")).await;
                None
            }
            Err(panic) => {
                self.eject(name, &panic_message(&panic)).await;
                None
            }
        }
    }

    // -- TCP hooks ---------------------------------------------------

    /// Fan out `tcp_new_connection` to every loaded plugin.
    pub async fn dispatch_tcp_new_connection(&self, connection: Arc<ProxyConnection>) {
        let snapshot = self.snapshot().await;
        let calls = snapshot.into_iter().map(|(name, hooks)| {
            let connection = connection.clone();
            async move {
                let fut = async move {
                    hooks.tcp_new_connection(connection).await;
                    Ok::<(), anyhow::Error>(())
                };
                self.call_guarded(&name, fut).await;
            }
        });
        join_all(calls).await;
    }

    /// Fan out `tcp_connection_closed` to every loaded plugin.
    pub async fn dispatch_tcp_connection_closed(&self, connection: Arc<ProxyConnection>) {
        let snapshot = self.snapshot().await;
        let calls = snapshot.into_iter().map(|(name, hooks)| {
            let connection = connection.clone();
            async move {
                let fut = async move {
                    hooks.tcp_connection_closed(connection).await;
                    Ok::<(), anyhow::Error>(())
                };
                self.call_guarded(&name, fut).await;
            }
        });
        join_all(calls).await;
    }

    /// Run the `tcp_decrypt` chain; `None` means every plugin declined.
    pub async fn dispatch_tcp_decrypt(
        &self,
        connection: Arc<ProxyConnection>,
        metadata: &Metadata,
        data: &Bytes,
    ) -> Option<Bytes> {
        for (name, hooks) in self.snapshot().await {
            let connection = connection.clone();
            let fut = async move { Ok::<_, anyhow::Error>(hooks.tcp_decrypt(connection, metadata, data).await) };
            if let Some(Some(replaced)) = self.call_guarded(&name, fut).await {
                return Some(replaced);
            }
        }
        None
    }

    /// Run the `tcp_filter` chain; `None` means every plugin declined
    /// (treat as `ACCEPT` with no substitution).
    pub async fn dispatch_tcp_filter(
        &self,
        connection: Arc<ProxyConnection>,
        metadata: &Metadata,
        data: &Bytes,
        context: &Bytes,
    ) -> Option<FilterOutcome> {
        for (name, hooks) in self.snapshot().await {
            let connection = connection.clone();
            let fut =
                async move { Ok::<_, anyhow::Error>(hooks.tcp_filter(connection, metadata, data, context).await) };
            if let Some(Some(outcome)) = self.call_guarded(&name, fut).await {
                return Some(outcome);
            }
        }
        None
    }

    /// Fan out `tcp_log` to every loaded plugin.
    pub async fn dispatch_tcp_log(
        &self,
        connection: Arc<ProxyConnection>,
        metadata: &Metadata,
        data: &Bytes,
        outcome: &FilterOutcome,
    ) {
        let snapshot = self.snapshot().await;
        let calls = snapshot.into_iter().map(|(name, hooks)| {
            let connection = connection.clone();
            async move {
                let fut = async move {
                    hooks.tcp_log(connection, metadata, data, outcome).await;
                    Ok::<(), anyhow::Error>(())
                };
                self.call_guarded(&name, fut).await;
            }
        });
        join_all(calls).await;
    }

    /// Run the `tcp_encrypt` chain.
    pub async fn dispatch_tcp_encrypt(
        &self,
        connection: Arc<ProxyConnection>,
        metadata: &Metadata,
        data: &Bytes,
    ) -> Option<Bytes> {
        for (name, hooks) in self.snapshot().await {
            let connection = connection.clone();
            let fut = async move { Ok::<_, anyhow::Error>(hooks.tcp_encrypt(connection, metadata, data).await) };
            if let Some(Some(replaced)) = self.call_guarded(&name, fut).await {
                return Some(replaced);
            }
        }
        None
    }

    // -- UDP hooks ----------------------------------------------------

    /// Run the `udp_decrypt` chain.
    pub async fn dispatch_udp_decrypt(&self, metadata: &Metadata, data: &Bytes) -> Option<Bytes> {
        for (name, hooks) in self.snapshot().await {
            let fut = async move { Ok::<_, anyhow::Error>(hooks.udp_decrypt(metadata, data).await) };
            if let Some(Some(replaced)) = self.call_guarded(&name, fut).await {
                return Some(replaced);
            }
        }
        None
    }

    /// Run the `udp_filter` chain.
    pub async fn dispatch_udp_filter(&self, metadata: &Metadata, data: &Bytes) -> Option<FilterOutcome> {
        for (name, hooks) in self.snapshot().await {
            let fut = async move { Ok::<_, anyhow::Error>(hooks.udp_filter(metadata, data).await) };
            if let Some(Some(outcome)) = self.call_guarded(&name, fut).await {
                return Some(outcome);
            }
        }
        None
    }

    /// Fan out `udp_log` to every loaded plugin.
    pub async fn dispatch_udp_log(&self, metadata: &Metadata, data: &Bytes, outcome: &FilterOutcome) {
        let snapshot = self.snapshot().await;
        let calls = snapshot.into_iter().map(|(name, hooks)| async move {
            let fut = async move {
                hooks.udp_log(metadata, data, outcome).await;
                Ok::<(), anyhow::Error>(())
            };
            self.call_guarded(&name, fut).await;
        });
        join_all(calls).await;
    }

    /// Run the `udp_encrypt` chain.
    pub async fn dispatch_udp_encrypt(&self, metadata: &Metadata, data: &Bytes) -> Option<Bytes> {
        for (name, hooks) in self.snapshot().await {
            let fut = async move { Ok::<_, anyhow::Error>(hooks.udp_encrypt(metadata, data).await) };
            if let Some(Some(replaced)) = self.call_guarded(&name, fut).await {
                return Some(replaced);
            }
        }
        None
    }

    // -- "other" IP protocol hooks -------------------------------------

    /// Run the `other_decrypt` chain.
    pub async fn dispatch_other_decrypt(&self, metadata: &Metadata, data: &Bytes) -> Option<Bytes> {
        for (name, hooks) in self.snapshot().await {
            let fut = async move { Ok::<_, anyhow::Error>(hooks.other_decrypt(metadata, data).await) };
            if let Some(Some(replaced)) = self.call_guarded(&name, fut).await {
                return Some(replaced);
            }
        }
        None
    }

    /// Run the `other_filter` chain.
    pub async fn dispatch_other_filter(&self, metadata: &Metadata, data: &Bytes) -> Option<FilterOutcome> {
        for (name, hooks) in self.snapshot().await {
            let fut = async move { Ok::<_, anyhow::Error>(hooks.other_filter(metadata, data).await) };
            if let Some(Some(outcome)) = self.call_guarded(&name, fut).await {
                return Some(outcome);
            }
        }
        None
    }

    /// Fan out `other_log` to every loaded plugin.
    pub async fn dispatch_other_log(&self, metadata: &Metadata, data: &Bytes, outcome: &FilterOutcome) {
        let snapshot = self.snapshot().await;
        let calls = snapshot.into_iter().map(|(name, hooks)| async move {
            let fut = async move {
                hooks.other_log(metadata, data, outcome).await;
                Ok::<(), anyhow::Error>(())
            };
            self.call_guarded(&name, fut).await;
        });
        join_all(calls).await;
    }

    /// Run the `other_encrypt` chain.
    pub async fn dispatch_other_encrypt(&self, metadata: &Metadata, data: &Bytes) -> Option<Bytes> {
        for (name, hooks) in self.snapshot().await {
            let fut = async move { Ok::<_, anyhow::Error>(hooks.other_encrypt(metadata, data).await) };
            if let Some(Some(replaced)) = self.call_guarded(&name, fut).await {
                return Some(replaced);
            }
        }
        None
    }

    // -- loading --------------------------------------------------------

    /// Rescan the plugin directory and reconcile: unload anything no
    /// longer present, reload anything still present, load anything
    /// new. Newly (re)loaded plugins replay `tcp_new_connection` for
    /// every currently-open connection before this call returns.
    /// Returns `true` iff every discovered plugin loaded/reloaded
    /// cleanly.
    pub async fn reload(&self) -> bool {
        let dir = self.plugins_dir.clone();
        self.reload_from(&dir).await
    }

    async fn reload_from(&self, dir: &Path) -> bool {
        let discovered = match loader::discover(dir) {
            Ok(d) => d,
            Err(e) => {
                let err = ProxyError::PluginLoad(e);
                error!(dir = %dir.display(), "{err}");
                return false;
            }
        };

        let mut all_ok = true;
        let mut newly_active: Vec<(String, Arc<dyn PluginHooks>)> = Vec::new();

        {
            let mut plugins = self.plugins.lock().await;
            let discovered_names: std::collections::HashSet<&str> =
                discovered.iter().map(|s| s.name.as_str()).collect();

            let before = plugins.len();
            plugins.retain(|p| discovered_names.contains(p.name.as_str()));
            if plugins.len() != before {
                info!("{} plugin(s) removed from {}; unloaded", before - plugins.len(), dir.display());
            }

            for source in &discovered {
                if let Some(slot) = plugins.iter_mut().find(|p| p.name == source.name) {
                    match slot.reload() {
                        Ok(fresh) => {
                            newly_active.push((fresh.name.clone(), fresh.hooks.clone()));
                            *slot = fresh;
                            info!(plugin = %source.name, "reloaded plugin");
                        }
                        Err(e) => {
                            let err = ProxyError::PluginLoad(e);
                            warn!(plugin = %source.name, "{err}");
                            all_ok = false;
                        }
                    }
                } else {
                    match LoadedPlugin::load(source) {
                        Ok(loaded) => {
                            newly_active.push((loaded.name.clone(), loaded.hooks.clone()));
                            plugins.push(loaded);
                            info!(plugin = %source.name, "loaded plugin");
                        }
                        Err(e) => {
                            let err = ProxyError::PluginLoad(e);
                            warn!(plugin = %source.name, "{err}");
                            all_ok = false;
                        }
                    }
                }
            }
        }

        if !newly_active.is_empty() {
            let connections = self.live_connections().await;
            debug!(
                count = newly_active.len(),
                connections = connections.len(),
                "replaying tcp_new_connection for late-joining plugin(s)"
            );
            for (name, hooks) in &newly_active {
                let calls = connections.iter().map(|connection| {
                    let connection = connection.clone();
                    let hooks = hooks.clone();
                    async move {
                        let fut = async move {
                            hooks.tcp_new_connection(connection).await;
                            Ok::<(), anyhow::Error>(())
                        };
                        self.call_guarded(name, fut).await;
                    }
                });
                join_all(calls).await;
            }
        }

        all_ok
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "plugin panicked with a non-string payload".to_string()
    }
}
