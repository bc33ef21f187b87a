//! Per-TCP-connection state: two forwarding tasks, context buffers,
//! and the `wrap` protocol that lets a plugin splice in a
//! transformation layer (e.g. TLS termination) mid-connection.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::plugin::PluginManager;
use crate::shared::{ConnectionDirection, FilterAction, Metadata, MetadataDirection, ProxyDirection};
use crate::stream::{RawIo, Stream, WrapperRawIo};

/// Per-read chunk size and the cap on each direction's context window.
pub const BUFFER_SIZE: usize = 8192;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Created,
    Running,
    Destroyed,
}

struct StreamSlots {
    to_server: Mutex<Stream>,
    to_client: Mutex<Stream>,
}

impl StreamSlots {
    fn slot(&self, direction: ConnectionDirection) -> &Mutex<Stream> {
        match direction {
            ConnectionDirection::ToServer => &self.to_server,
            ConnectionDirection::ToClient => &self.to_client,
        }
    }
}

struct ContextWindows {
    inbound: Mutex<BytesMut>,
    outbound: Mutex<BytesMut>,
}

impl ContextWindows {
    fn slot(&self, direction: ProxyDirection) -> &Mutex<BytesMut> {
        match direction {
            ProxyDirection::Inbound => &self.inbound,
            ProxyDirection::Outbound => &self.outbound,
        }
    }
}

/// One established TCP connection intercepted by the proxy: the
/// metadata it was opened with, the pair of streams it forwards
/// between, and the plugin-visible `extra` scratch space.
pub struct ProxyConnection {
    id: u64,
    /// Addressing metadata of the SYN that opened this connection.
    pub metadata: Metadata,
    streams: StreamSlots,
    context: ContextWindows,
    extra: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    plugin_manager: Arc<PluginManager>,
    state: Mutex<ConnectionState>,
    tasks_started: AtomicBool,
}

impl std::fmt::Debug for ProxyConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConnection").field("id", &self.id).field("metadata", &self.metadata).finish()
    }
}

impl ProxyConnection {
    /// Build a connection over an already-established pair of tunnel
    /// streams. Call [`ProxyConnection::init`] to fire
    /// `tcp_new_connection` and start forwarding.
    pub fn new(
        metadata: Metadata,
        to_server_stream: Stream,
        to_client_stream: Stream,
        plugin_manager: Arc<PluginManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            metadata,
            streams: StreamSlots {
                to_server: Mutex::new(to_server_stream),
                to_client: Mutex::new(to_client_stream),
            },
            context: ContextWindows { inbound: Mutex::new(BytesMut::new()), outbound: Mutex::new(BytesMut::new()) },
            extra: Mutex::new(HashMap::new()),
            plugin_manager,
            state: Mutex::new(ConnectionState::Created),
            tasks_started: AtomicBool::new(false),
        })
    }

    /// Stable identifier, unique for the process lifetime. Used by
    /// `PluginManager` to key its open-connections replay set.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Fire `tcp_new_connection`, then spawn the two forwarding tasks
    /// and block until both exit, firing `tcp_connection_closed`
    /// afterward. Intended to be awaited from its own spawned task.
    pub async fn init(self: &Arc<Self>) {
        *self.state.lock().await = ConnectionState::Created;
        self.plugin_manager.register_connection(self).await;
        self.plugin_manager.dispatch_tcp_new_connection(self.clone()).await;
        *self.state.lock().await = ConnectionState::Running;

        let to_server: JoinHandle<()> = {
            let this = self.clone();
            tokio::spawn(async move { this.forward(ConnectionDirection::ToServer).await })
        };
        let to_client: JoinHandle<()> = {
            let this = self.clone();
            tokio::spawn(async move { this.forward(ConnectionDirection::ToClient).await })
        };
        self.tasks_started.store(true, Ordering::SeqCst);

        if let Err(e) = to_server.await {
            warn!(connection = self.id, "to_server forwarding task panicked: {e:#}");
        }
        if let Err(e) = to_client.await {
            warn!(connection = self.id, "to_client forwarding task panicked: {e:#}");
        }

        self.plugin_manager.unregister_connection(self.id).await;
        self.plugin_manager.dispatch_tcp_connection_closed(self.clone()).await;
        *self.state.lock().await = ConnectionState::Destroyed;
        debug!(connection = self.id, "connection destroyed");
    }

    /// Splice a plugin's wrapper `RawIo` into `direction`: the wrapper
    /// takes over reading/writing for that direction, with the
    /// previously-installed stream handed to it as its own inner
    /// stream. A no-op if that direction is already closing.
    pub async fn wrap(&self, direction: ConnectionDirection, wrapper: Arc<dyn WrapperRawIo>) {
        let slot = self.streams.slot(direction);
        let mut guard = slot.lock().await;
        if guard.closing() {
            debug!(connection = self.id, ?direction, "wrap skipped: direction already closing");
            return;
        }

        let old_stream = guard.clone();
        if self.tasks_started.load(Ordering::SeqCst) {
            guard.interrupt();
        }
        wrapper.install_inner(old_stream);

        let wrapper_raw: Arc<dyn RawIo> = wrapper;
        *guard = Stream::from_arc(wrapper_raw);
        debug!(connection = self.id, ?direction, "stream wrapped");
    }

    /// Insert a plugin-owned value under `key`, surviving plugin
    /// reloads within the connection's lifetime.
    pub async fn extra_insert(&self, key: impl Into<String>, value: Box<dyn Any + Send + Sync>) {
        self.extra.lock().await.insert(key.into(), value);
    }

    /// Retrieve a previously-inserted value of type `T`, cloning it
    /// out. Returns `None` if absent or of a different type.
    pub async fn extra_get<T: 'static + Clone>(&self, key: &str) -> Option<T> {
        self.extra.lock().await.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    /// Remove a previously-inserted value.
    pub async fn extra_remove(&self, key: &str) {
        self.extra.lock().await.remove(key);
    }

    fn task_metadata(&self, to_direction: ConnectionDirection) -> Metadata {
        let initial = self.metadata.direction.proxy_direction();
        match to_direction {
            ConnectionDirection::ToServer => {
                self.metadata.with_direction(MetadataDirection::Pair(initial, ConnectionDirection::ToServer))
            }
            ConnectionDirection::ToClient => {
                self.metadata.swapped(MetadataDirection::Pair(!initial, ConnectionDirection::ToClient))
            }
        }
    }

    async fn forward(self: Arc<Self>, to_direction: ConnectionDirection) {
        let from_direction = !to_direction;
        let metadata = self.task_metadata(to_direction);
        let proxy_direction = metadata.direction.proxy_direction();

        loop {
            // Clone the stream out and drop the slot lock before
            // awaiting the read: `wrap()` needs the lock to splice in a
            // replacement, and it must be free to do that — and to call
            // interrupt() on the stream this task is about to block on
            // — while the read is still in flight, not just in the gaps
            // between reads.
            let from_stream = self.streams.slot(from_direction).lock().await.clone();
            let data = from_stream.read(BUFFER_SIZE).await;

            if from_stream.interrupted() {
                from_stream.reset_interrupt();
                continue;
            }

            if data.is_empty() {
                from_stream.close(false);
                self.streams.slot(to_direction).lock().await.close(true);
                trace!(connection = self.id, ?to_direction, "forwarding task exiting on EOF");
                break;
            }

            let data = match self.plugin_manager.dispatch_tcp_decrypt(self.clone(), &metadata, &data).await {
                Some(replaced) => replaced,
                None => data,
            };

            let context_snapshot = {
                let mut window = self.context.slot(proxy_direction).lock().await;
                window.extend_from_slice(&data);
                if window.len() > BUFFER_SIZE {
                    let excess = window.len() - BUFFER_SIZE;
                    let _ = window.split_to(excess);
                }
                Bytes::copy_from_slice(&window)
            };

            let verdict =
                self.plugin_manager.dispatch_tcp_filter(self.clone(), &metadata, &data, &context_snapshot).await;
            let outcome = verdict.clone().unwrap_or((FilterAction::Accept, None));
            self.plugin_manager.dispatch_tcp_log(self.clone(), &metadata, &data, &outcome).await;

            let data = match verdict {
                Some((FilterAction::Reject, _)) => {
                    self.streams.slot(to_direction).lock().await.close(true);
                    from_stream.close(true);
                    trace!(connection = self.id, ?to_direction, "forwarding task exiting on filter reject");
                    break;
                }
                Some((_, Some(replacement))) => replacement,
                _ => data,
            };

            let data = match self.plugin_manager.dispatch_tcp_encrypt(self.clone(), &metadata, &data).await {
                Some(replaced) => replaced,
                None => data,
            };

            if let Err(e) = self.streams.slot(to_direction).lock().await.write(data).await {
                warn!(connection = self.id, ?to_direction, "write error: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::loader::LoadedPlugin;
    use crate::plugin::PluginHooks;
    use crate::shared::{FilterOutcome, ProxyDirection};
    use crate::stream::test_support::ChannelIo;
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::time::Duration;

    fn meta() -> Metadata {
        Metadata::new(
            IpAddr::V4("10.0.0.1".parse().unwrap()),
            4000,
            IpAddr::V4("10.0.0.2".parse().unwrap()),
            80,
            MetadataDirection::Bare(ProxyDirection::Inbound),
        )
    }

    fn bare_manager() -> Arc<PluginManager> {
        Arc::new(PluginManager::new("./does-not-exist"))
    }

    /// `to_server`/`to_client` name the *internal* stream slots
    /// `ProxyConnection` owns; the harness's own ends are their wired
    /// peers, standing in for the real server and the real client.
    #[tokio::test]
    async fn pass_through_with_no_plugins() {
        let manager = bare_manager();
        let (server_side, test_server) = ChannelIo::pair();
        let (client_side, test_client) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(server_side), Stream::new(client_side), manager);

        let to_client_external = Stream::new(test_client);
        let to_server_external = Stream::new(test_server);

        to_client_external.write(Bytes::from_static(b"ping")).await.unwrap();

        let handle = tokio::spawn({
            let connection = connection.clone();
            async move { connection.init().await }
        });

        let got = tokio::time::timeout(Duration::from_secs(2), to_server_external.read(1024))
            .await
            .expect("timed out waiting for forwarded bytes");
        assert_eq!(&got[..], b"ping");

        // Drive both directions to EOF so both forwarding tasks exit and
        // `init()` returns.
        to_client_external.close(false);
        to_server_external.close(false);

        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("connection.init() did not finish").unwrap();
    }

    #[tokio::test]
    async fn task_metadata_is_symmetric() {
        let manager = bare_manager();
        let (a, b) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(a), Stream::new(b), manager);

        let to_server_meta = connection.task_metadata(ConnectionDirection::ToServer);
        assert_eq!(to_server_meta.direction, MetadataDirection::Pair(ProxyDirection::Inbound, ConnectionDirection::ToServer));
        assert_eq!(to_server_meta.src_ip, connection.metadata.src_ip);

        let to_client_meta = connection.task_metadata(ConnectionDirection::ToClient);
        assert_eq!(
            to_client_meta.direction,
            MetadataDirection::Pair(ProxyDirection::Outbound, ConnectionDirection::ToClient)
        );
        assert_eq!(to_client_meta.src_ip, connection.metadata.dst_ip);
        assert_eq!(to_client_meta.dst_ip, connection.metadata.src_ip);
    }

    #[tokio::test]
    async fn extra_roundtrips_typed_values() {
        let manager = bare_manager();
        let (a, b) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(a), Stream::new(b), manager);

        connection.extra_insert("hits", Box::new(3u32)).await;
        assert_eq!(connection.extra_get::<u32>("hits").await, Some(3));
        assert_eq!(connection.extra_get::<String>("hits").await, None);

        connection.extra_remove("hits").await;
        assert_eq!(connection.extra_get::<u32>("hits").await, None);
    }

    struct RejectOnTrigger;

    #[async_trait]
    impl PluginHooks for RejectOnTrigger {
        async fn tcp_filter(
            &self,
            _connection: Arc<ProxyConnection>,
            _metadata: &Metadata,
            _data: &Bytes,
            context: &Bytes,
        ) -> Option<FilterOutcome> {
            if context.windows(7).any(|w| w == b"AAAAAAA") {
                Some((FilterAction::Reject, None))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn filter_reject_closes_both_directions() {
        let manager = Arc::new(PluginManager::new("./does-not-exist"));
        manager.push_plugin_for_test(LoadedPlugin::load_for_test("rejector", RejectOnTrigger)).await;

        let (server_side, test_server) = ChannelIo::pair();
        let (client_side, test_client) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(server_side), Stream::new(client_side), manager);

        let to_client_external = Stream::new(test_client);
        let to_server_external = Stream::new(test_server);

        let trigger = Bytes::from_static(b"XXXXXXXXXXAAAAAAA");
        to_client_external.write(trigger).await.unwrap();

        let handle = tokio::spawn({
            let connection = connection.clone();
            async move { connection.init().await }
        });

        // Reject force-closes both internal streams without ever
        // writing the trigger through; the upstream side observes EOF
        // with no bytes.
        let got = tokio::time::timeout(Duration::from_secs(2), to_server_external.read(1024))
            .await
            .expect("timed out waiting for connection to close");
        assert!(got.is_empty());

        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("connection.init() did not finish").unwrap();
    }

    struct ReplaceBytes(&'static [u8]);

    #[async_trait]
    impl PluginHooks for ReplaceBytes {
        async fn tcp_filter(
            &self,
            _connection: Arc<ProxyConnection>,
            _metadata: &Metadata,
            _data: &Bytes,
            context: &Bytes,
        ) -> Option<FilterOutcome> {
            if context.windows(4).any(|w| w == b"flag") {
                Some((FilterAction::Accept, Some(Bytes::from_static(self.0))))
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn filter_mutate_replaces_outbound_bytes() {
        let manager = Arc::new(PluginManager::new("./does-not-exist"));
        manager.push_plugin_for_test(LoadedPlugin::load_for_test("mutator", ReplaceBytes(b"notflag\n"))).await;

        let (server_side, test_server) = ChannelIo::pair();
        let (client_side, test_client) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(server_side), Stream::new(client_side), manager);

        let to_client_external = Stream::new(test_client);
        let to_server_external = Stream::new(test_server);

        // Feed the "server"'s reply, then signal EOF on that side so the
        // to_client forwarding task exits once it's relayed the mutated
        // bytes.
        to_server_external.write(Bytes::from_static(b"here is the flag\n")).await.unwrap();
        to_server_external.close(false);

        let handle = tokio::spawn({
            let connection = connection.clone();
            async move { connection.init().await }
        });

        let got = tokio::time::timeout(Duration::from_secs(2), to_client_external.read(1024))
            .await
            .expect("timed out waiting for mutated reply");
        assert_eq!(&got[..], b"notflag\n");

        // Drop (not close — closing would flip our own read-EOF flag
        // before we're done reading) to signal EOF on the other leg so
        // the to_server task exits too.
        drop(to_client_external);

        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("connection.init() did not finish").unwrap();
    }

    /// A transparent `WrapperRawIo` that proxies straight through to
    /// whatever `install_inner` gives it, used to exercise the `wrap()`
    /// splice point itself rather than any particular transformation.
    #[derive(Debug)]
    struct Passthrough {
        inner: std::sync::Mutex<Option<Stream>>,
    }

    impl Passthrough {
        fn new() -> Arc<Self> {
            Arc::new(Self { inner: std::sync::Mutex::new(None) })
        }

        fn installed(&self) -> bool {
            self.inner.lock().unwrap().is_some()
        }
    }

    #[async_trait]
    impl RawIo for Passthrough {
        async fn do_read(&self, n: usize) -> Bytes {
            let inner = self.inner.lock().unwrap().clone().expect("wrap() must install_inner before use");
            inner.read(n).await
        }

        async fn do_write(&self, data: Bytes) -> anyhow::Result<()> {
            let inner = self.inner.lock().unwrap().clone().expect("wrap() must install_inner before use");
            inner.write(data).await
        }

        fn do_close(&self, force: bool) {
            if let Some(inner) = self.inner.lock().unwrap().clone() {
                inner.close(force);
            }
        }
    }

    impl WrapperRawIo for Passthrough {
        fn install_inner(&self, inner: Stream) {
            *self.inner.lock().unwrap() = Some(inner);
        }

        fn inner(&self) -> Stream {
            self.inner.lock().unwrap().clone().expect("install_inner was never called")
        }
    }

    #[tokio::test]
    async fn wrap_splices_a_transparent_layer_into_forwarding() {
        let manager = bare_manager();
        let (server_side, test_server) = ChannelIo::pair();
        let (client_side, test_client) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(server_side), Stream::new(client_side), manager);

        let wrapper = Passthrough::new();
        connection.wrap(ConnectionDirection::ToServer, wrapper.clone()).await;
        assert!(wrapper.installed());

        let to_client_external = Stream::new(test_client);
        let to_server_external = Stream::new(test_server);

        to_client_external.write(Bytes::from_static(b"ping")).await.unwrap();

        let handle = tokio::spawn({
            let connection = connection.clone();
            async move { connection.init().await }
        });

        // "ping" has to cross client_side -> to_server forwarding task ->
        // the wrapper's do_write -> the displaced server_side stream
        // before it's visible here, so this also proves the displaced
        // stream was handed to the wrapper rather than dropped.
        let got = tokio::time::timeout(Duration::from_secs(2), to_server_external.read(1024))
            .await
            .expect("timed out waiting for bytes relayed through the wrapper");
        assert_eq!(&got[..], b"ping");

        to_client_external.close(false);
        to_server_external.close(false);

        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("connection.init() did not finish").unwrap();
    }

    #[tokio::test]
    async fn wrap_is_a_no_op_once_the_direction_is_closing() {
        let manager = bare_manager();
        let (a, b) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(a), Stream::new(b), manager);

        connection.streams.slot(ConnectionDirection::ToServer).lock().await.close(true);

        let wrapper = Passthrough::new();
        connection.wrap(ConnectionDirection::ToServer, wrapper.clone()).await;

        assert!(!wrapper.installed());
        // The original (already-closed) stream is still in the slot, not
        // the wrapper, so reading it keeps returning EOF instead of
        // panicking on a wrapper with nothing installed.
        let got = connection.streams.slot(ConnectionDirection::ToServer).lock().await.read(16).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn wrap_while_running_interrupts_a_forwarding_task_blocked_mid_read() {
        let manager = bare_manager();
        let (server_side, test_server) = ChannelIo::pair();
        let (client_side, test_client) = ChannelIo::pair();
        let connection = ProxyConnection::new(meta(), Stream::new(server_side), Stream::new(client_side), manager);

        let to_client_external = Stream::new(test_client);
        let to_server_external = Stream::new(test_server);

        let handle = tokio::spawn({
            let connection = connection.clone();
            async move { connection.init().await }
        });

        // Let both forwarding tasks reach their first read() and genuinely
        // park there — neither side has sent anything yet.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The to-client task reads from the ToServer slot, so wrapping it
        // interrupts exactly the read that task is blocked in.
        let wrapper = Passthrough::new();
        connection.wrap(ConnectionDirection::ToServer, wrapper.clone()).await;
        assert!(wrapper.installed());

        // If the interrupt only flagged the stream instead of waking the
        // in-flight read, this would hang until the test times out.
        to_server_external.write(Bytes::from_static(b"hello")).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(2), to_client_external.read(1024))
            .await
            .expect("wrap()'s interrupt did not wake the blocked read in time");
        assert_eq!(&got[..], b"hello");

        to_client_external.close(false);
        to_server_external.close(false);
        tokio::time::timeout(Duration::from_secs(2), handle).await.expect("connection.init() did not finish").unwrap();
    }
}
