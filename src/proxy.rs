//! Pairs the network-side and proxy-side tunnels and routes their
//! events into the interception pipeline.
//!
//! Which [`ProxyDirection`] a packet gets depends on which tunnel it
//! arrived on: network-side traffic is travelling from the untrusted
//! network toward the protected service (`Inbound`); proxy-side
//! traffic is the reverse (`Outbound`). Both tunnels are symmetric
//! otherwise — either side may originate a new TCP connection, and the
//! other side's counterpart stream is dialed to match.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, error, info, warn};

use crate::connection::ProxyConnection;
use crate::error::ProxyError;
use crate::plugin::PluginManager;
use crate::shared::{FilterAction, Metadata, MetadataDirection, ProxyDirection};
use crate::stream::Stream;
use crate::tunnel::{self, DatagramHandler, OtherHandler, TcpHandler, TunnelServer, WireguardConfig};

/// Which tunnel an event arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Network,
    Proxy,
}

impl Side {
    fn proxy_direction(self) -> ProxyDirection {
        match self {
            Side::Network => ProxyDirection::Inbound,
            Side::Proxy => ProxyDirection::Outbound,
        }
    }
}

/// Owns both tunnel endpoints and the shared plugin pipeline, wiring
/// new connections and datagrams between them.
///
/// Each side is held in an `Arc<OnceCell<_>>` rather than a bare
/// `TunnelServer` because the handlers each side is started with need
/// to dial the *other* side, which doesn't exist until its own
/// `start_server` call returns — see [`Proxy::start`].
pub struct Proxy {
    network: Arc<OnceCell<TunnelServer>>,
    proxy: Arc<OnceCell<TunnelServer>>,
    plugin_manager: Arc<PluginManager>,
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy").finish_non_exhaustive()
    }
}

impl Proxy {
    /// Start both tunnel endpoints and begin routing traffic between
    /// them through `plugin_manager`.
    pub async fn start(
        network_config: &WireguardConfig,
        network_port: u16,
        proxy_config: &WireguardConfig,
        proxy_port: u16,
        plugin_manager: Arc<PluginManager>,
    ) -> Result<Arc<Self>, ProxyError> {
        // Each tunnel's handlers need to dial the *other* tunnel, but
        // neither `TunnelServer` exists until `start_server` returns.
        // Each side gets a cell the other side fills in immediately
        // after it starts; traffic can't arrive before the WireGuard
        // handshake completes, which takes at least one round trip, so
        // in practice both cells are populated well before either
        // handler fires. A handler that somehow runs first logs and
        // drops the event rather than panicking.
        let network_cell: Arc<OnceCell<TunnelServer>> = Arc::new(OnceCell::new());
        let proxy_cell: Arc<OnceCell<TunnelServer>> = Arc::new(OnceCell::new());

        let network = tunnel::start_server(
            network_config,
            network_port,
            tcp_handler(Side::Network, plugin_manager.clone(), proxy_cell.clone()),
            datagram_handler(Side::Network, plugin_manager.clone(), proxy_cell.clone()),
            other_handler(Side::Network, plugin_manager.clone(), proxy_cell.clone()),
        )
        .await
        .context("failed to start network-side tunnel")
        .map_err(ProxyError::Tunnel)?;

        let proxy = tunnel::start_server(
            proxy_config,
            proxy_port,
            tcp_handler(Side::Proxy, plugin_manager.clone(), network_cell.clone()),
            datagram_handler(Side::Proxy, plugin_manager.clone(), network_cell.clone()),
            other_handler(Side::Proxy, plugin_manager.clone(), network_cell.clone()),
        )
        .await
        .context("failed to start proxy-side tunnel")
        .map_err(ProxyError::Tunnel)?;

        // `set` only fails if already set, which can't happen since
        // each cell is only ever written here, right after its tunnel
        // starts.
        let _ = network_cell.set(network);
        let _ = proxy_cell.set(proxy);

        Ok(Arc::new(Self { network: network_cell, proxy: proxy_cell, plugin_manager }))
    }

    /// Request a graceful shutdown of both tunnels.
    pub async fn close(&self) {
        if let Some(network) = self.network.get() {
            network.close().await;
        }
        if let Some(proxy) = self.proxy.get() {
            proxy.close().await;
        }
    }

    /// Wait for both tunnels' event loops to finish after [`Proxy::close`].
    pub async fn wait_closed(&self) {
        if let Some(network) = self.network.get() {
            network.wait_closed().await;
        }
        if let Some(proxy) = self.proxy.get() {
            proxy.wait_closed().await;
        }
    }

    /// Rescan the plugin directory and reconcile loaded plugins.
    pub async fn reload(&self) -> bool {
        self.plugin_manager.reload().await
    }
}

fn tcp_handler(side: Side, plugin_manager: Arc<PluginManager>, counterpart: Arc<OnceCell<TunnelServer>>) -> TcpHandler {
    Arc::new(move |stream, src, dst| {
        let plugin_manager = plugin_manager.clone();
        let counterpart = counterpart.clone();
        tokio::spawn(async move {
            handle_new_tcp(side, stream, src, dst, counterpart, plugin_manager).await;
        });
    })
}

async fn handle_new_tcp(
    side: Side,
    accepted: Stream,
    src: SocketAddr,
    dst: SocketAddr,
    counterpart: Arc<OnceCell<TunnelServer>>,
    plugin_manager: Arc<PluginManager>,
) {
    let Some(counterpart) = counterpart.get() else {
        error!(?side, "dropping new TCP connection: counterpart tunnel not ready yet");
        return;
    };

    let dialed = match counterpart.new_connection(src, dst).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(?side, %src, %dst, "failed to dial counterpart for new TCP connection: {e:#}");
            return;
        }
    };

    let metadata = Metadata::new(src.ip(), src.port(), dst.ip(), dst.port(), MetadataDirection::Bare(side.proxy_direction()));

    let (to_server, to_client) = match side {
        Side::Network => (dialed, accepted),
        Side::Proxy => (accepted, dialed),
    };

    let connection = ProxyConnection::new(metadata, to_server, to_client, plugin_manager);
    info!(connection = connection.id(), ?side, %src, %dst, "new TCP connection");
    connection.init().await;
}

fn datagram_handler(
    side: Side,
    plugin_manager: Arc<PluginManager>,
    counterpart: Arc<OnceCell<TunnelServer>>,
) -> DatagramHandler {
    Arc::new(move |data, src, dst| {
        let plugin_manager = plugin_manager.clone();
        let counterpart = counterpart.clone();
        tokio::spawn(async move {
            let Some(counterpart) = counterpart.get() else {
                error!(?side, "dropping datagram: counterpart tunnel not ready yet");
                return;
            };

            let metadata =
                Metadata::new(src.ip(), src.port(), dst.ip(), dst.port(), MetadataDirection::Bare(side.proxy_direction()));
            let Some(data) = run_udp_pipeline(&plugin_manager, &metadata, data).await else {
                debug!(?side, %src, %dst, "datagram dropped by filter chain");
                return;
            };

            if let Err(e) = counterpart.send_datagram(data, dst, src).await {
                warn!(?side, %src, %dst, "failed to forward datagram to counterpart: {e:#}");
            }
        });
    })
}

fn other_handler(
    side: Side,
    plugin_manager: Arc<PluginManager>,
    counterpart: Arc<OnceCell<TunnelServer>>,
) -> OtherHandler {
    Arc::new(move |data: Bytes, src: IpAddr, dst: IpAddr| {
        let plugin_manager = plugin_manager.clone();
        let counterpart = counterpart.clone();
        tokio::spawn(async move {
            let Some(counterpart) = counterpart.get() else {
                error!(?side, "dropping other-protocol packet: counterpart tunnel not ready yet");
                return;
            };

            // No ports: the IP header carries none for a protocol that
            // isn't TCP or UDP.
            let metadata = Metadata::new(src, 0, dst, 0, MetadataDirection::Bare(side.proxy_direction()));
            let Some(data) = run_other_pipeline(&plugin_manager, &metadata, data).await else {
                debug!(?side, %src, %dst, "other-protocol packet dropped by filter chain");
                return;
            };

            if let Err(e) = counterpart.send_other_packet(data).await {
                warn!(?side, "failed to forward other-protocol packet to counterpart: {e:#}");
            }
        });
    })
}

/// Run the stateless `udp_decrypt`/`udp_filter`/`udp_log`/`udp_encrypt`
/// chain over one datagram. `None` means a plugin rejected it.
async fn run_udp_pipeline(plugin_manager: &PluginManager, metadata: &Metadata, data: Bytes) -> Option<Bytes> {
    let data = match plugin_manager.dispatch_udp_decrypt(metadata, &data).await {
        Some(replaced) => replaced,
        None => data,
    };

    let verdict = plugin_manager.dispatch_udp_filter(metadata, &data).await;
    let outcome = verdict.clone().unwrap_or((FilterAction::Accept, None));
    plugin_manager.dispatch_udp_log(metadata, &data, &outcome).await;

    let data = match verdict {
        Some((FilterAction::Reject, _)) => return None,
        Some((_, Some(replacement))) => replacement,
        _ => data,
    };

    match plugin_manager.dispatch_udp_encrypt(metadata, &data).await {
        Some(replaced) => Some(replaced),
        None => Some(data),
    }
}

/// Run the stateless `other_decrypt`/`other_filter`/`other_log`/`other_encrypt`
/// chain over one packet. `None` means a plugin rejected it.
async fn run_other_pipeline(plugin_manager: &PluginManager, metadata: &Metadata, data: Bytes) -> Option<Bytes> {
    let data = match plugin_manager.dispatch_other_decrypt(metadata, &data).await {
        Some(replaced) => replaced,
        None => data,
    };

    let verdict = plugin_manager.dispatch_other_filter(metadata, &data).await;
    let outcome = verdict.clone().unwrap_or((FilterAction::Accept, None));
    plugin_manager.dispatch_other_log(metadata, &data, &outcome).await;

    let data = match verdict {
        Some((FilterAction::Reject, _)) => return None,
        Some((_, Some(replacement))) => replacement,
        _ => data,
    };

    match plugin_manager.dispatch_other_encrypt(metadata, &data).await {
        Some(replaced) => Some(replaced),
        None => Some(data),
    }
}
