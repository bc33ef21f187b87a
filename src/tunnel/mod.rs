//! Userspace WireGuard tunnel, server mode.
//!
//! Provides [`TunnelServer`], a userspace WireGuard endpoint built on
//! `boringtun` (crypto) and `smoltcp` (virtual TCP/IP stack). No
//! TUN/TAP device is created — all packet processing happens in
//! memory, and the tunnel acts as a server: it listens for inbound
//! virtual TCP connections and can originate outbound ones, instead of
//! only dialing out like a client transport would.
//!
//! ```text
//! Core ──TCP stream──► smoltcp ──IP pkts──► boringtun ──UDP──► WG peer
//! ```

pub mod config;
mod device;
mod event_loop;
mod stack;
pub mod stream;
mod tunnel;

pub use config::WireguardConfig;
pub use event_loop::{DatagramHandler, OtherHandler, TcpHandler};
pub use stream::TunnelTcpStream;

use crate::stream::Stream;
use anyhow::{Context, Result};
use bytes::Bytes;
use event_loop::TunnelEventLoop;
use std::net::SocketAddr;
use std::time::Duration;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// One side's WireGuard tunnel endpoint, running as a background
/// event loop task.
///
/// Created per side (network, proxy) by [`crate::proxy::Proxy`]. New
/// inbound virtual TCP connections, UDP datagrams, and other IP
/// packets are delivered to the callbacks given to [`start_server`].
/// Outbound virtual TCP connections can be originated with
/// [`TunnelServer::new_connection`].
pub struct TunnelServer {
    event_loop: TunnelEventLoop,
    connect_timeout: Duration,
}

impl TunnelServer {
    /// Originate a new outbound virtual TCP connection to `dst`. `src`
    /// is accepted for symmetry with the paired tunnel's accept side
    /// and is not otherwise meaningful here (the virtual stack assigns
    /// its own ephemeral source port).
    pub async fn new_connection(&self, _src: SocketAddr, dst: SocketAddr) -> Result<Stream> {
        self.event_loop
            .connect(dst, self.connect_timeout)
            .await
            .with_context(|| format!("virtual TCP connection to {dst} failed"))
    }

    /// Send a UDP datagram into this tunnel's virtual network, as if
    /// received from `src` and addressed to `dst`.
    pub async fn send_datagram(&self, data: Bytes, dst: SocketAddr, src: SocketAddr) -> Result<()> {
        self.event_loop.send_datagram(data, src, dst).await
    }

    /// Send a raw "other"-protocol IP packet into this tunnel's
    /// virtual network as-is.
    pub async fn send_other_packet(&self, data: Bytes) -> Result<()> {
        self.event_loop.send_other_packet(data).await
    }

    /// Request a graceful shutdown of the tunnel's event loop.
    pub async fn close(&self) {
        self.event_loop.close().await;
    }

    /// Wait for the event loop task to finish after [`TunnelServer::close`].
    /// A second call is a no-op.
    pub async fn wait_closed(&self) {
        self.event_loop.wait_closed().await;
    }
}

impl std::fmt::Debug for TunnelServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelServer").field("event_loop", &self.event_loop).finish()
    }
}

/// Start a WireGuard tunnel server bound to `bind_port` on its virtual
/// interface, per `config`. `on_tcp` fires for every accepted or
/// originated virtual TCP stream, `on_udp` for every UDP datagram
/// recovered from the tunnel, `on_other` for every other IP packet.
pub async fn start_server(
    config: &WireguardConfig,
    bind_port: u16,
    on_tcp: TcpHandler,
    on_udp: DatagramHandler,
    on_other: OtherHandler,
) -> Result<TunnelServer> {
    config.validate().context("invalid WireGuard configuration")?;
    let event_loop = TunnelEventLoop::start(config, bind_port, on_tcp, on_udp, on_other)
        .await
        .with_context(|| format!("failed to start tunnel event loop for side {:?}", config.side))?;

    Ok(TunnelServer { event_loop, connect_timeout: DEFAULT_CONNECT_TIMEOUT })
}
