//! Central event loop orchestrating UDP, boringtun, and smoltcp for one
//! tunnel side acting as a server: it listens for inbound virtual TCP
//! connections, originates outbound ones on request, and surfaces UDP
//! and other IP traffic via callbacks.

use super::config::WireguardConfig;
use super::device::DEFAULT_WG_MTU;
use super::stack::VirtualStack;
use super::stream::{StreamChannelPair, StreamMessage, TunnelTcpStream};
use super::tunnel::{DecapResult, EncapResult, TunnelHandle};
use crate::stream::Stream;
use anyhow::{Context, Result};
use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use smoltcp::time::Instant as SmolInstant;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

const TIMER_TICK_MS: u64 = 250;
const MAX_STREAMS: usize = 1024;
const CONNECT_CHANNEL_SIZE: usize = 64;
const UDP_BUF_SIZE: usize = 65536;
const RECV_BUF_SIZE: usize = 8192;

/// Invoked with a newly accepted or originated TCP stream, its remote
/// peer address, and the local address it landed on.
pub type TcpHandler = Arc<dyn Fn(Stream, SocketAddr, SocketAddr) + Send + Sync>;
/// Invoked with a UDP datagram's payload, source, and destination.
pub type DatagramHandler = Arc<dyn Fn(Bytes, SocketAddr, SocketAddr) + Send + Sync>;
/// Invoked with a raw "other" IP packet's payload, source, and
/// destination address (no ports — the IP header carries none for a
/// non-UDP, non-TCP protocol).
pub type OtherHandler = Arc<dyn Fn(Bytes, IpAddr, IpAddr) + Send + Sync>;

struct ConnectRequest {
    remote_addr: SocketAddr,
    response_tx: oneshot::Sender<Result<Stream>>,
}

struct PendingConnect {
    handle: SocketHandle,
    remote_addr: SocketAddr,
    response_tx: Option<oneshot::Sender<Result<Stream>>>,
    deadline: tokio::time::Instant,
}

enum ControlMessage {
    SendDatagram { data: Bytes, src: SocketAddr, dst: SocketAddr },
    SendOther { data: Bytes },
    Close,
}

/// Handle to a running tunnel event loop, acting as a server for one
/// side of the proxy.
pub struct TunnelEventLoop {
    connect_tx: mpsc::Sender<ConnectRequest>,
    control_tx: mpsc::Sender<ControlMessage>,
    // `Mutex<Option<_>>` rather than a bare `JoinHandle` so `wait_closed`
    // can take the handle out through a shared reference instead of
    // requiring ownership of the whole event loop.
    task_handle: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TunnelEventLoop {
    /// Start the event loop in a background task: binds a UDP socket,
    /// creates the boringtun tunnel and smoltcp stack, listens on
    /// `bind_port`, and dispatches accepted/received traffic to the
    /// given handlers.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        config: &WireguardConfig,
        bind_port: u16,
        on_tcp: TcpHandler,
        on_udp: DatagramHandler,
        on_other: OtherHandler,
    ) -> Result<Self> {
        let mut tunnel = TunnelHandle::new(config).context("failed to create WireGuard tunnel")?;
        let peer_endpoint = config
            .parse_peer_endpoint()
            .context("failed to resolve WireGuard peer endpoint")?;

        let (local_ip, prefix_len) = config.parse_address()?;
        let mut stack = VirtualStack::new(local_ip, prefix_len, DEFAULT_WG_MTU)
            .context("failed to create virtual TCP/IP stack")?;
        let listen_handle = stack
            .listen_tcp(bind_port)
            .context("failed to open listening virtual TCP socket")?;

        let udp_socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("failed to bind WireGuard UDP socket")?;
        let local_udp = udp_socket.local_addr()?;
        info!(
            "{}: WireGuard UDP socket bound on {} -> peer {:?}",
            config.side, local_udp, peer_endpoint
        );

        if let Some(peer) = peer_endpoint {
            if let Some(init_pkt) = tunnel.force_handshake() {
                udp_socket
                    .send_to(&init_pkt, peer)
                    .await
                    .context("failed to send initial WG handshake")?;
                debug!("{}: sent initial WireGuard handshake", config.side);
            }
        }

        let (connect_tx, connect_rx) = mpsc::channel(CONNECT_CHANNEL_SIZE);
        let (control_tx, control_rx) = mpsc::channel(CONNECT_CHANNEL_SIZE);
        let side = config.side.clone();

        let task_handle = tokio::spawn(async move {
            let mut inner = EventLoopInner {
                udp_socket,
                tunnel,
                stack,
                streams: HashMap::new(),
                connect_rx,
                control_rx,
                pending_connects: Vec::new(),
                peer_endpoint,
                next_stream_id: 1,
                listen_handle,
                listen_port: bind_port,
                local_ip,
                on_tcp,
                on_udp,
                on_other,
                side,
                shutting_down: false,
            };
            if let Err(e) = inner.run().await {
                error!("tunnel event loop exited with error: {:#}", e);
            }
        });

        Ok(Self { connect_tx, control_tx, task_handle: std::sync::Mutex::new(Some(task_handle)) })
    }

    /// Originate a new outbound virtual TCP connection to `remote_addr`.
    pub async fn connect(&self, remote_addr: SocketAddr, timeout: Duration) -> Result<Stream> {
        let (response_tx, response_rx) = oneshot::channel();
        self.connect_tx
            .send(ConnectRequest { remote_addr, response_tx })
            .await
            .map_err(|_| anyhow::anyhow!("tunnel event loop is shut down"))?;

        tokio::time::timeout(timeout, response_rx)
            .await
            .with_context(|| format!("timeout connecting to {remote_addr}"))?
            .with_context(|| "event loop dropped connection response")?
    }

    /// Send a UDP datagram toward the tunnel's virtual network.
    pub async fn send_datagram(&self, data: Bytes, src: SocketAddr, dst: SocketAddr) -> Result<()> {
        self.control_tx
            .send(ControlMessage::SendDatagram { data, src, dst })
            .await
            .map_err(|_| anyhow::anyhow!("tunnel event loop is shut down"))
    }

    /// Send a raw "other"-protocol IP packet as-is.
    pub async fn send_other_packet(&self, data: Bytes) -> Result<()> {
        self.control_tx
            .send(ControlMessage::SendOther { data })
            .await
            .map_err(|_| anyhow::anyhow!("tunnel event loop is shut down"))
    }

    /// Request a graceful shutdown of the event loop.
    pub async fn close(&self) {
        let _ = self.control_tx.send(ControlMessage::Close).await;
    }

    /// Await the background task's completion. A second call is a
    /// no-op; only the first caller actually waits.
    pub async fn wait_closed(&self) {
        let handle = self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        match self.task_handle.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }
}

impl std::fmt::Debug for TunnelEventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelEventLoop")
            .field("running", &self.is_running())
            .finish()
    }
}

struct EventLoopInner {
    udp_socket: UdpSocket,
    tunnel: TunnelHandle,
    stack: VirtualStack,
    streams: HashMap<SocketHandle, StreamChannelPair>,
    connect_rx: mpsc::Receiver<ConnectRequest>,
    control_rx: mpsc::Receiver<ControlMessage>,
    pending_connects: Vec<PendingConnect>,
    peer_endpoint: Option<SocketAddr>,
    next_stream_id: u32,
    listen_handle: SocketHandle,
    listen_port: u16,
    local_ip: Ipv4Addr,
    on_tcp: TcpHandler,
    on_udp: DatagramHandler,
    on_other: OtherHandler,
    side: String,
    shutting_down: bool,
}

impl EventLoopInner {
    async fn run(&mut self) -> Result<()> {
        let mut udp_buf = vec![0u8; UDP_BUF_SIZE];
        let mut recv_buf = [0u8; RECV_BUF_SIZE];
        let mut timer = time::interval(Duration::from_millis(TIMER_TICK_MS));
        timer.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        info!("{}: tunnel event loop started on port {}", self.side, self.listen_port);

        loop {
            if self.shutting_down {
                break;
            }

            self.process_stream_outbound();

            tokio::select! {
                result = self.udp_socket.recv_from(&mut udp_buf) => {
                    match result {
                        Ok((n, _src)) => self.handle_udp_rx(&udp_buf[..n]).await,
                        Err(e) => warn!("{}: UDP recv error: {}", self.side, e),
                    }
                }
                _ = timer.tick() => {
                    self.handle_timer_tick().await;
                }
                Some(req) = self.connect_rx.recv() => {
                    self.handle_connect_request(req);
                }
                Some(ctrl) = self.control_rx.recv() => {
                    self.handle_control(ctrl).await;
                }
            }

            self.run_pipeline(&mut recv_buf).await;
            self.check_pending_connects();
            self.check_new_accepts();
            self.dispatch_datagrams();
            self.cleanup_closed_streams();
        }

        Ok(())
    }

    async fn handle_control(&mut self, ctrl: ControlMessage) {
        match ctrl {
            ControlMessage::SendDatagram { data, src, dst } => {
                let (src_ip, src_port) = match src {
                    SocketAddr::V4(a) => (*a.ip(), a.port()),
                    SocketAddr::V6(_) => return,
                };
                let (dst_ip, dst_port) = match dst {
                    SocketAddr::V4(a) => (*a.ip(), a.port()),
                    SocketAddr::V6(_) => return,
                };
                let packet = build_ipv4_udp_packet(src_ip, src_port, dst_ip, dst_port, &data);
                self.stack.inject_packet(&packet);
            }
            ControlMessage::SendOther { data } => {
                self.stack.inject_packet(&data);
            }
            ControlMessage::Close => {
                self.shutting_down = true;
            }
        }
    }

    async fn handle_udp_rx(&mut self, data: &[u8]) {
        let result = self.tunnel.decapsulate(data);
        match result {
            DecapResult::IpPacket(pkt) => {
                self.stack.inject_packet(pkt);
            }
            DecapResult::SendToNetwork(pkt) => {
                let pkt = pkt.to_vec();
                self.send_udp(&pkt).await;
                self.flush_decapsulate().await;
            }
            DecapResult::Done => {}
        }
    }

    async fn flush_decapsulate(&mut self) {
        loop {
            match self.tunnel.decapsulate_flush() {
                DecapResult::IpPacket(pkt) => self.stack.inject_packet(pkt),
                DecapResult::SendToNetwork(pkt) => {
                    let pkt = pkt.to_vec();
                    self.send_udp(&pkt).await;
                }
                DecapResult::Done => break,
            }
        }
    }

    async fn handle_timer_tick(&mut self) {
        let packets = self.tunnel.update_timers();
        for pkt in &packets {
            self.send_udp(pkt).await;
        }
    }

    fn handle_connect_request(&mut self, req: ConnectRequest) {
        if self.streams.len() >= MAX_STREAMS {
            let _ = req.response_tx.send(Err(anyhow::anyhow!(
                "maximum concurrent tunnel streams ({MAX_STREAMS}) exceeded"
            )));
            return;
        }

        let remote_ip = match req.remote_addr.ip() {
            std::net::IpAddr::V4(ip) => ip,
            std::net::IpAddr::V6(_) => {
                let _ = req
                    .response_tx
                    .send(Err(anyhow::anyhow!("IPv6 not supported in virtual stack")));
                return;
            }
        };

        match self.stack.connect_tcp(remote_ip, req.remote_addr.port()) {
            Ok(handle) => {
                self.pending_connects.push(PendingConnect {
                    handle,
                    remote_addr: req.remote_addr,
                    response_tx: Some(req.response_tx),
                    deadline: tokio::time::Instant::now() + Duration::from_secs(10),
                });
                debug!(
                    "{}: virtual TCP connect initiated: handle={:?}, target={}",
                    self.side, handle, req.remote_addr
                );
            }
            Err(e) => {
                let _ = req.response_tx.send(Err(e));
            }
        }
    }

    /// Re-arm the listening socket and notify `on_tcp` when a peer has
    /// connected to it.
    fn check_new_accepts(&mut self) {
        if !self.stack.tcp_accepted(self.listen_handle) {
            return;
        }

        let accepted_handle = self.listen_handle;
        match self.stack.listen_tcp(self.listen_port) {
            Ok(new_handle) => self.listen_handle = new_handle,
            Err(e) => {
                warn!("{}: failed to re-arm listening socket: {}", self.side, e);
                return;
            }
        }

        if !self.stack.is_tcp_connected(accepted_handle) {
            // Still mid-handshake; check again next iteration. We've
            // already re-armed the listener so new peers aren't blocked.
            self.pending_connects.push(PendingConnect {
                handle: accepted_handle,
                remote_addr: "0.0.0.0:0".parse().unwrap(),
                response_tx: None,
                deadline: tokio::time::Instant::now() + Duration::from_secs(10),
            });
            return;
        }

        self.accept_established(accepted_handle);
    }

    fn accept_established(&mut self, handle: SocketHandle) {
        let remote = self
            .stack
            .tcp_remote_endpoint(handle)
            .map(|(ip, port)| SocketAddr::new(ip.into(), port))
            .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        let (stream, channels) = TunnelTcpStream::new_pair(stream_id, remote);
        self.streams.insert(handle, channels);

        let local = SocketAddr::new(self.local_ip.into(), self.listen_port);
        debug!(
            "{}: accepted virtual TCP connection: stream_id={}, peer={}",
            self.side, stream_id, remote
        );
        (self.on_tcp)(Stream::new(stream), remote, local);
    }

    fn process_stream_outbound(&mut self) {
        let handles: Vec<SocketHandle> = self.streams.keys().copied().collect();
        for handle in handles {
            if let Some(channels) = self.streams.get_mut(&handle) {
                loop {
                    match channels.outbound_rx.try_recv() {
                        Ok(StreamMessage::Data(data)) => {
                            if let Err(e) = self.stack.tcp_send(handle, &data) {
                                trace!("{}: tcp_send failed for {:?}: {}", self.side, handle, e);
                            }
                        }
                        Ok(StreamMessage::Close { force }) => {
                            if force {
                                self.stack.abort_tcp(handle);
                            } else {
                                self.stack.close_tcp(handle);
                            }
                        }
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            self.stack.close_tcp(handle);
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn run_pipeline(&mut self, recv_buf: &mut [u8]) {
        self.stack.poll(SmolInstant::now());

        let tx_packets = self.stack.drain_tx_packets();
        for ip_pkt in &tx_packets {
            let result = self.tunnel.encapsulate(ip_pkt);
            match result {
                EncapResult::Packet(encrypted) => {
                    let encrypted = encrypted.to_vec();
                    self.send_udp(&encrypted).await;
                }
                EncapResult::HandshakeInit(pkt) => {
                    let pkt = pkt.to_vec();
                    self.send_udp(&pkt).await;
                }
                EncapResult::Done => {}
            }
        }

        let handles: Vec<SocketHandle> = self.streams.keys().copied().collect();
        for handle in handles {
            if !self.stack.tcp_can_recv(handle) {
                continue;
            }
            match self.stack.tcp_recv(handle, recv_buf) {
                Ok(n) if n > 0 => {
                    if let Some(channels) = self.streams.get(&handle) {
                        let data = Bytes::copy_from_slice(&recv_buf[..n]);
                        if channels.inbound_tx.try_send(data).is_err() {
                            warn!("{}: stream inbound channel full/closed for {:?}", self.side, handle);
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => trace!("{}: tcp_recv error for {:?}: {}", self.side, handle, e),
            }
        }
    }

    fn dispatch_datagrams(&mut self) {
        for dgram in self.stack.drain_udp_datagrams() {
            let src = SocketAddr::new(dgram.src_ip.into(), dgram.src_port);
            let dst = SocketAddr::new(dgram.dst_ip.into(), dgram.dst_port);
            (self.on_udp)(Bytes::from(dgram.payload), src, dst);
        }
        for pkt in self.stack.drain_other_packets() {
            (self.on_other)(Bytes::from(pkt.payload), pkt.src_ip.into(), pkt.dst_ip.into());
        }
    }

    fn check_pending_connects(&mut self) {
        let now = tokio::time::Instant::now();
        let mut completed = Vec::new();

        for (i, pending) in self.pending_connects.iter().enumerate() {
            if self.stack.is_tcp_connected(pending.handle) {
                completed.push((i, true));
            } else if self.stack.is_tcp_closed(pending.handle) || now >= pending.deadline {
                completed.push((i, false));
            }
        }

        for (i, success) in completed.into_iter().rev() {
            let pending = self.pending_connects.remove(i);
            match (success, pending.response_tx) {
                (true, Some(response_tx)) => {
                    let stream_id = self.next_stream_id;
                    self.next_stream_id += 1;
                    let (stream, channels) = TunnelTcpStream::new_pair(stream_id, pending.remote_addr);
                    self.streams.insert(pending.handle, channels);
                    debug!(
                        "{}: virtual TCP connected: stream_id={}, handle={:?}",
                        self.side, stream_id, pending.handle
                    );
                    let _ = response_tx.send(Ok(Stream::new(stream)));
                }
                (true, None) => {
                    // This was a re-checked accept, not an outbound connect.
                    self.accept_established(pending.handle);
                }
                (false, Some(response_tx)) => {
                    let state = self.stack.tcp_state_str(pending.handle);
                    warn!(
                        "{}: virtual TCP connect failed: handle={:?}, state={}",
                        self.side, pending.handle, state
                    );
                    self.stack.abort_tcp(pending.handle);
                    let _ = response_tx.send(Err(anyhow::anyhow!(
                        "virtual TCP connection failed (state={state})"
                    )));
                }
                (false, None) => {
                    self.stack.abort_tcp(pending.handle);
                }
            }
        }
    }

    fn cleanup_closed_streams(&mut self) {
        let closed: Vec<SocketHandle> = self
            .streams
            .keys()
            .filter(|h| self.stack.is_tcp_closed(**h))
            .copied()
            .collect();

        for handle in closed {
            if let Some(channels) = self.streams.remove(&handle) {
                debug!("{}: cleaning up closed stream for {:?}", self.side, handle);
                let _ = channels.inbound_tx.try_send(Bytes::new());
                drop(channels);
            }
            self.stack.remove_tcp(handle);
        }
    }

    async fn send_udp(&self, data: &[u8]) {
        if let Some(peer) = self.peer_endpoint {
            if let Err(e) = self.udp_socket.send_to(data, peer).await {
                warn!("{}: UDP send error: {}", self.side, e);
            }
        }
    }
}

/// Build a minimal IPv4+UDP packet with a correct header checksum.
/// UDP checksum is left as zero (valid per RFC 768 for IPv4).
fn build_ipv4_udp_packet(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut buf = vec![0u8; total_len];

    buf[0] = 0x45;
    buf[1] = 0;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[4..6].copy_from_slice(&0u16.to_be_bytes());
    buf[6..8].copy_from_slice(&0u16.to_be_bytes());
    buf[8] = 64;
    buf[9] = 17; // UDP
    buf[10..12].copy_from_slice(&0u16.to_be_bytes());
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    let checksum = ipv4_header_checksum(&buf[..20]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());

    buf[20..22].copy_from_slice(&src_port.to_be_bytes());
    buf[22..24].copy_from_slice(&dst_port.to_be_bytes());
    buf[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buf[26..28].copy_from_slice(&0u16.to_be_bytes());
    buf[28..].copy_from_slice(payload);

    buf
}

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for chunk in header.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum += word as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_channel_size() {
        assert!(CONNECT_CHANNEL_SIZE > 0);
        assert!(MAX_STREAMS > 0);
    }

    #[test]
    fn test_timer_tick_interval() {
        assert_eq!(TIMER_TICK_MS, 250);
    }

    #[test]
    fn ipv4_udp_packet_has_valid_checksum() {
        let pkt = build_ipv4_udp_packet(
            Ipv4Addr::new(10, 0, 0, 1),
            1111,
            Ipv4Addr::new(10, 0, 0, 2),
            2222,
            b"hello",
        );
        assert_eq!(pkt[0], 0x45);
        assert_eq!(pkt.len(), 20 + 8 + 5);
        // A correct checksum makes the one's-complement sum of the
        // whole header (checksum field included) come out to 0xFFFF.
        let mut sum: u32 = 0;
        for chunk in pkt[..20].chunks(2) {
            sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
        }
        while sum >> 16 != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        assert_eq!(sum as u16, 0xFFFF);
    }

    // Integration-level tests for the event loop require a real
    // WireGuard peer and are deferred to the integration test suite.
}
