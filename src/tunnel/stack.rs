//! Virtual TCP/IP stack built on smoltcp.
//!
//! [`VirtualStack`] manages a smoltcp [`Interface`] and [`SocketSet`],
//! providing virtual TCP socket lifecycle (listen, accept, connect,
//! send, recv, close) plus a raw IP capture socket used to surface UDP
//! datagrams and other IP protocols to the event loop, without
//! touching the OS kernel networking layer.

use super::device::VirtualDevice;
use anyhow::{bail, Context, Result};
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::{raw, tcp};
use smoltcp::time::Instant;
use smoltcp::wire::{
    HardwareAddress, IpAddress, IpCidr, IpProtocol, IpVersion, Ipv4Packet, UdpPacket,
};
use std::net::Ipv4Addr;
use tracing::{debug, trace};

const TCP_RX_BUF_SIZE: usize = 65536;
const TCP_TX_BUF_SIZE: usize = 65536;
const RAW_RX_BUF_SIZE: usize = 65536;
const RAW_TX_BUF_SIZE: usize = 65536;
const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_END: u16 = 65535;

/// A non-TCP datagram recovered from the raw capture socket.
pub struct RawDatagram {
    /// `true` if this was a well-formed UDP packet (`udp` fields set).
    pub is_udp: bool,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Virtual TCP/IP stack managing smoltcp internals.
pub struct VirtualStack {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: VirtualDevice,
    next_port: u16,
    /// Raw IP capture socket for UDP traffic.
    raw_udp_handle: SocketHandle,
    /// Raw IP capture socket for ICMP, standing in for "other" IP
    /// protocols this stack doesn't otherwise speak. A generic
    /// any-protocol capture isn't expressible with smoltcp's raw
    /// sockets (each is bound to one protocol number), so ICMP is the
    /// one additional protocol this ambient tunnel layer surfaces.
    raw_other_handle: SocketHandle,
}

impl VirtualStack {
    /// Create a new virtual stack with the given local IP, prefix length, and MTU.
    pub fn new(local_ip: Ipv4Addr, prefix_len: u8, mtu: usize) -> Result<Self> {
        let mut device = VirtualDevice::new(mtu);

        let config = Config::new(HardwareAddress::Ip);
        let mut iface = Interface::new(config, &mut device, Instant::now());

        let ip_addr = IpCidr::new(IpAddress::Ipv4(local_ip), prefix_len);
        iface.update_ip_addrs(|addrs| {
            addrs.push(ip_addr).ok();
        });

        let mut sockets = SocketSet::new(Vec::new());
        let raw_udp_handle = sockets.add(Self::make_raw_socket(IpProtocol::Udp));
        let raw_other_handle = sockets.add(Self::make_raw_socket(IpProtocol::Icmp));

        debug!("Virtual stack created: ip={}, mtu={}", local_ip, mtu);

        Ok(Self {
            iface,
            sockets,
            device,
            next_port: EPHEMERAL_PORT_START,
            raw_udp_handle,
            raw_other_handle,
        })
    }

    fn make_raw_socket(protocol: IpProtocol) -> raw::Socket<'static> {
        raw::Socket::new(
            IpVersion::Ipv4,
            protocol,
            raw::PacketBuffer::new(
                vec![raw::PacketMetadata::EMPTY; 64],
                vec![0u8; RAW_RX_BUF_SIZE],
            ),
            raw::PacketBuffer::new(
                vec![raw::PacketMetadata::EMPTY; 64],
                vec![0u8; RAW_TX_BUF_SIZE],
            ),
        )
    }

    /// Open a fresh virtual TCP socket listening on `port`, to pick up
    /// one incoming connection. Callers re-listen after each accept.
    pub fn listen_tcp(&mut self, port: u16) -> Result<SocketHandle> {
        let tcp_rx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF_SIZE]);
        let tcp_tx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF_SIZE]);
        let mut socket = tcp::Socket::new(tcp_rx_buf, tcp_tx_buf);
        socket
            .listen(port)
            .with_context(|| format!("smoltcp listen failed on port {port}"))?;
        let handle = self.sockets.add(socket);
        Ok(handle)
    }

    /// Create a new virtual TCP socket and initiate a connection.
    pub fn connect_tcp(&mut self, remote_ip: Ipv4Addr, remote_port: u16) -> Result<SocketHandle> {
        let local_port = self.allocate_port();

        let tcp_rx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_RX_BUF_SIZE]);
        let tcp_tx_buf = tcp::SocketBuffer::new(vec![0u8; TCP_TX_BUF_SIZE]);
        let mut socket = tcp::Socket::new(tcp_rx_buf, tcp_tx_buf);

        let remote = (IpAddress::Ipv4(remote_ip), remote_port);

        socket
            .connect(self.iface.context(), remote, local_port)
            .with_context(|| format!("smoltcp connect failed to {remote_ip}:{remote_port}"))?;

        let handle = self.sockets.add(socket);

        debug!(
            "Virtual TCP: connecting local:{} -> {}:{}  (handle={:?})",
            local_port, remote_ip, remote_port, handle
        );

        Ok(handle)
    }

    /// Poll the interface — processes packets between device and sockets.
    pub fn poll(&mut self, timestamp: Instant) {
        let _ = self
            .iface
            .poll(timestamp, &mut self.device, &mut self.sockets);
    }

    /// Whether a listening socket has moved past `Listen` (i.e. a peer
    /// connected, possibly still mid-handshake).
    pub fn tcp_accepted(&self, handle: SocketHandle) -> bool {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        socket.state() != tcp::State::Listen && socket.state() != tcp::State::Closed
    }

    pub fn is_tcp_connected(&self, handle: SocketHandle) -> bool {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        socket.state() == tcp::State::Established
    }

    pub fn is_tcp_closed(&self, handle: SocketHandle) -> bool {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        matches!(
            socket.state(),
            tcp::State::Closed | tcp::State::Closing | tcp::State::TimeWait | tcp::State::LastAck
        )
    }

    pub fn tcp_can_recv(&self, handle: SocketHandle) -> bool {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        socket.can_recv()
    }

    /// The remote endpoint of an established/accepted TCP socket.
    pub fn tcp_remote_endpoint(&self, handle: SocketHandle) -> Option<(Ipv4Addr, u16)> {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        let endpoint = socket.remote_endpoint()?;
        match endpoint.addr {
            IpAddress::Ipv4(ip) => Some((ip, endpoint.port)),
        }
    }

    pub fn tcp_send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize> {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        if !socket.can_send() {
            bail!("TCP socket not ready to send (state={:?})", socket.state());
        }
        let n = socket
            .send_slice(data)
            .with_context(|| "smoltcp send_slice failed")?;
        trace!("tcp_send: {} bytes to {:?}", n, handle);
        Ok(n)
    }

    pub fn tcp_recv(&mut self, handle: SocketHandle, buf: &mut [u8]) -> Result<usize> {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        if !socket.can_recv() {
            return Ok(0);
        }
        let n = socket
            .recv_slice(buf)
            .with_context(|| "smoltcp recv_slice failed")?;
        trace!("tcp_recv: {} bytes from {:?}", n, handle);
        Ok(n)
    }

    /// Drain UDP datagrams captured since the last poll.
    pub fn drain_udp_datagrams(&mut self) -> Vec<RawDatagram> {
        let socket = self.sockets.get_mut::<raw::Socket<'_>>(self.raw_udp_handle);
        let mut out = Vec::new();
        while let Ok(packet) = socket.recv() {
            if let Ok(ipv4) = Ipv4Packet::new_checked(packet) {
                if let Ok(udp) = UdpPacket::new_checked(ipv4.payload()) {
                    out.push(RawDatagram {
                        is_udp: true,
                        src_ip: ipv4.src_addr(),
                        dst_ip: ipv4.dst_addr(),
                        src_port: udp.src_port(),
                        dst_port: udp.dst_port(),
                        payload: udp.payload().to_vec(),
                    });
                }
            }
        }
        out
    }

    /// Drain "other" (non-TCP, non-UDP) IP packets captured since the
    /// last poll — currently just ICMP, see [`VirtualStack::new`].
    pub fn drain_other_packets(&mut self) -> Vec<RawDatagram> {
        let socket = self.sockets.get_mut::<raw::Socket<'_>>(self.raw_other_handle);
        let mut out = Vec::new();
        while let Ok(packet) = socket.recv() {
            if let Ok(ipv4) = Ipv4Packet::new_checked(packet) {
                out.push(RawDatagram {
                    is_udp: false,
                    src_ip: ipv4.src_addr(),
                    dst_ip: ipv4.dst_addr(),
                    src_port: 0,
                    dst_port: 0,
                    payload: ipv4.payload().to_vec(),
                });
            }
        }
        out
    }

    pub fn inject_packet(&mut self, packet: &[u8]) {
        self.device.inject_rx(packet);
    }

    pub fn drain_tx_packets(&mut self) -> Vec<Vec<u8>> {
        self.device.drain_tx().collect()
    }

    pub fn close_tcp(&mut self, handle: SocketHandle) {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        debug!(
            "Closing virtual TCP socket {:?} (state={:?})",
            handle,
            socket.state()
        );
        socket.close();
    }

    pub fn abort_tcp(&mut self, handle: SocketHandle) {
        let socket = self.sockets.get_mut::<tcp::Socket<'_>>(handle);
        debug!("Aborting virtual TCP socket {:?}", handle);
        socket.abort();
    }

    pub fn remove_tcp(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    pub fn tcp_state_str(&self, handle: SocketHandle) -> &'static str {
        let socket = self.sockets.get::<tcp::Socket<'_>>(handle);
        match socket.state() {
            tcp::State::Closed => "Closed",
            tcp::State::Listen => "Listen",
            tcp::State::SynSent => "SynSent",
            tcp::State::SynReceived => "SynReceived",
            tcp::State::Established => "Established",
            tcp::State::FinWait1 => "FinWait1",
            tcp::State::FinWait2 => "FinWait2",
            tcp::State::CloseWait => "CloseWait",
            tcp::State::Closing => "Closing",
            tcp::State::LastAck => "LastAck",
            tcp::State::TimeWait => "TimeWait",
        }
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = if self.next_port == EPHEMERAL_PORT_END {
            EPHEMERAL_PORT_START
        } else {
            self.next_port + 1
        };
        port
    }
}

impl std::fmt::Debug for VirtualStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualStack")
            .field("next_port", &self.next_port)
            .field("device", &self.device)
            .finish()
    }
}
