//! Tunnel-backed [`RawIo`] connecting a forwarding task to the event loop.
//!
//! Each [`TunnelTcpStream`] corresponds to one virtual TCP connection
//! inside the smoltcp stack, communicated via channels with the event
//! loop that owns that stack.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::stream::RawIo;

const STREAM_CHANNEL_CAPACITY: usize = 256;

/// Messages sent from a [`TunnelTcpStream`] to the event loop.
#[derive(Debug)]
pub enum StreamMessage {
    /// Application data to send through the virtual TCP socket.
    Data(Bytes),
    /// Request to close the virtual TCP socket; `force` selects
    /// abort (RST) over a graceful FIN.
    Close { force: bool },
}

/// Channels connecting a [`TunnelTcpStream`] to the event loop. The
/// event loop holds the other end of each.
pub struct StreamChannelPair {
    /// Send inbound data TO the stream.
    pub inbound_tx: mpsc::Sender<Bytes>,
    /// Receive outbound data FROM the stream.
    pub outbound_rx: mpsc::Receiver<StreamMessage>,
}

/// A virtual TCP stream over the WireGuard tunnel, exposed to the core
/// as a [`RawIo`].
pub struct TunnelTcpStream {
    outbound_tx: mpsc::Sender<StreamMessage>,
    inbound_rx: Mutex<mpsc::Receiver<Bytes>>,
    read_buf: Mutex<BytesMut>,
    stream_id: u32,
    closed: Arc<AtomicBool>,
    peer_addr: SocketAddr,
}

impl TunnelTcpStream {
    /// Create a new stream and the channel pair the event loop uses to
    /// drive it.
    pub fn new_pair(stream_id: u32, peer_addr: SocketAddr) -> (Self, StreamChannelPair) {
        let (inbound_tx, inbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        let stream = TunnelTcpStream {
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            read_buf: Mutex::new(BytesMut::new()),
            stream_id,
            closed: Arc::new(AtomicBool::new(false)),
            peer_addr,
        };

        (stream, StreamChannelPair { inbound_tx, outbound_rx })
    }

    /// The identifier used to correlate this stream with its smoltcp
    /// socket handle inside the event loop.
    pub fn stream_id(&self) -> u32 {
        self.stream_id
    }

    /// Address of the peer this stream is connected to or accepted
    /// from, for `get_extra_info("peername")`-style lookups.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

#[async_trait]
impl RawIo for TunnelTcpStream {
    async fn do_read(&self, n: usize) -> Bytes {
        let mut buf = self.read_buf.lock().await;
        if buf.is_empty() {
            drop(buf);
            let mut rx = self.inbound_rx.lock().await;
            match rx.recv().await {
                Some(data) if !data.is_empty() => {
                    drop(rx);
                    buf = self.read_buf.lock().await;
                    buf.extend_from_slice(&data);
                }
                // Empty chunk signals EOF; channel closed is also EOF.
                _ => return Bytes::new(),
            }
        }
        let to_copy = std::cmp::min(buf.len(), n.max(1));
        buf.split_to(to_copy).freeze()
    }

    async fn do_write(&self, data: Bytes) -> anyhow::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("tunnel stream {} is closed", self.stream_id);
        }
        self.outbound_tx
            .send(StreamMessage::Data(data))
            .await
            .map_err(|_| anyhow::anyhow!("event loop channel closed"))
    }

    fn do_close(&self, force: bool) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.outbound_tx.try_send(StreamMessage::Close { force });
    }
}

impl std::fmt::Debug for TunnelTcpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelTcpStream")
            .field("stream_id", &self.stream_id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for TunnelTcpStream {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound_tx.try_send(StreamMessage::Close { force: true });
        }
    }
}
