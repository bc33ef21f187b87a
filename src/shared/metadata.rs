//! Immutable addressing metadata attached to every dispatched packet.

use std::net::IpAddr;

use super::direction::{ConnectionDirection, ProxyDirection};

/// Which flavor of direction a [`Metadata`] carries.
///
/// UDP events and the initial TCP-connection event carry a bare
/// [`ProxyDirection`]. TCP byte-stream events carry a pair: the network
/// half the packet came from, and which peer it is being sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataDirection {
    /// UDP / "other" / new-connection events.
    Bare(ProxyDirection),
    /// TCP byte-stream events.
    Pair(ProxyDirection, ConnectionDirection),
}

impl MetadataDirection {
    /// The underlying [`ProxyDirection`], regardless of variant.
    pub fn proxy_direction(&self) -> ProxyDirection {
        match self {
            MetadataDirection::Bare(d) => *d,
            MetadataDirection::Pair(d, _) => *d,
        }
    }
}

/// Immutable addressing record carried alongside every packet or byte
/// chunk dispatched through the hook chains.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// Source IP of the packet that produced this event.
    pub src_ip: IpAddr,
    /// Source port.
    pub src_port: u16,
    /// Destination IP.
    pub dst_ip: IpAddr,
    /// Destination port.
    pub dst_port: u16,
    /// Direction of travel; see [`MetadataDirection`].
    pub direction: MetadataDirection,
}

impl Metadata {
    /// Build a new `Metadata` record.
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        direction: MetadataDirection,
    ) -> Self {
        Self {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            direction,
        }
    }

    /// Return a copy with `src`/`dst` swapped and a new direction —
    /// used when computing the metadata for the reverse forwarding task.
    pub fn swapped(&self, direction: MetadataDirection) -> Self {
        Self {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
            direction,
        }
    }

    /// Return a copy with the same src/dst but a different direction.
    pub fn with_direction(&self, direction: MetadataDirection) -> Self {
        Self {
            direction,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn meta() -> Metadata {
        Metadata::new(
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1234,
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            80,
            MetadataDirection::Bare(ProxyDirection::Inbound),
        )
    }

    #[test]
    fn swapped_flips_src_dst() {
        let m = meta();
        let swapped = m.swapped(MetadataDirection::Pair(
            ProxyDirection::Outbound,
            ConnectionDirection::ToClient,
        ));
        assert_eq!(swapped.src_ip, m.dst_ip);
        assert_eq!(swapped.src_port, m.dst_port);
        assert_eq!(swapped.dst_ip, m.src_ip);
        assert_eq!(swapped.dst_port, m.src_port);
    }

    #[test]
    fn with_direction_keeps_addresses() {
        let m = meta();
        let d2 = MetadataDirection::Pair(ProxyDirection::Inbound, ConnectionDirection::ToServer);
        let updated = m.with_direction(d2);
        assert_eq!(updated.src_ip, m.src_ip);
        assert_eq!(updated.dst_ip, m.dst_ip);
        assert_eq!(updated.direction, d2);
    }

    #[test]
    fn proxy_direction_extracts_from_both_variants() {
        let bare = MetadataDirection::Bare(ProxyDirection::Outbound);
        let pair = MetadataDirection::Pair(ProxyDirection::Outbound, ConnectionDirection::ToServer);
        assert_eq!(bare.proxy_direction(), ProxyDirection::Outbound);
        assert_eq!(pair.proxy_direction(), ProxyDirection::Outbound);
    }
}
