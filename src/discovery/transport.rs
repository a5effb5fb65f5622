//! Datagram transport used by discovery
//!
//! The engine never touches a socket directly; the multicast socket and the
//! in-memory transports used in tests both sit behind [`DiscoveryTransport`].

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use super::DiscoveryGroup;
use crate::readiness::NetworkAddress;

/// Largest datagram the listener reads
pub const MAX_DATAGRAM: usize = 1500;

/// A received datagram, reduced to what discovery looks at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    /// Sender address
    pub source: SocketAddrV4,
    /// Destination address from the IP header, when the platform reports it
    pub destination: Option<Ipv4Addr>,
    /// Payload length (the payload itself carries no meaning)
    pub len: usize,
}

/// Datagram socket bound to the discovery port.
///
/// `recv` and `send` may run concurrently. Once the transport is closed,
/// `recv` fails with [`io::ErrorKind::NotConnected`].
#[async_trait::async_trait]
pub trait DiscoveryTransport: Send + Sync {
    async fn recv(&self) -> io::Result<InboundPacket>;

    async fn send(&self, payload: &[u8], target: SocketAddrV4) -> io::Result<()>;
}

/// Opens the transport when discovery starts
pub trait TransportBinder: Send + Sync {
    fn bind(
        &self,
        group: &DiscoveryGroup,
        local: &NetworkAddress,
    ) -> io::Result<Arc<dyn DiscoveryTransport>>;
}

/// What the listener does with a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    /// Sent to our group by another node: join it
    Join(Ipv4Addr),
    /// Our own probe looped back
    SelfAnnounce,
    /// Sent to a different multicast group
    OtherGroup(Ipv4Addr),
    /// Unicast, or the destination is unknown
    NotMulticast,
}

/// Decide what a received packet means for discovery
pub fn classify(packet: &InboundPacket, group: Ipv4Addr, local: Ipv4Addr) -> PacketDisposition {
    let Some(destination) = packet.destination.filter(|dst| dst.is_multicast()) else {
        return PacketDisposition::NotMulticast;
    };

    if destination != group {
        return PacketDisposition::OtherGroup(destination);
    }

    let sender = *packet.source.ip();
    if sender == local {
        PacketDisposition::SelfAnnounce
    } else {
        PacketDisposition::Join(sender)
    }
}
