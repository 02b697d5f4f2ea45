//! Network transport for the sharer streams
//!
//! The transport moves raw datagrams; everything above it addresses peers
//! by logical address string. `"multicast"` names the configured remote;
//! any other string must be an address previously learned from inbound
//! traffic.

mod udp;

pub use udp::{UdpTransport, UdpTransportConfig};

use async_trait::async_trait;

use crate::pacing::SendOutcome;
use crate::{Packet, PacketRef, Result};

/// A datagram transport as seen by the session driver
///
/// The synchronous half (via [`crate::pacing::PacketSink`]) hands packets
/// out without blocking; the async half waits out backpressure.
#[async_trait]
pub trait PacketTransport: Send {
    /// Try to send one packet to a logical address
    fn try_send(&mut self, addr: &str, packet: &PacketRef) -> SendOutcome;

    /// Wait until a pending packet has been flushed
    async fn flush_pending(&mut self) -> Result<()>;
}

/// A datagram received from the network with its source address
pub type ReceivedPacket = (String, Packet);
