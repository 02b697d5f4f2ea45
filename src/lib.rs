//! Transport engine for the Sharer real-time streaming protocol
//!
//! This crate implements a bidirectional RTP/RTCP sender and receiver for
//! encoded video frames over a lossy UDP link, with feedback-driven
//! retransmission, paced sending, lip-sync clock recovery and adaptive
//! playout delay.
//!
//! The library is organized into several modules:
//!
//! - `packet`: RTP and RTCP packet parsing and building
//! - `frame`: encoded frames and frame-id arithmetic
//! - `pacing`: the burst-scheduled outbound packet queue
//! - `sender`: packetization, storage, retransmission and frame admission
//! - `receiver`: frame reassembly, feedback generation and playout
//! - `rtcp`: the RTCP session state machine (RTT, lip sync, drift)
//! - `transport`: UDP datagram I/O
//! - `session`: facades composing the above and the control-plane dispatch

mod error;

// Main modules
pub mod config;
pub mod events;
pub mod frame;
pub mod packet;
pub mod pacing;
pub mod receiver;
pub mod rtcp;
pub mod sender;
pub mod session;
pub mod time;
pub mod transport;

use std::sync::Arc;

// Re-export core types
pub use error::Error;

pub use frame::{EncodedFrame, FrameDependency, FrameIdWrapHelper};
pub use packet::{RtpPacket, SharerPacket};
pub use packet::rtcp::{NtpTimestamp, SharerFeedback};
pub use time::{Clock, ClockDriftSmoother, MonotonicClock, TimeDelta, TimeTicks};

/// The default maximum size for packets on the wire, in bytes
pub const MAX_PACKET_SIZE: usize = 1500;

/// Typedef for RTP timestamp values
pub type RtpTimestamp = u32;

/// Typedef for RTP sequence numbers
pub type RtpSequenceNumber = u16;

/// Typedef for RTP synchronization source identifier
pub type RtpSsrc = u32;

/// Typedef for the 32-bit wraparound-extended frame id
pub type FrameId = u32;

/// A raw packet as sent or received on the wire
pub type Packet = Vec<u8>;

/// Shared handle to a raw packet
///
/// Packets are handed from the packetizer to storage and the pacer without
/// copying; the resend path uses `Arc::make_mut` to obtain a private copy
/// only when the packet is still referenced elsewhere.
pub type PacketRef = Arc<Packet>;

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        EncodedFrame, Error, FrameDependency, FrameId, Packet, PacketRef,
        Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp,
    };

    pub use crate::packet::rtcp::{NtpTimestamp, SharerFeedback};
    pub use crate::time::{Clock, MonotonicClock, TimeDelta, TimeTicks};
}
