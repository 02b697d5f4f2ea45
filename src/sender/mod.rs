//! Send-side pipeline
//!
//! An encoded frame travels: admission ([`VideoSender`]) -> packetization
//! and storage ([`RtpSender`]) -> pacing -> transport. Feedback from the
//! receiver flows back in through [`TransportSender`], turning NACKs into
//! retransmissions and ACKs into congestion-control updates.

mod congestion;
mod frame_sender;
mod packetizer;
mod rtp_sender;
mod storage;
mod transport_sender;
mod video_sender;

pub use congestion::{AdaptiveCongestionControl, CongestionControl, FixedCongestionControl};
pub use frame_sender::{FrameSender, RtcpDecision};
pub use packetizer::{RtpPacketizer, RtpPacketizerConfig};
pub use rtp_sender::{RtpSender, RtpSenderConfig};
pub use storage::PacketStorage;
pub use transport_sender::{IncomingPacketOutcome, TransportSender};
pub use video_sender::{FrameAdmission, VideoSender};
