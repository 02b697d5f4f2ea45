//! RTCP message definitions
//!
//! The sharer protocol uses a small subset of RTCP: sender reports, receiver
//! reports, the receiver reference time report (XR/RRTR, RFC 3611), a
//! payload-specific feedback message carrying frame ACKs and packet NACKs
//! (RFC 4585 application layer feedback with the `CAST` magic), and a
//! generic-feedback pause/resume indication.

mod builder;
mod ntp;
mod parser;

pub use builder::RtcpBuilder;
pub use ntp::{from_ntp_diff, to_ntp_diff, NtpTimestamp};
pub use parser::RtcpParser;

use std::collections::{BTreeMap, BTreeSet};

use crate::time::TimeTicks;
use crate::{FrameId, RtpSsrc};

/// RTCP packet type for sender reports
pub const PACKET_TYPE_SENDER_REPORT: u8 = 200;

/// RTCP packet type for receiver reports
pub const PACKET_TYPE_RECEIVER_REPORT: u8 = 201;

/// RTCP packet type for application-defined packets
pub const PACKET_TYPE_APPLICATION_DEFINED: u8 = 204;

/// RTCP packet type for generic RTP feedback (pause/resume rides here)
pub const PACKET_TYPE_GENERIC_RTP_FEEDBACK: u8 = 205;

/// RTCP packet type for payload-specific feedback (sharer ACK/NACK)
pub const PACKET_TYPE_PAYLOAD_SPECIFIC: u8 = 206;

/// RTCP packet type for extended reports
pub const PACKET_TYPE_XR: u8 = 207;

/// Feedback message type of the sharer ACK/NACK message
pub const SHARER_FEEDBACK_FORMAT: u8 = 15;

/// The four-byte magic `"CAST"` identifying sharer feedback
pub const SHARER_FEEDBACK_MAGIC: u32 = 0x4341_5354;

/// Maximum number of loss fields in one feedback message
pub const MAX_SHARER_LOSS_FIELDS: usize = 100;

/// Smallest valid RTCP packet
pub const MIN_RTCP_LENGTH: usize = 8;

/// The set of packet ids reported missing within one frame
pub type PacketIdSet = BTreeSet<u16>;

/// Missing packets per frame, ordered by frame id
pub type MissingFramesAndPackets = BTreeMap<FrameId, PacketIdSet>;

/// Lip-sync and counter content of a sender report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpSenderInfo {
    /// NTP seconds at the moment the report was generated
    pub ntp_seconds: u32,

    /// NTP fraction at the moment the report was generated
    pub ntp_fraction: u32,

    /// The sender's media clock, sampled at the same moment
    pub rtp_timestamp: u32,

    /// Total RTP packets sent
    pub send_packet_count: u32,

    /// Total RTP payload octets sent
    pub send_octet_count: u32,
}

/// A receiver report block (RFC 3550 section 6.4.2)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpReportBlock {
    /// SSRC of the sender of this report
    pub remote_ssrc: RtpSsrc,

    /// SSRC of the RTP stream being reported on
    pub media_ssrc: RtpSsrc,

    /// Fraction of packets lost since the previous report, in 1/256 units
    pub fraction_lost: u8,

    /// Cumulative packets lost over the session (24 bits valid)
    pub cumulative_lost: u32,

    /// Highest sequence number received, extended with the wrap cycle count
    pub extended_high_sequence_number: u32,

    /// Interarrival jitter estimate
    pub jitter: u32,

    /// Middle 32 bits of the NTP timestamp of the last received sender
    /// report
    pub last_sr: u32,

    /// Delay between receiving that report and sending this one, in 1/65536
    /// second units
    pub delay_since_last_sr: u32,
}

/// Receiver reference time report (XR block type 4)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpReceiverReferenceTimeReport {
    /// SSRC of the reporting receiver
    pub remote_ssrc: RtpSsrc,

    /// NTP seconds of the receiver's reference clock
    pub ntp_seconds: u32,

    /// NTP fraction of the receiver's reference clock
    pub ntp_fraction: u32,
}

/// Pause/resume indication from the sender (best-effort hint)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpPauseResumeMessage {
    /// Id of the last frame sent before pausing
    pub last_sent: u32,

    /// Identifies this pause episode
    pub pause_id: u32,
}

/// The per-frame ACK and packet NACK message sent by the receiver
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharerFeedback {
    /// SSRC of the media stream being acknowledged
    pub media_ssrc: RtpSsrc,

    /// Newest frame received complete and in order
    pub ack_frame_id: FrameId,

    /// The receiver's current target playout delay in milliseconds
    pub target_delay_ms: u16,

    /// Set while the receiver cannot make progress without a key frame
    pub request_key_frame: bool,

    /// Frames with missing packets; an entry containing
    /// [`crate::frame::RTCP_ALL_PACKETS_LOST`] means the whole frame is
    /// missing
    pub missing_frames_and_packets: MissingFramesAndPackets,
}

impl SharerFeedback {
    /// Create an empty feedback message for a media stream
    pub fn new(media_ssrc: RtpSsrc) -> Self {
        Self {
            media_ssrc,
            ack_frame_id: crate::frame::START_FRAME_ID,
            ..Default::default()
        }
    }
}

/// Receiver-side statistics reported inside a report block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtpReceiverStatistics {
    /// Fraction of packets lost since the previous report, in 1/256 units
    pub fraction_lost: u8,

    /// Cumulative packets lost over the session (24 bits valid)
    pub cumulative_lost: u32,

    /// Highest sequence number received, extended with the wrap cycle count
    pub extended_high_sequence_number: u32,

    /// Interarrival jitter in milliseconds
    pub jitter: u32,
}

/// An NTP stamp paired with the tick value it was generated at
///
/// Created by [`crate::rtcp::RtcpSession::convert_to_ntp_and_save`] so that
/// the stamp is remembered for later round-trip-time computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RtcpTimeData {
    /// NTP seconds of the stamp
    pub ntp_seconds: u32,

    /// NTP fraction of the stamp
    pub ntp_fraction: u32,

    /// The local tick value the stamp was taken at
    pub timestamp: TimeTicks,
}
