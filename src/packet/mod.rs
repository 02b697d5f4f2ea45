//! RTP packet definitions and processing
//!
//! Every media packet carries the standard 12-byte RTP header followed by
//! the sharer header:
//!
//! ```text
//! [ std RTP header 12B ]
//! [ byte0: key(1) | ref(1) | ext_count(6) ]
//! [ frame_id u32 | packet_id u16 | max_packet_id u16 ]
//! [ reference_frame_id u32            (only if ref==1) ]
//! [ extensions * ext_count: u16 (type<<10|size) + size bytes ]
//! [ payload ]
//! ```
//!
//! RTCP compound packets share the ingress path and are told apart by their
//! payload-type byte; see [`SharerPacket::parse`].

pub mod rtcp;

use bytes::{Buf, Bytes};

use crate::error::Error;
use crate::{FrameId, Result, RtpSequenceNumber, RtpSsrc, RtpTimestamp};

/// RTP protocol version (always 2 in practice)
pub const RTP_VERSION: u8 = 2;

/// Length of the standard RTP header
pub const RTP_HEADER_LENGTH: usize = 12;

/// Nominal sharer header length used when sizing payload splits
pub const SHARER_HEADER_LENGTH: usize = 7;

/// Smallest complete sharer header on the wire (byte0 + frame_id +
/// packet_id + max_packet_id)
pub const SHARER_HEADER_MIN_LENGTH: usize = 9;

/// Marker bit in the second RTP header byte
pub const RTP_MARKER_BIT_MASK: u8 = 0x80;

/// Key-frame bit in the first sharer header byte
pub const SHARER_KEY_FRAME_BIT_MASK: u8 = 0x80;

/// Reference-frame-id-present bit in the first sharer header byte
pub const SHARER_REFERENCE_FRAME_ID_BIT_MASK: u8 = 0x40;

/// Extension-count mask in the first sharer header byte
pub const SHARER_EXTENSION_COUNT_MASK: u8 = 0x3f;

/// Sharer RTP extension carrying a u16 playout delay in milliseconds
pub const SHARER_EXTENSION_ADAPTIVE_LATENCY: u8 = 1;

/// RTP payload type for video
pub const RTP_PAYLOAD_TYPE_VIDEO: u8 = 96;

/// RTP payload type for audio
pub const RTP_PAYLOAD_TYPE_AUDIO: u8 = 127;

/// Smallest packet the classifier will look at
pub const MIN_PACKET_LENGTH: usize = 8;

/// First RTCP packet type (SMPTE time-code mapping)
pub const RTCP_PACKET_TYPE_LOW: u8 = 194;

/// Last RTCP packet type (port mapping)
pub const RTCP_PACKET_TYPE_HIGH: u8 = 210;

/// A packet received from the wire, classified as media or control
#[derive(Debug, Clone)]
pub enum SharerPacket {
    /// A media packet carrying part of an encoded frame
    Rtp(RtpPacket),

    /// A raw RTCP compound packet, handed to the RTCP session for parsing
    Rtcp(Bytes),
}

impl SharerPacket {
    /// Classify and parse a datagram
    ///
    /// A packet is RTCP when its version bits are 2 and the payload-type
    /// byte falls in `[194, 210]`; the marker bit keeps media payload types
    /// out of that range. Anything else must be a sharer RTP packet.
    pub fn parse(data: &[u8]) -> Result<SharerPacket> {
        if data.len() <= MIN_PACKET_LENGTH {
            return Err(Error::ParseError(format!("Packet too small: {}", data.len())));
        }

        if data[0] >> 6 != RTP_VERSION {
            return Err(Error::ParseError(format!("Wrong RTP version: {}", data[0] >> 6)));
        }

        if (RTCP_PACKET_TYPE_LOW..=RTCP_PACKET_TYPE_HIGH).contains(&data[1]) {
            return Ok(SharerPacket::Rtcp(Bytes::copy_from_slice(data)));
        }

        RtpPacket::parse(data).map(SharerPacket::Rtp)
    }

    /// The SSRC that sent this packet
    pub fn ssrc(&self) -> RtpSsrc {
        match self {
            SharerPacket::Rtp(rtp) => rtp.ssrc,
            SharerPacket::Rtcp(data) => {
                // Sender SSRC immediately follows the 4-byte common header.
                let mut buf = &data[4..];
                buf.get_u32()
            }
        }
    }
}

/// A parsed sharer RTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    /// Payload type from the RTP header (7 bits)
    pub payload_type: u8,

    /// Marker bit; set on the last packet of each frame
    pub marker: bool,

    /// RTP sequence number
    pub sequence_number: RtpSequenceNumber,

    /// RTP media timestamp
    pub rtp_timestamp: RtpTimestamp,

    /// Synchronization source of the sender
    pub ssrc: RtpSsrc,

    /// Whether this packet belongs to a key frame
    pub is_key_frame: bool,

    /// Frame this packet belongs to
    pub frame_id: FrameId,

    /// Position of this packet within the frame (0-based)
    pub packet_id: u16,

    /// Highest packet id of the frame (0-based; count - 1)
    pub max_packet_id: u16,

    /// Frame the carried frame depends upon
    pub referenced_frame_id: FrameId,

    /// Playout delay override carried by the adaptive latency extension;
    /// zero when absent
    pub new_playout_delay_ms: u16,

    /// The media payload carried by this packet
    pub payload: Bytes,
}

impl RtpPacket {
    /// Parse a sharer RTP packet from a datagram
    pub fn parse(data: &[u8]) -> Result<Self> {
        let pt = data[1] & 0x7f;
        if pt != RTP_PAYLOAD_TYPE_VIDEO && pt != RTP_PAYLOAD_TYPE_AUDIO {
            return Err(Error::ParseError(format!(
                "Not a video or audio packet, payload type: {}",
                pt
            )));
        }
        let marker = data[1] & RTP_MARKER_BIT_MASK != 0;

        let required = RTP_HEADER_LENGTH + SHARER_HEADER_MIN_LENGTH;
        if data.len() < required {
            return Err(Error::BufferTooSmall {
                required,
                available: data.len(),
            });
        }

        let mut buf = Bytes::copy_from_slice(data);
        buf.advance(2);
        let sequence_number = buf.get_u16();
        let rtp_timestamp = buf.get_u32();
        let ssrc = buf.get_u32();

        let bits = buf.get_u8();
        let is_key_frame = bits & SHARER_KEY_FRAME_BIT_MASK != 0;
        let includes_specific_frame_reference = bits & SHARER_REFERENCE_FRAME_ID_BIT_MASK != 0;

        let frame_id = buf.get_u32();
        let packet_id = buf.get_u16();
        let max_packet_id = buf.get_u16();

        if max_packet_id < packet_id {
            return Err(Error::InvalidPacket(format!(
                "packet_id {} exceeds max_packet_id {}",
                packet_id, max_packet_id
            )));
        }

        let referenced_frame_id = if includes_specific_frame_reference {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
            }
            buf.get_u32()
        } else if is_key_frame {
            frame_id
        } else {
            frame_id.wrapping_sub(1)
        };

        let mut new_playout_delay_ms = 0;
        for _ in 0..(bits & SHARER_EXTENSION_COUNT_MASK) {
            if buf.remaining() < 2 {
                return Err(Error::BufferTooSmall { required: 2, available: buf.remaining() });
            }
            let type_and_size = buf.get_u16();
            let size = usize::from(type_and_size & 0x3ff);
            if buf.remaining() < size {
                return Err(Error::BufferTooSmall { required: size, available: buf.remaining() });
            }
            let mut chunk = buf.split_to(size);
            match (type_and_size >> 10) as u8 {
                SHARER_EXTENSION_ADAPTIVE_LATENCY => {
                    if chunk.remaining() < 2 {
                        return Err(Error::BufferTooSmall {
                            required: 2,
                            available: chunk.remaining(),
                        });
                    }
                    new_playout_delay_ms = chunk.get_u16();
                }
                _ => {
                    // Unknown extension, already skipped by its size.
                }
            }
        }

        Ok(Self {
            payload_type: pt,
            marker,
            sequence_number,
            rtp_timestamp,
            ssrc,
            is_key_frame,
            frame_id,
            packet_id,
            max_packet_id,
            referenced_frame_id,
            new_playout_delay_ms,
            payload: buf,
        })
    }
}

/// Format a byte slice as space-separated hex, for debug logging
pub fn hex_dump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn build_rtp(
        marker: bool,
        seq: u16,
        timestamp: u32,
        ssrc: u32,
        key: bool,
        frame_id: u32,
        packet_id: u16,
        max_packet_id: u16,
        reference_frame_id: Option<u32>,
        playout_delay_ms: Option<u16>,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_u8(0x80);
        buf.put_u8(RTP_PAYLOAD_TYPE_VIDEO | if marker { RTP_MARKER_BIT_MASK } else { 0 });
        buf.put_u16(seq);
        buf.put_u32(timestamp);
        buf.put_u32(ssrc);

        let mut byte0 = 0u8;
        if key {
            byte0 |= SHARER_KEY_FRAME_BIT_MASK;
        }
        if reference_frame_id.is_some() {
            byte0 |= SHARER_REFERENCE_FRAME_ID_BIT_MASK;
        }
        if playout_delay_ms.is_some() {
            byte0 |= 1;
        }
        buf.put_u8(byte0);
        buf.put_u32(frame_id);
        buf.put_u16(packet_id);
        buf.put_u16(max_packet_id);
        if let Some(reference) = reference_frame_id {
            buf.put_u32(reference);
        }
        if let Some(delay) = playout_delay_ms {
            buf.put_u16(u16::from(SHARER_EXTENSION_ADAPTIVE_LATENCY) << 10 | 2);
            buf.put_u16(delay);
        }
        buf.put_slice(payload);
        buf
    }

    #[test]
    fn test_parse_video_packet() {
        let data = build_rtp(
            true, 1000, 0x12345678, 11, true, 7, 2, 4, Some(7), None, b"payload bytes",
        );
        let packet = RtpPacket::parse(&data).unwrap();
        assert_eq!(packet.payload_type, RTP_PAYLOAD_TYPE_VIDEO);
        assert!(packet.marker);
        assert_eq!(packet.sequence_number, 1000);
        assert_eq!(packet.rtp_timestamp, 0x12345678);
        assert_eq!(packet.ssrc, 11);
        assert!(packet.is_key_frame);
        assert_eq!(packet.frame_id, 7);
        assert_eq!(packet.packet_id, 2);
        assert_eq!(packet.max_packet_id, 4);
        assert_eq!(packet.referenced_frame_id, 7);
        assert_eq!(packet.new_playout_delay_ms, 0);
        assert_eq!(&packet.payload[..], b"payload bytes");
    }

    #[test]
    fn test_parse_defaults_reference_frame_id() {
        // No explicit reference: key frames reference themselves, dependent
        // frames reference their predecessor.
        let key = build_rtp(false, 1, 0, 11, true, 9, 0, 0, None, None, b"k");
        assert_eq!(RtpPacket::parse(&key).unwrap().referenced_frame_id, 9);

        let dependent = build_rtp(false, 2, 0, 11, false, 9, 0, 0, None, None, b"d");
        assert_eq!(RtpPacket::parse(&dependent).unwrap().referenced_frame_id, 8);
    }

    #[test]
    fn test_parse_adaptive_latency_extension() {
        let data = build_rtp(false, 3, 90, 11, false, 4, 0, 1, Some(3), Some(400), b"x");
        let packet = RtpPacket::parse(&data).unwrap();
        assert_eq!(packet.new_playout_delay_ms, 400);
        assert_eq!(&packet.payload[..], b"x");
    }

    #[test]
    fn test_parse_rejects_packet_id_above_max() {
        let data = build_rtp(false, 3, 90, 11, false, 4, 5, 1, Some(3), None, b"x");
        assert!(RtpPacket::parse(&data).is_err());
    }

    #[test]
    fn test_classification() {
        let rtp = build_rtp(false, 1, 0, 11, true, 0, 0, 0, Some(0), None, b"media");
        assert!(matches!(SharerPacket::parse(&rtp), Ok(SharerPacket::Rtp(_))));

        // RTCP: version 2, payload type 200 (sender report).
        let mut rtcp = vec![0x80, 200, 0, 6];
        rtcp.extend_from_slice(&[0u8; 24]);
        assert!(matches!(SharerPacket::parse(&rtcp), Ok(SharerPacket::Rtcp(_))));

        // Too small and wrong version are both rejected.
        assert!(SharerPacket::parse(&[0x80, 200, 0]).is_err());
        let mut bad_version = rtcp.clone();
        bad_version[0] = 0x40;
        assert!(SharerPacket::parse(&bad_version).is_err());
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0xde, 0xad, 0x01]), "de ad 01");
    }
}
