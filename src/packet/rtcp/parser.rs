//! Compound RTCP packet parsing

use bytes::Buf;

use crate::error::Error;
use crate::frame::RTCP_ALL_PACKETS_LOST;
use crate::{Result, RtpSsrc};

use super::{
    RtcpPauseResumeMessage, RtcpReceiverReferenceTimeReport, RtcpSenderInfo, SharerFeedback,
    PACKET_TYPE_GENERIC_RTP_FEEDBACK, PACKET_TYPE_PAYLOAD_SPECIFIC,
    PACKET_TYPE_RECEIVER_REPORT, PACKET_TYPE_SENDER_REPORT, PACKET_TYPE_XR,
    SHARER_FEEDBACK_FORMAT, SHARER_FEEDBACK_MAGIC,
};

/// Common header of each packet in an RTCP compound
struct RtcpCommonHeader {
    /// Item count / feedback message type (5 bits)
    count: u8,

    /// Packet type
    packet_type: u8,

    /// Full packet length including the header, in octets
    length_in_octets: usize,
}

/// Walks an RTCP compound packet and collects the messages addressed to us
///
/// Messages whose SSRC does not match the expected remote peer are skipped
/// without failing the whole compound, matching how unrelated report blocks
/// are tolerated on a shared port.
pub struct RtcpParser {
    local_ssrc: RtpSsrc,
    remote_ssrc: RtpSsrc,

    sender_report: Option<RtcpSenderInfo>,
    last_report: Option<(u32, u32)>,
    sharer_message: Option<SharerFeedback>,
    receiver_reference_time_report: Option<RtcpReceiverReferenceTimeReport>,
    pause_hint: Option<RtcpPauseResumeMessage>,
}

impl RtcpParser {
    /// Create a parser expecting traffic from `remote_ssrc` about our
    /// `local_ssrc`
    pub fn new(local_ssrc: RtpSsrc, remote_ssrc: RtpSsrc) -> Self {
        Self {
            local_ssrc,
            remote_ssrc,
            sender_report: None,
            last_report: None,
            sharer_message: None,
            receiver_reference_time_report: None,
            pause_hint: None,
        }
    }

    /// The sender report found in the compound, if any
    pub fn sender_report(&self) -> Option<&RtcpSenderInfo> {
        self.sender_report.as_ref()
    }

    /// LSR and DLSR from a report block about our stream: `(last_report,
    /// delay_since_last_report)`
    pub fn last_report(&self) -> Option<(u32, u32)> {
        self.last_report
    }

    /// The sharer ACK/NACK feedback found in the compound, if any
    pub fn sharer_message(&self) -> Option<&SharerFeedback> {
        self.sharer_message.as_ref()
    }

    /// The receiver reference time report found in the compound, if any
    pub fn receiver_reference_time_report(&self) -> Option<&RtcpReceiverReferenceTimeReport> {
        self.receiver_reference_time_report.as_ref()
    }

    /// A pause/resume indication, surfaced as a best-effort hint only
    pub fn pause_hint(&self) -> Option<&RtcpPauseResumeMessage> {
        self.pause_hint.as_ref()
    }

    /// Parse a whole compound packet
    pub fn parse(&mut self, data: &[u8]) -> Result<()> {
        let mut buf = data;
        while buf.has_remaining() {
            let header = Self::parse_common_header(&mut buf)?;

            let body_len = header.length_in_octets - 4;
            if buf.remaining() < body_len {
                return Err(Error::BufferTooSmall {
                    required: body_len,
                    available: buf.remaining(),
                });
            }
            let mut chunk = &buf[..body_len];
            buf.advance(body_len);

            match header.packet_type {
                PACKET_TYPE_SENDER_REPORT => self.parse_sr(&mut chunk, &header)?,
                PACKET_TYPE_RECEIVER_REPORT => self.parse_rr(&mut chunk, &header)?,
                PACKET_TYPE_PAYLOAD_SPECIFIC => self.parse_feedback(&mut chunk, &header)?,
                PACKET_TYPE_XR => self.parse_extended_report(&mut chunk)?,
                PACKET_TYPE_GENERIC_RTP_FEEDBACK => self.parse_pause_resume(&mut chunk)?,
                _ => {
                    // Unknown packet type, skipped by its declared length.
                }
            }
        }
        Ok(())
    }

    fn parse_common_header(buf: &mut &[u8]) -> Result<RtcpCommonHeader> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
        }
        let byte = buf.get_u8();
        let version = byte >> 6;
        if version != 2 {
            return Err(Error::ParseError(format!("Bad RTCP version: {}", version)));
        }
        let count = byte & 0x1f;
        let packet_type = buf.get_u8();
        let length_in_octets = (usize::from(buf.get_u16()) + 1) * 4;
        if length_in_octets < 4 {
            return Err(Error::ParseError("Zero-length RTCP packet".to_string()));
        }

        Ok(RtcpCommonHeader {
            count,
            packet_type,
            length_in_octets,
        })
    }

    fn parse_sr(&mut self, buf: &mut &[u8], header: &RtcpCommonHeader) -> Result<()> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
        }
        let sender_ssrc = buf.get_u32();
        if sender_ssrc != self.remote_ssrc {
            return Ok(());
        }

        if buf.remaining() < 20 {
            return Err(Error::BufferTooSmall { required: 20, available: buf.remaining() });
        }
        self.sender_report = Some(RtcpSenderInfo {
            ntp_seconds: buf.get_u32(),
            ntp_fraction: buf.get_u32(),
            rtp_timestamp: buf.get_u32(),
            send_packet_count: buf.get_u32(),
            send_octet_count: buf.get_u32(),
        });

        for _ in 0..header.count {
            self.parse_report_block(buf)?;
        }
        Ok(())
    }

    fn parse_rr(&mut self, buf: &mut &[u8], header: &RtcpCommonHeader) -> Result<()> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
        }
        let receiver_ssrc = buf.get_u32();
        if receiver_ssrc != self.remote_ssrc {
            return Ok(());
        }

        for _ in 0..header.count {
            self.parse_report_block(buf)?;
        }
        Ok(())
    }

    fn parse_report_block(&mut self, buf: &mut &[u8]) -> Result<()> {
        if buf.remaining() < 24 {
            return Err(Error::BufferTooSmall { required: 24, available: buf.remaining() });
        }
        let ssrc = buf.get_u32();
        buf.advance(12);
        let last_report = buf.get_u32();
        let delay = buf.get_u32();

        if ssrc == self.local_ssrc {
            self.last_report = Some((last_report, delay));
        }
        Ok(())
    }

    // RFC 4585 section 6.4, application layer feedback.
    fn parse_feedback(&mut self, buf: &mut &[u8], header: &RtcpCommonHeader) -> Result<()> {
        if header.count != SHARER_FEEDBACK_FORMAT {
            return Ok(());
        }
        if buf.remaining() < 8 {
            return Err(Error::BufferTooSmall { required: 8, available: buf.remaining() });
        }
        let remote_ssrc = buf.get_u32();
        let media_ssrc = buf.get_u32();
        if remote_ssrc != self.remote_ssrc {
            return Ok(());
        }

        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
        }
        if buf.get_u32() != SHARER_FEEDBACK_MAGIC {
            return Ok(());
        }

        if buf.remaining() < 8 {
            return Err(Error::BufferTooSmall { required: 8, available: buf.remaining() });
        }
        let mut message = SharerFeedback::new(media_ssrc);
        message.ack_frame_id = buf.get_u32();
        let number_of_loss_fields = buf.get_u8();
        let _padding = buf.get_u8();
        message.target_delay_ms = buf.get_u16();

        for _ in 0..number_of_loss_fields {
            if buf.remaining() < 8 {
                return Err(Error::BufferTooSmall { required: 8, available: buf.remaining() });
            }
            let frame_id = buf.get_u32();
            let mut packet_id = buf.get_u16();
            let mut bitmask = buf.get_u8();
            let _padding = buf.get_u8();

            let set = message.missing_frames_and_packets.entry(frame_id).or_default();
            set.insert(packet_id);
            if packet_id != RTCP_ALL_PACKETS_LOST {
                while bitmask != 0 {
                    packet_id = packet_id.wrapping_add(1);
                    if bitmask & 1 != 0 {
                        set.insert(packet_id);
                    }
                    bitmask >>= 1;
                }
            }
        }

        self.sharer_message = Some(message);
        Ok(())
    }

    fn parse_pause_resume(&mut self, buf: &mut &[u8]) -> Result<()> {
        // Best-effort: the wire carries sender ssrc, an unused remote ssrc,
        // two fixed words, then pause_id and last_sent.
        if buf.remaining() < 24 {
            return Ok(());
        }
        let sender_ssrc = buf.get_u32();
        if sender_ssrc != self.remote_ssrc {
            return Ok(());
        }
        buf.advance(12);
        self.pause_hint = Some(RtcpPauseResumeMessage {
            pause_id: buf.get_u32(),
            last_sent: buf.get_u32(),
        });
        Ok(())
    }

    fn parse_extended_report(&mut self, buf: &mut &[u8]) -> Result<()> {
        if buf.remaining() < 4 {
            return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
        }
        let remote_ssrc = buf.get_u32();
        if remote_ssrc != self.remote_ssrc {
            return Ok(());
        }

        while buf.has_remaining() {
            if buf.remaining() < 4 {
                return Err(Error::BufferTooSmall { required: 4, available: buf.remaining() });
            }
            let block_type = buf.get_u8();
            buf.advance(1);
            let block_length = usize::from(buf.get_u16());

            match block_type {
                // RRTR, RFC 3611 section 4.4.
                4 => {
                    if block_length != 2 {
                        return Err(Error::ParseError(format!(
                            "Bad RRTR block length: {}",
                            block_length
                        )));
                    }
                    if buf.remaining() < 8 {
                        return Err(Error::BufferTooSmall {
                            required: 8,
                            available: buf.remaining(),
                        });
                    }
                    self.receiver_reference_time_report =
                        Some(RtcpReceiverReferenceTimeReport {
                            remote_ssrc,
                            ntp_seconds: buf.get_u32(),
                            ntp_fraction: buf.get_u32(),
                        });
                }
                _ => {
                    // Skip unknown block by its declared length.
                    let skip = block_length * 4;
                    if buf.remaining() < skip {
                        return Err(Error::BufferTooSmall {
                            required: skip,
                            available: buf.remaining(),
                        });
                    }
                    buf.advance(skip);
                }
            }
        }
        Ok(())
    }
}
