//! Compound RTCP packet building

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::BufMut;
use tracing::debug;

use crate::frame::RTCP_ALL_PACKETS_LOST;
use crate::time::TimeDelta;
use crate::{PacketRef, RtpSsrc, MAX_PACKET_SIZE};

use super::{
    RtcpPauseResumeMessage, RtcpReceiverReferenceTimeReport, RtcpReportBlock, RtcpSenderInfo,
    SharerFeedback, MAX_SHARER_LOSS_FIELDS, PACKET_TYPE_GENERIC_RTP_FEEDBACK,
    PACKET_TYPE_PAYLOAD_SPECIFIC, PACKET_TYPE_RECEIVER_REPORT, PACKET_TYPE_SENDER_REPORT,
    PACKET_TYPE_XR, SHARER_FEEDBACK_FORMAT, SHARER_FEEDBACK_MAGIC,
};

/// Builds a human-readable rendering of a NACK list for logging
///
/// The string looks like `"23:3-6, 25:1,5-6"`: packets 3 to 6 of frame 23
/// and packets 1, 5 and 6 of frame 25 are missing. A completely missing
/// frame shows as `"26:65535"`.
struct NackStringBuilder {
    text: String,
    frame_count: usize,
    packet_count: usize,
    last_frame_id: i64,
    last_packet_id: i64,
    contiguous_sequence: bool,
}

impl NackStringBuilder {
    fn new() -> Self {
        Self {
            text: String::new(),
            frame_count: 0,
            packet_count: 0,
            last_frame_id: -1,
            last_packet_id: -1,
            contiguous_sequence: false,
        }
    }

    fn is_empty(&self) -> bool {
        self.frame_count == 0
    }

    fn push_frame(&mut self, frame_id: u32) {
        if self.frame_count > 0 {
            if i64::from(frame_id) == self.last_frame_id {
                return;
            }
            if self.contiguous_sequence {
                let _ = write!(self.text, "-{}", self.last_packet_id);
            }
            self.text.push_str(", ");
        }
        let _ = write!(self.text, "{}", frame_id);
        self.last_frame_id = i64::from(frame_id);
        self.packet_count = 0;
        self.contiguous_sequence = false;
        self.frame_count += 1;
    }

    fn push_packet(&mut self, packet_id: u16) {
        if self.packet_count == 0 {
            let _ = write!(self.text, ":{}", packet_id);
        } else if i64::from(packet_id) == self.last_packet_id + 1 {
            self.contiguous_sequence = true;
        } else {
            if self.contiguous_sequence {
                let _ = write!(self.text, "-{}", self.last_packet_id);
                self.contiguous_sequence = false;
            }
            let _ = write!(self.text, ",{}", packet_id);
        }
        self.packet_count += 1;
        self.last_packet_id = i64::from(packet_id);
    }

    fn finish(mut self) -> String {
        if self.contiguous_sequence {
            let _ = write!(self.text, "-{}", self.last_packet_id);
        }
        self.text
    }
}

/// Serializes RTCP compound packets
///
/// Each section starts with the common header whose length field is patched
/// once the section is complete; sections are always a whole number of
/// 32-bit words.
pub struct RtcpBuilder {
    buffer: Vec<u8>,
    ssrc: RtpSsrc,
    length_pos: Option<usize>,
}

impl RtcpBuilder {
    /// Create a builder writing packets attributed to `sending_ssrc`
    pub fn new(sending_ssrc: RtpSsrc) -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_PACKET_SIZE),
            ssrc: sending_ssrc,
            length_pos: None,
        }
    }

    /// Build a compound packet sent by an RTP sender: a single SR
    pub fn build_from_sender(mut self, sender_info: &RtcpSenderInfo) -> PacketRef {
        self.add_sr(sender_info);
        self.finish()
    }

    /// Build a compound packet sent by an RTP receiver: RR, RRTR, and the
    /// sharer feedback when present
    pub fn build_from_receiver(
        mut self,
        report_block: Option<&RtcpReportBlock>,
        rrtr: Option<&RtcpReceiverReferenceTimeReport>,
        sharer_message: Option<&SharerFeedback>,
        target_delay: TimeDelta,
    ) -> PacketRef {
        if let Some(block) = report_block {
            self.add_rr(block);
        }
        if let Some(rrtr) = rrtr {
            self.add_rrtr(rrtr);
        }
        if let Some(message) = sharer_message {
            self.add_sharer_feedback(message, target_delay);
        }
        self.finish()
    }

    /// Build a pause/resume indication from the sender
    pub fn build_pause_resume(mut self, pause_info: &RtcpPauseResumeMessage) -> PacketRef {
        self.add_pause_resume(pause_info);
        self.finish()
    }

    // Sets the 5-bit count/format and payload type of the section header and
    // reserves room for the length field, which is back-patched later.
    fn add_rtcp_header(&mut self, payload_type: u8, format_or_count: u8) {
        self.patch_length_field();
        self.buffer.put_u8(0x80 | (format_or_count & 0x1f));
        self.buffer.put_u8(payload_type);
        self.length_pos = Some(self.buffer.len());
        // Initialize length to "clearly illegal".
        self.buffer.put_u16(0xDEAD);
    }

    fn patch_length_field(&mut self) {
        if let Some(pos) = self.length_pos.take() {
            // Length is in 32-bit words minus one, counted from the byte
            // after the length field.
            let length_in_bytes = self.buffer.len() - pos - 2;
            debug_assert_eq!(length_in_bytes % 4, 0);
            let words = (length_in_bytes / 4) as u16;
            self.buffer[pos..pos + 2].copy_from_slice(&words.to_be_bytes());
        }
    }

    fn finish(mut self) -> PacketRef {
        self.patch_length_field();
        Arc::new(self.buffer)
    }

    fn add_sr(&mut self, sender_info: &RtcpSenderInfo) {
        self.add_rtcp_header(PACKET_TYPE_SENDER_REPORT, 0);
        self.buffer.put_u32(self.ssrc);
        self.buffer.put_u32(sender_info.ntp_seconds);
        self.buffer.put_u32(sender_info.ntp_fraction);
        self.buffer.put_u32(sender_info.rtp_timestamp);
        self.buffer.put_u32(sender_info.send_packet_count);
        self.buffer.put_u32(sender_info.send_octet_count);
    }

    fn add_rr(&mut self, report_block: &RtcpReportBlock) {
        self.add_rtcp_header(PACKET_TYPE_RECEIVER_REPORT, 1);
        self.buffer.put_u32(self.ssrc);
        self.add_report_block(report_block);
    }

    fn add_report_block(&mut self, block: &RtcpReportBlock) {
        self.buffer.put_u32(block.media_ssrc);
        self.buffer.put_u8(block.fraction_lost);
        self.buffer.put_u8((block.cumulative_lost >> 16) as u8);
        self.buffer.put_u8((block.cumulative_lost >> 8) as u8);
        self.buffer.put_u8(block.cumulative_lost as u8);

        self.buffer.put_u32(block.extended_high_sequence_number);
        self.buffer.put_u32(block.jitter);

        // The NTP stamp we read from the last sender report, not the time we
        // received it.
        self.buffer.put_u32(block.last_sr);
        self.buffer.put_u32(block.delay_since_last_sr);
    }

    fn add_rrtr(&mut self, rrtr: &RtcpReceiverReferenceTimeReport) {
        self.add_rtcp_header(PACKET_TYPE_XR, 0);
        self.buffer.put_u32(self.ssrc);
        self.buffer.put_u8(4); // Block type.
        self.buffer.put_u8(0); // Reserved.
        self.buffer.put_u16(2); // Block length.
        self.buffer.put_u32(rrtr.ntp_seconds);
        self.buffer.put_u32(rrtr.ntp_fraction);
    }

    fn add_pause_resume(&mut self, pause_message: &RtcpPauseResumeMessage) {
        self.add_rtcp_header(PACKET_TYPE_GENERIC_RTP_FEEDBACK, 4);
        self.buffer.put_u32(self.ssrc);
        self.buffer.put_u32(0); // Remote SSRC, shall not be used.
        self.buffer.put_u32(2);
        self.buffer.put_u32(2); // Length of type-specific words.
        self.buffer.put_u32(pause_message.pause_id);
        self.buffer.put_u32(pause_message.last_sent);
    }

    // RFC 4585 section 6.4, application specific feedback message.
    fn add_sharer_feedback(&mut self, feedback: &SharerFeedback, target_delay: TimeDelta) {
        self.add_rtcp_header(PACKET_TYPE_PAYLOAD_SPECIFIC, SHARER_FEEDBACK_FORMAT);
        self.buffer.put_u32(self.ssrc);
        self.buffer.put_u32(feedback.media_ssrc);
        self.buffer.put_u32(SHARER_FEEDBACK_MAGIC);
        self.buffer.put_u32(feedback.ack_frame_id);
        let loss_field_count_pos = self.buffer.len();
        self.buffer.put_u8(0); // Overwritten with the loss-field count.
        self.buffer.put_u8(0); // Padding.
        debug_assert!(target_delay.as_millis() <= i64::from(u16::MAX));
        self.buffer.put_u16(target_delay.as_millis() as u16);

        let mut number_of_loss_fields = 0usize;
        let max_number_of_loss_fields = MAX_SHARER_LOSS_FIELDS
            .min((MAX_PACKET_SIZE.saturating_sub(self.buffer.len())) / 8);

        let mut nack_string = NackStringBuilder::new();
        'frames: for (&frame_id, packet_set) in &feedback.missing_frames_and_packets {
            nack_string.push_frame(frame_id);
            if packet_set.is_empty() {
                // Special case: every packet of the frame is missing.
                if number_of_loss_fields >= max_number_of_loss_fields {
                    break 'frames;
                }
                self.buffer.put_u32(frame_id);
                self.buffer.put_u16(RTCP_ALL_PACKETS_LOST);
                self.buffer.put_u8(0);
                self.buffer.put_u8(0); // Padding.
                nack_string.push_packet(RTCP_ALL_PACKETS_LOST);
                number_of_loss_fields += 1;
                continue;
            }

            let mut packets = packet_set.iter().copied().peekable();
            while let Some(packet_id) = packets.next() {
                if number_of_loss_fields >= max_number_of_loss_fields {
                    break 'frames;
                }
                self.buffer.put_u32(frame_id);
                self.buffer.put_u16(packet_id);
                nack_string.push_packet(packet_id);

                let mut bitmask = 0u8;
                while let Some(&next) = packets.peek() {
                    let shift = i32::from(next.wrapping_sub(packet_id)) - 1;
                    if (0..=7).contains(&shift) {
                        nack_string.push_packet(next);
                        bitmask |= 1 << shift;
                        packets.next();
                    } else {
                        break;
                    }
                }
                self.buffer.put_u8(bitmask);
                self.buffer.put_u8(0); // Padding.
                number_of_loss_fields += 1;
            }
        }

        if !nack_string.is_empty() {
            debug!(
                "SSRC: {}, ACK: {}, NACK: {}",
                feedback.media_ssrc,
                feedback.ack_frame_id,
                nack_string.finish()
            );
        }
        self.buffer[loss_field_count_pos] = number_of_loss_fields as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::rtcp::RtcpParser;
    use crate::packet::SharerPacket;

    #[test]
    fn test_length_field_in_words_minus_one() {
        let packet = RtcpBuilder::new(1).build_from_sender(&RtcpSenderInfo::default());
        // An SR is 28 bytes: header (4) + ssrc (4) + sender info (20).
        assert_eq!(packet.len(), 28);
        let words = u16::from_be_bytes([packet[2], packet[3]]);
        assert_eq!(usize::from(words + 1) * 4, packet.len());
    }

    #[test]
    fn test_sender_report_is_classified_as_rtcp() {
        let packet = RtcpBuilder::new(1).build_from_sender(&RtcpSenderInfo::default());
        assert!(matches!(
            SharerPacket::parse(&packet),
            Ok(SharerPacket::Rtcp(_))
        ));
    }

    #[test]
    fn test_feedback_bitmask_round_trip() {
        let mut feedback = SharerFeedback::new(11);
        feedback.ack_frame_id = 22;
        // 9 consecutive packet ids fold into one loss field: the boundary
        // packet plus 8 bitmask bits.
        let set = feedback.missing_frames_and_packets.entry(23).or_default();
        for id in 3..=11u16 {
            set.insert(id);
        }

        let packet = RtcpBuilder::new(12).build_from_receiver(
            None,
            None,
            Some(&feedback),
            TimeDelta::from_millis(100),
        );

        let mut parser = RtcpParser::new(11, 12);
        parser.parse(&packet).unwrap();
        let parsed = parser.sharer_message().unwrap();
        assert_eq!(parsed.ack_frame_id, 22);
        assert_eq!(parsed.target_delay_ms, 100);
        assert_eq!(parsed.missing_frames_and_packets, feedback.missing_frames_and_packets);

        // One loss field only.
        assert_eq!(packet[20], 1);
    }

    #[test]
    fn test_feedback_whole_frame_lost() {
        let mut feedback = SharerFeedback::new(11);
        feedback.ack_frame_id = 3;
        feedback
            .missing_frames_and_packets
            .entry(4)
            .or_default()
            .insert(RTCP_ALL_PACKETS_LOST);

        let packet = RtcpBuilder::new(12).build_from_receiver(
            None,
            None,
            Some(&feedback),
            TimeDelta::ZERO,
        );

        let mut parser = RtcpParser::new(11, 12);
        parser.parse(&packet).unwrap();
        let parsed = parser.sharer_message().unwrap();
        let set = &parsed.missing_frames_and_packets[&4];
        assert_eq!(set.len(), 1);
        assert!(set.contains(&RTCP_ALL_PACKETS_LOST));
    }

    #[test]
    fn test_feedback_split_gap_creates_two_loss_fields() {
        let mut feedback = SharerFeedback::new(11);
        let set = feedback.missing_frames_and_packets.entry(7).or_default();
        set.insert(0);
        set.insert(15); // More than 8 away from packet 0.

        let packet = RtcpBuilder::new(12).build_from_receiver(
            None,
            None,
            Some(&feedback),
            TimeDelta::ZERO,
        );
        assert_eq!(packet[20], 2);

        let mut parser = RtcpParser::new(11, 12);
        parser.parse(&packet).unwrap();
        assert_eq!(
            parser.sharer_message().unwrap().missing_frames_and_packets,
            feedback.missing_frames_and_packets
        );
    }

    #[test]
    fn test_pause_resume_round_trip() {
        let message = RtcpPauseResumeMessage { last_sent: 41, pause_id: 5 };
        let packet = RtcpBuilder::new(12).build_pause_resume(&message);

        let mut parser = RtcpParser::new(11, 12);
        parser.parse(&packet).unwrap();
        assert_eq!(parser.pause_hint(), Some(&message));
    }

    #[test]
    fn test_nack_string_builder() {
        let mut builder = NackStringBuilder::new();
        builder.push_frame(23);
        for id in 3..=6 {
            builder.push_packet(id);
        }
        builder.push_frame(25);
        builder.push_packet(1);
        builder.push_packet(5);
        builder.push_packet(6);
        assert_eq!(builder.finish(), "23:3-6, 25:1,5-6");
    }
}
