//! Frame packetization
//!
//! Splits one encoded frame into RTP packets with the sharer header. The
//! payload is divided evenly so no single packet is much larger than the
//! others, which keeps burst sizes predictable.

use std::sync::Arc;

use bytes::BufMut;

use crate::frame::{EncodedFrame, FrameDependency};
use crate::packet::{
    RTP_HEADER_LENGTH, RTP_MARKER_BIT_MASK, SHARER_EXTENSION_ADAPTIVE_LATENCY,
    SHARER_EXTENSION_COUNT_MASK, SHARER_HEADER_LENGTH, SHARER_KEY_FRAME_BIT_MASK,
    SHARER_REFERENCE_FRAME_ID_BIT_MASK,
};
use crate::pacing::{PacedSender, SendPacketVector};
use crate::{RtpSequenceNumber, RtpSsrc, MAX_PACKET_SIZE};

/// Configuration of one packetizer instance
#[derive(Debug, Clone)]
pub struct RtpPacketizerConfig {
    /// RTP payload type to stamp on every packet
    pub payload_type: u8,

    /// Upper bound for a whole packet on the wire
    pub max_payload_length: u16,

    /// Initial RTP sequence number
    pub sequence_number: RtpSequenceNumber,

    /// SSRC of the outgoing stream
    pub ssrc: RtpSsrc,
}

impl Default for RtpPacketizerConfig {
    fn default() -> Self {
        Self {
            payload_type: 0,
            // Default assumes IPv4/UDP overhead.
            max_payload_length: (MAX_PACKET_SIZE - 31) as u16,
            sequence_number: 0,
            ssrc: 0,
        }
    }
}

/// Splits encoded frames into sharer RTP packets
pub struct RtpPacketizer {
    config: RtpPacketizerConfig,

    sequence_number: RtpSequenceNumber,
    packet_id: u16,

    send_packet_count: usize,
    send_octet_count: usize,
}

impl RtpPacketizer {
    /// Create a packetizer
    pub fn new(config: RtpPacketizerConfig) -> Self {
        let sequence_number = config.sequence_number;
        Self {
            config,
            sequence_number,
            packet_id: 0,
            send_packet_count: 0,
            send_octet_count: 0,
        }
    }

    /// Total packets produced so far
    pub fn send_packet_count(&self) -> usize {
        self.send_packet_count
    }

    /// Total payload octets produced so far
    pub fn send_octet_count(&self) -> usize {
        self.send_octet_count
    }

    /// Take the next outgoing sequence number (used when retransmitted
    /// packets are renumbered)
    pub fn next_sequence_number(&mut self) -> RtpSequenceNumber {
        let current = self.sequence_number;
        self.sequence_number = self.sequence_number.wrapping_add(1);
        current
    }

    /// Split `frame` into keyed packets ready for storage and pacing
    pub fn build_packets(&mut self, frame: &EncodedFrame) -> SendPacketVector {
        debug_assert!(frame.dependency != FrameDependency::Unknown);
        if frame.data.is_empty() {
            debug_assert!(false, "packetizing an empty frame");
            return SendPacketVector::new();
        }

        let rtp_header_length = RTP_HEADER_LENGTH + SHARER_HEADER_LENGTH;
        let max_length = usize::from(self.config.max_payload_length) - rtp_header_length - 1;

        // Split the payload evenly, rounding up.
        let num_packets = frame.data.len().div_ceil(max_length);
        let mut payload_length = frame.data.len().div_ceil(num_packets);
        debug_assert!(payload_length <= max_length);

        let mut packets = SendPacketVector::with_capacity(num_packets);

        let mut remaining = &frame.data[..];
        while !remaining.is_empty() {
            if remaining.len() < payload_length {
                payload_length = remaining.len();
            }
            let (chunk, rest) = remaining.split_at(payload_length);
            remaining = rest;

            let mut packet = Vec::with_capacity(rtp_header_length + 8 + payload_length);
            self.build_common_rtp_header(&mut packet, remaining.is_empty(), frame.rtp_timestamp);

            let mut num_extensions = 0u8;
            if frame.new_playout_delay_ms != 0 {
                num_extensions += 1;
            }
            debug_assert!(num_extensions <= SHARER_EXTENSION_COUNT_MASK);
            let mut byte0 = SHARER_REFERENCE_FRAME_ID_BIT_MASK;
            if frame.dependency == FrameDependency::Key {
                byte0 |= SHARER_KEY_FRAME_BIT_MASK;
            }
            byte0 |= num_extensions;
            packet.put_u8(byte0);
            packet.put_u32(frame.frame_id);
            packet.put_u16(self.packet_id);
            packet.put_u16((num_packets - 1) as u16);
            packet.put_u32(frame.referenced_frame_id);
            if frame.new_playout_delay_ms != 0 {
                packet.put_u16(u16::from(SHARER_EXTENSION_ADAPTIVE_LATENCY) << 10 | 2);
                packet.put_u16(frame.new_playout_delay_ms);
            }

            packet.put_slice(chunk);

            let key = PacedSender::make_packet_key(
                frame.reference_time,
                self.config.ssrc,
                self.packet_id,
            );
            self.packet_id = self.packet_id.wrapping_add(1);
            packets.push((key, Arc::new(packet)));

            self.send_packet_count += 1;
            self.send_octet_count += payload_length;
        }
        debug_assert_eq!(usize::from(self.packet_id), num_packets);

        // Prepare for the next frame.
        self.packet_id = 0;
        packets
    }

    fn build_common_rtp_header(&mut self, packet: &mut Vec<u8>, marker: bool, rtp_timestamp: u32) {
        packet.put_u8(0x80);
        packet.put_u8(self.config.payload_type | if marker { RTP_MARKER_BIT_MASK } else { 0 });
        packet.put_u16(self.sequence_number);
        packet.put_u32(rtp_timestamp);
        packet.put_u32(self.config.ssrc);
        self.sequence_number = self.sequence_number.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDependency;
    use crate::packet::{RtpPacket, RTP_PAYLOAD_TYPE_VIDEO};
    use crate::receiver::FrameBuffer;
    use crate::time::TimeTicks;

    fn packetizer() -> RtpPacketizer {
        RtpPacketizer::new(RtpPacketizerConfig {
            payload_type: RTP_PAYLOAD_TYPE_VIDEO,
            max_payload_length: 1469,
            sequence_number: 100,
            ssrc: 11,
        })
    }

    fn frame_of_size(size: usize) -> EncodedFrame {
        EncodedFrame {
            dependency: FrameDependency::Key,
            frame_id: 42,
            referenced_frame_id: 42,
            rtp_timestamp: 90_000,
            reference_time: TimeTicks::from_micros(1_000_000),
            new_playout_delay_ms: 0,
            data: (0..size).map(|i| (i % 251) as u8).collect(),
        }
    }

    #[test]
    fn test_packet_count_and_reassembly() {
        // Packetize then reassemble for several frame sizes, small and
        // multi-packet alike.
        let max_payload = 1469 - (RTP_HEADER_LENGTH + SHARER_HEADER_LENGTH) - 1;
        for packets_wanted in [1usize, 2, 42, 513] {
            let mut packetizer = packetizer();
            let size = max_payload * packets_wanted - 7;
            let frame = frame_of_size(size);
            let packets = packetizer.build_packets(&frame);
            assert_eq!(packets.len(), packets_wanted, "size {}", size);

            let mut buffer = FrameBuffer::new();
            for (_, raw) in &packets {
                let parsed = RtpPacket::parse(raw).unwrap();
                assert!(buffer.insert_packet(parsed));
            }
            let assembled = buffer.assemble_encoded_frame().unwrap();
            assert_eq!(assembled.data, frame.data);
            assert_eq!(assembled.frame_id, frame.frame_id);
            assert_eq!(assembled.rtp_timestamp, frame.rtp_timestamp);
            assert_eq!(assembled.dependency, FrameDependency::Key);
        }
    }

    #[test]
    fn test_sequence_numbers_monotone_and_marker_on_last() {
        let mut packetizer = packetizer();
        let frame = frame_of_size(5000);
        let packets = packetizer.build_packets(&frame);

        let mut expected_seq = 100u16;
        for (i, (_, raw)) in packets.iter().enumerate() {
            let parsed = RtpPacket::parse(raw).unwrap();
            assert_eq!(parsed.sequence_number, expected_seq);
            assert_eq!(parsed.packet_id, i as u16);
            assert_eq!(parsed.max_packet_id, (packets.len() - 1) as u16);
            assert_eq!(parsed.marker, i == packets.len() - 1);
            expected_seq = expected_seq.wrapping_add(1);
        }
    }

    #[test]
    fn test_playout_delay_extension_carried() {
        let mut packetizer = packetizer();
        let mut frame = frame_of_size(100);
        frame.new_playout_delay_ms = 400;
        let packets = packetizer.build_packets(&frame);
        let parsed = RtpPacket::parse(&packets[0].1).unwrap();
        assert_eq!(parsed.new_playout_delay_ms, 400);
    }

    #[test]
    fn test_counters_accumulate() {
        let mut packetizer = packetizer();
        let frame = frame_of_size(3000);
        let packets = packetizer.build_packets(&frame);
        assert_eq!(packetizer.send_packet_count(), packets.len());
        assert_eq!(packetizer.send_octet_count(), 3000);
    }

    #[test]
    fn test_balanced_split() {
        let mut packetizer = packetizer();
        let frame = frame_of_size(3000);
        let packets = packetizer.build_packets(&frame);
        // 3000 bytes over ceil(3000/1449)=3 packets: 1000 each.
        assert_eq!(packets.len(), 3);
        for (_, raw) in &packets {
            let parsed = RtpPacket::parse(raw).unwrap();
            assert_eq!(parsed.payload.len(), 1000);
        }
    }
}
