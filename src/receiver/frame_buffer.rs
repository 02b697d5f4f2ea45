//! Reassembly buffer for a single frame

use std::collections::BTreeMap;

use crate::frame::{EncodedFrame, FrameDependency};
use crate::packet::rtcp::PacketIdSet;
use crate::packet::RtpPacket;
use crate::{FrameId, RtpTimestamp};

/// Collects the packets of one frame until it is complete
///
/// The buffer adopts its identity (frame id, key flag, packet count) from
/// the first packet inserted; every later packet must belong to the same
/// frame.
pub struct FrameBuffer {
    frame_id: FrameId,
    max_packet_id: u16,
    num_packets_received: u16,
    max_seen_packet_id: u16,
    new_playout_delay_ms: u16,
    is_key_frame: bool,
    total_data_size: usize,
    referenced_frame_id: FrameId,
    rtp_timestamp: RtpTimestamp,
    packets: BTreeMap<u16, RtpPacket>,
}

impl FrameBuffer {
    /// Create an empty buffer; identity comes from the first packet
    pub fn new() -> Self {
        Self {
            frame_id: 0,
            max_packet_id: 0,
            num_packets_received: 0,
            max_seen_packet_id: 0,
            new_playout_delay_ms: 0,
            is_key_frame: false,
            total_data_size: 0,
            referenced_frame_id: 0,
            rtp_timestamp: 0,
            packets: BTreeMap::new(),
        }
    }

    /// Insert one packet; returns false for duplicates and packets that do
    /// not belong to this frame
    pub fn insert_packet(&mut self, packet: RtpPacket) -> bool {
        if self.packets.is_empty() {
            // First packet of the frame.
            self.frame_id = packet.frame_id;
            self.max_packet_id = packet.max_packet_id;
            self.is_key_frame = packet.is_key_frame;
            self.new_playout_delay_ms = packet.new_playout_delay_ms;
            if self.is_key_frame {
                debug_assert_eq!(packet.frame_id, packet.referenced_frame_id);
            }
            self.referenced_frame_id = packet.referenced_frame_id;
            self.rtp_timestamp = packet.rtp_timestamp;
        }

        if packet.frame_id != self.frame_id {
            return false;
        }

        if self.packets.contains_key(&packet.packet_id) {
            return false;
        }

        let payload_size = packet.payload.len();
        let packet_id = packet.packet_id;
        self.packets.insert(packet_id, packet);

        self.num_packets_received += 1;
        self.max_seen_packet_id = self.max_seen_packet_id.max(packet_id);
        self.total_data_size += payload_size;
        true
    }

    /// Whether all packets of the frame have arrived
    pub fn complete(&self) -> bool {
        self.num_packets_received >= 1 && self.num_packets_received - 1 == self.max_packet_id
    }

    /// Collect the packet ids not yet received
    ///
    /// For the newest (possibly still arriving) frame the search is capped
    /// at the highest packet id seen so far instead of the declared maximum.
    pub fn missing_packets(&self, newest_frame: bool, missing: &mut PacketIdSet) {
        let maximum = i32::from(if newest_frame {
            self.max_seen_packet_id
        } else {
            self.max_packet_id
        });

        let mut packet: i32 = 0;
        for &have in self.packets.keys() {
            if packet > maximum {
                break;
            }
            let end = i32::from(have).min(maximum + 1);
            while packet < end {
                missing.insert(packet as u16);
                packet += 1;
            }
            packet += 1;
        }
        while packet <= maximum {
            missing.insert(packet as u16);
            packet += 1;
        }
    }

    /// Assemble the complete frame into an `EncodedFrame`
    ///
    /// Returns `None` while the frame is still missing packets.
    pub fn assemble_encoded_frame(&self) -> Option<EncodedFrame> {
        if !self.complete() {
            return None;
        }

        let mut frame = EncodedFrame::default();
        frame.dependency = if self.is_key_frame {
            FrameDependency::Key
        } else if self.frame_id == self.referenced_frame_id {
            FrameDependency::Independent
        } else {
            FrameDependency::Dependent
        };
        frame.frame_id = self.frame_id;
        frame.referenced_frame_id = self.referenced_frame_id;
        frame.rtp_timestamp = self.rtp_timestamp;
        frame.new_playout_delay_ms = self.new_playout_delay_ms;

        frame.data.reserve(self.total_data_size);
        for packet in self.packets.values() {
            frame.data.extend_from_slice(&packet.payload);
        }
        Some(frame)
    }

    /// Whether the frame is a key frame
    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    /// The frame this one depends upon
    pub fn referenced_frame_id(&self) -> FrameId {
        self.referenced_frame_id
    }

    /// The frame id adopted from the first packet
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// The RTP timestamp of the frame
    pub fn rtp_timestamp(&self) -> RtpTimestamp {
        self.rtp_timestamp
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
