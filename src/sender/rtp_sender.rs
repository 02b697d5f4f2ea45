//! RTP sending and NACK-driven retransmission
//!
//! Splits encoded frames into packets, keeps them stored until they are
//! acknowledged or age out, and re-sends the subsets the receiver reports
//! missing. Retransmitted packets get fresh sequence numbers so receiver
//! statistics stay coherent.

use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error};

use crate::frame::{EncodedFrame, MAX_UNACKED_FRAMES, RTCP_ALL_PACKETS_LOST, RTCP_LAST_PACKET};
use crate::packet::rtcp::MissingFramesAndPackets;
use crate::pacing::{DedupInfo, DrainResult, PacedSender, PacketSink, SendPacketVector};
use crate::sender::packetizer::{RtpPacketizer, RtpPacketizerConfig};
use crate::sender::storage::PacketStorage;
use crate::time::{TimeDelta, TimeTicks};
use crate::{FrameId, RtpSsrc};

/// Byte offset of the sequence number within the RTP header
const BYTE_OFFSET_TO_SEQUENCE_NUMBER: usize = 2;

/// Configuration of one RTP stream
#[derive(Debug, Clone, Copy)]
pub struct RtpSenderConfig {
    /// SSRC of the outgoing stream
    pub ssrc: RtpSsrc,

    /// SSRC the receiver uses for its feedback
    pub feedback_ssrc: RtpSsrc,

    /// RTP payload type
    pub rtp_payload_type: u8,
}

/// Packetizes, stores and retransmits the frames of one stream
pub struct RtpSender {
    ssrc: RtpSsrc,
    storage: PacketStorage,
    packetizer: RtpPacketizer,
}

impl RtpSender {
    /// Create a sender for `config`, with a randomized initial sequence
    /// number
    pub fn new(config: &RtpSenderConfig) -> Self {
        let packetizer_config = RtpPacketizerConfig {
            payload_type: config.rtp_payload_type,
            sequence_number: rand::thread_rng().gen::<u16>(),
            ssrc: config.ssrc,
            ..Default::default()
        };
        Self {
            ssrc: config.ssrc,
            storage: PacketStorage::new(),
            packetizer: RtpPacketizer::new(packetizer_config),
        }
    }

    /// SSRC of the outgoing stream
    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// Total packets sent (for sender reports)
    pub fn send_packet_count(&self) -> usize {
        self.packetizer.send_packet_count()
    }

    /// Total payload octets sent (for sender reports)
    pub fn send_octet_count(&self) -> usize {
        self.packetizer.send_octet_count()
    }

    /// Packetize one frame, store it for retransmission and enqueue it on
    /// the pacer
    pub fn send_frame(
        &mut self,
        now: TimeTicks,
        pacer: &mut PacedSender,
        sink: &mut dyn PacketSink,
        frame: &EncodedFrame,
    ) -> DrainResult {
        let packets = self.packetizer.build_packets(frame);
        if packets.is_empty() {
            return DrainResult::Drained;
        }
        self.storage.store_frame(frame.frame_id, packets.clone());
        if self.storage.number_of_stored_frames() > MAX_UNACKED_FRAMES {
            error!("Possible bug: frames are not being actively released from storage");
        }
        pacer.send_packets(now, sink, packets)
    }

    /// Drop the stored packets of every frame up to and including
    /// `frame_id`
    pub fn release_frames_up_to(&mut self, frame_id: FrameId) {
        self.storage.release_frame(frame_id);
    }

    /// Re-send the packets the receiver reported missing
    ///
    /// A frame set containing [`RTCP_ALL_PACKETS_LOST`] selects the whole
    /// frame and one containing [`RTCP_LAST_PACKET`] selects only the final
    /// packet. With `cancel_rtx_if_not_in_list`, queued retransmissions of
    /// packets not in the request are cancelled from the pacer.
    pub fn resend_packets(
        &mut self,
        now: TimeTicks,
        pacer: &mut PacedSender,
        sink: &mut dyn PacketSink,
        addr: &str,
        missing_frames_and_packets: &MissingFramesAndPackets,
        cancel_rtx_if_not_in_list: bool,
        dedup_info: &DedupInfo,
    ) {
        for (&frame_id, missing_packet_set) in missing_frames_and_packets {
            let resend_all = missing_packet_set.contains(&RTCP_ALL_PACKETS_LOST);
            let resend_last = missing_packet_set.contains(&RTCP_LAST_PACKET);

            // Clone the handles so fresh sequence numbers can be taken
            // while walking the stored set.
            let stored_packets: SendPacketVector = match self.storage.get_frame(frame_id) {
                Some(packets) => packets.clone(),
                None => {
                    error!(
                        "Can't resend {} packets for frame {}",
                        missing_packet_set.len(),
                        frame_id
                    );
                    continue;
                }
            };

            let mut packets_to_resend = SendPacketVector::new();
            let mut to_cancel = Vec::new();
            let last_index = stored_packets.len() - 1;
            for (index, (packet_key, packet)) in stored_packets.iter().enumerate() {
                let packet_id = packet_key.1 .1;

                let resend = resend_all
                    || missing_packet_set.contains(&packet_id)
                    || (resend_last && index == last_index);

                if resend {
                    debug!("Resend {}:{} to {}", frame_id, packet_id, addr);
                    // Each retransmission gets a fresh sequence number;
                    // make_mut copies only while the bytes are still shared.
                    let mut packet_copy = packet.clone();
                    let sequence_number = self.packetizer.next_sequence_number();
                    Arc::make_mut(&mut packet_copy)
                        [BYTE_OFFSET_TO_SEQUENCE_NUMBER..BYTE_OFFSET_TO_SEQUENCE_NUMBER + 2]
                        .copy_from_slice(&sequence_number.to_be_bytes());
                    packets_to_resend.push((*packet_key, packet_copy));
                } else if cancel_rtx_if_not_in_list {
                    to_cancel.push(*packet_key);
                }
            }
            for packet_key in to_cancel {
                pacer.cancel_sending_packet(addr, &packet_key);
            }
            pacer.resend_packets(now, sink, addr, packets_to_resend, dedup_info);
        }
    }

    /// Re-send only the last packet of `frame_id` so the receiver discovers
    /// what it is missing
    pub fn resend_frame_for_kickstart(
        &mut self,
        now: TimeTicks,
        pacer: &mut PacedSender,
        sink: &mut dyn PacketSink,
        frame_id: FrameId,
        dedupe_window: TimeDelta,
    ) {
        let mut missing_frames_and_packets = MissingFramesAndPackets::new();
        missing_frames_and_packets
            .entry(frame_id)
            .or_default()
            .insert(RTCP_LAST_PACKET);

        // This extra packet only kick-starts the session; retransmission
        // efficiency does not matter here.
        let dedup_info = DedupInfo {
            resend_interval: dedupe_window,
            last_byte_acked_for_audio: 0,
        };
        self.resend_packets(
            now,
            pacer,
            sink,
            crate::pacing::MULTICAST_ADDR,
            &missing_frames_and_packets,
            false,
            &dedup_info,
        );
    }

    /// Bytes-sent watermark when the last packet of `frame_id` went out, or
    /// 0 when unknown
    pub fn last_byte_sent_for_frame(&self, pacer: &PacedSender, frame_id: FrameId) -> i64 {
        match self.storage.get_frame(frame_id) {
            Some(packets) => match packets.last() {
                Some((key, _)) => pacer.last_byte_sent_for_packet(key),
                None => 0,
            },
            None => 0,
        }
    }
}
