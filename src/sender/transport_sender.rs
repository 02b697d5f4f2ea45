//! Sender-side transport composition
//!
//! Owns the pacer, the RTP sender and the RTCP session for the video
//! stream, and routes incoming control traffic back into them: feedback
//! becomes retransmissions (deduplicated by the current round-trip time)
//! and report blocks become RTT measurements.

use std::collections::BTreeSet;

use tracing::{debug, error};

use crate::events::EventDispatcher;
use crate::frame::EncodedFrame;
use crate::pacing::{DedupInfo, DrainResult, PacedSender, PacketSink};
use crate::packet::rtcp::SharerFeedback;
use crate::rtcp::RtcpSession;
use crate::sender::rtp_sender::{RtpSender, RtpSenderConfig};
use crate::time::{TimeDelta, TimeTicks};
use crate::{FrameId, RtpSsrc, RtpTimestamp};

/// What an incoming control packet produced
#[derive(Debug, Default)]
pub struct IncomingPacketOutcome {
    /// Feedback addressed to the video stream, already acted upon for
    /// retransmission; forwarded so the frame sender can update admission
    pub sharer_message: Option<SharerFeedback>,

    /// A fresh round-trip-time measurement
    pub round_trip_time: Option<TimeDelta>,
}

/// Shared transport state for all outgoing streams
pub struct TransportSender {
    pacer: PacedSender,

    video_sender: Option<RtpSender>,
    video_rtcp_session: Option<RtcpSession>,

    valid_ssrcs: BTreeSet<RtpSsrc>,
}

impl TransportSender {
    /// Create the transport composition
    pub fn new(events: std::sync::Arc<EventDispatcher>) -> Self {
        Self {
            pacer: PacedSender::new(events),
            video_sender: None,
            video_rtcp_session: None,
            valid_ssrcs: BTreeSet::new(),
        }
    }

    /// Accept control traffic from this SSRC
    pub fn add_valid_ssrc(&mut self, ssrc: RtpSsrc) {
        self.valid_ssrcs.insert(ssrc);
    }

    /// Set up the video stream
    pub fn initialize_video(&mut self, config: &RtpSenderConfig) {
        self.video_sender = Some(RtpSender::new(config));
        self.video_rtcp_session = Some(RtcpSession::new(config.ssrc, config.feedback_ssrc));
        self.pacer.register_video_ssrc(config.ssrc);
        self.add_valid_ssrc(config.feedback_ssrc);
    }

    /// The pacer (for drain scheduling by the session driver)
    pub fn pacer_mut(&mut self) -> &mut PacedSender {
        &mut self.pacer
    }

    /// Total RTP packets sent on the video stream
    pub fn video_send_packet_count(&self) -> usize {
        self.video_sender
            .as_ref()
            .map(|s| s.send_packet_count())
            .unwrap_or(0)
    }

    /// Total RTP payload octets sent on the video stream
    pub fn video_send_octet_count(&self) -> usize {
        self.video_sender
            .as_ref()
            .map(|s| s.send_octet_count())
            .unwrap_or(0)
    }

    /// Route one received datagram; only RTCP is expected on the sender
    pub fn on_received_packet(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        addr: &str,
        data: &[u8],
    ) -> IncomingPacketOutcome {
        let mut outcome = IncomingPacketOutcome::default();

        if !RtcpSession::is_rtcp_packet(data) {
            error!("Invalid RTCP packet received");
            return outcome;
        }
        let ssrc = RtcpSession::ssrc_of_sender(data);
        if !self.valid_ssrcs.contains(&ssrc) {
            error!("Stale packet received from {}", ssrc);
            return outcome;
        }

        let session = match self.video_rtcp_session.as_mut() {
            Some(session) => session,
            None => return outcome,
        };
        match session.incoming_rtcp_packet(now, data) {
            Ok(incoming) => {
                outcome.round_trip_time = incoming.round_trip_time;
                if let Some(message) = incoming.sharer_message {
                    self.on_received_sharer_message(now, sink, addr, &message);
                    outcome.sharer_message = Some(message);
                }
            }
            Err(e) => error!("Dropping malformed RTCP packet: {}", e),
        }
        outcome
    }

    fn on_received_sharer_message(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        addr: &str,
        message: &SharerFeedback,
    ) {
        let mut dedup_info = DedupInfo::default();
        if let (Some(sender), Some(session)) =
            (self.video_sender.as_ref(), self.video_rtcp_session.as_ref())
        {
            if sender.ssrc() == message.media_ssrc {
                dedup_info.resend_interval = session.current_round_trip_time();
            }
        }

        if message.missing_frames_and_packets.is_empty() {
            return;
        }

        if let Some(sender) = self.video_sender.as_mut() {
            if sender.ssrc() == message.media_ssrc {
                sender.resend_packets(
                    now,
                    &mut self.pacer,
                    sink,
                    addr,
                    &message.missing_frames_and_packets,
                    true,
                    &dedup_info,
                );
            }
        }
    }

    /// Packetize and enqueue one encoded frame
    pub fn insert_frame(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        ssrc: RtpSsrc,
        frame: &EncodedFrame,
    ) -> DrainResult {
        match self.video_sender.as_mut() {
            Some(sender) if sender.ssrc() == ssrc => {
                sender.send_frame(now, &mut self.pacer, sink, frame)
            }
            _ => {
                debug!("No sender registered for ssrc {}", ssrc);
                DrainResult::Drained
            }
        }
    }

    /// Emit a sender report for the stream
    pub fn send_sender_report(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        ssrc: RtpSsrc,
        current_time_as_rtp_timestamp: RtpTimestamp,
    ) -> DrainResult {
        let packet_count = self.video_send_packet_count() as u32;
        let octet_count = self.video_send_octet_count() as u32;
        match (self.video_sender.as_ref(), self.video_rtcp_session.as_mut()) {
            (Some(sender), Some(session)) if sender.ssrc() == ssrc => {
                let packet = session.build_rtcp_from_sender(
                    now,
                    current_time_as_rtp_timestamp,
                    packet_count,
                    octet_count,
                );
                self.pacer.send_rtcp_packet(sink, ssrc, packet)
            }
            _ => {
                debug_assert!(false, "sender report for unknown ssrc");
                DrainResult::Drained
            }
        }
    }

    /// Emit a pause/resume indication for the stream
    pub fn send_sender_pause_resume(
        &mut self,
        sink: &mut dyn PacketSink,
        ssrc: RtpSsrc,
        last_sent_frame_id: FrameId,
        pause_id: u32,
    ) -> DrainResult {
        match (self.video_sender.as_ref(), self.video_rtcp_session.as_ref()) {
            (Some(sender), Some(session)) if sender.ssrc() == ssrc => {
                let packet = session.build_pause_resume(last_sent_frame_id, pause_id);
                self.pacer.send_rtcp_packet(sink, ssrc, packet)
            }
            _ => {
                debug_assert!(false, "pause/resume for unknown ssrc");
                DrainResult::Drained
            }
        }
    }

    /// Re-send the last packet of `frame_id` to restart a stalled exchange
    pub fn resend_frame_for_kickstart(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        ssrc: RtpSsrc,
        frame_id: FrameId,
    ) {
        let dedupe_window = self
            .video_rtcp_session
            .as_ref()
            .map(|session| session.current_round_trip_time())
            .unwrap_or(TimeDelta::ZERO);
        match self.video_sender.as_mut() {
            Some(sender) if sender.ssrc() == ssrc => {
                sender.resend_frame_for_kickstart(now, &mut self.pacer, sink, frame_id, dedupe_window);
            }
            _ => debug_assert!(false, "kickstart for unknown ssrc"),
        }
    }

    /// Continue draining after a burst timer or writable notification
    pub fn send_stored_packets(&mut self, now: TimeTicks, sink: &mut dyn PacketSink) -> DrainResult {
        self.pacer.send_stored_packets(now, sink)
    }

    /// The current round-trip time of the video RTCP session
    pub fn current_round_trip_time(&self) -> TimeDelta {
        self.video_rtcp_session
            .as_ref()
            .map(|session| session.current_round_trip_time())
            .unwrap_or(TimeDelta::ZERO)
    }
}
