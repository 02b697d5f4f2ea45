//! Receive-side orchestration
//!
//! Glues the packet parser, receiver statistics, framer and RTCP session
//! together and decides when each complete frame may be emitted to the
//! decoder. Playout times are derived from the lip-sync reference recovered
//! out of sender reports; when that reference is missing the local clock
//! stands in until the first report arrives.

use tracing::{debug, error, warn};

use crate::config::ReceiverConfig;
use crate::frame::{rtp_delta_to_time_delta, EncodedFrame};
use crate::packet::{RtpPacket, SharerPacket};
use crate::receiver::framer::{Framer, InsertResult};
use crate::receiver::stats::ReceiverStats;
use crate::rtcp::RtcpSession;
use crate::time::{ClockDriftSmoother, TimeDelta, TimeTicks};
use crate::{PacketRef, RtpTimestamp};

/// Base interval of the network-timeout watchdog
const MAX_NETWORK_TIMEOUT: TimeDelta = TimeDelta::from_millis(2000);

/// Watchdog escalation is capped at this many consecutive timeouts
const MAX_NETWORK_TIMEOUTS_COUNTED: i64 = 5;

/// What the driver should do after processing or emission
#[derive(Debug, Default)]
pub struct EmitOutcome {
    /// Frames released for decoding, in order
    pub frames: Vec<EncodedFrame>,

    /// Emission paused until this time waiting for the consecutive frame
    pub defer_until: Option<TimeTicks>,
}

/// Receives one media stream and emits decodable frames
pub struct FrameReceiver {
    rtp_timebase: i32,
    target_playout_delay: TimeDelta,
    expected_frame_duration: TimeDelta,

    rtcp: RtcpSession,
    stats: ReceiverStats,
    framer: Framer,

    /// Outstanding decoder requests for frames
    pending_requests: usize,

    is_waiting_for_consecutive_frame: bool,

    frame_id_to_rtp_timestamp: [RtpTimestamp; 256],

    lip_sync_rtp_timestamp: RtpTimestamp,
    lip_sync_reference_time: TimeTicks,
    lip_sync_drift: ClockDriftSmoother,

    network_timeouts_count: i64,
    last_received_time: TimeTicks,
    last_frame_id: i64,
}

impl FrameReceiver {
    /// Create a receiver for `config`
    pub fn new(config: &ReceiverConfig) -> Self {
        Self {
            rtp_timebase: config.rtp_timebase,
            target_playout_delay: TimeDelta::from_millis(i64::from(config.rtp_max_delay_ms)),
            expected_frame_duration: TimeDelta::from_secs(1) / i64::from(config.target_frame_rate),
            rtcp: RtcpSession::new(config.receiver_ssrc, config.sender_ssrc),
            stats: ReceiverStats::new(),
            framer: Framer::new(config.sender_ssrc, true),
            pending_requests: 0,
            is_waiting_for_consecutive_frame: false,
            frame_id_to_rtp_timestamp: [0; 256],
            lip_sync_rtp_timestamp: 0,
            lip_sync_reference_time: TimeTicks::default(),
            lip_sync_drift: ClockDriftSmoother::new(ClockDriftSmoother::default_time_constant()),
            network_timeouts_count: 0,
            last_received_time: TimeTicks::default(),
            last_frame_id: -1,
        }
    }

    /// The current target playout delay
    pub fn target_playout_delay(&self) -> TimeDelta {
        self.target_playout_delay
    }

    /// Id of the last frame emitted to the decoder
    pub fn last_frame_id(&self) -> i64 {
        self.last_frame_id
    }

    /// The decoder wants one more frame
    pub fn request_encoded_frame(&mut self, now: TimeTicks) -> EmitOutcome {
        self.pending_requests += 1;
        self.emit_available_encoded_frames(now)
    }

    /// Drop all outstanding decoder requests (on pause)
    pub fn flush_frames(&mut self) {
        self.pending_requests = 0;
    }

    /// Feed one classified packet into the pipeline
    ///
    /// Returns frames that became emittable, if any.
    pub fn process_packet(&mut self, now: TimeTicks, packet: SharerPacket) -> EmitOutcome {
        self.last_received_time = now;
        self.network_timeouts_count = 0;

        match packet {
            SharerPacket::Rtcp(data) => {
                match self.rtcp.incoming_rtcp_packet(now, &data) {
                    Ok(incoming) => {
                        if incoming.pause_hint.is_some() {
                            // Receive side treats pause as a hint only.
                            debug!("Sender signalled pause");
                        }
                    }
                    Err(e) => warn!("Dropping malformed RTCP packet: {}", e),
                }
                EmitOutcome::default()
            }
            SharerPacket::Rtp(rtp) => {
                self.stats.update_statistics(&rtp, now);
                self.process_parsed_packet(now, rtp)
            }
        }
    }

    fn process_parsed_packet(&mut self, now: TimeTicks, packet: RtpPacket) -> EmitOutcome {
        let packet_id = packet.packet_id;
        let frame_id = packet.frame_id;
        let timestamp = packet.rtp_timestamp;
        debug!(
            "Received {}packet {}:{}",
            if packet.is_key_frame { "key " } else { "" },
            frame_id,
            packet_id
        );

        self.frame_id_to_rtp_timestamp[(frame_id & 0xff) as usize] = timestamp;

        let insert_result = self.framer.insert_packet(packet);
        if insert_result == InsertResult::Duplicate {
            return EmitOutcome::default();
        }

        if packet_id == 0 || self.lip_sync_reference_time.is_null() {
            let (fresh_sync_rtp, fresh_sync_reference) =
                match self.rtcp.latest_lip_sync_times(now) {
                    Some(pair) => pair,
                    None => {
                        warn!("Lip sync info missing, falling back to the local clock");
                        (timestamp, now)
                    }
                };

            if self.lip_sync_reference_time.is_null() {
                self.lip_sync_reference_time = fresh_sync_reference;
            } else {
                self.lip_sync_reference_time += rtp_delta_to_time_delta(
                    i64::from(fresh_sync_rtp.wrapping_sub(self.lip_sync_rtp_timestamp) as i32),
                    self.rtp_timebase,
                );
            }
            self.lip_sync_rtp_timestamp = fresh_sync_rtp;
            self.lip_sync_drift
                .update(now, fresh_sync_reference - self.lip_sync_reference_time);
        }

        if insert_result == InsertResult::FrameComplete {
            self.emit_available_encoded_frames(now)
        } else {
            EmitOutcome::default()
        }
    }

    /// Release every frame the policy allows right now
    pub fn emit_available_encoded_frames(&mut self, now: TimeTicks) -> EmitOutcome {
        let mut outcome = EmitOutcome::default();

        while self.pending_requests > 0 {
            let releasable = match self.framer.get_encoded_frame() {
                Some(releasable) => releasable,
                None => break,
            };
            let mut frame = releasable.frame;

            let playout_time = self.playout_time(&frame);

            if releasable.have_multiple_decodable_frames && now > playout_time {
                // Behind schedule with a newer decodable frame waiting:
                // skip this one unread.
                self.framer.release_frame(frame.frame_id);
                continue;
            }

            if !releasable.next_frame {
                // The strictly-next frame is missing. If the missing frame
                // could still arrive and be played in time, hold off.
                let earliest_possible_end_time_of_missing_frame =
                    now + self.expected_frame_duration * 2;
                if earliest_possible_end_time_of_missing_frame < playout_time {
                    if !self.is_waiting_for_consecutive_frame {
                        self.is_waiting_for_consecutive_frame = true;
                        outcome.defer_until = Some(playout_time);
                    }
                    return outcome;
                }
            }

            self.last_frame_id = i64::from(frame.frame_id);
            self.framer.ack_frame(frame.frame_id, now);

            // Decrypt hook: frames pass through unchanged.
            let frame_data = decrypt_frame(frame.data);
            frame.data = frame_data;

            frame.reference_time = playout_time;
            self.framer.release_frame(frame.frame_id);
            if frame.new_playout_delay_ms != 0 {
                self.target_playout_delay =
                    TimeDelta::from_millis(i64::from(frame.new_playout_delay_ms));
            }

            outcome.frames.push(frame);
            self.pending_requests -= 1;
        }
        outcome
    }

    /// The deferral timer elapsed; try emitting again
    pub fn on_deferred_wait_elapsed(&mut self, now: TimeTicks) -> EmitOutcome {
        self.is_waiting_for_consecutive_frame = false;
        self.emit_available_encoded_frames(now)
    }

    fn playout_time(&self, frame: &EncodedFrame) -> TimeTicks {
        let target_playout_delay = if frame.new_playout_delay_ms != 0 {
            TimeDelta::from_millis(i64::from(frame.new_playout_delay_ms))
        } else {
            self.target_playout_delay
        };

        self.lip_sync_reference_time
            + self.lip_sync_drift.current()
            + rtp_delta_to_time_delta(
                i64::from(frame.rtp_timestamp.wrapping_sub(self.lip_sync_rtp_timestamp) as i32),
                self.rtp_timebase,
            )
            + target_playout_delay
    }

    /// Escalating watchdog: fires after 2s * (1 + consecutive timeouts) of
    /// silence; any received packet resets the escalation
    pub fn check_network_timeout(&mut self, now: TimeTicks) -> bool {
        if self.last_received_time.is_null() {
            return false;
        }
        let timeout = MAX_NETWORK_TIMEOUT * (1 + self.network_timeouts_count);
        let delta = now - self.last_received_time;
        if delta > timeout {
            error!("Not receiving network packets for {}ms", delta.as_millis());
            if self.network_timeouts_count < MAX_NETWORK_TIMEOUTS_COUNTED {
                self.network_timeouts_count += 1;
            }
            return true;
        }
        false
    }

    /// Build the periodic receiver report (RR + RRTR)
    pub fn build_rtcp_report(&mut self, now: TimeTicks) -> PacketRef {
        let statistics = self.stats.get_statistics();
        let time_data = self.rtcp.convert_to_ntp_and_save(now);
        self.rtcp
            .build_rtcp_from_receiver(time_data, None, TimeDelta::ZERO, Some(&statistics))
    }

    /// When the next feedback message is due, if ever
    pub fn time_to_send_next_feedback(&self) -> Option<TimeTicks> {
        self.framer.time_to_send_next_feedback()
    }

    /// Build the ACK/NACK feedback compound if one is due
    pub fn poll_feedback(&mut self, now: TimeTicks) -> Option<PacketRef> {
        let message = self.framer.poll_feedback(now)?;
        let time_data = self.rtcp.convert_to_ntp_and_save(now);
        Some(self.rtcp.build_rtcp_from_receiver(
            time_data,
            Some(&message),
            self.target_playout_delay,
            None,
        ))
    }

    /// Restart feedback after a pause indication
    pub fn send_paused_indication(&mut self) {
        self.framer.reset_feedback();
    }
}

// Placeholder for the (not yet specified) frame decryption.
fn decrypt_frame(data: Vec<u8>) -> Vec<u8> {
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDependency;
    use crate::packet::RtpPacket;
    use crate::receiver::frame_buffer::tests::make_packet;

    fn config() -> ReceiverConfig {
        ReceiverConfig {
            receiver_ssrc: 12,
            sender_ssrc: 11,
            rtp_max_delay_ms: 100,
            target_frame_rate: 30,
            rtp_timebase: 90_000,
        }
    }

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000_000 + ms * 1000)
    }

    fn rtp(packet: RtpPacket) -> SharerPacket {
        SharerPacket::Rtp(packet)
    }

    #[test]
    fn test_clean_delivery_in_order() {
        let mut receiver = FrameReceiver::new(&config());
        for _ in 0..3 {
            receiver.request_encoded_frame(ticks(0));
        }

        let mut emitted = Vec::new();
        for frame_id in 0..3u32 {
            let packet = make_packet(frame_id, 0, 0, frame_id == 0, b"frame");
            let outcome = receiver.process_packet(ticks(i64::from(frame_id) * 33), rtp(packet));
            emitted.extend(outcome.frames);
        }

        assert_eq!(emitted.len(), 3);
        for (i, frame) in emitted.iter().enumerate() {
            assert_eq!(frame.frame_id, i as u32);
        }
        assert_eq!(receiver.last_frame_id(), 2);
        // Playout times are target-delay ahead of the (local-clock) lip
        // sync reference.
        assert!(emitted[0].reference_time >= ticks(0));
    }

    #[test]
    fn test_emission_waits_for_request() {
        let mut receiver = FrameReceiver::new(&config());
        let outcome = receiver.process_packet(ticks(0), rtp(make_packet(0, 0, 0, true, b"k")));
        assert!(outcome.frames.is_empty());

        let outcome = receiver.request_encoded_frame(ticks(1));
        assert_eq!(outcome.frames.len(), 1);
    }

    #[test]
    fn test_defers_when_next_frame_missing() {
        let mut receiver = FrameReceiver::new(&config());
        receiver.request_encoded_frame(ticks(0));
        receiver.process_packet(ticks(0), rtp(make_packet(0, 0, 0, true, b"k")));
        let outcome = receiver.request_encoded_frame(ticks(5));
        assert!(outcome.frames.is_empty() || outcome.frames[0].frame_id == 0);

        // Frame 1 lost; frame 2 (referencing 0) arrives immediately. The
        // playout deadline is ~100ms away, so emission defers.
        let mut packet = make_packet(2, 0, 0, false, b"skip");
        packet.referenced_frame_id = 0;
        let outcome = receiver.process_packet(ticks(10), rtp(packet));
        assert!(outcome.frames.is_empty());
        let defer = outcome.defer_until.expect("expected a deferral");
        assert!(defer > ticks(10));

        // Once the wait elapses the skip is allowed.
        let outcome = receiver.on_deferred_wait_elapsed(defer);
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.frames[0].frame_id, 2);
    }

    #[test]
    fn test_playout_delay_override_persists() {
        let mut receiver = FrameReceiver::new(&config());
        receiver.request_encoded_frame(ticks(0));
        let mut packet = make_packet(0, 0, 0, true, b"k");
        packet.new_playout_delay_ms = 250;
        let outcome = receiver.process_packet(ticks(0), rtp(packet));
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(receiver.target_playout_delay().as_millis(), 250);
    }

    #[test]
    fn test_network_timeout_escalates() {
        let mut receiver = FrameReceiver::new(&config());
        // Nothing received yet: the watchdog stays quiet.
        assert!(!receiver.check_network_timeout(ticks(10_000)));

        receiver.process_packet(ticks(0), rtp(make_packet(0, 0, 0, true, b"k")));
        assert!(!receiver.check_network_timeout(ticks(1_000)));
        assert!(receiver.check_network_timeout(ticks(2_500)));
        // Escalated: next threshold is 4s after the last packet.
        assert!(!receiver.check_network_timeout(ticks(3_500)));
        assert!(receiver.check_network_timeout(ticks(4_500)));
    }

    #[test]
    fn test_feedback_nacks_missing_packet() {
        let mut receiver = FrameReceiver::new(&config());
        // Frame 0 complete, frame 1 missing packet 1 of 3.
        receiver.process_packet(ticks(0), rtp(make_packet(0, 0, 0, true, b"k")));
        receiver.request_encoded_frame(ticks(1));
        receiver.process_packet(ticks(2), rtp(make_packet(1, 0, 2, false, b"a")));
        receiver.process_packet(ticks(3), rtp(make_packet(1, 2, 2, false, b"c")));

        let feedback = receiver.poll_feedback(ticks(40)).expect("feedback due");
        // The compound must parse as sharer feedback on the sender side.
        let mut parser = crate::packet::rtcp::RtcpParser::new(11, 12);
        parser.parse(&feedback).unwrap();
        let message = parser.sharer_message().unwrap();
        assert_eq!(message.ack_frame_id, 0);
        assert!(message.missing_frames_and_packets[&1].contains(&1));
    }

    #[test]
    fn test_catch_up_skips_late_frame() {
        let mut receiver = FrameReceiver::new(&config());
        receiver.process_packet(ticks(0), rtp(make_packet(0, 0, 0, true, b"k")));
        receiver.process_packet(ticks(1), rtp(make_packet(1, 0, 0, true, b"k2")));

        // Request long after both playout deadlines have passed: the older
        // frame is skipped unread and the newest emitted.
        let late = ticks(5_000);
        let outcome = receiver.request_encoded_frame(late);
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.frames[0].frame_id, 1);
    }

    #[test]
    fn test_dependency_metadata_survives_reassembly() {
        let mut receiver = FrameReceiver::new(&config());
        receiver.request_encoded_frame(ticks(0));
        let outcome = receiver.process_packet(ticks(0), rtp(make_packet(7, 0, 0, true, b"k")));
        // A lone key frame resets the framer's release point.
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(outcome.frames[0].dependency, FrameDependency::Key);
        assert_eq!(outcome.frames[0].referenced_frame_id, 7);
    }
}
