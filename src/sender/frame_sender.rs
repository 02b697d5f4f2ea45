//! Frame admission and sender-side RTCP scheduling
//!
//! The frame sender decides whether the stream can afford to carry another
//! frame, remembers per-frame timing so sender reports can interpolate the
//! current RTP timestamp, and manages the aggressive report phase that
//! bootstraps lip sync at session start.

use tracing::{debug, warn};

use crate::frame::{time_delta_to_rtp_delta, EncodedFrame, MAX_UNACKED_FRAMES};
use crate::packet::rtcp::SharerFeedback;
use crate::sender::congestion::CongestionControl;
use crate::time::{TimeDelta, TimeTicks};
use crate::{FrameId, RtpSsrc, RtpTimestamp};

/// Number of per-frame RTCP reports sent at session start so the receiver
/// can establish lip sync quickly
const NUM_AGGRESSIVE_REPORTS_SENT_AT_START: usize = 100;

/// Additional frames allowed in flight when input bursts past the frame
/// rate
const MAX_FRAME_BURST: f64 = 5.0;

/// Size of the per-frame timing rings
const TIMING_RING_SIZE: usize = 256;

/// What to do about RTCP after accepting a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcpDecision {
    /// Nothing special; the periodic schedule covers it
    Nothing,

    /// Send a report now (aggressive bootstrap phase)
    SendReportNow,
}

/// Shared sender core for one media stream
pub struct FrameSender {
    ssrc: RtpSsrc,
    rtp_timebase: i32,
    is_audio: bool,

    send_target_playout_delay: bool,
    num_aggressive_rtcp_reports_sent: usize,

    last_send_time: TimeTicks,
    last_sent_frame_id: FrameId,
    local_pause_id: u32,

    target_playout_delay: TimeDelta,
    min_playout_delay: TimeDelta,
    max_playout_delay: TimeDelta,

    max_frame_rate: f64,

    current_round_trip_time: TimeDelta,

    congestion_control: Box<dyn CongestionControl>,

    frame_reference_times: [TimeTicks; TIMING_RING_SIZE],
    frame_rtp_timestamps: [RtpTimestamp; TIMING_RING_SIZE],
}

impl FrameSender {
    /// Create the sender core for one stream
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        is_audio: bool,
        ssrc: RtpSsrc,
        rtp_timebase: i32,
        max_frame_rate: f64,
        min_playout_delay: TimeDelta,
        max_playout_delay: TimeDelta,
        congestion_control: Box<dyn CongestionControl>,
    ) -> Self {
        debug_assert!(rtp_timebase > 0);
        let min_playout_delay = if min_playout_delay.is_zero() {
            max_playout_delay
        } else {
            min_playout_delay
        };
        let mut sender = Self {
            ssrc,
            rtp_timebase,
            is_audio,
            send_target_playout_delay: false,
            num_aggressive_rtcp_reports_sent: 0,
            last_send_time: TimeTicks::default(),
            last_sent_frame_id: 0,
            local_pause_id: 0,
            target_playout_delay: TimeDelta::ZERO,
            min_playout_delay,
            max_playout_delay,
            max_frame_rate,
            current_round_trip_time: TimeDelta::ZERO,
            congestion_control,
            frame_reference_times: [TimeTicks::default(); TIMING_RING_SIZE],
            frame_rtp_timestamps: [0; TIMING_RING_SIZE],
        };
        sender.set_target_playout_delay(sender.min_playout_delay);
        sender.send_target_playout_delay = false;
        sender
    }

    /// SSRC of this stream
    pub fn ssrc(&self) -> RtpSsrc {
        self.ssrc
    }

    /// RTP timebase of this stream
    pub fn rtp_timebase(&self) -> i32 {
        self.rtp_timebase
    }

    /// The current target playout delay
    pub fn target_playout_delay(&self) -> TimeDelta {
        self.target_playout_delay
    }

    /// Upper bound for the adaptive playout delay
    pub fn max_playout_delay(&self) -> TimeDelta {
        self.max_playout_delay
    }

    /// The last measured round-trip time
    pub fn current_round_trip_time(&self) -> TimeDelta {
        self.current_round_trip_time
    }

    /// Id of the newest frame handed to the transport
    pub fn last_sent_frame_id(&self) -> FrameId {
        self.last_sent_frame_id
    }

    /// Whether any frame has been sent yet
    pub fn has_sent_frames(&self) -> bool {
        !self.last_send_time.is_null()
    }

    /// Mutable access for in-flight accounting updates
    pub fn congestion_control(&mut self) -> &mut dyn CongestionControl {
        self.congestion_control.as_mut()
    }

    /// Change the target playout delay, clamped to the configured range
    pub fn set_target_playout_delay(&mut self, new_target_playout_delay: TimeDelta) {
        if self.send_target_playout_delay && self.target_playout_delay == new_target_playout_delay
        {
            return;
        }
        let clamped = new_target_playout_delay
            .max(self.min_playout_delay)
            .min(self.max_playout_delay);
        debug!(
            "{}[{}] Target playout delay changing from {}ms to {}ms",
            if self.is_audio { "AUDIO" } else { "VIDEO" },
            self.ssrc,
            self.target_playout_delay.as_millis(),
            clamped.as_millis()
        );
        self.target_playout_delay = clamped;
        self.send_target_playout_delay = true;
        self.congestion_control
            .update_target_playout_delay(clamped);
    }

    /// A new round-trip-time measurement arrived
    pub fn on_measured_round_trip_time(&mut self, rtt: TimeDelta) {
        debug_assert!(rtt > TimeDelta::ZERO);
        self.current_round_trip_time = rtt;
    }

    /// Account for a frame that is about to go to the transport
    ///
    /// Stamps the pending target playout delay into the frame and decides
    /// whether an RTCP report should accompany it (the first hundred frames
    /// each carry one so that lip sync converges before steady state).
    pub fn prepare_encoded_frame(
        &mut self,
        now: TimeTicks,
        frame: &mut EncodedFrame,
    ) -> RtcpDecision {
        let frame_id = frame.frame_id;
        self.last_send_time = now;
        self.last_sent_frame_id = frame_id;

        self.record_latest_frame_timestamps(frame_id, frame.reference_time, frame.rtp_timestamp);

        let mut decision = RtcpDecision::Nothing;
        if self.num_aggressive_rtcp_reports_sent < NUM_AGGRESSIVE_REPORTS_SENT_AT_START {
            self.num_aggressive_rtcp_reports_sent += 1;
            if self.num_aggressive_rtcp_reports_sent == NUM_AGGRESSIVE_REPORTS_SENT_AT_START {
                debug!("[{}] Sending last aggressive report", self.ssrc);
            }
            decision = RtcpDecision::SendReportNow;
        }

        self.congestion_control
            .send_frame_to_transport(frame_id, frame.data.len() * 8, now);

        if self.send_target_playout_delay {
            frame.new_playout_delay_ms = self.target_playout_delay.as_millis() as u16;
        }
        decision
    }

    /// Digest feedback from the receiver
    pub fn on_received_feedback(&mut self, feedback: &SharerFeedback, now: TimeTicks) {
        let have_valid_rtt = self.current_round_trip_time > TimeDelta::ZERO;
        if have_valid_rtt {
            self.congestion_control.update_rtt(self.current_round_trip_time);

            // A valid RTT means the receiver answered one of our reports;
            // the aggressive phase has served its purpose.
            if self.num_aggressive_rtcp_reports_sent < NUM_AGGRESSIVE_REPORTS_SENT_AT_START {
                debug!(
                    "[{}] No longer a need to send reports aggressively (sent {})",
                    self.ssrc, self.num_aggressive_rtcp_reports_sent
                );
                self.num_aggressive_rtcp_reports_sent = NUM_AGGRESSIVE_REPORTS_SENT_AT_START;
            }
        }

        if self.last_send_time.is_null() {
            // Cannot get an ACK without having sent a frame first.
            return;
        }
        self.congestion_control.ack_frame(feedback.ack_frame_id, now);
    }

    /// The RTP timestamp corresponding to "now", interpolated from the last
    /// sent frame
    pub fn current_time_as_rtp_timestamp(&self, now: TimeTicks) -> RtpTimestamp {
        let reference_time = self.recorded_reference_time(self.last_sent_frame_id);
        let time_delta = now - reference_time;
        let rtp_delta = time_delta_to_rtp_delta(time_delta, self.rtp_timebase);
        self.recorded_rtp_timestamp(self.last_sent_frame_id)
            .wrapping_add(rtp_delta as u32)
    }

    /// Next pause id for a pause/resume indication
    pub fn next_pause_id(&mut self) -> u32 {
        let id = self.local_pause_id;
        self.local_pause_id = (self.local_pause_id + 1) % 65536;
        id
    }

    /// Whether the next frame must be dropped to protect the stream
    pub fn should_drop_next_frame(
        &self,
        frame_duration: TimeDelta,
        frames_in_encoder: usize,
        duration_in_flight: TimeDelta,
    ) -> bool {
        // More frames in flight than the system's design limit?
        let count_frames_in_flight = frames_in_encoder;
        if count_frames_in_flight >= MAX_UNACKED_FRAMES {
            warn!(
                "[{}] Dropping: too many frames would be in flight ({} in encoder)",
                self.ssrc, frames_in_encoder
            );
            return true;
        }

        // Faster than the configured frame rate, beyond short bursts?
        let max_frames_in_flight = self.max_frame_rate * duration_in_flight.as_secs_f64();
        if count_frames_in_flight as f64 >= max_frames_in_flight + MAX_FRAME_BURST {
            warn!("[{}] Dropping: burst threshold would be exceeded", self.ssrc);
            return true;
        }

        // Would the in-flight media duration overflow the playout window?
        let duration_would_be_in_flight = duration_in_flight + frame_duration;
        let allowed_in_flight = self.allowed_in_flight_media_duration();
        if duration_would_be_in_flight > allowed_in_flight {
            warn!(
                "[{}] Dropping: in-flight duration would be too high ({}ms + {}ms frame)",
                self.ssrc,
                duration_in_flight.as_millis(),
                frame_duration.as_millis()
            );
            return true;
        }

        false
    }

    // The playout window plus the time an ACK needs to come back.
    fn allowed_in_flight_media_duration(&self) -> TimeDelta {
        self.target_playout_delay + self.current_round_trip_time / 2
    }

    fn record_latest_frame_timestamps(
        &mut self,
        frame_id: FrameId,
        reference_time: TimeTicks,
        rtp_timestamp: RtpTimestamp,
    ) {
        debug_assert!(!reference_time.is_null());
        let slot = frame_id as usize % TIMING_RING_SIZE;
        self.frame_reference_times[slot] = reference_time;
        self.frame_rtp_timestamps[slot] = rtp_timestamp;
    }

    fn recorded_reference_time(&self, frame_id: FrameId) -> TimeTicks {
        self.frame_reference_times[frame_id as usize % TIMING_RING_SIZE]
    }

    fn recorded_rtp_timestamp(&self, frame_id: FrameId) -> RtpTimestamp {
        self.frame_rtp_timestamps[frame_id as usize % TIMING_RING_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDependency, VIDEO_FREQUENCY};
    use crate::sender::congestion::FixedCongestionControl;

    fn sender() -> FrameSender {
        FrameSender::new(
            false,
            11,
            VIDEO_FREQUENCY,
            30.0,
            TimeDelta::ZERO,
            TimeDelta::from_millis(100),
            Box::new(FixedCongestionControl::new(2_000_000)),
        )
    }

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000 + ms * 1000)
    }

    fn frame(frame_id: FrameId, reference_time: TimeTicks) -> EncodedFrame {
        EncodedFrame {
            dependency: FrameDependency::Key,
            frame_id,
            referenced_frame_id: frame_id,
            rtp_timestamp: frame_id.wrapping_mul(3000),
            reference_time,
            new_playout_delay_ms: 0,
            data: vec![0u8; 1000],
        }
    }

    #[test]
    fn test_aggressive_reports_until_rtt() {
        let mut sender = sender();
        // Every early frame asks for an immediate report.
        for id in 0..5u32 {
            let mut f = frame(id, ticks(i64::from(id) * 33));
            assert_eq!(
                sender.prepare_encoded_frame(ticks(i64::from(id) * 33), &mut f),
                RtcpDecision::SendReportNow
            );
        }

        // Once an RTT measurement exists, feedback ends the aggressive
        // phase.
        sender.on_measured_round_trip_time(TimeDelta::from_millis(40));
        sender.on_received_feedback(&SharerFeedback::new(11), ticks(200));
        let mut f = frame(5, ticks(200));
        assert_eq!(
            sender.prepare_encoded_frame(ticks(200), &mut f),
            RtcpDecision::Nothing
        );
    }

    #[test]
    fn test_rtp_timestamp_interpolation() {
        let mut sender = sender();
        let mut f = frame(0, ticks(0));
        f.rtp_timestamp = 90_000;
        sender.prepare_encoded_frame(ticks(0), &mut f);

        // 100ms later the media clock has advanced by 9000 units at 90kHz.
        assert_eq!(sender.current_time_as_rtp_timestamp(ticks(100)), 99_000);
    }

    #[test]
    fn test_playout_delay_stamped_once_set() {
        let mut sender = sender();
        sender.set_target_playout_delay(TimeDelta::from_millis(80));
        let mut f = frame(0, ticks(0));
        sender.prepare_encoded_frame(ticks(0), &mut f);
        assert_eq!(f.new_playout_delay_ms, 80);
    }

    #[test]
    fn test_playout_delay_clamped_to_range() {
        let mut sender = sender();
        sender.set_target_playout_delay(TimeDelta::from_millis(100_000));
        assert_eq!(sender.target_playout_delay().as_millis(), 100);
    }

    #[test]
    fn test_drop_on_encoder_backlog() {
        let sender = sender();
        assert!(sender.should_drop_next_frame(
            TimeDelta::from_millis(33),
            MAX_UNACKED_FRAMES,
            TimeDelta::ZERO,
        ));
    }

    #[test]
    fn test_drop_on_frame_rate_burst() {
        let sender = sender();
        // 10 frames in flight over 100ms at 30fps allows 3 + burst of 5.
        assert!(sender.should_drop_next_frame(
            TimeDelta::from_millis(33),
            10,
            TimeDelta::from_millis(100),
        ));
        assert!(!sender.should_drop_next_frame(
            TimeDelta::from_millis(33),
            5,
            TimeDelta::from_millis(33),
        ));
    }

    #[test]
    fn test_drop_on_in_flight_duration() {
        let mut sender = sender();
        sender.on_measured_round_trip_time(TimeDelta::from_millis(20));
        // Allowed: 100ms target + 10ms half-rtt = 110ms.
        assert!(sender.should_drop_next_frame(
            TimeDelta::from_millis(33),
            1,
            TimeDelta::from_millis(90),
        ));
        assert!(!sender.should_drop_next_frame(
            TimeDelta::from_millis(33),
            1,
            TimeDelta::from_millis(70),
        ));
    }
}
