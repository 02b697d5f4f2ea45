//! Video stream sender
//!
//! Sits between the external encoder and the transport: raw captured
//! frames are admitted (or dropped) before they enter the encoder, and
//! encoded frames coming back from the encoder worker are accounted for
//! and handed onward. When admission fails, a larger target playout delay
//! is proposed so the stream can absorb the congestion.

use tracing::{debug, warn};

use crate::frame::{is_newer_rtp_timestamp, EncodedFrame, VIDEO_FREQUENCY};
use crate::packet::rtcp::SharerFeedback;
use crate::sender::congestion::FixedCongestionControl;
use crate::sender::frame_sender::{FrameSender, RtcpDecision};
use crate::time::{TimeDelta, TimeTicks};
use crate::{RtpSsrc, RtpTimestamp};

/// Round trips the adaptive playout target allows for
const ROUND_TRIPS_NEEDED: i64 = 4;

/// Constant slack added to the adaptive playout target
const CONSTANT_TIME_MS: i64 = 75;

/// Outcome of offering a captured frame for encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAdmission {
    /// Feed the frame to the encoder
    Accept,

    /// Drop the frame; if set, publish the proposed target playout delay
    Drop(Option<TimeDelta>),
}

/// Sender-side pipeline state for the video stream
pub struct VideoSender {
    frame_sender: FrameSender,

    frame_rate: f64,
    frames_in_encoder: usize,
    duration_in_encoder: TimeDelta,
    last_reference_time: TimeTicks,
    last_enqueued_frame_rtp_timestamp: RtpTimestamp,
}

impl VideoSender {
    /// Create a video sender with the default fixed congestion control
    ///
    /// A zero `min_playout_delay` pins the target to `max_playout_delay`
    /// and disables the adaptive proposals.
    pub fn new(
        ssrc: RtpSsrc,
        frame_rate: f64,
        min_playout_delay: TimeDelta,
        max_playout_delay: TimeDelta,
        initial_bitrate: u32,
    ) -> Self {
        Self {
            frame_sender: FrameSender::new(
                false,
                ssrc,
                VIDEO_FREQUENCY,
                frame_rate,
                min_playout_delay,
                max_playout_delay,
                Box::new(FixedCongestionControl::new(initial_bitrate)),
            ),
            frame_rate,
            frames_in_encoder: 0,
            duration_in_encoder: TimeDelta::ZERO,
            last_reference_time: TimeTicks::default(),
            last_enqueued_frame_rtp_timestamp: 0,
        }
    }

    /// The shared sender core
    pub fn frame_sender(&self) -> &FrameSender {
        &self.frame_sender
    }

    /// The shared sender core, mutably
    pub fn frame_sender_mut(&mut self) -> &mut FrameSender {
        &mut self.frame_sender
    }

    /// Frames currently inside the encoder
    pub fn frames_in_encoder(&self) -> usize {
        self.frames_in_encoder
    }

    /// Media duration currently in flight
    pub fn in_flight_media_duration(&self) -> TimeDelta {
        self.duration_in_encoder
    }

    /// Change the encoder frame rate (on `changeEncoding`)
    pub fn set_frame_rate(&mut self, frame_rate: f64) {
        self.frame_rate = frame_rate;
    }

    /// Admit or drop one captured frame before it enters the encoder
    ///
    /// `rtp_timestamp` and `reference_time` describe the capture moment.
    /// When the frame must be dropped because too much media is in flight,
    /// a larger target playout delay may be proposed; the caller publishes
    /// it via [`VideoSender::set_target_playout_delay`] so future frames
    /// carry it to the receiver.
    pub fn insert_raw_frame(
        &mut self,
        rtp_timestamp: RtpTimestamp,
        reference_time: TimeTicks,
    ) -> FrameAdmission {
        if !self.last_reference_time.is_null()
            && (!is_newer_rtp_timestamp(rtp_timestamp, self.last_enqueued_frame_rtp_timestamp)
                || reference_time < self.last_reference_time)
        {
            warn!("Dropping video frame: RTP or reference time did not increase");
            return FrameAdmission::Drop(None);
        }

        let duration_added_by_next_frame = if self.frames_in_encoder > 0 {
            reference_time - self.last_reference_time
        } else {
            // The nominal duration of one frame at the configured rate.
            TimeDelta::from_secs_f64(0.01 / self.frame_rate)
        };

        if self.frame_sender.should_drop_next_frame(
            duration_added_by_next_frame,
            self.frames_in_encoder,
            self.duration_in_encoder,
        ) {
            let new_target_delay = (self.frame_sender.current_round_trip_time()
                * ROUND_TRIPS_NEEDED
                + TimeDelta::from_millis(CONSTANT_TIME_MS))
            .min(self.frame_sender.max_playout_delay());
            if new_target_delay > self.frame_sender.target_playout_delay() {
                warn!("New target delay: {}ms", new_target_delay.as_millis());
                return FrameAdmission::Drop(Some(new_target_delay));
            }
            return FrameAdmission::Drop(None);
        }

        self.frames_in_encoder += 1;
        self.duration_in_encoder += duration_added_by_next_frame;
        self.last_reference_time = reference_time;
        self.last_enqueued_frame_rtp_timestamp = rtp_timestamp;
        FrameAdmission::Accept
    }

    /// Account for a frame coming back from the encoder worker and prepare
    /// it for the transport
    pub fn on_encoded_frame(
        &mut self,
        now: TimeTicks,
        frame: &mut EncodedFrame,
    ) -> RtcpDecision {
        self.duration_in_encoder = if self.last_reference_time.is_null() {
            TimeDelta::ZERO
        } else {
            self.last_reference_time - frame.reference_time
        };
        self.frames_in_encoder = self.frames_in_encoder.saturating_sub(1);

        self.frame_sender.prepare_encoded_frame(now, frame)
    }

    /// Publish a changed target playout delay
    pub fn set_target_playout_delay(&mut self, delay: TimeDelta) {
        self.frame_sender.set_target_playout_delay(delay);
    }

    /// Digest receiver feedback
    pub fn on_received_feedback(&mut self, feedback: &SharerFeedback, now: TimeTicks) {
        self.frame_sender.on_received_feedback(feedback, now);
    }

    /// A new round-trip-time measurement arrived
    pub fn on_measured_round_trip_time(&mut self, rtt: TimeDelta) {
        self.frame_sender.on_measured_round_trip_time(rtt);
    }

    /// Forget encoder state when the track stops
    pub fn stop(&mut self) {
        debug!("Stopped sending frames");
        self.frames_in_encoder = 0;
        self.duration_in_encoder = TimeDelta::ZERO;
        self.last_reference_time = TimeTicks::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameDependency;

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000 + ms * 1000)
    }

    fn video_sender() -> VideoSender {
        VideoSender::new(
            11,
            30.0,
            TimeDelta::from_millis(40),
            TimeDelta::from_millis(400),
            2_000_000,
        )
    }

    fn encoded(frame_id: u32, rtp_timestamp: u32, reference_time: TimeTicks) -> EncodedFrame {
        EncodedFrame {
            dependency: FrameDependency::Key,
            frame_id,
            referenced_frame_id: frame_id,
            rtp_timestamp,
            reference_time,
            new_playout_delay_ms: 0,
            data: vec![0u8; 1000],
        }
    }

    #[test]
    fn test_accepts_monotone_frames() {
        let mut sender = video_sender();
        assert_eq!(
            sender.insert_raw_frame(3000, ticks(0)),
            FrameAdmission::Accept
        );
        assert_eq!(
            sender.insert_raw_frame(6000, ticks(33)),
            FrameAdmission::Accept
        );
        assert_eq!(sender.frames_in_encoder(), 2);
    }

    #[test]
    fn test_rejects_non_monotone_timestamps() {
        let mut sender = video_sender();
        assert_eq!(
            sender.insert_raw_frame(6000, ticks(0)),
            FrameAdmission::Accept
        );
        assert_eq!(
            sender.insert_raw_frame(3000, ticks(33)),
            FrameAdmission::Drop(None)
        );
        assert_eq!(
            sender.insert_raw_frame(9000, ticks(20)),
            FrameAdmission::Accept
        );
    }

    #[test]
    fn test_drop_proposes_larger_playout_delay() {
        let mut sender = video_sender();
        sender.on_measured_round_trip_time(TimeDelta::from_millis(5));

        // Saturate the in-flight window so admission fails.
        let mut t = 0i64;
        let mut rtp = 3000u32;
        let mut proposed = None;
        for _ in 0..64 {
            match sender.insert_raw_frame(rtp, ticks(t)) {
                FrameAdmission::Accept => {}
                FrameAdmission::Drop(delay) => {
                    proposed = delay;
                    break;
                }
            }
            t += 33;
            rtp += 3000;
        }
        // rtt*4 + 75ms = 95ms, below the 400ms cap and above the initial
        // 40ms target.
        let proposed = proposed.expect("admission never failed");
        assert_eq!(proposed.as_millis(), 95);
    }

    #[test]
    fn test_encoded_frame_accounting() {
        let mut sender = video_sender();
        sender.insert_raw_frame(3000, ticks(0));
        sender.insert_raw_frame(6000, ticks(33));

        let mut frame = encoded(0, 3000, ticks(0));
        sender.on_encoded_frame(ticks(40), &mut frame);
        assert_eq!(sender.frames_in_encoder(), 1);
        assert_eq!(sender.in_flight_media_duration().as_millis(), 33);
    }
}
