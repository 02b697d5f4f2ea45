//! ACK/NACK feedback message construction
//!
//! The receiver reports its progress every 33 ms: the newest frame received
//! complete and in order, plus the packets still missing from every frame
//! after it. A frame is NACKed at most once every 30 ms so retransmissions
//! already on the wire get a chance to arrive before being requested again.

use std::collections::BTreeMap;

use tracing::debug;

use crate::frame::{is_newer_frame_id, RTCP_ALL_PACKETS_LOST, START_FRAME_ID};
use crate::packet::rtcp::{PacketIdSet, SharerFeedback};
use crate::receiver::frame_buffer::FrameBuffer;
use crate::time::{TimeDelta, TimeTicks};
use crate::{FrameId, RtpSsrc};

/// Interval between feedback message updates
pub const FEEDBACK_UPDATE_INTERVAL: TimeDelta = TimeDelta::from_millis(33);

/// Minimum interval between NACKs for the same frame
pub const NACK_REPEAT_INTERVAL: TimeDelta = TimeDelta::from_millis(30);

/// Builds the periodic sharer feedback messages for a media stream
pub struct FeedbackBuilder {
    media_ssrc: RtpSsrc,

    message: SharerFeedback,
    last_update_time: TimeTicks,

    time_last_nacked: BTreeMap<FrameId, TimeTicks>,
    last_completed_frame_id: FrameId,

    /// Set once a key-frame request has gone out, so exactly one is emitted
    /// per recovery episode
    key_frame_requested: bool,
}

impl FeedbackBuilder {
    /// Create a builder for a media stream
    pub fn new(media_ssrc: RtpSsrc) -> Self {
        let mut message = SharerFeedback::new(media_ssrc);
        message.ack_frame_id = START_FRAME_ID;
        Self {
            media_ssrc,
            message,
            last_update_time: TimeTicks::default(),
            time_last_nacked: BTreeMap::new(),
            last_completed_frame_id: START_FRAME_ID,
            key_frame_requested: false,
        }
    }

    /// Record that `frame_id` has been received completely
    pub fn complete_frame_received(&mut self, frame_id: FrameId, now: TimeTicks) {
        debug_assert!(
            frame_id.wrapping_sub(self.last_completed_frame_id) as i32 >= 0,
            "acked frame went backwards"
        );
        if self.last_update_time.is_null() {
            // Our first update.
            self.last_update_time = now;
        }

        if self.last_completed_frame_id == frame_id {
            return;
        }

        // If this frame was nacked before, it no longer needs repeats.
        self.time_last_nacked.remove(&frame_id);

        self.last_completed_frame_id = frame_id;
        self.message.ack_frame_id = frame_id;
        self.message.missing_frames_and_packets.clear();
        self.last_update_time = now;
    }

    /// When the next feedback message is due, or `None` before any packet
    /// has been received
    pub fn time_to_send_next_message(&self, framer_empty: bool) -> Option<TimeTicks> {
        if self.last_update_time.is_null() && framer_empty {
            return None;
        }
        Some(self.last_update_time + FEEDBACK_UPDATE_INTERVAL)
    }

    /// Forget all NACK state
    pub fn reset(&mut self) {
        self.message.missing_frames_and_packets.clear();
        self.time_last_nacked.clear();
        self.key_frame_requested = false;
    }

    /// Restart acknowledgement from `frame_id` (after a skip or recovery)
    pub fn reset_to(&mut self, frame_id: FrameId) {
        self.message.ack_frame_id = frame_id;
        self.last_completed_frame_id = frame_id;
        self.message.missing_frames_and_packets.clear();
        self.time_last_nacked.clear();
        self.key_frame_requested = false;
    }

    /// Produce the next feedback message if the update interval has elapsed
    /// and there is something worth sending
    pub fn update_message(
        &mut self,
        now: TimeTicks,
        frames: &BTreeMap<FrameId, FrameBuffer>,
        waiting_for_key: bool,
        newest_frame_id: FrameId,
    ) -> Option<SharerFeedback> {
        if self.last_update_time.is_null() {
            if !frames.is_empty() {
                // We have received packets; start the cadence now.
                self.last_update_time = now;
            }
            return None;
        }
        if now - self.last_update_time < FEEDBACK_UPDATE_INTERVAL {
            return None;
        }
        self.last_update_time = now;

        self.build_packet_list(now, frames, waiting_for_key, newest_frame_id);

        let request_key = self.message.request_key_frame && !self.key_frame_requested;
        if self.message.missing_frames_and_packets.is_empty() && !request_key {
            return None;
        }
        if request_key {
            self.key_frame_requested = true;
            debug!("Requesting a key frame from {}", self.media_ssrc);
        }
        Some(self.message.clone())
    }

    fn build_packet_list(
        &mut self,
        now: TimeTicks,
        frames: &BTreeMap<FrameId, FrameBuffer>,
        waiting_for_key: bool,
        newest_frame_id: FrameId,
    ) {
        self.message.missing_frames_and_packets.clear();

        if frames.is_empty() {
            return;
        }

        self.message.request_key_frame = waiting_for_key;
        if waiting_for_key {
            return;
        }
        self.key_frame_requested = false;

        let mut next_expected_frame_id = self.message.ack_frame_id.wrapping_add(1);
        while !is_newer_frame_id(next_expected_frame_id, newest_frame_id) {
            if let Some(&nacked_at) = self.time_last_nacked.get(&next_expected_frame_id) {
                // This frame was nacked recently; give the resend time to
                // arrive.
                if now - nacked_at < NACK_REPEAT_INTERVAL {
                    next_expected_frame_id = next_expected_frame_id.wrapping_add(1);
                    continue;
                }
            }

            if let Some(frame) = frames.get(&next_expected_frame_id) {
                let last_frame = newest_frame_id == next_expected_frame_id;
                let mut missing = PacketIdSet::new();
                frame.missing_packets(last_frame, &mut missing);
                if !missing.is_empty() {
                    debug!(
                        "Requesting resend of {} packets from frame {}",
                        missing.len(),
                        next_expected_frame_id
                    );
                    self.time_last_nacked.insert(next_expected_frame_id, now);
                    self.message
                        .missing_frames_and_packets
                        .insert(next_expected_frame_id, missing);
                }
            } else {
                debug!(
                    "Requesting resend of all packets from frame {}",
                    next_expected_frame_id
                );
                self.time_last_nacked.insert(next_expected_frame_id, now);
                let mut missing = PacketIdSet::new();
                missing.insert(RTCP_ALL_PACKETS_LOST);
                self.message
                    .missing_frames_and_packets
                    .insert(next_expected_frame_id, missing);
            }
            next_expected_frame_id = next_expected_frame_id.wrapping_add(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::frame_buffer::tests::make_packet;

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000 + ms * 1000)
    }

    fn frames_with(packets: &[(FrameId, u16, u16)]) -> BTreeMap<FrameId, FrameBuffer> {
        let mut frames = BTreeMap::new();
        for &(frame_id, packet_id, max_packet_id) in packets {
            frames
                .entry(frame_id)
                .or_insert_with(FrameBuffer::new)
                .insert_packet(make_packet(frame_id, packet_id, max_packet_id, false, b"p"));
        }
        frames
    }

    #[test]
    fn test_no_message_before_any_packet() {
        let mut builder = FeedbackBuilder::new(11);
        assert!(builder.time_to_send_next_message(true).is_none());
        assert!(builder
            .update_message(ticks(0), &BTreeMap::new(), false, START_FRAME_ID)
            .is_none());
    }

    #[test]
    fn test_nack_for_missing_packet() {
        let mut builder = FeedbackBuilder::new(11);
        builder.reset_to(2); // Frames through 2 acked.

        // Frame 3 has packets 0..=2 of 4, packet 1 missing; frame 3 is newest.
        let frames = frames_with(&[(3, 0, 4), (3, 2, 4)]);

        // First poll only arms the cadence when it was never armed; ack did
        // not run here, so prime the clock through a completed ack.
        builder.complete_frame_received(2, ticks(0));
        let message = builder.update_message(ticks(40), &frames, false, 3).unwrap();
        assert_eq!(message.ack_frame_id, 2);
        let missing = &message.missing_frames_and_packets[&3];
        assert_eq!(missing.iter().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_nack_repeat_interval() {
        let mut builder = FeedbackBuilder::new(11);
        builder.complete_frame_received(0, ticks(0));
        builder.reset_to(2);
        let frames = frames_with(&[(3, 0, 4), (3, 2, 4)]);

        let first = builder.update_message(ticks(40), &frames, false, 3);
        assert!(first.is_some());

        // 20ms later the frame was nacked less than 30ms ago -> suppressed,
        // but the cadence gate fires first (40+33 > 60), so advance to 74ms
        // where the cadence is due but the nack is 34ms old and repeats.
        let second = builder.update_message(ticks(60), &frames, false, 3);
        assert!(second.is_none());

        let third = builder.update_message(ticks(74), &frames, false, 3).unwrap();
        assert!(third.missing_frames_and_packets.contains_key(&3));
    }

    #[test]
    fn test_unknown_frame_reported_all_lost() {
        let mut builder = FeedbackBuilder::new(11);
        builder.complete_frame_received(0, ticks(0));
        builder.reset_to(3);
        // Frame 5 exists, frame 4 was never seen.
        let frames = frames_with(&[(5, 0, 1)]);

        let message = builder.update_message(ticks(40), &frames, false, 5).unwrap();
        let lost = &message.missing_frames_and_packets[&4];
        assert!(lost.contains(&RTCP_ALL_PACKETS_LOST));
    }

    #[test]
    fn test_single_key_frame_request() {
        let mut builder = FeedbackBuilder::new(11);
        builder.complete_frame_received(0, ticks(0));
        let frames = frames_with(&[(200, 0, 1)]);

        let first = builder.update_message(ticks(40), &frames, true, 200).unwrap();
        assert!(first.request_key_frame);
        assert!(first.missing_frames_and_packets.is_empty());

        // No repeat while still waiting.
        assert!(builder.update_message(ticks(80), &frames, true, 200).is_none());
    }

    #[test]
    fn test_ack_clears_missing_state() {
        let mut builder = FeedbackBuilder::new(11);
        builder.complete_frame_received(0, ticks(0));
        builder.reset_to(2);
        let frames = frames_with(&[(3, 0, 4), (3, 2, 4)]);
        assert!(builder.update_message(ticks(40), &frames, false, 3).is_some());

        builder.complete_frame_received(3, ticks(50));
        // Frame 3 complete: nothing missing anymore.
        assert!(builder
            .update_message(ticks(90), &frames_with(&[]), false, 3)
            .is_none());
    }
}
