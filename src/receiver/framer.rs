//! Multi-frame reassembly and release ordering
//!
//! The framer tracks one [`FrameBuffer`] per in-flight frame, decides which
//! complete frame may be handed to the decoder next, and feeds the feedback
//! builder that turns the missing-packet picture into NACK messages.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::frame::{is_newer_frame_id, is_older_frame_id, EncodedFrame, START_FRAME_ID};
use crate::packet::rtcp::{PacketIdSet, SharerFeedback};
use crate::packet::RtpPacket;
use crate::receiver::feedback::FeedbackBuilder;
use crate::receiver::frame_buffer::FrameBuffer;
use crate::time::TimeTicks;
use crate::{FrameId, RtpSsrc};

/// How far ahead of the last released frame the stream may run before the
/// framer demands a key frame
const OLD_FRAME_THRESHOLD: u32 = 120;

/// Outcome of inserting one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The packet completed its frame
    FrameComplete,

    /// The packet was stored; its frame is still incomplete
    Incomplete,

    /// The packet was already present and was ignored
    Duplicate,

    /// The packet is too old (or otherwise unusable) and was dropped
    Dropped,
}

/// A frame the framer is willing to release
#[derive(Debug)]
pub struct ReleasableFrame {
    /// The assembled frame
    pub frame: EncodedFrame,

    /// Whether this is exactly the next frame in sequence
    pub next_frame: bool,

    /// Whether more than one decodable frame is waiting
    pub have_multiple_decodable_frames: bool,
}

/// Orders incoming frames and drives feedback generation
pub struct Framer {
    decoder_faster_than_max_frame_rate: bool,

    frames: BTreeMap<FrameId, FrameBuffer>,

    feedback: FeedbackBuilder,

    waiting_for_key: bool,
    last_released_frame: FrameId,
    last_key_frame_received: FrameId,
    newest_frame_id: FrameId,
}

impl Framer {
    /// Create a framer for the media stream `ssrc`
    pub fn new(ssrc: RtpSsrc, decoder_faster_than_max_frame_rate: bool) -> Self {
        Self {
            decoder_faster_than_max_frame_rate,
            frames: BTreeMap::new(),
            feedback: FeedbackBuilder::new(ssrc),
            waiting_for_key: true,
            last_released_frame: START_FRAME_ID,
            last_key_frame_received: START_FRAME_ID,
            newest_frame_id: START_FRAME_ID,
        }
    }

    /// Insert one parsed RTP packet
    pub fn insert_packet(&mut self, packet: RtpPacket) -> InsertResult {
        let frame_id = packet.frame_id;
        let packet_id = packet.packet_id;

        if is_older_frame_id(
            self.last_released_frame.wrapping_add(OLD_FRAME_THRESHOLD),
            frame_id,
        ) {
            warn!(
                "Frame {} is far ahead of last released {} (last key {})",
                frame_id, self.last_released_frame, self.last_key_frame_received
            );
            if is_older_frame_id(
                self.last_key_frame_received.wrapping_add(OLD_FRAME_THRESHOLD),
                frame_id,
            ) {
                self.waiting_for_key = true;
            } else {
                // A recent key frame exists; fast-forward to it.
                self.last_released_frame = self.last_key_frame_received;
                self.feedback.reset_to(self.last_released_frame);
            }
        }

        if packet.is_key_frame {
            if is_newer_frame_id(frame_id, self.last_key_frame_received) {
                self.last_key_frame_received = frame_id;
            }

            if self.waiting_for_key {
                self.waiting_for_key = false;
                self.last_released_frame = frame_id.wrapping_sub(1);
                self.feedback.reset_to(self.last_released_frame);
            }
        }

        if is_older_frame_id(frame_id, self.last_released_frame) && !self.waiting_for_key {
            // Packet is too old.
            return InsertResult::Dropped;
        }

        if is_newer_frame_id(frame_id, self.newest_frame_id) {
            self.newest_frame_id = frame_id;
        }

        let buffer = self.frames.entry(frame_id).or_default();
        if !buffer.insert_packet(packet) {
            debug!(
                "Packet {} for frame {} already received, ignored",
                packet_id, frame_id
            );
            return InsertResult::Duplicate;
        }

        if buffer.complete() {
            InsertResult::FrameComplete
        } else {
            InsertResult::Incomplete
        }
    }

    /// The next frame the decoder may consume, if any
    ///
    /// Prefers the frame exactly following the last released one; when the
    /// decoder runs faster than the capture frame rate the oldest complete
    /// decodable frame is offered instead, so the stream can skip over
    /// gaps.
    pub fn get_encoded_frame(&self) -> Option<ReleasableFrame> {
        let have_multiple_decodable_frames = self.have_multiple_decodable_frames();

        let (frame_id, next_frame) = if let Some(frame_id) = self.next_continuous_frame() {
            (frame_id, true)
        } else {
            if !self.decoder_faster_than_max_frame_rate {
                return None;
            }
            (self.next_frame_allowing_skipping_frames()?, false)
        };

        let frame = self.frames.get(&frame_id)?.assemble_encoded_frame()?;
        Some(ReleasableFrame {
            frame,
            next_frame,
            have_multiple_decodable_frames,
        })
    }

    /// Whether no frames are buffered
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Whether a buffer exists for `frame_id`
    pub fn frame_exists(&self, frame_id: FrameId) -> bool {
        self.frames.contains_key(&frame_id)
    }

    /// The newest frame id seen on the wire
    pub fn newest_frame_id(&self) -> FrameId {
        self.newest_frame_id
    }

    /// Number of buffered frames that are complete
    pub fn number_of_complete_frames(&self) -> usize {
        self.frames.values().filter(|f| f.complete()).count()
    }

    /// Whether the framer cannot make progress without a key frame
    pub fn is_waiting_for_key(&self) -> bool {
        self.waiting_for_key
    }

    /// Collect the missing packets of `frame_id`
    pub fn missing_packets(&self, frame_id: FrameId, last_frame: bool, missing: &mut PacketIdSet) {
        if let Some(frame) = self.frames.get(&frame_id) {
            frame.missing_packets(last_frame, missing);
        }
    }

    /// Record `frame_id` as seen-complete for feedback purposes
    pub fn ack_frame(&mut self, frame_id: FrameId, now: TimeTicks) {
        self.feedback.complete_frame_received(frame_id, now);
    }

    /// Evict `frame_id` and everything older
    pub fn release_frame(&mut self, frame_id: FrameId) -> bool {
        self.frames.remove(&frame_id);

        // We have a frame; drop all frames with a lower id too.
        let mut skipped_old_frame = false;
        let stale: Vec<FrameId> = self
            .frames
            .keys()
            .copied()
            .filter(|&id| is_older_frame_id(id, frame_id))
            .collect();
        for id in stale {
            self.frames.remove(&id);
            skipped_old_frame = true;
        }

        self.last_released_frame = frame_id;
        skipped_old_frame
    }

    /// Drop all state and wait for a fresh key frame
    pub fn reset(&mut self) {
        self.waiting_for_key = true;
        self.last_released_frame = START_FRAME_ID;
        self.newest_frame_id = START_FRAME_ID;
        self.frames.clear();
        self.feedback.reset();
    }

    /// Restart the feedback builder at the last released frame
    pub fn reset_feedback(&mut self) {
        self.feedback.reset_to(self.last_released_frame);
    }

    /// When the next feedback message is due, or `None` before any packet
    /// has been received
    pub fn time_to_send_next_feedback(&self) -> Option<TimeTicks> {
        self.feedback.time_to_send_next_message(self.frames.is_empty())
    }

    /// Produce the next feedback message if one is due
    pub fn poll_feedback(&mut self, now: TimeTicks) -> Option<SharerFeedback> {
        self.feedback
            .update_message(now, &self.frames, self.waiting_for_key, self.newest_frame_id)
    }

    fn next_continuous_frame(&self) -> Option<FrameId> {
        self.frames
            .iter()
            .find(|(_, frame)| frame.complete() && self.continuous_frame(frame))
            .map(|(&id, _)| id)
    }

    fn next_frame_allowing_skipping_frames(&self) -> Option<FrameId> {
        let mut best_match: Option<FrameId> = None;
        for (&id, frame) in &self.frames {
            if frame.complete() && self.decodable_frame(frame) {
                match best_match {
                    Some(best) if !is_older_frame_id(id, best) => {}
                    _ => best_match = Some(id),
                }
            }
        }
        best_match
    }

    fn have_multiple_decodable_frames(&self) -> bool {
        let mut found_one = false;
        for frame in self.frames.values() {
            if frame.complete() && self.decodable_frame(frame) {
                if found_one {
                    return true;
                }
                found_one = true;
            }
        }
        false
    }

    fn continuous_frame(&self, frame: &FrameBuffer) -> bool {
        if self.waiting_for_key && !frame.is_key_frame() {
            return false;
        }
        self.last_released_frame.wrapping_add(1) == frame.frame_id()
    }

    fn decodable_frame(&self, frame: &FrameBuffer) -> bool {
        if frame.is_key_frame() {
            return true;
        }
        if self.waiting_for_key {
            return false;
        }
        // Self-referencing frames do not depend on prior state.
        if frame.referenced_frame_id() == frame.frame_id() {
            return true;
        }
        // Its referenced frame was already released, or is about to be.
        if is_older_frame_id(frame.referenced_frame_id(), self.last_released_frame) {
            return true;
        }
        frame.referenced_frame_id() == self.last_released_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::frame_buffer::tests::make_packet;

    fn now() -> TimeTicks {
        TimeTicks::from_micros(1_000_000)
    }

    #[test]
    fn test_waits_for_key_frame() {
        let mut framer = Framer::new(11, true);
        // Dependent frames before any key are buffered but never released.
        assert_eq!(
            framer.insert_packet(make_packet(0, 0, 0, false, b"d")),
            InsertResult::FrameComplete
        );
        assert!(framer.get_encoded_frame().is_none());

        assert_eq!(
            framer.insert_packet(make_packet(1, 0, 0, true, b"k")),
            InsertResult::FrameComplete
        );
        let release = framer.get_encoded_frame().unwrap();
        assert_eq!(release.frame.frame_id, 1);
        assert!(release.next_frame);
    }

    #[test]
    fn test_releases_in_order() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.insert_packet(make_packet(1, 0, 0, false, b"a"));
        framer.insert_packet(make_packet(2, 0, 0, false, b"b"));

        for expected in 0..3u32 {
            let release = framer.get_encoded_frame().unwrap();
            assert_eq!(release.frame.frame_id, expected);
            assert!(release.next_frame);
            framer.ack_frame(expected, now());
            framer.release_frame(expected);
        }
        assert!(framer.get_encoded_frame().is_none());
    }

    #[test]
    fn test_skips_to_decodable_frame_when_decoder_is_fast() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.release_frame(0);

        // Frame 1 lost; frame 2 references frame 0 (already released).
        let mut packet = make_packet(2, 0, 0, false, b"c");
        packet.referenced_frame_id = 0;
        framer.insert_packet(packet);

        let release = framer.get_encoded_frame().unwrap();
        assert_eq!(release.frame.frame_id, 2);
        assert!(!release.next_frame);
    }

    #[test]
    fn test_no_skipping_without_fast_decoder() {
        let mut framer = Framer::new(11, false);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.release_frame(0);

        let mut packet = make_packet(2, 0, 0, false, b"c");
        packet.referenced_frame_id = 0;
        framer.insert_packet(packet);
        assert!(framer.get_encoded_frame().is_none());
    }

    #[test]
    fn test_dependent_on_unreleased_frame_not_decodable() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.release_frame(0);

        // Frame 2 depends on the still-missing frame 1.
        framer.insert_packet(make_packet(2, 0, 0, false, b"c"));
        assert!(framer.get_encoded_frame().is_none());
    }

    #[test]
    fn test_old_packets_dropped() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(5, 0, 0, true, b"k"));
        framer.release_frame(5);

        assert_eq!(
            framer.insert_packet(make_packet(3, 0, 0, false, b"old")),
            InsertResult::Dropped
        );
    }

    #[test]
    fn test_key_frame_gap_fast_forwards() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        let release = framer.get_encoded_frame().unwrap();
        framer.ack_frame(release.frame.frame_id, now());
        framer.release_frame(0);

        // A key frame lands far beyond the recovery window; the framer
        // fast-forwards to it and releases it.
        framer.insert_packet(make_packet(121, 0, 0, true, b"k2"));
        assert!(!framer.is_waiting_for_key());
        let release = framer.get_encoded_frame().unwrap();
        assert_eq!(release.frame.frame_id, 121);
        assert!(release.next_frame);
    }

    #[test]
    fn test_gap_without_key_requests_key() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.release_frame(0);

        framer.insert_packet(make_packet(150, 0, 0, false, b"d"));
        assert!(framer.is_waiting_for_key());

        // The next feedback message carries exactly one key-frame request.
        framer.ack_frame(0, now());
        let message = framer.poll_feedback(now() + crate::receiver::feedback::FEEDBACK_UPDATE_INTERVAL);
        let message = message.expect("expected a key frame request");
        assert!(message.request_key_frame);
        assert!(framer
            .poll_feedback(now() + crate::receiver::feedback::FEEDBACK_UPDATE_INTERVAL * 2)
            .is_none());
    }

    #[test]
    fn test_release_frame_drops_older() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.insert_packet(make_packet(1, 0, 1, false, b"p")); // incomplete
        let mut packet = make_packet(2, 0, 0, false, b"c");
        packet.referenced_frame_id = 0;
        framer.insert_packet(packet);

        framer.release_frame(2);
        assert!(framer.is_empty());
        // Releasing frame 2 skipped the incomplete frame 1.
    }

    #[test]
    fn test_multiple_decodable_frames() {
        let mut framer = Framer::new(11, true);
        framer.insert_packet(make_packet(0, 0, 0, true, b"k"));
        framer.insert_packet(make_packet(1, 0, 0, true, b"k2"));

        let release = framer.get_encoded_frame().unwrap();
        assert!(release.have_multiple_decodable_frames);
    }
}
