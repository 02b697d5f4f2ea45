//! Congestion control
//!
//! The frame sender consults a [`CongestionControl`] for the bitrate the
//! encoder should target. The fixed implementation is the default for
//! screen sharing; the adaptive one tracks how many bits are in flight
//! against the time available until the playout deadline.

use std::collections::VecDeque;

use crate::time::{TimeDelta, TimeTicks};
use crate::FrameId;

/// Bandwidth estimation consulted on every frame
pub trait CongestionControl: Send {
    /// A new round-trip-time measurement arrived
    fn update_rtt(&mut self, rtt: TimeDelta);

    /// The target playout delay changed
    fn update_target_playout_delay(&mut self, delay: TimeDelta);

    /// A frame of `size_bits` was handed to the transport
    fn send_frame_to_transport(&mut self, frame_id: FrameId, size_bits: usize, sent_time: TimeTicks);

    /// The receiver acknowledged `frame_id`
    fn ack_frame(&mut self, frame_id: FrameId, ack_time: TimeTicks);

    /// The bitrate the encoder should target for a frame that must be
    /// decodable by `playout_time`
    fn bitrate(&mut self, playout_time: TimeTicks, playout_delay: TimeDelta) -> u32;
}

/// Congestion control pinned to a constant bitrate
pub struct FixedCongestionControl {
    bitrate: u32,
}

impl FixedCongestionControl {
    pub fn new(bitrate: u32) -> Self {
        Self { bitrate }
    }
}

impl CongestionControl for FixedCongestionControl {
    fn update_rtt(&mut self, _rtt: TimeDelta) {}

    fn update_target_playout_delay(&mut self, _delay: TimeDelta) {}

    fn send_frame_to_transport(
        &mut self,
        _frame_id: FrameId,
        _size_bits: usize,
        _sent_time: TimeTicks,
    ) {
    }

    fn ack_frame(&mut self, _frame_id: FrameId, _ack_time: TimeTicks) {}

    fn bitrate(&mut self, _playout_time: TimeTicks, _playout_delay: TimeDelta) -> u32 {
        self.bitrate
    }
}

struct FrameInFlight {
    frame_id: FrameId,
    size_bits: usize,
    sent_time: TimeTicks,
}

/// Congestion control that weighs the bits already in flight against the
/// time left until playout
pub struct AdaptiveCongestionControl {
    min_bitrate: u32,
    max_bitrate: u32,

    rtt: TimeDelta,
    target_playout_delay: TimeDelta,

    in_flight: VecDeque<FrameInFlight>,
    bits_in_flight: usize,
}

impl AdaptiveCongestionControl {
    pub fn new(min_bitrate: u32, max_bitrate: u32) -> Self {
        debug_assert!(min_bitrate <= max_bitrate);
        Self {
            min_bitrate,
            max_bitrate,
            rtt: TimeDelta::ZERO,
            target_playout_delay: TimeDelta::ZERO,
            in_flight: VecDeque::new(),
            bits_in_flight: 0,
        }
    }
}

impl CongestionControl for AdaptiveCongestionControl {
    fn update_rtt(&mut self, rtt: TimeDelta) {
        self.rtt = rtt;
    }

    fn update_target_playout_delay(&mut self, delay: TimeDelta) {
        self.target_playout_delay = delay;
    }

    fn send_frame_to_transport(
        &mut self,
        frame_id: FrameId,
        size_bits: usize,
        sent_time: TimeTicks,
    ) {
        self.bits_in_flight += size_bits;
        self.in_flight.push_back(FrameInFlight {
            frame_id,
            size_bits,
            sent_time,
        });
    }

    fn ack_frame(&mut self, frame_id: FrameId, _ack_time: TimeTicks) {
        while let Some(front) = self.in_flight.front() {
            // Acks are cumulative.
            if front.frame_id.wrapping_sub(frame_id) as i32 > 0 {
                break;
            }
            self.bits_in_flight = self.bits_in_flight.saturating_sub(front.size_bits);
            self.in_flight.pop_front();
        }
    }

    fn bitrate(&mut self, playout_time: TimeTicks, playout_delay: TimeDelta) -> u32 {
        // Time until the oldest unacked frame must have fully arrived.
        let deadline = playout_time + playout_delay;
        let reference = self
            .in_flight
            .front()
            .map(|frame| frame.sent_time)
            .unwrap_or(playout_time - playout_delay);
        let available = deadline - reference - self.rtt / 2;
        if available <= TimeDelta::ZERO {
            return self.min_bitrate;
        }

        let bits_per_second = self.bits_in_flight as f64 / available.as_secs_f64();
        // What is already in flight consumes part of the channel; the
        // encoder may use the rest, bounded to the configured range.
        let remaining = self.max_bitrate as f64 - bits_per_second;
        (remaining.max(self.min_bitrate as f64) as u32).min(self.max_bitrate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000 + ms * 1000)
    }

    #[test]
    fn test_fixed_bitrate_is_constant() {
        let mut control = FixedCongestionControl::new(2_000_000);
        control.update_rtt(TimeDelta::from_millis(300));
        control.send_frame_to_transport(0, 500_000, ticks(0));
        assert_eq!(control.bitrate(ticks(100), TimeDelta::from_millis(100)), 2_000_000);
    }

    #[test]
    fn test_adaptive_bitrate_within_bounds() {
        let mut control = AdaptiveCongestionControl::new(500_000, 5_000_000);
        control.update_rtt(TimeDelta::from_millis(50));
        control.update_target_playout_delay(TimeDelta::from_millis(100));

        for id in 0..5u32 {
            control.send_frame_to_transport(id, 200_000, ticks(i64::from(id) * 33));
        }
        let bitrate = control.bitrate(ticks(200), TimeDelta::from_millis(100));
        assert!(bitrate >= 500_000);
        assert!(bitrate <= 5_000_000);
    }

    #[test]
    fn test_acks_reduce_bits_in_flight() {
        let mut control = AdaptiveCongestionControl::new(500_000, 5_000_000);
        for id in 0..5u32 {
            control.send_frame_to_transport(id, 200_000, ticks(i64::from(id) * 33));
        }
        let before = control.bitrate(ticks(200), TimeDelta::from_millis(100));
        control.ack_frame(4, ticks(210));
        let after = control.bitrate(ticks(220), TimeDelta::from_millis(100));
        assert!(after >= before);
        assert_eq!(control.bits_in_flight, 0);
    }
}
