//! Per-stream receiver statistics
//!
//! Tracks the quantities reported in RTCP receiver report blocks: fraction
//! lost since the previous report, cumulative loss, the extended highest
//! sequence number and an interarrival jitter estimate.

use crate::frame::is_newer_sequence_number;
use crate::packet::rtcp::RtpReceiverStatistics;
use crate::packet::RtpPacket;
use crate::time::TimeTicks;

/// One full cycle of the 16-bit sequence number space
const MAX_SEQUENCE_NUMBER: u32 = 65536;

/// Running statistics for one RTP stream
pub struct ReceiverStats {
    // Global metrics.
    min_sequence_number: u16,
    max_sequence_number: u16,
    total_number_packets: u32,
    sequence_number_cycles: u16,
    last_received_rtp_seconds: f64,
    last_received_packet_time: TimeTicks,
    jitter_seconds: f64,

    // Intermediate metrics, reset on every report.
    interval_min_sequence_number: u16,
    interval_number_packets: u32,
    interval_wrap_count: u32,
}

impl ReceiverStats {
    /// Create empty statistics
    pub fn new() -> Self {
        Self {
            min_sequence_number: 0,
            max_sequence_number: 0,
            total_number_packets: 0,
            sequence_number_cycles: 0,
            last_received_rtp_seconds: 0.0,
            last_received_packet_time: TimeTicks::default(),
            jitter_seconds: 0.0,
            interval_min_sequence_number: 0,
            interval_number_packets: 0,
            interval_wrap_count: 0,
        }
    }

    /// Produce a report-block snapshot and reset the interval window
    pub fn get_statistics(&mut self) -> RtpReceiverStatistics {
        let mut ret = RtpReceiverStatistics::default();

        // Fraction lost over the interval.
        if self.interval_number_packets > 0 {
            let diff: i64 = if self.interval_wrap_count == 0 {
                i64::from(self.max_sequence_number) - i64::from(self.interval_min_sequence_number)
                    + 1
            } else {
                i64::from(MAX_SEQUENCE_NUMBER) * i64::from(self.interval_wrap_count - 1)
                    + (i64::from(self.max_sequence_number)
                        - i64::from(self.interval_min_sequence_number)
                        + i64::from(MAX_SEQUENCE_NUMBER)
                        + 1)
            };
            if diff >= 1 {
                let ratio = 1.0 - self.interval_number_packets as f64 / diff as f64;
                ret.fraction_lost = (256.0 * ratio).max(0.0) as u8;
            }
        }

        // Cumulative loss over the session.
        let expected_packets =
            i64::from(self.max_sequence_number) - i64::from(self.min_sequence_number) + 1;
        if self.total_number_packets > 0 {
            let lost = if self.sequence_number_cycles == 0 {
                expected_packets - i64::from(self.total_number_packets)
            } else {
                i64::from(MAX_SEQUENCE_NUMBER) * i64::from(self.sequence_number_cycles - 1)
                    + (expected_packets - i64::from(self.total_number_packets)
                        + i64::from(MAX_SEQUENCE_NUMBER))
            };
            ret.cumulative_lost = lost.max(0) as u32;
        }

        // Highest sequence number received plus the wrap count.
        ret.extended_high_sequence_number =
            (u32::from(self.sequence_number_cycles) << 16) + u32::from(self.max_sequence_number);

        ret.jitter = (self.jitter_seconds * 1000.0).abs() as u32;

        // Reset interval values.
        self.interval_min_sequence_number = 0;
        self.interval_number_packets = 0;
        self.interval_wrap_count = 0;

        ret
    }

    /// Fold one received packet into the statistics
    pub fn update_statistics(&mut self, packet: &RtpPacket, now: TimeTicks) {
        let new_seq_num = packet.sequence_number;

        if self.interval_number_packets == 0 {
            // First packet in the interval.
            self.interval_min_sequence_number = new_seq_num;
        }
        if self.total_number_packets == 0 {
            // First incoming packet.
            self.min_sequence_number = new_seq_num;
            self.max_sequence_number = new_seq_num;
        }

        if is_newer_sequence_number(new_seq_num, self.max_sequence_number) {
            if new_seq_num < self.max_sequence_number {
                self.sequence_number_cycles += 1;
                self.interval_wrap_count += 1;
            }
            self.max_sequence_number = new_seq_num;
        }

        // Interarrival jitter: the difference between the spacing of packet
        // arrivals and the spacing of their media timestamps (90 units/ms).
        let rtp_seconds = f64::from(packet.rtp_timestamp) / 1000.0;
        if self.total_number_packets > 0 {
            let arrival_delta =
                (now - self.last_received_packet_time).as_micros() as f64 / 1_000_000.0;
            let media_delta = (rtp_seconds - self.last_received_rtp_seconds) / 90.0;
            let delta = arrival_delta - media_delta;
            self.jitter_seconds += (delta - self.jitter_seconds) / 16.0;
        }
        self.last_received_rtp_seconds = rtp_seconds;
        self.last_received_packet_time = now;

        self.total_number_packets += 1;
        self.interval_number_packets += 1;
    }
}

impl Default for ReceiverStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receiver::frame_buffer::tests::make_packet;

    fn packet_with_seq(seq: u16, rtp_timestamp: u32) -> RtpPacket {
        let mut packet = make_packet(0, 0, 100, false, b"s");
        packet.sequence_number = seq;
        packet.rtp_timestamp = rtp_timestamp;
        packet
    }

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000 + ms * 1000)
    }

    #[test]
    fn test_no_loss() {
        let mut stats = ReceiverStats::new();
        for seq in 0..10u16 {
            stats.update_statistics(
                &packet_with_seq(seq, u32::from(seq) * 3000),
                ticks(i64::from(seq) * 33),
            );
        }
        let report = stats.get_statistics();
        assert_eq!(report.fraction_lost, 0);
        assert_eq!(report.cumulative_lost, 0);
        assert_eq!(report.extended_high_sequence_number, 9);
    }

    #[test]
    fn test_fraction_and_cumulative_loss() {
        let mut stats = ReceiverStats::new();
        // Sequence numbers 0..16 with every fourth missing: 12 of 16 arrive.
        for seq in 0..16u16 {
            if seq % 4 == 3 {
                continue;
            }
            stats.update_statistics(
                &packet_with_seq(seq, u32::from(seq) * 3000),
                ticks(i64::from(seq) * 33),
            );
        }
        let report = stats.get_statistics();
        // Expected 15 - 0 + 1 = 16, received 12: 4/16 = 64/256 lost.
        assert_eq!(report.fraction_lost, 64);
        assert_eq!(report.cumulative_lost, 4);
    }

    #[test]
    fn test_sequence_wrap_increments_cycles() {
        let mut stats = ReceiverStats::new();
        stats.update_statistics(&packet_with_seq(65534, 0), ticks(0));
        stats.update_statistics(&packet_with_seq(65535, 3000), ticks(33));
        let before = stats.get_statistics().extended_high_sequence_number;
        assert_eq!(before, 65535);

        stats.update_statistics(&packet_with_seq(0, 6000), ticks(66));
        let report = stats.get_statistics();
        assert_eq!(report.extended_high_sequence_number, before + 1);
        assert_eq!(report.extended_high_sequence_number, (1 << 16) | 0);
    }

    #[test]
    fn test_interval_resets_between_reports() {
        let mut stats = ReceiverStats::new();
        stats.update_statistics(&packet_with_seq(0, 0), ticks(0));
        stats.update_statistics(&packet_with_seq(2, 6000), ticks(66));
        let first = stats.get_statistics();
        assert!(first.fraction_lost > 0);

        // A clean interval afterwards reports no interval loss even though
        // cumulative loss persists.
        stats.update_statistics(&packet_with_seq(3, 9000), ticks(99));
        let second = stats.get_statistics();
        assert_eq!(second.fraction_lost, 0);
        assert_eq!(second.cumulative_lost, 1);
    }

    #[test]
    fn test_jitter_zero_for_perfectly_paced_stream() {
        let mut stats = ReceiverStats::new();
        // 3000 RTP units per 33.333ms frame: media delta == arrival delta.
        for i in 0..30u32 {
            stats.update_statistics(
                &packet_with_seq(i as u16, i * 3000),
                ticks(i64::from(i) * 100 / 3),
            );
        }
        let report = stats.get_statistics();
        assert!(report.jitter <= 1);
    }
}
