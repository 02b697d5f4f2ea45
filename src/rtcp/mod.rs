//! RTCP session state machine
//!
//! One session instance exists per media stream and direction pair. It
//! consumes compound RTCP packets from the peer and produces the periodic
//! reports going the other way. The session also owns the lip-sync state
//! recovered from sender reports and the LSR/DLSR round-trip-time
//! bookkeeping.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};

use crate::packet::rtcp::{
    from_ntp_diff, to_ntp_diff, NtpTimestamp, RtcpBuilder, RtcpParser, RtcpPauseResumeMessage,
    RtcpReportBlock, RtcpSenderInfo, RtcpTimeData, RtpReceiverStatistics, SharerFeedback,
    MIN_RTCP_LENGTH,
};
use crate::time::{ClockDriftSmoother, TimeDelta, TimeTicks};
use crate::{FrameId, PacketRef, Result, RtpSsrc, RtpTimestamp};

/// How long sent-report NTP stamps are remembered for RTT matching
const STATS_HISTORY_WINDOW: TimeDelta = TimeDelta::from_millis(10_000);

/// Everything extracted from one incoming RTCP compound packet
#[derive(Debug, Default)]
pub struct RtcpIncoming {
    /// ACK/NACK feedback addressed to us
    pub sharer_message: Option<SharerFeedback>,

    /// A fresh round-trip-time measurement
    pub round_trip_time: Option<TimeDelta>,

    /// A pause/resume hint from the sender (best effort only)
    pub pause_hint: Option<RtcpPauseResumeMessage>,

    /// Whether a sender report updated the lip-sync reference
    pub received_sender_report: bool,
}

/// RTCP exchange for one stream
pub struct RtcpSession {
    local_ssrc: RtpSsrc,
    remote_ssrc: RtpSsrc,

    local_clock_ahead_by: ClockDriftSmoother,

    last_reports_sent_map: BTreeMap<u32, TimeTicks>,
    last_reports_sent_queue: VecDeque<(u32, TimeTicks)>,

    /// Middle 32 bits of the NTP stamp in the last sender report we received
    last_report_truncated_ntp: u32,
    time_last_report_received: TimeTicks,

    lip_sync_rtp_timestamp: RtpTimestamp,
    lip_sync_ntp_timestamp: u64,

    current_round_trip_time: TimeDelta,
}

impl RtcpSession {
    /// Create a session between our `local_ssrc` and the peer `remote_ssrc`
    pub fn new(local_ssrc: RtpSsrc, remote_ssrc: RtpSsrc) -> Self {
        Self {
            local_ssrc,
            remote_ssrc,
            local_clock_ahead_by: ClockDriftSmoother::new(
                ClockDriftSmoother::default_time_constant(),
            ),
            last_reports_sent_map: BTreeMap::new(),
            last_reports_sent_queue: VecDeque::new(),
            last_report_truncated_ntp: 0,
            time_last_report_received: TimeTicks::default(),
            lip_sync_rtp_timestamp: 0,
            lip_sync_ntp_timestamp: 0,
            current_round_trip_time: TimeDelta::ZERO,
        }
    }

    /// Whether a datagram looks like RTCP
    pub fn is_rtcp_packet(packet: &[u8]) -> bool {
        if packet.len() < MIN_RTCP_LENGTH {
            return false;
        }
        let packet_type = packet[1];
        (crate::packet::RTCP_PACKET_TYPE_LOW..=crate::packet::RTCP_PACKET_TYPE_HIGH)
            .contains(&packet_type)
    }

    /// The sender SSRC of an RTCP compound packet
    pub fn ssrc_of_sender(rtcp_buffer: &[u8]) -> RtpSsrc {
        if rtcp_buffer.len() < MIN_RTCP_LENGTH {
            return 0;
        }
        u32::from_be_bytes([rtcp_buffer[4], rtcp_buffer[5], rtcp_buffer[6], rtcp_buffer[7]])
    }

    /// The most recent round-trip-time measurement
    pub fn current_round_trip_time(&self) -> TimeDelta {
        self.current_round_trip_time
    }

    /// Process one compound packet from the peer
    pub fn incoming_rtcp_packet(&mut self, now: TimeTicks, data: &[u8]) -> Result<RtcpIncoming> {
        let mut incoming = RtcpIncoming::default();

        if !Self::is_rtcp_packet(data) {
            warn!("Received an invalid (non-RTCP?) packet");
            return Ok(incoming);
        }

        if Self::ssrc_of_sender(data) != self.remote_ssrc {
            return Ok(incoming);
        }

        let mut parser = RtcpParser::new(self.local_ssrc, self.remote_ssrc);
        parser.parse(data)?;

        if let Some(report) = parser.sender_report() {
            self.on_received_ntp(now, report.ntp_seconds, report.ntp_fraction);
            self.on_received_lip_sync_info(
                report.rtp_timestamp,
                report.ntp_seconds,
                report.ntp_fraction,
            );
            incoming.received_sender_report = true;
        }
        if let Some((last_report, delay)) = parser.last_report() {
            incoming.round_trip_time =
                self.on_received_delay_since_last_report(now, last_report, delay);
        }
        if let Some(message) = parser.sharer_message() {
            debug!(
                "Received sharer feedback, missing frames: {}",
                message.missing_frames_and_packets.len()
            );
            incoming.sharer_message = Some(message.clone());
        }
        if let Some(hint) = parser.pause_hint() {
            incoming.pause_hint = Some(*hint);
        }
        Ok(incoming)
    }

    fn on_received_ntp(&mut self, now: TimeTicks, ntp_seconds: u32, ntp_fraction: u32) {
        self.last_report_truncated_ntp = to_ntp_diff(ntp_seconds, ntp_fraction);
        self.time_last_report_received = now;

        let remote = NtpTimestamp { seconds: ntp_seconds, fraction: ntp_fraction };
        let measured_offset = now - remote.to_ticks();
        self.local_clock_ahead_by.update(now, measured_offset);
        if measured_offset < self.local_clock_ahead_by.current() {
            // Follow the floor: the smallest offset is the most accurate.
            self.local_clock_ahead_by.reset(now, measured_offset);
        }
    }

    fn on_received_lip_sync_info(
        &mut self,
        rtp_timestamp: RtpTimestamp,
        ntp_seconds: u32,
        ntp_fraction: u32,
    ) {
        if ntp_seconds == 0 {
            debug_assert!(false, "sender report without an NTP stamp");
            return;
        }
        self.lip_sync_rtp_timestamp = rtp_timestamp;
        self.lip_sync_ntp_timestamp = (u64::from(ntp_seconds) << 32) | u64::from(ntp_fraction);
    }

    fn on_received_delay_since_last_report(
        &mut self,
        now: TimeTicks,
        last_report: u32,
        delay_since_last_report: u32,
    ) -> Option<TimeDelta> {
        let sent_time = *self.last_reports_sent_map.get(&last_report)?;

        let sender_delay = now - sent_time;
        let receiver_delay = from_ntp_diff(delay_since_last_report);
        let rtt = (sender_delay - receiver_delay).max(TimeDelta::from_millis(1));
        self.current_round_trip_time = rtt;
        Some(rtt)
    }

    /// The latest lip-sync pair mapped onto the local clock, if any sender
    /// report has arrived yet
    pub fn latest_lip_sync_times(&self, now: TimeTicks) -> Option<(RtpTimestamp, TimeTicks)> {
        if self.lip_sync_ntp_timestamp == 0 {
            return None;
        }

        let ntp = NtpTimestamp::from_u64(self.lip_sync_ntp_timestamp);
        let local_reference_time = ntp.to_ticks() + self.local_clock_ahead_by.current();

        // Sanity-check: lip sync updates should be recent.
        debug_assert!(now - local_reference_time < TimeDelta::from_secs(60));

        Some((self.lip_sync_rtp_timestamp, local_reference_time))
    }

    /// Stamp `now` as NTP and remember it for later RTT matching
    pub fn convert_to_ntp_and_save(&mut self, now: TimeTicks) -> RtcpTimeData {
        let ntp = NtpTimestamp::from_ticks(now);
        self.save_last_sent_ntp_time(now, ntp.seconds, ntp.fraction);
        RtcpTimeData {
            ntp_seconds: ntp.seconds,
            ntp_fraction: ntp.fraction,
            timestamp: now,
        }
    }

    fn save_last_sent_ntp_time(&mut self, now: TimeTicks, ntp_seconds: u32, ntp_fraction: u32) {
        if let Some(back) = self.last_reports_sent_queue.back() {
            debug_assert!(now >= back.1);
        }

        let last_report = to_ntp_diff(ntp_seconds, ntp_fraction);
        self.last_reports_sent_map.insert(last_report, now);
        self.last_reports_sent_queue.push_back((last_report, now));

        let timeout = now - STATS_HISTORY_WINDOW;
        while let Some(&(oldest_report, sent)) = self.last_reports_sent_queue.front() {
            if sent < timeout {
                self.last_reports_sent_map.remove(&oldest_report);
                self.last_reports_sent_queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Build the receiver-side compound report: RR (when statistics are
    /// available), RRTR, and sharer feedback (when present)
    pub fn build_rtcp_from_receiver(
        &self,
        time_data: RtcpTimeData,
        sharer_message: Option<&SharerFeedback>,
        target_delay: TimeDelta,
        statistics: Option<&RtpReceiverStatistics>,
    ) -> PacketRef {
        let rrtr = crate::packet::rtcp::RtcpReceiverReferenceTimeReport {
            remote_ssrc: self.local_ssrc,
            ntp_seconds: time_data.ntp_seconds,
            ntp_fraction: time_data.ntp_fraction,
        };

        let report_block = statistics.map(|stats| {
            let delay_since_last_sr = if !self.time_last_report_received.is_null() {
                let delta_us = (time_data.timestamp - self.time_last_report_received)
                    .as_micros()
                    .max(0);
                let delay_seconds = (delta_us / 1_000_000) as u32;
                let delay_fraction = ((delta_us % 1_000_000) as f64 * 4294.967296) as u32;
                to_ntp_diff(delay_seconds, delay_fraction)
            } else {
                0
            };
            RtcpReportBlock {
                remote_ssrc: 0,
                media_ssrc: self.remote_ssrc,
                fraction_lost: stats.fraction_lost,
                cumulative_lost: stats.cumulative_lost,
                extended_high_sequence_number: stats.extended_high_sequence_number,
                jitter: stats.jitter,
                last_sr: self.last_report_truncated_ntp,
                delay_since_last_sr,
            }
        });

        RtcpBuilder::new(self.local_ssrc).build_from_receiver(
            report_block.as_ref(),
            Some(&rrtr),
            sharer_message,
            target_delay,
        )
    }

    /// Build the sender report and remember its NTP stamp for RTT matching
    pub fn build_rtcp_from_sender(
        &mut self,
        now: TimeTicks,
        current_time_as_rtp_timestamp: RtpTimestamp,
        send_packet_count: u32,
        send_octet_count: u32,
    ) -> PacketRef {
        let ntp = NtpTimestamp::from_ticks(now);
        self.save_last_sent_ntp_time(now, ntp.seconds, ntp.fraction);

        let sender_info = RtcpSenderInfo {
            ntp_seconds: ntp.seconds,
            ntp_fraction: ntp.fraction,
            rtp_timestamp: current_time_as_rtp_timestamp,
            send_packet_count,
            send_octet_count,
        };
        RtcpBuilder::new(self.local_ssrc).build_from_sender(&sender_info)
    }

    /// Build a pause/resume indication
    pub fn build_pause_resume(&self, last_sent_frame_id: FrameId, pause_id: u32) -> PacketRef {
        debug!("Building RTCP pause/resume, last sent frame {}", last_sent_frame_id);
        let message = RtcpPauseResumeMessage {
            last_sent: last_sent_frame_id,
            pause_id,
        };
        RtcpBuilder::new(self.local_ssrc).build_pause_resume(&message)
    }
}
