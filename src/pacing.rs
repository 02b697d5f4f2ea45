//! Paced packet sending
//!
//! All outbound packets pass through the [`PacedSender`], which releases
//! them in bursts every 10 ms. RTCP and registered priority SSRCs drain
//! ahead of media packets. A short send history suppresses retransmissions
//! of packets that were sent again too recently.

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::events::{EventDispatcher, EventKind, MediaType, PacketEvent};
use crate::time::{TimeDelta, TimeTicks};
use crate::{PacketRef, RtpSsrc};

/// Interval between bursts
pub const PACING_INTERVAL: TimeDelta = TimeDelta::from_millis(10);

/// The queue should drain within this many bursts
const PACING_MAX_BURSTS_PER_FRAME: usize = 3;

/// How long the send history is kept for dedup decisions
const MAX_DEDUPE_WINDOW: TimeDelta = TimeDelta::from_millis(500);

/// Preferred burst size
const TARGET_BURST_SIZE: usize = 10;

/// Hard burst-size ceiling
const MAX_BURST_SIZE: usize = 20;

/// Queue length that indicates something has gone badly wrong
const HUGE_QUEUE_LENGTH_SECONDS: usize = 10;
const RIDICULOUS_NUMBER_OF_PACKETS: usize =
    HUGE_QUEUE_LENGTH_SECONDS * (MAX_BURST_SIZE * 1000 / 10);

/// Orders queued packets: enqueue time first, then (ssrc, packet id)
pub type PacketKey = (TimeTicks, (RtpSsrc, u16));

/// A batch of keyed packets
pub type SendPacketVector = Vec<(PacketKey, PacketRef)>;

/// A queued packet addressed to a peer
pub type PacketWithAddr = (String, PacketKey);

/// Logical address of the configured remote peer
pub const MULTICAST_ADDR: &str = "multicast";

/// Controls whether a retransmission is allowed to go out
#[derive(Debug, Clone, Copy)]
pub struct DedupInfo {
    /// Minimum interval between transmissions of the same packet
    pub resend_interval: TimeDelta,

    /// Last audio byte the peer acknowledged (reserved)
    pub last_byte_acked_for_audio: i64,
}

impl Default for DedupInfo {
    fn default() -> Self {
        Self {
            resend_interval: TimeDelta::ZERO,
            last_byte_acked_for_audio: 0,
        }
    }
}

/// Result of handing one packet to the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The packet was written out
    Sent,

    /// The transport took the packet but is now backpressured; wait for the
    /// writable signal before sending more
    Pending,
}

/// Where the pacer accepts transport backpressure
///
/// On [`SendOutcome::Pending`] the sink owns the packet and transmits it
/// once the socket becomes writable again; the caller must re-drive the
/// pacer from that notification.
pub trait PacketSink {
    /// Hand one packet to the transport
    fn send_packet(&mut self, addr: &str, packet: &PacketRef) -> SendOutcome;

    /// Total bytes accepted by the transport so far
    fn bytes_sent(&self) -> i64;
}

/// What the driver should do after a drain pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// Queue is empty (or drained); nothing scheduled
    Drained,

    /// The burst is full; call `send_stored_packets` again at this time
    ResumeAt(TimeTicks),

    /// The transport is backpressured; call `send_stored_packets` again
    /// when it signals writable
    AwaitTransport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketType {
    Rtcp,
    Resend,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unblocked,
    TransportBlocked,
    BurstFull,
}

#[derive(Debug, Clone, Copy, Default)]
struct PacketSendRecord {
    time: TimeTicks,
    last_byte_sent: i64,
    last_byte_sent_for_audio: i64,
}

type PacketList = BTreeMap<PacketWithAddr, (PacketType, PacketRef)>;

/// Burst-scheduled outbound packet queue with priority lanes
pub struct PacedSender {
    events: std::sync::Arc<EventDispatcher>,

    audio_ssrc: RtpSsrc,
    video_ssrc: RtpSsrc,
    priority_ssrcs: Vec<RtpSsrc>,

    packet_list: PacketList,
    priority_packet_list: PacketList,

    send_history: BTreeMap<PacketWithAddr, PacketSendRecord>,
    send_history_buffer: BTreeMap<PacketWithAddr, PacketSendRecord>,

    last_byte_sent: BTreeMap<RtpSsrc, i64>,

    current_max_burst_size: usize,
    next_max_burst_size: usize,
    next_next_max_burst_size: usize,
    current_burst_size: usize,

    burst_end: TimeTicks,
    state: State,

    has_reached_upper_bound_once: bool,
}

impl PacedSender {
    /// Create a pacer reporting packet events to `events`
    pub fn new(events: std::sync::Arc<EventDispatcher>) -> Self {
        Self {
            events,
            audio_ssrc: 0,
            video_ssrc: 0,
            priority_ssrcs: Vec::new(),
            packet_list: BTreeMap::new(),
            priority_packet_list: BTreeMap::new(),
            send_history: BTreeMap::new(),
            send_history_buffer: BTreeMap::new(),
            last_byte_sent: BTreeMap::new(),
            current_max_burst_size: TARGET_BURST_SIZE,
            next_max_burst_size: TARGET_BURST_SIZE,
            next_next_max_burst_size: TARGET_BURST_SIZE,
            current_burst_size: 0,
            burst_end: TimeTicks::default(),
            state: State::Unblocked,
            has_reached_upper_bound_once: false,
        }
    }

    /// Build the ordered key for one packet
    pub fn make_packet_key(ticks: TimeTicks, ssrc: RtpSsrc, packet_id: u16) -> PacketKey {
        (ticks, (ssrc, packet_id))
    }

    /// Tell the pacer which SSRC carries audio
    pub fn register_audio_ssrc(&mut self, audio_ssrc: RtpSsrc) {
        self.audio_ssrc = audio_ssrc;
    }

    /// Tell the pacer which SSRC carries video
    pub fn register_video_ssrc(&mut self, video_ssrc: RtpSsrc) {
        self.video_ssrc = video_ssrc;
    }

    /// Packets of this SSRC drain ahead of the normal lane
    pub fn register_priority_ssrc(&mut self, ssrc: RtpSsrc) {
        self.priority_ssrcs.push(ssrc);
    }

    /// Bytes-sent watermark recorded when `packet_key` was last sent
    pub fn last_byte_sent_for_packet(&self, packet_key: &PacketKey) -> i64 {
        let key = (MULTICAST_ADDR.to_string(), *packet_key);
        self.send_history
            .get(&key)
            .or_else(|| self.send_history_buffer.get(&key))
            .map(|record| record.last_byte_sent)
            .unwrap_or(0)
    }

    /// Bytes-sent watermark of the last packet sent for `ssrc`
    pub fn last_byte_sent_for_ssrc(&self, ssrc: RtpSsrc) -> i64 {
        self.last_byte_sent.get(&ssrc).copied().unwrap_or(0)
    }

    /// Number of queued packets across both lanes
    pub fn size(&self) -> usize {
        self.packet_list.len() + self.priority_packet_list.len()
    }

    fn is_empty(&self) -> bool {
        self.packet_list.is_empty() && self.priority_packet_list.is_empty()
    }

    /// Enqueue freshly packetized frame packets
    pub fn send_packets(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        packets: SendPacketVector,
    ) -> DrainResult {
        if packets.is_empty() {
            return DrainResult::Drained;
        }
        let high_priority = self.is_high_priority(&packets[0].0);
        for (key, packet) in packets {
            debug_assert_eq!(self.is_high_priority(&key), high_priority);
            let entry = (MULTICAST_ADDR.to_string(), key);
            if high_priority {
                self.priority_packet_list
                    .insert(entry, (PacketType::Normal, packet));
            } else {
                self.packet_list.insert(entry, (PacketType::Normal, packet));
            }
        }
        if self.state == State::Unblocked {
            return self.send_stored_packets(now, sink);
        }
        DrainResult::Drained
    }

    fn should_resend(
        &self,
        packet_key: &PacketWithAddr,
        dedup_info: &DedupInfo,
        now: TimeTicks,
    ) -> bool {
        let record = match self.send_history.get(packet_key) {
            // No history of a previous transmission; it might have been sent
            // too long ago.
            None => return true,
            Some(record) => record,
        };

        // The retransmission interval has to exceed the resend interval.
        now - record.time >= dedup_info.resend_interval
    }

    /// Enqueue retransmissions, suppressing packets sent too recently
    pub fn resend_packets(
        &mut self,
        now: TimeTicks,
        sink: &mut dyn PacketSink,
        addr: &str,
        packets: SendPacketVector,
        dedup_info: &DedupInfo,
    ) -> DrainResult {
        if packets.is_empty() {
            return DrainResult::Drained;
        }
        let high_priority = self.is_high_priority(&packets[0].0);
        for (key, packet) in packets {
            let packet_key = (addr.to_string(), key);
            if !self.should_resend(&packet_key, dedup_info, now) {
                self.log_packet_event(&packet, now, EventKind::PacketRtxRejected);
                warn!(
                    "Not resending to {}, [{}:{}]",
                    addr, key.1 .0, key.1 .1
                );
                continue;
            }

            debug_assert_eq!(self.is_high_priority(&key), high_priority);
            if high_priority {
                self.priority_packet_list
                    .insert(packet_key, (PacketType::Resend, packet));
            } else {
                debug!(
                    "Queued resend to {}, [{}:{}], list size: {}",
                    addr,
                    key.1 .0,
                    key.1 .1,
                    self.packet_list.len()
                );
                self.packet_list.insert(packet_key, (PacketType::Resend, packet));
            }
        }
        if self.state == State::Unblocked {
            return self.send_stored_packets(now, sink);
        }
        DrainResult::Drained
    }

    /// Send an RTCP packet, bypassing the queue unless blocked
    pub fn send_rtcp_packet(
        &mut self,
        sink: &mut dyn PacketSink,
        ssrc: RtpSsrc,
        packet: PacketRef,
    ) -> DrainResult {
        if self.state == State::TransportBlocked {
            // A zero-tick key sorts ahead of everything on resume.
            let key = (
                MULTICAST_ADDR.to_string(),
                Self::make_packet_key(TimeTicks::default(), ssrc, 0),
            );
            self.priority_packet_list.insert(key, (PacketType::Rtcp, packet));
            DrainResult::AwaitTransport
        } else {
            // RTCP passes straight through.
            if self.send_to_sink(sink, MULTICAST_ADDR, &packet) == SendOutcome::Pending {
                self.state = State::TransportBlocked;
                return DrainResult::AwaitTransport;
            }
            DrainResult::Drained
        }
    }

    /// Remove a queued packet from both lanes; the send history is kept so
    /// later dedup decisions still work
    pub fn cancel_sending_packet(&mut self, addr: &str, packet_key: &PacketKey) {
        let key = (addr.to_string(), *packet_key);
        self.packet_list.remove(&key);
        self.priority_packet_list.remove(&key);
    }

    fn pop_next_packet(&mut self) -> (PacketType, PacketWithAddr, PacketRef) {
        let list = if !self.priority_packet_list.is_empty() {
            &mut self.priority_packet_list
        } else {
            &mut self.packet_list
        };
        debug_assert!(!list.is_empty());
        let (key, (packet_type, packet)) =
            list.pop_first().expect("pop from empty packet list");
        (packet_type, key, packet)
    }

    fn is_high_priority(&self, packet_key: &PacketKey) -> bool {
        self.priority_ssrcs.contains(&packet_key.1 .0)
    }

    /// Drain queued packets in bursts
    ///
    /// Called from three places: a `send_*` call while unblocked, the
    /// transport's writable notification, and the timer scheduled when a
    /// burst filled up.
    pub fn send_stored_packets(&mut self, now: TimeTicks, sink: &mut dyn PacketSink) -> DrainResult {
        let previous_state = self.state;
        self.state = State::Unblocked;
        if self.is_empty() {
            return DrainResult::Drained;
        }

        // If the queue ever becomes impossibly long, diagnose loudly once
        // and keep going.
        if self.size() > RIDICULOUS_NUMBER_OF_PACKETS && !self.has_reached_upper_bound_once {
            error!("Pacer queue has grown to {} packets", self.size());
            debug_assert!(false, "pacer queue overflow");
            self.has_reached_upper_bound_once = true;
        }

        // The delayed task may fire marginally early, so trust the recorded
        // state as well as the clock.
        if now >= self.burst_end || previous_state == State::BurstFull {
            // Start a new burst.
            self.current_burst_size = 0;
            self.burst_end = now + PACING_INTERVAL;

            // Aim to drain the queue over the next three bursts while
            // keeping each burst near the target size; deep queues may grow
            // a burst up to the ceiling. The pipeline below makes the
            // effective maximum grow monotonically across consecutive
            // bursts as the queue deepens.
            let max_burst_size = (self.size() / PACING_MAX_BURSTS_PER_FRAME)
                .clamp(TARGET_BURST_SIZE, MAX_BURST_SIZE);
            self.current_max_burst_size = self.next_max_burst_size.max(max_burst_size);
            self.next_max_burst_size = self.next_next_max_burst_size.max(max_burst_size);
            self.next_next_max_burst_size = max_burst_size;
        }

        while !self.is_empty() {
            if self.current_burst_size >= self.current_max_burst_size {
                self.state = State::BurstFull;
                return DrainResult::ResumeAt(self.burst_end);
            }
            let (packet_type, packet_key, packet) = self.pop_next_packet();
            match packet_type {
                PacketType::Resend => {
                    self.log_packet_event(&packet, now, EventKind::PacketRetransmitted)
                }
                PacketType::Normal => {
                    self.log_packet_event(&packet, now, EventKind::PacketSentToNetwork)
                }
                PacketType::Rtcp => {}
            }

            let outcome = self.send_to_sink(sink, &packet_key.0, &packet);

            let record = PacketSendRecord {
                time: now,
                last_byte_sent: sink.bytes_sent(),
                last_byte_sent_for_audio: self.last_byte_sent_for_ssrc(self.audio_ssrc),
            };
            self.send_history.insert(packet_key.clone(), record);
            self.send_history_buffer.insert(packet_key.clone(), record);
            self.last_byte_sent
                .insert(packet_key.1 .1 .0, record.last_byte_sent);

            if outcome == SendOutcome::Pending {
                self.state = State::TransportBlocked;
                return DrainResult::AwaitTransport;
            }
            self.current_burst_size += 1;
        }

        // Keep roughly half a second of history (about 1000 packets).
        if self.send_history_buffer.len()
            >= MAX_BURST_SIZE * (MAX_DEDUPE_WINDOW.as_millis() as usize)
                / (PACING_INTERVAL.as_millis() as usize)
        {
            std::mem::swap(&mut self.send_history, &mut self.send_history_buffer);
            self.send_history_buffer.clear();
        }
        self.state = State::Unblocked;
        DrainResult::Drained
    }

    fn send_to_sink(
        &self,
        sink: &mut dyn PacketSink,
        addr: &str,
        packet: &PacketRef,
    ) -> SendOutcome {
        sink.send_packet(addr, packet)
    }

    fn log_packet_event(&self, packet: &PacketRef, now: TimeTicks, kind: EventKind) {
        // Offsets into the serialized packet: timestamp at 4, ssrc at 8,
        // sharer packet ids at 17 (after byte0 and the 32-bit frame id).
        if packet.len() < 21 {
            return;
        }
        let rtp_timestamp = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
        let ssrc = u32::from_be_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let media_type = if ssrc == self.audio_ssrc {
            MediaType::Audio
        } else if ssrc == self.video_ssrc {
            MediaType::Video
        } else {
            warn!("Got unknown ssrc {} when logging packet event", ssrc);
            return;
        };
        let packet_id = u16::from_be_bytes([packet[17], packet[18]]);
        let max_packet_id = u16::from_be_bytes([packet[19], packet[20]]);

        self.events.dispatch_packet_event(PacketEvent {
            timestamp: now,
            kind,
            media_type,
            rtp_timestamp,
            packet_id,
            max_packet_id,
            size: packet.len(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Sink that records sends and can simulate backpressure
    struct MockSink {
        sent: Vec<(String, PacketRef)>,
        bytes: i64,
        block_after: Option<usize>,
    }

    impl MockSink {
        fn new() -> Self {
            Self { sent: Vec::new(), bytes: 0, block_after: None }
        }
    }

    impl PacketSink for MockSink {
        fn send_packet(&mut self, addr: &str, packet: &PacketRef) -> SendOutcome {
            self.bytes += packet.len() as i64;
            self.sent.push((addr.to_string(), packet.clone()));
            match self.block_after {
                Some(limit) if self.sent.len() >= limit => SendOutcome::Pending,
                _ => SendOutcome::Sent,
            }
        }

        fn bytes_sent(&self) -> i64 {
            self.bytes
        }
    }

    fn media_packet(ssrc: u32, packet_id: u16) -> PacketRef {
        // 12-byte RTP header + 9-byte sharer header, enough for event
        // logging offsets.
        let mut data = vec![0u8; 21];
        data[0] = 0x80;
        data[1] = 96;
        data[8..12].copy_from_slice(&ssrc.to_be_bytes());
        data[17..19].copy_from_slice(&packet_id.to_be_bytes());
        Arc::new(data)
    }

    fn keyed(now: TimeTicks, ssrc: u32, ids: std::ops::Range<u16>) -> SendPacketVector {
        ids.map(|id| {
            (
                PacedSender::make_packet_key(now, ssrc, id),
                media_packet(ssrc, id),
            )
        })
        .collect()
    }

    fn ticks(ms: i64) -> TimeTicks {
        TimeTicks::from_micros(1_000_000 + ms * 1000)
    }

    fn make_pacer() -> PacedSender {
        let mut pacer = PacedSender::new(Arc::new(EventDispatcher::new()));
        pacer.register_video_ssrc(11);
        pacer
    }

    #[test]
    fn test_small_queue_sends_immediately() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        let result = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..5));
        assert_eq!(result, DrainResult::Drained);
        assert_eq!(sink.sent.len(), 5);
        assert_eq!(pacer.size(), 0);
    }

    #[test]
    fn test_burst_limit_and_resume() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        // 25 packets: burst sizes clamp to 10, so three bursts are needed.
        let result = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..25));
        let resume_at = match result {
            DrainResult::ResumeAt(at) => at,
            other => panic!("expected ResumeAt, got {:?}", other),
        };
        assert_eq!(sink.sent.len(), 10);
        assert_eq!(resume_at, ticks(0) + PACING_INTERVAL);

        let result = pacer.send_stored_packets(resume_at, &mut sink);
        let resume_at = match result {
            DrainResult::ResumeAt(at) => at,
            other => panic!("expected ResumeAt, got {:?}", other),
        };
        assert_eq!(sink.sent.len(), 20);

        assert_eq!(pacer.send_stored_packets(resume_at, &mut sink), DrainResult::Drained);
        assert_eq!(sink.sent.len(), 25);
    }

    #[test]
    fn test_queue_drains_within_expected_bursts() {
        // Invariant: a queue of N drains within ceil(N / max_burst) bursts
        // when the transport never blocks.
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        let total = 60usize;
        let mut result =
            pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..total as u16));
        let mut bursts = 1;
        while let DrainResult::ResumeAt(at) = result {
            result = pacer.send_stored_packets(at, &mut sink);
            bursts += 1;
        }
        assert_eq!(sink.sent.len(), total);
        // 60 packets at up to 20 per burst.
        assert!(bursts <= 60_usize.div_ceil(10), "took {} bursts", bursts);
    }

    #[test]
    fn test_transport_blocked_pauses_drain() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        sink.block_after = Some(3);

        let result = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..8));
        assert_eq!(result, DrainResult::AwaitTransport);
        assert_eq!(sink.sent.len(), 3);

        // Transport recovered.
        sink.block_after = None;
        let result = pacer.send_stored_packets(ticks(1), &mut sink);
        assert_eq!(result, DrainResult::Drained);
        assert_eq!(sink.sent.len(), 8);
    }

    #[test]
    fn test_rtcp_bypasses_queue() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        // Fill the queue well beyond one burst.
        let _ = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..30));
        let before = sink.sent.len();

        let rtcp = Arc::new(vec![0x80u8, 200, 0, 6]);
        let result = pacer.send_rtcp_packet(&mut sink, 11, rtcp.clone());
        assert_eq!(result, DrainResult::Drained);
        assert_eq!(sink.sent.len(), before + 1);
        assert_eq!(sink.sent.last().unwrap().1, rtcp);
    }

    #[test]
    fn test_rtcp_queued_with_priority_while_blocked() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        sink.block_after = Some(1);
        let _ = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..5));

        let rtcp = Arc::new(vec![0x80u8, 200, 0, 6]);
        let result = pacer.send_rtcp_packet(&mut sink, 11, rtcp.clone());
        assert_eq!(result, DrainResult::AwaitTransport);

        sink.block_after = None;
        let _ = pacer.send_stored_packets(ticks(2), &mut sink);
        // The RTCP packet preempted the remaining media packets.
        assert_eq!(sink.sent[1].1, rtcp);
    }

    #[test]
    fn test_dedup_window() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        let packets = keyed(ticks(0), 11, 0..1);
        let _ = pacer.send_packets(ticks(0), &mut sink, packets.clone());
        assert_eq!(sink.sent.len(), 1);

        let dedup = DedupInfo {
            resend_interval: TimeDelta::from_millis(40),
            last_byte_acked_for_audio: 0,
        };

        // Within the window: rejected.
        let _ = pacer.resend_packets(ticks(20), &mut sink, MULTICAST_ADDR, packets.clone(), &dedup);
        assert_eq!(sink.sent.len(), 1);

        // After the window: allowed.
        let _ = pacer.resend_packets(ticks(41), &mut sink, MULTICAST_ADDR, packets, &dedup);
        assert_eq!(sink.sent.len(), 2);
    }

    #[test]
    fn test_cancel_sending_packet() {
        let mut pacer = make_pacer();
        let mut sink = MockSink::new();
        sink.block_after = Some(1);
        let packets = keyed(ticks(0), 11, 0..3);
        let keys: Vec<PacketKey> = packets.iter().map(|(k, _)| *k).collect();
        let _ = pacer.send_packets(ticks(0), &mut sink, packets);
        assert_eq!(sink.sent.len(), 1);

        pacer.cancel_sending_packet(MULTICAST_ADDR, &keys[1]);

        sink.block_after = None;
        let _ = pacer.send_stored_packets(ticks(1), &mut sink);
        assert_eq!(sink.sent.len(), 2);
    }

    #[test]
    fn test_priority_ssrc_drains_first() {
        let mut pacer = make_pacer();
        pacer.register_audio_ssrc(1);
        pacer.register_priority_ssrc(1);
        let mut sink = MockSink::new();
        sink.block_after = Some(1);

        // One video packet goes out, the rest queue up.
        let _ = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 11, 0..4));
        let _ = pacer.send_packets(ticks(0), &mut sink, keyed(ticks(0), 1, 0..2));

        sink.block_after = None;
        let _ = pacer.send_stored_packets(ticks(1), &mut sink);
        // Priority (audio) packets drained before the remaining video ones.
        let order: Vec<u32> = sink.sent[1..]
            .iter()
            .map(|(_, p)| u32::from_be_bytes([p[8], p[9], p[10], p[11]]))
            .collect();
        assert_eq!(order, vec![1, 1, 11, 11, 11]);
    }
}
