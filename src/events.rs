//! Frame and packet event dispatch
//!
//! Components report what happened to frames and packets (sent,
//! retransmitted, rejected, received) as events. Subscribers such as the
//! stats counter register with the dispatcher; dispatch happens inline on
//! the session task, never concurrently.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::time::TimeTicks;
use crate::{FrameId, RtpTimestamp};

/// What happened to a frame or packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// A packet left for the network for the first time
    PacketSentToNetwork,

    /// A packet was sent again after a NACK
    PacketRetransmitted,

    /// A retransmission was suppressed by the dedup window
    PacketRtxRejected,

    /// A packet arrived from the network
    PacketReceived,

    /// An encoded frame was accepted for sending
    FrameEnqueued,

    /// An encoded frame was handed to the decoder
    FrameDecoded,

    /// An encoded frame was played out
    FramePlayout,
}

/// Whether an event belongs to the audio or video stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
}

/// An event about one frame
#[derive(Debug, Clone)]
pub struct FrameEvent {
    pub timestamp: TimeTicks,
    pub kind: EventKind,
    pub media_type: MediaType,
    pub rtp_timestamp: RtpTimestamp,
    pub frame_id: FrameId,
    pub size: usize,
}

/// An event about one packet
#[derive(Debug, Clone)]
pub struct PacketEvent {
    pub timestamp: TimeTicks,
    pub kind: EventKind,
    pub media_type: MediaType,
    pub rtp_timestamp: RtpTimestamp,
    pub packet_id: u16,
    pub max_packet_id: u16,
    pub size: usize,
}

/// Receives dispatched events
pub trait EventSubscriber: Send + Sync {
    fn on_frame_event(&self, event: &FrameEvent);
    fn on_packet_event(&self, event: &PacketEvent);
}

/// Fans events out to the registered subscribers
///
/// Subscribe and unsubscribe only from the session task that also
/// dispatches; the lock is for object safety, not for concurrent dispatch.
pub struct EventDispatcher {
    subscribers: Mutex<Vec<Arc<dyn EventSubscriber>>>,
}

impl EventDispatcher {
    /// Create a dispatcher with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Add a subscriber; it starts receiving events immediately
    pub fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.lock().unwrap().push(subscriber);
    }

    /// Remove a subscriber; it receives no events once this returns
    pub fn unsubscribe(&self, subscriber: &Arc<dyn EventSubscriber>) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|existing| !Arc::ptr_eq(existing, subscriber));
    }

    /// Dispatch one frame event
    pub fn dispatch_frame_event(&self, event: FrameEvent) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber.on_frame_event(&event);
        }
    }

    /// Dispatch one packet event
    pub fn dispatch_packet_event(&self, event: PacketEvent) {
        for subscriber in self.subscribers.lock().unwrap().iter() {
            subscriber.on_packet_event(&event);
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts packet events for session reporting
#[derive(Default)]
pub struct StatsSubscriber {
    packets_total: AtomicUsize,
    packets_sent: AtomicUsize,
    packets_retransmitted: AtomicUsize,
    packets_rejected: AtomicUsize,
}

impl StatsSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets sent for the first time
    pub fn packets_sent(&self) -> usize {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Packets sent again after a NACK
    pub fn packets_retransmitted(&self) -> usize {
        self.packets_retransmitted.load(Ordering::Relaxed)
    }

    /// Retransmissions suppressed by the dedup window
    pub fn packets_rejected(&self) -> usize {
        self.packets_rejected.load(Ordering::Relaxed)
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.packets_total.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_retransmitted.store(0, Ordering::Relaxed);
        self.packets_rejected.store(0, Ordering::Relaxed);
    }
}

impl EventSubscriber for StatsSubscriber {
    fn on_frame_event(&self, _event: &FrameEvent) {}

    fn on_packet_event(&self, event: &PacketEvent) {
        self.packets_total.fetch_add(1, Ordering::Relaxed);
        match event.kind {
            EventKind::PacketSentToNetwork => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::PacketRetransmitted => {
                self.packets_retransmitted.fetch_add(1, Ordering::Relaxed);
            }
            EventKind::PacketRtxRejected => {
                self.packets_rejected.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_event(kind: EventKind) -> PacketEvent {
        PacketEvent {
            timestamp: TimeTicks::from_micros(1),
            kind,
            media_type: MediaType::Video,
            rtp_timestamp: 0,
            packet_id: 0,
            max_packet_id: 0,
            size: 100,
        }
    }

    #[test]
    fn test_stats_subscriber_counts() {
        let dispatcher = EventDispatcher::new();
        let stats = Arc::new(StatsSubscriber::new());
        dispatcher.subscribe(stats.clone());

        dispatcher.dispatch_packet_event(packet_event(EventKind::PacketSentToNetwork));
        dispatcher.dispatch_packet_event(packet_event(EventKind::PacketSentToNetwork));
        dispatcher.dispatch_packet_event(packet_event(EventKind::PacketRetransmitted));
        dispatcher.dispatch_packet_event(packet_event(EventKind::PacketRtxRejected));

        assert_eq!(stats.packets_sent(), 2);
        assert_eq!(stats.packets_retransmitted(), 1);
        assert_eq!(stats.packets_rejected(), 1);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let dispatcher = EventDispatcher::new();
        let stats = Arc::new(StatsSubscriber::new());
        let subscriber: Arc<dyn EventSubscriber> = stats.clone();
        dispatcher.subscribe(subscriber.clone());
        dispatcher.unsubscribe(&subscriber);

        dispatcher.dispatch_packet_event(packet_event(EventKind::PacketSentToNetwork));
        assert_eq!(stats.packets_sent(), 0);
    }
}
