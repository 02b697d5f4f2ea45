//! Session facades and control-plane dispatch
//!
//! Each session (a sending "sharer" or the receiver) runs as one task that
//! owns its components and is driven by channels and timers; nothing inside
//! a session is shared between threads. The encoder worker is the only
//! outside producer: it hands finished [`EncodedFrame`]s over a channel.
//!
//! The [`SharerService`] at the bottom maps JSON control commands
//! (`cmd`/`cmd_id`) onto session lifecycles and echoes
//! `{cmd_id, success, payload}` for every command.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{
    ReceiverConfig, ReceiverNetConfig, SenderConfig, DEFAULT_RTCP_INTERVAL_MS,
    DEFAULT_VIDEO_FEEDBACK_SSRC, DEFAULT_VIDEO_SSRC,
};
use crate::events::{EventDispatcher, EventKind, FrameEvent, MediaType, StatsSubscriber};
use crate::frame::EncodedFrame;
use crate::pacing::{DrainResult, PacketSink};
use crate::packet::SharerPacket;
use crate::receiver::{EmitOutcome, FrameReceiver};
use crate::sender::{
    FrameAdmission, RtcpDecision, RtpSenderConfig, TransportSender, VideoSender,
};
use crate::time::{Clock, MonotonicClock, TimeDelta, TimeTicks};
use crate::transport::{PacketTransport, UdpTransport, UdpTransportConfig};
use crate::{Error, Result, RtpTimestamp};

/// Shared per-process context: the clock and the event dispatcher
#[derive(Clone)]
pub struct Environment {
    /// Monotonic tick source
    pub clock: Arc<dyn Clock>,

    /// Event fan-out for stats subscribers
    pub events: Arc<EventDispatcher>,
}

impl Environment {
    /// Environment with the real clock and a fresh dispatcher
    pub fn new() -> Self {
        Self {
            clock: Arc::new(MonotonicClock::new()),
            events: Arc::new(EventDispatcher::new()),
        }
    }
}

impl Default for Environment {
    fn default() -> Self {
        Self::new()
    }
}

fn delay_until(now: TimeTicks, at: TimeTicks) -> Duration {
    Duration::from_micros((at - now).as_micros().max(0) as u64)
}

// ---------------------------------------------------------------------------
// Sending session
// ---------------------------------------------------------------------------

enum SenderCommand {
    InsertRawFrame {
        rtp_timestamp: RtpTimestamp,
        reply: oneshot::Sender<FrameAdmission>,
    },
    ChangeEncoding {
        bitrate: u32,
        frame_rate: f64,
        reply: oneshot::Sender<bool>,
    },
    Pause,
    Stop {
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to a running sending session
pub struct SharerSender {
    id: i64,
    command_tx: mpsc::Sender<SenderCommand>,
    frame_tx: mpsc::Sender<EncodedFrame>,
    task: JoinHandle<()>,
}

impl SharerSender {
    /// Resolve the remote peer and start the sending session
    pub async fn start(env: &Environment, id: i64, config: SenderConfig) -> Result<Self> {
        if config.remote_address.is_empty() {
            return Err(Error::ConfigError("missing remote address".to_string()));
        }

        let mut transport = UdpTransport::new(UdpTransportConfig {
            remote_host: config.remote_address.clone(),
            remote_port: config.remote_port,
            ..Default::default()
        })
        .await?;
        let packet_rx = transport.start_receiving();

        let mut transport_sender = TransportSender::new(env.events.clone());
        transport_sender.initialize_video(&RtpSenderConfig {
            ssrc: DEFAULT_VIDEO_SSRC,
            feedback_ssrc: DEFAULT_VIDEO_FEEDBACK_SSRC,
            rtp_payload_type: crate::packet::RTP_PAYLOAD_TYPE_VIDEO,
        });
        // Audio is declared but not yet sent; register its SSRC so its
        // packets would drain ahead of video.
        transport_sender.pacer_mut().register_audio_ssrc(crate::config::DEFAULT_AUDIO_SSRC);
        transport_sender.pacer_mut().register_priority_ssrc(crate::config::DEFAULT_AUDIO_SSRC);

        let video_sender = VideoSender::new(
            DEFAULT_VIDEO_SSRC,
            config.frame_rate,
            TimeDelta::from_millis(i64::from(config.min_playout_delay_ms)),
            TimeDelta::from_millis(i64::from(config.max_playout_delay_ms)),
            config.initial_bitrate,
        );

        let (command_tx, command_rx) = mpsc::channel(16);
        let (frame_tx, frame_rx) = mpsc::channel(32);

        let session = SenderSession {
            clock: env.clock.clone(),
            events: env.events.clone(),
            transport,
            transport_sender,
            video_sender,
            command_rx,
            frame_rx,
            packet_rx,
            pacer_resume: None,
            await_writable: false,
        };
        let task = tokio::spawn(session.run());

        info!("Started sharer sender {}", id);
        Ok(Self {
            id,
            command_tx,
            frame_tx,
            task,
        })
    }

    /// Id of this sharer
    pub fn id(&self) -> i64 {
        self.id
    }

    /// The channel the encoder worker posts finished frames into
    pub fn encoded_frame_sender(&self) -> mpsc::Sender<EncodedFrame> {
        self.frame_tx.clone()
    }

    /// Offer a captured frame for encoding; the admission verdict tells the
    /// caller whether to encode or drop it
    pub async fn insert_raw_frame(&self, rtp_timestamp: RtpTimestamp) -> Result<FrameAdmission> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(SenderCommand::InsertRawFrame { rtp_timestamp, reply })
            .await
            .map_err(|_| Error::SessionError("sender session is gone".to_string()))?;
        response
            .await
            .map_err(|_| Error::SessionError("sender session is gone".to_string()))
    }

    /// Announce a transmission pause to the receiver (best effort)
    pub async fn pause(&self) {
        let _ = self.command_tx.send(SenderCommand::Pause).await;
    }

    /// Update encoder parameters
    pub async fn change_encoding(&self, bitrate: u32, frame_rate: f64) -> bool {
        let (reply, response) = oneshot::channel();
        if self
            .command_tx
            .send(SenderCommand::ChangeEncoding { bitrate, frame_rate, reply })
            .await
            .is_err()
        {
            return false;
        }
        response.await.unwrap_or(false)
    }

    /// Stop the session and release its socket and timers
    pub async fn stop(self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.command_tx.send(SenderCommand::Stop { reply }).await.is_err() {
            self.task.abort();
            return false;
        }
        let stopped = response.await.unwrap_or(false);
        self.task.abort();
        stopped
    }
}

struct SenderSession {
    clock: Arc<dyn Clock>,
    events: Arc<EventDispatcher>,
    transport: UdpTransport,
    transport_sender: TransportSender,
    video_sender: VideoSender,

    command_rx: mpsc::Receiver<SenderCommand>,
    frame_rx: mpsc::Receiver<EncodedFrame>,
    packet_rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,

    pacer_resume: Option<TimeTicks>,
    await_writable: bool,
}

impl SenderSession {
    async fn run(mut self) {
        let mut rtcp_interval =
            tokio::time::interval(Duration::from_millis(DEFAULT_RTCP_INTERVAL_MS as u64));
        rtcp_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let now = self.clock.now();
            let pacer_delay = self.pacer_resume.map(|at| delay_until(now, at));

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(SenderCommand::InsertRawFrame { rtp_timestamp, reply }) => {
                            let admission = self.on_insert_raw_frame(rtp_timestamp);
                            let _ = reply.send(admission);
                        }
                        Some(SenderCommand::ChangeEncoding { bitrate, frame_rate, reply }) => {
                            debug!("Changing encoding to {}bps @ {}fps", bitrate, frame_rate);
                            self.video_sender.set_frame_rate(frame_rate);
                            let _ = reply.send(true);
                        }
                        Some(SenderCommand::Pause) => {
                            self.send_pause_resume();
                        }
                        Some(SenderCommand::Stop { reply }) => {
                            self.video_sender.stop();
                            self.transport.close();
                            let _ = reply.send(true);
                            break;
                        }
                        None => break,
                    }
                }
                Some(frame) = self.frame_rx.recv() => {
                    self.on_encoded_frame(frame);
                }
                Some((addr, data)) = self.packet_rx.recv() => {
                    self.on_received_packet(&addr, &data);
                }
                _ = rtcp_interval.tick() => {
                    if self.video_sender.frame_sender().has_sent_frames() {
                        self.send_rtcp_report();
                    }
                }
                _ = tokio::time::sleep(pacer_delay.unwrap_or_default()),
                        if pacer_delay.is_some() => {
                    self.pacer_resume = None;
                    let now = self.clock.now();
                    let result = self
                        .transport_sender
                        .send_stored_packets(now, &mut self.transport);
                    self.handle_drain(result);
                }
                result = self.transport.flush_pending(), if self.await_writable => {
                    if let Err(e) = result {
                        error!("Transport flush failed: {}", e);
                    }
                    self.await_writable = false;
                    let now = self.clock.now();
                    let result = self
                        .transport_sender
                        .send_stored_packets(now, &mut self.transport);
                    self.handle_drain(result);
                }
            }
        }
        debug!("Sender session finished");
    }

    fn handle_drain(&mut self, result: DrainResult) {
        match result {
            DrainResult::Drained => {}
            DrainResult::ResumeAt(at) => self.pacer_resume = Some(at),
            DrainResult::AwaitTransport => self.await_writable = true,
        }
    }

    fn on_insert_raw_frame(&mut self, rtp_timestamp: RtpTimestamp) -> FrameAdmission {
        let now = self.clock.now();
        let admission = self.video_sender.insert_raw_frame(rtp_timestamp, now);
        if let FrameAdmission::Drop(Some(new_target_delay)) = admission {
            // Publish the proposed delay so future frames carry it.
            self.video_sender.set_target_playout_delay(new_target_delay);
        }
        admission
    }

    fn on_encoded_frame(&mut self, mut frame: EncodedFrame) {
        let now = self.clock.now();
        let decision = self.video_sender.on_encoded_frame(now, &mut frame);
        if decision == RtcpDecision::SendReportNow {
            self.send_rtcp_report();
        }

        self.events.dispatch_frame_event(FrameEvent {
            timestamp: now,
            kind: EventKind::FrameEnqueued,
            media_type: MediaType::Video,
            rtp_timestamp: frame.rtp_timestamp,
            frame_id: frame.frame_id,
            size: frame.data.len(),
        });

        let ssrc = self.video_sender.frame_sender().ssrc();
        let result =
            self.transport_sender
                .insert_frame(now, &mut self.transport, ssrc, &frame);
        self.handle_drain(result);
    }

    fn send_rtcp_report(&mut self) {
        let now = self.clock.now();
        let ssrc = self.video_sender.frame_sender().ssrc();
        let rtp_timestamp = self
            .video_sender
            .frame_sender()
            .current_time_as_rtp_timestamp(now);
        let result = self.transport_sender.send_sender_report(
            now,
            &mut self.transport,
            ssrc,
            rtp_timestamp,
        );
        self.handle_drain(result);
    }

    fn send_pause_resume(&mut self) {
        if !self.video_sender.frame_sender().has_sent_frames() {
            return;
        }
        let ssrc = self.video_sender.frame_sender().ssrc();
        let last_sent = self.video_sender.frame_sender().last_sent_frame_id();
        let pause_id = self.video_sender.frame_sender_mut().next_pause_id();
        let result = self.transport_sender.send_sender_pause_resume(
            &mut self.transport,
            ssrc,
            last_sent,
            pause_id,
        );
        self.handle_drain(result);
    }

    fn on_received_packet(&mut self, addr: &str, data: &[u8]) {
        let now = self.clock.now();
        let outcome =
            self.transport_sender
                .on_received_packet(now, &mut self.transport, addr, data);
        if let Some(rtt) = outcome.round_trip_time {
            self.video_sender.on_measured_round_trip_time(rtt);
        }
        if let Some(message) = outcome.sharer_message {
            self.video_sender.on_received_feedback(&message, now);
        }
    }
}

// ---------------------------------------------------------------------------
// Receiving session
// ---------------------------------------------------------------------------

enum ReceiverCommand {
    GetNextFrame {
        reply: oneshot::Sender<EncodedFrame>,
    },
    Pause,
    Resume,
    Stop {
        reply: oneshot::Sender<bool>,
    },
}

/// Handle to the running receiving session
pub struct SharerReceiver {
    command_tx: mpsc::Sender<ReceiverCommand>,
    task: JoinHandle<()>,
}

impl SharerReceiver {
    /// Bind the listen port and start the receiving session
    pub async fn start(
        env: &Environment,
        net_config: ReceiverNetConfig,
        video_config: ReceiverConfig,
    ) -> Result<Self> {
        let local_addr = format!("{}:{}", net_config.address, net_config.port)
            .parse()
            .map_err(|e| Error::ConfigError(format!("bad listen address: {}", e)))?;
        let mut transport = UdpTransport::new(UdpTransportConfig {
            local_addr,
            ..Default::default()
        })
        .await?;
        let packet_rx = transport.start_receiving();

        let (command_tx, command_rx) = mpsc::channel(16);
        let session = ReceiverSession {
            clock: env.clock.clone(),
            transport,
            receiver: FrameReceiver::new(&video_config),
            command_rx,
            packet_rx,
            frame_requests: VecDeque::new(),
            defer_until: None,
            peer_addr: None,
            paused: false,
            await_writable: false,
        };
        let task = tokio::spawn(session.run());

        info!("Started receiver on port {}", net_config.port);
        Ok(Self { command_tx, task })
    }

    /// Ask for the next decodable frame; resolves once one is released
    pub async fn next_frame(&self) -> Result<EncodedFrame> {
        let (reply, response) = oneshot::channel();
        self.command_tx
            .send(ReceiverCommand::GetNextFrame { reply })
            .await
            .map_err(|_| Error::SessionError("receiver session is gone".to_string()))?;
        response
            .await
            .map_err(|_| Error::SessionError("receiver session is gone".to_string()))
    }

    /// Stop consuming packets and drop outstanding frame requests
    pub async fn pause(&self) {
        let _ = self.command_tx.send(ReceiverCommand::Pause).await;
    }

    /// Resume consuming packets
    pub async fn resume(&self) {
        let _ = self.command_tx.send(ReceiverCommand::Resume).await;
    }

    /// Stop the session and release its socket and timers
    pub async fn stop(self) -> bool {
        let (reply, response) = oneshot::channel();
        if self.command_tx.send(ReceiverCommand::Stop { reply }).await.is_err() {
            self.task.abort();
            return false;
        }
        let stopped = response.await.unwrap_or(false);
        self.task.abort();
        stopped
    }
}

struct ReceiverSession {
    clock: Arc<dyn Clock>,
    transport: UdpTransport,
    receiver: FrameReceiver,

    command_rx: mpsc::Receiver<ReceiverCommand>,
    packet_rx: mpsc::UnboundedReceiver<(String, Vec<u8>)>,

    frame_requests: VecDeque<oneshot::Sender<EncodedFrame>>,

    /// Pending wait for a consecutive frame; at most one timer
    defer_until: Option<TimeTicks>,

    /// Learned address of the sending peer, for RTCP replies
    peer_addr: Option<String>,

    paused: bool,

    await_writable: bool,
}

impl ReceiverSession {
    async fn run(mut self) {
        let mut rtcp_interval =
            tokio::time::interval(Duration::from_millis(DEFAULT_RTCP_INTERVAL_MS as u64));
        rtcp_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let now = self.clock.now();
            let defer_delay = self.defer_until.map(|at| delay_until(now, at));
            let feedback_delay = self
                .receiver
                .time_to_send_next_feedback()
                .map(|at| delay_until(now, at).max(Duration::from_millis(1)));

            tokio::select! {
                command = self.command_rx.recv() => {
                    match command {
                        Some(ReceiverCommand::GetNextFrame { reply }) => {
                            self.frame_requests.push_back(reply);
                            let now = self.clock.now();
                            let outcome = self.receiver.request_encoded_frame(now);
                            self.deliver(outcome);
                        }
                        Some(ReceiverCommand::Pause) => {
                            self.paused = true;
                            self.receiver.flush_frames();
                            self.frame_requests.clear();
                            self.receiver.send_paused_indication();
                        }
                        Some(ReceiverCommand::Resume) => {
                            self.paused = false;
                        }
                        Some(ReceiverCommand::Stop { reply }) => {
                            self.transport.close();
                            let _ = reply.send(true);
                            break;
                        }
                        None => break,
                    }
                }
                Some((addr, data)) = self.packet_rx.recv(), if !self.paused => {
                    self.on_received_packet(addr, &data);
                }
                _ = rtcp_interval.tick() => {
                    self.send_rtcp_report();
                }
                _ = tokio::time::sleep(feedback_delay.unwrap_or_default()),
                        if feedback_delay.is_some() => {
                    self.send_feedback();
                }
                _ = tokio::time::sleep(defer_delay.unwrap_or_default()),
                        if defer_delay.is_some() => {
                    self.defer_until = None;
                    let now = self.clock.now();
                    let outcome = self.receiver.on_deferred_wait_elapsed(now);
                    self.deliver(outcome);
                }
                result = self.transport.flush_pending(), if self.await_writable => {
                    if let Err(e) = result {
                        error!("Transport flush failed: {}", e);
                    }
                    self.await_writable = false;
                }
            }
        }
        debug!("Receiver session finished");
    }

    fn on_received_packet(&mut self, addr: String, data: &[u8]) {
        let now = self.clock.now();
        match SharerPacket::parse(data) {
            Ok(packet) => {
                self.peer_addr = Some(addr);
                let outcome = self.receiver.process_packet(now, packet);
                self.deliver(outcome);
            }
            Err(e) => {
                // Malformed traffic is dropped at ingress, never fatal.
                warn!("Dropping unparseable packet from {}: {}", addr, e);
            }
        }
    }

    fn deliver(&mut self, outcome: EmitOutcome) {
        if let Some(at) = outcome.defer_until {
            self.defer_until = Some(at);
        }
        for frame in outcome.frames {
            match self.frame_requests.pop_front() {
                Some(reply) => {
                    let _ = reply.send(frame);
                }
                None => {
                    debug_assert!(false, "emitted a frame without a request");
                    break;
                }
            }
        }
    }

    fn send_rtcp_report(&mut self) {
        let now = self.clock.now();
        if self.receiver.check_network_timeout(now) {
            // Possibly a dropped membership; best effort re-join.
            self.transport.rejoin_multicast_group();
        }
        if self.await_writable {
            return;
        }
        let Some(addr) = self.peer_addr.clone() else {
            return;
        };
        let report = self.receiver.build_rtcp_report(now);
        if self.transport.send_packet(&addr, &report) == crate::pacing::SendOutcome::Pending {
            self.await_writable = true;
        }
    }

    fn send_feedback(&mut self) {
        let now = self.clock.now();
        if self.await_writable {
            return;
        }
        let Some(addr) = self.peer_addr.clone() else {
            return;
        };
        if let Some(packet) = self.receiver.poll_feedback(now) {
            if self.transport.send_packet(&addr, &packet) == crate::pacing::SendOutcome::Pending {
                self.await_writable = true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control plane
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StartSharerPayload {
    ip: String,
    #[serde(default)]
    port: Option<u16>,
    bitrate: u32,
    fps: f64,
}

#[derive(Deserialize)]
struct SharerIdPayload {
    sharer_id: i64,
}

#[derive(Deserialize)]
struct ChangeEncodingPayload {
    sharer_id: i64,
    bitrate: u32,
    fps: f64,
}

/// Default port sharers send to when the command does not name one
const DEFAULT_SHARER_PORT: u16 = 5004;

/// Owns all sessions and dispatches control commands
pub struct SharerService {
    env: Environment,
    stats: Arc<StatsSubscriber>,

    receiver: Option<SharerReceiver>,
    sharers: HashMap<i64, SharerSender>,
    next_sharer_id: i64,

    receiver_net_config: ReceiverNetConfig,
    receiver_video_config: ReceiverConfig,
}

impl SharerService {
    /// Create the service with default receiver configuration
    pub fn new(env: Environment) -> Self {
        let stats = Arc::new(StatsSubscriber::new());
        env.events.subscribe(stats.clone());
        Self {
            env,
            stats,
            receiver: None,
            sharers: HashMap::new(),
            next_sharer_id: 1,
            receiver_net_config: ReceiverNetConfig::default(),
            receiver_video_config: ReceiverConfig::video(),
        }
    }

    /// Packet counters collected from the event stream
    pub fn stats(&self) -> &StatsSubscriber {
        &self.stats
    }

    /// Access a running sharer, e.g. to obtain its encoded-frame channel
    pub fn sharer(&self, sharer_id: i64) -> Option<&SharerSender> {
        self.sharers.get(&sharer_id)
    }

    /// Dispatch one control command and produce the reply message
    ///
    /// Every command must carry `cmd` and `cmd_id`; the reply echoes
    /// `cmd_id` with `success` and an optional `payload`.
    pub async fn handle_command(&mut self, message: Value) -> Value {
        let Some(cmd_id) = message.get("cmd_id").and_then(Value::as_i64) else {
            error!("Can't parse command with cmd_id == null");
            return json!({ "cmd_id": Value::Null, "success": false });
        };
        let Some(cmd) = message.get("cmd").and_then(Value::as_str) else {
            error!("Can't parse message {} without a command", cmd_id);
            return reply(cmd_id, false, Value::Null);
        };
        let payload = message.get("payload").cloned().unwrap_or(Value::Null);

        match cmd {
            "startReceiver" => self.start_receiver(cmd_id).await,
            "stopReceiver" => self.stop_receiver(cmd_id).await,
            "startSharer" => self.start_sharer(cmd_id, payload).await,
            "stopSharer" => self.stop_sharer(cmd_id, payload).await,
            "setSharerTracks" => self.set_sharer_tracks(cmd_id, payload),
            "changeEncoding" => self.change_encoding(cmd_id, payload).await,
            other => {
                error!("Unknown command: {}", other);
                reply(cmd_id, false, Value::Null)
            }
        }
    }

    async fn start_receiver(&mut self, cmd_id: i64) -> Value {
        if self.receiver.is_some() {
            return reply(cmd_id, true, Value::Null);
        }
        match SharerReceiver::start(
            &self.env,
            self.receiver_net_config.clone(),
            self.receiver_video_config.clone(),
        )
        .await
        {
            Ok(receiver) => {
                self.receiver = Some(receiver);
                reply(cmd_id, true, Value::Null)
            }
            Err(e) => {
                error!("Could not start receiver: {}", e);
                reply(cmd_id, false, Value::Null)
            }
        }
    }

    async fn stop_receiver(&mut self, cmd_id: i64) -> Value {
        match self.receiver.take() {
            Some(receiver) => {
                let stopped = receiver.stop().await;
                reply(cmd_id, stopped, Value::Null)
            }
            None => reply(cmd_id, true, Value::Null),
        }
    }

    async fn start_sharer(&mut self, cmd_id: i64, payload: Value) -> Value {
        let request: StartSharerPayload = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("Bad startSharer payload: {}", e);
                return reply(cmd_id, false, Value::Null);
            }
        };

        let config = SenderConfig {
            initial_bitrate: request.bitrate,
            frame_rate: request.fps,
            remote_address: request.ip,
            remote_port: request.port.unwrap_or(DEFAULT_SHARER_PORT),
            ..Default::default()
        };

        let id = self.next_sharer_id;
        match SharerSender::start(&self.env, id, config).await {
            Ok(sender) => {
                self.next_sharer_id += 1;
                self.sharers.insert(id, sender);
                reply(cmd_id, true, json!({ "sharer_id": id }))
            }
            Err(e) => {
                error!("Could not start sharer: {}", e);
                reply(cmd_id, false, Value::Null)
            }
        }
    }

    async fn stop_sharer(&mut self, cmd_id: i64, payload: Value) -> Value {
        let request: SharerIdPayload = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("Bad stopSharer payload: {}", e);
                return reply(cmd_id, false, Value::Null);
            }
        };
        match self.sharers.remove(&request.sharer_id) {
            Some(sender) => {
                let stopped = sender.stop().await;
                reply(cmd_id, stopped, Value::Null)
            }
            None => {
                error!("No sharer with id {}", request.sharer_id);
                reply(cmd_id, false, Value::Null)
            }
        }
    }

    fn set_sharer_tracks(&mut self, cmd_id: i64, payload: Value) -> Value {
        // The video track itself lives outside this crate; binding succeeds
        // when the addressed sharer exists and its frame channel is open.
        let request: SharerIdPayload = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("Bad setSharerTracks payload: {}", e);
                return reply(cmd_id, false, Value::Null);
            }
        };
        let success = self.sharers.contains_key(&request.sharer_id);
        reply(cmd_id, success, Value::Null)
    }

    async fn change_encoding(&mut self, cmd_id: i64, payload: Value) -> Value {
        let request: ChangeEncodingPayload = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                error!("Bad changeEncoding payload: {}", e);
                return reply(cmd_id, false, Value::Null);
            }
        };
        match self.sharers.get(&request.sharer_id) {
            Some(sender) => {
                let changed = sender.change_encoding(request.bitrate, request.fps).await;
                reply(cmd_id, changed, Value::Null)
            }
            None => {
                error!("No sharer with id {}", request.sharer_id);
                reply(cmd_id, false, Value::Null)
            }
        }
    }
}

fn reply(cmd_id: i64, success: bool, payload: Value) -> Value {
    if payload.is_null() {
        json!({ "cmd_id": cmd_id, "success": success })
    } else {
        json!({ "cmd_id": cmd_id, "success": success, "payload": payload })
    }
}
