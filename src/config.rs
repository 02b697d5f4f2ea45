//! Session configuration

use serde::{Deserialize, Serialize};

use crate::RtpSsrc;

/// Default interval between periodic RTCP reports, in milliseconds
pub const DEFAULT_RTCP_INTERVAL_MS: i64 = 500;

/// Default maximum playout delay, in milliseconds
pub const DEFAULT_RTP_MAX_DELAY_MS: i32 = 100;

/// Default maximum frame rate
pub const DEFAULT_MAX_FRAME_RATE: f64 = 30.0;

/// Fixed SSRC the video stream is sent with
pub const DEFAULT_VIDEO_SSRC: RtpSsrc = 11;

/// Fixed SSRC the receiver uses for video feedback
pub const DEFAULT_VIDEO_FEEDBACK_SSRC: RtpSsrc = 12;

/// Fixed SSRC of the audio stream (placeholder path)
pub const DEFAULT_AUDIO_SSRC: RtpSsrc = 1;

/// Configuration of a sending session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Bitrate the encoder starts at, in bits per second
    pub initial_bitrate: u32,

    /// Capture frame rate
    pub frame_rate: f64,

    /// Host or address the stream is sent to
    pub remote_address: String,

    /// UDP port the stream is sent to
    pub remote_port: u16,

    /// Lower bound for the adaptive target playout delay, in milliseconds;
    /// zero pins the target to the maximum
    #[serde(default)]
    pub min_playout_delay_ms: i32,

    /// Upper bound for the adaptive target playout delay, in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_playout_delay_ms: i32,
}

fn default_max_delay() -> i32 {
    DEFAULT_RTP_MAX_DELAY_MS
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 2_000_000,
            frame_rate: DEFAULT_MAX_FRAME_RATE,
            remote_address: String::new(),
            remote_port: 0,
            min_playout_delay_ms: 0,
            max_playout_delay_ms: DEFAULT_RTP_MAX_DELAY_MS,
        }
    }
}

/// Configuration of a receiving session's media stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// SSRC this receiver reports as
    pub receiver_ssrc: RtpSsrc,

    /// SSRC of the sender being received
    pub sender_ssrc: RtpSsrc,

    /// Initial target playout delay, in milliseconds
    pub rtp_max_delay_ms: i32,

    /// Expected capture frame rate
    pub target_frame_rate: i32,

    /// RTP timebase of the stream
    pub rtp_timebase: i32,
}

impl ReceiverConfig {
    /// Defaults for the video stream
    pub fn video() -> Self {
        Self {
            receiver_ssrc: DEFAULT_VIDEO_FEEDBACK_SSRC,
            sender_ssrc: DEFAULT_VIDEO_SSRC,
            rtp_max_delay_ms: DEFAULT_RTP_MAX_DELAY_MS,
            target_frame_rate: DEFAULT_MAX_FRAME_RATE as i32,
            rtp_timebase: crate::frame::VIDEO_FREQUENCY,
        }
    }
}

/// Network configuration of a receiving session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverNetConfig {
    /// Address to listen on
    pub address: String,

    /// UDP port to listen on
    pub port: u16,
}

impl Default for ReceiverNetConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 5004,
        }
    }
}
