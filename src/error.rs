use thiserror::Error;
use std::io;

/// Error type for transport operations
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Error when building an RTP or RTCP packet
    #[error("Failed to build packet: {0}")]
    BuildError(String),

    /// Invalid packet received from the network
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Buffer too small for the data being read or written
    #[error("Buffer too small: need {required} but have {available}")]
    BufferTooSmall {
        required: usize,
        available: usize,
    },

    /// Invalid parameter for a transport operation
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// IO error when sending or receiving packets
    #[error("IO error: {0}")]
    IoError(String),

    /// Parsing error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// RTCP error
    #[error("RTCP error: {0}")]
    RtcpError(String),

    /// Session error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
