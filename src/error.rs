//! Error taxonomy shared by channels, pipelines, requests and configuration.
//!
//! Buffer errors live next to the buffer in [`crate::buffer::BufferError`]; they
//! are local to the caller and the buffer stays usable after one is returned.
use std::io;

use log::Level;
use thiserror::Error;

use crate::buffer::BufferError;

/// Socket-origin failures. The variants only drive log severity, every one of
/// them ends in the same disconnect cleanup.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection refused: {0}")]
    Refused(io::Error),
    #[error("connection reset: {0}")]
    Reset(io::Error),
    #[error("connection timed out: {0}")]
    TimedOut(io::Error),
    #[error("transport io error: {0}")]
    Io(io::Error),
    #[error("channel not connected")]
    NotConnected,
    #[error("channel disconnected")]
    Disconnected,
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("tls error: {0}")]
    Tls(#[from] rustls::Error),
}

impl ConnectionError {
    /// Sorts an io error into the refused/reset/timeout/other buckets.
    pub fn classify(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::Refused(err),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Reset(err),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::TimedOut(err),
            _ => Self::Io(err),
        }
    }

    /// Level used when this error is logged by the channel engine.
    pub fn severity(&self) -> Level {
        match self {
            Self::Reset(_) | Self::Disconnected => Level::Info,
            Self::Refused(_) | Self::TimedOut(_) | Self::Rejected(_) | Self::NotConnected => {
                Level::Warn
            }
            Self::Io(_) | Self::Tls(_) => Level::Error,
        }
    }
}

impl From<io::Error> for ConnectionError {
    fn from(value: io::Error) -> Self {
        Self::classify(value)
    }
}

/// Raised by a pipeline while framing or unframing messages.
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("pipeline requested a negative byte count ({0})")]
    NegativeExpectedBytes(isize),
    #[error("frame of {size} bytes exceeds the limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },
    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),
    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    #[error("pipeline left the outgoing message unserialized")]
    NotSerialized,
    #[error("buffer error while framing: {0}")]
    Buffer(#[from] BufferError),
}

/// Invalid or incomplete wiring detected while a channel or service starts.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("missing required provider: {0}")]
    MissingProvider(&'static str),
    #[error("invalid port in address '{0}'")]
    InvalidPort(String),
    #[error("invalid address '{0}'")]
    InvalidAddress(String),
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("failed to read configuration: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Returned when a request can no longer accept a response.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum RequestStateError {
    #[error("request expired while waiting for a response")]
    Expired,
    #[error("request still pending when the wait ended")]
    Pending,
    #[error("request was cancelled")]
    Cancelled,
    #[error("request already answered")]
    AlreadyAnswered,
    #[error("request failed to send")]
    Failed,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    RequestState(#[from] RequestStateError),
    #[error("failed to spawn thread: {0}")]
    Thread(io::Error),
}

impl Error {
    pub fn severity(&self) -> Level {
        match self {
            Error::Connection(e) => e.severity(),
            Error::Configuration(_) => Level::Warn,
            _ => Level::Error,
        }
    }
}
