//! Framing and transport errors.

use std::io;

use tds_protocol::error::ProtocolError;
use thiserror::Error;

/// Errors raised by the packet framer.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Malformed packet header or payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A packet larger than the negotiated size.
    #[error("packet of {size} bytes exceeds maximum {max}")]
    PacketTooLarge {
        /// Announced size.
        size: usize,
        /// Negotiated maximum.
        max: usize,
    },

    /// A packet size outside the negotiable range.
    #[error("invalid packet size {0}")]
    InvalidPacketSize(usize),

    /// The transport closed, possibly in the middle of a message.
    #[error("connection closed")]
    ConnectionClosed,

    /// The channel was used after a fatal error.
    #[error("channel is broken")]
    Broken,

    /// A message was started while another was still being written.
    #[error("a {0} message is already being written")]
    MessageInProgress(&'static str),

    /// Payload written outside a message.
    #[error("no message has been started")]
    NoMessage,

    /// No channel is available for a new operation.
    #[error("no channel available")]
    PoolExhausted,
}

impl CodecError {
    /// Whether the session cannot continue after this error.
    ///
    /// Misuse of the channel API and pool exhaustion leave the session
    /// usable; every framing failure is fatal.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::PoolExhausted | Self::MessageInProgress(_) | Self::NoMessage
        )
    }

    /// A blocking read or write that ran past the transport's timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::Io(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
        )
    }
}
