//! Protocol-level error types.

use thiserror::Error;

/// Errors raised while encoding or decoding TDS wire structures.
///
/// Every variant describes malformed or unexpected data. Running out of
/// input is not an error: decoders report it as
/// [`Step::NeedMore`](crate::wire::Step::NeedMore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// Unknown packet type byte in a packet header.
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Packet status byte carries bits outside the defined set.
    #[error("invalid packet status: 0x{0:02X}")]
    InvalidPacketStatus(u8),

    /// Packet length outside the header..=negotiated packet size range.
    #[error("invalid packet length {length} (allowed {min}..={max})")]
    InvalidPacketLength {
        /// Length announced by the header.
        length: usize,
        /// Smallest acceptable length.
        min: usize,
        /// Largest acceptable length.
        max: usize,
    },

    /// Packet arrived for a different channel than the one reading it.
    #[error("packet for channel {actual} received on channel {expected}")]
    ChannelMismatch {
        /// Channel id the reader expected.
        expected: u16,
        /// Channel id in the header.
        actual: u16,
    },

    /// A fixed-size structure was cut short inside a complete message.
    #[error("truncated {what}: needed {needed} bytes, {available} available")]
    Truncated {
        /// Structure being decoded.
        what: &'static str,
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// Token byte outside the known token set.
    #[error("unknown token: 0x{0:02X}")]
    InvalidTokenType(u8),

    /// Token arrived where the stream state does not allow it.
    #[error("unexpected token {token} ({context})")]
    UnexpectedToken {
        /// Token name.
        token: &'static str,
        /// Why it was unexpected.
        context: &'static str,
    },

    /// Data type byte outside the known type set.
    #[error("unknown data type: 0x{0:02X}")]
    InvalidDataType(u8),

    /// UTF-16 or code-page text could not be decoded.
    #[error("invalid string encoding in {0}")]
    StringEncoding(&'static str),

    /// Unknown PRELOGIN option id.
    #[error("invalid prelogin option: 0x{0:02X}")]
    InvalidPreloginOption(u8),

    /// A field holds a value outside its legal domain.
    #[error("invalid {field}: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u64,
    },

    /// LOGINACK announced a TDS version this engine does not know.
    #[error("unsupported TDS version 0x{0:08X}")]
    UnsupportedVersion(u32),

    /// FEDAUTHINFO lacked the STS URL or the SPN.
    #[error("FEDAUTHINFO is missing {0}")]
    MissingFedAuthInfo(&'static str),

    /// A variable field is longer than its length prefix can express.
    #[error("{field} too long: {len} (max {max})")]
    FieldTooLong {
        /// Field name.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum length.
        max: usize,
    },
}
