//! Value codec errors.

use tds_protocol::error::ProtocolError;
use tds_protocol::types::TypeId;
use tds_protocol::wire::{Step, WireError};
use thiserror::Error;

/// Errors raised while encoding or decoding a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    /// Malformed wire data.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// NaN or an infinity cannot be sent.
    #[error("floating point value out of range: {0}")]
    FloatOutOfRange(String),

    /// DECIMAL/NUMERIC precision above the protocol maximum.
    #[error("precision {precision} exceeds maximum {max}")]
    PrecisionTooLarge {
        /// Requested precision.
        precision: u8,
        /// Protocol maximum.
        max: u8,
    },

    /// Value does not fit the declared precision and scale.
    #[error("numeric value out of range for precision {precision}, scale {scale}")]
    NumericOutOfRange {
        /// Declared precision.
        precision: u8,
        /// Declared scale.
        scale: u8,
    },

    /// A collation whose code page has no known encoding.
    #[error("unsupported collation (LCID 0x{lcid:05X}, sort id {sort_id})")]
    UnsupportedCollation {
        /// Collation LCID.
        lcid: u32,
        /// Collation sort id.
        sort_id: u8,
    },

    /// A length that does not match the type.
    #[error("invalid length {length} for {type_name}")]
    InvalidLength {
        /// Type name.
        type_name: &'static str,
        /// Offending length.
        length: u64,
    },

    /// A date or time outside the type's range.
    #[error("{0} out of range")]
    DateOutOfRange(&'static str),

    /// Character data that does not decode in its code page.
    #[error("invalid {0} character data")]
    InvalidText(&'static str),

    /// The value cannot be carried by the requested type.
    #[error("value of type {value} cannot be sent as {wire:?}")]
    TypeMismatch {
        /// Value type.
        value: &'static str,
        /// Requested wire type.
        wire: TypeId,
    },

    /// A NULL where a value was required.
    #[error("unexpected NULL")]
    UnexpectedNull,

    /// The value does not convert to the requested Rust type.
    #[error("cannot convert {from} to {to}")]
    Conversion {
        /// SQL type of the value.
        from: &'static str,
        /// Requested Rust type.
        to: &'static str,
    },

    /// Column encryption cannot handle this type.
    #[error("type {0} cannot be encrypted")]
    NotEncryptable(&'static str),

    /// A PLP stream ended before its declared length.
    #[error("PLP stream ended after {received} of {declared} bytes")]
    PlpLengthMismatch {
        /// Declared total length.
        declared: u64,
        /// Bytes actually received.
        received: u64,
    },
}

/// Failure of an in-progress value decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Ran out of buffered input; nothing was consumed.
    Incomplete,
    /// The data is invalid.
    Invalid(ValueError),
}

impl From<WireError> for DecodeError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Incomplete => Self::Incomplete,
            WireError::Protocol(e) => Self::Invalid(e.into()),
        }
    }
}

impl From<ValueError> for DecodeError {
    fn from(e: ValueError) -> Self {
        Self::Invalid(e)
    }
}

impl From<ProtocolError> for DecodeError {
    fn from(e: ProtocolError) -> Self {
        Self::Invalid(e.into())
    }
}

/// Result of an in-progress value decode.
pub type DecodeResult<T> = Result<T, DecodeError>;

/// Collapse a [`DecodeResult`] into the tri-state form.
pub fn step<T>(result: DecodeResult<T>) -> Result<Step<T>, ValueError> {
    match result {
        Ok(v) => Ok(Step::Ready(v)),
        Err(DecodeError::Incomplete) => Ok(Step::NeedMore),
        Err(DecodeError::Invalid(e)) => Err(e),
    }
}
