//! Transaction manager requests (packet type 0x0E).
//!
//! A request is ALL_HEADERS, a 2-byte request code and a request-specific
//! payload. Responses are ordinary token streams.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{write_b_varchar, write_us_varbyte};
use crate::error::ProtocolError;
use crate::sql_batch::AllHeaders;

/// Flag on commit and rollback: begin a new transaction afterwards.
pub const TM_BEGIN_NEW: u8 = 0x01;

/// Isolation level sent with a begin request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Server default.
    #[default]
    Unspecified = 0,
    /// Read uncommitted.
    ReadUncommitted = 1,
    /// Read committed.
    ReadCommitted = 2,
    /// Repeatable read.
    RepeatableRead = 3,
    /// Serializable.
    Serializable = 4,
    /// Snapshot.
    Snapshot = 5,
}

/// A transaction manager request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmRequest {
    /// Fetch the DTC address.
    GetDtcAddress,
    /// Enlist in a distributed transaction.
    Propagate {
        /// Opaque DTC propagation token.
        token: Bytes,
    },
    /// Begin a local transaction.
    Begin {
        /// Isolation level.
        isolation: IsolationLevel,
        /// Transaction name, may be empty.
        name: String,
    },
    /// Promote the local transaction to a distributed one.
    Promote,
    /// Commit.
    Commit {
        /// Transaction name, may be empty.
        name: String,
        /// Begin a new transaction with this isolation and name afterwards.
        begin_new: Option<(IsolationLevel, String)>,
    },
    /// Roll back.
    Rollback {
        /// Transaction or savepoint name, may be empty.
        name: String,
        /// Begin a new transaction with this isolation and name afterwards.
        begin_new: Option<(IsolationLevel, String)>,
    },
    /// Create a savepoint.
    Save {
        /// Savepoint name.
        name: String,
    },
}

impl TmRequest {
    /// Wire request code.
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::GetDtcAddress => 0,
            Self::Propagate { .. } => 1,
            Self::Begin { .. } => 5,
            Self::Promote => 6,
            Self::Commit { .. } => 7,
            Self::Rollback { .. } => 8,
            Self::Save { .. } => 9,
        }
    }

    /// Whether the response carries a result set.
    #[must_use]
    pub const fn returns_rows(&self) -> bool {
        matches!(self, Self::GetDtcAddress | Self::Promote)
    }

    /// Encode the payload after ALL_HEADERS.
    pub fn encode(&self, headers: &AllHeaders) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(64);
        headers.encode(&mut buf);
        buf.put_u16_le(self.code());
        match self {
            // Empty US_VARBYTE.
            Self::GetDtcAddress => buf.put_u16_le(0),
            Self::Promote => {}
            Self::Propagate { token } => write_us_varbyte(&mut buf, token)?,
            Self::Begin { isolation, name } => {
                buf.put_u8(*isolation as u8);
                write_b_varchar(&mut buf, name)?;
            }
            Self::Commit { name, begin_new } | Self::Rollback { name, begin_new } => {
                write_b_varchar(&mut buf, name)?;
                match begin_new {
                    Some((isolation, new_name)) => {
                        buf.put_u8(TM_BEGIN_NEW);
                        buf.put_u8(*isolation as u8);
                        write_b_varchar(&mut buf, new_name)?;
                    }
                    None => buf.put_u8(0),
                }
            }
            Self::Save { name } => write_b_varchar(&mut buf, name)?,
        }
        Ok(buf.freeze())
    }
}
