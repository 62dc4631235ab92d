//! SQL batch requests and the ALL_HEADERS prefix.
//!
//! From Yukon on, SQL batch and transaction-manager requests start with
//! ALL_HEADERS. The only header this engine writes is the transaction
//! descriptor header, which carries the current transaction descriptor and
//! the number of open results on the session.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::write_utf16_string;
use crate::version::ProtocolTier;

/// Header type of the transaction descriptor header.
pub const HEADER_TRANSACTION_DESCRIPTOR: u16 = 0x0002;

/// Encoded size of ALL_HEADERS with only the transaction descriptor.
pub const ALL_HEADERS_LEN: usize = 4 + 18;

/// The ALL_HEADERS prefix.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllHeaders {
    /// Current transaction descriptor, 0 outside a transaction.
    pub transaction_descriptor: u64,
    /// Outstanding request count on the session.
    pub outstanding_requests: u32,
}

impl AllHeaders {
    /// Headers for `descriptor` with `outstanding` open results.
    #[must_use]
    pub const fn new(transaction_descriptor: u64, outstanding_requests: u32) -> Self {
        Self {
            transaction_descriptor,
            outstanding_requests,
        }
    }

    /// Write the headers.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u32_le(ALL_HEADERS_LEN as u32);
        dst.put_u32_le(18);
        dst.put_u16_le(HEADER_TRANSACTION_DESCRIPTOR);
        dst.put_u64_le(self.transaction_descriptor);
        dst.put_u32_le(self.outstanding_requests);
    }
}

/// A SQL batch request.
#[derive(Debug, Clone)]
pub struct SqlBatch {
    sql: String,
    headers: AllHeaders,
}

impl SqlBatch {
    /// A batch outside any transaction.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            headers: AllHeaders::new(0, 1),
        }
    }

    /// Attach transaction headers.
    #[must_use]
    pub fn with_headers(mut self, headers: AllHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// SQL text.
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Encode the payload. Tiers before Yukon carry no ALL_HEADERS.
    #[must_use]
    pub fn encode(&self, tier: ProtocolTier) -> Bytes {
        let mut buf = BytesMut::with_capacity(ALL_HEADERS_LEN + self.sql.len() * 2);
        if tier >= ProtocolTier::Yukon {
            self.headers.encode(&mut buf);
        }
        write_utf16_string(&mut buf, &self.sql);
        buf.freeze()
    }
}
