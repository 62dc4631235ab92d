//! Tri-state, non-consuming decode primitives.
//!
//! Every decoder in the engine reads through a [`Reader`], a cursor over
//! the bytes that are currently buffered. A short read surfaces as
//! [`WireError::Incomplete`] and is turned into [`Step::NeedMore`] at the
//! decode boundary by [`step`]. Because the reader only borrows the
//! buffer, a `NeedMore` outcome leaves the caller's buffer untouched and
//! the same decode can be retried once more bytes arrive.
//!
//! ```
//! use tds_protocol::wire::{step, Reader, Step};
//!
//! let partial = [0x01, 0x00];
//! let mut r = Reader::new(&partial);
//! assert!(matches!(step(r.read_u32_le()), Ok(Step::NeedMore)));
//!
//! let full = [0x01, 0x00, 0x00, 0x00];
//! let mut r = Reader::new(&full);
//! assert!(matches!(step(r.read_u32_le()), Ok(Step::Ready(1))));
//! ```

use crate::codec::decode_utf16;
use crate::error::ProtocolError;

/// Outcome of a decode step that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Step<T> {
    /// The value was decoded.
    Ready(T),
    /// Not enough bytes are buffered; nothing was consumed.
    NeedMore,
}

impl<T> Step<T> {
    /// Map the ready value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Step<U> {
        match self {
            Self::Ready(v) => Step::Ready(f(v)),
            Self::NeedMore => Step::NeedMore,
        }
    }

    /// Whether the step produced a value.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// Convert into an `Option`, dropping the `NeedMore` case.
    pub fn ready(self) -> Option<T> {
        match self {
            Self::Ready(v) => Some(v),
            Self::NeedMore => None,
        }
    }
}

/// Internal error used while a decode step is in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Ran out of buffered input.
    Incomplete,
    /// Data is malformed.
    Protocol(ProtocolError),
}

impl From<ProtocolError> for WireError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

/// Result of an in-progress decode step.
pub type WireResult<T> = Result<T, WireError>;

/// Collapse a [`WireResult`] into the public tri-state form.
pub fn step<T>(result: WireResult<T>) -> Result<Step<T>, ProtocolError> {
    match result {
        Ok(v) => Ok(Step::Ready(v)),
        Err(WireError::Incomplete) => Ok(Step::NeedMore),
        Err(WireError::Protocol(e)) => Err(e),
    }
}

/// Run `f` over `buf` and report how many bytes it consumed.
///
/// On `NeedMore` the returned count is meaningless and the caller keeps
/// its buffer as is.
pub fn try_decode<'a, T>(
    buf: &'a [u8],
    f: impl FnOnce(&mut Reader<'a>) -> WireResult<T>,
) -> Result<Step<(T, usize)>, ProtocolError> {
    let mut r = Reader::new(buf);
    step(f(&mut r).map(|v| (v, r.position())))
}

/// Borrowing little-endian cursor with incomplete-aware reads.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    exact: bool,
}

impl<'a> Reader<'a> {
    /// Reader over a buffer that may still grow; short reads are
    /// [`WireError::Incomplete`].
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            exact: false,
        }
    }

    /// Reader over a buffer known to be complete; short reads are
    /// protocol errors.
    #[must_use]
    pub fn exact(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            exact: true,
        }
    }

    /// Mark whether more bytes can follow the buffered ones.
    #[must_use]
    pub fn with_final(mut self, is_final: bool) -> Self {
        self.exact = is_final;
        self
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left in the buffer.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Whether the buffer is exhausted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Whether no more bytes will follow the buffered ones.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.exact
    }

    fn short(&self, needed: usize) -> WireError {
        if self.exact {
            WireError::Protocol(ProtocolError::Truncated {
                what: "token data",
                needed,
                available: self.remaining(),
            })
        } else {
            WireError::Incomplete
        }
    }

    fn ensure(&self, n: usize) -> WireResult<()> {
        if self.remaining() < n {
            Err(self.short(n))
        } else {
            Ok(())
        }
    }

    /// Look at the next byte without consuming it.
    pub fn peek_u8(&self) -> WireResult<u8> {
        self.ensure(1)?;
        Ok(self.buf[self.pos])
    }

    /// Look at the next byte; `None` when the buffer is final and empty.
    pub fn peek_u8_opt(&self) -> WireResult<Option<u8>> {
        match self.buf.get(self.pos) {
            Some(b) => Ok(Some(*b)),
            None if self.exact => Ok(None),
            None => Err(WireError::Incomplete),
        }
    }

    /// Borrow the next `n` bytes.
    pub fn read_bytes(&mut self, n: usize) -> WireResult<&'a [u8]> {
        self.ensure(n)?;
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> WireResult<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    /// Split off an exact reader over the next `n` bytes.
    pub fn sub(&mut self, n: usize) -> WireResult<Reader<'a>> {
        Ok(Reader::exact(self.read_bytes(n)?))
    }

    fn array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.array::<1>()?[0])
    }

    /// Read a little-endian `u16`.
    pub fn read_u16_le(&mut self) -> WireResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    /// Read a big-endian `u16`.
    pub fn read_u16_be(&mut self) -> WireResult<u16> {
        self.array().map(u16::from_be_bytes)
    }

    /// Read a little-endian `i16`.
    pub fn read_i16_le(&mut self) -> WireResult<i16> {
        self.array().map(i16::from_le_bytes)
    }

    /// Read a little-endian `u32`.
    pub fn read_u32_le(&mut self) -> WireResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    /// Read a big-endian `u32`.
    pub fn read_u32_be(&mut self) -> WireResult<u32> {
        self.array().map(u32::from_be_bytes)
    }

    /// Read a little-endian `i32`.
    pub fn read_i32_le(&mut self) -> WireResult<i32> {
        self.array().map(i32::from_le_bytes)
    }

    /// Read a little-endian `u64`.
    pub fn read_u64_le(&mut self) -> WireResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// Read a little-endian `i64`.
    pub fn read_i64_le(&mut self) -> WireResult<i64> {
        self.array().map(i64::from_le_bytes)
    }

    /// Read a little-endian `f32`.
    pub fn read_f32_le(&mut self) -> WireResult<f32> {
        self.array().map(f32::from_le_bytes)
    }

    /// Read a little-endian `f64`.
    pub fn read_f64_le(&mut self) -> WireResult<f64> {
        self.array().map(f64::from_le_bytes)
    }

    /// Read a little-endian unsigned integer of 1 to 8 bytes.
    pub fn read_uint_le(&mut self, n: usize) -> WireResult<u64> {
        let bytes = self.read_bytes(n)?;
        Ok(bytes
            .iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    /// Read `chars` UTF-16LE code units as a string.
    pub fn read_utf16(&mut self, chars: usize) -> WireResult<String> {
        let bytes = self.read_bytes(chars * 2)?;
        Ok(decode_utf16(bytes)?)
    }

    /// Read a string with a 1-byte character count (`B_VARCHAR`).
    pub fn read_b_varchar(&mut self) -> WireResult<String> {
        let chars = self.read_u8()? as usize;
        self.read_utf16(chars)
    }

    /// Read a string with a 2-byte character count (`US_VARCHAR`).
    pub fn read_us_varchar(&mut self) -> WireResult<String> {
        let chars = self.read_u16_le()? as usize;
        self.read_utf16(chars)
    }

    /// Read bytes with a 1-byte length (`B_VARBYTE`).
    pub fn read_b_varbyte(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_u8()? as usize;
        self.read_bytes(len)
    }

    /// Read bytes with a 2-byte length (`US_VARBYTE`).
    pub fn read_us_varbyte(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_u16_le()? as usize;
        self.read_bytes(len)
    }
}
