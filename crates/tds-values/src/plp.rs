//! Partially length-prefixed (PLP) values.
//!
//! ```text
//! total length u64 (or PLP_NULL, or PLP_UNKNOWN_LEN)
//! { chunk length u32, chunk bytes }*
//! terminator: chunk length 0
//! ```
//!
//! A null value is the 8-byte [`PLP_NULL`] alone, with no terminator.
//!
//! [`PlpReader`] consumes a PLP value incrementally: it keeps whatever it
//! has already taken from the stream and resumes at the same spot when
//! called with the next buffer. Length fields are only taken once fully
//! buffered. In [`PlpMode::Skip`] chunk bytes are dropped as they pass.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::wire::Reader;

use crate::error::{DecodeResult, ValueError};

/// Total length marking a null PLP value.
pub const PLP_NULL: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Total length marking a PLP value of unannounced size.
pub const PLP_UNKNOWN_LEN: u64 = 0xFFFF_FFFF_FFFF_FFFE;

/// Chunk size used when writing PLP data.
pub const DEFAULT_PLP_CHUNK: usize = 8000;

/// What to do with chunk bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlpMode {
    /// Collect the bytes.
    Materialize,
    /// Drop the bytes, keep only the count.
    Skip,
}

/// A finished PLP value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlpValue {
    /// Null.
    Null,
    /// Collected bytes.
    Data(Bytes),
    /// Skipped; number of bytes dropped.
    Skipped(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    TotalLength,
    ChunkLength,
    ChunkData(u32),
    Done,
}

/// Resumable PLP decoder.
#[derive(Debug, Clone)]
pub struct PlpReader {
    mode: PlpMode,
    state: State,
    declared: Option<u64>,
    received: u64,
    data: BytesMut,
}

impl PlpReader {
    /// Start reading a PLP value.
    #[must_use]
    pub fn new(mode: PlpMode) -> Self {
        Self {
            mode,
            state: State::TotalLength,
            declared: None,
            received: 0,
            data: BytesMut::new(),
        }
    }

    /// Declared total length, once read. `None` before that and for
    /// unknown-length values.
    #[must_use]
    pub fn declared_len(&self) -> Option<u64> {
        self.declared
    }

    /// Bytes of value data taken so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Take as much of `buf` as possible.
    ///
    /// Returns the number of bytes consumed and the value once complete.
    /// Consumed bytes must not be offered again.
    pub fn advance(&mut self, buf: &[u8]) -> Result<(usize, Option<PlpValue>), ValueError> {
        let mut pos = 0;
        loop {
            match self.state {
                State::Done => return Ok((pos, None)),
                State::TotalLength => {
                    let Some(bytes) = buf.get(pos..pos + 8) else {
                        return Ok((pos, None));
                    };
                    pos += 8;
                    let total = u64::from_le_bytes(bytes.try_into().unwrap_or_default());
                    if total == PLP_NULL {
                        self.state = State::Done;
                        return Ok((pos, Some(PlpValue::Null)));
                    }
                    if total != PLP_UNKNOWN_LEN {
                        self.declared = Some(total);
                        if self.mode == PlpMode::Materialize {
                            self.data.reserve(total.min(1 << 20) as usize);
                        }
                    }
                    self.state = State::ChunkLength;
                }
                State::ChunkLength => {
                    let Some(bytes) = buf.get(pos..pos + 4) else {
                        return Ok((pos, None));
                    };
                    pos += 4;
                    let len = u32::from_le_bytes(bytes.try_into().unwrap_or_default());
                    if len == 0 {
                        self.state = State::Done;
                        return Ok((pos, Some(self.finish()?)));
                    }
                    self.state = State::ChunkData(len);
                }
                State::ChunkData(left) => {
                    let available = buf.len() - pos;
                    if available == 0 {
                        return Ok((pos, None));
                    }
                    let take = available.min(left as usize);
                    if self.mode == PlpMode::Materialize {
                        self.data.extend_from_slice(&buf[pos..pos + take]);
                    }
                    pos += take;
                    self.received += take as u64;
                    let left = left - take as u32;
                    self.state = if left == 0 {
                        State::ChunkLength
                    } else {
                        State::ChunkData(left)
                    };
                }
            }
        }
    }

    fn finish(&mut self) -> Result<PlpValue, ValueError> {
        if let Some(declared) = self.declared {
            if declared != self.received {
                return Err(ValueError::PlpLengthMismatch {
                    declared,
                    received: self.received,
                });
            }
        }
        Ok(match self.mode {
            PlpMode::Materialize => PlpValue::Data(std::mem::take(&mut self.data).freeze()),
            PlpMode::Skip => PlpValue::Skipped(self.received),
        })
    }
}

/// Read a complete PLP value from `r`, reporting incomplete input without
/// keeping partial state.
pub fn read_plp(r: &mut Reader<'_>, mode: PlpMode) -> DecodeResult<PlpValue> {
    let total = r.read_u64_le()?;
    if total == PLP_NULL {
        return Ok(PlpValue::Null);
    }
    let mut data = BytesMut::new();
    let mut received = 0u64;
    loop {
        let len = r.read_u32_le()? as usize;
        if len == 0 {
            break;
        }
        let chunk = r.read_bytes(len)?;
        if mode == PlpMode::Materialize {
            data.extend_from_slice(chunk);
        }
        received += len as u64;
    }
    if total != PLP_UNKNOWN_LEN && total != received {
        return Err(ValueError::PlpLengthMismatch {
            declared: total,
            received,
        }
        .into());
    }
    Ok(match mode {
        PlpMode::Materialize => PlpValue::Data(data.freeze()),
        PlpMode::Skip => PlpValue::Skipped(received),
    })
}

/// Write a PLP null.
pub fn write_plp_null(dst: &mut impl BufMut) {
    dst.put_u64_le(PLP_NULL);
}

/// Write `data` as PLP chunks of at most `chunk_size` bytes.
///
/// With `known_length` false the total is sent as [`PLP_UNKNOWN_LEN`].
pub fn write_plp(dst: &mut impl BufMut, data: &[u8], chunk_size: usize, known_length: bool) {
    write_plp_chunks(
        dst,
        known_length.then_some(data.len() as u64),
        data.chunks(chunk_size.max(1)),
    );
}

/// Write pre-split chunks. `total` of `None` sends [`PLP_UNKNOWN_LEN`].
/// Empty chunks are dropped so they are not read as the terminator.
pub fn write_plp_chunks<'a>(
    dst: &mut impl BufMut,
    total: Option<u64>,
    chunks: impl IntoIterator<Item = &'a [u8]>,
) {
    dst.put_u64_le(total.unwrap_or(PLP_UNKNOWN_LEN));
    for chunk in chunks {
        if chunk.is_empty() {
            continue;
        }
        dst.put_u32_le(chunk.len() as u32);
        dst.put_slice(chunk);
    }
    dst.put_u32_le(0);
}
