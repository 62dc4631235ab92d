//! Resumable decoding straight from a channel's payload.
//!
//! A decode attempt runs over the buffered payload. When it runs short the
//! channel is asked for one more packet and the attempt starts over; when no
//! packet is buffered either, the caller gets `NeedMore` and nothing has
//! been consumed.

use tds_codec::Channel;
use tds_protocol::wire::{Reader, Step, WireError};
use tds_values::DecodeError;

use crate::error::{Error, Result};

/// Why a decode attempt stopped.
#[derive(Debug)]
pub(crate) enum ReadError {
    /// The payload ran out.
    Incomplete,
    /// The data is invalid.
    Failed(Error),
}

impl From<WireError> for ReadError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Incomplete => Self::Incomplete,
            WireError::Protocol(e) => Self::Failed(e.into()),
        }
    }
}

impl From<DecodeError> for ReadError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Incomplete => Self::Incomplete,
            DecodeError::Invalid(e) => Self::Failed(e.into()),
        }
    }
}

/// Run `f` over the payload, pulling packets until it completes.
pub(crate) fn decode_from<T>(
    ch: &mut Channel,
    mut f: impl FnMut(&mut Reader<'_>) -> std::result::Result<T, ReadError>,
) -> Result<Step<T>> {
    loop {
        let mut r = Reader::new(ch.payload()).with_final(ch.message_complete());
        match f(&mut r) {
            Ok(value) => {
                let used = r.position();
                ch.consume(used);
                return Ok(Step::Ready(value));
            }
            Err(ReadError::Failed(e)) => return Err(e),
            Err(ReadError::Incomplete) => {
                if let Step::NeedMore = ch.try_fill()? {
                    return Ok(Step::NeedMore);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn packet(status: u8, payload: &[u8]) -> Vec<u8> {
        let len = (8 + payload.len()) as u16;
        let mut out = vec![0x04, status];
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0, 0, 1, 0]);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn retries_across_packets_without_consuming() {
        let mut ch = Channel::new();
        ch.feed(&packet(0, &[0x01, 0x02]));
        let read = |r: &mut Reader<'_>| Ok::<_, ReadError>(r.read_u32_le()?);

        assert_eq!(decode_from(&mut ch, read).unwrap(), Step::NeedMore);
        assert_eq!(ch.payload(), &[0x01, 0x02]);

        ch.feed(&packet(1, &[0x03, 0x04, 0x05]));
        assert_eq!(decode_from(&mut ch, read).unwrap(), Step::Ready(0x0403_0201));
        assert_eq!(ch.payload(), &[0x05]);
    }

    #[test]
    fn short_final_message_is_an_error() {
        let mut ch = Channel::new();
        ch.feed(&packet(1, &[0x01]));
        let err = decode_from(&mut ch, |r| Ok::<_, ReadError>(r.read_u16_le()?)).unwrap_err();
        assert!(err.is_fatal());
    }
}
