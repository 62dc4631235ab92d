//! TDS packet codec for `tokio_util` framing.

use bytes::{BufMut, BytesMut};
use tds_protocol::packet::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;

/// A TDS packet with header and payload.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Packet header.
    pub header: PacketHeader,
    /// Packet payload (excluding header).
    pub payload: BytesMut,
}

impl Packet {
    /// Create a new packet with the given header and payload.
    #[must_use]
    pub fn new(header: PacketHeader, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    /// Get the total packet size including header.
    #[must_use]
    pub fn total_size(&self) -> usize {
        PACKET_HEADER_SIZE + self.payload.len()
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub fn is_end_of_message(&self) -> bool {
        self.header.is_end_of_message()
    }
}

/// TDS packet codec.
///
/// Decoding validates each header against the current maximum packet size
/// before any payload is handed out. Encoding fills in the length field and
/// keeps the sequence number the caller put in the header.
#[derive(Debug, Clone)]
pub struct TdsCodec {
    max_packet_size: usize,
}

impl TdsCodec {
    /// Codec accepting packets up to the default packet size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_packet_size: DEFAULT_PACKET_SIZE,
        }
    }

    /// Set the maximum packet size.
    #[must_use]
    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.set_max_packet_size(size);
        self
    }

    /// Change the maximum packet size in place.
    pub fn set_max_packet_size(&mut self, size: usize) {
        self.max_packet_size = size.min(MAX_PACKET_SIZE);
    }

    /// Current maximum packet size.
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

impl Default for TdsCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TdsCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        let header = PacketHeader::from_bytes(&src[..PACKET_HEADER_SIZE])?;
        header.validate(self.max_packet_size, None)?;

        let length = header.length as usize;
        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let mut packet_bytes = src.split_to(length);
        let payload = packet_bytes.split_off(PACKET_HEADER_SIZE);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length,
            packet_id = header.packet_id,
            is_eom = header.is_end_of_message(),
            "decoded TDS packet"
        );

        Ok(Some(Packet::new(header, payload)))
    }
}

impl Encoder<Packet> for TdsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let total_length = item.total_size();
        if total_length > self.max_packet_size {
            return Err(CodecError::PacketTooLarge {
                size: total_length,
                max: self.max_packet_size,
            });
        }

        dst.reserve(total_length);
        let mut header = item.header;
        header.length = total_length as u16;
        header.encode(dst);
        dst.put_slice(&item.payload);

        tracing::trace!(
            packet_type = ?header.packet_type,
            length = total_length,
            packet_id = header.packet_id,
            "encoded TDS packet"
        );

        Ok(())
    }
}
