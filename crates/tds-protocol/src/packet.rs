//! TDS packet header definitions.

use bitflags::bitflags;
use bytes::BufMut;

use crate::error::ProtocolError;
use crate::wire::{Reader, WireResult};

/// TDS packet header size in bytes.
pub const PACKET_HEADER_SIZE: usize = 8;

/// Largest packet the 16-bit length field can describe.
pub const MAX_PACKET_SIZE: usize = 65535;

/// Smallest packet size a session may negotiate.
pub const MIN_NEGOTIATED_PACKET_SIZE: usize = 512;

/// Largest packet size a session may negotiate.
pub const MAX_NEGOTIATED_PACKET_SIZE: usize = 32767;

/// Packet size used until the server announces another.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// TDS packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// SQL batch request.
    SqlBatch = 0x01,
    /// Pre-TDS7 login packet.
    PreTds7Login = 0x02,
    /// Remote procedure call.
    Rpc = 0x03,
    /// Tabular response.
    TabularResult = 0x04,
    /// Attention signal.
    Attention = 0x06,
    /// Bulk load data.
    BulkLoad = 0x07,
    /// Federated authentication token.
    FedAuthToken = 0x08,
    /// Transaction manager request.
    TransactionManager = 0x0E,
    /// TDS7+ login packet.
    Tds7Login = 0x10,
    /// SSPI authentication.
    Sspi = 0x11,
    /// Pre-login packet.
    PreLogin = 0x12,
}

impl PacketType {
    /// Create a packet type from a raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x01 => Ok(Self::SqlBatch),
            0x02 => Ok(Self::PreTds7Login),
            0x03 => Ok(Self::Rpc),
            0x04 => Ok(Self::TabularResult),
            0x06 => Ok(Self::Attention),
            0x07 => Ok(Self::BulkLoad),
            0x08 => Ok(Self::FedAuthToken),
            0x0E => Ok(Self::TransactionManager),
            0x10 => Ok(Self::Tds7Login),
            0x11 => Ok(Self::Sspi),
            0x12 => Ok(Self::PreLogin),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

bitflags! {
    /// TDS packet status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketStatus: u8 {
        /// Normal packet, more packets to follow.
        const NORMAL = 0x00;
        /// End of message (last packet).
        const END_OF_MESSAGE = 0x01;
        /// Receiver discards this message.
        const IGNORE_EVENT = 0x02;
        /// Reset the session before processing the request.
        const RESET_CONNECTION = 0x08;
        /// Reset the session but keep its transaction.
        const RESET_CONNECTION_KEEP_TRANSACTION = 0x10;
    }
}

/// TDS packet header.
///
/// Every TDS packet begins with an 8-byte header that describes
/// the packet type, status, and length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Type of packet.
    pub packet_type: PacketType,
    /// Status flags.
    pub status: PacketStatus,
    /// Total packet length including header (big-endian on the wire).
    pub length: u16,
    /// Channel id (the server process id, or a MARS session id).
    pub channel: u16,
    /// Packet sequence number, wrapping at 255.
    pub packet_id: u8,
    /// Reserved, always 0.
    pub window: u8,
}

impl PacketHeader {
    /// Create a new packet header.
    #[must_use]
    pub const fn new(packet_type: PacketType, status: PacketStatus, length: u16) -> Self {
        Self {
            packet_type,
            status,
            length,
            channel: 0,
            packet_id: 1,
            window: 0,
        }
    }

    /// Parse a packet header.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let bytes = r.read_bytes(PACKET_HEADER_SIZE)?;
        Ok(Self::from_bytes(bytes)?)
    }

    /// Parse a packet header from exactly [`PACKET_HEADER_SIZE`] bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < PACKET_HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                what: "packet header",
                needed: PACKET_HEADER_SIZE,
                available: bytes.len(),
            });
        }
        let packet_type = PacketType::from_u8(bytes[0])?;
        let status =
            PacketStatus::from_bits(bytes[1]).ok_or(ProtocolError::InvalidPacketStatus(bytes[1]))?;
        Ok(Self {
            packet_type,
            status,
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            channel: u16::from_be_bytes([bytes[4], bytes[5]]),
            packet_id: bytes[6],
            window: bytes[7],
        })
    }

    /// Check the announced length against the negotiated packet size and,
    /// when known, the channel the reader is bound to.
    pub fn validate(&self, max_size: usize, channel: Option<u16>) -> Result<(), ProtocolError> {
        let length = self.length as usize;
        if !(PACKET_HEADER_SIZE..=max_size).contains(&length) {
            return Err(ProtocolError::InvalidPacketLength {
                length,
                min: PACKET_HEADER_SIZE,
                max: max_size,
            });
        }
        match channel {
            Some(expected) if expected != self.channel => Err(ProtocolError::ChannelMismatch {
                expected,
                actual: self.channel,
            }),
            _ => Ok(()),
        }
    }

    /// Encode the packet header to bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.packet_type as u8);
        dst.put_u8(self.status.bits());
        dst.put_u16(self.length);
        dst.put_u16(self.channel);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.window);
    }

    /// Get the payload length (total length minus header).
    #[must_use]
    pub const fn payload_length(&self) -> usize {
        self.length.saturating_sub(PACKET_HEADER_SIZE as u16) as usize
    }

    /// Check if this is the last packet in a message.
    #[must_use]
    pub const fn is_end_of_message(&self) -> bool {
        self.status.contains(PacketStatus::END_OF_MESSAGE)
    }

    /// Set the packet ID (sequence number).
    #[must_use]
    pub const fn with_packet_id(mut self, id: u8) -> Self {
        self.packet_id = id;
        self
    }

    /// Set the channel id.
    #[must_use]
    pub const fn with_channel(mut self, channel: u16) -> Self {
        self.channel = channel;
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn header_layout_is_big_endian() {
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 0x0102)
            .with_channel(0x0304)
            .with_packet_id(7);
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &[0x01, 0x01, 0x01, 0x02, 0x03, 0x04, 0x07, 0x00]);
        assert_eq!(PacketHeader::from_bytes(&buf).unwrap(), header);
    }

    #[test]
    fn partial_header_needs_more() {
        let mut r = Reader::new(&[0x04, 0x01, 0x00]);
        assert_eq!(
            PacketHeader::decode(&mut r),
            Err(crate::wire::WireError::Incomplete)
        );
    }

    #[test]
    fn payload_length() {
        let header = PacketHeader::new(PacketType::SqlBatch, PacketStatus::END_OF_MESSAGE, 100);
        assert_eq!(header.payload_length(), 92);
    }

    #[test]
    fn validate_rejects_oversize_and_undersize() {
        let big = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 5000);
        assert!(matches!(
            big.validate(4096, None),
            Err(ProtocolError::InvalidPacketLength { length: 5000, .. })
        ));
        assert!(big.validate(8192, None).is_ok());

        let tiny = PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 4);
        assert!(tiny.validate(4096, None).is_err());
    }

    #[test]
    fn validate_checks_channel() {
        let header =
            PacketHeader::new(PacketType::TabularResult, PacketStatus::NORMAL, 100).with_channel(9);
        assert!(header.validate(4096, Some(9)).is_ok());
        assert_eq!(
            header.validate(4096, Some(3)),
            Err(ProtocolError::ChannelMismatch {
                expected: 3,
                actual: 9
            })
        );
    }

    #[test]
    fn unknown_status_bits_rejected() {
        let bytes = [0x04, 0x40, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(
            PacketHeader::from_bytes(&bytes),
            Err(ProtocolError::InvalidPacketStatus(0x40))
        );
    }

    #[test]
    fn packet_type_from_u8() {
        assert_eq!(PacketType::from_u8(0x0E).unwrap(), PacketType::TransactionManager);
        assert!(PacketType::from_u8(0xFF).is_err());
    }
}
