//! Sans-io message channel.
//!
//! A [`Channel`] sits between raw transport bytes and the token layer. On
//! the way in it strips packet headers and exposes one contiguous payload
//! buffer; on the way out it cuts a message into packets no larger than the
//! negotiated packet size and numbers them.
//!
//! Incoming packets are decoded lazily, one at a time, only when the token
//! layer asks for more bytes. A packet-size change applied between two
//! packets therefore governs the next packet even when the change arrives
//! in the middle of a message.
//!
//! ```text
//!  transport ──feed──► input ──try_fill──► payload ──► token decoder
//!  transport ◄─take_packets── output ◄──write_*── request encoder
//! ```

use std::collections::VecDeque;
use std::collections::vec_deque::Drain;

use bytes::{Buf, Bytes, BytesMut};
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_NEGOTIATED_PACKET_SIZE, MIN_NEGOTIATED_PACKET_SIZE,
    PACKET_HEADER_SIZE, PacketHeader, PacketStatus, PacketType,
};
use tds_protocol::wire::Step;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::CodecError;
use crate::packet_codec::{Packet, TdsCodec};

#[derive(Debug)]
struct Outgoing {
    packet_type: PacketType,
    first_status: PacketStatus,
    sent_first: bool,
    buf: BytesMut,
}

/// One logical request/response stream over a transport.
#[derive(Debug)]
pub struct Channel {
    id: u16,
    codec: TdsCodec,
    bound_channel: Option<u16>,
    input: BytesMut,
    payload: BytesMut,
    incoming_type: Option<PacketType>,
    message_complete: bool,
    outgoing: Option<Outgoing>,
    output: VecDeque<Packet>,
    packet_id: u8,
    attention_pending: bool,
    open_results: u32,
    scratch: BytesMut,
    broken: bool,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    /// Channel 0 at the default packet size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: 0,
            codec: TdsCodec::new(),
            bound_channel: None,
            input: BytesMut::with_capacity(DEFAULT_PACKET_SIZE),
            payload: BytesMut::with_capacity(DEFAULT_PACKET_SIZE),
            incoming_type: None,
            message_complete: false,
            outgoing: None,
            output: VecDeque::new(),
            packet_id: 1,
            attention_pending: false,
            open_results: 0,
            scratch: BytesMut::new(),
            broken: false,
        }
    }

    /// Channel with a session id and packet size.
    pub fn with_id(id: u16, packet_size: usize) -> Result<Self, CodecError> {
        let mut channel = Self::new();
        channel.id = id;
        channel.set_packet_size(packet_size)?;
        Ok(channel)
    }

    /// Session id of this channel.
    #[must_use]
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Negotiated packet size, header included.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.codec.max_packet_size()
    }

    /// Apply a new packet size.
    ///
    /// Takes effect for the next packet in both directions. Part of a
    /// message already buffered for output is re-cut at the new size.
    pub fn set_packet_size(&mut self, size: usize) -> Result<(), CodecError> {
        if !(MIN_NEGOTIATED_PACKET_SIZE..=MAX_NEGOTIATED_PACKET_SIZE).contains(&size) {
            return Err(CodecError::InvalidPacketSize(size));
        }
        let old = self.codec.max_packet_size();
        self.codec.set_max_packet_size(size);
        if old != size {
            tracing::debug!(channel = self.id, old, new = size, "packet size changed");
        }
        self.flush_full_packets();
        Ok(())
    }

    // ---- input ----------------------------------------------------------

    /// Append raw transport bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.input.extend_from_slice(bytes);
    }

    /// Raw input buffer, for reading straight from a transport.
    pub fn input_mut(&mut self) -> &mut BytesMut {
        &mut self.input
    }

    /// Decode one buffered packet into the payload.
    ///
    /// Returns `NeedMore` when the input does not yet hold a whole packet.
    /// Any framing error breaks the channel.
    pub fn try_fill(&mut self) -> Result<Step<()>, CodecError> {
        if self.broken {
            return Err(CodecError::Broken);
        }
        match self.codec.decode(&mut self.input) {
            Ok(Some(packet)) => self.accept_packet(packet).map(Step::Ready),
            Ok(None) => Ok(Step::NeedMore),
            Err(e) => {
                self.mark_broken();
                Err(e)
            }
        }
    }

    /// Append a packet already split off by a framed reader.
    ///
    /// The first packet binds the channel id; every later packet must carry
    /// the same one.
    pub fn accept_packet(&mut self, packet: Packet) -> Result<(), CodecError> {
        if self.broken {
            return Err(CodecError::Broken);
        }
        if let Err(e) = packet
            .header
            .validate(self.codec.max_packet_size(), self.bound_channel)
        {
            self.mark_broken();
            return Err(e.into());
        }
        self.bound_channel.get_or_insert(packet.header.channel);

        if self.message_complete || self.incoming_type.is_none() {
            self.incoming_type = Some(packet.header.packet_type);
            self.message_complete = false;
        }
        self.message_complete = packet.is_end_of_message();
        self.payload.extend_from_slice(&packet.payload);

        tracing::trace!(
            channel = self.id,
            packet_id = packet.header.packet_id,
            len = packet.payload.len(),
            eom = self.message_complete,
            "packet accepted"
        );
        Ok(())
    }

    /// Unconsumed payload of the current message.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Drop `n` payload bytes the caller has decoded.
    pub fn consume(&mut self, n: usize) {
        self.payload.advance(n.min(self.payload.len()));
    }

    /// Take the whole buffered payload.
    pub fn take_payload(&mut self) -> Bytes {
        self.payload.split().freeze()
    }

    /// Packet type of the message being received.
    #[must_use]
    pub fn incoming_type(&self) -> Option<PacketType> {
        self.incoming_type
    }

    /// Whether the last packet of the current message has arrived.
    #[must_use]
    pub fn message_complete(&self) -> bool {
        self.message_complete
    }

    /// Whether a response is still being received or decoded.
    #[must_use]
    pub fn has_pending_data(&self) -> bool {
        !self.payload.is_empty() || (self.incoming_type.is_some() && !self.message_complete)
    }

    fn ensure(&mut self, n: usize) -> Result<bool, CodecError> {
        while self.payload.len() < n {
            if let Step::NeedMore = self.try_fill()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Look at the next payload byte without consuming it.
    pub fn try_peek_u8(&mut self) -> Result<Step<u8>, CodecError> {
        if self.ensure(1)? {
            Ok(Step::Ready(self.payload[0]))
        } else {
            Ok(Step::NeedMore)
        }
    }

    /// Read one payload byte, or nothing.
    pub fn try_read_u8(&mut self) -> Result<Step<u8>, CodecError> {
        if self.ensure(1)? {
            Ok(Step::Ready(self.payload.get_u8()))
        } else {
            Ok(Step::NeedMore)
        }
    }

    /// Read exactly `n` payload bytes, or nothing.
    pub fn try_read_bytes(&mut self, n: usize) -> Result<Step<Bytes>, CodecError> {
        if self.ensure(n)? {
            Ok(Step::Ready(self.payload.split_to(n).freeze()))
        } else {
            Ok(Step::NeedMore)
        }
    }

    // ---- output ---------------------------------------------------------

    /// Start writing a request message.
    pub fn begin_message(&mut self, packet_type: PacketType) -> Result<(), CodecError> {
        if self.broken {
            return Err(CodecError::Broken);
        }
        if let Some(out) = &self.outgoing {
            return Err(CodecError::MessageInProgress(packet_type_name(out.packet_type)));
        }
        self.packet_id = 1;
        self.incoming_type = None;
        self.message_complete = false;
        self.outgoing = Some(Outgoing {
            packet_type,
            first_status: PacketStatus::NORMAL,
            sent_first: false,
            buf: BytesMut::with_capacity(self.max_payload()),
        });
        Ok(())
    }

    /// Ask the server to reset the session before running this request.
    pub fn set_reset_connection(&mut self, keep_transaction: bool) -> Result<(), CodecError> {
        let out = self.outgoing.as_mut().ok_or(CodecError::NoMessage)?;
        out.first_status = if keep_transaction {
            PacketStatus::RESET_CONNECTION_KEEP_TRANSACTION
        } else {
            PacketStatus::RESET_CONNECTION
        };
        Ok(())
    }

    /// Append one byte to the message.
    pub fn write_u8(&mut self, byte: u8) -> Result<(), CodecError> {
        self.write_bytes(&[byte])
    }

    /// Append bytes to the message, emitting full packets as they fill.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        self.outgoing
            .as_mut()
            .ok_or(CodecError::NoMessage)?
            .buf
            .extend_from_slice(bytes);
        self.flush_full_packets();
        Ok(())
    }

    /// Finish the message; the last packet carries end-of-message.
    pub fn end_message(&mut self) -> Result<(), CodecError> {
        let mut out = self.outgoing.take().ok_or(CodecError::NoMessage)?;
        let data = out.buf.split();
        self.emit(&mut out, data, PacketStatus::END_OF_MESSAGE);
        tracing::trace!(
            channel = self.id,
            packet_type = ?out.packet_type,
            packets = self.output.len(),
            "message queued"
        );
        Ok(())
    }

    /// Queue a complete message.
    pub fn write_message(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), CodecError> {
        self.begin_message(packet_type)?;
        self.write_bytes(payload)?;
        self.end_message()
    }

    /// Whether a message is being written.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.outgoing.is_some()
    }

    /// Whether packets are queued for the transport.
    #[must_use]
    pub fn has_output(&self) -> bool {
        !self.output.is_empty()
    }

    /// Hand queued packets to the transport.
    pub fn take_packets(&mut self) -> Drain<'_, Packet> {
        self.output.drain(..)
    }

    /// Serialize queued packets into `dst`.
    pub fn encode_output(&mut self, dst: &mut BytesMut) -> Result<(), CodecError> {
        while let Some(packet) = self.output.pop_front() {
            self.codec.encode(packet, dst)?;
        }
        Ok(())
    }

    fn max_payload(&self) -> usize {
        self.codec.max_packet_size() - PACKET_HEADER_SIZE
    }

    fn flush_full_packets(&mut self) {
        let max = self.max_payload();
        let Some(mut out) = self.outgoing.take() else {
            return;
        };
        while out.buf.len() > max {
            let data = out.buf.split_to(max);
            self.emit(&mut out, data, PacketStatus::NORMAL);
        }
        self.outgoing = Some(out);
    }

    fn emit(&mut self, out: &mut Outgoing, data: BytesMut, mut status: PacketStatus) {
        if !out.sent_first {
            status |= out.first_status;
            out.sent_first = true;
        }
        let header = PacketHeader::new(out.packet_type, status, 0)
            .with_packet_id(self.packet_id);
        self.packet_id = match self.packet_id.wrapping_add(1) {
            0 => 1,
            id => id,
        };
        self.output.push_back(Packet::new(header, data));
    }

    // ---- attention ------------------------------------------------------

    /// Queue an attention signal.
    ///
    /// A partly written message is closed first with the ignore flag so the
    /// server discards it. Repeated calls while one is outstanding do
    /// nothing.
    pub fn send_attention(&mut self) -> Result<(), CodecError> {
        if self.broken {
            return Err(CodecError::Broken);
        }
        if self.attention_pending {
            return Ok(());
        }
        if let Some(mut out) = self.outgoing.take() {
            let data = out.buf.split();
            self.emit(
                &mut out,
                data,
                PacketStatus::END_OF_MESSAGE | PacketStatus::IGNORE_EVENT,
            );
            tracing::debug!(channel = self.id, "partial message abandoned");
        }
        let header = PacketHeader::new(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 0);
        self.output.push_back(Packet::new(header, BytesMut::new()));
        self.attention_pending = true;
        tracing::debug!(channel = self.id, "attention queued");
        Ok(())
    }

    /// Record an attention written outside this channel.
    pub fn mark_attention_sent(&mut self) {
        self.attention_pending = true;
    }

    /// Whether an attention awaits its acknowledgment.
    #[must_use]
    pub fn attention_pending(&self) -> bool {
        self.attention_pending
    }

    /// The server acknowledged the attention.
    pub fn acknowledge_attention(&mut self) {
        if self.attention_pending {
            tracing::debug!(channel = self.id, "attention acknowledged");
        }
        self.attention_pending = false;
        self.open_results = 0;
    }

    // ---- bookkeeping ----------------------------------------------------

    /// Reusable buffer, cleared on every call.
    pub fn scratch(&mut self) -> &mut BytesMut {
        self.scratch.clear();
        &mut self.scratch
    }

    /// Result sets started and not yet finished.
    #[must_use]
    pub fn open_results(&self) -> u32 {
        self.open_results
    }

    /// A result set started.
    pub fn result_opened(&mut self) {
        self.open_results += 1;
    }

    /// A result set finished.
    pub fn result_closed(&mut self) {
        self.open_results = self.open_results.saturating_sub(1);
    }

    /// Whether a fatal error has been seen.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Refuse all further traffic.
    pub fn mark_broken(&mut self) {
        if !self.broken {
            tracing::warn!(channel = self.id, "channel broken");
        }
        self.broken = true;
    }

    /// Forget per-request state before reuse.
    ///
    /// Keeps the packet size, the bound channel id and buffer capacity.
    pub fn reset(&mut self) {
        self.input.clear();
        self.payload.clear();
        self.incoming_type = None;
        self.message_complete = false;
        self.outgoing = None;
        self.output.clear();
        self.packet_id = 1;
        self.attention_pending = false;
        self.open_results = 0;
        self.scratch.clear();
    }
}

fn packet_type_name(packet_type: PacketType) -> &'static str {
    match packet_type {
        PacketType::SqlBatch => "SQL batch",
        PacketType::PreTds7Login | PacketType::Tds7Login => "login",
        PacketType::Rpc => "RPC",
        PacketType::TabularResult => "tabular result",
        PacketType::Attention => "attention",
        PacketType::BulkLoad => "bulk load",
        PacketType::FedAuthToken => "federated auth",
        PacketType::TransactionManager => "transaction manager",
        PacketType::Sspi => "SSPI",
        PacketType::PreLogin => "prelogin",
    }
}
