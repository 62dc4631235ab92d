//! Blocking transport binding for a [`Channel`].
//!
//! The same channel the async [`Connection`](crate::Connection) drives,
//! over a `std::io::Read + Write` transport. A read parks the calling
//! thread until bytes arrive; deadlines come from the transport itself
//! (for example `TcpStream::set_read_timeout`) and surface as
//! [`CodecError::is_timeout`] errors.

use std::io::{self, Read, Write};

use bytes::{Bytes, BytesMut};
use tds_protocol::packet::PacketType;
use tds_protocol::wire::Step;

use crate::channel::Channel;
use crate::error::CodecError;

const READ_CHUNK: usize = 8 * 1024;

/// A channel driven over a blocking transport.
#[derive(Debug)]
pub struct BlockingConnection<T> {
    transport: T,
    channel: Channel,
    out: BytesMut,
}

impl<T> BlockingConnection<T>
where
    T: Read + Write,
{
    /// Wrap a transport with a fresh channel at the default packet size.
    pub fn new(transport: T) -> Self {
        Self::with_channel(transport, Channel::new())
    }

    /// Wrap a transport around an existing channel.
    pub fn with_channel(transport: T, channel: Channel) -> Self {
        Self {
            transport,
            channel,
            out: BytesMut::new(),
        }
    }

    /// The channel carried by this connection.
    #[must_use]
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Mutable access to the channel.
    pub fn channel_mut(&mut self) -> &mut Channel {
        &mut self.channel
    }

    /// The transport, for adjusting its timeouts.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Apply a negotiated packet size.
    pub fn set_packet_size(&mut self, size: usize) -> Result<(), CodecError> {
        self.channel.set_packet_size(size)
    }

    /// Read until at least one more packet reached the channel.
    ///
    /// A timed-out read leaves the channel intact so the caller can send
    /// attention; end of stream and other failures break it.
    pub fn fill(&mut self) -> Result<(), CodecError> {
        loop {
            if let Step::Ready(()) = self.channel.try_fill()? {
                return Ok(());
            }
            let input = self.channel.input_mut();
            let start = input.len();
            input.resize(start + READ_CHUNK, 0);
            match self.transport.read(&mut input[start..]) {
                Ok(0) => {
                    input.truncate(start);
                    self.channel.mark_broken();
                    return Err(CodecError::ConnectionClosed);
                }
                Ok(n) => input.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => input.truncate(start),
                Err(e) => {
                    input.truncate(start);
                    let e = CodecError::Io(e);
                    if !e.is_timeout() {
                        self.channel.mark_broken();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Read until the current message is complete and take its payload.
    pub fn read_message(&mut self) -> Result<Bytes, CodecError> {
        while !self.channel.message_complete() {
            self.fill()?;
        }
        Ok(self.channel.take_payload())
    }

    /// Write every packet the channel has queued.
    pub fn flush(&mut self) -> Result<(), CodecError> {
        if !self.channel.has_output() {
            return Ok(());
        }
        self.out.clear();
        self.channel.encode_output(&mut self.out)?;
        let written = self
            .transport
            .write_all(&self.out)
            .and_then(|()| self.transport.flush());
        if let Err(e) = written {
            self.channel.mark_broken();
            return Err(e.into());
        }
        Ok(())
    }

    /// Queue and write a complete message.
    pub fn send_message(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), CodecError> {
        self.channel.write_message(packet_type, payload)?;
        self.flush()
    }

    /// Queue and write an attention signal.
    pub fn send_attention(&mut self) -> Result<(), CodecError> {
        self.channel.send_attention()?;
        self.flush()
    }

    /// Give back the transport.
    pub fn into_inner(self) -> T {
        self.transport
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Serves `input` a few bytes per read and records what is written.
    struct Trickle {
        input: Cursor<Vec<u8>>,
        step: usize,
        written: Vec<u8>,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.step);
            self.input.read(&mut buf[..n])
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn packet(status: u8, seq: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0x04, status];
        out.extend_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0, seq, 0]);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn message_arrives_in_small_reads() {
        let mut wire = packet(0x00, 1, b"hello ");
        wire.extend(packet(0x01, 2, b"world"));
        let transport = Trickle {
            input: Cursor::new(wire),
            step: 3,
            written: Vec::new(),
        };
        let mut conn = BlockingConnection::new(transport);
        assert_eq!(&conn.read_message().unwrap()[..], b"hello world");
    }

    #[test]
    fn end_of_stream_breaks_the_channel() {
        let transport = Trickle {
            input: Cursor::new(packet(0x00, 1, b"partial")),
            step: 64,
            written: Vec::new(),
        };
        let mut conn = BlockingConnection::new(transport);
        assert!(matches!(conn.read_message(), Err(CodecError::ConnectionClosed)));
        assert!(conn.channel().is_broken());
    }

    #[test]
    fn attention_is_an_empty_packet() {
        let transport = Trickle {
            input: Cursor::new(Vec::new()),
            step: 1,
            written: Vec::new(),
        };
        let mut conn = BlockingConnection::new(transport);
        conn.send_attention().unwrap();
        assert!(conn.channel().attention_pending());
        let written = conn.into_inner().written;
        assert_eq!(&written[..4], &[0x06, 0x01, 0x00, 0x08]);
        assert_eq!(written.len(), 8);
    }
}
