//! Async transport binding for a [`Channel`].
//!
//! The transport is split into read and write halves. The write half sits
//! behind a mutex shared with [`CancelHandle`], so an attention signal can
//! go out from another task while this one is blocked on a read.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tds_protocol::packet::{MAX_PACKET_SIZE, PacketHeader, PacketStatus, PacketType};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, Notify};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::channel::Channel;
use crate::error::CodecError;
use crate::packet_codec::{Packet, TdsCodec};

type PacketStream<T> = FramedRead<ReadHalf<T>, TdsCodec>;
type PacketSink<T> = Arc<Mutex<FramedWrite<WriteHalf<T>, TdsCodec>>>;

#[derive(Debug, Default)]
struct CancelState {
    requested: AtomicBool,
    acknowledged: Notify,
}

/// A channel driven over an async transport.
pub struct Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    reader: PacketStream<T>,
    writer: PacketSink<T>,
    channel: Channel,
    cancel: Arc<CancelState>,
}

impl<T> Connection<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a transport with a fresh channel at the default packet size.
    pub fn new(transport: T) -> Self {
        Self::with_channel(transport, Channel::new())
    }

    /// Wrap a transport around an existing channel.
    pub fn with_channel(transport: T, channel: Channel) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        let read_codec = TdsCodec::new().with_max_packet_size(channel.packet_size());
        // Outgoing packets are already cut by the channel.
        let write_codec = TdsCodec::new().with_max_packet_size(MAX_PACKET_SIZE);

        Self {
            reader: FramedRead::new(read_half, read_codec),
            writer: Arc::new(Mutex::new(FramedWrite::new(write_half, write_codec))),
            channel,
            cancel: Arc::new(CancelState::default()),
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

    /// Apply a negotiated packet size to both directions.
    pub fn set_packet_size(&mut self, size: usize) -> Result<(), CodecError> {
        self.channel.set_packet_size(size)?;
        self.reader.decoder_mut().set_max_packet_size(size);
        Ok(())
    }

    /// Handle for cancelling from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle {
            writer: Arc::clone(&self.writer),
            cancel: Arc::clone(&self.cancel),
        }
    }

    /// Whether an attention awaits its acknowledgment.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.cancel.requested.load(Ordering::Acquire) || self.channel.attention_pending()
    }

    /// Read one packet into the channel payload.
    ///
    /// End of stream is fatal whether or not a message was in flight.
    pub async fn fill(&mut self) -> Result<(), CodecError> {
        self.sync_cancel();
        match self.reader.next().await {
            Some(Ok(packet)) => {
                // An attention sent while this read was parked applies to
                // what arrives now.
                self.sync_cancel();
                self.channel.accept_packet(packet)
            }
            Some(Err(e)) => {
                self.channel.mark_broken();
                Err(e)
            }
            None => {
                self.channel.mark_broken();
                Err(CodecError::ConnectionClosed)
            }
        }
    }

    /// Read until the current message is complete and take its payload.
    pub async fn read_message(&mut self) -> Result<Bytes, CodecError> {
        while !self.channel.message_complete() {
            self.fill().await?;
        }
        Ok(self.channel.take_payload())
    }

    /// Write every packet the channel has queued.
    pub async fn flush(&mut self) -> Result<(), CodecError> {
        let packets: Vec<Packet> = self.channel.take_packets().collect();
        if packets.is_empty() {
            return Ok(());
        }
        let mut writer = self.writer.lock().await;
        for packet in packets {
            writer.feed(packet).await?;
        }
        writer.flush().await
    }

    /// Queue and write a complete message.
    pub async fn send_message(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<(), CodecError> {
        self.channel.write_message(packet_type, payload)?;
        self.flush().await
    }

    /// Signal attention from the task that owns the connection.
    pub async fn send_attention(&mut self) -> Result<(), CodecError> {
        self.channel.send_attention()?;
        self.cancel.requested.store(true, Ordering::Release);
        self.flush().await
    }

    /// The server acknowledged the attention.
    pub fn attention_acknowledged(&mut self) {
        self.channel.acknowledge_attention();
        self.cancel.requested.store(false, Ordering::Release);
        self.cancel.acknowledged.notify_waiters();
    }

    fn sync_cancel(&mut self) {
        if self.cancel.requested.load(Ordering::Acquire) && !self.channel.attention_pending() {
            self.channel.mark_attention_sent();
        }
    }
}

impl<T> std::fmt::Debug for Connection<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("channel", &self.channel)
            .field("cancel_requested", &self.cancel.requested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Sends attention for a [`Connection`] from any task.
pub struct CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    writer: PacketSink<T>,
    cancel: Arc<CancelState>,
}

impl<T> CancelHandle<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Write an attention packet.
    ///
    /// The packet waits for any message the owner is writing to finish.
    /// A second call before the acknowledgment sends nothing.
    pub async fn cancel(&self) -> Result<(), CodecError> {
        if self.cancel.requested.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::debug!("sending attention");

        let header = PacketHeader::new(PacketType::Attention, PacketStatus::END_OF_MESSAGE, 0);
        let mut writer = self.writer.lock().await;
        writer.send(Packet::new(header, BytesMut::new())).await
    }

    /// Wait until the server acknowledges the attention.
    pub async fn wait_cancelled(&self) {
        let notified = self.cancel.acknowledged.notified();
        if self.cancel.requested.load(Ordering::Acquire) {
            notified.await;
        }
    }

    /// Whether an attention is outstanding.
    #[must_use]
    pub fn is_cancelling(&self) -> bool {
        self.cancel.requested.load(Ordering::Acquire)
    }
}

impl<T> Clone for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn clone(&self) -> Self {
        Self {
            writer: Arc::clone(&self.writer),
            cancel: Arc::clone(&self.cancel),
        }
    }
}

impl<T> std::fmt::Debug for CancelHandle<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("requested", &self.cancel.requested.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn tabular(status: u8, id: u8, payload: &[u8]) -> Vec<u8> {
        let len = (8 + payload.len()) as u16;
        let mut buf = vec![0x04, status];
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&[0x00, 0x33, id, 0x00]);
        buf.extend_from_slice(payload);
        buf
    }

    #[tokio::test]
    async fn reads_message_across_packets() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);

        server.write_all(&tabular(0, 1, b"hel")).await.unwrap();
        server.write_all(&tabular(1, 2, b"lo")).await.unwrap();

        let msg = conn.read_message().await.unwrap();
        assert_eq!(&msg[..], b"hello");
    }

    #[tokio::test]
    async fn closed_transport_is_fatal() {
        let (client, server) = tokio::io::duplex(64);
        let mut conn = Connection::new(client);
        drop(server);

        let err = conn.read_message().await.unwrap_err();
        assert!(matches!(err, CodecError::ConnectionClosed));
        assert!(conn.channel().is_broken());
    }

    #[tokio::test]
    async fn request_reaches_server() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        conn.send_message(PacketType::SqlBatch, b"xy").await.unwrap();

        let mut buf = [0u8; 10];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x01, 0x01, 0x00, 0x0A, 0x00, 0x00, 0x01, 0x00, b'x', b'y']);
    }

    #[tokio::test]
    async fn cancel_handle_writes_attention_once() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut conn = Connection::new(client);
        let handle = conn.cancel_handle();

        handle.cancel().await.unwrap();
        handle.cancel().await.unwrap();
        assert!(conn.is_cancelling());

        let mut buf = [0u8; 8];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x06, 0x01, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00]);

        server.write_all(&tabular(1, 1, &[0xFD])).await.unwrap();
        conn.fill().await.unwrap();
        assert!(conn.channel().attention_pending());

        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_cancelled().await }
        });
        tokio::task::yield_now().await;
        conn.attention_acknowledged();
        waiter.await.unwrap();
        assert!(!handle.is_cancelling());
    }

    #[tokio::test]
    async fn oversized_packet_breaks_the_channel() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut conn = Connection::new(client);

        server.write_all(&tabular(1, 1, &vec![7; 6000])).await.unwrap();
        assert!(conn.read_message().await.is_err());
        assert!(conn.channel().is_broken());
    }

    #[tokio::test]
    async fn packet_size_applies_to_reads() {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        let mut conn = Connection::new(client);

        server.write_all(&tabular(1, 1, &vec![7; 6000])).await.unwrap();
        conn.set_packet_size(8192).unwrap();
        let msg = conn.read_message().await.unwrap();
        assert_eq!(msg.len(), 6000);
    }
}
