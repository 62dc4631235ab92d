//! # tds-codec
//!
//! Packet framing for TDS sessions.
//!
//! - [`TdsCodec`] splits a byte stream into packets and validates every
//!   header against the negotiated packet size before the payload is read.
//! - [`Channel`] is the sans-io core: it turns packets into one contiguous
//!   payload for the token layer, cuts outgoing messages into numbered
//!   packets and tracks attention state.
//! - [`ChannelPool`] hands channels to logical operations and takes back
//!   only the quiescent ones.
//! - [`Connection`] drives a channel over any `AsyncRead + AsyncWrite`
//!   transport, with a [`CancelHandle`] for attention from another task.
//!   [`BlockingConnection`] does the same over `std::io::Read + Write`.
//!
//! ```text
//! transport → TdsCodec → Channel → token stream
//! ```
//!
//! ```rust
//! use tds_codec::Channel;
//! use tds_protocol::packet::PacketType;
//!
//! let mut channel = Channel::new();
//! channel.write_message(PacketType::SqlBatch, &[0u8; 5000]).unwrap();
//! assert_eq!(channel.take_packets().count(), 2);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod blocking;
pub mod channel;
pub mod connection;
pub mod error;
pub mod packet_codec;
pub mod pool;

pub use blocking::BlockingConnection;
pub use channel::Channel;
pub use connection::{CancelHandle, Connection};
pub use error::CodecError;
pub use packet_codec::{Packet, TdsCodec};
pub use pool::{ChannelPool, PoolStatus, PooledChannel};
