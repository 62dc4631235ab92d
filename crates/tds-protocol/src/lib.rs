//! # tds-protocol
//!
//! IO-agnostic implementation of the TDS (Tabular Data Stream) wire format
//! as seen from the client side.
//!
//! The crate holds everything that can be expressed as "bytes in, typed
//! structure out" or the reverse:
//!
//! - packet headers and their validation ([`packet`])
//! - protocol tiers and the features they gate ([`version`])
//! - the token table, length classes and non-row token decoders ([`token`])
//! - TYPE_INFO, column metadata, collations and column-encryption metadata
//!   ([`metadata`], [`collation`], [`crypto`])
//! - PRELOGIN, LOGIN7, SQL batch and transaction manager requests
//!
//! ## Resumable decoding
//!
//! Every decoder reads through [`wire::Reader`]. Running out of input is not
//! an error: [`wire::try_decode`] reports it as [`Step::NeedMore`] and the
//! caller retries the same decode once more bytes have arrived. Nothing is
//! consumed on `NeedMore`.
//!
//! ```rust
//! use tds_protocol::token::{DecodeContext, Token, TokenType};
//! use tds_protocol::version::ProtocolTier;
//! use tds_protocol::wire::{try_decode, Step};
//!
//! let ctx = DecodeContext::new(ProtocolTier::Denali);
//! let done = [0x10, 0x00, 0xC1, 0x00, 0x05, 0, 0, 0, 0, 0, 0, 0];
//!
//! let partial = try_decode(&done[..4], |r| Token::decode(TokenType::Done, r, &ctx)).unwrap();
//! assert!(matches!(partial, Step::NeedMore));
//!
//! let full = try_decode(&done, |r| Token::decode(TokenType::Done, r, &ctx)).unwrap();
//! assert!(full.is_ready());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod codec;
pub mod collation;
pub mod crypto;
pub mod error;
pub mod login7;
pub mod metadata;
pub mod packet;
pub mod prelogin;
pub mod sql_batch;
pub mod token;
pub mod txn;
pub mod types;
pub mod version;
pub mod wire;

pub use collation::Collation;
pub use crypto::{CekTable, CryptoMetadata, EncryptionType};
pub use error::ProtocolError;
pub use login7::{FeatureExtension, Login7};
pub use metadata::{ColMetaData, ColumnDescriptor, ReturnValueHeader, TypeInfo};
pub use packet::{
    DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE, PACKET_HEADER_SIZE, PacketHeader, PacketStatus,
    PacketType,
};
pub use prelogin::{EncryptionLevel, EncryptionMode, PreLogin, negotiate_encryption};
pub use sql_batch::{AllHeaders, SqlBatch};
pub use token::{
    DecodeContext, Done, DoneStatus, EnvChange, EnvChangeType, FeatureAck, FeatureId,
    ServerMessage, Token, TokenType,
};
pub use txn::{IsolationLevel, TmRequest};
pub use types::{ColumnFlags, LengthClass, TypeId};
pub use version::{ProtocolTier, TdsVersion};
pub use wire::{Reader, Step};
