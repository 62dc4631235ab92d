//! TDS token definitions and the decoders for tokens that carry no row
//! values.
//!
//! A response message is a sequence of tokens, each a 1-byte token id
//! followed by a body whose length is either implied by the id, carried in
//! a 1/2/4-byte prefix, or self-describing. [`TokenType::length_class`]
//! captures that rule. ROW, NBCROW and RETURNVALUE carry typed values and
//! are decoded by the value layer on top of [`crate::metadata`].
//!
//! All decoders read through a [`Reader`] and are safe to retry: on
//! [`WireError::Incomplete`](crate::wire::WireError::Incomplete) nothing is
//! consumed from the caller's point of view.

use bitflags::bitflags;
use bytes::{BufMut, Bytes};

use crate::codec::{utf16_byte_len, write_b_varchar, write_us_varchar, write_utf16_string};
use crate::error::ProtocolError;
use crate::metadata::ColMetaData;
use crate::version::{ProtocolTier, TdsVersion};
use crate::wire::{Reader, WireResult};

/// Token type identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenType {
    /// Offset (OFFSET).
    Offset = 0x78,
    /// Return status (RETURNSTATUS).
    ReturnStatus = 0x79,
    /// Column metadata (COLMETADATA).
    ColMetaData = 0x81,
    /// Table name (TABNAME).
    TabName = 0xA4,
    /// Column info (COLINFO).
    ColInfo = 0xA5,
    /// Order (ORDER).
    Order = 0xA9,
    /// Error message (ERROR).
    Error = 0xAA,
    /// Informational message (INFO).
    Info = 0xAB,
    /// Return value (RETURNVALUE).
    ReturnValue = 0xAC,
    /// Login acknowledgment (LOGINACK).
    LoginAck = 0xAD,
    /// Feature extension acknowledgment (FEATUREEXTACK).
    FeatureExtAck = 0xAE,
    /// Row data (ROW).
    Row = 0xD1,
    /// Null bitmap compressed row (NBCROW).
    NbcRow = 0xD2,
    /// Environment change (ENVCHANGE).
    EnvChange = 0xE3,
    /// Session state (SESSIONSTATE).
    SessionState = 0xE4,
    /// SSPI authentication (SSPI).
    Sspi = 0xED,
    /// Federated authentication info (FEDAUTHINFO).
    FedAuthInfo = 0xEE,
    /// Done (DONE).
    Done = 0xFD,
    /// Done procedure (DONEPROC).
    DoneProc = 0xFE,
    /// Done in procedure (DONEINPROC).
    DoneInProc = 0xFF,
}

/// How a token's body length is determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenLength {
    /// No body.
    Zero,
    /// Body of a fixed size.
    Fixed(usize),
    /// 1-byte length prefix.
    Byte,
    /// 2-byte length prefix.
    UShort,
    /// 4-byte length prefix.
    Long,
    /// The body describes its own extent (metadata, rows, return values).
    SelfDescribing,
}

/// Tokens whose body always carries a 4-byte length, whatever the id bits
/// say.
pub const FOUR_BYTE_LENGTH_TOKENS: [TokenType; 3] = [
    TokenType::FeatureExtAck,
    TokenType::SessionState,
    TokenType::FedAuthInfo,
];

impl TokenType {
    /// Create a token type from a raw byte. Unknown ids are fatal.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x78 => Self::Offset,
            0x79 => Self::ReturnStatus,
            0x81 => Self::ColMetaData,
            0xA4 => Self::TabName,
            0xA5 => Self::ColInfo,
            0xA9 => Self::Order,
            0xAA => Self::Error,
            0xAB => Self::Info,
            0xAC => Self::ReturnValue,
            0xAD => Self::LoginAck,
            0xAE => Self::FeatureExtAck,
            0xD1 => Self::Row,
            0xD2 => Self::NbcRow,
            0xE3 => Self::EnvChange,
            0xE4 => Self::SessionState,
            0xED => Self::Sspi,
            0xEE => Self::FedAuthInfo,
            0xFD => Self::Done,
            0xFE => Self::DoneProc,
            0xFF => Self::DoneInProc,
            _ => return Err(ProtocolError::InvalidTokenType(value)),
        })
    }

    /// Protocol name of the token.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Offset => "OFFSET",
            Self::ReturnStatus => "RETURNSTATUS",
            Self::ColMetaData => "COLMETADATA",
            Self::TabName => "TABNAME",
            Self::ColInfo => "COLINFO",
            Self::Order => "ORDER",
            Self::Error => "ERROR",
            Self::Info => "INFO",
            Self::ReturnValue => "RETURNVALUE",
            Self::LoginAck => "LOGINACK",
            Self::FeatureExtAck => "FEATUREEXTACK",
            Self::Row => "ROW",
            Self::NbcRow => "NBCROW",
            Self::EnvChange => "ENVCHANGE",
            Self::SessionState => "SESSIONSTATE",
            Self::Sspi => "SSPI",
            Self::FedAuthInfo => "FEDAUTHINFO",
            Self::Done => "DONE",
            Self::DoneProc => "DONEPROC",
            Self::DoneInProc => "DONEINPROC",
        }
    }

    /// Whether this is one of the DONE family.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Done | Self::DoneProc | Self::DoneInProc)
    }

    /// Whether the body carries typed values.
    #[must_use]
    pub const fn carries_values(self) -> bool {
        matches!(self, Self::Row | Self::NbcRow | Self::ReturnValue)
    }

    /// Length class of this token at `tier`.
    #[must_use]
    pub fn length_class(self, tier: ProtocolTier) -> TokenLength {
        if FOUR_BYTE_LENGTH_TOKENS.contains(&self) {
            return TokenLength::Long;
        }
        match self {
            Self::ColMetaData | Self::Row | Self::NbcRow | Self::ReturnValue => {
                TokenLength::SelfDescribing
            }
            Self::Done | Self::DoneProc | Self::DoneInProc if tier.has_long_row_count() => {
                TokenLength::Fixed(12)
            }
            _ => length_from_token_bits(self as u8),
        }
    }
}

/// The generic rule that derives a length class from token id bits.
#[must_use]
pub const fn length_from_token_bits(token: u8) -> TokenLength {
    match token & 0x30 {
        0x30 => TokenLength::Fixed(1 << ((token & 0x0C) >> 2)),
        0x10 => TokenLength::Zero,
        _ => {
            if token & 0x80 != 0 {
                TokenLength::UShort
            } else if token & 0x0C == 0 {
                TokenLength::Long
            } else {
                TokenLength::Byte
            }
        }
    }
}

/// Read the body length of a token whose class carries one.
///
/// Returns `None` for self-describing bodies and for FEATUREEXTACK, whose
/// entries are delimited by their own lengths and a terminator.
pub fn read_token_length(
    r: &mut Reader<'_>,
    token: TokenType,
    tier: ProtocolTier,
) -> WireResult<Option<usize>> {
    if token == TokenType::FeatureExtAck {
        return Ok(None);
    }
    Ok(match token.length_class(tier) {
        TokenLength::Zero => Some(0),
        TokenLength::Fixed(n) => Some(n),
        TokenLength::Byte => Some(r.read_u8()? as usize),
        TokenLength::UShort => Some(r.read_u16_le()? as usize),
        TokenLength::Long => Some(r.read_u32_le()? as usize),
        TokenLength::SelfDescribing => None,
    })
}

/// Stream state that changes how tokens are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    /// Negotiated protocol tier.
    pub tier: ProtocolTier,
    /// The session is still inside the login exchange.
    pub login_phase: bool,
    /// Column encryption was acknowledged by the server.
    pub column_encryption: bool,
}

impl DecodeContext {
    /// Context for a session at `tier`, after login.
    #[must_use]
    pub const fn new(tier: ProtocolTier) -> Self {
        Self {
            tier,
            login_phase: false,
            column_encryption: false,
        }
    }

    /// Legacy servers may append a high word to DONE row counts and ERROR
    /// line numbers while the login is in progress.
    #[must_use]
    pub fn legacy_read_ahead(&self) -> bool {
        self.login_phase && !self.tier.has_long_row_count()
    }
}

/// Non-value token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Column metadata describing a result set.
    ColMetaData(ColMetaData),
    /// End of a statement.
    Done(Done),
    /// End of a stored procedure.
    DoneProc(Done),
    /// End of a statement inside a stored procedure.
    DoneInProc(Done),
    /// Server error.
    Error(ServerMessage),
    /// Server informational message.
    Info(ServerMessage),
    /// Login acknowledgment.
    LoginAck(LoginAck),
    /// One or more environment changes.
    EnvChange(Vec<EnvChange>),
    /// Feature extension acknowledgments.
    FeatureExtAck(Vec<FeatureAck>),
    /// Federated authentication endpoints.
    FedAuthInfo(FedAuthInfo),
    /// Session state delta.
    SessionState(SessionStateToken),
    /// SSPI negotiation blob.
    Sspi(Bytes),
    /// Ordered column numbers.
    Order(Vec<u16>),
    /// Source table names.
    TabName(Vec<Vec<String>>),
    /// Browse-mode column information.
    ColInfo(Vec<ColInfo>),
    /// Stored procedure return status.
    ReturnStatus(i32),
    /// Legacy keyword offset.
    Offset {
        /// Keyword identifier.
        identifier: u16,
        /// Offset in the batch text.
        offset: u16,
    },
}

impl Token {
    /// Decode a token body, the token id already consumed.
    pub fn decode(
        token: TokenType,
        r: &mut Reader<'_>,
        ctx: &DecodeContext,
    ) -> WireResult<Self> {
        Ok(match token {
            TokenType::ColMetaData => {
                Self::ColMetaData(ColMetaData::decode(r, ctx.tier, ctx.column_encryption)?)
            }
            TokenType::Done => Self::Done(Done::decode(r, ctx)?),
            TokenType::DoneProc => Self::DoneProc(Done::decode(r, ctx)?),
            TokenType::DoneInProc => Self::DoneInProc(Done::decode(r, ctx)?),
            TokenType::Error => Self::Error(ServerMessage::decode(r, ctx)?),
            TokenType::Info => Self::Info(ServerMessage::decode(r, ctx)?),
            TokenType::LoginAck => Self::LoginAck(LoginAck::decode(r)?),
            TokenType::EnvChange => Self::EnvChange(EnvChange::decode_token(r)?),
            TokenType::FeatureExtAck => Self::FeatureExtAck(FeatureAck::decode_token(r)?),
            TokenType::FedAuthInfo => Self::FedAuthInfo(FedAuthInfo::decode(r)?),
            TokenType::SessionState => Self::SessionState(SessionStateToken::decode(r)?),
            TokenType::Sspi => {
                let len = r.read_u16_le()? as usize;
                Self::Sspi(Bytes::copy_from_slice(r.read_bytes(len)?))
            }
            TokenType::Order => {
                let len = r.read_u16_le()? as usize;
                let mut body = r.sub(len)?;
                let mut columns = Vec::with_capacity(len / 2);
                while !body.is_empty() {
                    columns.push(body.read_u16_le()?);
                }
                Self::Order(columns)
            }
            TokenType::TabName => Self::TabName(decode_tab_name(r, ctx.tier)?),
            TokenType::ColInfo => Self::ColInfo(ColInfo::decode_token(r)?),
            TokenType::ReturnStatus => Self::ReturnStatus(r.read_i32_le()?),
            TokenType::Offset => Self::Offset {
                identifier: r.read_u16_le()?,
                offset: r.read_u16_le()?,
            },
            TokenType::Row | TokenType::NbcRow | TokenType::ReturnValue => {
                return Err(ProtocolError::UnexpectedToken {
                    token: token.name(),
                    context: "value-bearing token outside the row decoder",
                }
                .into());
            }
        })
    }
}

bitflags! {
    /// DONE status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DoneStatus: u16 {
        /// More results follow in this message.
        const MORE = 0x0001;
        /// The statement failed.
        const ERROR = 0x0002;
        /// A transaction is open.
        const IN_XACT = 0x0004;
        /// The row count is valid.
        const COUNT = 0x0010;
        /// Acknowledges an attention.
        const ATTN = 0x0020;
        /// A server error terminated the statement.
        const SRVERROR = 0x0100;
    }
}

/// DONE, DONEPROC or DONEINPROC body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Done {
    /// Status flags.
    pub status: DoneStatus,
    /// Current command.
    pub cur_cmd: u16,
    /// Row count (meaningful when [`DoneStatus::COUNT`] is set).
    pub row_count: u64,
}

impl Done {
    /// Decode a DONE-family body.
    ///
    /// Legacy tiers send a 4-byte row count. During login some very old
    /// servers sent 8 bytes anyway; a zero byte where the next token id
    /// should be marks the high half.
    pub fn decode(r: &mut Reader<'_>, ctx: &DecodeContext) -> WireResult<Self> {
        let status = DoneStatus::from_bits_retain(r.read_u16_le()?);
        let cur_cmd = r.read_u16_le()?;
        let row_count = if ctx.tier.has_long_row_count() {
            r.read_u64_le()?
        } else {
            let low = u64::from(r.read_u32_le()?);
            if ctx.legacy_read_ahead() && r.peek_u8_opt()? == Some(0) {
                low | (u64::from(r.read_u32_le()?) << 32)
            } else {
                low
            }
        };
        Ok(Self {
            status,
            cur_cmd,
            row_count,
        })
    }

    /// Encode with the token id, using the row count width of `tier`.
    pub fn encode(&self, token: TokenType, tier: ProtocolTier, dst: &mut impl BufMut) {
        dst.put_u8(token as u8);
        dst.put_u16_le(self.status.bits());
        dst.put_u16_le(self.cur_cmd);
        if tier.has_long_row_count() {
            dst.put_u64_le(self.row_count);
        } else {
            dst.put_u32_le(self.row_count as u32);
        }
    }

    /// More results follow.
    #[must_use]
    pub const fn has_more(&self) -> bool {
        self.status.contains(DoneStatus::MORE)
    }

    /// This DONE acknowledges an attention.
    #[must_use]
    pub const fn is_attention_ack(&self) -> bool {
        self.status.contains(DoneStatus::ATTN)
    }

    /// Row count when the server marked it valid.
    #[must_use]
    pub const fn rows(&self) -> Option<u64> {
        if self.status.contains(DoneStatus::COUNT) {
            Some(self.row_count)
        } else {
            None
        }
    }
}

/// Highest class reported as an informational message.
pub const MAX_INFO_CLASS: u8 = 10;

/// Lowest class that is fatal to the session.
pub const FATAL_CLASS: u8 = 20;

/// ERROR or INFO body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Message number.
    pub number: i32,
    /// State.
    pub state: u8,
    /// Severity class.
    pub class: u8,
    /// Message text.
    pub message: String,
    /// Server name.
    pub server: String,
    /// Procedure name.
    pub procedure: String,
    /// Line number.
    pub line: i32,
}

impl ServerMessage {
    /// Decode an ERROR/INFO body.
    pub fn decode(r: &mut Reader<'_>, ctx: &DecodeContext) -> WireResult<Self> {
        let len = r.read_u16_le()? as usize;
        let mut body = r.sub(len)?;
        let number = body.read_i32_le()?;
        let state = body.read_u8()?;
        let class = body.read_u8()?;
        let message = body.read_us_varchar()?;
        let server = body.read_b_varchar()?;
        let procedure = body.read_b_varchar()?;
        let line = if ctx.tier.has_long_row_count() {
            body.read_i32_le()?
        } else {
            let low = i32::from(body.read_u16_le()?);
            if ctx.legacy_read_ahead() && r.peek_u8_opt()? == Some(0) {
                low | (i32::from(r.read_u16_le()?) << 16)
            } else {
                low
            }
        };
        Ok(Self {
            number,
            state,
            class,
            message,
            server,
            procedure,
            line,
        })
    }

    /// Encode as an ERROR or INFO token (4-byte line number).
    pub fn encode(&self, token: TokenType, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let len = 4
            + 1
            + 1
            + 2
            + utf16_byte_len(&self.message)
            + 1
            + utf16_byte_len(&self.server)
            + 1
            + utf16_byte_len(&self.procedure)
            + 4;
        dst.put_u8(token as u8);
        dst.put_u16_le(u16::try_from(len).map_err(|_| ProtocolError::FieldTooLong {
            field: "server message",
            len,
            max: u16::MAX as usize,
        })?);
        dst.put_i32_le(self.number);
        dst.put_u8(self.state);
        dst.put_u8(self.class);
        write_us_varchar(dst, &self.message)?;
        write_b_varchar(dst, &self.server)?;
        write_b_varchar(dst, &self.procedure)?;
        dst.put_i32_le(self.line);
        Ok(())
    }

    /// Class at or below [`MAX_INFO_CLASS`].
    #[must_use]
    pub const fn is_info(&self) -> bool {
        self.class <= MAX_INFO_CLASS
    }

    /// Class at or above [`FATAL_CLASS`].
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        self.class >= FATAL_CLASS
    }
}

/// LOGINACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginAck {
    /// Interface type (1 = SQL).
    pub interface: u8,
    /// Negotiated TDS version (big-endian on the wire).
    pub version: TdsVersion,
    /// Server program name.
    pub prog_name: String,
    /// Server program version: major, minor, build high, build low.
    pub prog_version: [u8; 4],
}

impl LoginAck {
    /// Decode a LOGINACK body.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let len = r.read_u16_le()? as usize;
        let mut body = r.sub(len)?;
        let interface = body.read_u8()?;
        let version = TdsVersion::new(body.read_u32_be()?);
        let prog_name = body.read_b_varchar()?;
        let mut prog_version = [0u8; 4];
        prog_version.copy_from_slice(body.read_bytes(4)?);
        Ok(Self {
            interface,
            version,
            prog_name,
            prog_version,
        })
    }

    /// Encode as a LOGINACK token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let len = 1 + 4 + 1 + utf16_byte_len(&self.prog_name) + 4;
        dst.put_u8(TokenType::LoginAck as u8);
        dst.put_u16_le(len as u16);
        dst.put_u8(self.interface);
        dst.put_u32(self.version.raw());
        write_b_varchar(dst, &self.prog_name)?;
        dst.put_slice(&self.prog_version);
        Ok(())
    }

    /// Protocol tier of the negotiated version.
    pub fn tier(&self) -> Result<ProtocolTier, ProtocolError> {
        self.version.tier()
    }
}

/// Environment change kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EnvChangeType {
    /// Database changed.
    Database = 1,
    /// Language changed.
    Language = 2,
    /// Character set changed.
    CharacterSet = 3,
    /// Packet size changed.
    PacketSize = 4,
    /// Unicode sort LCID.
    UnicodeSortLocale = 5,
    /// Unicode comparison flags.
    UnicodeComparisonFlags = 6,
    /// Default collation.
    SqlCollation = 7,
    /// Transaction began.
    BeginTransaction = 8,
    /// Transaction committed.
    CommitTransaction = 9,
    /// Transaction rolled back.
    RollbackTransaction = 10,
    /// Enlisted in a DTC transaction.
    EnlistDtcTransaction = 11,
    /// Defected from a DTC transaction.
    DefectTransaction = 12,
    /// Database mirroring partner.
    LogShippingPartner = 13,
    /// Transaction promoted.
    PromoteTransaction = 15,
    /// Transaction manager address.
    TransactionManagerAddress = 16,
    /// Transaction ended.
    TransactionEnded = 17,
    /// Reset-connection acknowledgment.
    ResetConnectionAck = 18,
    /// User instance name.
    UserInstance = 19,
    /// Routing information.
    Routing = 20,
}

impl EnvChangeType {
    /// Create from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => Self::Database,
            2 => Self::Language,
            3 => Self::CharacterSet,
            4 => Self::PacketSize,
            5 => Self::UnicodeSortLocale,
            6 => Self::UnicodeComparisonFlags,
            7 => Self::SqlCollation,
            8 => Self::BeginTransaction,
            9 => Self::CommitTransaction,
            10 => Self::RollbackTransaction,
            11 => Self::EnlistDtcTransaction,
            12 => Self::DefectTransaction,
            13 => Self::LogShippingPartner,
            15 => Self::PromoteTransaction,
            16 => Self::TransactionManagerAddress,
            17 => Self::TransactionEnded,
            18 => Self::ResetConnectionAck,
            19 => Self::UserInstance,
            20 => Self::Routing,
            _ => {
                return Err(ProtocolError::InvalidField {
                    field: "env change type",
                    value: u64::from(value),
                });
            }
        })
    }
}

/// Routing target announced during login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routing {
    /// Transport protocol (0 = TCP).
    pub protocol: u8,
    /// Port.
    pub port: u16,
    /// Server name.
    pub server: String,
}

impl Routing {
    /// Only TCP targets with a port and a name are usable.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.protocol == 0 && self.port != 0 && !self.server.is_empty()
    }
}

/// Value carried by an environment change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// Absent.
    Empty,
    /// UTF-16 string.
    String(String),
    /// Binary blob.
    Binary(Bytes),
    /// Routing target.
    Routing(Routing),
}

impl EnvValue {
    /// String payload, if any.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Binary payload, if any.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(b) => Some(b),
            _ => None,
        }
    }
}

/// One environment change record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvChange {
    /// Change kind.
    pub kind: EnvChangeType,
    /// New value.
    pub new_value: EnvValue,
    /// Old value.
    pub old_value: EnvValue,
}

fn string_value(s: String) -> EnvValue {
    if s.is_empty() {
        EnvValue::Empty
    } else {
        EnvValue::String(s)
    }
}

fn binary_value(b: &[u8]) -> EnvValue {
    if b.is_empty() {
        EnvValue::Empty
    } else {
        EnvValue::Binary(Bytes::copy_from_slice(b))
    }
}

impl EnvChange {
    /// Decode an ENVCHANGE body: a length followed by one or more records.
    pub fn decode_token(r: &mut Reader<'_>) -> WireResult<Vec<Self>> {
        let len = r.read_u16_le()? as usize;
        let mut body = r.sub(len)?;
        let mut out = Vec::with_capacity(1);
        while !body.is_empty() {
            out.push(Self::decode(&mut body)?);
        }
        Ok(out)
    }

    /// Decode a single record.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let kind = EnvChangeType::from_u8(r.read_u8()?)?;
        let (new_value, old_value) = match kind {
            EnvChangeType::Database
            | EnvChangeType::Language
            | EnvChangeType::CharacterSet
            | EnvChangeType::PacketSize
            | EnvChangeType::UnicodeSortLocale
            | EnvChangeType::UnicodeComparisonFlags
            | EnvChangeType::UserInstance => (
                string_value(r.read_b_varchar()?),
                string_value(r.read_b_varchar()?),
            ),
            EnvChangeType::LogShippingPartner => {
                let new = string_value(r.read_b_varchar()?);
                r.skip(1)?;
                (new, EnvValue::Empty)
            }
            EnvChangeType::PromoteTransaction => {
                let len = r.read_u32_le()? as usize;
                let new = binary_value(r.read_bytes(len)?);
                r.skip(1)?;
                (new, EnvValue::Empty)
            }
            EnvChangeType::Routing => {
                let len = r.read_u16_le()? as usize;
                let mut value = r.sub(len)?;
                let protocol = value.read_u8()?;
                let port = value.read_u16_le()?;
                let server = value.read_us_varchar()?;
                let old_len = r.read_u16_le()? as usize;
                r.skip(old_len)?;
                (
                    EnvValue::Routing(Routing {
                        protocol,
                        port,
                        server,
                    }),
                    EnvValue::Empty,
                )
            }
            EnvChangeType::SqlCollation
            | EnvChangeType::BeginTransaction
            | EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::EnlistDtcTransaction
            | EnvChangeType::DefectTransaction
            | EnvChangeType::TransactionManagerAddress
            | EnvChangeType::TransactionEnded
            | EnvChangeType::ResetConnectionAck => (
                binary_value(r.read_b_varbyte()?),
                binary_value(r.read_b_varbyte()?),
            ),
        };
        Ok(Self {
            kind,
            new_value,
            old_value,
        })
    }

    /// Encode as a single-record ENVCHANGE token.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), ProtocolError> {
        let mut body = Vec::new();
        body.put_u8(self.kind as u8);
        match (&self.kind, &self.new_value) {
            (EnvChangeType::Routing, EnvValue::Routing(routing)) => {
                let value_len = 1 + 2 + 2 + utf16_byte_len(&routing.server);
                body.put_u16_le(value_len as u16);
                body.put_u8(routing.protocol);
                body.put_u16_le(routing.port);
                write_us_varchar(&mut body, &routing.server)?;
                body.put_u16_le(0);
            }
            (EnvChangeType::PromoteTransaction, value) => {
                let data = value.as_bytes().unwrap_or_default();
                body.put_u32_le(data.len() as u32);
                body.put_slice(data);
                body.put_u8(0);
            }
            (EnvChangeType::LogShippingPartner, value) => {
                write_b_varchar(&mut body, value.as_str().unwrap_or_default())?;
                body.put_u8(0);
            }
            _ => {
                for value in [&self.new_value, &self.old_value] {
                    match value {
                        EnvValue::String(s) => write_b_varchar(&mut body, s)?,
                        EnvValue::Binary(b) => {
                            let len = u8::try_from(b.len()).map_err(|_| {
                                ProtocolError::FieldTooLong {
                                    field: "env change value",
                                    len: b.len(),
                                    max: u8::MAX as usize,
                                }
                            })?;
                            body.put_u8(len);
                            body.put_slice(b);
                        }
                        EnvValue::Empty | EnvValue::Routing(_) => body.put_u8(0),
                    }
                }
            }
        }
        dst.put_u8(TokenType::EnvChange as u8);
        dst.put_u16_le(body.len() as u16);
        dst.put_slice(&body);
        Ok(())
    }
}

/// Feature extension ids shared by LOGIN7 and FEATUREEXTACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FeatureId {
    /// Session recovery.
    SessionRecovery = 0x01,
    /// Federated authentication.
    FedAuth = 0x02,
    /// Column encryption.
    ColumnEncryption = 0x04,
    /// Global transactions.
    GlobalTransactions = 0x05,
    /// UTF-8 collations.
    Utf8Support = 0x0A,
}

/// Terminator of feature extension lists.
pub const FEATURE_TERMINATOR: u8 = 0xFF;

impl FeatureId {
    /// Create from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x01 => Self::SessionRecovery,
            0x02 => Self::FedAuth,
            0x04 => Self::ColumnEncryption,
            0x05 => Self::GlobalTransactions,
            0x0A => Self::Utf8Support,
            _ => {
                return Err(ProtocolError::InvalidField {
                    field: "feature id",
                    value: u64::from(value),
                });
            }
        })
    }
}

/// One feature acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureAck {
    /// Raw feature id; validated against the request by the session.
    pub feature_id: u8,
    /// Feature data.
    pub data: Bytes,
}

impl FeatureAck {
    /// Decode a FEATUREEXTACK body up to and including the terminator.
    pub fn decode_token(r: &mut Reader<'_>) -> WireResult<Vec<Self>> {
        let mut acks = Vec::new();
        loop {
            let feature_id = r.read_u8()?;
            if feature_id == FEATURE_TERMINATOR {
                return Ok(acks);
            }
            let len = r.read_u32_le()? as usize;
            let data = Bytes::copy_from_slice(r.read_bytes(len)?);
            acks.push(Self { feature_id, data });
        }
    }

    /// Encode a FEATUREEXTACK token.
    pub fn encode_token(acks: &[Self], dst: &mut impl BufMut) {
        dst.put_u8(TokenType::FeatureExtAck as u8);
        for ack in acks {
            dst.put_u8(ack.feature_id);
            dst.put_u32_le(ack.data.len() as u32);
            dst.put_slice(&ack.data);
        }
        dst.put_u8(FEATURE_TERMINATOR);
    }
}

/// FEDAUTHINFO option id for the service principal name.
pub const FEDAUTH_INFO_SPN: u8 = 0x01;

/// FEDAUTHINFO option id for the token endpoint URL.
pub const FEDAUTH_INFO_STS_URL: u8 = 0x02;

/// Federated authentication endpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FedAuthInfo {
    /// Token service URL.
    pub sts_url: String,
    /// Service principal name.
    pub spn: String,
}

impl FedAuthInfo {
    /// Decode a FEDAUTHINFO body.
    ///
    /// The body is a count, then `(id, length, offset)` triples whose offsets
    /// point into the body itself.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let len = r.read_u32_le()? as usize;
        let data = r.read_bytes(len)?;
        let mut body = Reader::exact(data);
        let count = body.read_u32_le()? as usize;
        let table_end = 4 + count * 9;
        let mut sts_url = None;
        let mut spn = None;
        for _ in 0..count {
            let id = body.read_u8()?;
            let data_len = body.read_u32_le()? as usize;
            let offset = body.read_u32_le()? as usize;
            let end = offset.checked_add(data_len).unwrap_or(usize::MAX);
            if offset < table_end || end > data.len() {
                return Err(ProtocolError::InvalidField {
                    field: "fedauth info offset",
                    value: offset as u64,
                }
                .into());
            }
            let value = crate::codec::decode_utf16(&data[offset..end])?;
            match id {
                FEDAUTH_INFO_SPN => spn = Some(value),
                FEDAUTH_INFO_STS_URL => sts_url = Some(value),
                _ => {}
            }
        }
        Ok(Self {
            sts_url: sts_url.ok_or(ProtocolError::MissingFedAuthInfo("STS URL"))?,
            spn: spn.ok_or(ProtocolError::MissingFedAuthInfo("SPN"))?,
        })
    }

    /// Encode as a FEDAUTHINFO token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let table_end = 4 + 2 * 9;
        let spn_len = utf16_byte_len(&self.spn);
        let url_len = utf16_byte_len(&self.sts_url);
        dst.put_u8(TokenType::FedAuthInfo as u8);
        dst.put_u32_le((table_end + spn_len + url_len) as u32);
        dst.put_u32_le(2);
        dst.put_u8(FEDAUTH_INFO_SPN);
        dst.put_u32_le(spn_len as u32);
        dst.put_u32_le(table_end as u32);
        dst.put_u8(FEDAUTH_INFO_STS_URL);
        dst.put_u32_le(url_len as u32);
        dst.put_u32_le((table_end + spn_len) as u32);
        write_utf16_string(dst, &self.spn);
        write_utf16_string(dst, &self.sts_url);
    }
}

/// Read one `(id, length, data)` session state record, where the length is
/// a byte or 0xFF followed by a 4-byte length.
pub fn read_state_record(r: &mut Reader<'_>) -> WireResult<(u8, Bytes)> {
    let id = r.read_u8()?;
    let len = match r.read_u8()? {
        0xFF => r.read_u32_le()? as usize,
        n => n as usize,
    };
    Ok((id, Bytes::copy_from_slice(r.read_bytes(len)?)))
}

/// Write a session state record in the form [`read_state_record`] reads.
pub fn write_state_record(dst: &mut impl BufMut, id: u8, data: &[u8]) {
    dst.put_u8(id);
    if data.len() < 0xFF {
        dst.put_u8(data.len() as u8);
    } else {
        dst.put_u8(0xFF);
        dst.put_u32_le(data.len() as u32);
    }
    dst.put_slice(data);
}

/// SESSIONSTATE body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateToken {
    /// Sequence number; higher wins when merging.
    pub sequence: u32,
    /// Whether the state can be replayed on reconnect.
    pub recoverable: bool,
    /// `(state id, data)` records.
    pub records: Vec<(u8, Bytes)>,
}

impl SessionStateToken {
    /// Decode a SESSIONSTATE body.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let len = r.read_u32_le()? as usize;
        let mut body = r.sub(len)?;
        let sequence = body.read_u32_le()?;
        let recoverable = body.read_u8()? & 0x01 != 0;
        let mut records = Vec::new();
        while !body.is_empty() {
            records.push(read_state_record(&mut body)?);
        }
        Ok(Self {
            sequence,
            recoverable,
            records,
        })
    }

    /// Encode as a SESSIONSTATE token.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let mut body = Vec::new();
        body.put_u32_le(self.sequence);
        body.put_u8(u8::from(self.recoverable));
        for (id, data) in &self.records {
            write_state_record(&mut body, *id, data);
        }
        dst.put_u8(TokenType::SessionState as u8);
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
    }
}

/// COLINFO status: the column name differs from the base column.
pub const COLINFO_DIFFERENT_NAME: u8 = 0x20;

/// Browse-mode information for one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColInfo {
    /// Column number in the result set.
    pub column: u8,
    /// Index into the TABNAME list.
    pub table: u8,
    /// Status bits.
    pub status: u8,
    /// Base column name when it differs.
    pub base_name: Option<String>,
}

impl ColInfo {
    /// Decode a COLINFO body.
    pub fn decode_token(r: &mut Reader<'_>) -> WireResult<Vec<Self>> {
        let len = r.read_u16_le()? as usize;
        let mut body = r.sub(len)?;
        let mut out = Vec::new();
        while !body.is_empty() {
            let column = body.read_u8()?;
            let table = body.read_u8()?;
            let status = body.read_u8()?;
            let base_name = if status & COLINFO_DIFFERENT_NAME != 0 {
                Some(body.read_b_varchar()?)
            } else {
                None
            };
            out.push(Self {
                column,
                table,
                status,
                base_name,
            });
        }
        Ok(out)
    }
}

fn decode_tab_name(r: &mut Reader<'_>, tier: ProtocolTier) -> WireResult<Vec<Vec<String>>> {
    let len = r.read_u16_le()? as usize;
    let mut body = r.sub(len)?;
    let mut tables = Vec::new();
    while !body.is_empty() {
        if tier >= ProtocolTier::Yukon {
            let parts = body.read_u8()? as usize;
            let mut name = Vec::with_capacity(parts);
            for _ in 0..parts {
                name.push(body.read_us_varchar()?);
            }
            tables.push(name);
        } else {
            tables.push(vec![body.read_us_varchar()?]);
        }
    }
    Ok(tables)
}
