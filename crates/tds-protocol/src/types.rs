//! TDS data type identifiers and their wire length classes.

use bitflags::bitflags;

use crate::error::ProtocolError;

/// Length value that marks a null in 1-byte-length non-character types.
pub const FIXED_NULL: u64 = 0;

/// Length value that marks a null in 2-byte-length types.
pub const VAR_NULL: u64 = 0xFFFF;

/// Declared maximum length that switches a 2-byte-length type to PLP.
pub const MAX_LENGTH_PLP: u16 = 0xFFFF;

/// TDS data type identifiers.
///
/// These correspond to the type bytes sent in column metadata and parameter definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeId {
    /// Null type.
    Null = 0x1F,
    /// 8-bit unsigned integer.
    Int1 = 0x30,
    /// Bit (boolean).
    Bit = 0x32,
    /// 16-bit signed integer.
    Int2 = 0x34,
    /// 32-bit signed integer.
    Int4 = 0x38,
    /// 64-bit signed integer.
    Int8 = 0x7F,
    /// 32-bit floating point.
    Float4 = 0x3B,
    /// 64-bit floating point.
    Float8 = 0x3E,
    /// 8-byte money.
    Money = 0x3C,
    /// 4-byte money.
    Money4 = 0x7A,
    /// 8-byte datetime.
    DateTime = 0x3D,
    /// 4-byte small datetime.
    DateTime4 = 0x3A,

    /// Nullable GUID.
    Guid = 0x24,
    /// Nullable integer of 1, 2, 4 or 8 bytes.
    IntN = 0x26,
    /// Legacy decimal.
    Decimal = 0x37,
    /// Legacy numeric.
    Numeric = 0x3F,
    /// Nullable bit.
    BitN = 0x68,
    /// Decimal.
    DecimalN = 0x6A,
    /// Numeric.
    NumericN = 0x6C,
    /// Nullable float of 4 or 8 bytes.
    FloatN = 0x6D,
    /// Nullable money of 4 or 8 bytes.
    MoneyN = 0x6E,
    /// Nullable datetime of 4 or 8 bytes.
    DateTimeN = 0x6F,

    /// Legacy fixed-length character.
    Char = 0x2F,
    /// Legacy variable-length character.
    VarChar = 0x27,
    /// Legacy fixed-length binary.
    Binary = 0x2D,
    /// Legacy variable-length binary.
    VarBinary = 0x25,

    /// Variable-length character, PLP when declared `max`.
    BigVarChar = 0xA7,
    /// Variable-length binary, PLP when declared `max`.
    BigVarBinary = 0xA5,
    /// Fixed-length character.
    BigChar = 0xAF,
    /// Fixed-length binary.
    BigBinary = 0xAD,
    /// Fixed-length Unicode character.
    NChar = 0xEF,
    /// Variable-length Unicode character, PLP when declared `max`.
    NVarChar = 0xE7,

    /// Legacy long text.
    Text = 0x23,
    /// Legacy long binary.
    Image = 0x22,
    /// Legacy long Unicode text.
    NText = 0x63,

    /// Date (3 bytes).
    Date = 0x28,
    /// Time with scale.
    Time = 0x29,
    /// DateTime2 with scale.
    DateTime2 = 0x2A,
    /// DateTimeOffset with scale.
    DateTimeOffset = 0x2B,

    /// SQL_VARIANT.
    Variant = 0x62,
    /// CLR user-defined type.
    Udt = 0xF0,
    /// XML.
    Xml = 0xF1,
}

/// How a type's value length is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthClass {
    /// No length prefix; the value always has this many bytes.
    Fixed(u8),
    /// 1-byte length prefix.
    ByteLen,
    /// 2-byte length prefix.
    UShortLen,
    /// 4-byte length prefix (legacy long types and SQL_VARIANT).
    LongLen,
    /// Partially length-prefixed chunks behind an 8-byte total length.
    Plp,
}

impl TypeId {
    /// Create a type id from a raw byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        Ok(match value {
            0x1F => Self::Null,
            0x30 => Self::Int1,
            0x32 => Self::Bit,
            0x34 => Self::Int2,
            0x38 => Self::Int4,
            0x7F => Self::Int8,
            0x3B => Self::Float4,
            0x3E => Self::Float8,
            0x3C => Self::Money,
            0x7A => Self::Money4,
            0x3D => Self::DateTime,
            0x3A => Self::DateTime4,
            0x24 => Self::Guid,
            0x26 => Self::IntN,
            0x37 => Self::Decimal,
            0x3F => Self::Numeric,
            0x68 => Self::BitN,
            0x6A => Self::DecimalN,
            0x6C => Self::NumericN,
            0x6D => Self::FloatN,
            0x6E => Self::MoneyN,
            0x6F => Self::DateTimeN,
            0x2F => Self::Char,
            0x27 => Self::VarChar,
            0x2D => Self::Binary,
            0x25 => Self::VarBinary,
            0xA7 => Self::BigVarChar,
            0xA5 => Self::BigVarBinary,
            0xAF => Self::BigChar,
            0xAD => Self::BigBinary,
            0xEF => Self::NChar,
            0xE7 => Self::NVarChar,
            0x23 => Self::Text,
            0x22 => Self::Image,
            0x63 => Self::NText,
            0x28 => Self::Date,
            0x29 => Self::Time,
            0x2A => Self::DateTime2,
            0x2B => Self::DateTimeOffset,
            0x62 => Self::Variant,
            0xF0 => Self::Udt,
            0xF1 => Self::Xml,
            _ => return Err(ProtocolError::InvalidDataType(value)),
        })
    }

    /// Static length class. `max`-declared variable types are promoted to
    /// [`LengthClass::Plp`] by the TYPE_INFO decoder.
    #[must_use]
    pub const fn length_class(self) -> LengthClass {
        match self {
            Self::Null => LengthClass::Fixed(0),
            Self::Int1 | Self::Bit => LengthClass::Fixed(1),
            Self::Int2 => LengthClass::Fixed(2),
            Self::Int4 | Self::Float4 | Self::Money4 | Self::DateTime4 => LengthClass::Fixed(4),
            Self::Int8 | Self::Float8 | Self::Money | Self::DateTime => LengthClass::Fixed(8),
            Self::Guid
            | Self::IntN
            | Self::Decimal
            | Self::Numeric
            | Self::BitN
            | Self::DecimalN
            | Self::NumericN
            | Self::FloatN
            | Self::MoneyN
            | Self::DateTimeN
            | Self::Char
            | Self::VarChar
            | Self::Binary
            | Self::VarBinary
            | Self::Date
            | Self::Time
            | Self::DateTime2
            | Self::DateTimeOffset => LengthClass::ByteLen,
            Self::BigVarChar
            | Self::BigVarBinary
            | Self::BigChar
            | Self::BigBinary
            | Self::NChar
            | Self::NVarChar
            | Self::Udt => LengthClass::UShortLen,
            Self::Text | Self::Image | Self::NText | Self::Variant => LengthClass::LongLen,
            Self::Xml => LengthClass::Plp,
        }
    }

    /// Legacy long types that prefix values with a text pointer.
    #[must_use]
    pub const fn is_long(self) -> bool {
        matches!(self, Self::Text | Self::Image | Self::NText)
    }

    /// Character data (single-byte or Unicode).
    #[must_use]
    pub const fn is_char(self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::VarChar
                | Self::BigChar
                | Self::BigVarChar
                | Self::NChar
                | Self::NVarChar
                | Self::Text
                | Self::NText
                | Self::Xml
        )
    }

    /// Binary data.
    #[must_use]
    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            Self::Binary
                | Self::VarBinary
                | Self::BigBinary
                | Self::BigVarBinary
                | Self::Image
                | Self::Udt
        )
    }

    /// UTF-16 character data.
    #[must_use]
    pub const fn is_unicode(self) -> bool {
        matches!(self, Self::NChar | Self::NVarChar | Self::NText | Self::Xml)
    }

    /// Character types whose TYPE_INFO carries a collation on tier Shiloh
    /// and later.
    #[must_use]
    pub const fn has_collation(self) -> bool {
        matches!(
            self,
            Self::BigChar
                | Self::BigVarChar
                | Self::NChar
                | Self::NVarChar
                | Self::Text
                | Self::NText
        )
    }

    /// Variable types that switch to PLP when declared with length 0xFFFF.
    #[must_use]
    pub const fn may_be_plp(self) -> bool {
        matches!(
            self,
            Self::BigVarChar | Self::BigVarBinary | Self::NVarChar | Self::Udt
        )
    }

    /// DECIMAL/NUMERIC family.
    #[must_use]
    pub const fn is_decimal(self) -> bool {
        matches!(
            self,
            Self::Decimal | Self::Numeric | Self::DecimalN | Self::NumericN
        )
    }

    /// TIME, DATETIME2 and DATETIMEOFFSET, whose value size follows the scale.
    #[must_use]
    pub const fn is_scaled_time(self) -> bool {
        matches!(self, Self::Time | Self::DateTime2 | Self::DateTimeOffset)
    }
}

/// Byte width of a TIME value at `scale` (0..=7).
#[must_use]
pub const fn time_bytes_for_scale(scale: u8) -> u8 {
    match scale {
        0..=2 => 3,
        3..=4 => 4,
        _ => 5,
    }
}

bitflags! {
    /// Column flags from COLMETADATA and RETURNVALUE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ColumnFlags: u16 {
        /// Column is nullable.
        const NULLABLE = 0x0001;
        /// Case-sensitive comparison.
        const CASE_SENSITIVE = 0x0002;
        /// Read-write column.
        const UPDATEABLE = 0x0004;
        /// Updateability unknown.
        const UPDATEABLE_UNKNOWN = 0x0008;
        /// Identity column.
        const IDENTITY = 0x0010;
        /// Computed column.
        const COMPUTED = 0x0020;
        /// Fixed-length CLR type.
        const FIXED_LEN_CLR_TYPE = 0x0100;
        /// Sparse column set.
        const SPARSE_COLUMN_SET = 0x0200;
        /// Encrypted column.
        const ENCRYPTED = 0x0800;
        /// Hidden (browse mode) column.
        const HIDDEN = 0x2000;
        /// Key column (browse mode).
        const KEY = 0x4000;
        /// Nullability unknown.
        const NULLABLE_UNKNOWN = 0x8000;
    }
}
