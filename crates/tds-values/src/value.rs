//! SQL value representation.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use tds_protocol::metadata::MAX_PRECISION;
use uuid::Uuid;

use crate::error::ValueError;

/// A decoded or to-be-encoded SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL.
    Null,
    /// BIT.
    Bool(bool),
    /// TINYINT.
    TinyInt(u8),
    /// SMALLINT.
    SmallInt(i16),
    /// INT.
    Int(i32),
    /// BIGINT.
    BigInt(i64),
    /// REAL.
    Real(f32),
    /// FLOAT.
    Float(f64),
    /// DECIMAL/NUMERIC.
    Numeric(Numeric),
    /// MONEY, in ten-thousandths.
    Money(i64),
    /// SMALLMONEY, in ten-thousandths.
    SmallMoney(i32),
    /// Character data.
    String(String),
    /// Binary data.
    Binary(Bytes),
    /// UNIQUEIDENTIFIER.
    Guid(Uuid),
    /// DATE.
    Date(NaiveDate),
    /// TIME.
    Time(NaiveTime),
    /// DATETIME.
    DateTime(NaiveDateTime),
    /// SMALLDATETIME.
    SmallDateTime(NaiveDateTime),
    /// DATETIME2.
    DateTime2(NaiveDateTime),
    /// DATETIMEOFFSET.
    DateTimeOffset(DateTime<FixedOffset>),
    /// XML.
    Xml(String),
    /// CLR user-defined type, serialized.
    Udt(Bytes),
}

impl SqlValue {
    /// Whether the value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Integer value widened to `i64`.
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(v) => Some(i64::from(*v)),
            Self::TinyInt(v) => Some(i64::from(*v)),
            Self::SmallInt(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(i64::from(*v)),
            Self::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Floating point value widened to `f64`.
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Real(v) => Some(f64::from(*v)),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Character data.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(v) | Self::Xml(v) => Some(v),
            _ => None,
        }
    }

    /// Binary data.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(v) | Self::Udt(v) => Some(v),
            _ => None,
        }
    }

    /// SQL type name of the value.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BIT",
            Self::TinyInt(_) => "TINYINT",
            Self::SmallInt(_) => "SMALLINT",
            Self::Int(_) => "INT",
            Self::BigInt(_) => "BIGINT",
            Self::Real(_) => "REAL",
            Self::Float(_) => "FLOAT",
            Self::Numeric(_) => "NUMERIC",
            Self::Money(_) => "MONEY",
            Self::SmallMoney(_) => "SMALLMONEY",
            Self::String(_) => "NVARCHAR",
            Self::Binary(_) => "VARBINARY",
            Self::Guid(_) => "UNIQUEIDENTIFIER",
            Self::Date(_) => "DATE",
            Self::Time(_) => "TIME",
            Self::DateTime(_) => "DATETIME",
            Self::SmallDateTime(_) => "SMALLDATETIME",
            Self::DateTime2(_) => "DATETIME2",
            Self::DateTimeOffset(_) => "DATETIMEOFFSET",
            Self::Xml(_) => "XML",
            Self::Udt(_) => "UDT",
        }
    }
}

impl Default for SqlValue {
    fn default() -> Self {
        Self::Null
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for SqlValue {
                fn from(v: $ty) -> Self {
                    Self::$variant(v)
                }
            }
        )*
    };
}

impl_from! {
    bool => Bool,
    u8 => TinyInt,
    i16 => SmallInt,
    i32 => Int,
    i64 => BigInt,
    f32 => Real,
    f64 => Float,
    String => String,
    Bytes => Binary,
    Uuid => Guid,
    NaiveDate => Date,
    NaiveTime => Time,
    NaiveDateTime => DateTime2,
    DateTime<FixedOffset> => DateTimeOffset,
    Numeric => Numeric,
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        Self::Numeric(Numeric::from_decimal(v))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

/// DECIMAL/NUMERIC value with the full 38-digit range.
///
/// `rust_decimal::Decimal` holds 28 digits; [`Numeric::to_decimal`] fails
/// for anything wider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Numeric {
    precision: u8,
    scale: u8,
    negative: bool,
    magnitude: u128,
}

const POW10: [u128; 39] = {
    let mut table = [1u128; 39];
    let mut i = 1;
    while i < 39 {
        table[i] = table[i - 1] * 10;
        i += 1;
    }
    table
};

fn digits(mut value: u128) -> u8 {
    let mut n = 1;
    while value >= 10 {
        value /= 10;
        n += 1;
    }
    n
}

impl Numeric {
    /// Build a value, checking it fits `precision` and `scale`.
    pub fn new(precision: u8, scale: u8, negative: bool, magnitude: u128) -> Result<Self, ValueError> {
        if precision == 0 || precision > MAX_PRECISION {
            return Err(ValueError::PrecisionTooLarge {
                precision,
                max: MAX_PRECISION,
            });
        }
        if scale > precision || magnitude >= POW10[precision as usize] {
            return Err(ValueError::NumericOutOfRange { precision, scale });
        }
        Ok(Self {
            precision,
            scale,
            negative: negative && magnitude != 0,
            magnitude,
        })
    }

    /// Convert a `Decimal` at the narrowest precision that holds it.
    #[must_use]
    pub fn from_decimal(value: Decimal) -> Self {
        let mantissa = value.mantissa();
        let magnitude = mantissa.unsigned_abs();
        let scale = value.scale() as u8;
        Self {
            precision: digits(magnitude).max(scale).max(1),
            scale,
            negative: mantissa < 0,
            magnitude,
        }
    }

    /// Convert to `Decimal` when it fits.
    #[must_use]
    pub fn to_decimal(&self) -> Option<Decimal> {
        let mantissa = i128::try_from(self.magnitude).ok()?;
        let mantissa = if self.negative { -mantissa } else { mantissa };
        Decimal::try_from_i128_with_scale(mantissa, u32::from(self.scale)).ok()
    }

    /// Re-express at another precision and scale, truncating extra
    /// fractional digits.
    pub fn rescale(&self, precision: u8, scale: u8) -> Result<Self, ValueError> {
        if scale > MAX_PRECISION {
            return Err(ValueError::NumericOutOfRange { precision, scale });
        }
        let magnitude = if scale >= self.scale {
            self.magnitude
                .checked_mul(POW10[(scale - self.scale) as usize])
                .ok_or(ValueError::NumericOutOfRange { precision, scale })?
        } else {
            self.magnitude / POW10[(self.scale - scale) as usize]
        };
        Self::new(precision, scale, self.negative, magnitude)
    }

    /// Precision.
    #[must_use]
    pub const fn precision(&self) -> u8 {
        self.precision
    }

    /// Scale.
    #[must_use]
    pub const fn scale(&self) -> u8 {
        self.scale
    }

    /// Sign.
    #[must_use]
    pub const fn is_negative(&self) -> bool {
        self.negative
    }

    /// Unscaled absolute value.
    #[must_use]
    pub const fn magnitude(&self) -> u128 {
        self.magnitude
    }

    /// Wire value length (sign byte included) for a precision.
    #[must_use]
    pub const fn wire_len(precision: u8) -> u8 {
        match precision {
            0..=9 => 5,
            10..=19 => 9,
            20..=28 => 13,
            _ => 17,
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let divisor = POW10[self.scale as usize];
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{}", self.magnitude / divisor)?;
        if self.scale > 0 {
            write!(
                f,
                ".{:0width$}",
                self.magnitude % divisor,
                width = self.scale as usize
            )?;
        }
        Ok(())
    }
}
