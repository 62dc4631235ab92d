//! Value decoding driven by a column's [`TypeInfo`].
//!
//! The length prefix is read according to the type's length class and then
//! checked against the null conventions:
//!
//! - PLP values are null when the total length is [`PLP_NULL`].
//! - 1-byte-length values are null at [`FIXED_NULL`] unless the type is
//!   character or binary data, where zero means empty.
//! - 2-byte-length values are null at [`VAR_NULL`].
//! - Legacy long types (TEXT, NTEXT, IMAGE) are null when the text pointer
//!   length is zero.
//!
//! Fixed-width types have no length prefix and are never null.

use bytes::Bytes;
use tds_protocol::codec::decode_utf16;
use tds_protocol::collation::Collation;
use tds_protocol::metadata::{MAX_PRECISION, TypeInfo};
use tds_protocol::types::{FIXED_NULL, LengthClass, TypeId, VAR_NULL};
use tds_protocol::wire::Reader;
use uuid::Uuid;

use crate::error::{DecodeResult, ValueError};
use crate::plp::{PLP_NULL, PlpMode, PlpValue, read_plp};
use crate::temporal;
use crate::value::{Numeric, SqlValue};
use crate::variant::decode_variant;

/// Size of the timestamp that follows a text pointer.
pub const TEXT_TIMESTAMP_LEN: usize = 8;

/// Length prefix of one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueLength {
    /// The value is null; no data follows.
    Null,
    /// This many data bytes follow.
    Bytes(usize),
    /// PLP chunks follow; the 8-byte total has not been read.
    Plp,
}

/// Whether a length read for `type_id` in `class` denotes null.
#[must_use]
pub fn is_null_length(type_id: TypeId, class: LengthClass, length: u64) -> bool {
    match class {
        LengthClass::Plp => length == PLP_NULL,
        LengthClass::Fixed(_) => false,
        LengthClass::ByteLen | LengthClass::LongLen => {
            length == FIXED_NULL && !type_id.is_char() && !type_id.is_binary()
        }
        LengthClass::UShortLen => length == VAR_NULL,
    }
}

/// Read the length prefix of a value.
///
/// For PLP types nothing is consumed; the caller hands the stream to the
/// PLP decoder.
pub fn read_value_length(r: &mut Reader<'_>, info: &TypeInfo) -> DecodeResult<ValueLength> {
    let type_id = info.type_id;
    let length = match info.length_class {
        LengthClass::Plp => return Ok(ValueLength::Plp),
        LengthClass::Fixed(n) => return Ok(ValueLength::Bytes(n as usize)),
        LengthClass::ByteLen => u64::from(r.read_u8()?),
        LengthClass::UShortLen => u64::from(r.read_u16_le()?),
        LengthClass::LongLen if type_id.is_long() => {
            let pointer_len = r.read_u8()? as usize;
            if pointer_len == 0 {
                return Ok(ValueLength::Null);
            }
            r.skip(pointer_len + TEXT_TIMESTAMP_LEN)?;
            return Ok(ValueLength::Bytes(r.read_u32_le()? as usize));
        }
        LengthClass::LongLen => u64::from(r.read_u32_le()?),
    };
    if is_null_length(type_id, info.length_class, length) {
        Ok(ValueLength::Null)
    } else {
        Ok(ValueLength::Bytes(length as usize))
    }
}

/// Decode one value.
pub fn decode_value(r: &mut Reader<'_>, info: &TypeInfo) -> DecodeResult<SqlValue> {
    match read_value_length(r, info)? {
        ValueLength::Null => Ok(SqlValue::Null),
        ValueLength::Bytes(n) => {
            let bytes = r.read_bytes(n)?;
            Ok(decode_bytes(info, bytes)?)
        }
        ValueLength::Plp => match read_plp(r, PlpMode::Materialize)? {
            PlpValue::Null => Ok(SqlValue::Null),
            PlpValue::Data(data) => Ok(decode_bytes(info, &data)?),
            PlpValue::Skipped(_) => Ok(SqlValue::Null),
        },
    }
}

/// Step over one value without materializing it.
pub fn skip_value(r: &mut Reader<'_>, info: &TypeInfo) -> DecodeResult<()> {
    match read_value_length(r, info)? {
        ValueLength::Null => {}
        ValueLength::Bytes(n) => r.skip(n)?,
        ValueLength::Plp => {
            read_plp(r, PlpMode::Skip)?;
        }
    }
    Ok(())
}

fn expect_len(type_name: &'static str, bytes: &[u8], allowed: &[usize]) -> Result<(), ValueError> {
    if allowed.contains(&bytes.len()) {
        Ok(())
    } else {
        Err(ValueError::InvalidLength {
            type_name,
            length: bytes.len() as u64,
        })
    }
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

/// Decode the data bytes of a non-null value.
pub fn decode_bytes(info: &TypeInfo, bytes: &[u8]) -> Result<SqlValue, ValueError> {
    use TypeId as T;

    let value = match info.type_id {
        T::Null => SqlValue::Null,
        T::Int1 => {
            expect_len("TINYINT", bytes, &[1])?;
            SqlValue::TinyInt(bytes[0])
        }
        T::Bit | T::BitN => {
            expect_len("BIT", bytes, &[1])?;
            SqlValue::Bool(bytes[0] != 0)
        }
        T::Int2 => {
            expect_len("SMALLINT", bytes, &[2])?;
            SqlValue::SmallInt(i16::from_le_bytes(le(bytes)))
        }
        T::Int4 => {
            expect_len("INT", bytes, &[4])?;
            SqlValue::Int(i32::from_le_bytes(le(bytes)))
        }
        T::Int8 => {
            expect_len("BIGINT", bytes, &[8])?;
            SqlValue::BigInt(i64::from_le_bytes(le(bytes)))
        }
        T::IntN => match bytes.len() {
            1 => SqlValue::TinyInt(bytes[0]),
            2 => SqlValue::SmallInt(i16::from_le_bytes(le(bytes))),
            4 => SqlValue::Int(i32::from_le_bytes(le(bytes))),
            8 => SqlValue::BigInt(i64::from_le_bytes(le(bytes))),
            n => {
                return Err(ValueError::InvalidLength {
                    type_name: "INTN",
                    length: n as u64,
                });
            }
        },
        T::Float4 | T::Float8 | T::FloatN => match bytes.len() {
            4 => SqlValue::Real(f32::from_le_bytes(le(bytes))),
            8 => SqlValue::Float(f64::from_le_bytes(le(bytes))),
            n => {
                return Err(ValueError::InvalidLength {
                    type_name: "FLOAT",
                    length: n as u64,
                });
            }
        },
        T::Money | T::Money4 | T::MoneyN => match bytes.len() {
            4 => SqlValue::SmallMoney(i32::from_le_bytes(le(bytes))),
            8 => SqlValue::Money(money_from_bytes(bytes)),
            n => {
                return Err(ValueError::InvalidLength {
                    type_name: "MONEY",
                    length: n as u64,
                });
            }
        },
        T::DateTime | T::DateTime4 | T::DateTimeN => match bytes.len() {
            4 => SqlValue::SmallDateTime(temporal::decode_smalldatetime(
                u16::from_le_bytes(le(bytes)),
                u16::from_le_bytes(le(&bytes[2..])),
            )?),
            8 => SqlValue::DateTime(temporal::decode_datetime(
                i32::from_le_bytes(le(bytes)),
                u32::from_le_bytes(le(&bytes[4..])),
            )?),
            n => {
                return Err(ValueError::InvalidLength {
                    type_name: "DATETIME",
                    length: n as u64,
                });
            }
        },
        T::Guid => {
            expect_len("UNIQUEIDENTIFIER", bytes, &[16])?;
            SqlValue::Guid(Uuid::from_bytes_le(le(bytes)))
        }
        T::Decimal | T::Numeric | T::DecimalN | T::NumericN => {
            SqlValue::Numeric(decode_numeric(bytes, info.precision, info.scale)?)
        }
        T::Date => {
            expect_len("DATE", bytes, &[3])?;
            SqlValue::Date(temporal::date_from_days(temporal::uint_le(bytes) as u32)?)
        }
        T::Time => SqlValue::Time(temporal::decode_time(bytes, info.scale)?),
        T::DateTime2 => SqlValue::DateTime2(temporal::decode_datetime2(bytes, info.scale)?),
        T::DateTimeOffset => {
            SqlValue::DateTimeOffset(temporal::decode_datetimeoffset(bytes, info.scale)?)
        }
        T::NChar | T::NVarChar | T::NText => SqlValue::String(decode_utf16(bytes)?),
        T::Xml => SqlValue::Xml(decode_xml(bytes)?),
        T::Char | T::VarChar | T::BigChar | T::BigVarChar | T::Text => {
            SqlValue::String(decode_text(bytes, info.collation.as_ref())?)
        }
        T::Binary | T::VarBinary | T::BigBinary | T::BigVarBinary | T::Image => {
            SqlValue::Binary(Bytes::copy_from_slice(bytes))
        }
        T::Udt => SqlValue::Udt(Bytes::copy_from_slice(bytes)),
        T::Variant => decode_variant(bytes)?,
    };
    Ok(value)
}

/// MONEY: high 32 bits first, then low 32 bits.
fn money_from_bytes(bytes: &[u8]) -> i64 {
    let high = i64::from(i32::from_le_bytes(le(bytes)));
    let low = i64::from(u32::from_le_bytes(le(&bytes[4..])));
    (high << 32) | low
}

/// DECIMAL/NUMERIC: sign byte (1 positive) then little-endian magnitude.
pub fn decode_numeric(bytes: &[u8], precision: u8, scale: u8) -> Result<Numeric, ValueError> {
    if bytes.len() < 2 || bytes.len() > 17 {
        return Err(ValueError::InvalidLength {
            type_name: "NUMERIC",
            length: bytes.len() as u64,
        });
    }
    let mut magnitude = [0u8; 16];
    magnitude[..bytes.len() - 1].copy_from_slice(&bytes[1..]);
    let precision = if precision == 0 { MAX_PRECISION } else { precision };
    Numeric::new(precision, scale, bytes[0] == 0, u128::from_le_bytes(magnitude))
}

/// Decode single-byte character data in its collation's code page.
pub fn decode_text(bytes: &[u8], collation: Option<&Collation>) -> Result<String, ValueError> {
    let encoding = match collation {
        Some(c) => c.encoding().map_err(|_| ValueError::UnsupportedCollation {
            lcid: c.lcid(),
            sort_id: c.sort_id,
        })?,
        None => encoding_rs::WINDOWS_1252,
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(std::borrow::Cow::into_owned)
        .ok_or(ValueError::InvalidText("VARCHAR"))
}

/// XML arrives as UTF-16, possibly with a byte order mark.
fn decode_xml(bytes: &[u8]) -> Result<String, ValueError> {
    let bytes = bytes.strip_prefix(&[0xFF, 0xFE]).unwrap_or(bytes);
    Ok(decode_utf16(bytes)?)
}
