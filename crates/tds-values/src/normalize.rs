//! Plaintext normalization for encrypted columns.
//!
//! Values of encrypted columns are encrypted in a canonical form that does
//! not depend on the declared width or scale:
//!
//! - BIT and all integer types as 8-byte little-endian integers.
//! - SMALLMONEY as 8-byte MONEY.
//! - TIME, DATETIME2 and DATETIMEOFFSET at 100 ns resolution (scale 7),
//!   after truncation to the declared scale.
//! - DECIMAL/NUMERIC as a sign byte and a 16-byte magnitude at the declared
//!   scale.
//!
//! Everything else is encrypted in its ordinary wire form.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::metadata::{MAX_TIME_SCALE, TypeInfo};
use tds_protocol::types::{LengthClass, TypeId};

use crate::decode::decode_bytes;
use crate::encode::{encode_data, put_money};
use crate::error::ValueError;
use crate::temporal;
use crate::value::{Numeric, SqlValue};

fn width(info: &TypeInfo) -> u32 {
    match info.type_id.length_class() {
        LengthClass::Fixed(n) => u32::from(n),
        _ => info.max_length,
    }
}

fn is_integer(type_id: TypeId) -> bool {
    matches!(
        type_id,
        TypeId::Bit | TypeId::BitN | TypeId::Int1 | TypeId::Int2 | TypeId::Int4 | TypeId::Int8 | TypeId::IntN
    )
}

fn is_money(type_id: TypeId) -> bool {
    matches!(type_id, TypeId::Money | TypeId::Money4 | TypeId::MoneyN)
}

fn check_encryptable(base: &TypeInfo) -> Result<(), ValueError> {
    let t = base.type_id;
    if t.is_long() || matches!(t, TypeId::Xml | TypeId::Udt | TypeId::Variant) {
        return Err(ValueError::NotEncryptable(match t {
            TypeId::Xml => "XML",
            TypeId::Udt => "UDT",
            TypeId::Variant => "SQL_VARIANT",
            _ => "TEXT/NTEXT/IMAGE",
        }));
    }
    Ok(())
}

/// Produce the normalized plaintext of a non-null value for a column of
/// type `base`.
pub fn normalize(value: &SqlValue, base: &TypeInfo) -> Result<Bytes, ValueError> {
    check_encryptable(base)?;
    let mut buf = BytesMut::new();
    let t = base.type_id;

    if is_integer(t) {
        let v = value.as_i64().ok_or(ValueError::TypeMismatch {
            value: value.type_name(),
            wire: t,
        })?;
        buf.put_i64_le(v);
    } else if is_money(t) {
        let v = match value {
            SqlValue::Money(v) => *v,
            SqlValue::SmallMoney(v) => i64::from(*v),
            _ => {
                return Err(ValueError::TypeMismatch {
                    value: value.type_name(),
                    wire: t,
                });
            }
        };
        put_money(&mut buf, v);
    } else if t.is_decimal() {
        let SqlValue::Numeric(n) = value else {
            return Err(ValueError::TypeMismatch {
                value: value.type_name(),
                wire: t,
            });
        };
        let n = n.rescale(base.precision, base.scale)?;
        buf.put_u8(u8::from(!n.is_negative()));
        buf.put_u128_le(n.magnitude());
    } else if t.is_scaled_time() {
        let truncated = truncate_time(value, base.scale)?;
        let seven = TypeInfo {
            scale: MAX_TIME_SCALE,
            ..base.clone()
        };
        encode_data(&mut buf, &truncated, &seven)?;
    } else {
        encode_data(&mut buf, value, base)?;
    }
    Ok(buf.freeze())
}

/// Drop the digits a value would lose at `scale`.
fn truncate_time(value: &SqlValue, scale: u8) -> Result<SqlValue, ValueError> {
    let cut = |t: chrono::NaiveTime| {
        temporal::time_from_ticks(temporal::ticks_from_time(t, scale), scale)
    };
    Ok(match value {
        SqlValue::Time(t) => SqlValue::Time(cut(*t)?),
        SqlValue::DateTime2(v) => SqlValue::DateTime2(v.date().and_time(cut(v.time())?)),
        SqlValue::DateTimeOffset(v) => {
            let utc = v.naive_utc();
            let utc = utc.date().and_time(cut(utc.time())?);
            SqlValue::DateTimeOffset(chrono::DateTime::from_naive_utc_and_offset(utc, *v.offset()))
        }
        other => other.clone(),
    })
}

/// Rebuild a value from decrypted normalized plaintext.
pub fn denormalize(bytes: &[u8], base: &TypeInfo) -> Result<SqlValue, ValueError> {
    check_encryptable(base)?;
    let t = base.type_id;
    let bad_len = || ValueError::InvalidLength {
        type_name: "normalized value",
        length: bytes.len() as u64,
    };

    if is_integer(t) {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| bad_len())?;
        let v = i64::from_le_bytes(raw);
        let narrow = || ValueError::InvalidLength {
            type_name: "normalized integer",
            length: v as u64,
        };
        return Ok(match (t, width(base)) {
            (TypeId::Bit | TypeId::BitN, _) => SqlValue::Bool(v != 0),
            (_, 1) => SqlValue::TinyInt(u8::try_from(v).map_err(|_| narrow())?),
            (_, 2) => SqlValue::SmallInt(i16::try_from(v).map_err(|_| narrow())?),
            (_, 4) => SqlValue::Int(i32::try_from(v).map_err(|_| narrow())?),
            _ => SqlValue::BigInt(v),
        });
    }
    if is_money(t) {
        if bytes.len() != 8 {
            return Err(bad_len());
        }
        let wide = TypeInfo::fixed(TypeId::Money);
        let value = decode_bytes(&wide, bytes)?;
        return match (value, width(base)) {
            (SqlValue::Money(v), 4) => Ok(SqlValue::SmallMoney(
                i32::try_from(v).map_err(|_| bad_len())?,
            )),
            (value, _) => Ok(value),
        };
    }
    if t.is_decimal() {
        if bytes.len() != 17 {
            return Err(bad_len());
        }
        let mut magnitude = [0u8; 16];
        magnitude.copy_from_slice(&bytes[1..]);
        return Ok(SqlValue::Numeric(Numeric::new(
            base.precision,
            base.scale,
            bytes[0] == 0,
            u128::from_le_bytes(magnitude),
        )?));
    }
    if t.is_scaled_time() {
        let seven = TypeInfo {
            scale: MAX_TIME_SCALE,
            ..base.clone()
        };
        return decode_bytes(&seven, bytes);
    }
    decode_bytes(base, bytes)
}
