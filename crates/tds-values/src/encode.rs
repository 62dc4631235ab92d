//! Value encoding for outgoing parameters.
//!
//! [`param_type_info`] picks the wire type for a value. Nullable and `big`
//! variants are preferred so any value, NULL included, fits the chosen
//! type. DECIMAL is always declared as NUMERIC.
//!
//! [`encode_type_info`] writes the TYPE_INFO block and [`encode_value`] the
//! length-prefixed (or PLP) value that follows it.

use bytes::{BufMut, BytesMut};
use tds_protocol::codec::{utf16_byte_len, write_b_varchar, write_us_varchar, write_utf16_string};
use tds_protocol::collation::Collation;
use tds_protocol::metadata::{MAX_PRECISION, TypeInfo};
use tds_protocol::types::{LengthClass, MAX_LENGTH_PLP, TypeId, VAR_NULL, time_bytes_for_scale};

use crate::error::ValueError;
use crate::plp::{DEFAULT_PLP_CHUNK, write_plp, write_plp_null};
use crate::temporal;
use crate::value::{Numeric, SqlValue};

/// Largest non-PLP length for variable types, in bytes.
pub const MAX_INLINE_LEN: usize = 8000;

/// Default scale for parameters of the time family.
pub const DEFAULT_TIME_SCALE: u8 = 7;

fn sized(type_id: TypeId, max_length: u32) -> TypeInfo {
    TypeInfo {
        max_length,
        ..TypeInfo::fixed(type_id)
    }
}

fn variable(type_id: TypeId, len: usize, collation: Option<Collation>) -> TypeInfo {
    let mut info = sized(type_id, MAX_INLINE_LEN as u32);
    if len > MAX_INLINE_LEN {
        info.max_length = u32::from(MAX_LENGTH_PLP);
        info.length_class = LengthClass::Plp;
    }
    info.collation = collation;
    info
}

fn scaled_time(type_id: TypeId, extra: u8) -> TypeInfo {
    TypeInfo {
        scale: DEFAULT_TIME_SCALE,
        ..sized(
            type_id,
            u32::from(time_bytes_for_scale(DEFAULT_TIME_SCALE) + extra),
        )
    }
}

fn check_float(value: f64) -> Result<(), ValueError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(ValueError::FloatOutOfRange(value.to_string()))
    }
}

/// Choose the wire type for a parameter value.
///
/// `collation` is attached to character types, normally the session's
/// current collation.
pub fn param_type_info(value: &SqlValue, collation: Collation) -> Result<TypeInfo, ValueError> {
    use SqlValue as V;
    use TypeId as T;

    let info = match value {
        V::Null => variable(T::NVarChar, 0, Some(collation)),
        V::Bool(_) => sized(T::BitN, 1),
        V::TinyInt(_) => sized(T::IntN, 1),
        V::SmallInt(_) => sized(T::IntN, 2),
        V::Int(_) => sized(T::IntN, 4),
        V::BigInt(_) => sized(T::IntN, 8),
        V::Real(v) => {
            check_float(f64::from(*v))?;
            sized(T::FloatN, 4)
        }
        V::Float(v) => {
            check_float(*v)?;
            sized(T::FloatN, 8)
        }
        V::Numeric(n) => TypeInfo {
            precision: n.precision(),
            scale: n.scale(),
            ..sized(T::NumericN, u32::from(Numeric::wire_len(n.precision())))
        },
        V::Money(_) => sized(T::MoneyN, 8),
        V::SmallMoney(_) => sized(T::MoneyN, 4),
        V::String(s) => variable(T::NVarChar, utf16_byte_len(s), Some(collation)),
        V::Binary(b) | V::Udt(b) => variable(T::BigVarBinary, b.len(), None),
        V::Guid(_) => sized(T::Guid, 16),
        V::Date(_) => sized(T::Date, 3),
        V::Time(_) => scaled_time(T::Time, 0),
        V::DateTime(_) => sized(T::DateTimeN, 8),
        V::SmallDateTime(_) => sized(T::DateTimeN, 4),
        V::DateTime2(_) => scaled_time(T::DateTime2, 3),
        V::DateTimeOffset(_) => scaled_time(T::DateTimeOffset, 5),
        V::Xml(_) => TypeInfo::fixed(T::Xml),
    };
    Ok(info)
}

/// Write a TYPE_INFO block.
pub fn encode_type_info(dst: &mut impl BufMut, info: &TypeInfo) -> Result<(), ValueError> {
    let type_id = if info.type_id.is_decimal() {
        TypeId::NumericN
    } else {
        info.type_id
    };
    dst.put_u8(type_id as u8);

    match type_id.length_class() {
        LengthClass::Fixed(_) | LengthClass::Plp => {}
        LengthClass::ByteLen => {
            if type_id.is_scaled_time() {
                dst.put_u8(info.scale);
            } else if type_id != TypeId::Date {
                dst.put_u8(u8::try_from(info.max_length).map_err(|_| ValueError::InvalidLength {
                    type_name: "TYPE_INFO",
                    length: u64::from(info.max_length),
                })?);
                if type_id.is_decimal() {
                    if info.precision > MAX_PRECISION {
                        return Err(ValueError::PrecisionTooLarge {
                            precision: info.precision,
                            max: MAX_PRECISION,
                        });
                    }
                    dst.put_u8(info.precision);
                    dst.put_u8(info.scale);
                }
            }
        }
        LengthClass::UShortLen => {
            let max = if info.is_plp() {
                MAX_LENGTH_PLP
            } else {
                u16::try_from(info.max_length).map_err(|_| ValueError::InvalidLength {
                    type_name: "TYPE_INFO",
                    length: u64::from(info.max_length),
                })?
            };
            dst.put_u16_le(max);
        }
        LengthClass::LongLen => dst.put_u32_le(info.max_length),
    }

    if type_id.has_collation() {
        info.collation.unwrap_or_default().encode(dst);
    }

    if type_id == TypeId::Udt {
        let udt = info.udt.as_ref().ok_or(ValueError::TypeMismatch {
            value: "UDT",
            wire: TypeId::Udt,
        })?;
        write_b_varchar(dst, &udt.database)?;
        write_b_varchar(dst, &udt.schema)?;
        write_b_varchar(dst, &udt.type_name)?;
    }

    if type_id == TypeId::Xml {
        match &info.xml_schema {
            None => dst.put_u8(0),
            Some(schema) => {
                dst.put_u8(1);
                write_b_varchar(dst, &schema.database)?;
                write_b_varchar(dst, &schema.owning_schema)?;
                write_us_varchar(dst, &schema.collection)?;
            }
        }
    }
    Ok(())
}

/// Write a value (length prefix and data) for a parameter of type `info`.
pub fn encode_value(
    dst: &mut impl BufMut,
    value: &SqlValue,
    info: &TypeInfo,
) -> Result<(), ValueError> {
    if value.is_null() {
        return encode_null(dst, info);
    }
    let mut data = BytesMut::new();
    encode_data(&mut data, value, info)?;

    match info.length_class {
        LengthClass::Fixed(_) => {}
        LengthClass::ByteLen => dst.put_u8(data.len() as u8),
        LengthClass::UShortLen => {
            if data.len() > usize::from(u16::MAX - 1) {
                return Err(ValueError::InvalidLength {
                    type_name: value.type_name(),
                    length: data.len() as u64,
                });
            }
            dst.put_u16_le(data.len() as u16);
        }
        LengthClass::LongLen => dst.put_u32_le(data.len() as u32),
        LengthClass::Plp => {
            write_plp(dst, &data, DEFAULT_PLP_CHUNK, true);
            return Ok(());
        }
    }
    dst.put_slice(&data);
    Ok(())
}

fn encode_null(dst: &mut impl BufMut, info: &TypeInfo) -> Result<(), ValueError> {
    match info.length_class {
        LengthClass::ByteLen => dst.put_u8(0),
        LengthClass::UShortLen => dst.put_u16_le(VAR_NULL as u16),
        LengthClass::Plp => write_plp_null(dst),
        LengthClass::Fixed(_) | LengthClass::LongLen => {
            return Err(ValueError::TypeMismatch {
                value: "NULL",
                wire: info.type_id,
            });
        }
    }
    Ok(())
}

fn fixed_width(info: &TypeInfo) -> u32 {
    match info.type_id.length_class() {
        LengthClass::Fixed(n) => u32::from(n),
        _ => info.max_length,
    }
}

fn mismatch(value: &SqlValue, info: &TypeInfo) -> ValueError {
    ValueError::TypeMismatch {
        value: value.type_name(),
        wire: info.type_id,
    }
}

/// Write the data bytes of a non-null value, without any length prefix.
pub fn encode_data(
    dst: &mut impl BufMut,
    value: &SqlValue,
    info: &TypeInfo,
) -> Result<(), ValueError> {
    use SqlValue as V;
    use TypeId as T;

    match (value, info.type_id) {
        (V::Bool(_) | V::TinyInt(_) | V::SmallInt(_) | V::Int(_) | V::BigInt(_), t)
            if matches!(t, T::Bit | T::BitN | T::Int1 | T::Int2 | T::Int4 | T::Int8 | T::IntN) =>
        {
            let v = value.as_i64().ok_or_else(|| mismatch(value, info))?;
            let width = fixed_width(info) as usize;
            let fits = match width {
                1 => (0..=i64::from(u8::MAX)).contains(&v),
                2 => i16::try_from(v).is_ok(),
                4 => i32::try_from(v).is_ok(),
                8 => true,
                _ => false,
            };
            if !fits {
                return Err(mismatch(value, info));
            }
            dst.put_slice(&v.to_le_bytes()[..width]);
        }
        (V::Real(_) | V::Float(_), T::Float4 | T::Float8 | T::FloatN) => {
            let v = value.as_f64().ok_or_else(|| mismatch(value, info))?;
            check_float(v)?;
            if fixed_width(info) == 4 {
                dst.put_f32_le(v as f32);
            } else {
                dst.put_f64_le(v);
            }
        }
        (V::Numeric(n), t) if t.is_decimal() => encode_numeric(dst, n, info.precision, info.scale)?,
        (V::Money(_) | V::SmallMoney(_), T::Money | T::Money4 | T::MoneyN) => {
            let v = match value {
                V::Money(v) => *v,
                V::SmallMoney(v) => i64::from(*v),
                _ => return Err(mismatch(value, info)),
            };
            if fixed_width(info) == 4 {
                dst.put_i32_le(i32::try_from(v).map_err(|_| mismatch(value, info))?);
            } else {
                put_money(dst, v);
            }
        }
        (V::String(s), T::NChar | T::NVarChar | T::NText) | (V::Xml(s), T::Xml) => {
            write_utf16_string(dst, s);
        }
        (V::String(s), t) if t.is_char() => {
            dst.put_slice(&encode_text(s, info.collation.as_ref())?);
        }
        (V::Binary(b) | V::Udt(b), t) if t.is_binary() => dst.put_slice(b),
        (V::Guid(g), T::Guid) => dst.put_slice(&g.to_bytes_le()),
        (V::Date(d), T::Date) => temporal::encode_date(dst, *d)?,
        (V::Time(t), T::Time) => temporal::encode_time(dst, *t, info.scale),
        (V::DateTime(v) | V::SmallDateTime(v) | V::DateTime2(v), T::DateTime2) => {
            temporal::encode_datetime2(dst, *v, info.scale)?;
        }
        (V::DateTimeOffset(v), T::DateTimeOffset) => {
            temporal::encode_datetimeoffset(dst, *v, info.scale)?;
        }
        (V::DateTime(v) | V::SmallDateTime(v) | V::DateTime2(v), T::DateTime | T::DateTime4 | T::DateTimeN) => {
            if fixed_width(info) == 4 {
                let (days, minutes) = temporal::smalldatetime_parts(*v)?;
                dst.put_u16_le(days);
                dst.put_u16_le(minutes);
            } else {
                let (days, ticks) = temporal::datetime_parts(*v)?;
                dst.put_i32_le(days);
                dst.put_u32_le(ticks);
            }
        }
        _ => return Err(mismatch(value, info)),
    }
    Ok(())
}

/// Write MONEY: high 32 bits, then low 32 bits.
pub fn put_money(dst: &mut impl BufMut, value: i64) {
    dst.put_i32_le((value >> 32) as i32);
    dst.put_u32_le(value as u32);
}

/// Write DECIMAL/NUMERIC data at the given precision and scale.
pub fn encode_numeric(
    dst: &mut impl BufMut,
    value: &Numeric,
    precision: u8,
    scale: u8,
) -> Result<(), ValueError> {
    if precision > MAX_PRECISION {
        return Err(ValueError::PrecisionTooLarge {
            precision,
            max: MAX_PRECISION,
        });
    }
    let value = value.rescale(precision, scale)?;
    let len = Numeric::wire_len(precision) as usize - 1;
    dst.put_u8(u8::from(!value.is_negative()));
    dst.put_slice(&value.magnitude().to_le_bytes()[..len]);
    Ok(())
}

/// Encode single-byte character data in its collation's code page.
pub fn encode_text(s: &str, collation: Option<&Collation>) -> Result<Vec<u8>, ValueError> {
    let encoding = match collation {
        Some(c) => c.encoding().map_err(|_| ValueError::UnsupportedCollation {
            lcid: c.lcid(),
            sort_id: c.sort_id,
        })?,
        None => encoding_rs::WINDOWS_1252,
    };
    let (bytes, _, had_errors) = encoding.encode(s);
    if had_errors {
        return Err(ValueError::InvalidText("VARCHAR"));
    }
    Ok(bytes.into_owned())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::decode::decode_value;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tds_protocol::version::ProtocolTier;
    use tds_protocol::wire::Reader;

    const LATIN1: Collation = Collation::new(0x00D0_0409, 0x34);

    fn round_trip(value: SqlValue) -> SqlValue {
        let info = param_type_info(&value, LATIN1).unwrap();
        let mut buf = Vec::new();
        encode_type_info(&mut buf, &info).unwrap();
        encode_value(&mut buf, &value, &info).unwrap();

        let mut r = Reader::new(&buf);
        let decoded_info = TypeInfo::decode(&mut r, ProtocolTier::Denali).unwrap();
        let decoded = decode_value(&mut r, &decoded_info).unwrap();
        assert!(r.is_empty());
        decoded
    }

    #[test]
    fn integers_use_intn() {
        let info = param_type_info(&SqlValue::Int(5), LATIN1).unwrap();
        let mut buf = Vec::new();
        encode_type_info(&mut buf, &info).unwrap();
        encode_value(&mut buf, &SqlValue::Int(5), &info).unwrap();
        assert_eq!(buf, [0x26, 4, 4, 5, 0, 0, 0]);
    }

    #[test]
    fn null_uses_nvarchar() {
        let info = param_type_info(&SqlValue::Null, LATIN1).unwrap();
        let mut buf = Vec::new();
        encode_type_info(&mut buf, &info).unwrap();
        encode_value(&mut buf, &SqlValue::Null, &info).unwrap();
        assert_eq!(
            buf,
            [0xE7, 0x40, 0x1F, 0x09, 0x04, 0xD0, 0x00, 0x34, 0xFF, 0xFF]
        );
    }

    #[test]
    fn decimal_is_declared_as_numeric() {
        let value = SqlValue::from(Decimal::from_str("-12.50").unwrap());
        let mut info = param_type_info(&value, LATIN1).unwrap();
        info.type_id = TypeId::DecimalN;
        let mut buf = Vec::new();
        encode_type_info(&mut buf, &info).unwrap();
        assert_eq!(buf, [0x6C, 5, 4, 2]);
        encode_value(&mut buf, &value, &info).unwrap();
        assert_eq!(&buf[4..], &[5, 0, 0xE2, 0x04, 0, 0]);
    }

    #[test]
    fn non_finite_floats_are_rejected() {
        assert!(matches!(
            param_type_info(&SqlValue::Float(f64::NAN), LATIN1),
            Err(ValueError::FloatOutOfRange(_))
        ));
        let info = sized(TypeId::FloatN, 4);
        assert!(encode_value(&mut Vec::new(), &SqlValue::Real(f32::INFINITY), &info).is_err());
    }

    #[test]
    fn precision_above_maximum_is_rejected() {
        let value = Numeric::new(10, 2, false, 100).unwrap();
        assert!(matches!(
            encode_numeric(&mut Vec::new(), &value, 39, 2),
            Err(ValueError::PrecisionTooLarge { precision: 39, .. })
        ));
    }

    #[test]
    fn values_survive_the_wire() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let dt = date.and_hms_nano_opt(13, 14, 15, 123_456_700).unwrap();
        for value in [
            SqlValue::Bool(true),
            SqlValue::BigInt(-9),
            SqlValue::Float(1.5),
            SqlValue::Money(-1),
            SqlValue::SmallMoney(250_000),
            SqlValue::String("na\u{ef}ve".into()),
            SqlValue::Binary(bytes::Bytes::from_static(&[1, 2, 3])),
            SqlValue::Guid(uuid::Uuid::from_u128(0x0011_2233_4455_6677_8899_AABB_CCDD_EEFF)),
            SqlValue::Date(date),
            SqlValue::DateTime2(dt),
            SqlValue::Xml("<a/>".into()),
        ] {
            assert_eq!(round_trip(value.clone()), value);
        }
    }

    #[test]
    fn long_strings_switch_to_plp() {
        let value = SqlValue::String("x".repeat(4001));
        let info = param_type_info(&value, LATIN1).unwrap();
        assert!(info.is_plp());
        assert_eq!(round_trip(value.clone()), value);
    }

    #[test]
    fn varchar_uses_code_page() {
        let mut info = sized(TypeId::BigVarChar, 100);
        info.collation = Some(LATIN1);
        let mut buf = Vec::new();
        encode_value(&mut buf, &SqlValue::from("\u{e9}"), &info).unwrap();
        assert_eq!(buf, [1, 0, 0xE9]);
        assert!(encode_value(&mut Vec::new(), &SqlValue::from("\u{4e2d}"), &info).is_err());
    }

    #[test]
    fn narrowing_checks_range() {
        let info = sized(TypeId::IntN, 1);
        assert!(encode_value(&mut Vec::new(), &SqlValue::Int(300), &info).is_err());
        assert!(encode_value(&mut Vec::new(), &SqlValue::Int(-1), &info).is_err());
        let mut buf = Vec::new();
        encode_value(&mut buf, &SqlValue::Int(255), &info).unwrap();
        assert_eq!(buf, [1, 255]);
    }
}
