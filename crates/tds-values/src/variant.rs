//! SQL_VARIANT payloads.
//!
//! ```text
//! base type  u8
//! prop count u8
//! props      prop count bytes
//! value      remaining bytes
//! ```
//!
//! Servers may append property bytes this decoder does not know about; any
//! beyond the expected count are skipped.

use tds_protocol::collation::Collation;
use tds_protocol::metadata::{MAX_TIME_SCALE, TypeInfo};
use tds_protocol::error::ProtocolError;
use tds_protocol::types::{TypeId, time_bytes_for_scale};

use crate::decode::decode_bytes;
use crate::error::ValueError;
use crate::value::SqlValue;

/// Property bytes a base type needs, or `None` if it cannot appear in a
/// variant.
#[must_use]
pub const fn property_count(base: TypeId) -> Option<usize> {
    use TypeId as T;

    match base {
        T::Int1
        | T::Bit
        | T::Int2
        | T::Int4
        | T::Int8
        | T::Float4
        | T::Float8
        | T::Money
        | T::Money4
        | T::DateTime
        | T::DateTime4
        | T::Guid
        | T::Date => Some(0),
        T::Decimal | T::Numeric | T::DecimalN | T::NumericN => Some(2),
        T::Time | T::DateTime2 | T::DateTimeOffset => Some(1),
        T::BigBinary | T::BigVarBinary => Some(2),
        T::BigChar | T::BigVarChar | T::NChar | T::NVarChar => Some(Collation::SIZE + 2),
        _ => None,
    }
}

/// Decode a complete SQL_VARIANT value (without its 4-byte length).
pub fn decode_variant(bytes: &[u8]) -> Result<SqlValue, ValueError> {
    let [base, count, rest @ ..] = bytes else {
        return Err(ValueError::InvalidLength {
            type_name: "SQL_VARIANT",
            length: bytes.len() as u64,
        });
    };
    let base = TypeId::from_u8(*base)?;
    let expected = property_count(base).ok_or(ProtocolError::InvalidDataType(base as u8))?;
    let count = *count as usize;
    if count < expected || count > rest.len() {
        return Err(ValueError::InvalidLength {
            type_name: "SQL_VARIANT properties",
            length: count as u64,
        });
    }
    let (props, value) = rest.split_at(count);
    let info = base_type_info(base, props)?;
    decode_bytes(&info, value)
}

fn base_type_info(base: TypeId, props: &[u8]) -> Result<TypeInfo, ValueError> {
    let mut info = TypeInfo::fixed(base);
    if base.is_decimal() {
        info.precision = props[0];
        info.scale = props[1];
    } else if base.is_scaled_time() {
        let scale = props[0];
        if scale > MAX_TIME_SCALE {
            return Err(ValueError::InvalidLength {
                type_name: "SQL_VARIANT time scale",
                length: u64::from(scale),
            });
        }
        info.scale = scale;
        info.max_length = u32::from(time_bytes_for_scale(scale));
    } else if base.has_collation() {
        info.collation = Some(Collation::from_bytes(props)?);
        info.max_length = u32::from(u16::from_le_bytes([props[5], props[6]]));
    } else if base.is_binary() {
        info.max_length = u32::from(u16::from_le_bytes([props[0], props[1]]));
    }
    Ok(info)
}
