//! TYPE_INFO and column metadata decoding.
//!
//! A [`TypeInfo`] is decoded once per COLMETADATA column (or RETURNVALUE)
//! and then shared by every row of the result set, so the row decoder never
//! has to look at the type byte again.

use std::sync::Arc;

use crate::collation::Collation;
use crate::crypto::{CekTable, CryptoMetadata};
use crate::error::ProtocolError;
use crate::types::{ColumnFlags, LengthClass, MAX_LENGTH_PLP, TypeId, time_bytes_for_scale};
use crate::version::ProtocolTier;
use crate::wire::{Reader, WireResult};

/// Largest DECIMAL/NUMERIC precision.
pub const MAX_PRECISION: u8 = 38;

/// Largest fractional-second scale of the time family.
pub const MAX_TIME_SCALE: u8 = 7;

/// COLMETADATA column count that means "reuse the previous metadata".
pub const NO_METADATA: u16 = 0xFFFF;

/// CLR user-defined type identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdtInfo {
    /// Database holding the type.
    pub database: String,
    /// Owning schema.
    pub schema: String,
    /// Type name.
    pub type_name: String,
    /// Assembly-qualified CLR name.
    pub assembly_qualified_name: String,
}

/// XML schema collection bound to an XML column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlSchema {
    /// Database holding the collection.
    pub database: String,
    /// Owning schema.
    pub owning_schema: String,
    /// Collection name.
    pub collection: String,
}

/// Decoded TYPE_INFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    /// Wire type.
    pub type_id: TypeId,
    /// Effective length class, with `max` declarations promoted to PLP.
    pub length_class: LengthClass,
    /// Declared maximum length in bytes (fixed width for fixed types).
    pub max_length: u32,
    /// Precision (DECIMAL/NUMERIC).
    pub precision: u8,
    /// Scale (DECIMAL/NUMERIC and the time family).
    pub scale: u8,
    /// Collation for character types.
    pub collation: Option<Collation>,
    /// UDT identity.
    pub udt: Option<Box<UdtInfo>>,
    /// XML schema collection.
    pub xml_schema: Option<Box<XmlSchema>>,
}

impl TypeInfo {
    /// Bare TYPE_INFO for a type with no extra properties.
    #[must_use]
    pub fn fixed(type_id: TypeId) -> Self {
        let class = type_id.length_class();
        let max_length = match class {
            LengthClass::Fixed(n) => u32::from(n),
            _ => 0,
        };
        Self {
            type_id,
            length_class: class,
            max_length,
            precision: 0,
            scale: 0,
            collation: None,
            udt: None,
            xml_schema: None,
        }
    }

    /// Decode a TYPE_INFO block.
    pub fn decode(r: &mut Reader<'_>, tier: ProtocolTier) -> WireResult<Self> {
        let type_id = TypeId::from_u8(r.read_u8()?)?;
        let mut info = Self::fixed(type_id);

        if matches!(
            type_id,
            TypeId::Date | TypeId::Time | TypeId::DateTime2 | TypeId::DateTimeOffset
        ) && !tier.has_date_time_family()
        {
            return Err(ProtocolError::InvalidDataType(type_id as u8).into());
        }

        match type_id.length_class() {
            LengthClass::Fixed(_) => {}
            LengthClass::ByteLen => {
                if type_id == TypeId::Date {
                    info.max_length = 3;
                } else if type_id.is_scaled_time() {
                    let scale = r.read_u8()?;
                    if scale > MAX_TIME_SCALE {
                        return Err(ProtocolError::InvalidField {
                            field: "time scale",
                            value: u64::from(scale),
                        }
                        .into());
                    }
                    info.scale = scale;
                    info.max_length = u32::from(time_bytes_for_scale(scale))
                        + match type_id {
                            TypeId::DateTime2 => 3,
                            TypeId::DateTimeOffset => 5,
                            _ => 0,
                        };
                } else {
                    info.max_length = u32::from(r.read_u8()?);
                    if type_id.is_decimal() {
                        info.precision = r.read_u8()?;
                        info.scale = r.read_u8()?;
                        if info.precision > MAX_PRECISION || info.scale > info.precision {
                            return Err(ProtocolError::InvalidField {
                                field: "decimal precision",
                                value: u64::from(info.precision),
                            }
                            .into());
                        }
                    }
                }
            }
            LengthClass::UShortLen => {
                let max = r.read_u16_le()?;
                info.max_length = u32::from(max);
                if max == MAX_LENGTH_PLP && type_id.may_be_plp() {
                    if !tier.has_plp() {
                        return Err(ProtocolError::InvalidField {
                            field: "max length",
                            value: u64::from(max),
                        }
                        .into());
                    }
                    info.length_class = LengthClass::Plp;
                }
            }
            LengthClass::LongLen => {
                info.max_length = r.read_u32_le()?;
            }
            LengthClass::Plp => {}
        }

        if type_id.has_collation() && tier.has_collation() {
            info.collation = Some(Collation::decode(r)?);
        }

        if type_id == TypeId::Udt {
            info.udt = Some(Box::new(UdtInfo {
                database: r.read_b_varchar()?,
                schema: r.read_b_varchar()?,
                type_name: r.read_b_varchar()?,
                assembly_qualified_name: r.read_us_varchar()?,
            }));
        }

        if type_id == TypeId::Xml && r.read_u8()? != 0 {
            info.xml_schema = Some(Box::new(XmlSchema {
                database: r.read_b_varchar()?,
                owning_schema: r.read_b_varchar()?,
                collection: r.read_us_varchar()?,
            }));
        }

        Ok(info)
    }

    /// Whether values use PLP chunking.
    #[must_use]
    pub fn is_plp(&self) -> bool {
        self.length_class == LengthClass::Plp
    }
}

/// One column of a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescriptor {
    /// User type id.
    pub user_type: u32,
    /// Column flags.
    pub flags: ColumnFlags,
    /// Wire type (the ciphertext type for encrypted columns).
    pub type_info: TypeInfo,
    /// Source table name parts, for legacy long types.
    pub table_name: Option<Vec<String>>,
    /// Encryption description for encrypted columns.
    pub crypto: Option<CryptoMetadata>,
    /// Column name.
    pub name: String,
}

impl ColumnDescriptor {
    /// Decode one column. `encryption` is the negotiated cipher table, if
    /// column encryption is on.
    pub fn decode(
        r: &mut Reader<'_>,
        tier: ProtocolTier,
        encryption: Option<&CekTable>,
    ) -> WireResult<Self> {
        let user_type = if tier >= ProtocolTier::Yukon {
            r.read_u32_le()?
        } else {
            u32::from(r.read_u16_le()?)
        };
        let flags = ColumnFlags::from_bits_retain(r.read_u16_le()?);
        let type_info = TypeInfo::decode(r, tier)?;

        let table_name = if type_info.type_id.is_long() {
            Some(decode_table_name(r, tier)?)
        } else {
            None
        };

        let crypto = match encryption {
            Some(table) if flags.contains(ColumnFlags::ENCRYPTED) => {
                let md = CryptoMetadata::decode(r, tier, true)?;
                md.validate(Some(table))?;
                Some(md)
            }
            _ => None,
        };

        let name = r.read_b_varchar()?;
        Ok(Self {
            user_type,
            flags,
            type_info,
            table_name,
            crypto,
            name,
        })
    }

    /// Whether the column accepts nulls.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.flags.contains(ColumnFlags::NULLABLE)
    }
}

fn decode_table_name(r: &mut Reader<'_>, tier: ProtocolTier) -> WireResult<Vec<String>> {
    if tier >= ProtocolTier::Yukon {
        let parts = r.read_u8()? as usize;
        let mut out = Vec::with_capacity(parts);
        for _ in 0..parts {
            out.push(r.read_us_varchar()?);
        }
        Ok(out)
    } else {
        Ok(vec![r.read_us_varchar()?])
    }
}

/// Decoded COLMETADATA token body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColMetaData {
    /// The server reused the previous result shape.
    NoMetadata,
    /// A new result shape.
    Columns {
        /// Cipher info table, present when column encryption is negotiated.
        cek_table: Option<CekTable>,
        /// Column descriptors, shared by all rows of the result set.
        columns: Arc<[ColumnDescriptor]>,
    },
}

impl ColMetaData {
    /// Decode a COLMETADATA body (after the token byte).
    pub fn decode(
        r: &mut Reader<'_>,
        tier: ProtocolTier,
        column_encryption: bool,
    ) -> WireResult<Self> {
        let count = r.read_u16_le()?;
        if count == NO_METADATA {
            return Ok(Self::NoMetadata);
        }
        let cek_table = if column_encryption {
            Some(CekTable::decode(r)?)
        } else {
            None
        };
        let mut columns = Vec::with_capacity(count as usize);
        for _ in 0..count {
            columns.push(ColumnDescriptor::decode(r, tier, cek_table.as_ref())?);
        }
        Ok(Self::Columns {
            cek_table,
            columns: columns.into(),
        })
    }

    /// Column descriptors, empty for [`ColMetaData::NoMetadata`].
    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        match self {
            Self::NoMetadata => &[],
            Self::Columns { columns, .. } => columns,
        }
    }
}

/// RETURNVALUE status: output parameter.
pub const RETURN_VALUE_OUTPUT: u8 = 0x01;

/// RETURNVALUE status: return value of a user-defined function.
pub const RETURN_VALUE_UDF: u8 = 0x02;

/// Everything in a RETURNVALUE token that precedes the value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValueHeader {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Status byte.
    pub status: u8,
    /// User type id.
    pub user_type: u32,
    /// Flags.
    pub flags: ColumnFlags,
    /// Wire type.
    pub type_info: TypeInfo,
    /// Encryption description; return values carry no cipher ordinal.
    pub crypto: Option<CryptoMetadata>,
}

impl ReturnValueHeader {
    /// Decode up to the start of the value.
    pub fn decode(
        r: &mut Reader<'_>,
        tier: ProtocolTier,
        column_encryption: bool,
    ) -> WireResult<Self> {
        let ordinal = r.read_u16_le()?;
        let name = r.read_b_varchar()?;
        let status = r.read_u8()?;
        let user_type = if tier >= ProtocolTier::Yukon {
            r.read_u32_le()?
        } else {
            u32::from(r.read_u16_le()?)
        };
        let flags = ColumnFlags::from_bits_retain(r.read_u16_le()?);
        let type_info = TypeInfo::decode(r, tier)?;
        let crypto = if column_encryption && flags.contains(ColumnFlags::ENCRYPTED) {
            let md = CryptoMetadata::decode(r, tier, false)?;
            md.validate(None)?;
            Some(md)
        } else {
            None
        };
        Ok(Self {
            ordinal,
            name,
            status,
            user_type,
            flags,
            type_info,
            crypto,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::wire::{Step, WireError, try_decode};

    const LATIN1: [u8; 5] = [0x09, 0x04, 0xD0, 0x00, 0x34];

    #[test]
    fn nvarchar_max_is_plp_with_collation() {
        let mut data = vec![0xE7, 0xFF, 0xFF];
        data.extend_from_slice(&LATIN1);
        let info = TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Denali).unwrap();
        assert!(info.is_plp());
        assert_eq!(info.collation.unwrap().sort_id, 0x34);
    }

    #[test]
    fn nvarchar_sized_is_ushortlen() {
        let mut data = vec![0xE7, 0x64, 0x00];
        data.extend_from_slice(&LATIN1);
        let info = TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Denali).unwrap();
        assert_eq!(info.length_class, LengthClass::UShortLen);
        assert_eq!(info.max_length, 100);
    }

    #[test]
    fn collation_absent_before_shiloh() {
        let data = [0xE7, 0x64, 0x00];
        let mut r = Reader::exact(&data);
        let info = TypeInfo::decode(&mut r, ProtocolTier::Sphinx).unwrap();
        assert!(info.collation.is_none());
        assert!(r.is_empty());
    }

    #[test]
    fn plp_rejected_before_yukon() {
        let mut data = vec![0xA5, 0xFF, 0xFF];
        data.extend_from_slice(&LATIN1);
        assert!(TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Shiloh).is_err());
    }

    #[test]
    fn time_family_sizes_follow_scale() {
        let cases = [
            ([0x29, 0x07], 5),
            ([0x29, 0x02], 3),
            ([0x2A, 0x03], 7),
            ([0x2B, 0x07], 10),
        ];
        for (data, size) in cases {
            let info = TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Katmai).unwrap();
            assert_eq!(info.max_length, size, "{data:02X?}");
        }
        let date = TypeInfo::decode(&mut Reader::exact(&[0x28]), ProtocolTier::Denali).unwrap();
        assert_eq!(date.max_length, 3);
        assert!(TypeInfo::decode(&mut Reader::exact(&[0x29, 0x08]), ProtocolTier::Denali).is_err());
        assert!(TypeInfo::decode(&mut Reader::exact(&[0x28]), ProtocolTier::Yukon).is_err());
    }

    #[test]
    fn decimal_precision_and_scale() {
        let data = [0x6C, 0x11, 0x26, 0x04];
        let info = TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Denali).unwrap();
        assert_eq!((info.max_length, info.precision, info.scale), (17, 38, 4));
        assert!(TypeInfo::decode(&mut Reader::exact(&[0x6C, 0x11, 0x27, 0x00]), ProtocolTier::Denali)
            .is_err());
    }

    #[test]
    fn xml_with_schema_collection() {
        let data = [
            0xF1, 0x01, 0x02, b'd', 0, b'b', 0, 0x03, b'd', 0, b'b', 0, b'o', 0, 0x01, 0x00, b'c', 0,
        ];
        let info = TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Denali).unwrap();
        assert!(info.is_plp());
        let schema = info.xml_schema.unwrap();
        assert_eq!(schema.owning_schema, "dbo");
        assert_eq!(schema.collection, "c");
    }

    #[test]
    fn udt_info() {
        let data = [
            0xF0, 0xFF, 0xFF, 0x01, b'd', 0, 0x01, b's', 0, 0x01, b't', 0, 0x01, 0x00, b'a', 0,
        ];
        let info = TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Denali).unwrap();
        assert!(info.is_plp());
        assert_eq!(info.udt.unwrap().assembly_qualified_name, "a");
    }

    fn two_column_metadata() -> Vec<u8> {
        let mut data = vec![0x02, 0x00];
        // id INT NOT NULL
        data.extend_from_slice(&[0, 0, 0, 0, 0x00, 0x00, 0x38, 0x02, b'i', 0, b'd', 0]);
        // body TEXT NULL
        data.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x00, 0x23]);
        data.extend_from_slice(&0x7FFF_FFFFu32.to_le_bytes());
        data.extend_from_slice(&LATIN1);
        data.extend_from_slice(&[0x01, 0x01, 0x00, b't', 0]);
        data.extend_from_slice(&[0x01, b'b', 0]);
        data
    }

    #[test]
    fn colmetadata_two_columns() {
        let data = two_column_metadata();
        let md = ColMetaData::decode(&mut Reader::exact(&data), ProtocolTier::Denali, false).unwrap();
        let cols = md.columns();
        assert_eq!(cols.len(), 2);
        assert_eq!(cols[0].name, "id");
        assert!(!cols[0].is_nullable());
        assert_eq!(cols[1].table_name.as_deref(), Some(&["t".to_string()][..]));
        assert!(cols[1].is_nullable());
    }

    #[test]
    fn colmetadata_resumes_after_every_split() {
        let data = two_column_metadata();
        let whole = ColMetaData::decode(&mut Reader::exact(&data), ProtocolTier::Denali, false).unwrap();
        for split in 0..data.len() {
            let out = try_decode(&data[..split], |r| {
                ColMetaData::decode(r, ProtocolTier::Denali, false)
            })
            .unwrap();
            assert_eq!(out, Step::NeedMore, "split at {split}");
        }
        let out = try_decode(&data, |r| ColMetaData::decode(r, ProtocolTier::Denali, false)).unwrap();
        assert_eq!(out, Step::Ready((whole, data.len())));
    }

    #[test]
    fn no_metadata_marker() {
        let md = ColMetaData::decode(&mut Reader::exact(&[0xFF, 0xFF]), ProtocolTier::Denali, true)
            .unwrap();
        assert_eq!(md, ColMetaData::NoMetadata);
    }

    #[test]
    fn encrypted_column_reads_cipher_table_and_crypto_block() {
        let mut data = vec![0x01, 0x00];
        // empty-valued cipher table with one entry
        data.extend_from_slice(&[0x01, 0x00]);
        data.extend_from_slice(&[0u8; 20]);
        data.push(0);
        // varbinary(64) ciphertext, flags ENCRYPTED
        data.extend_from_slice(&[0, 0, 0, 0, 0x00, 0x08, 0xA5, 0x40, 0x00]);
        // crypto block: ordinal 0, user type, base INT, algo 2, deterministic, norm 1
        data.extend_from_slice(&[0x00, 0x00, 0, 0, 0, 0, 0x38, 0x02, 0x01, 0x01]);
        data.extend_from_slice(&[0x01, b'x', 0]);

        let md = ColMetaData::decode(&mut Reader::exact(&data), ProtocolTier::Denali, true).unwrap();
        assert!(matches!(&md, ColMetaData::Columns { cek_table: Some(t), .. } if t.len() == 1));
        let columns = md.columns();
        let crypto = columns[0].crypto.as_ref().unwrap();
        assert_eq!(crypto.base_type.type_id, TypeId::Int4);
        assert_eq!(columns[0].name, "x");
    }

    #[test]
    fn return_value_header() {
        let data = [
            0x01, 0x00, 0x02, b'@', 0, b'p', 0, 0x01, 0, 0, 0, 0, 0x01, 0x00, 0x26, 0x04,
        ];
        let mut r = Reader::exact(&data);
        let header = ReturnValueHeader::decode(&mut r, ProtocolTier::Denali, false).unwrap();
        assert_eq!(header.name, "@p");
        assert_eq!(header.status, RETURN_VALUE_OUTPUT);
        assert_eq!(header.type_info.max_length, 4);
        assert!(r.is_empty());
    }

    #[test]
    fn truncated_exact_buffer_is_an_error() {
        let data = [0xE7, 0x64];
        assert!(matches!(
            TypeInfo::decode(&mut Reader::exact(&data), ProtocolTier::Denali),
            Err(WireError::Protocol(_))
        ));
    }
}
