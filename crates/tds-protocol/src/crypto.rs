//! Column encryption metadata.
//!
//! When the column-encryption feature is acknowledged, COLMETADATA starts
//! with a cipher info table (the column encryption keys the result set
//! needs), and every encrypted column or return value carries a crypto
//! metadata block after its ciphertext TYPE_INFO.
//!
//! ```text
//! CEK table:      count u16, entries
//! CEK entry:      database id u32, cek id u32, cek version u32,
//!                 cek md version u64, value count u8, values
//! CEK value:      length u16, encrypted key, key store B_VARCHAR,
//!                 key path US_VARCHAR, algorithm B_VARCHAR
//! crypto block:   [ordinal u16], user type u32, base TYPE_INFO,
//!                 algorithm u8, [algorithm name B_VARCHAR when 0],
//!                 encryption type u8, normalization version u8
//! ```

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::metadata::TypeInfo;
use crate::version::ProtocolTier;
use crate::wire::{Reader, WireResult};

/// Algorithm id for a custom, name-identified algorithm.
pub const ALGORITHM_CUSTOM: u8 = 0;

/// AEAD_AES_256_CBC_HMAC_SHA256.
pub const ALGORITHM_AEAD_AES_256_CBC_HMAC_SHA256: u8 = 2;

/// Normalization rule version understood by this engine.
pub const NORMALIZATION_RULE_VERSION: u8 = 1;

/// Highest column-encryption feature version this engine supports.
pub const MAX_SUPPORTED_CE_VERSION: u8 = 1;

/// How a column is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionType {
    /// Plaintext; only reported for parameters.
    Plaintext,
    /// Same plaintext produces the same ciphertext.
    Deterministic,
    /// Ciphertext is randomized.
    Randomized,
}

impl EncryptionType {
    /// Parse the wire byte.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0 => Ok(Self::Plaintext),
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Randomized),
            _ => Err(ProtocolError::InvalidField {
                field: "encryption type",
                value: u64::from(value),
            }),
        }
    }

    /// Wire byte.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Plaintext => 0,
            Self::Deterministic => 1,
            Self::Randomized => 2,
        }
    }
}

/// One encrypted copy of a column encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CekValue {
    /// Key encrypted with the column master key.
    pub encrypted_key: Bytes,
    /// Key store provider name.
    pub key_store: String,
    /// Column master key path within the store.
    pub key_path: String,
    /// Algorithm used to encrypt the key.
    pub algorithm: String,
}

impl CekValue {
    fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let encrypted_key = Bytes::copy_from_slice(r.read_us_varbyte()?);
        let key_store = r.read_b_varchar()?;
        let key_path = r.read_us_varchar()?;
        let algorithm = r.read_b_varchar()?;
        Ok(Self {
            encrypted_key,
            key_store,
            key_path,
            algorithm,
        })
    }
}

/// One column encryption key referenced by ordinal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CekEntry {
    /// Database id.
    pub database_id: u32,
    /// Key id.
    pub key_id: u32,
    /// Key version.
    pub key_version: u32,
    /// Key metadata version.
    pub md_version: u64,
    /// Encrypted copies, one per column master key.
    pub values: Vec<CekValue>,
}

/// Cipher info table sent ahead of encrypted column metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CekTable {
    /// Entries indexed by ordinal.
    pub entries: Vec<CekEntry>,
}

impl CekTable {
    /// Decode a cipher info table.
    pub fn decode(r: &mut Reader<'_>) -> WireResult<Self> {
        let count = r.read_u16_le()? as usize;
        let mut entries = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let database_id = r.read_u32_le()?;
            let key_id = r.read_u32_le()?;
            let key_version = r.read_u32_le()?;
            let md_version = r.read_u64_le()?;
            let value_count = r.read_u8()? as usize;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(CekValue::decode(r)?);
            }
            entries.push(CekEntry {
                database_id,
                key_id,
                key_version,
                md_version,
                values,
            });
        }
        Ok(Self { entries })
    }

    /// Look up an entry by ordinal.
    #[must_use]
    pub fn get(&self, ordinal: u16) -> Option<&CekEntry> {
        self.entries.get(ordinal as usize)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-column or per-parameter encryption description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoMetadata {
    /// Ordinal into the cipher info table; `None` for return values.
    pub ordinal: Option<u16>,
    /// User type of the plaintext.
    pub user_type: u32,
    /// Plaintext TYPE_INFO.
    pub base_type: TypeInfo,
    /// Algorithm id.
    pub algorithm_id: u8,
    /// Algorithm name, present only for [`ALGORITHM_CUSTOM`].
    pub algorithm_name: Option<String>,
    /// Encryption type.
    pub encryption_type: EncryptionType,
    /// Normalization rule version.
    pub normalization_version: u8,
}

impl CryptoMetadata {
    /// Decode a crypto metadata block. Return values omit the ordinal.
    pub fn decode(r: &mut Reader<'_>, tier: ProtocolTier, with_ordinal: bool) -> WireResult<Self> {
        let ordinal = if with_ordinal {
            Some(r.read_u16_le()?)
        } else {
            None
        };
        let user_type = r.read_u32_le()?;
        let base_type = TypeInfo::decode(r, tier)?;
        let algorithm_id = r.read_u8()?;
        let algorithm_name = if algorithm_id == ALGORITHM_CUSTOM {
            Some(r.read_b_varchar()?)
        } else {
            None
        };
        let encryption_type = EncryptionType::from_u8(r.read_u8()?)?;
        let normalization_version = r.read_u8()?;
        Ok(Self {
            ordinal,
            user_type,
            base_type,
            algorithm_id,
            algorithm_name,
            encryption_type,
            normalization_version,
        })
    }

    /// Check the block against the cipher table it refers to.
    pub fn validate(&self, table: Option<&CekTable>) -> Result<(), ProtocolError> {
        if self.normalization_version != NORMALIZATION_RULE_VERSION {
            return Err(ProtocolError::InvalidField {
                field: "normalization rule version",
                value: u64::from(self.normalization_version),
            });
        }
        if let (Some(ordinal), Some(table)) = (self.ordinal, table) {
            if table.get(ordinal).is_none() {
                return Err(ProtocolError::InvalidField {
                    field: "cipher table ordinal",
                    value: u64::from(ordinal),
                });
            }
        }
        Ok(())
    }
}
