//! Rows and the resumable row decoder.
//!
//! A ROW token carries every column in order; an NBCROW token starts with a
//! null bitmap of `ceil(columns / 8)` bytes and omits the masked columns.
//! The decoder keeps its position between calls, so a row split across
//! packets is picked up where it stopped. Small values are decoded whole or
//! not at all; PLP values advance chunk by chunk.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tds_codec::Channel;
use tds_protocol::crypto::CekTable;
use tds_protocol::metadata::ColumnDescriptor;
use tds_protocol::wire::Step;
use tds_protocol::ProtocolError;
use tds_values::{
    FromSql, PlpMode, PlpReader, PlpValue, SqlValue, ValueError, decode_value, denormalize,
    skip_value,
};

use crate::error::{Error, Result};
use crate::input::decode_from;
use crate::security::KeyProvider;

/// Whether the caller wants the values of the next row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowAction {
    /// Decode the values.
    #[default]
    Materialize,
    /// Step over the row reading only lengths.
    Skip,
}

/// One decoded row.
#[derive(Clone)]
pub struct Row {
    columns: Arc<[ColumnDescriptor]>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Row over `columns` with one value per column.
    #[must_use]
    pub fn new(columns: Arc<[ColumnDescriptor]>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column descriptors.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    /// Raw value of a column.
    #[must_use]
    pub fn value(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Whether a column is NULL. Out-of-range columns count as NULL.
    #[must_use]
    pub fn is_null(&self, index: usize) -> bool {
        self.values.get(index).is_none_or(SqlValue::is_null)
    }

    /// Convert a column.
    pub fn get<T: FromSql>(&self, index: usize) -> Result<T> {
        let value = self.values.get(index).ok_or_else(|| {
            Error::Config(format!("column index {index} out of range ({} columns)", self.len()))
        })?;
        Ok(T::from_sql(value)?)
    }

    /// Convert a column looked up by name, case-insensitively.
    pub fn get_by_name<T: FromSql>(&self, name: &str) -> Result<T> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Config(format!("no column named {name}")))?;
        self.get(index)
    }

    /// Take the values.
    #[must_use]
    pub fn into_values(self) -> Vec<SqlValue> {
        self.values
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.columns.iter().map(|c| &c.name).zip(&self.values))
            .finish()
    }
}

/// Decodes the body of one ROW or NBCROW token.
#[derive(Debug)]
pub(crate) struct RowDecoder {
    columns: Arc<[ColumnDescriptor]>,
    action: RowAction,
    compressed: bool,
    bitmap: Option<Vec<u8>>,
    index: usize,
    values: Vec<SqlValue>,
    plp: Option<PlpReader>,
}

impl RowDecoder {
    /// Decoder for a row of `columns`, the token byte already consumed.
    pub(crate) fn new(columns: Arc<[ColumnDescriptor]>, compressed: bool, action: RowAction) -> Self {
        let capacity = match action {
            RowAction::Materialize => columns.len(),
            RowAction::Skip => 0,
        };
        Self {
            columns,
            action,
            compressed,
            bitmap: None,
            index: 0,
            values: Vec::with_capacity(capacity),
            plp: None,
        }
    }

    pub(crate) fn action(&self) -> RowAction {
        self.action
    }

    pub(crate) fn columns(&self) -> &Arc<[ColumnDescriptor]> {
        &self.columns
    }

    /// Step over the rest of the row, keeping the position.
    pub(crate) fn skip_remaining(&mut self) {
        self.action = RowAction::Skip;
        self.values.clear();
    }

    fn masked(&self, index: usize) -> bool {
        self.bitmap
            .as_ref()
            .is_some_and(|bits| bits[index / 8] & (1 << (index % 8)) != 0)
    }

    fn push(&mut self, value: SqlValue) {
        if self.action == RowAction::Materialize {
            self.values.push(value);
        }
    }

    /// Decode as far as the buffered payload allows.
    ///
    /// Returns the values once the row is complete; empty when skipping.
    pub(crate) fn advance(&mut self, ch: &mut Channel) -> Result<Step<Vec<SqlValue>>> {
        if self.compressed && self.bitmap.is_none() {
            let len = self.columns.len().div_ceil(8);
            match decode_from(ch, |r| Ok(r.read_bytes(len)?.to_vec()))? {
                Step::Ready(bits) => self.bitmap = Some(bits),
                Step::NeedMore => return Ok(Step::NeedMore),
            }
        }

        while self.index < self.columns.len() {
            let index = self.index;
            if self.masked(index) {
                self.push(SqlValue::Null);
                self.index += 1;
                continue;
            }

            let columns = Arc::clone(&self.columns);
            let info = &columns[index].type_info;
            if info.is_plp() {
                // Moves past the column before decoding its bytes.
                match self.advance_plp(ch, index)? {
                    Step::Ready(value) => self.push(value),
                    Step::NeedMore => return Ok(Step::NeedMore),
                }
                continue;
            }

            let step = match self.action {
                RowAction::Materialize => decode_from(ch, |r| Ok(decode_value(r, info)?))?,
                RowAction::Skip => {
                    decode_from(ch, |r| Ok(skip_value(r, info)?))?.map(|()| SqlValue::Null)
                }
            };
            match step {
                Step::Ready(value) => self.push(value),
                Step::NeedMore => return Ok(Step::NeedMore),
            }
            self.index += 1;
        }
        Ok(Step::Ready(std::mem::take(&mut self.values)))
    }

    fn advance_plp(&mut self, ch: &mut Channel, index: usize) -> Result<Step<SqlValue>> {
        let mode = match self.action {
            RowAction::Materialize => PlpMode::Materialize,
            RowAction::Skip => PlpMode::Skip,
        };
        let reader = self.plp.get_or_insert_with(|| PlpReader::new(mode));
        loop {
            // A PLP stream that disagrees with its own header is corrupt.
            let (used, done) = reader.advance(ch.payload()).map_err(|e| match e {
                ValueError::PlpLengthMismatch { received, .. } => {
                    Error::Protocol(ProtocolError::InvalidField {
                        field: "PLP length",
                        value: received,
                    })
                }
                other => Error::Value(other),
            })?;
            ch.consume(used);
            if let Some(value) = done {
                self.plp = None;
                self.index += 1;
                let info = &self.columns[index].type_info;
                return Ok(Step::Ready(match value {
                    PlpValue::Null | PlpValue::Skipped(_) => SqlValue::Null,
                    PlpValue::Data(data) => tds_values::decode::decode_bytes(info, &data)?,
                }));
            }
            // Whatever the reader left behind is a partial length field
            // that no later packet can complete.
            if ch.message_complete() {
                let available = ch.payload().len();
                return Err(ProtocolError::Truncated {
                    what: "PLP value",
                    needed: available + 1,
                    available,
                }
                .into());
            }
            if let Step::NeedMore = ch.try_fill()? {
                return Ok(Step::NeedMore);
            }
        }
    }
}

/// Turns ciphertext columns back into values.
pub struct Decryptor {
    keys: Arc<dyn KeyProvider>,
    server: String,
    cache: HashMap<u16, Bytes>,
}

impl Decryptor {
    /// Decryptor resolving keys for `server`.
    pub fn new(keys: Arc<dyn KeyProvider>, server: impl Into<String>) -> Self {
        Self {
            keys,
            server: server.into(),
            cache: HashMap::new(),
        }
    }

    /// Forget the keys of the previous result set.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    /// Decrypt every encrypted column of a row in place.
    pub fn decrypt_row(
        &mut self,
        columns: &[ColumnDescriptor],
        cek_table: Option<&CekTable>,
        values: &mut [SqlValue],
    ) -> Result<()> {
        for (column, value) in columns.iter().zip(values.iter_mut()) {
            let Some(crypto) = &column.crypto else {
                continue;
            };
            let SqlValue::Binary(ciphertext) = value else {
                continue;
            };
            let fail = |message: String| Error::Encryption {
                name: column.name.clone(),
                message,
            };

            let ordinal = crypto
                .ordinal
                .ok_or_else(|| fail("column has no key ordinal".into()))?;
            let key = match self.cache.get(&ordinal) {
                Some(key) => key.clone(),
                None => {
                    let entry = cek_table
                        .and_then(|t| t.get(ordinal))
                        .ok_or_else(|| fail(format!("no key at ordinal {ordinal}")))?;
                    let key = self
                        .keys
                        .decrypt_key(entry, &self.server)
                        .map_err(|e| fail(e.to_string()))?;
                    self.cache.insert(ordinal, key.clone());
                    key
                }
            };
            let plaintext = self
                .keys
                .decrypt_value(&key, crypto, ciphertext)
                .map_err(|e| fail(e.to_string()))?;
            *value = denormalize(&plaintext, &crypto.base_type).map_err(|e| fail(e.to_string()))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Decryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decryptor")
            .field("server", &self.server)
            .field("cached_keys", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tds_protocol::metadata::{ColMetaData, TypeInfo};
    use tds_protocol::types::{ColumnFlags, TypeId};
    use tds_protocol::version::ProtocolTier;
    use tds_protocol::wire::Reader;

    use super::*;

    fn int_columns(n: usize) -> Arc<[ColumnDescriptor]> {
        (0..n)
            .map(|i| ColumnDescriptor {
                user_type: 0,
                flags: ColumnFlags::NULLABLE,
                type_info: TypeInfo::fixed(TypeId::Int4),
                table_name: None,
                crypto: None,
                name: format!("c{i}"),
            })
            .collect()
    }

    fn message(payload: &[u8]) -> Vec<u8> {
        let len = (8 + payload.len()) as u16;
        let mut out = vec![0x04, 0x01];
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0, 0, 1, 0]);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn nbcrow_bitmap_masks_columns() {
        let mut payload = vec![0b0000_0101];
        for v in [11i32, 33, 44] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        let mut ch = Channel::new();
        ch.feed(&message(&payload));

        let mut decoder = RowDecoder::new(int_columns(5), true, RowAction::Materialize);
        let Step::Ready(values) = decoder.advance(&mut ch).unwrap() else {
            panic!("row incomplete");
        };
        assert_eq!(
            values,
            vec![
                SqlValue::Null,
                SqlValue::Int(11),
                SqlValue::Null,
                SqlValue::Int(33),
                SqlValue::Int(44)
            ]
        );
        assert!(ch.payload().is_empty());
    }

    #[test]
    fn skipped_rows_consume_the_same_bytes() {
        let mut payload = Vec::new();
        for v in [1i32, 2] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        payload.push(0xFD);
        let mut ch = Channel::new();
        ch.feed(&message(&payload));

        let mut decoder = RowDecoder::new(int_columns(2), false, RowAction::Skip);
        assert_eq!(decoder.advance(&mut ch).unwrap(), Step::Ready(vec![]));
        assert_eq!(ch.payload(), &[0xFD]);
    }

    #[test]
    fn plp_column_resumes_across_packets() {
        // One NVARCHAR(MAX) column: a PLP header plus two chunks.
        let mut meta = vec![0x01, 0x00];
        meta.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x00, 0xE7, 0xFF, 0xFF]);
        meta.extend_from_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        meta.extend_from_slice(&[0x01, b'n', 0x00]);
        let shape = ColMetaData::decode(&mut Reader::exact(&meta), ProtocolTier::Denali, false).unwrap();
        let columns: Arc<[ColumnDescriptor]> = shape.columns().to_vec().into();

        let mut value = Vec::new();
        value.extend_from_slice(&8u64.to_le_bytes());
        value.extend_from_slice(&4u32.to_le_bytes());
        value.extend_from_slice(&[b'h', 0, b'i', 0]);
        value.extend_from_slice(&4u32.to_le_bytes());
        value.extend_from_slice(&[b'!', 0, b'!', 0]);
        value.extend_from_slice(&0u32.to_le_bytes());

        let mut ch = Channel::new();
        let mut decoder = RowDecoder::new(columns, false, RowAction::Materialize);
        let (first, second) = value.split_at(14);

        let mut partial = vec![0x04, 0x00];
        partial.extend_from_slice(&((8 + first.len()) as u16).to_be_bytes());
        partial.extend_from_slice(&[0, 0, 1, 0]);
        partial.extend_from_slice(first);
        ch.feed(&partial);
        assert_eq!(decoder.advance(&mut ch).unwrap(), Step::NeedMore);
        assert!(ch.payload().is_empty());

        ch.feed(&message(second));
        let Step::Ready(values) = decoder.advance(&mut ch).unwrap() else {
            panic!("row incomplete");
        };
        assert_eq!(values, vec![SqlValue::String("hi!!".into())]);
    }

    #[test]
    fn final_packet_ending_inside_plp_header_is_truncated() {
        let mut meta = vec![0x01, 0x00];
        meta.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x00, 0xE7, 0xFF, 0xFF]);
        meta.extend_from_slice(&[0x09, 0x04, 0xD0, 0x00, 0x34]);
        meta.extend_from_slice(&[0x01, b'n', 0x00]);
        let shape = ColMetaData::decode(&mut Reader::exact(&meta), ProtocolTier::Denali, false).unwrap();
        let columns: Arc<[ColumnDescriptor]> = shape.columns().to_vec().into();

        // Three of the eight total-length bytes, then end of message.
        let mut ch = Channel::new();
        ch.feed(&message(&[0x08, 0x00, 0x00]));
        let mut decoder = RowDecoder::new(columns, false, RowAction::Materialize);
        let err = decoder.advance(&mut ch).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::Truncated { available: 3, .. })
        ));
        assert!(err.is_fatal());
    }

    struct XorKeys;

    impl KeyProvider for XorKeys {
        fn decrypt_key(&self, _entry: &tds_protocol::crypto::CekEntry, _server: &str) -> Result<Bytes> {
            Ok(Bytes::from_static(&[0xFF]))
        }

        fn decrypt_value(
            &self,
            key: &[u8],
            _crypto: &tds_protocol::crypto::CryptoMetadata,
            ciphertext: &[u8],
        ) -> Result<Bytes> {
            Ok(ciphertext.iter().map(|b| b ^ key[0]).collect())
        }

        fn encrypt_value(
            &self,
            key: &[u8],
            crypto: &tds_protocol::crypto::CryptoMetadata,
            plaintext: &[u8],
        ) -> Result<Bytes> {
            self.decrypt_value(key, crypto, plaintext)
        }
    }

    #[test]
    fn missing_key_names_the_column() {
        use tds_protocol::crypto::{CryptoMetadata, EncryptionType};

        let column = ColumnDescriptor {
            user_type: 0,
            flags: ColumnFlags::NULLABLE | ColumnFlags::ENCRYPTED,
            type_info: TypeInfo::fixed(TypeId::Int4),
            table_name: None,
            crypto: Some(CryptoMetadata {
                ordinal: Some(0),
                user_type: 0,
                base_type: TypeInfo::fixed(TypeId::Int4),
                algorithm_id: 2,
                algorithm_name: None,
                encryption_type: EncryptionType::Deterministic,
                normalization_version: 1,
            }),
            name: "ssn".into(),
        };
        let mut values = vec![SqlValue::Binary(Bytes::from_static(&[1, 2, 3]))];
        let mut decryptor = Decryptor::new(Arc::new(XorKeys), "srv");
        let err = decryptor
            .decrypt_row(std::slice::from_ref(&column), None, &mut values)
            .unwrap_err();
        match err {
            Error::Encryption { name, .. } => assert_eq!(name, "ssn"),
            other => panic!("unexpected error {other}"),
        }
    }
}
