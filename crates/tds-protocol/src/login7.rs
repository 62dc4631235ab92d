//! LOGIN7 message construction.
//!
//! LOGIN7 is a 94-byte fixed header followed by a data region that the
//! header addresses with `(offset, length)` pairs. Offsets are absolute
//! from the start of the message; string lengths count UTF-16 code units.
//! When feature extensions are present, the otherwise unused "extension"
//! slot holds a 4-byte pointer to the feature block at the very end.
//!
//! Passwords are obfuscated, not encrypted: every byte has its nibbles
//! swapped and is then XORed with `0xA5`.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{utf16_len, write_utf16_string};
use crate::error::ProtocolError;
use crate::token::{FEATURE_TERMINATOR, FeatureId};
use crate::version::{ProtocolTier, TdsVersion};

/// Size of the fixed LOGIN7 header.
pub const LOGIN7_HEADER_SIZE: usize = 94;

bitflags! {
    /// OptionFlags1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags1: u8 {
        /// Big-endian byte order.
        const BYTE_ORDER_BE = 0x01;
        /// EBCDIC character set.
        const CHAR_EBCDIC = 0x02;
        /// Dump/load off.
        const DUMP_LOAD_OFF = 0x10;
        /// Report database changes as ENVCHANGE.
        const USE_DB = 0x20;
        /// Failing to switch to the initial database fails the login.
        const INIT_DB_FATAL = 0x40;
        /// Report language changes as ENVCHANGE.
        const SET_LANG = 0x80;
    }
}

bitflags! {
    /// OptionFlags2.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags2: u8 {
        /// Failing to switch to the initial language fails the login.
        const INIT_LANG_FATAL = 0x01;
        /// ODBC client.
        const ODBC = 0x02;
        /// Replication login (user type 3).
        const USER_REPLICATION = 0x30;
        /// Integrated security (SSPI).
        const INTEGRATED_SECURITY = 0x80;
    }
}

bitflags! {
    /// TypeFlags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeFlags: u8 {
        /// T-SQL client.
        const SQL_TSQL = 0x01;
        /// OLE DB client.
        const OLEDB = 0x10;
        /// Read-only application intent.
        const READ_ONLY_INTENT = 0x20;
    }
}

bitflags! {
    /// OptionFlags3.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OptionFlags3: u8 {
        /// A new password follows.
        const CHANGE_PASSWORD = 0x01;
        /// Start a user instance.
        const USER_INSTANCE = 0x02;
        /// Binary XML understood.
        const BINARY_XML = 0x04;
        /// Accept collations the client does not know.
        const UNKNOWN_COLLATION_HANDLING = 0x08;
        /// Feature extension block present.
        const EXTENSION = 0x10;
    }
}

/// Federated authentication library.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FedAuthLibrary {
    /// The client already holds a security token.
    SecurityToken = 0x01,
    /// The server drives a token workflow (FEDAUTHINFO follows).
    Msal = 0x02,
}

/// One feature extension entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureExtension {
    /// Feature id.
    pub feature_id: FeatureId,
    /// Feature data.
    pub data: Bytes,
}

impl FeatureExtension {
    /// Session recovery with the serialized recovery data (empty on a fresh
    /// login).
    #[must_use]
    pub fn session_recovery(data: Bytes) -> Self {
        Self {
            feature_id: FeatureId::SessionRecovery,
            data,
        }
    }

    /// Federated authentication.
    #[must_use]
    pub fn fed_auth(library: FedAuthLibrary, echo: bool, token: Option<&[u8]>) -> Self {
        let mut data = BytesMut::new();
        data.put_u8(((library as u8) << 1) | u8::from(echo));
        match (library, token) {
            (FedAuthLibrary::SecurityToken, Some(token)) => {
                data.put_u32_le(token.len() as u32);
                data.put_slice(token);
            }
            (FedAuthLibrary::SecurityToken, None) => data.put_u32_le(0),
            (FedAuthLibrary::Msal, _) => data.put_u8(0x01),
        }
        Self {
            feature_id: FeatureId::FedAuth,
            data: data.freeze(),
        }
    }

    /// Column encryption at `version`.
    #[must_use]
    pub fn column_encryption(version: u8) -> Self {
        Self {
            feature_id: FeatureId::ColumnEncryption,
            data: Bytes::copy_from_slice(&[version]),
        }
    }

    /// Global transactions.
    #[must_use]
    pub fn global_transactions() -> Self {
        Self {
            feature_id: FeatureId::GlobalTransactions,
            data: Bytes::new(),
        }
    }

    /// UTF-8 collations.
    #[must_use]
    pub fn utf8_support() -> Self {
        Self {
            feature_id: FeatureId::Utf8Support,
            data: Bytes::new(),
        }
    }
}

/// LOGIN7 message.
#[derive(Debug, Clone)]
pub struct Login7 {
    /// Requested TDS version.
    pub tds_version: TdsVersion,
    /// Requested packet size.
    pub packet_size: u32,
    /// Client program version.
    pub client_prog_version: u32,
    /// Client process id.
    pub client_pid: u32,
    /// Connection id.
    pub connection_id: u32,
    /// OptionFlags1.
    pub flags1: OptionFlags1,
    /// OptionFlags2.
    pub flags2: OptionFlags2,
    /// TypeFlags.
    pub type_flags: TypeFlags,
    /// OptionFlags3.
    pub flags3: OptionFlags3,
    /// Client time zone, unused by servers.
    pub client_timezone: i32,
    /// Client LCID, unused by servers.
    pub client_lcid: u32,
    /// Client machine name.
    pub hostname: String,
    /// SQL login name.
    pub username: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client knows it.
    pub server_name: String,
    /// Client library name.
    pub library_name: String,
    /// Initial language.
    pub language: String,
    /// Initial database.
    pub database: String,
    /// Client network id.
    pub client_id: [u8; 6],
    /// SSPI blob for integrated security.
    pub sspi: Bytes,
    /// Database file to attach.
    pub attach_db_file: String,
    /// New password for a password change.
    pub new_password: String,
    /// Feature extensions.
    pub features: Vec<FeatureExtension>,
}

impl Default for Login7 {
    fn default() -> Self {
        Self {
            tds_version: ProtocolTier::LATEST.version(),
            packet_size: crate::packet::DEFAULT_PACKET_SIZE as u32,
            client_prog_version: 0,
            client_pid: std::process::id(),
            connection_id: 0,
            flags1: OptionFlags1::USE_DB | OptionFlags1::INIT_DB_FATAL | OptionFlags1::SET_LANG,
            flags2: OptionFlags2::INIT_LANG_FATAL | OptionFlags2::ODBC,
            type_flags: TypeFlags::empty(),
            flags3: OptionFlags3::UNKNOWN_COLLATION_HANDLING,
            client_timezone: 0,
            client_lcid: 0,
            hostname: String::new(),
            username: String::new(),
            password: String::new(),
            app_name: String::new(),
            server_name: String::new(),
            library_name: String::from("tds-engine"),
            language: String::new(),
            database: String::new(),
            client_id: [0u8; 6],
            sspi: Bytes::new(),
            attach_db_file: String::new(),
            new_password: String::new(),
            features: Vec::new(),
        }
    }
}

/// Variable fields in header order.
enum Field<'a> {
    Text(&'a str),
    Password(&'a str),
    Extension,
}

impl Login7 {
    /// Create a LOGIN7 with default flags.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use SQL authentication.
    #[must_use]
    pub fn with_sql_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self.flags2.remove(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Use integrated security with an initial SSPI blob.
    #[must_use]
    pub fn with_sspi(mut self, sspi: Bytes) -> Self {
        self.sspi = sspi;
        self.flags2.insert(OptionFlags2::INTEGRATED_SECURITY);
        self
    }

    /// Request a password change.
    #[must_use]
    pub fn with_new_password(mut self, new_password: impl Into<String>) -> Self {
        self.new_password = new_password.into();
        self.flags3.insert(OptionFlags3::CHANGE_PASSWORD);
        self
    }

    /// Set read-only application intent.
    #[must_use]
    pub fn with_read_only_intent(mut self, read_only: bool) -> Self {
        self.type_flags.set(TypeFlags::READ_ONLY_INTENT, read_only);
        self
    }

    /// Mark the login as a replication login.
    #[must_use]
    pub fn with_replication(mut self, replication: bool) -> Self {
        self.flags2.set(OptionFlags2::USER_REPLICATION, replication);
        self
    }

    /// Add a feature extension.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureExtension) -> Self {
        self.flags3.insert(OptionFlags3::EXTENSION);
        self.features.push(feature);
        self
    }

    /// Encode the message payload.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let has_extension = !self.features.is_empty();
        let mut flags3 = self.flags3;
        flags3.set(OptionFlags3::EXTENSION, has_extension);

        let before_client_id = [
            Field::Text(&self.hostname),
            Field::Text(&self.username),
            Field::Password(&self.password),
            Field::Text(&self.app_name),
            Field::Text(&self.server_name),
            Field::Extension,
            Field::Text(&self.library_name),
            Field::Text(&self.language),
            Field::Text(&self.database),
        ];

        let mut data = BytesMut::with_capacity(256);
        let mut pairs: Vec<(usize, usize)> = Vec::with_capacity(12);
        let mut extension_slot = None;
        for field in &before_client_id {
            let offset = LOGIN7_HEADER_SIZE + data.len();
            let len = match field {
                Field::Text(s) => {
                    write_utf16_string(&mut data, s);
                    utf16_len(s)
                }
                Field::Password(s) => {
                    write_obfuscated(&mut data, s);
                    utf16_len(s)
                }
                Field::Extension if has_extension => {
                    extension_slot = Some(data.len());
                    data.put_u32_le(0);
                    4
                }
                Field::Extension => 0,
            };
            pairs.push((offset, len));
        }

        let sspi_offset = LOGIN7_HEADER_SIZE + data.len();
        data.put_slice(&self.sspi);
        let attach_offset = LOGIN7_HEADER_SIZE + data.len();
        write_utf16_string(&mut data, &self.attach_db_file);
        let new_password_offset = LOGIN7_HEADER_SIZE + data.len();
        write_obfuscated(&mut data, &self.new_password);

        if let Some(slot) = extension_slot {
            let feature_offset = (LOGIN7_HEADER_SIZE + data.len()) as u32;
            data[slot..slot + 4].copy_from_slice(&feature_offset.to_le_bytes());
            for feature in &self.features {
                data.put_u8(feature.feature_id as u8);
                data.put_u32_le(feature.data.len() as u32);
                data.put_slice(&feature.data);
            }
            data.put_u8(FEATURE_TERMINATOR);
        }

        let total = LOGIN7_HEADER_SIZE + data.len();
        if new_password_offset > u16::MAX as usize {
            return Err(ProtocolError::FieldTooLong {
                field: "LOGIN7 data",
                len: new_password_offset,
                max: u16::MAX as usize,
            });
        }

        let mut buf = BytesMut::with_capacity(total);
        buf.put_u32_le(total as u32);
        buf.put_u32_le(self.tds_version.raw());
        buf.put_u32_le(self.packet_size);
        buf.put_u32_le(self.client_prog_version);
        buf.put_u32_le(self.client_pid);
        buf.put_u32_le(self.connection_id);
        buf.put_u8(self.flags1.bits());
        buf.put_u8(self.flags2.bits());
        buf.put_u8(self.type_flags.bits());
        buf.put_u8(flags3.bits());
        buf.put_i32_le(self.client_timezone);
        buf.put_u32_le(self.client_lcid);
        for (offset, len) in pairs {
            buf.put_u16_le(offset as u16);
            buf.put_u16_le(len as u16);
        }
        buf.put_slice(&self.client_id);
        buf.put_u16_le(sspi_offset as u16);
        if self.sspi.len() >= u16::MAX as usize {
            buf.put_u16_le(u16::MAX);
        } else {
            buf.put_u16_le(self.sspi.len() as u16);
        }
        buf.put_u16_le(attach_offset as u16);
        buf.put_u16_le(utf16_len(&self.attach_db_file) as u16);
        buf.put_u16_le(new_password_offset as u16);
        buf.put_u16_le(utf16_len(&self.new_password) as u16);
        if self.sspi.len() >= u16::MAX as usize {
            buf.put_u32_le(self.sspi.len() as u32);
        } else {
            buf.put_u32_le(0);
        }
        debug_assert_eq!(buf.len(), LOGIN7_HEADER_SIZE);
        buf.put_slice(&data);
        Ok(buf.freeze())
    }
}

/// Obfuscate a password the way LOGIN7 carries it.
pub fn write_obfuscated(dst: &mut impl BufMut, password: &str) {
    for unit in password.encode_utf16() {
        for byte in unit.to_le_bytes() {
            dst.put_u8(byte.rotate_right(4) ^ 0xA5);
        }
    }
}

/// Reverse [`write_obfuscated`].
#[must_use]
pub fn deobfuscate(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| (b ^ 0xA5).rotate_left(4)).collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::codec::decode_utf16;

    fn field(encoded: &[u8], index: usize) -> (usize, usize) {
        let at = 36 + index * 4;
        (
            u16::from_le_bytes([encoded[at], encoded[at + 1]]) as usize,
            u16::from_le_bytes([encoded[at + 2], encoded[at + 3]]) as usize,
        )
    }

    #[test]
    fn password_obfuscation() {
        let mut buf = Vec::new();
        write_obfuscated(&mut buf, "a");
        assert_eq!(buf, [0xB3, 0xA5]);
        assert_eq!(deobfuscate(&buf), [0x61, 0x00]);
    }

    #[test]
    fn header_and_fields() {
        let login = Login7::new()
            .with_sql_auth("sa", "pw")
            .with_read_only_intent(true);
        let login = Login7 {
            hostname: "HOST".into(),
            database: "db".into(),
            packet_size: 8192,
            ..login
        };
        let encoded = login.encode().unwrap();
        assert_eq!(
            u32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize,
            encoded.len()
        );
        assert_eq!(&encoded[4..8], &0x7400_0004u32.to_le_bytes());
        assert_eq!(&encoded[8..12], &8192u32.to_le_bytes());
        assert_eq!(encoded[26], TypeFlags::READ_ONLY_INTENT.bits());

        let (offset, len) = field(&encoded, 0);
        assert_eq!(offset, LOGIN7_HEADER_SIZE);
        assert_eq!(decode_utf16(&encoded[offset..offset + len * 2]).unwrap(), "HOST");

        let (offset, len) = field(&encoded, 2);
        let clear = deobfuscate(&encoded[offset..offset + len * 2]);
        assert_eq!(decode_utf16(&clear).unwrap(), "pw");

        let (offset, len) = field(&encoded, 8);
        assert_eq!(decode_utf16(&encoded[offset..offset + len * 2]).unwrap(), "db");
    }

    #[test]
    fn feature_block_is_addressed_by_the_extension_slot() {
        let login = Login7::new()
            .with_feature(FeatureExtension::column_encryption(1))
            .with_feature(FeatureExtension::global_transactions());
        let encoded = login.encode().unwrap();
        assert_ne!(encoded[27] & OptionFlags3::EXTENSION.bits(), 0);

        let (slot, len) = field(&encoded, 5);
        assert_eq!(len, 4);
        let block = u32::from_le_bytes([
            encoded[slot],
            encoded[slot + 1],
            encoded[slot + 2],
            encoded[slot + 3],
        ]) as usize;
        assert_eq!(
            &encoded[block..],
            &[0x04, 1, 0, 0, 0, 1, 0x05, 0, 0, 0, 0, FEATURE_TERMINATOR]
        );
    }

    #[test]
    fn change_password_sets_flag_and_field() {
        let encoded = Login7::new()
            .with_sql_auth("u", "old")
            .with_new_password("new")
            .encode()
            .unwrap();
        assert_ne!(encoded[27] & OptionFlags3::CHANGE_PASSWORD.bits(), 0);
        let at = 36 + 9 * 4 + 6 + 8;
        let offset = u16::from_le_bytes([encoded[at], encoded[at + 1]]) as usize;
        let len = u16::from_le_bytes([encoded[at + 2], encoded[at + 3]]) as usize;
        let clear = deobfuscate(&encoded[offset..offset + len * 2]);
        assert_eq!(decode_utf16(&clear).unwrap(), "new");
    }

    #[test]
    fn sspi_sets_integrated_security() {
        let encoded = Login7::new()
            .with_sspi(Bytes::from_static(b"NTLMSSP"))
            .encode()
            .unwrap();
        assert_ne!(encoded[25] & OptionFlags2::INTEGRATED_SECURITY.bits(), 0);
        let at = 36 + 9 * 4 + 6;
        let offset = u16::from_le_bytes([encoded[at], encoded[at + 1]]) as usize;
        assert_eq!(&encoded[offset..offset + 7], b"NTLMSSP");
    }

    #[test]
    fn fed_auth_feature_data() {
        let f = FeatureExtension::fed_auth(FedAuthLibrary::SecurityToken, true, Some(b"tok"));
        assert_eq!(f.data.as_ref(), &[0x03, 3, 0, 0, 0, b't', b'o', b'k']);
        let f = FeatureExtension::fed_auth(FedAuthLibrary::Msal, false, None);
        assert_eq!(f.data.as_ref(), &[0x04, 0x01]);
    }
}
