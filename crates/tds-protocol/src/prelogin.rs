//! PRELOGIN message handling and encryption negotiation.
//!
//! The pre-login message is the first exchange on a new transport. It is a
//! directory of `(option id, offset, length)` entries terminated by `0xFF`,
//! followed by the option data. Unlike the rest of the protocol, offsets,
//! lengths and the version word are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::ProtocolError;
use crate::wire::Reader;

/// Pre-login option ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PreLoginOption {
    /// Version information.
    Version = 0x00,
    /// Encryption negotiation.
    Encryption = 0x01,
    /// Instance name (for named instances).
    Instance = 0x02,
    /// Client thread id.
    ThreadId = 0x03,
    /// MARS support.
    Mars = 0x04,
    /// Activity id for tracing.
    TraceId = 0x05,
    /// Federated authentication required.
    FedAuthRequired = 0x06,
    /// Nonce.
    Nonce = 0x07,
    /// End of the option directory.
    Terminator = 0xFF,
}

impl PreLoginOption {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Version),
            0x01 => Ok(Self::Encryption),
            0x02 => Ok(Self::Instance),
            0x03 => Ok(Self::ThreadId),
            0x04 => Ok(Self::Mars),
            0x05 => Ok(Self::TraceId),
            0x06 => Ok(Self::FedAuthRequired),
            0x07 => Ok(Self::Nonce),
            0xFF => Ok(Self::Terminator),
            _ => Err(ProtocolError::InvalidPreloginOption(value)),
        }
    }
}

/// Encryption level exchanged in PRELOGIN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum EncryptionLevel {
    /// Encrypt the login only.
    #[default]
    Off = 0x00,
    /// Encrypt the whole session.
    On = 0x01,
    /// No TLS available.
    NotSupported = 0x02,
    /// Encryption is mandatory.
    Required = 0x03,
}

impl EncryptionLevel {
    /// Create from raw byte value.
    pub fn from_u8(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::On),
            0x02 => Ok(Self::NotSupported),
            0x03 => Ok(Self::Required),
            _ => Err(ProtocolError::InvalidField {
                field: "prelogin encryption",
                value: u64::from(value),
            }),
        }
    }
}

/// Outcome of encryption negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Plaintext session.
    None,
    /// TLS for the LOGIN7 exchange only.
    LoginOnly,
    /// TLS for the whole session.
    Full,
}

/// Encryption settings the two sides cannot agree on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EncryptionRefused {
    /// The client asked for encryption the server cannot do.
    #[error("encryption requested but the server does not support it")]
    ServerNotSupported,
    /// The server insists on encryption the client cannot do.
    #[error("the server requires encryption but the client does not support it")]
    ServerRequires,
}

/// Combine the client's request with the server's answer.
pub fn negotiate_encryption(
    client: EncryptionLevel,
    server: EncryptionLevel,
) -> Result<EncryptionMode, EncryptionRefused> {
    use EncryptionLevel::{NotSupported, Off, On, Required};
    match (client, server) {
        (On | Required, NotSupported) => Err(EncryptionRefused::ServerNotSupported),
        (On | Required, _) => Ok(EncryptionMode::Full),
        (Off, Off) => Ok(EncryptionMode::LoginOnly),
        (Off, On | Required) => Ok(EncryptionMode::Full),
        (Off, NotSupported) => Ok(EncryptionMode::None),
        (NotSupported, Required) => Err(EncryptionRefused::ServerRequires),
        (NotSupported, _) => Ok(EncryptionMode::None),
    }
}

/// Product version carried in the VERSION option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProductVersion {
    /// Major version.
    pub major: u8,
    /// Minor version.
    pub minor: u8,
    /// Build number.
    pub build: u16,
    /// Sub-build number.
    pub sub_build: u16,
}

/// Activity id sent for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceId {
    /// Connection id.
    pub connection_id: [u8; 16],
    /// Activity id.
    pub activity_id: [u8; 16],
    /// Activity sequence.
    pub activity_sequence: u32,
}

/// Pre-login message, used for both the request and the response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreLogin {
    /// Client or server product version.
    pub version: ProductVersion,
    /// Encryption level.
    pub encryption: EncryptionLevel,
    /// Instance name (request).
    pub instance: Option<String>,
    /// Instance check result (response); zero means the instance matched.
    pub instance_status: Option<u8>,
    /// Thread id.
    pub thread_id: Option<u32>,
    /// MARS requested or granted.
    pub mars: bool,
    /// Trace id.
    pub trace_id: Option<TraceId>,
    /// Federated authentication required.
    pub fed_auth_required: bool,
    /// Nonce.
    pub nonce: Option<[u8; 32]>,
}

impl PreLogin {
    /// Create a request with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the client version.
    #[must_use]
    pub fn with_version(mut self, version: ProductVersion) -> Self {
        self.version = version;
        self
    }

    /// Set the encryption level.
    #[must_use]
    pub fn with_encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Request MARS.
    #[must_use]
    pub fn with_mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Set the instance name.
    #[must_use]
    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the thread id.
    #[must_use]
    pub fn with_thread_id(mut self, thread_id: u32) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    /// Set the trace id.
    #[must_use]
    pub fn with_trace_id(mut self, trace_id: TraceId) -> Self {
        self.trace_id = Some(trace_id);
        self
    }

    /// Ask for federated authentication.
    #[must_use]
    pub fn with_fed_auth_required(mut self, required: bool) -> Self {
        self.fed_auth_required = required;
        self
    }

    /// The server reported that the named instance did not match.
    #[must_use]
    pub fn is_instance_failure(&self) -> bool {
        matches!(self.instance_status, Some(status) if status != 0)
    }

    /// Encode the message payload.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut options: Vec<(PreLoginOption, Vec<u8>)> = Vec::with_capacity(8);

        let mut version = Vec::with_capacity(6);
        version.put_u8(self.version.major);
        version.put_u8(self.version.minor);
        version.put_u16(self.version.build);
        version.put_u16_le(self.version.sub_build);
        options.push((PreLoginOption::Version, version));
        options.push((PreLoginOption::Encryption, vec![self.encryption as u8]));

        if let Some(instance) = &self.instance {
            let mut data = instance.as_bytes().to_vec();
            data.push(0);
            options.push((PreLoginOption::Instance, data));
        } else if let Some(status) = self.instance_status {
            options.push((PreLoginOption::Instance, vec![status]));
        }
        if let Some(thread_id) = self.thread_id {
            options.push((PreLoginOption::ThreadId, thread_id.to_be_bytes().to_vec()));
        }
        options.push((PreLoginOption::Mars, vec![u8::from(self.mars)]));
        if let Some(trace) = &self.trace_id {
            let mut data = Vec::with_capacity(36);
            data.put_slice(&trace.connection_id);
            data.put_slice(&trace.activity_id);
            data.put_u32_le(trace.activity_sequence);
            options.push((PreLoginOption::TraceId, data));
        }
        if self.fed_auth_required {
            options.push((PreLoginOption::FedAuthRequired, vec![0x01]));
        }
        if let Some(nonce) = &self.nonce {
            options.push((PreLoginOption::Nonce, nonce.to_vec()));
        }

        let directory_size = options.len() * 5 + 1;
        let data_size: usize = options.iter().map(|(_, d)| d.len()).sum();
        let mut buf = BytesMut::with_capacity(directory_size + data_size);
        let mut offset = directory_size;
        for (option, data) in &options {
            buf.put_u8(*option as u8);
            buf.put_u16(offset as u16);
            buf.put_u16(data.len() as u16);
            offset += data.len();
        }
        buf.put_u8(PreLoginOption::Terminator as u8);
        for (_, data) in &options {
            buf.put_slice(data);
        }
        buf.freeze()
    }

    /// Decode a complete PRELOGIN payload.
    ///
    /// Offsets are absolute from the start of the payload. An empty payload
    /// or an option pointing outside it is fatal.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::exact(payload);
        let mut entries = Vec::with_capacity(8);
        loop {
            let id = r.read_u8().map_err(directory_error)?;
            if id == PreLoginOption::Terminator as u8 {
                break;
            }
            let offset = r.read_u16_be().map_err(directory_error)? as usize;
            let length = r.read_u16_be().map_err(directory_error)? as usize;
            entries.push((PreLoginOption::from_u8(id)?, offset, length));
        }

        let mut out = Self::default();
        for (option, offset, length) in entries {
            let data = payload
                .get(offset..offset + length)
                .ok_or(ProtocolError::InvalidField {
                    field: "prelogin option offset",
                    value: offset as u64,
                })?;
            match option {
                PreLoginOption::Version if length >= 6 => {
                    out.version = ProductVersion {
                        major: data[0],
                        minor: data[1],
                        build: u16::from_be_bytes([data[2], data[3]]),
                        sub_build: u16::from_le_bytes([data[4], data[5]]),
                    };
                }
                PreLoginOption::Encryption if length >= 1 => {
                    out.encryption = EncryptionLevel::from_u8(data[0])?;
                }
                PreLoginOption::Instance if length == 1 => {
                    out.instance_status = Some(data[0]);
                }
                PreLoginOption::Instance if length > 1 => {
                    let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
                    let name = core::str::from_utf8(&data[..end])
                        .map_err(|_| ProtocolError::StringEncoding("prelogin instance name"))?;
                    out.instance = Some(name.to_string());
                }
                PreLoginOption::ThreadId if length >= 4 => {
                    out.thread_id = Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
                }
                PreLoginOption::Mars if length >= 1 => {
                    out.mars = data[0] != 0;
                }
                PreLoginOption::TraceId if length >= 36 => {
                    let mut connection_id = [0u8; 16];
                    let mut activity_id = [0u8; 16];
                    connection_id.copy_from_slice(&data[..16]);
                    activity_id.copy_from_slice(&data[16..32]);
                    out.trace_id = Some(TraceId {
                        connection_id,
                        activity_id,
                        activity_sequence: u32::from_le_bytes([
                            data[32], data[33], data[34], data[35],
                        ]),
                    });
                }
                PreLoginOption::FedAuthRequired if length >= 1 => {
                    out.fed_auth_required = data[0] != 0;
                }
                PreLoginOption::Nonce if length >= 32 => {
                    let mut nonce = [0u8; 32];
                    nonce.copy_from_slice(&data[..32]);
                    out.nonce = Some(nonce);
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

fn directory_error(e: crate::wire::WireError) -> ProtocolError {
    match e {
        crate::wire::WireError::Protocol(e) => e,
        crate::wire::WireError::Incomplete => ProtocolError::Truncated {
            what: "prelogin option directory",
            needed: 1,
            available: 0,
        },
    }
}
