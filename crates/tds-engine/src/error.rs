//! Engine error types.

use std::fmt;

use tds_codec::CodecError;
use tds_protocol::ProtocolError;
use tds_protocol::prelogin::EncryptionRefused;
use tds_protocol::token::ServerMessage;
use tds_values::ValueError;
use thiserror::Error;

/// Where a timeout struck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// PRELOGIN exchange.
    PreLogin,
    /// LOGIN7 exchange and its token run.
    Login,
    /// One failover slice of the login timeout; the overall deadline has not passed.
    LoginAttempt,
    /// A request after login.
    Command,
    /// Waiting for an attention acknowledgment.
    Attention,
}

impl Phase {
    /// A timeout here leaves nothing to recover.
    #[must_use]
    pub fn is_unrecoverable(self) -> bool {
        !matches!(self, Self::Command)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PreLogin => "prelogin",
            Self::Login => "login",
            Self::LoginAttempt => "login attempt",
            Self::Command => "command",
            Self::Attention => "attention acknowledgment",
        })
    }
}

/// ERROR and INFO messages collected over one run, in arrival order.
///
/// Iteration yields errors first, then warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerErrors {
    errors: Vec<ServerMessage>,
    warnings: Vec<ServerMessage>,
}

impl ServerErrors {
    /// Empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// File a message as error or warning by its class.
    pub fn push(&mut self, message: ServerMessage) {
        if message.is_info() {
            self.warnings.push(message);
        } else {
            self.errors.push(message);
        }
    }

    /// Errors, in arrival order.
    #[must_use]
    pub fn errors(&self) -> &[ServerMessage] {
        &self.errors
    }

    /// Informational messages, in arrival order.
    #[must_use]
    pub fn warnings(&self) -> &[ServerMessage] {
        &self.warnings
    }

    /// Errors followed by warnings.
    pub fn iter(&self) -> impl Iterator<Item = &ServerMessage> {
        self.errors.iter().chain(&self.warnings)
    }

    /// Nothing collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    /// At least one error-class message.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// At least one message at fatal class.
    #[must_use]
    pub fn has_fatal(&self) -> bool {
        self.errors.iter().any(ServerMessage::is_fatal)
    }

    /// Highest class among the errors.
    #[must_use]
    pub fn max_class(&self) -> Option<u8> {
        self.errors.iter().map(|e| e.class).max()
    }

    /// Take everything, leaving the collection empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

impl fmt::Display for ServerErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut all = self.iter();
        match all.next() {
            None => f.write_str("no server messages"),
            Some(first) => {
                write!(
                    f,
                    "server error {} (class {}, state {}): {}",
                    first.number, first.class, first.state, first.message
                )?;
                let rest = all.count();
                if rest > 0 {
                    write!(f, " (+{rest} more)")?;
                }
                Ok(())
            }
        }
    }
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or unexpected wire data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Framing or transport failure.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Value encoding or decoding failure.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// Errors reported by the server, warnings appended.
    #[error("{0}")]
    Server(ServerErrors),

    /// An operation outlived its deadline.
    #[error("{phase} timed out")]
    Timeout {
        /// Phase that timed out.
        phase: Phase,
    },

    /// Unrecoverable local failure; the session is doomed.
    #[error("catastrophic failure: {0}")]
    Catastrophic(String),

    /// Column encryption failure for one column or parameter.
    #[error("encryption error for {name}: {message}")]
    Encryption {
        /// Column or parameter name.
        name: String,
        /// What went wrong.
        message: String,
    },

    /// Encryption levels could not be reconciled during prelogin.
    #[error(transparent)]
    EncryptionRefused(#[from] EncryptionRefused),

    /// The session hit a fatal error earlier.
    #[error("session is broken")]
    Broken,

    /// The session is not open.
    #[error("session is closed")]
    Closed,

    /// The named instance did not answer. Reconnecting may reach it.
    #[error("named instance not available")]
    InstanceFailure,

    /// The server routed the login elsewhere.
    #[error("routed to {server}:{port}")]
    Routing {
        /// Target server.
        server: String,
        /// Target port.
        port: u16,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Security provider failure.
    #[error("security error: {0}")]
    Security(String),

    /// Transaction request refused before it was sent.
    #[error("transaction error: {0}")]
    Transaction(String),
}

impl Error {
    /// Whether the session must be torn down.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Protocol(_)
            | Self::Catastrophic(_)
            | Self::Broken
            | Self::Closed
            | Self::InstanceFailure
            | Self::EncryptionRefused(_) => true,
            Self::Codec(e) => e.is_fatal(),
            Self::Value(e) => matches!(e, ValueError::Protocol(_) | ValueError::UnsupportedCollation { .. }),
            Self::Server(errors) => errors.has_fatal(),
            Self::Timeout { phase } => phase.is_unrecoverable(),
            Self::Encryption { .. }
            | Self::Routing { .. }
            | Self::Config(_)
            | Self::Security(_)
            | Self::Transaction(_) => false,
        }
    }

    /// Whether retrying the operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { phase } => matches!(phase, Phase::Command | Phase::LoginAttempt),
            Self::Codec(CodecError::PoolExhausted) | Self::InstanceFailure | Self::Routing { .. } => true,
            Self::Server(errors) => errors
                .errors()
                .iter()
                .any(|e| TRANSIENT_NUMBERS.contains(&e.number)),
            _ => false,
        }
    }

    /// Highest server error class, for server errors.
    #[must_use]
    pub fn class(&self) -> Option<u8> {
        match self {
            Self::Server(errors) => errors.max_class(),
            _ => None,
        }
    }

    /// Whether a server error with this number was reported.
    #[must_use]
    pub fn is_server_error(&self, number: i32) -> bool {
        matches!(self, Self::Server(errors) if errors.iter().any(|e| e.number == number))
    }
}

/// Server error numbers that usually clear on retry: deadlock victim,
/// lock timeout and the cloud throttling/failover family.
const TRANSIENT_NUMBERS: &[i32] = &[
    1205, 1222, 4060, 4221, 10928, 10929, 40143, 40197, 40501, 40540, 40613, 49918, 49919,
    49920,
];

impl From<ServerErrors> for Error {
    fn from(errors: ServerErrors) -> Self {
        Self::Server(errors)
    }
}

/// Shorthand for engine results.
pub type Result<T> = std::result::Result<T, Error>;
