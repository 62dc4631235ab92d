//! Session configuration.

use std::time::Duration;

use bytes::Bytes;
use tds_protocol::login7::FedAuthLibrary;
use tds_protocol::packet::{
    DEFAULT_PACKET_SIZE, MAX_NEGOTIATED_PACKET_SIZE, MIN_NEGOTIATED_PACKET_SIZE,
};
use tds_protocol::prelogin::EncryptionLevel;

use crate::error::{Error, Result};

/// Longest variable LOGIN7 text field, in UTF-16 units.
pub const MAX_LOGIN_FIELD_LEN: usize = 128;

/// Percentage of the login timeout granted per failover attempt.
pub const FAILOVER_TIMEOUT_PERCENT: u32 = 8;

/// Timeouts for the phases of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// PRELOGIN plus LOGIN7 exchange (default: 15s).
    pub login_timeout: Duration,
    /// Each request after login (default: 30s).
    pub command_timeout: Duration,
    /// Wait for the server to acknowledge an attention (default: 5s).
    pub attention_timeout: Duration,
    /// Slice the login timeout across attempts at several addresses.
    pub multi_subnet_failover: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(30),
            attention_timeout: Duration::from_secs(5),
            multi_subnet_failover: false,
        }
    }
}

impl TimeoutConfig {
    /// Defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the login timeout.
    #[must_use]
    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    /// Set the per-request timeout.
    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the attention acknowledgment wait.
    #[must_use]
    pub fn attention_timeout(mut self, timeout: Duration) -> Self {
        self.attention_timeout = timeout;
        self
    }

    /// Enable multi-subnet failover slicing.
    #[must_use]
    pub fn multi_subnet_failover(mut self, enabled: bool) -> Self {
        self.multi_subnet_failover = enabled;
        self
    }

    /// Time allowed for login attempt number `attempt` (from 1) when
    /// `remaining` is left of the overall login timeout.
    ///
    /// Without failover an attempt gets everything that remains. With it,
    /// attempt `n` gets `n` steps of the full login timeout, capped by
    /// what remains.
    #[must_use]
    pub fn login_slice(&self, attempt: u32, remaining: Duration) -> Duration {
        if !self.multi_subnet_failover {
            return remaining;
        }
        let step = self.login_timeout.saturating_mul(FAILOVER_TIMEOUT_PERCENT) / 100;
        step.saturating_mul(attempt.max(1)).min(remaining)
    }
}

/// Federated authentication settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FedAuthRequest {
    /// Token workflow.
    pub library: FedAuthLibrary,
    /// Echo the server's fed-auth-required prelogin flag.
    pub echo: bool,
    /// Token already held by the caller, for [`FedAuthLibrary::SecurityToken`].
    pub token: Option<Bytes>,
}

/// Feature extensions to request in LOGIN7.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeatureRequest {
    /// Session recovery.
    pub session_recovery: bool,
    /// Federated authentication.
    pub fed_auth: Option<FedAuthRequest>,
    /// Column encryption.
    pub column_encryption: bool,
    /// Global transactions.
    pub global_transactions: bool,
    /// UTF-8 collations.
    pub utf8: bool,
}

impl FeatureRequest {
    /// Nothing requested.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request session recovery.
    #[must_use]
    pub fn session_recovery(mut self, enabled: bool) -> Self {
        self.session_recovery = enabled;
        self
    }

    /// Request federated authentication.
    #[must_use]
    pub fn fed_auth(mut self, request: FedAuthRequest) -> Self {
        self.fed_auth = Some(request);
        self
    }

    /// Request column encryption.
    #[must_use]
    pub fn column_encryption(mut self, enabled: bool) -> Self {
        self.column_encryption = enabled;
        self
    }

    /// Request global transactions.
    #[must_use]
    pub fn global_transactions(mut self, enabled: bool) -> Self {
        self.global_transactions = enabled;
        self
    }

    /// Request UTF-8 collation support.
    #[must_use]
    pub fn utf8(mut self, enabled: bool) -> Self {
        self.utf8 = enabled;
        self
    }

    /// Whether any feature is requested.
    #[must_use]
    pub fn any(&self) -> bool {
        self.session_recovery
            || self.fed_auth.is_some()
            || self.column_encryption
            || self.global_transactions
            || self.utf8
    }
}

/// Everything the engine needs to open a session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Client machine name.
    pub host_name: String,
    /// SQL login name.
    pub user: String,
    /// SQL login password.
    pub password: String,
    /// Application name.
    pub app_name: String,
    /// Server name as the client addressed it.
    pub server_name: String,
    /// Named instance to resolve during prelogin.
    pub instance: Option<String>,
    /// Initial database.
    pub database: String,
    /// Initial language.
    pub language: String,
    /// Database file to attach.
    pub attach_file: String,
    /// Requested packet size.
    pub packet_size: usize,
    /// Requested encryption.
    pub encryption: EncryptionLevel,
    /// Multiple active result sets.
    pub mars: bool,
    /// Read-only application intent.
    pub read_only_intent: bool,
    /// New password to set during login.
    pub change_password: Option<String>,
    /// Client process id.
    pub client_pid: u32,
    /// Client program version.
    pub client_program_version: u32,
    /// Requested feature extensions.
    pub features: FeatureRequest,
    /// Timeouts.
    pub timeouts: TimeoutConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            user: String::new(),
            password: String::new(),
            app_name: "tds-engine".into(),
            server_name: String::new(),
            instance: None,
            database: String::new(),
            language: String::new(),
            attach_file: String::new(),
            packet_size: DEFAULT_PACKET_SIZE,
            encryption: EncryptionLevel::Off,
            mars: false,
            read_only_intent: false,
            change_password: None,
            client_pid: std::process::id(),
            client_program_version: 0x0700_0000,
            features: FeatureRequest::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Defaults: no credentials, 4096-byte packets, login-only encryption.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the server name.
    #[must_use]
    pub fn server_name(mut self, server: impl Into<String>) -> Self {
        self.server_name = server.into();
        self
    }

    /// Set the client machine name.
    #[must_use]
    pub fn host_name(mut self, host: impl Into<String>) -> Self {
        self.host_name = host.into();
        self
    }

    /// Use SQL authentication.
    #[must_use]
    pub fn sql_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Resolve a named instance during prelogin.
    #[must_use]
    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    /// Set the initial database.
    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the initial language.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    /// Attach a database file at login.
    #[must_use]
    pub fn attach_file(mut self, path: impl Into<String>) -> Self {
        self.attach_file = path.into();
        self
    }

    /// Request a packet size.
    #[must_use]
    pub fn packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Request an encryption level.
    #[must_use]
    pub fn encryption(mut self, level: EncryptionLevel) -> Self {
        self.encryption = level;
        self
    }

    /// Enable multiple active result sets.
    #[must_use]
    pub fn mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Declare read-only application intent.
    #[must_use]
    pub fn read_only_intent(mut self, enabled: bool) -> Self {
        self.read_only_intent = enabled;
        self
    }

    /// Change the password during login.
    #[must_use]
    pub fn change_password(mut self, new_password: impl Into<String>) -> Self {
        self.change_password = Some(new_password.into());
        self
    }

    /// Set the requested features.
    #[must_use]
    pub fn features(mut self, features: FeatureRequest) -> Self {
        self.features = features;
        self
    }

    /// Set the timeouts.
    #[must_use]
    pub fn timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Check the configuration before any byte is sent.
    pub fn validate(&self) -> Result<()> {
        if !(MIN_NEGOTIATED_PACKET_SIZE..=MAX_NEGOTIATED_PACKET_SIZE).contains(&self.packet_size) {
            return Err(Error::Config(format!(
                "packet size {} outside {MIN_NEGOTIATED_PACKET_SIZE}..={MAX_NEGOTIATED_PACKET_SIZE}",
                self.packet_size
            )));
        }

        let fields = [
            ("host name", &self.host_name),
            ("user", &self.user),
            ("password", &self.password),
            ("application name", &self.app_name),
            ("server name", &self.server_name),
            ("database", &self.database),
            ("language", &self.language),
        ];
        for (name, value) in fields {
            check_field(name, value)?;
        }
        if let Some(new_password) = &self.change_password {
            check_field("new password", new_password)?;
        }

        if self.features.fed_auth.is_some() {
            if !self.password.is_empty() || !self.user.is_empty() {
                return Err(Error::Config(
                    "federated authentication cannot be combined with a SQL login".into(),
                ));
            }
            if self.change_password.is_some() {
                return Err(Error::Config(
                    "password change requires a SQL login".into(),
                ));
            }
        }
        Ok(())
    }
}

fn check_field(name: &str, value: &str) -> Result<()> {
    let units = value.encode_utf16().count();
    if units > MAX_LOGIN_FIELD_LEN {
        return Err(Error::Config(format!(
            "{name} is {units} characters long (max {MAX_LOGIN_FIELD_LEN})"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = SessionConfig::new().sql_auth("sa", "pw").server_name("db1");
        assert_eq!(config.packet_size, 4096);
        assert_eq!(config.timeouts.login_timeout, Duration::from_secs(15));
        assert_eq!(config.timeouts.attention_timeout, Duration::from_secs(5));
        config.validate().unwrap();
    }

    #[test]
    fn failover_slices_grow_per_attempt() {
        let plain = TimeoutConfig::new().login_timeout(Duration::from_secs(10));
        assert_eq!(plain.login_slice(1, Duration::from_secs(7)), Duration::from_secs(7));

        let failover = plain.multi_subnet_failover(true);
        assert_eq!(failover.login_slice(1, Duration::from_secs(10)), Duration::from_millis(800));
        assert_eq!(failover.login_slice(3, Duration::from_secs(10)), Duration::from_millis(2400));
        assert_eq!(failover.login_slice(20, Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn packet_size_bounds() {
        assert!(SessionConfig::new().packet_size(511).validate().is_err());
        assert!(SessionConfig::new().packet_size(512).validate().is_ok());
        assert!(SessionConfig::new().packet_size(32767).validate().is_ok());
        assert!(matches!(
            SessionConfig::new().packet_size(32768).validate(),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn long_fields_rejected() {
        let config = SessionConfig::new().database("d".repeat(129));
        assert!(config.validate().is_err());
        let config = SessionConfig::new().database("d".repeat(128));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn fed_auth_excludes_password() {
        let features = FeatureRequest::new().fed_auth(FedAuthRequest {
            library: FedAuthLibrary::SecurityToken,
            echo: false,
            token: Some(Bytes::from_static(b"token")),
        });
        let config = SessionConfig::new().sql_auth("", "secret").features(features.clone());
        assert!(config.validate().is_err());
        let config = SessionConfig::new().features(features);
        assert!(config.validate().is_ok());
    }
}
