//! PRELOGIN and LOGIN7 construction.
//!
//! These are the pure halves of the handshake: what to send and how to read
//! the server's PRELOGIN answer. The driver owns the I/O around them.

use bytes::Bytes;
use tds_protocol::crypto::MAX_SUPPORTED_CE_VERSION;
use tds_protocol::login7::{FeatureExtension, Login7};
use tds_protocol::prelogin::{
    EncryptionMode, PreLogin, ProductVersion, negotiate_encryption,
};

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::security::{Providers, SecurityContext};
use crate::session::Session;

/// Client version reported in PRELOGIN.
const CLIENT_VERSION: ProductVersion = ProductVersion {
    major: 0,
    minor: 1,
    build: 0,
    sub_build: 0,
};

/// PRELOGIN request for `config`.
#[must_use]
pub fn prelogin_request(config: &SessionConfig) -> PreLogin {
    let mut request = PreLogin::new()
        .with_version(CLIENT_VERSION)
        .with_encryption(config.encryption)
        .with_mars(config.mars)
        .with_thread_id(config.client_pid)
        .with_fed_auth_required(config.features.fed_auth.is_some());
    if let Some(instance) = &config.instance {
        request = request.with_instance(instance.clone());
    }
    request
}

/// What the server's PRELOGIN answer means for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreLoginOutcome {
    /// Continue with this encryption.
    Proceed(EncryptionMode),
    /// The named instance did not answer; resolve it again and retry.
    InstanceFailure,
}

/// Interpret the server's PRELOGIN answer.
pub fn read_prelogin(config: &SessionConfig, response: &PreLogin) -> Result<PreLoginOutcome> {
    if config.instance.is_some() && response.is_instance_failure() {
        tracing::warn!("named instance did not match");
        return Ok(PreLoginOutcome::InstanceFailure);
    }
    let mode = negotiate_encryption(config.encryption, response.encryption)?;
    tracing::debug!(
        client = ?config.encryption,
        server = ?response.encryption,
        ?mode,
        mars = response.mars,
        "prelogin negotiated"
    );
    Ok(PreLoginOutcome::Proceed(mode))
}

/// LOGIN7 request for `config` on `session`.
///
/// Without a user name the login is integrated: the first SSPI blob comes
/// from the security provider, loaded once through `context`.
pub fn login_request(
    config: &SessionConfig,
    session: &Session,
    providers: &Providers,
    context: &SecurityContext,
) -> Result<Login7> {
    let mut login = Login7::new();
    login.packet_size = u32::try_from(config.packet_size)
        .map_err(|_| Error::Config(format!("packet size {} out of range", config.packet_size)))?;
    login.client_prog_version = config.client_program_version;
    login.client_pid = config.client_pid;
    login.hostname.clone_from(&config.host_name);
    login.app_name.clone_from(&config.app_name);
    login.server_name.clone_from(&config.server_name);
    login.language.clone_from(&config.language);
    login.database.clone_from(&config.database);
    login.attach_db_file.clone_from(&config.attach_file);
    login.client_id = context.client_network_id();

    let features = &config.features;
    if !config.user.is_empty() {
        login = login.with_sql_auth(config.user.clone(), config.password.clone());
    } else if features.fed_auth.is_none() {
        let provider = providers.security()?;
        context.ensure_loaded(provider)?;
        login = login.with_sspi(provider.sspi_step(None)?);
    }
    if let Some(new_password) = &config.change_password {
        login = login.with_new_password(new_password.clone());
    }
    login = login.with_read_only_intent(config.read_only_intent);

    if features.session_recovery {
        let data = match session.recovery() {
            Some(recovery) if session.is_recovering() => recovery.serialize()?,
            _ => Bytes::new(),
        };
        login = login.with_feature(FeatureExtension::session_recovery(data));
    }
    if let Some(fed_auth) = &features.fed_auth {
        login = login.with_feature(FeatureExtension::fed_auth(
            fed_auth.library,
            fed_auth.echo,
            fed_auth.token.as_deref(),
        ));
    }
    if features.column_encryption {
        login = login.with_feature(FeatureExtension::column_encryption(MAX_SUPPORTED_CE_VERSION));
    }
    if features.global_transactions {
        login = login.with_feature(FeatureExtension::global_transactions());
    }
    if features.utf8 {
        login = login.with_feature(FeatureExtension::utf8_support());
    }
    Ok(login)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use tds_protocol::prelogin::EncryptionLevel;
    use tds_protocol::token::FeatureId;

    use super::*;
    use crate::config::FeatureRequest;
    use crate::recovery::SessionRecovery;
    use crate::security::SecurityProvider;

    #[test]
    fn off_and_off_encrypts_login_only() {
        let config = SessionConfig::default();
        let response = PreLogin::new().with_encryption(EncryptionLevel::Off);
        assert_eq!(
            read_prelogin(&config, &response).unwrap(),
            PreLoginOutcome::Proceed(EncryptionMode::LoginOnly)
        );
    }

    #[test]
    fn required_by_client_but_unsupported_fails() {
        let config = SessionConfig::default().encryption(EncryptionLevel::On);
        let response = PreLogin::new().with_encryption(EncryptionLevel::NotSupported);
        assert!(matches!(
            read_prelogin(&config, &response),
            Err(Error::EncryptionRefused(_))
        ));
    }

    #[test]
    fn instance_failure_asks_for_retry() {
        let config = SessionConfig::default().instance("SQLEXPRESS");
        let mut response = PreLogin::new();
        response.instance_status = Some(1);
        assert_eq!(
            read_prelogin(&config, &response).unwrap(),
            PreLoginOutcome::InstanceFailure
        );

        let request = prelogin_request(&config);
        assert_eq!(request.instance.as_deref(), Some("SQLEXPRESS"));
    }

    #[test]
    fn sql_login_carries_requested_features() {
        let config = SessionConfig::default()
            .sql_auth("sa", "secret")
            .features(FeatureRequest::new().session_recovery(true).utf8(true));
        let session = Session::new(&config);
        let login =
            login_request(&config, &session, &Providers::new(), &SecurityContext::new()).unwrap();
        assert_eq!(login.username, "sa");
        let ids: Vec<FeatureId> = login.features.iter().map(|f| f.feature_id).collect();
        assert_eq!(ids, vec![FeatureId::SessionRecovery, FeatureId::Utf8Support]);
        assert!(login.features[0].data.is_empty());
        login.encode().unwrap();
    }

    #[test]
    fn recovery_login_replays_state() {
        let config = SessionConfig::default()
            .sql_auth("sa", "secret")
            .features(FeatureRequest::new().session_recovery(true));
        let mut previous = SessionRecovery::new();
        previous.initial_database = Some("app".into());
        let session = Session::for_recovery(&config, &previous);
        let login =
            login_request(&config, &session, &Providers::new(), &SecurityContext::new()).unwrap();
        assert_eq!(login.features[0].data, previous.serialize().unwrap());
    }

    struct Fixed;

    impl SecurityProvider for Fixed {
        fn load(&self) -> Result<u32> {
            Ok(4096)
        }

        fn sspi_step(&self, _received: Option<&[u8]>) -> Result<Bytes> {
            Ok(Bytes::from_static(b"NTLMSSP"))
        }
    }

    #[test]
    fn integrated_login_asks_the_provider() {
        let config = SessionConfig::default();
        let session = Session::new(&config);
        let context = SecurityContext::new();

        assert!(matches!(
            login_request(&config, &session, &Providers::new(), &context),
            Err(Error::Security(_))
        ));

        let providers = Providers::new().with_security(Arc::new(Fixed));
        let login = login_request(&config, &session, &providers, &context).unwrap();
        assert_eq!(&login.sspi[..], b"NTLMSSP");
        assert_eq!(context.max_token_len(), Some(4096));
    }
}
