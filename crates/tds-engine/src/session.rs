//! Negotiated session state and its updates from the token stream.

use bytes::Bytes;
use tds_protocol::collation::Collation;
use tds_protocol::crypto::MAX_SUPPORTED_CE_VERSION;
use tds_protocol::login7::FedAuthLibrary;
use tds_protocol::packet::{MAX_NEGOTIATED_PACKET_SIZE, MIN_NEGOTIATED_PACKET_SIZE};
use tds_protocol::token::{
    DecodeContext, EnvChange, EnvChangeType, EnvValue, FeatureAck, FeatureId, LoginAck, Routing,
    SessionStateToken, read_state_record,
};
use tds_protocol::version::{ProtocolTier, TdsVersion};
use tds_protocol::wire::{Reader, WireError};
use tds_protocol::ProtocolError;

use crate::config::{FeatureRequest, SessionConfig};
use crate::error::{Error, Result};
use crate::recovery::{SessionRecovery, StateRecord};
use crate::state::SessionState;

/// Transaction bookkeeping.
///
/// A begin request makes a transaction pending until the server's
/// BEGIN_TRANSACTION env change (or the end of the request) settles it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionState {
    current: u64,
    pending: bool,
}

impl TransactionState {
    /// Descriptor of the active transaction, zero when none.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Whether a transaction is active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.current != 0
    }

    /// Whether a begin request is awaiting its acknowledgment.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    pub(crate) fn begin_requested(&mut self) {
        self.pending = true;
    }

    pub(crate) fn request_finished(&mut self) {
        self.pending = false;
    }

    fn began(&mut self, descriptor: u64) {
        self.current = descriptor;
        self.pending = false;
    }

    fn ended(&mut self) {
        self.current = 0;
        self.pending = false;
    }
}

/// Features the server agreed to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiatedFeatures {
    /// Session recovery acknowledged.
    pub session_recovery: bool,
    /// Federated authentication acknowledged.
    pub fed_auth: bool,
    /// Column encryption version, when acknowledged.
    pub column_encryption: Option<u8>,
    /// Global transactions enabled by the server.
    pub global_transactions: bool,
    /// UTF-8 collations supported.
    pub utf8: bool,
}

/// One logical connection's negotiated state.
#[derive(Debug)]
pub struct Session {
    state: SessionState,
    tier: ProtocolTier,
    tds_version: Option<TdsVersion>,
    server_program: Option<(String, [u8; 4])>,
    collation: Option<Collation>,
    packet_size: usize,
    mars: bool,
    read_only_intent: bool,
    multi_subnet_failover: bool,
    transaction: TransactionState,
    database: Option<String>,
    language: Option<String>,
    charset: Option<String>,
    sort_locale: Option<u32>,
    comparison_flags: Option<u32>,
    routing: Option<Routing>,
    mirror_partner: Option<String>,
    user_instance: Option<String>,
    dtc_token: Option<Bytes>,
    tm_address: Option<Bytes>,
    requested: FeatureRequest,
    features: NegotiatedFeatures,
    recovery: Option<SessionRecovery>,
    recovering: bool,
    login_phase: bool,
}

impl Session {
    /// Session for `config`, not yet connected.
    #[must_use]
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            state: SessionState::Closed,
            tier: ProtocolTier::LATEST,
            tds_version: None,
            server_program: None,
            collation: None,
            packet_size: config.packet_size,
            mars: config.mars,
            read_only_intent: config.read_only_intent,
            multi_subnet_failover: config.timeouts.multi_subnet_failover,
            transaction: TransactionState::default(),
            database: None,
            language: None,
            charset: None,
            sort_locale: None,
            comparison_flags: None,
            routing: None,
            mirror_partner: None,
            user_instance: None,
            dtc_token: None,
            tm_address: None,
            requested: config.features.clone(),
            features: NegotiatedFeatures::default(),
            recovery: config.features.session_recovery.then(SessionRecovery::new),
            recovering: false,
            login_phase: false,
        }
    }

    /// Session that replays the recoverable state of a lost one.
    #[must_use]
    pub fn for_recovery(config: &SessionConfig, previous: &SessionRecovery) -> Self {
        let mut session = Self::new(config);
        session.requested.session_recovery = true;
        session.recovery = Some(previous.clone());
        session.recovering = true;
        session
    }

    /// Lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move the lifecycle forward.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        self.state.transition(next)
    }

    /// Mark the session broken. Idempotent.
    pub fn mark_broken(&mut self) {
        if !self.state.is_broken() {
            tracing::error!(state = ?self.state, "session broken");
            self.state = SessionState::Broken;
        }
    }

    /// Negotiated protocol tier; the latest tier before LOGINACK.
    #[must_use]
    pub fn tier(&self) -> ProtocolTier {
        self.tier
    }

    /// Version acknowledged by the server.
    #[must_use]
    pub fn tds_version(&self) -> Option<TdsVersion> {
        self.tds_version
    }

    /// Server program name and version from LOGINACK.
    #[must_use]
    pub fn server_program(&self) -> Option<&(String, [u8; 4])> {
        self.server_program.as_ref()
    }

    /// Default collation.
    #[must_use]
    pub fn collation(&self) -> Option<Collation> {
        self.collation
    }

    /// Negotiated packet size.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    /// Whether the session multiplexes channels.
    #[must_use]
    pub fn is_mars(&self) -> bool {
        self.mars
    }

    /// Transaction bookkeeping.
    #[must_use]
    pub fn transaction(&self) -> &TransactionState {
        &self.transaction
    }

    pub(crate) fn transaction_mut(&mut self) -> &mut TransactionState {
        &mut self.transaction
    }

    /// Current database.
    #[must_use]
    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Current language.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Character set announced by pre-Shiloh servers.
    #[must_use]
    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    /// Unicode sort locale.
    #[must_use]
    pub fn sort_locale(&self) -> Option<u32> {
        self.sort_locale
    }

    /// Unicode comparison flags.
    #[must_use]
    pub fn comparison_flags(&self) -> Option<u32> {
        self.comparison_flags
    }

    /// Routing target announced during login.
    #[must_use]
    pub fn routing(&self) -> Option<&Routing> {
        self.routing.as_ref()
    }

    /// Whether the login was routed elsewhere.
    #[must_use]
    pub fn is_routed(&self) -> bool {
        self.routing.is_some()
    }

    /// Database mirroring partner.
    #[must_use]
    pub fn mirror_partner(&self) -> Option<&str> {
        self.mirror_partner.as_deref()
    }

    /// User instance name.
    #[must_use]
    pub fn user_instance(&self) -> Option<&str> {
        self.user_instance.as_deref()
    }

    /// DTC token from the last promotion.
    #[must_use]
    pub fn dtc_token(&self) -> Option<&Bytes> {
        self.dtc_token.as_ref()
    }

    /// Transaction manager address.
    #[must_use]
    pub fn tm_address(&self) -> Option<&Bytes> {
        self.tm_address.as_ref()
    }

    /// Features the server acknowledged.
    #[must_use]
    pub fn features(&self) -> &NegotiatedFeatures {
        &self.features
    }

    /// Features this session asked for.
    #[must_use]
    pub fn requested_features(&self) -> &FeatureRequest {
        &self.requested
    }

    /// Recoverable state, when session recovery was requested.
    #[must_use]
    pub fn recovery(&self) -> Option<&SessionRecovery> {
        self.recovery.as_ref()
    }

    /// Whether this is a recovery login.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    /// Whether the login exchange is in progress.
    #[must_use]
    pub fn in_login(&self) -> bool {
        self.login_phase
    }

    pub(crate) fn set_login_phase(&mut self, in_login: bool) {
        self.login_phase = in_login;
        if !in_login {
            self.recovering = false;
        }
    }

    /// Decoding parameters for the current state.
    #[must_use]
    pub fn decode_context(&self) -> DecodeContext {
        DecodeContext {
            tier: self.tier,
            login_phase: self.login_phase,
            column_encryption: self.features.column_encryption.is_some(),
        }
    }

    /// Apply LOGINACK.
    pub fn apply_login_ack(&mut self, ack: &LoginAck) -> Result<()> {
        let tier = ack.tier()?;
        if self.recovering {
            if let Some(recovery) = &self.recovery {
                recovery.check_version(ack.version)?;
            }
        }
        if let Some(recovery) = &mut self.recovery {
            recovery.tds_version = Some(ack.version);
        }
        self.tier = tier;
        self.tds_version = Some(ack.version);
        self.server_program = Some((ack.prog_name.clone(), ack.prog_version));
        tracing::debug!(
            version = %ack.version,
            tier = %tier,
            server = %ack.prog_name,
            "login acknowledged"
        );
        self.state.transition(SessionState::OpenLoggedIn)
    }

    /// Apply one environment change.
    ///
    /// Returns the new packet size when it changed; the caller pushes it to
    /// every channel before reading on.
    pub fn apply_env_change(&mut self, change: &EnvChange) -> Result<Option<usize>> {
        if self.login_phase && self.routing.is_some() {
            tracing::warn!(kind = ?change.kind, "env change ignored after routing");
            return Ok(None);
        }
        tracing::trace!(kind = ?change.kind, "env change");
        let recording_initial = self.login_phase && !self.recovering;

        match change.kind {
            EnvChangeType::Database => {
                let db = string(&change.new_value);
                if let Some(recovery) = &mut self.recovery {
                    if recording_initial {
                        recovery.initial_database = db.clone();
                    }
                    recovery.database = db.clone();
                }
                tracing::debug!(database = ?db, "database changed");
                self.database = db;
            }
            EnvChangeType::Language => {
                let lang = string(&change.new_value);
                if let Some(recovery) = &mut self.recovery {
                    if recording_initial {
                        recovery.initial_language = lang.clone();
                    }
                    recovery.language = lang.clone();
                }
                self.language = lang;
            }
            EnvChangeType::CharacterSet => self.charset = string(&change.new_value),
            EnvChangeType::PacketSize => {
                let size = parse_packet_size(&change.new_value)?;
                if size != self.packet_size {
                    tracing::debug!(old = self.packet_size, new = size, "packet size changed");
                    self.packet_size = size;
                    return Ok(Some(size));
                }
            }
            EnvChangeType::UnicodeSortLocale => {
                self.sort_locale = parse_number(&change.new_value, "sort locale")?;
            }
            EnvChangeType::UnicodeComparisonFlags => {
                self.comparison_flags = parse_number(&change.new_value, "comparison flags")?;
            }
            EnvChangeType::SqlCollation => {
                let collation = match change.new_value.as_bytes() {
                    Some(bytes) => Some(Collation::from_bytes(bytes)?),
                    None => None,
                };
                if let Some(recovery) = &mut self.recovery {
                    if recording_initial {
                        recovery.initial_collation = collation;
                    }
                    recovery.collation = collation;
                }
                self.collation = collation;
            }
            EnvChangeType::BeginTransaction | EnvChangeType::EnlistDtcTransaction => {
                let descriptor = descriptor(&change.new_value)?;
                tracing::debug!(descriptor, "transaction began");
                self.transaction.began(descriptor);
            }
            EnvChangeType::CommitTransaction
            | EnvChangeType::RollbackTransaction
            | EnvChangeType::DefectTransaction
            | EnvChangeType::TransactionEnded => {
                tracing::debug!(kind = ?change.kind, "transaction ended");
                self.transaction.ended();
            }
            EnvChangeType::LogShippingPartner => {
                if self.read_only_intent {
                    return Err(Error::Config(
                        "a mirrored database cannot be opened with read-only intent".into(),
                    ));
                }
                if self.multi_subnet_failover {
                    return Err(Error::Config(
                        "server sent a failover partner but multi-subnet failover is enabled".into(),
                    ));
                }
                self.mirror_partner = string(&change.new_value);
            }
            EnvChangeType::PromoteTransaction => {
                self.dtc_token = change.new_value.as_bytes().map(Bytes::copy_from_slice);
            }
            EnvChangeType::TransactionManagerAddress => {
                self.tm_address = change.new_value.as_bytes().map(Bytes::copy_from_slice);
            }
            EnvChangeType::ResetConnectionAck => {
                if let Some(recovery) = &mut self.recovery {
                    recovery.reset_to_initial();
                    self.database = recovery.initial_database.clone();
                    self.language = recovery.initial_language.clone();
                    self.collation = recovery.initial_collation;
                }
                tracing::debug!("connection reset acknowledged");
            }
            EnvChangeType::UserInstance => self.user_instance = string(&change.new_value),
            EnvChangeType::Routing => {
                let EnvValue::Routing(routing) = &change.new_value else {
                    return Err(invalid("routing", 0));
                };
                if !routing.is_valid() {
                    return Err(invalid("routing target", u64::from(routing.port)));
                }
                tracing::debug!(server = %routing.server, port = routing.port, "login routed");
                self.routing = Some(routing.clone());
            }
        }
        Ok(None)
    }

    /// Apply FEATUREEXTACK.
    pub fn apply_feature_acks(&mut self, acks: &[FeatureAck]) -> Result<()> {
        if self.routing.is_some() {
            tracing::warn!(count = acks.len(), "feature acknowledgments ignored after routing");
            return Ok(());
        }
        for ack in acks {
            let id = FeatureId::from_u8(ack.feature_id)?;
            if !self.was_requested(id) {
                return Err(ProtocolError::UnexpectedToken {
                    token: "FEATUREEXTACK",
                    context: "acknowledgment for a feature that was not requested",
                }
                .into());
            }
            match id {
                FeatureId::SessionRecovery => self.apply_recovery_ack(&ack.data)?,
                FeatureId::FedAuth => {
                    let library = self.requested.fed_auth.as_ref().map(|f| f.library);
                    if matches!(library, Some(FedAuthLibrary::SecurityToken | FedAuthLibrary::Msal))
                        && !ack.data.is_empty()
                    {
                        return Err(invalid("federated authentication ack length", ack.data.len() as u64));
                    }
                    self.features.fed_auth = true;
                }
                FeatureId::ColumnEncryption => {
                    let version = first_byte(&ack.data, "column encryption ack")?;
                    if !(1..=MAX_SUPPORTED_CE_VERSION).contains(&version) {
                        return Err(invalid("column encryption version", u64::from(version)));
                    }
                    self.features.column_encryption = Some(version);
                }
                FeatureId::GlobalTransactions => {
                    self.features.global_transactions =
                        first_byte(&ack.data, "global transactions ack")? == 1;
                }
                FeatureId::Utf8Support => {
                    self.features.utf8 = first_byte(&ack.data, "UTF-8 support ack")? & 0x01 != 0;
                }
            }
            tracing::debug!(feature = ?id, "feature acknowledged");
        }
        Ok(())
    }

    fn was_requested(&self, id: FeatureId) -> bool {
        let r = &self.requested;
        match id {
            FeatureId::SessionRecovery => r.session_recovery,
            FeatureId::FedAuth => r.fed_auth.is_some(),
            FeatureId::ColumnEncryption => r.column_encryption,
            FeatureId::GlobalTransactions => r.global_transactions,
            FeatureId::Utf8Support => r.utf8,
        }
    }

    fn apply_recovery_ack(&mut self, data: &[u8]) -> Result<()> {
        let recovering = self.recovering;
        let recovery = self.recovery.get_or_insert_with(SessionRecovery::new);
        let mut r = Reader::exact(data);
        while !r.is_empty() {
            let (id, state) = read_state_record(&mut r).map_err(|e| match e {
                WireError::Protocol(p) => p,
                WireError::Incomplete => ProtocolError::Truncated {
                    what: "session recovery ack",
                    needed: 2,
                    available: 0,
                },
            })?;
            if recovering {
                recovery.merge_record(
                    id,
                    StateRecord {
                        sequence: 0,
                        recoverable: true,
                        data: state,
                    },
                );
            } else {
                recovery.set_initial(id, state);
            }
        }
        self.features.session_recovery = true;
        Ok(())
    }

    /// Merge SESSIONSTATE.
    pub fn apply_session_state(&mut self, token: &SessionStateToken) -> Result<()> {
        match &mut self.recovery {
            Some(recovery) if self.features.session_recovery => {
                recovery.merge(token);
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedToken {
                token: "SESSIONSTATE",
                context: "session recovery was not negotiated",
            }
            .into()),
        }
    }
}

fn invalid(field: &'static str, value: u64) -> Error {
    ProtocolError::InvalidField { field, value }.into()
}

fn string(value: &EnvValue) -> Option<String> {
    value.as_str().map(str::to_owned)
}

fn first_byte(data: &[u8], what: &'static str) -> Result<u8> {
    data.first().copied().ok_or_else(|| {
        ProtocolError::Truncated {
            what,
            needed: 1,
            available: 0,
        }
        .into()
    })
}

fn parse_number(value: &EnvValue, field: &'static str) -> Result<Option<u32>> {
    match value.as_str() {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(field, 0)),
    }
}

fn parse_packet_size(value: &EnvValue) -> Result<usize> {
    let size: usize = value
        .as_str()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| invalid("packet size", 0))?;
    if !(MIN_NEGOTIATED_PACKET_SIZE..=MAX_NEGOTIATED_PACKET_SIZE).contains(&size) {
        return Err(invalid("packet size", size as u64));
    }
    Ok(size)
}

fn descriptor(value: &EnvValue) -> Result<u64> {
    let bytes = value.as_bytes().ok_or_else(|| invalid("transaction descriptor length", 0))?;
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| invalid("transaction descriptor length", bytes.len() as u64))?;
    Ok(u64::from_le_bytes(raw))
}
