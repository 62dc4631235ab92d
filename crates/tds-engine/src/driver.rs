//! Async session driver.
//!
//! [`SessionDriver`] owns one transport and one [`Session`] and runs the
//! handshake, SQL batches and transaction manager requests over it. The
//! decoding itself is the non-blocking [`TokenStream`]; the driver only
//! feeds it packets, writes what it queues and enforces deadlines.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tds_codec::{CodecError, Connection};
use tds_protocol::packet::PacketType;
use tds_protocol::prelogin::{EncryptionMode, PreLogin};
use tds_protocol::sql_batch::{AllHeaders, SqlBatch};
use tds_protocol::txn::TmRequest;
use tds_protocol::wire::Step;
use tds_protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Duration, Instant};
use tracing::Instrument;

use crate::cancel::CancelHandle;
use crate::config::SessionConfig;
use crate::error::{Error, Phase, Result};
use crate::instrumentation::{self, Redaction};
use crate::login::{self, PreLoginOutcome};
use crate::recovery::SessionRecovery;
use crate::row::Decryptor;
use crate::security::{Providers, SecurityContext};
use crate::session::Session;
use crate::state::SessionState;
use crate::stream::{Collect, Discard, RunSummary, TokenSink, TokenStream};
use crate::transaction;

/// Switches the transport in and out of TLS.
///
/// The handshake itself belongs to the transport: after `begin_tls` its
/// next bytes are expected to go through TLS, after `end_tls` back to
/// plaintext.
pub trait TransportUpgrade: Send {
    /// Start encrypting.
    fn begin_tls(&mut self) -> Result<()>;

    /// Stop encrypting once LOGIN7 is out, for login-only encryption.
    fn end_tls(&mut self) -> Result<()>;
}

/// Opens a fresh transport to a re-resolved named instance.
pub type Reconnect<T> = Box<dyn FnMut() -> BoxFuture<'static, std::io::Result<T>> + Send>;

/// Drives one session over `T`.
pub struct SessionDriver<T>
where
    T: AsyncRead + AsyncWrite,
{
    conn: Connection<T>,
    session: Session,
    config: SessionConfig,
    providers: Providers,
    upgrade: Option<Box<dyn TransportUpgrade>>,
    reconnect: Option<Reconnect<T>>,
    redaction: Redaction,
    encryption: Option<EncryptionMode>,
}

impl<T> SessionDriver<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    /// Driver for a fresh session.
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let session = Session::new(&config);
        Ok(Self::with_session(transport, config, session))
    }

    /// Driver that logs in with the recoverable state of a lost session.
    pub fn recover(transport: T, config: SessionConfig, previous: &SessionRecovery) -> Result<Self> {
        config.validate()?;
        let session = Session::for_recovery(&config, previous);
        Ok(Self::with_session(transport, config, session))
    }

    fn with_session(transport: T, config: SessionConfig, session: Session) -> Self {
        Self {
            conn: Connection::new(transport),
            session,
            config,
            providers: Providers::new(),
            upgrade: None,
            reconnect: None,
            redaction: Redaction::default(),
            encryption: None,
        }
    }

    /// Security and key providers.
    #[must_use]
    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    /// TLS switch for the transport.
    #[must_use]
    pub fn with_upgrade(mut self, upgrade: Box<dyn TransportUpgrade>) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Where to get a new transport when the named instance fails.
    ///
    /// PRELOGIN is retried once over what `reconnect` returns. Without it
    /// the first instance failure ends the login.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: Reconnect<T>) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// How batch text is recorded on spans.
    #[must_use]
    pub fn with_redaction(mut self, redaction: Redaction) -> Self {
        self.redaction = redaction;
        self
    }

    /// The session.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Negotiated encryption, after PRELOGIN.
    #[must_use]
    pub fn encryption(&self) -> Option<EncryptionMode> {
        self.encryption
    }

    /// Packet size in use.
    #[must_use]
    pub fn packet_size(&self) -> usize {
        self.conn.channel().packet_size()
    }

    /// Result sets opened and not yet finished on the channel.
    #[must_use]
    pub fn open_results(&self) -> u32 {
        self.conn.channel().open_results()
    }

    /// Handle for sending attention from another task.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle<T> {
        CancelHandle::new(self.conn.cancel_handle(), self.config.timeouts.attention_timeout)
    }

    /// PRELOGIN, encryption negotiation, LOGIN7 and the login response.
    ///
    /// Any failure leaves the session broken; a timeout too.
    pub async fn login(&mut self) -> Result<()> {
        let limit = self.config.timeouts.login_timeout;
        self.login_attempt(1, limit).await
    }

    /// Login as attempt number `attempt` with `remaining` left of the
    /// overall login timeout.
    ///
    /// With multi-subnet failover the attempt only gets its slice of the
    /// timeout (see [`TimeoutConfig::login_slice`]). Running out of the
    /// slice yields [`Phase::LoginAttempt`], which is transient: this
    /// transport is finished but the caller may try the next address.
    ///
    /// [`TimeoutConfig::login_slice`]: crate::config::TimeoutConfig::login_slice
    pub async fn login_attempt(&mut self, attempt: u32, remaining: Duration) -> Result<()> {
        if self.session.state() != SessionState::Closed {
            return Err(Error::Config("login on a session that is already open".into()));
        }
        self.session.transition(SessionState::OpenNotLoggedIn)?;

        let limit = self.config.timeouts.login_slice(attempt, remaining);
        let phase = if limit < remaining { Phase::LoginAttempt } else { Phase::Login };
        let span = instrumentation::login_span(&self.config);
        let outcome = tokio::time::timeout(limit, self.handshake().instrument(span)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout { phase }),
        };
        self.session.set_login_phase(false);
        if let Err(e) = &result {
            tracing::error!(error = %e, attempt, "login failed");
            self.break_session();
        }
        result
    }

    async fn handshake(&mut self) -> Result<()> {
        let mode = self.prelogin().await?;
        self.encryption = Some(mode);
        if mode != EncryptionMode::None {
            self.upgrade()?.begin_tls()?;
        }

        let login = login::login_request(
            &self.config,
            &self.session,
            &self.providers,
            SecurityContext::global(),
        )?
        .encode()?;
        self.session.set_login_phase(true);
        self.conn.send_message(PacketType::Tds7Login, &login).await?;
        tracing::debug!(len = login.len(), "login sent");
        if mode == EncryptionMode::LoginOnly {
            self.upgrade()?.end_tls()?;
        }

        let mut stream = self.token_stream();
        self.run(&mut stream, &mut Discard).await?;

        if let Some(routing) = self.session.routing() {
            return Err(Error::Routing {
                server: routing.server.clone(),
                port: routing.port,
            });
        }
        if self.session.state() != SessionState::OpenLoggedIn {
            return Err(ProtocolError::UnexpectedToken {
                token: "DONE",
                context: "login response ended without LOGINACK",
            }
            .into());
        }
        tracing::debug!(
            tier = %self.session.tier(),
            packet_size = self.packet_size(),
            "logged in"
        );
        Ok(())
    }

    /// Exchange PRELOGIN, retrying once on a fresh transport when the
    /// named instance fails.
    async fn prelogin(&mut self) -> Result<EncryptionMode> {
        let request = login::prelogin_request(&self.config).encode();
        let mut retried = false;
        loop {
            self.conn.send_message(PacketType::PreLogin, &request).await?;
            let payload = self.conn.read_message().await?;
            if payload.is_empty() {
                return Err(ProtocolError::Truncated {
                    what: "prelogin response",
                    needed: 1,
                    available: 0,
                }
                .into());
            }
            let response = PreLogin::decode(&payload)?;
            match login::read_prelogin(&self.config, &response)? {
                PreLoginOutcome::Proceed(mode) => return Ok(mode),
                PreLoginOutcome::InstanceFailure => {
                    let reconnect = match self.reconnect.as_mut() {
                        Some(reconnect) if !retried => reconnect,
                        _ => return Err(Error::InstanceFailure),
                    };
                    tracing::warn!("named instance failed, retrying prelogin on a new transport");
                    let pending = reconnect();
                    let transport = pending.await.map_err(CodecError::from)?;
                    self.conn = Connection::new(transport);
                    retried = true;
                }
            }
        }
    }

    fn upgrade(&mut self) -> Result<&mut dyn TransportUpgrade> {
        match self.upgrade.as_deref_mut() {
            Some(upgrade) => Ok(upgrade),
            None => Err(Error::Config(
                "encryption negotiated but the transport cannot upgrade to TLS".into(),
            )),
        }
    }

    /// Run a SQL batch, handing results to `sink`.
    pub async fn execute(&mut self, sql: &str, sink: &mut dyn TokenSink) -> Result<RunSummary> {
        self.session.state().check_ready()?;
        let span = instrumentation::batch_span(sql, &self.redaction);
        async {
            let headers = AllHeaders::new(self.session.transaction().current(), 1);
            let batch = SqlBatch::new(sql).with_headers(headers).encode(self.session.tier());
            self.send(PacketType::SqlBatch, &batch).await?;
            let summary = self.respond(sink).await?;
            tracing::Span::current().record("rows", summary.rows_affected);
            Ok(summary)
        }
        .instrument(span)
        .await
    }

    /// Run a SQL batch and buffer its results.
    pub async fn query(&mut self, sql: &str) -> Result<Collect> {
        let mut collect = Collect::new();
        self.execute(sql, &mut collect).await?;
        Ok(collect)
    }

    /// Send a transaction manager request and read its response.
    ///
    /// `delegated` marks requests that finish a transaction controlled by
    /// an outside coordinator.
    pub async fn transaction(
        &mut self,
        request: &TmRequest,
        delegated: bool,
        sink: &mut dyn TokenSink,
    ) -> Result<RunSummary> {
        let open_results = self.conn.channel().open_results();
        let payload = transaction::prepare(&mut self.session, request, delegated, open_results)?;
        let span = instrumentation::transaction_span(request);
        let result = async {
            self.send(PacketType::TransactionManager, &payload).await?;
            self.respond(sink).await
        }
        .instrument(span)
        .await;
        transaction::complete(&mut self.session, request);
        result
    }

    /// Address of the server's transaction coordinator.
    pub async fn dtc_address(&mut self) -> Result<Bytes> {
        let mut collect = Collect::new();
        self.transaction(&TmRequest::GetDtcAddress, false, &mut collect)
            .await?;
        transaction::dtc_address(&collect)
    }

    /// Send attention and drain to its acknowledgment.
    ///
    /// Used between requests, for a response the caller abandoned.
    pub async fn cancel(&mut self) -> Result<()> {
        self.session.state().check_open()?;
        self.send_attention().await?;
        let mut stream = self.token_stream();
        self.drain_attention(&mut stream, &mut Discard).await?;
        Ok(())
    }

    /// Mark the session closed. The transport is dropped with the driver.
    pub fn close(&mut self) -> Result<()> {
        self.session.transition(SessionState::Closed)
    }

    /// Read a response under the command timeout.
    ///
    /// When the deadline passes, attention goes out and the rest of the
    /// response is drained; the call then fails with a command timeout.
    async fn respond(&mut self, sink: &mut dyn TokenSink) -> Result<RunSummary> {
        let mut stream = self.token_stream();
        let deadline = Instant::now() + self.config.timeouts.command_timeout;
        match tokio::time::timeout_at(deadline, self.run(&mut stream, sink)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::debug!("command timed out, sending attention");
                stream.escalate(Error::Timeout {
                    phase: Phase::Command,
                });
                self.send_attention().await?;
                self.drain_attention(&mut stream, sink).await
            }
        }
    }

    async fn drain_attention(
        &mut self,
        stream: &mut TokenStream,
        sink: &mut dyn TokenSink,
    ) -> Result<RunSummary> {
        let limit: Duration = self.config.timeouts.attention_timeout;
        let drained = tokio::time::timeout(limit, self.run(stream, sink))
            .instrument(instrumentation::attention_span())
            .await;
        match drained {
            Ok(result) => result,
            Err(_) => {
                tracing::error!("attention was not acknowledged");
                self.break_session();
                Err(Error::Timeout {
                    phase: Phase::Attention,
                })
            }
        }
    }

    /// Feed `stream` until the response ends.
    async fn run(&mut self, stream: &mut TokenStream, sink: &mut dyn TokenSink) -> Result<RunSummary> {
        loop {
            let step = stream.advance(self.conn.channel_mut(), &mut self.session, sink);
            self.sync(stream)?;
            match step {
                Ok(Step::Ready(summary)) => return Ok(summary),
                Ok(Step::NeedMore) => {
                    if self.conn.channel().has_output() {
                        self.conn.flush().await?;
                    }
                    if let Err(e) = self.conn.fill().await {
                        self.session.mark_broken();
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    if e.is_fatal() {
                        self.break_session();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Carry what the stream changed on the channel over to the transport.
    fn sync(&mut self, stream: &mut TokenStream) -> Result<()> {
        if let Some(size) = stream.take_packet_size_change() {
            self.conn.set_packet_size(size)?;
        }
        if stream.take_attention_ack() {
            self.conn.attention_acknowledged();
        }
        Ok(())
    }

    fn token_stream(&self) -> TokenStream {
        token_stream(&self.providers, &self.session, &self.config)
    }

    /// Write a request; a transport failure breaks the session.
    async fn send(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let sent = self.conn.send_message(packet_type, payload).await;
        self.check_sent(sent)
    }

    async fn send_attention(&mut self) -> Result<()> {
        let sent = self.conn.send_attention().await;
        self.check_sent(sent)
    }

    fn check_sent(&mut self, sent: std::result::Result<(), CodecError>) -> Result<()> {
        sent.map_err(|e| {
            if e.is_fatal() {
                self.break_session();
            }
            Error::from(e)
        })
    }

    fn break_session(&mut self) {
        self.session.mark_broken();
        self.conn.channel_mut().mark_broken();
    }
}

/// Token stream wired to the session's providers.
pub(crate) fn token_stream(providers: &Providers, session: &Session, config: &SessionConfig) -> TokenStream {
    let mut stream = TokenStream::new();
    if let Some(security) = &providers.security {
        stream = stream.with_security(Arc::clone(security));
    }
    if let (Some(keys), Some(_)) = (&providers.keys, session.features().column_encryption) {
        stream = stream.with_decryptor(Decryptor::new(Arc::clone(keys), config.server_name.clone()));
    }
    stream
}

impl<T> std::fmt::Debug for SessionDriver<T>
where
    T: AsyncRead + AsyncWrite,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("state", &self.session.state())
            .field("encryption", &self.encryption)
            .field("providers", &self.providers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use tds_protocol::prelogin::EncryptionLevel;
    use tds_protocol::token::{
        Done, DoneStatus, EnvChange, EnvChangeType, EnvValue, LoginAck, Routing, TokenType,
    };
    use tds_protocol::version::{ProtocolTier, TdsVersion};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::config::TimeoutConfig;
    use crate::state::SessionState;

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<&'static str>>>);

    impl TransportUpgrade for Events {
        fn begin_tls(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("begin");
            Ok(())
        }

        fn end_tls(&mut self) -> Result<()> {
            self.0.lock().unwrap().push("end");
            Ok(())
        }
    }

    /// Read one client message; returns its packet type and payload.
    async fn receive(server: &mut DuplexStream) -> (u8, Vec<u8>) {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 8];
            server.read_exact(&mut header).await.unwrap();
            let len = u16::from_be_bytes([header[2], header[3]]) as usize;
            let mut body = vec![0u8; len - 8];
            server.read_exact(&mut body).await.unwrap();
            payload.extend(body);
            if header[1] & 0x01 != 0 {
                return (header[0], payload);
            }
        }
    }

    async fn reply(server: &mut DuplexStream, payload: &[u8]) {
        let len = (8 + payload.len()) as u16;
        let mut out = vec![0x04, 0x01];
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&[0, 0, 1, 0]);
        out.extend_from_slice(payload);
        server.write_all(&out).await.unwrap();
    }

    fn done(status: DoneStatus, rows: u64) -> Vec<u8> {
        let mut out = Vec::new();
        Done {
            status,
            cur_cmd: 0xC1,
            row_count: rows,
        }
        .encode(TokenType::Done, ProtocolTier::Denali, &mut out);
        out
    }

    fn login_response() -> Vec<u8> {
        let mut payload = Vec::new();
        LoginAck {
            interface: 1,
            version: TdsVersion::V7_4,
            prog_name: "Microsoft SQL Server".into(),
            prog_version: [16, 0, 0x10, 0x00],
        }
        .encode(&mut payload)
        .unwrap();

        let mut change = vec![0x04];
        for text in ["8192", "4096"] {
            change.push(text.len() as u8);
            change.extend(text.encode_utf16().flat_map(u16::to_le_bytes));
        }
        payload.push(0xE3);
        payload.extend_from_slice(&(change.len() as u16).to_le_bytes());
        payload.extend(change);
        payload.extend(done(DoneStatus::empty(), 0));
        payload
    }

    /// Answer PRELOGIN with encryption off and LOGIN7 with a LOGINACK.
    async fn accept_login(server: &mut DuplexStream) {
        let (kind, _) = receive(server).await;
        assert_eq!(kind, 0x12);
        let response = PreLogin::new().with_encryption(EncryptionLevel::Off);
        reply(server, &response.encode()).await;

        let (kind, login) = receive(server).await;
        assert_eq!(kind, 0x10);
        assert!(!login.is_empty());
        reply(server, &login_response()).await;
    }

    fn config() -> SessionConfig {
        SessionConfig::default()
            .server_name("db1")
            .sql_auth("sa", "secret")
            .timeouts(
                TimeoutConfig::new()
                    .login_timeout(Duration::from_secs(5))
                    .command_timeout(Duration::from_millis(50))
                    .attention_timeout(Duration::from_secs(2)),
            )
    }

    async fn logged_in() -> (SessionDriver<DuplexStream>, DuplexStream, Events) {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let events = Events::default();
        let mut driver = SessionDriver::new(client, config())
            .unwrap()
            .with_upgrade(Box::new(events.clone()));
        let (result, ()) = tokio::join!(driver.login(), accept_login(&mut server));
        result.unwrap();
        (driver, server, events)
    }

    #[tokio::test]
    async fn login_encrypts_only_the_login() {
        let (driver, _server, events) = logged_in().await;
        assert_eq!(driver.session().state(), SessionState::OpenLoggedIn);
        assert_eq!(driver.encryption(), Some(EncryptionMode::LoginOnly));
        assert_eq!(*events.0.lock().unwrap(), vec!["begin", "end"]);
        assert_eq!(driver.session().tier(), ProtocolTier::Denali);
        assert_eq!(driver.packet_size(), 8192);
    }

    #[tokio::test]
    async fn encryption_without_upgrade_is_a_config_error() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let mut driver = SessionDriver::new(client, config()).unwrap();
        let serve = async {
            receive(&mut server).await;
            let response = PreLogin::new().with_encryption(EncryptionLevel::Off);
            reply(&mut server, &response.encode()).await;
        };
        let (result, ()) = tokio::join!(driver.login(), serve);
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(driver.session().state().is_broken());
    }

    #[tokio::test]
    async fn silent_server_times_out_login() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let config = config().timeouts(TimeoutConfig::new().login_timeout(Duration::from_millis(20)));
        let mut driver = SessionDriver::new(client, config).unwrap();
        let err = driver.login().await.unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::Login }));
        assert!(driver.session().state().is_broken());
        assert!(matches!(driver.login().await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn failover_slice_expiry_is_transient() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let timeouts = TimeoutConfig::new()
            .login_timeout(Duration::from_millis(250))
            .multi_subnet_failover(true);
        let mut driver = SessionDriver::new(client, config().timeouts(timeouts)).unwrap();
        let started = Instant::now();
        let err = driver
            .login_attempt(1, Duration::from_millis(250))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::LoginAttempt }));
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(driver.session().state().is_broken());
    }

    #[tokio::test]
    async fn batch_rows_are_counted() {
        let (mut driver, mut server, _) = logged_in().await;
        let serve = async {
            let (kind, _) = receive(&mut server).await;
            assert_eq!(kind, 0x01);
            reply(&mut server, &done(DoneStatus::COUNT, 3)).await;
        };
        let mut sink = Discard;
        let (result, ()) = tokio::join!(driver.execute("UPDATE t SET a = 1", &mut sink), serve);
        assert_eq!(result.unwrap().rows_affected, 3);
    }

    #[tokio::test]
    async fn command_timeout_sends_attention_and_recovers() {
        let (mut driver, mut server, _) = logged_in().await;
        let serve = async {
            let (kind, _) = receive(&mut server).await;
            assert_eq!(kind, 0x01);
            let (kind, payload) = receive(&mut server).await;
            assert_eq!(kind, 0x06);
            assert!(payload.is_empty());
            reply(&mut server, &done(DoneStatus::ATTN, 0)).await;
        };
        let mut sink = Discard;
        let (result, ()) = tokio::join!(driver.execute("WAITFOR DELAY '01:00'", &mut sink), serve);
        let err = result.unwrap_err();
        assert!(matches!(err, Error::Timeout { phase: Phase::Command }));
        assert!(!err.is_fatal());
        assert_eq!(driver.session().state(), SessionState::OpenLoggedIn);
    }

    #[tokio::test]
    async fn routed_login_reports_the_target() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let events = Events::default();
        let mut driver = SessionDriver::new(client, config())
            .unwrap()
            .with_upgrade(Box::new(events));
        let serve = async {
            receive(&mut server).await;
            let response = PreLogin::new().with_encryption(EncryptionLevel::Off);
            reply(&mut server, &response.encode()).await;
            receive(&mut server).await;

            let mut payload = Vec::new();
            LoginAck {
                interface: 1,
                version: TdsVersion::V7_4,
                prog_name: "Microsoft SQL Server".into(),
                prog_version: [16, 0, 0, 0],
            }
            .encode(&mut payload)
            .unwrap();
            EnvChange {
                kind: EnvChangeType::Routing,
                new_value: EnvValue::Routing(Routing {
                    protocol: 0,
                    port: 1433,
                    server: "replica".into(),
                }),
                old_value: EnvValue::Empty,
            }
            .encode(&mut payload)
            .unwrap();
            payload.extend(done(DoneStatus::empty(), 0));
            reply(&mut server, &payload).await;
        };
        let (result, ()) = tokio::join!(driver.login(), serve);
        match result {
            Err(Error::Routing { server, port }) => {
                assert_eq!(server, "replica");
                assert_eq!(port, 1433);
            }
            other => panic!("expected routing, got {other:?}"),
        }
    }
}
