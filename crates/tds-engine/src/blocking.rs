//! Blocking session driver.
//!
//! [`BlockingSession`] is the thread-per-session counterpart of
//! [`SessionDriver`](crate::SessionDriver). It runs the same
//! [`TokenStream`] and the same login steps; only the waiting differs.
//! Every read parks the thread, and deadlines are checked between reads.
//! Give the transport a read timeout (`TcpStream::set_read_timeout`) so a
//! silent server cannot park it past the deadline.

use std::io::{Read, Write};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tds_codec::{BlockingConnection, CodecError};
use tds_protocol::packet::PacketType;
use tds_protocol::prelogin::{EncryptionMode, PreLogin};
use tds_protocol::sql_batch::{AllHeaders, SqlBatch};
use tds_protocol::txn::TmRequest;
use tds_protocol::wire::Step;
use tds_protocol::ProtocolError;

use crate::config::SessionConfig;
use crate::driver::{self, TransportUpgrade};
use crate::error::{Error, Phase, Result};
use crate::instrumentation::{self, Redaction};
use crate::login::{self, PreLoginOutcome};
use crate::security::{Providers, SecurityContext};
use crate::session::Session;
use crate::state::SessionState;
use crate::stream::{Collect, Discard, RunSummary, TokenSink, TokenStream};
use crate::transaction;

/// Deadline and phase of the response being read.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    phase: Phase,
}

impl Deadline {
    fn after(limit: Duration, phase: Phase) -> Self {
        Self {
            at: Instant::now() + limit,
            phase,
        }
    }

    fn passed(&self) -> bool {
        Instant::now() >= self.at
    }
}

/// Opens a fresh blocking transport to a re-resolved named instance.
pub type BlockingReconnect<T> = Box<dyn FnMut() -> std::io::Result<T> + Send>;

/// Drives one session over a blocking transport.
pub struct BlockingSession<T> {
    conn: BlockingConnection<T>,
    session: Session,
    config: SessionConfig,
    providers: Providers,
    upgrade: Option<Box<dyn TransportUpgrade>>,
    reconnect: Option<BlockingReconnect<T>>,
    redaction: Redaction,
    encryption: Option<EncryptionMode>,
}

impl<T> BlockingSession<T>
where
    T: Read + Write,
{
    /// Session over `transport`; the configuration is validated first.
    pub fn new(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            conn: BlockingConnection::new(transport),
            session: Session::new(&config),
            config,
            providers: Providers::default(),
            upgrade: None,
            reconnect: None,
            redaction: Redaction::default(),
            encryption: None,
        })
    }

    /// Use these security and key providers.
    #[must_use]
    pub fn with_providers(mut self, providers: Providers) -> Self {
        self.providers = providers;
        self
    }

    /// Switch the transport to TLS through `upgrade`.
    #[must_use]
    pub fn with_upgrade(mut self, upgrade: Box<dyn TransportUpgrade>) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Retry PRELOGIN once over a transport from `reconnect` when the
    /// named instance fails.
    #[must_use]
    pub fn with_reconnect(mut self, reconnect: BlockingReconnect<T>) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Redact SQL text in spans this way.
    #[must_use]
    pub fn with_redaction(mut self, redaction: Redaction) -> Self {
        self.redaction = redaction;
        self
    }

    /// Session state.
    #[must_use]
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Negotiated encryption, once PRELOGIN finished.
    #[must_use]
    pub fn encryption(&self) -> Option<EncryptionMode> {
        self.encryption
    }

    /// The transport, for adjusting its timeouts.
    pub fn transport_mut(&mut self) -> &mut T {
        self.conn.transport_mut()
    }

    /// PRELOGIN, encryption negotiation, LOGIN7 and the login response.
    ///
    /// Any failure, a timeout included, leaves the session broken.
    pub fn login(&mut self) -> Result<()> {
        if self.session.state() != SessionState::Closed {
            return Err(Error::Config("login on a session that is already open".into()));
        }
        self.session.transition(SessionState::OpenNotLoggedIn)?;
        let span = instrumentation::login_span(&self.config);
        let deadline = Deadline::after(self.config.timeouts.login_timeout, Phase::Login);
        let result = span.in_scope(|| self.handshake(deadline));
        self.session.set_login_phase(false);
        if let Err(e) = &result {
            tracing::error!(error = %e, "login failed");
            self.break_session();
        }
        result
    }

    fn handshake(&mut self, deadline: Deadline) -> Result<()> {
        let mode = self.prelogin(deadline)?;
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
        self.send(PacketType::Tds7Login, &login)?;
        if mode == EncryptionMode::LoginOnly {
            self.upgrade()?.end_tls()?;
        }

        let mut stream = self.token_stream();
        self.run(&mut stream, &mut Discard, deadline)?;

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
        tracing::debug!(tier = %self.session.tier(), "logged in");
        Ok(())
    }

    fn prelogin(&mut self, deadline: Deadline) -> Result<EncryptionMode> {
        let request = login::prelogin_request(&self.config).encode();
        let mut retried = false;
        loop {
            self.send(PacketType::PreLogin, &request)?;
            while !self.conn.channel().message_complete() {
                self.fill(deadline)?;
            }
            let payload = self.conn.channel_mut().take_payload();
            if payload.is_empty() {
                return Err(ProtocolError::Truncated {
                    what: "prelogin response",
                    needed: 1,
                    available: 0,
                }
                .into());
            }
            match login::read_prelogin(&self.config, &PreLogin::decode(&payload)?)? {
                PreLoginOutcome::Proceed(mode) => return Ok(mode),
                PreLoginOutcome::InstanceFailure => {
                    let reconnect = match self.reconnect.as_mut() {
                        Some(reconnect) if !retried => reconnect,
                        _ => return Err(Error::InstanceFailure),
                    };
                    tracing::warn!("named instance failed, retrying prelogin on a new transport");
                    let transport = reconnect().map_err(CodecError::from)?;
                    self.conn = BlockingConnection::new(transport);
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
    pub fn execute(&mut self, sql: &str, sink: &mut dyn TokenSink) -> Result<RunSummary> {
        self.session.state().check_ready()?;
        let span = instrumentation::batch_span(sql, &self.redaction);
        let _entered = span.enter();
        let headers = AllHeaders::new(self.session.transaction().current(), 1);
        let batch = SqlBatch::new(sql).with_headers(headers).encode(self.session.tier());
        self.send(PacketType::SqlBatch, &batch)?;
        let summary = self.respond(sink)?;
        span.record("rows", summary.rows_affected);
        Ok(summary)
    }

    /// Run a SQL batch and buffer its results.
    pub fn query(&mut self, sql: &str) -> Result<Collect> {
        let mut collect = Collect::new();
        self.execute(sql, &mut collect)?;
        Ok(collect)
    }

    /// Send a transaction manager request and read its response.
    pub fn transaction(
        &mut self,
        request: &TmRequest,
        delegated: bool,
        sink: &mut dyn TokenSink,
    ) -> Result<RunSummary> {
        let open_results = self.conn.channel().open_results();
        let payload = transaction::prepare(&mut self.session, request, delegated, open_results)?;
        let span = instrumentation::transaction_span(request);
        let result = span.in_scope(|| {
            self.send(PacketType::TransactionManager, &payload)?;
            self.respond(sink)
        });
        transaction::complete(&mut self.session, request);
        result
    }

    /// Address of the server's transaction coordinator.
    pub fn dtc_address(&mut self) -> Result<Bytes> {
        let mut collect = Collect::new();
        self.transaction(&TmRequest::GetDtcAddress, false, &mut collect)?;
        transaction::dtc_address(&collect)
    }

    /// Send attention and drain to its acknowledgment.
    pub fn cancel(&mut self) -> Result<()> {
        self.session.state().check_open()?;
        self.send_attention()?;
        let mut stream = self.token_stream();
        let deadline = Deadline::after(self.config.timeouts.attention_timeout, Phase::Attention);
        self.run(&mut stream, &mut Discard, deadline)?;
        Ok(())
    }

    /// Mark the session closed.
    pub fn close(&mut self) -> Result<()> {
        self.session.transition(SessionState::Closed)
    }

    fn respond(&mut self, sink: &mut dyn TokenSink) -> Result<RunSummary> {
        let mut stream = self.token_stream();
        let deadline = Deadline::after(self.config.timeouts.command_timeout, Phase::Command);
        self.run(&mut stream, sink, deadline)
    }

    /// Feed `stream` until the response ends.
    ///
    /// A command deadline turns into attention and a drain bounded by the
    /// attention timeout; any other deadline breaks the session.
    fn run(
        &mut self,
        stream: &mut TokenStream,
        sink: &mut dyn TokenSink,
        mut deadline: Deadline,
    ) -> Result<RunSummary> {
        loop {
            let step = stream.advance(self.conn.channel_mut(), &mut self.session, sink);
            if let Some(size) = stream.take_packet_size_change() {
                self.conn.set_packet_size(size)?;
            }
            match step {
                Ok(Step::Ready(summary)) => return Ok(summary),
                Ok(Step::NeedMore) => {
                    if self.conn.channel().has_output() {
                        let flushed = self.conn.flush();
                        self.check_sent(flushed)?;
                    }
                    match self.fill(deadline) {
                        Ok(()) => {}
                        Err(Error::Timeout { phase: Phase::Command }) => {
                            tracing::debug!("command timed out, sending attention");
                            stream.escalate(Error::Timeout { phase: Phase::Command });
                            self.send_attention()?;
                            deadline =
                                Deadline::after(self.config.timeouts.attention_timeout, Phase::Attention);
                        }
                        Err(e) => return Err(e),
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

    /// One blocking read, bounded by `deadline`.
    ///
    /// Only a command timeout leaves the session usable.
    fn fill(&mut self, deadline: Deadline) -> Result<()> {
        let timed_out = if deadline.passed() {
            true
        } else {
            match self.conn.fill() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_timeout() => deadline.passed(),
                Err(e) => {
                    self.session.mark_broken();
                    return Err(e.into());
                }
            }
        };
        if !timed_out {
            // The transport gave up before the deadline; read again.
            return Ok(());
        }
        if deadline.phase != Phase::Command {
            tracing::error!(phase = %deadline.phase, "deadline passed");
            self.break_session();
        }
        Err(Error::Timeout {
            phase: deadline.phase,
        })
    }

    fn send(&mut self, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let sent = self.conn.send_message(packet_type, payload);
        self.check_sent(sent)
    }

    fn send_attention(&mut self) -> Result<()> {
        let sent = self.conn.send_attention();
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

    fn token_stream(&self) -> TokenStream {
        driver::token_stream(&self.providers, &self.session, &self.config)
    }

    fn break_session(&mut self) {
        self.session.mark_broken();
        self.conn.channel_mut().mark_broken();
    }
}

impl<T> std::fmt::Debug for BlockingSession<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingSession")
            .field("state", &self.session.state())
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}
