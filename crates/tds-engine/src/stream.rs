//! The token run.
//!
//! [`TokenStream`] reads one response, token by token, straight from a
//! [`Channel`]. It never blocks: when the buffered packets run out it
//! returns `Step::NeedMore` with its position saved, and the caller feeds
//! the channel and calls again. Session-level tokens are applied to the
//! [`Session`] as they are read; result tokens go to a [`TokenSink`].

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tds_codec::Channel;
use tds_protocol::crypto::CekTable;
use tds_protocol::metadata::{ColMetaData, ColumnDescriptor, ReturnValueHeader};
use tds_protocol::packet::PacketType;
use tds_protocol::token::{ColInfo, Done, FedAuthInfo, ServerMessage, Token, TokenType};
use tds_protocol::wire::Step;
use tds_protocol::{CryptoMetadata, ProtocolError};
use tds_values::SqlValue;

use crate::error::{Error, Result, ServerErrors};
use crate::input::decode_from;
use crate::row::{Decryptor, Row, RowAction, RowDecoder};
use crate::security::SecurityProvider;
use crate::session::Session;
use crate::state::RunBehavior;

/// An output parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ReturnValue {
    /// Parameter ordinal.
    pub ordinal: u16,
    /// Parameter name.
    pub name: String,
    /// Status byte.
    pub status: u8,
    /// The value. Encrypted parameters arrive as ciphertext.
    pub value: SqlValue,
    /// Encryption description of an encrypted parameter.
    pub crypto: Option<CryptoMetadata>,
}

/// Receives the result tokens of a response.
///
/// Every method has a default that ignores the token, so a sink only
/// implements what it cares about.
pub trait TokenSink {
    /// A new result shape.
    fn on_metadata(&mut self, columns: &Arc<[ColumnDescriptor]>) -> Result<()> {
        let _ = columns;
        Ok(())
    }

    /// Whether the next row should be decoded or stepped over.
    fn row_action(&mut self) -> RowAction {
        RowAction::Materialize
    }

    /// A decoded row. Not called for skipped rows.
    fn on_row(&mut self, row: Row) -> Result<()> {
        let _ = row;
        Ok(())
    }

    /// An output parameter.
    fn on_return_value(&mut self, value: ReturnValue) -> Result<()> {
        let _ = value;
        Ok(())
    }

    /// A stored procedure return status.
    fn on_return_status(&mut self, status: i32) {
        let _ = status;
    }

    /// End of a statement or procedure.
    fn on_done(&mut self, done: &Done) {
        let _ = done;
    }

    /// An informational message. Returning `true` takes it; otherwise it is
    /// kept with the warnings of the run.
    fn on_info(&mut self, message: &ServerMessage) -> bool {
        let _ = message;
        false
    }

    /// Ordered column numbers of the current result.
    fn on_order(&mut self, columns: &[u16]) {
        let _ = columns;
    }

    /// Source tables of the current result.
    fn on_table_names(&mut self, tables: &[Vec<String>]) {
        let _ = tables;
    }

    /// Browse-mode column information of the current result.
    fn on_col_info(&mut self, info: &[ColInfo]) {
        let _ = info;
    }
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Discard;

impl TokenSink for Discard {
    fn row_action(&mut self) -> RowAction {
        RowAction::Skip
    }
}

/// One buffered result set.
#[derive(Debug, Clone)]
pub struct ResultSet {
    /// Column descriptors.
    pub columns: Arc<[ColumnDescriptor]>,
    /// Rows in arrival order.
    pub rows: Vec<Row>,
}

/// A sink that buffers the whole response.
#[derive(Debug, Default)]
pub struct Collect {
    /// Result sets in arrival order.
    pub results: Vec<ResultSet>,
    /// Output parameters.
    pub return_values: Vec<ReturnValue>,
    /// Last return status.
    pub return_status: Option<i32>,
    /// Row counts reported by DONE tokens.
    pub row_counts: Vec<u64>,
}

impl Collect {
    /// Empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of the first result set.
    #[must_use]
    pub fn first_rows(&self) -> &[Row] {
        self.results.first().map_or(&[], |r| &r.rows)
    }
}

impl TokenSink for Collect {
    fn on_metadata(&mut self, columns: &Arc<[ColumnDescriptor]>) -> Result<()> {
        self.results.push(ResultSet {
            columns: Arc::clone(columns),
            rows: Vec::new(),
        });
        Ok(())
    }

    fn on_row(&mut self, row: Row) -> Result<()> {
        match self.results.last_mut() {
            Some(result) => result.rows.push(row),
            None => self.results.push(ResultSet {
                columns: row.columns().to_vec().into(),
                rows: vec![row],
            }),
        }
        Ok(())
    }

    fn on_return_value(&mut self, value: ReturnValue) -> Result<()> {
        self.return_values.push(value);
        Ok(())
    }

    fn on_return_status(&mut self, status: i32) {
        self.return_status = Some(status);
    }

    fn on_done(&mut self, done: &Done) {
        if let Some(rows) = done.rows() {
            self.row_counts.push(rows);
        }
    }
}

/// What a finished run reports.
#[derive(Debug, Default, Clone)]
pub struct RunSummary {
    /// The final DONE-family token.
    pub last_done: Option<Done>,
    /// Sum of the valid row counts.
    pub rows_affected: u64,
    /// Informational messages not taken by the sink.
    pub warnings: Vec<ServerMessage>,
    /// The response was cut short by an attention.
    pub cancelled: bool,
}

#[derive(Debug)]
enum Pending {
    Row(RowDecoder),
    ReturnValue(ReturnValueHeader, RowDecoder),
}

/// Reads one response.
pub struct TokenStream {
    behavior: RunBehavior,
    pending: Option<Pending>,
    columns: Option<Arc<[ColumnDescriptor]>>,
    cek_table: Option<CekTable>,
    result_open: bool,
    messages: ServerErrors,
    deferred: Option<Error>,
    summary: RunSummary,
    attention_acked: bool,
    packet_size_change: Option<usize>,
    decryptor: Option<Decryptor>,
    security: Option<Arc<dyn SecurityProvider>>,
    finished: bool,
}

impl Default for TokenStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStream {
    /// Stream for one response.
    #[must_use]
    pub fn new() -> Self {
        Self {
            behavior: RunBehavior::Deliver,
            pending: None,
            columns: None,
            cek_table: None,
            result_open: false,
            messages: ServerErrors::new(),
            deferred: None,
            summary: RunSummary::default(),
            attention_acked: false,
            packet_size_change: None,
            decryptor: None,
            security: None,
            finished: false,
        }
    }

    /// Decrypt encrypted columns with `decryptor`.
    #[must_use]
    pub fn with_decryptor(mut self, decryptor: Decryptor) -> Self {
        self.decryptor = Some(decryptor);
        self
    }

    /// Answer SSPI and federated authentication tokens with `provider`.
    #[must_use]
    pub fn with_security(mut self, provider: Arc<dyn SecurityProvider>) -> Self {
        self.security = Some(provider);
        self
    }

    /// Current run behavior.
    #[must_use]
    pub fn behavior(&self) -> RunBehavior {
        self.behavior
    }

    /// Read the rest of the response without delivering it, then fail with
    /// `error`. The first escalation wins.
    pub fn escalate(&mut self, error: Error) {
        tracing::debug!(%error, "run escalated to drain");
        self.deferred.get_or_insert(error);
        if self.behavior == RunBehavior::Deliver {
            self.behavior = RunBehavior::DrainThenFail;
        }
    }

    /// Packet size announced since the last call, for transports that
    /// keep their own framing limit.
    pub fn take_packet_size_change(&mut self) -> Option<usize> {
        self.packet_size_change.take()
    }

    /// Whether an attention acknowledgment was consumed since the last call.
    pub fn take_attention_ack(&mut self) -> bool {
        std::mem::take(&mut self.attention_acked)
    }

    /// Whether the response has been read to its end.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read tokens until the response ends or the buffered input runs out.
    ///
    /// Errors from decoding are fatal to the session; server errors are
    /// gathered and returned once the response is complete.
    pub fn advance(
        &mut self,
        ch: &mut Channel,
        session: &mut Session,
        sink: &mut dyn TokenSink,
    ) -> Result<Step<RunSummary>> {
        let result = match self.run(ch, session, sink) {
            Ok(Step::Ready(())) => self.finish(session).map(Step::Ready),
            Ok(Step::NeedMore) => Ok(Step::NeedMore),
            Err(e) => Err(e),
        };
        if let Err(e) = &result {
            if e.is_fatal() {
                ch.mark_broken();
                session.mark_broken();
            }
        }
        result
    }

    fn finish(&mut self, session: &mut Session) -> Result<RunSummary> {
        self.finished = true;
        if let Some(error) = self.deferred.take() {
            if error.is_fatal() {
                session.mark_broken();
            }
            return Err(error);
        }
        if self.messages.has_errors() {
            let errors = self.messages.take();
            if errors.has_fatal() {
                session.mark_broken();
            }
            return Err(Error::Server(errors));
        }
        let mut summary = std::mem::take(&mut self.summary);
        summary.warnings = self.messages.take().warnings().to_vec();
        Ok(summary)
    }

    fn delivering(&self, ch: &Channel) -> bool {
        self.behavior == RunBehavior::Deliver && !ch.attention_pending()
    }

    fn run(
        &mut self,
        ch: &mut Channel,
        session: &mut Session,
        sink: &mut dyn TokenSink,
    ) -> Result<Step<()>> {
        if self.finished {
            return Ok(Step::Ready(()));
        }
        loop {
            if ch.attention_pending() && self.behavior != RunBehavior::DrainAttention {
                tracing::debug!("draining until attention acknowledgment");
                self.behavior = RunBehavior::DrainAttention;
            }

            if let Some(pending) = self.pending.take() {
                match self.resume(pending, ch, sink)? {
                    Some(pending) => {
                        self.pending = Some(pending);
                        return Ok(Step::NeedMore);
                    }
                    None => continue,
                }
            }

            let id = match ch.try_peek_u8()? {
                Step::Ready(id) => id,
                Step::NeedMore => return Ok(Step::NeedMore),
            };
            let token = TokenType::from_u8(id)?;
            tracing::trace!(token = token.name(), "token");

            match token {
                TokenType::Row | TokenType::NbcRow => {
                    let columns = self.columns.clone().ok_or(ProtocolError::UnexpectedToken {
                        token: token.name(),
                        context: "row without column metadata",
                    })?;
                    ch.consume(1);
                    let action = if self.delivering(ch) {
                        sink.row_action()
                    } else {
                        RowAction::Skip
                    };
                    let decoder = RowDecoder::new(columns, token == TokenType::NbcRow, action);
                    self.pending = Some(Pending::Row(decoder));
                }
                TokenType::ReturnValue => {
                    let ctx = session.decode_context();
                    let step = decode_from(ch, |r| {
                        r.skip(1)?;
                        Ok(ReturnValueHeader::decode(r, ctx.tier, ctx.column_encryption)?)
                    })?;
                    let Step::Ready(header) = step else {
                        return Ok(Step::NeedMore);
                    };
                    let column = ColumnDescriptor {
                        user_type: header.user_type,
                        flags: header.flags,
                        type_info: header.type_info.clone(),
                        table_name: None,
                        crypto: None,
                        name: header.name.clone(),
                    };
                    let action = if self.delivering(ch) {
                        RowAction::Materialize
                    } else {
                        RowAction::Skip
                    };
                    let decoder = RowDecoder::new(Arc::from(vec![column]), false, action);
                    self.pending = Some(Pending::ReturnValue(header, decoder));
                }
                _ => {
                    let ctx = session.decode_context();
                    let step = decode_from(ch, |r| {
                        r.skip(1)?;
                        Ok(Token::decode(token, r, &ctx)?)
                    })?;
                    let Step::Ready(decoded) = step else {
                        return Ok(Step::NeedMore);
                    };
                    if self.apply(decoded, ch, session, sink)? {
                        self.finished = true;
                        return Ok(Step::Ready(()));
                    }
                }
            }
        }
    }

    /// Continue a row or return value; hands it back if still incomplete.
    fn resume(
        &mut self,
        pending: Pending,
        ch: &mut Channel,
        sink: &mut dyn TokenSink,
    ) -> Result<Option<Pending>> {
        match pending {
            Pending::Row(mut decoder) => {
                let Step::Ready(mut values) = self.advance_row(&mut decoder, ch)? else {
                    return Ok(Some(Pending::Row(decoder)));
                };
                if decoder.action() == RowAction::Materialize {
                    let columns = decoder.columns();
                    if let Some(decryptor) = &mut self.decryptor {
                        if let Err(e) =
                            decryptor.decrypt_row(columns, self.cek_table.as_ref(), &mut values)
                        {
                            self.escalate(e);
                            return Ok(None);
                        }
                    }
                    sink.on_row(Row::new(Arc::clone(columns), values))?;
                }
                Ok(None)
            }
            Pending::ReturnValue(header, mut decoder) => {
                let Step::Ready(mut values) = self.advance_row(&mut decoder, ch)? else {
                    return Ok(Some(Pending::ReturnValue(header, decoder)));
                };
                if decoder.action() == RowAction::Materialize {
                    sink.on_return_value(ReturnValue {
                        ordinal: header.ordinal,
                        name: header.name,
                        status: header.status,
                        value: values.pop().unwrap_or(SqlValue::Null),
                        crypto: header.crypto,
                    })?;
                }
                Ok(None)
            }
        }
    }

    /// Value errors that leave the stream readable switch the row to
    /// skipping and fail the run once the response is drained.
    fn advance_row(&mut self, decoder: &mut RowDecoder, ch: &mut Channel) -> Result<Step<Vec<SqlValue>>> {
        loop {
            match decoder.advance(ch) {
                Err(Error::Value(e)) if !matches!(e, tds_values::ValueError::Protocol(_)) => {
                    tracing::warn!(error = %e, "value could not be decoded, skipping rest of response");
                    decoder.skip_remaining();
                    self.escalate(Error::Value(e));
                }
                other => return other,
            }
        }
    }

    /// Apply one decoded token. Returns `true` when the response is over.
    fn apply(
        &mut self,
        token: Token,
        ch: &mut Channel,
        session: &mut Session,
        sink: &mut dyn TokenSink,
    ) -> Result<bool> {
        let delivering = self.delivering(ch);
        match token {
            Token::ColMetaData(meta) => {
                if self.result_open {
                    ch.result_closed();
                }
                match meta {
                    ColMetaData::NoMetadata => {
                        self.columns = None;
                        self.cek_table = None;
                        self.result_open = false;
                    }
                    ColMetaData::Columns { cek_table, columns } => {
                        tracing::trace!(columns = columns.len(), "result shape");
                        if let Some(decryptor) = &mut self.decryptor {
                            decryptor.reset();
                        }
                        if delivering {
                            sink.on_metadata(&columns)?;
                        }
                        self.columns = Some(columns);
                        self.cek_table = cek_table;
                        self.result_open = true;
                        ch.result_opened();
                    }
                }
            }
            Token::Done(done) | Token::DoneProc(done) | Token::DoneInProc(done) => {
                return Ok(self.on_done(done, ch, sink, delivering));
            }
            Token::Error(message) => {
                if message.is_fatal() {
                    tracing::error!(
                        number = message.number,
                        class = message.class,
                        "fatal server error, draining response"
                    );
                    self.behavior = match self.behavior {
                        RunBehavior::Deliver => RunBehavior::DrainThenFail,
                        other => other,
                    };
                }
                self.messages.push(message);
            }
            Token::Info(message) => {
                if !(delivering && sink.on_info(&message)) {
                    self.messages.push(message);
                }
            }
            Token::LoginAck(ack) => session.apply_login_ack(&ack)?,
            Token::EnvChange(changes) => {
                for change in &changes {
                    let applied = session
                        .apply_env_change(change)
                        .and_then(|size| match size {
                            Some(size) => ch.set_packet_size(size).map(|()| Some(size)).map_err(Error::from),
                            None => Ok(None),
                        });
                    match applied {
                        Ok(Some(size)) => self.packet_size_change = Some(size),
                        Ok(None) => {}
                        Err(e) => {
                            // Nothing after an unapplied change can be trusted.
                            ch.mark_broken();
                            session.mark_broken();
                            return Err(e);
                        }
                    }
                }
            }
            Token::FeatureExtAck(acks) => session.apply_feature_acks(&acks)?,
            Token::SessionState(state) => session.apply_session_state(&state)?,
            Token::Sspi(blob) => {
                let provider = self.provider()?;
                let reply = provider.sspi_step(Some(&blob))?;
                tracing::debug!(received = blob.len(), sent = reply.len(), "sspi round");
                ch.write_message(PacketType::Sspi, &reply)?;
            }
            Token::FedAuthInfo(info) => self.answer_fed_auth(&info, ch)?,
            Token::ReturnStatus(status) => {
                if delivering {
                    sink.on_return_status(status);
                }
            }
            Token::Order(columns) => {
                if delivering && self.result_open {
                    sink.on_order(&columns);
                }
            }
            Token::TabName(tables) => {
                if delivering && self.result_open {
                    sink.on_table_names(&tables);
                }
            }
            Token::ColInfo(info) => {
                if delivering && self.result_open {
                    sink.on_col_info(&info);
                }
            }
            Token::Offset { .. } => {}
        }
        Ok(false)
    }

    fn on_done(&mut self, done: Done, ch: &mut Channel, sink: &mut dyn TokenSink, delivering: bool) -> bool {
        tracing::trace!(status = done.status.bits(), rows = done.row_count, "done");
        if self.result_open {
            ch.result_closed();
            self.result_open = false;
        }
        if let Some(rows) = done.rows() {
            self.summary.rows_affected += rows;
        }
        if delivering {
            sink.on_done(&done);
        }
        self.summary.last_done = Some(done);

        if done.is_attention_ack() {
            ch.acknowledge_attention();
            self.attention_acked = true;
            self.summary.cancelled = true;
            self.behavior = if self.deferred.is_some() {
                RunBehavior::DrainThenFail
            } else {
                RunBehavior::Deliver
            };
        }

        let more_bytes = !ch.payload().is_empty() || !ch.message_complete();
        !done.has_more() && !more_bytes && !ch.attention_pending()
    }

    fn provider(&self) -> Result<&dyn SecurityProvider> {
        self.security
            .as_deref()
            .ok_or_else(|| Error::Security("server requested a security token but no provider is configured".into()))
    }

    fn answer_fed_auth(&self, info: &FedAuthInfo, ch: &mut Channel) -> Result<()> {
        let token = self.provider()?.fed_auth_token(info)?;
        let token_len = u32::try_from(token.len())
            .map_err(|_| Error::Security("federated authentication token too large".into()))?;
        let mut payload = BytesMut::with_capacity(token.len() + 8);
        payload.put_u32_le(token_len + 4);
        payload.put_u32_le(token_len);
        payload.extend_from_slice(&token);
        tracing::debug!(len = token.len(), "sending federated authentication token");
        ch.write_message(PacketType::FedAuthToken, &payload)?;
        Ok(())
    }
}

impl std::fmt::Debug for TokenStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenStream")
            .field("behavior", &self.behavior)
            .field("pending", &self.pending)
            .field("result_open", &self.result_open)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
