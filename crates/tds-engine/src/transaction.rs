//! Transaction manager requests.
//!
//! The connection layer asks for transaction work in terms of
//! [`TransactionRequest`]; this module turns that into a [`TmRequest`] and
//! its ALL_HEADERS, and checks what the session state forbids before
//! anything is written.

use bytes::Bytes;
use tds_protocol::sql_batch::AllHeaders;
use tds_protocol::txn::{IsolationLevel, TmRequest};
use tds_values::SqlValue;

use crate::error::{Error, Result};
use crate::session::Session;
use crate::stream::Collect;

/// Transaction work requested by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionRequest {
    /// Begin a local transaction.
    Begin,
    /// Promote the local transaction to a distributed one.
    Promote,
    /// Commit.
    Commit,
    /// Roll back.
    Rollback,
    /// Roll back if a transaction is still open. The server reports every
    /// transaction it ends, so this is a plain rollback on the wire.
    IfRollback,
    /// Create a savepoint.
    Save,
}

impl TransactionRequest {
    /// Wire request for this kind.
    #[must_use]
    pub fn to_tm(self, name: &str, isolation: IsolationLevel) -> TmRequest {
        let name = name.to_owned();
        match self {
            Self::Begin => TmRequest::Begin { isolation, name },
            Self::Promote => TmRequest::Promote,
            Self::Commit => TmRequest::Commit {
                name,
                begin_new: None,
            },
            Self::Rollback | Self::IfRollback => TmRequest::Rollback {
                name,
                begin_new: None,
            },
            Self::Save => TmRequest::Save { name },
        }
    }
}

/// Whether a request finishes or promotes a delegated transaction.
fn controls_delegation(request: &TmRequest) -> bool {
    matches!(
        request,
        TmRequest::Promote | TmRequest::Commit { .. } | TmRequest::Rollback { .. }
    )
}

/// Refuse requests the session cannot carry right now.
///
/// Finishing a delegated transaction while results are still being read
/// would interleave two responses on one channel, so without MARS it fails.
pub fn check_request(session: &Session, request: &TmRequest, delegated: bool, open_results: u32) -> Result<()> {
    session.state().check_ready()?;
    if delegated && controls_delegation(request) && !session.is_mars() && open_results != 0 {
        return Err(Error::Transaction(format!(
            "cannot complete a delegated transaction with {open_results} open result set(s)"
        )));
    }
    if let TmRequest::Propagate { token } = request {
        if token.is_empty() {
            return Err(Error::Transaction("empty propagation token".into()));
        }
    }
    Ok(())
}

/// Encode `request` for this session, marking a begin as pending.
pub fn prepare(session: &mut Session, request: &TmRequest, delegated: bool, open_results: u32) -> Result<Bytes> {
    check_request(session, request, delegated, open_results)?;
    let headers = AllHeaders::new(session.transaction().current(), open_results.max(1));
    let payload = request.encode(&headers)?;
    if matches!(request, TmRequest::Begin { .. }) {
        session.transaction_mut().begin_requested();
    }
    tracing::debug!(
        code = request.code(),
        transaction = session.transaction().current(),
        delegated,
        "transaction manager request"
    );
    Ok(payload)
}

/// The response to `request` has been read, successfully or not.
pub fn complete(session: &mut Session, request: &TmRequest) {
    if matches!(request, TmRequest::Begin { .. }) {
        session.transaction_mut().request_finished();
    }
}

/// Pull the DTC address out of a GetDtcAddress response: one row, one
/// binary column.
pub fn dtc_address(response: &Collect) -> Result<Bytes> {
    let row = response
        .first_rows()
        .first()
        .ok_or_else(|| Error::Transaction("no DTC address returned".into()))?;
    match row.value(0) {
        Some(SqlValue::Binary(address)) => Ok(address.clone()),
        Some(other) => Err(Error::Transaction(format!(
            "DTC address has type {}",
            other.type_name()
        ))),
        None => Err(Error::Transaction("DTC address row is empty".into())),
    }
}
