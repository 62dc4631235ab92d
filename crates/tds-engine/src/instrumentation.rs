//! Tracing spans for session operations.
//!
//! Every driver operation runs inside a span named after it, carrying the
//! server, the database and, for batches, a redacted copy of the batch text.
//! No subscriber is installed here; the embedding application decides where
//! spans go.

use tds_protocol::txn::TmRequest;
use tracing::Span;

use crate::config::SessionConfig;

/// Span names.
pub mod span_names {
    /// PRELOGIN, LOGIN7 and the login response.
    pub const LOGIN: &str = "tds.login";
    /// A SQL batch and its response.
    pub const BATCH: &str = "tds.batch";
    /// A transaction manager request.
    pub const TRANSACTION: &str = "tds.transaction";
    /// An attention and its drain.
    pub const ATTENTION: &str = "tds.attention";
}

/// How batch text is recorded on spans.
#[derive(Debug, Clone)]
pub struct Redaction {
    /// Replace literals with the placeholder.
    pub enabled: bool,
    /// Longest recorded text, in characters.
    pub max_len: usize,
    /// Stand-in for a literal.
    pub placeholder: String,
}

impl Default for Redaction {
    fn default() -> Self {
        Self {
            enabled: true,
            max_len: 2048,
            placeholder: "?".to_string(),
        }
    }
}

impl Redaction {
    /// Record batch text verbatim, only truncated.
    #[must_use]
    pub fn verbatim() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Text to record for `sql`.
    #[must_use]
    pub fn apply(&self, sql: &str) -> String {
        if self.enabled {
            truncate(&strip_literals(sql, &self.placeholder), self.max_len)
        } else {
            truncate(sql, self.max_len)
        }
    }
}

/// Replace quoted strings and numeric literals. Identifiers that contain
/// digits are left alone.
fn strip_literals(sql: &str, placeholder: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\'' {
            // '' inside a literal is an escaped quote.
            loop {
                match chars.next() {
                    Some('\'') if chars.peek() == Some(&'\'') => {
                        chars.next();
                    }
                    Some('\'') | None => break,
                    Some(_) => {}
                }
            }
            out.push_str(placeholder);
            continue;
        }

        let in_word = out.ends_with(|p: char| p.is_alphanumeric() || p == '_' || p == '@');
        if c.is_ascii_digit() && !in_word {
            while chars.peek().is_some_and(|n| n.is_ascii_digit() || *n == '.') {
                chars.next();
            }
            out.push_str(placeholder);
            continue;
        }
        out.push(c);
    }
    out
}

fn truncate(text: &str, max_len: usize) -> String {
    match text.char_indices().nth(max_len) {
        None => text.to_string(),
        Some((cut, _)) => format!("{}...", &text[..cut]),
    }
}

/// First keyword of a batch, upper-cased, for the operation field.
#[must_use]
pub fn operation(sql: &str) -> &'static str {
    let word = sql
        .trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    match word.as_str() {
        "SELECT" => "SELECT",
        "INSERT" => "INSERT",
        "UPDATE" => "UPDATE",
        "DELETE" => "DELETE",
        "MERGE" => "MERGE",
        "EXEC" | "EXECUTE" => "EXECUTE",
        "BEGIN" => "BEGIN",
        "COMMIT" => "COMMIT",
        "ROLLBACK" => "ROLLBACK",
        "CREATE" | "ALTER" | "DROP" => "DDL",
        _ => "OTHER",
    }
}

/// Span around a login.
#[must_use]
pub fn login_span(config: &SessionConfig) -> Span {
    tracing::debug_span!(
        "tds.login",
        server = %config.server_name,
        database = %config.database,
        encryption = ?config.encryption,
        mars = config.mars,
    )
}

/// Span around a batch.
#[must_use]
pub fn batch_span(sql: &str, redaction: &Redaction) -> Span {
    tracing::debug_span!(
        "tds.batch",
        operation = operation(sql),
        statement = %redaction.apply(sql),
        rows = tracing::field::Empty,
    )
}

/// Span around a transaction manager request.
#[must_use]
pub fn transaction_span(request: &TmRequest) -> Span {
    tracing::debug_span!("tds.transaction", code = request.code())
}

/// Span around an attention drain.
#[must_use]
pub fn attention_span() -> Span {
    tracing::debug_span!("tds.attention")
}
