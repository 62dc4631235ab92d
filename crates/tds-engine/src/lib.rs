//! # tds-engine
//!
//! Client side of a TDS session: the token stream parser and the session
//! and login state machine, on top of [`tds_codec`] framing and
//! [`tds_values`] value decoding.
//!
//! The engine is layered so that each piece can run without the one above:
//!
//! - [`TokenStream`] decodes one response from a [`Channel`](tds_codec::Channel).
//!   It never blocks; when input runs out it returns
//!   [`Step::NeedMore`](tds_protocol::Step) and resumes from the same token,
//!   row or PLP chunk once more packets arrive.
//! - [`Session`] holds what the server negotiated: protocol tier, packet
//!   size, collation, transaction descriptor, acknowledged features and the
//!   recoverable session state.
//! - [`SessionDriver`] runs PRELOGIN and LOGIN7, SQL batches and
//!   transaction manager requests over an async transport, with deadlines.
//!   [`BlockingSession`] does the same on the calling thread over
//!   `std::io::Read + Write`.
//!
//! ## Session states
//!
//! ```text
//! Closed -> OpenNotLoggedIn (PRELOGIN sent)
//! OpenNotLoggedIn -> OpenLoggedIn (LOGINACK and the final DONE)
//! OpenLoggedIn -> Closed (orderly close)
//! any -> Broken (fatal error; nothing more is sent)
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use tds_engine::{Collect, SessionConfig, SessionDriver};
//!
//! let stream = tokio::net::TcpStream::connect("db1:1433").await?;
//! let config = SessionConfig::new()
//!     .server_name("db1")
//!     .sql_auth("app", "secret")
//!     .database("orders");
//!
//! let mut driver = SessionDriver::new(stream, config)?.with_upgrade(tls);
//! driver.login().await?;
//!
//! let results = driver.query("SELECT id, name FROM customers").await?;
//! for row in results.first_rows() {
//!     let name: String = row.get(1)?;
//!     println!("{name}");
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod blocking;
pub mod cancel;
pub mod config;
pub mod driver;
pub mod error;
mod input;
pub mod instrumentation;
pub mod login;
pub mod recovery;
pub mod row;
pub mod security;
pub mod session;
pub mod state;
pub mod stream;
pub mod transaction;

pub use blocking::{BlockingReconnect, BlockingSession};
pub use cancel::CancelHandle;
pub use config::{FeatureRequest, FedAuthRequest, SessionConfig, TimeoutConfig};
pub use driver::{Reconnect, SessionDriver, TransportUpgrade};
pub use error::{Error, Phase, Result, ServerErrors};
pub use instrumentation::Redaction;
pub use recovery::SessionRecovery;
pub use row::{Decryptor, Row, RowAction};
pub use security::{KeyProvider, Providers, SecurityContext, SecurityProvider};
pub use session::{NegotiatedFeatures, Session, TransactionState};
pub use state::{RunBehavior, SessionState};
pub use stream::{Collect, Discard, ResultSet, ReturnValue, RunSummary, TokenSink, TokenStream};
pub use tds_values::{FromSql, SqlValue};
pub use transaction::TransactionRequest;
