//! Session lifecycle states.
//!
//! ```text
//! Closed -> OpenNotLoggedIn (transport handed over)
//! OpenNotLoggedIn -> OpenLoggedIn (LOGINACK and the final DONE)
//! OpenLoggedIn -> Closed (orderly close)
//! any -> Broken (fatal I/O or protocol error)
//! ```
//!
//! `Broken` is terminal: every later operation fails without touching the
//! transport.

use crate::error::{Error, Result};

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No transport.
    #[default]
    Closed,
    /// Transport open, login not complete.
    OpenNotLoggedIn,
    /// Logged in and usable.
    OpenLoggedIn,
    /// A fatal error occurred.
    Broken,
}

impl SessionState {
    /// Fail fast unless requests may be sent.
    pub fn check_ready(self) -> Result<()> {
        match self {
            Self::OpenLoggedIn => Ok(()),
            Self::Broken => Err(Error::Broken),
            Self::Closed | Self::OpenNotLoggedIn => Err(Error::Closed),
        }
    }

    /// Fail fast unless the transport is open.
    pub fn check_open(self) -> Result<()> {
        match self {
            Self::OpenNotLoggedIn | Self::OpenLoggedIn => Ok(()),
            Self::Broken => Err(Error::Broken),
            Self::Closed => Err(Error::Closed),
        }
    }

    /// Move to `next`, refusing to leave `Broken`.
    pub fn transition(&mut self, next: Self) -> Result<()> {
        if *self == Self::Broken && next != Self::Broken {
            return Err(Error::Broken);
        }
        if *self != next {
            tracing::debug!(from = ?*self, to = ?next, "session state");
        }
        *self = next;
        Ok(())
    }

    /// Whether the session has hit a fatal error.
    #[must_use]
    pub fn is_broken(self) -> bool {
        self == Self::Broken
    }
}

/// How the token run treats the rest of the current response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunBehavior {
    /// Hand tokens to the sink.
    #[default]
    Deliver,
    /// A fatal error or timeout was seen: read to the end, then fail.
    DrainThenFail,
    /// An attention is outstanding: discard until its acknowledgment.
    DrainAttention,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn broken_is_terminal() {
        let mut state = SessionState::OpenLoggedIn;
        state.transition(SessionState::Broken).unwrap();
        assert!(matches!(
            state.transition(SessionState::OpenLoggedIn),
            Err(Error::Broken)
        ));
        assert!(matches!(state.check_ready(), Err(Error::Broken)));
        assert!(state.is_broken());
    }

    #[test]
    fn only_logged_in_is_ready() {
        assert!(matches!(SessionState::Closed.check_ready(), Err(Error::Closed)));
        assert!(SessionState::OpenNotLoggedIn.check_ready().is_err());
        assert!(SessionState::OpenNotLoggedIn.check_open().is_ok());
        assert!(SessionState::OpenLoggedIn.check_ready().is_ok());
    }
}
