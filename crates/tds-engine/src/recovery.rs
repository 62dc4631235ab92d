//! Session state kept for transparent reconnection.
//!
//! The server describes per-session state as small records keyed by a state
//! id. The state at login is the initial table; later SESSIONSTATE tokens
//! carry deltas. A recovery login replays both through the session recovery
//! feature extension.

use bytes::{BufMut, Bytes, BytesMut};
use tds_protocol::Collation;
use tds_protocol::codec::write_b_varchar;
use tds_protocol::token::{SessionStateToken, write_state_record};
use tds_protocol::version::TdsVersion;

use crate::error::{Error, Result};

/// Number of distinct state ids.
pub const MAX_SESSION_STATES: usize = 256;

/// One delta record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateRecord {
    /// Sequence number of the token that carried it.
    pub sequence: u32,
    /// Whether the state can be replayed.
    pub recoverable: bool,
    /// Opaque state bytes.
    pub data: Bytes,
}

/// Recoverable state of one session.
#[derive(Debug, Clone)]
pub struct SessionRecovery {
    initial: Vec<Option<Bytes>>,
    delta: Vec<Option<StateRecord>>,
    unrecoverable: usize,
    /// Protocol version the session logged in with.
    pub tds_version: Option<TdsVersion>,
    /// Database at login.
    pub initial_database: Option<String>,
    /// Language at login.
    pub initial_language: Option<String>,
    /// Collation at login.
    pub initial_collation: Option<Collation>,
    /// Current database.
    pub database: Option<String>,
    /// Current language.
    pub language: Option<String>,
    /// Current collation.
    pub collation: Option<Collation>,
}

impl Default for SessionRecovery {
    fn default() -> Self {
        Self {
            initial: vec![None; MAX_SESSION_STATES],
            delta: vec![None; MAX_SESSION_STATES],
            unrecoverable: 0,
            tds_version: None,
            initial_database: None,
            initial_language: None,
            initial_collation: None,
            database: None,
            language: None,
            collation: None,
        }
    }
}

impl SessionRecovery {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh state for a reconnect: keeps the initial table and initial
    /// environment of `previous`, drops the deltas.
    #[must_use]
    pub fn for_reconnect(previous: &Self) -> Self {
        Self {
            initial: previous.initial.clone(),
            tds_version: previous.tds_version,
            initial_database: previous.initial_database.clone(),
            initial_language: previous.initial_language.clone(),
            initial_collation: previous.initial_collation,
            ..Self::default()
        }
    }

    /// Record the state the server reported at login.
    pub fn set_initial(&mut self, id: u8, data: Bytes) {
        self.initial[usize::from(id)] = Some(data);
    }

    /// State recorded at login for `id`.
    #[must_use]
    pub fn initial(&self, id: u8) -> Option<&Bytes> {
        self.initial[usize::from(id)].as_ref()
    }

    /// Latest delta for `id`.
    #[must_use]
    pub fn delta(&self, id: u8) -> Option<&StateRecord> {
        self.delta[usize::from(id)].as_ref()
    }

    /// Number of delta records that cannot be replayed.
    #[must_use]
    pub fn unrecoverable_count(&self) -> usize {
        self.unrecoverable
    }

    /// Whether the session can be recovered right now.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.unrecoverable == 0
    }

    /// Merge one record; a higher sequence replaces, a tie keeps the
    /// existing record.
    pub fn merge_record(&mut self, id: u8, record: StateRecord) {
        let slot = &mut self.delta[usize::from(id)];
        if let Some(existing) = slot {
            if record.sequence <= existing.sequence {
                return;
            }
            if !existing.recoverable {
                self.unrecoverable -= 1;
            }
        }
        if !record.recoverable {
            self.unrecoverable += 1;
        }
        *slot = Some(record);
    }

    /// Merge a SESSIONSTATE token.
    pub fn merge(&mut self, token: &SessionStateToken) {
        for (id, data) in &token.records {
            self.merge_record(
                *id,
                StateRecord {
                    sequence: token.sequence,
                    recoverable: token.recoverable,
                    data: data.clone(),
                },
            );
        }
        tracing::trace!(
            sequence = token.sequence,
            records = token.records.len(),
            unrecoverable = self.unrecoverable,
            "session state merged"
        );
    }

    /// Drop deltas and current environment after a reset-connection
    /// acknowledgment.
    pub fn reset_to_initial(&mut self) {
        self.delta.iter_mut().for_each(|slot| *slot = None);
        self.unrecoverable = 0;
        self.database = None;
        self.language = None;
        self.collation = None;
    }

    /// Check the version acknowledged by a recovery login.
    pub fn check_version(&self, acknowledged: TdsVersion) -> Result<()> {
        match self.tds_version {
            Some(expected) if expected != acknowledged => Err(Error::Catastrophic(format!(
                "recovery login acknowledged TDS {acknowledged}, session used {expected}"
            ))),
            _ => Ok(()),
        }
    }

    /// Serialize into the session recovery feature payload: the initial
    /// block, then the block to replay.
    pub fn serialize(&self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        let initial = self.initial.iter().enumerate().filter_map(|(id, data)| {
            data.as_ref().map(|d| (id, d))
        });
        write_block(
            &mut out,
            self.initial_database.as_deref(),
            self.initial_collation.as_ref(),
            self.initial_language.as_deref(),
            initial,
        )?;

        let current = self.delta.iter().enumerate().filter_map(|(id, record)| {
            record.as_ref().map(|r| (id, &r.data))
        });
        write_block(
            &mut out,
            self.database.as_deref(),
            self.collation.as_ref(),
            self.language.as_deref(),
            current,
        )?;
        Ok(out.freeze())
    }
}

fn write_block<'a>(
    out: &mut BytesMut,
    database: Option<&str>,
    collation: Option<&Collation>,
    language: Option<&str>,
    states: impl Iterator<Item = (usize, &'a Bytes)>,
) -> Result<()> {
    let mut block = BytesMut::new();
    write_b_varchar(&mut block, database.unwrap_or_default())?;
    match collation {
        Some(c) => {
            block.put_u8(Collation::SIZE as u8);
            c.encode(&mut block);
        }
        None => block.put_u8(0),
    }
    write_b_varchar(&mut block, language.unwrap_or_default())?;
    for (id, data) in states {
        write_state_record(&mut block, id as u8, data);
    }
    let len = u32::try_from(block.len())
        .map_err(|_| Error::Config("session recovery data too large".into()))?;
    out.put_u32_le(len);
    out.extend_from_slice(&block);
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(sequence: u32, recoverable: bool, data: &'static [u8]) -> StateRecord {
        StateRecord {
            sequence,
            recoverable,
            data: Bytes::from_static(data),
        }
    }

    #[test]
    fn higher_sequence_wins_ties_keep_existing() {
        let mut rec = SessionRecovery::new();
        rec.merge_record(3, record(5, true, b"a"));
        rec.merge_record(3, record(5, true, b"b"));
        assert_eq!(&rec.delta(3).unwrap().data[..], b"a");
        rec.merge_record(3, record(4, true, b"c"));
        assert_eq!(&rec.delta(3).unwrap().data[..], b"a");
        rec.merge_record(3, record(6, true, b"d"));
        assert_eq!(&rec.delta(3).unwrap().data[..], b"d");
    }

    #[test]
    fn unrecoverable_count_follows_replacements() {
        let mut rec = SessionRecovery::new();
        rec.merge_record(1, record(1, false, b"x"));
        rec.merge_record(2, record(1, false, b"y"));
        assert_eq!(rec.unrecoverable_count(), 2);
        rec.merge_record(1, record(2, true, b"z"));
        assert_eq!(rec.unrecoverable_count(), 1);
        assert!(!rec.is_recoverable());
        rec.reset_to_initial();
        assert!(rec.is_recoverable());
        assert!(rec.delta(2).is_none());
    }

    #[test]
    fn token_merge_applies_every_record() {
        let mut rec = SessionRecovery::new();
        rec.merge(&SessionStateToken {
            sequence: 9,
            recoverable: true,
            records: vec![(0, Bytes::from_static(b"p")), (255, Bytes::from_static(b"q"))],
        });
        assert_eq!(rec.delta(0).unwrap().sequence, 9);
        assert_eq!(&rec.delta(255).unwrap().data[..], b"q");
    }

    #[test]
    fn serialized_blocks_carry_lengths() {
        let mut rec = SessionRecovery::new();
        rec.initial_database = Some("db".into());
        rec.set_initial(7, Bytes::from_static(&[1, 2]));
        let bytes = rec.serialize().unwrap();

        // Initial block: db (1 + 4), no collation (1), no language (1),
        // state 7 (1 + 1 + 2).
        let first = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(first, 5 + 1 + 1 + 4);
        assert_eq!(&bytes[4 + first - 4..4 + first], &[7, 2, 1, 2]);

        // Empty replay block: three empty fields.
        let second = &bytes[4 + first..];
        assert_eq!(second, &[3, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn recovery_login_must_keep_version() {
        let mut rec = SessionRecovery::new();
        rec.tds_version = Some(TdsVersion::V7_4);
        assert!(rec.check_version(TdsVersion::V7_4).is_ok());
        assert!(rec.check_version(TdsVersion::V7_3B).is_err());

        let again = SessionRecovery::for_reconnect(&rec);
        assert_eq!(again.tds_version, Some(TdsVersion::V7_4));
    }
}
