use crate::types::LedgerId;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the replication layer and its collaborators.
#[derive(Debug, Error)]
pub enum Error {
    /// A leader-only operation was attempted while this member does not hold
    /// leadership. Retry once leadership is regained.
    #[error("not leader")]
    NotLeader,

    /// The ledger service cannot currently host a ledger this wide.
    #[error("insufficient ensemble: requested {requested}, available {available}")]
    InsufficientEnsemble { requested: usize, available: usize },

    /// One or more member log updates failed while publishing a ledger.
    /// Deletion of the ledger was attempted; the id is kept for manual repair.
    #[error("commit of ledger {ledger_id} failed, removal was attempted: {source}")]
    CommitFailure {
        ledger_id: LedgerId,
        #[source]
        source: Box<Error>,
    },

    #[error("version conflict on {path}: expected version {expected}")]
    VersionConflict { path: String, expected: u64 },

    #[error("coordination service connection lost")]
    ConnectivityLoss,

    #[error("no such coordination node: {0}")]
    NoSuchNode(String),

    #[error("no such ledger: {0}")]
    NoSuchLedger(LedgerId),

    #[error("ledger {0} is closed")]
    LedgerClosed(LedgerId),

    #[error("digest mismatch opening ledger {0}")]
    DigestMismatch(LedgerId),

    #[error("invalid quorum: ensemble {ensemble}, write {write_quorum}, ack {ack_quorum}")]
    InvalidQuorum {
        ensemble: usize,
        write_quorum: usize,
        ack_quorum: usize,
    },

    #[error("key of {0} bytes exceeds the 255 byte limit")]
    KeyTooLong(usize),

    #[error("malformed operation record: {0}")]
    MalformedRecord(&'static str),

    #[error("malformed log node {path}: {len} bytes")]
    MalformedLog { path: String, len: usize },

    #[error("transaction already closed")]
    TransactionClosed,

    #[error("local engine: {0:#}")]
    Engine(#[source] anyhow::Error),

    #[error("config: {0}")]
    Config(String),
}

impl Error {
    /// Wrap a local engine failure.
    pub fn engine(err: impl Into<anyhow::Error>) -> Self {
        Error::Engine(err.into())
    }

    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }
}
