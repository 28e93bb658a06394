//! Replication protocol for the user directory: two-phase commit.
//!
//! The coordinator asks every participant (itself included) to vote on a
//! transaction; only a unanimous yes commits, anything else aborts. Each
//! participant keeps a durable transaction log so that in-flight
//! transactions survive a restart and keep blocking conflicting ones.
//!
//! References:
//!   - <https://en.wikipedia.org/wiki/Two-phase_commit_protocol>

mod coordinator;
mod participant;
mod txnlog;

use std::fmt;

use crate::server::ReplicaId;

use serde::{Deserialize, Serialize};

pub use coordinator::{CommitAcks, Coordinator};
pub use participant::Participant;
pub use txnlog::TxnLog;

/// Transaction ID type (UUID v4 string).
pub type TxnId = String;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigTwoPc {
    /// How long the coordinator waits for all votes, in millisecs. A vote
    /// missing at the deadline counts as no.
    pub vote_timeout_ms: u64,

    /// How long the coordinator's background waiter waits for every
    /// participant's commit acknowledgement, in millisecs.
    pub commit_ack_timeout_ms: u64,

    /// How long a participant waits for a conflicting live transaction on
    /// the same key to end before voting no, in millisecs. Kept below
    /// `vote_timeout_ms` so that the no vote reaches the coordinator.
    pub conflict_wait_ms: u64,

    /// Path to the durable transaction log file.
    pub txn_log_path: String,

    /// Whether to fsync after every transaction log append.
    pub logger_sync: bool,

    /// Maximum number of in-flight RPCs during one fan-out.
    pub fanout_workers: usize,
}

impl ReplicaConfigTwoPc {
    /// Default configuration with the log path made unique per replica.
    pub fn default_for(id: ReplicaId) -> Self {
        ReplicaConfigTwoPc {
            txn_log_path: format!("/tmp/tripstore.txnlog.{}", id),
            ..Default::default()
        }
    }
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigTwoPc {
    fn default() -> Self {
        ReplicaConfigTwoPc {
            vote_timeout_ms: 15_000,
            commit_ack_timeout_ms: 15_000,
            conflict_wait_ms: 5_000,
            txn_log_path: "/tmp/tripstore.txnlog.0".into(),
            logger_sync: false,
            fanout_workers: 16,
        }
    }
}

/// Phase marker of a transaction at one participant.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum TxnPhase {
    Prepared,
    StartedCommit,
    Committed,
    Aborted,
}

impl TxnPhase {
    /// Terminal phases no longer block conflicting transactions.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxnPhase::Committed | TxnPhase::Aborted)
    }
}

impl fmt::Display for TxnPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxnPhase::Prepared => write!(f, "Prepared"),
            TxnPhase::StartedCommit => write!(f, "Started commit"),
            TxnPhase::Committed => write!(f, "Committed"),
            TxnPhase::Aborted => write!(f, "Aborted"),
        }
    }
}

/// One record of the transaction log; one is appended per phase
/// transition.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct TxnLogEntry {
    pub txn: TxnId,

    pub coordinator: ReplicaId,

    /// Directory key (email) the transaction mutates.
    pub key: String,

    /// Operation tokens.
    pub op: Vec<String>,

    pub phase: TxnPhase,
}

impl TxnLogEntry {
    /// Copy of this entry moved to another phase.
    pub fn with_phase(&self, phase: TxnPhase) -> Self {
        TxnLogEntry {
            phase,
            ..self.clone()
        }
    }
}
