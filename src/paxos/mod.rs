//! Replication protocol: single-decree Paxos per key.
//!
//! Every mutating itinerary operation (PUT, DELETE, EDIT, SHARE) is agreed
//! upon by one Paxos instance keyed by the itinerary id. Once a value is
//! chosen it is learned (applied) by every replica and the key's acceptor
//! bookkeeping is cleared, so the next operation on the same key starts a
//! fresh instance.
//!
//! References:
//!   - <https://www.microsoft.com/en-us/research/uploads/prod/2016/12/paxos-simple-Copy.pdf>

mod acceptor;
mod proposer;

use std::fmt;

use crate::server::ReplicaId;

use serde::{Deserialize, Serialize};

pub use acceptor::Acceptor;
pub use proposer::{Proposer, RoundResult};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfigPaxos {
    /// Maximum number of full Paxos rounds tried per operation.
    pub max_retries: u32,

    /// Timeout of each fan-out phase (prepare, propose) in millisecs.
    pub phase_timeout_ms: u64,

    /// Maximum number of in-flight RPCs during one fan-out.
    pub fanout_workers: usize,

    /// Upper bound of the randomized pause between failed rounds, in
    /// millisecs. 0 means retry immediately.
    pub retry_backoff_ms: u64,

    /// Probability of this acceptor silently dropping a prepare/propose
    /// call, for exercising the quorum logic in unreliable clusters.
    pub drop_rate: f64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigPaxos {
    fn default() -> Self {
        ReplicaConfigPaxos {
            max_retries: 10,
            phase_timeout_ms: 30_000,
            fanout_workers: 16,
            retry_backoff_ms: 50,
            drop_rate: 0.0,
        }
    }
}

/// Ballot (proposal sequence number). Ordered by counter first and then by
/// proposer ID, so ballots generated by different proposers never tie.
#[derive(
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Clone,
    Copy,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Ballot {
    pub counter: u64,
    pub node: ReplicaId,
}

impl Ballot {
    /// Null ballot, smaller than any ballot a proposer generates.
    pub const NULL: Ballot = Ballot {
        counter: 0,
        node: 0,
    };

    pub fn new(counter: u64, node: ReplicaId) -> Self {
        Ballot { counter, node }
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.counter, self.node)
    }
}

/// Acceptor's answer status carried in a `Promise`.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum PromiseStatus {
    Promised,
    Accepted,
    Rejected,
}

/// Per-key, per-acceptor Paxos bookkeeping. Also used as the reply to
/// `prepare()`, in which case it is a snapshot copy of the acceptor's state.
///
/// Invariants: `accepted_ballot <= highest_seen`; `status == Accepted`
/// implies `accepted`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Promise {
    /// Highest ballot seen in any prepare for this key. Only grows.
    pub highest_seen: Ballot,

    /// Whether some value has been accepted for this key.
    pub accepted: bool,

    /// Ballot of the accepted value; meaningful only if `accepted`.
    pub accepted_ballot: Ballot,

    /// The accepted value; `Some` iff `accepted`.
    pub accepted_value: Option<String>,

    pub status: PromiseStatus,
}

impl Promise {
    /// Fresh bookkeeping for a key never seen before.
    pub fn fresh() -> Self {
        Promise {
            highest_seen: Ballot::NULL,
            accepted: false,
            accepted_ballot: Ballot::NULL,
            accepted_value: None,
            status: PromiseStatus::Promised,
        }
    }

    /// Rejection reply, telling the proposer which ballot beat it.
    pub fn rejected(highest_seen: Ballot) -> Self {
        Promise {
            highest_seen,
            accepted: false,
            accepted_ballot: Ballot::NULL,
            accepted_value: None,
            status: PromiseStatus::Rejected,
        }
    }

    /// Does this reply count towards the phase 1 quorum?
    #[inline]
    pub fn is_promise(&self) -> bool {
        matches!(self.status, PromiseStatus::Promised | PromiseStatus::Accepted)
    }
}

/// Kind of a mutating itinerary operation driven through Paxos.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Put,
    Delete,
    Edit,
    Share,
}

impl OpKind {
    /// Parse an operation name, case-insensitively.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PUT" | "INSERT" => Some(Self::Put),
            "DELETE" => Some(Self::Delete),
            "EDIT" => Some(Self::Edit),
            "SHARE" => Some(Self::Share),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Edit => "EDIT",
            Self::Share => "SHARE",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
