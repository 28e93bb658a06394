//! Peer-to-peer RPC capability traits and the concurrent fan-out helper.

use std::future::Future;

use crate::paxos::{Ballot, OpKind, Promise};
use crate::server::ReplicaId;
use crate::utils::TripStoreError;

use async_trait::async_trait;

use futures::stream::{self, StreamExt};

use tokio::time::{self, Duration};

/// Paxos acceptor/learner surface of an itinerary store replica.
#[async_trait]
pub trait PaxosPeer: Send + Sync {
    /// Phase 1: asks the acceptor to promise `ballot` for `key`.
    async fn prepare(
        &self,
        ballot: Ballot,
        key: &str,
    ) -> Result<Promise, TripStoreError>;

    /// Phase 2: asks the acceptor to accept `value` under `ballot`.
    async fn propose(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
    ) -> Result<bool, TripStoreError>;

    /// Applies a value chosen under `ballot` to the replica's store.
    async fn learn(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
        kind: OpKind,
    ) -> Result<String, TripStoreError>;
}

/// Two-phase commit participant surface of a user directory replica.
#[async_trait]
pub trait TwoPcPeer: Send + Sync {
    /// Voting phase: may this participant commit `op` as transaction `txn`?
    async fn can_commit(
        &self,
        txn: &str,
        op: &[String],
        coordinator: ReplicaId,
    ) -> Result<bool, TripStoreError>;

    /// Commits a prepared transaction and returns the apply result.
    async fn do_commit(&self, txn: &str) -> Result<String, TripStoreError>;

    /// Commit acknowledgement from a participant to the coordinator.
    async fn have_committed(&self, txn: &str) -> Result<(), TripStoreError>;

    /// Aborts a transaction, prepared or not.
    async fn abort_transaction(
        &self,
        txn: &str,
    ) -> Result<(), TripStoreError>;
}

/// Outcome of one RPC call as seen by the quorum-counting logic.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RpcOutcome<T> {
    /// The peer replied in time.
    Reply(T),

    /// The peer did not reply within the allowed duration.
    Timeout,

    /// The call failed (unreachable peer, transport error, etc.).
    Failed(String),
}

/// Runs one RPC future under a timeout, folding every failure mode into an
/// `RpcOutcome`.
pub async fn call_with_timeout<T, Fut>(fut: Fut, dur: Duration) -> RpcOutcome<T>
where
    Fut: Future<Output = Result<T, TripStoreError>>,
{
    match time::timeout(dur, fut).await {
        Ok(Ok(reply)) => RpcOutcome::Reply(reply),
        Ok(Err(e)) => RpcOutcome::Failed(e.to_string()),
        Err(_) => RpcOutcome::Timeout,
    }
}

/// Issues `call` against every target concurrently, with at most `workers`
/// calls in flight, each bounded by `dur`. Returns one outcome per target,
/// in completion order.
pub async fn fan_out<'a, P, T, F, Fut>(
    targets: Vec<(ReplicaId, &'a P)>,
    workers: usize,
    dur: Duration,
    call: F,
) -> Vec<(ReplicaId, RpcOutcome<T>)>
where
    P: ?Sized + 'a,
    F: Fn(&'a P) -> Fut,
    Fut: Future<Output = Result<T, TripStoreError>> + 'a,
{
    let calls: Vec<_> = targets
        .into_iter()
        .map(|(id, peer)| {
            let fut = call(peer);
            async move { (id, call_with_timeout(fut, dur).await) }
        })
        .collect();
    stream::iter(calls)
    .buffer_unordered(workers.max(1))
    .collect()
    .await
}
