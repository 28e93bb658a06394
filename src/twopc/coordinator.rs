//! 2PC -- coordinator role.

use std::collections::HashMap;

use super::{ReplicaConfigTwoPc, TxnId};

use crate::server::{fan_out, ReplicaId, RpcOutcome, TwoPcPeer};
use crate::utils::TripStoreError;

use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Duration, Instant};

/// Commit acknowledgement table of a coordinator: txn -> number of
/// participants that reported `have_committed`. Only transactions
/// registered through `expect()` and not yet waited out are tracked.
#[derive(Debug, Default)]
pub struct CommitAcks {
    acks: Mutex<HashMap<TxnId, u8>>,

    /// Signalled on every recorded acknowledgement.
    arrived: Notify,
}

impl CommitAcks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking acknowledgements of `txn`.
    pub async fn expect(&self, txn: &str) {
        self.acks.lock().await.entry(txn.into()).or_insert(0);
    }

    /// Stops tracking `txn`.
    pub async fn forget(&self, txn: &str) {
        self.acks.lock().await.remove(txn);
    }

    /// Records one participant's acknowledgement of `txn`. Returns false
    /// if `txn` is not being tracked, e.g. a late ack after the wait ended.
    pub async fn record(&self, txn: &str) -> bool {
        match self.acks.lock().await.get_mut(txn) {
            Some(count) => *count += 1,
            None => return false,
        }
        self.arrived.notify_waiters();
        true
    }

    /// Number of acknowledgements recorded so far for `txn`.
    pub async fn count(&self, txn: &str) -> u8 {
        self.acks.lock().await.get(txn).copied().unwrap_or(0)
    }

    /// Waits until `expected` acknowledgements of `txn` are in or the
    /// deadline passes, then forgets `txn`. Returns the final count.
    pub async fn wait_all(&self, txn: &str, expected: u8, deadline: Instant) -> u8 {
        loop {
            let arrived = self.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if self.count(txn).await >= expected
                || time::timeout_at(deadline, arrived).await.is_err()
            {
                return self.acks.lock().await.remove(txn).unwrap_or(0);
            }
        }
    }
}

/// Coordinator state of one user directory replica.
pub struct Coordinator {
    /// Node name used as logging prefix.
    me: String,

    /// Maximum in-flight RPCs per fan-out.
    fanout_workers: usize,

    vote_timeout: Duration,

    commit_ack_timeout: Duration,

    /// Acknowledgements of transactions I coordinate.
    acks: CommitAcks,
}

impl Coordinator {
    pub fn new(me: impl ToString, config: &ReplicaConfigTwoPc) -> Self {
        Coordinator {
            me: me.to_string(),
            fanout_workers: config.fanout_workers,
            vote_timeout: Duration::from_millis(config.vote_timeout_ms),
            commit_ack_timeout: Duration::from_millis(config.commit_ack_timeout_ms),
            acks: CommitAcks::new(),
        }
    }

    /// Voting phase: asks every participant whether it can commit. Returns
    /// true only if all of them voted yes in time; a missing or failed vote
    /// counts as no.
    pub async fn collect_votes(
        &self,
        participants: &[(ReplicaId, &dyn TwoPcPeer)],
        txn: &str,
        op: &[String],
        coordinator: ReplicaId,
    ) -> bool {
        pf_debug!(self.me; "txn {}: initiating 2PC for {:?}", txn, op);
        let replies = fan_out(
            participants.to_vec(),
            self.fanout_workers,
            self.vote_timeout,
            |participant| participant.can_commit(txn, op, coordinator),
        )
        .await;

        let mut votes: Vec<(ReplicaId, bool)> = replies
            .into_iter()
            .map(|(peer, outcome)| match outcome {
                RpcOutcome::Reply(vote) => (peer, vote),
                RpcOutcome::Timeout => {
                    pf_warn!(self.me; "txn {}: vote of {} timed out", txn, peer);
                    (peer, false)
                }
                RpcOutcome::Failed(e) => {
                    pf_warn!(self.me; "txn {}: vote of {} failed: {}", txn, peer, e);
                    (peer, false)
                }
            })
            .collect();
        votes.sort_unstable();
        pf_debug!(self.me; "txn {}: voting phase completed, votes {:?}", txn, votes);

        votes.len() == participants.len() && votes.iter().all(|(_, vote)| *vote)
    }

    /// Tells every participant to abort, waiting (bounded by the vote
    /// timeout) for the calls to be delivered.
    pub async fn broadcast_abort(
        &self,
        participants: &[(ReplicaId, &dyn TwoPcPeer)],
        txn: &str,
    ) {
        pf_debug!(self.me; "txn {}: aborting", txn);
        let replies = fan_out(
            participants.to_vec(),
            self.fanout_workers,
            self.vote_timeout,
            |participant| participant.abort_transaction(txn),
        )
        .await;
        for (peer, outcome) in replies {
            if !matches!(outcome, RpcOutcome::Reply(())) {
                pf_warn!(self.me; "txn {}: abort to {} not delivered: {:?}",
                                  txn, peer, outcome);
            }
        }
    }

    /// Commits `txn` at the coordinator's own participant `local` first,
    /// registering for acknowledgements beforehand. A failed local commit
    /// applies nothing, so every one of `participants` is then told to
    /// abort and the error is returned.
    pub async fn commit_locally(
        &self,
        local: &dyn TwoPcPeer,
        participants: &[(ReplicaId, &dyn TwoPcPeer)],
        txn: &str,
    ) -> Result<String, TripStoreError> {
        self.acks.expect(txn).await;
        match local.do_commit(txn).await {
            Ok(result) => Ok(result),
            Err(e) => {
                pf_error!(self.me; "txn {}: local commit failed: {}", txn, e);
                self.acks.forget(txn).await;
                self.broadcast_abort(participants, txn).await;
                Err(e)
            }
        }
    }

    /// Tells every given participant to commit. Results are only logged;
    /// completion is tracked through acknowledgements.
    pub async fn broadcast_commit(
        &self,
        participants: &[(ReplicaId, &dyn TwoPcPeer)],
        txn: &str,
    ) {
        let replies = fan_out(
            participants.to_vec(),
            self.fanout_workers,
            self.commit_ack_timeout,
            |participant| participant.do_commit(txn),
        )
        .await;
        for (peer, outcome) in replies {
            match outcome {
                RpcOutcome::Reply(result) => {
                    pf_trace!(self.me; "txn {}: {} committed: {}", txn, peer, result);
                }
                outcome => {
                    pf_warn!(self.me; "txn {}: commit to {} not delivered: {:?}",
                                      txn, peer, outcome);
                }
            }
        }
    }

    /// Waits for `expected` commit acknowledgements of `txn`. Returns
    /// whether all of them arrived before the commit ack timeout.
    pub async fn await_acks(&self, txn: &str, expected: u8) -> bool {
        let deadline = Instant::now() + self.commit_ack_timeout;
        let got = self.acks.wait_all(txn, expected, deadline).await;
        if got < expected {
            pf_error!(self.me; "txn {}: only {} of {} commit acks before timeout",
                               txn, got, expected);
            false
        } else {
            pf_debug!(self.me; "txn {}: all {} participants committed", txn, got);
            true
        }
    }

    /// Acknowledgement table, fed by `have_committed` calls.
    pub fn acks(&self) -> &CommitAcks {
        &self.acks
    }
}
