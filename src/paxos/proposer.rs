//! Paxos -- proposer role.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Ballot, ReplicaConfigPaxos};

use crate::server::{fan_out, PaxosPeer, ReplicaId, RpcOutcome};
use crate::utils::{quorum_size, Bitmap};

use tokio::time::Duration;

/// Result of driving one full Paxos round for a key.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RoundResult {
    /// A quorum accepted `value` under `ballot`. `adopted` is true if the
    /// value was an earlier accepted value discovered in phase 1 rather than
    /// the one this proposer brought.
    Chosen {
        ballot: Ballot,
        value: String,
        adopted: bool,
    },

    /// Phase 1 turned up `value`, accepted under `accepted`, which has
    /// already been learned here. Nothing was proposed in this round.
    AlreadyLearned {
        ballot: Ballot,
        accepted: Ballot,
        value: String,
    },

    /// Phase 1 gathered fewer than a quorum of promises.
    NoPromiseQuorum { ballot: Ballot, promises: u8 },

    /// Phase 2 gathered fewer than a quorum of accepts.
    NoAcceptQuorum { ballot: Ballot, accepts: u8 },
}

/// Proposer state of one replica.
pub struct Proposer {
    /// Node name used as logging prefix.
    me: String,

    /// My replica ID, tie-breaker component of my ballots.
    id: ReplicaId,

    /// Total number of acceptors in cluster.
    population: u8,

    /// Largest ballot counter used or heard of.
    counter: AtomicU64,

    /// Maximum in-flight RPCs per fan-out.
    fanout_workers: usize,

    /// Timeout of each phase.
    phase_timeout: Duration,
}

impl Proposer {
    /// Creates a new proposer.
    pub fn new(
        me: impl ToString,
        id: ReplicaId,
        population: u8,
        config: &ReplicaConfigPaxos,
    ) -> Self {
        Proposer {
            me: me.to_string(),
            id,
            population,
            counter: AtomicU64::new(0),
            fanout_workers: config.fanout_workers,
            phase_timeout: Duration::from_millis(config.phase_timeout_ms),
        }
    }

    /// Compose a ballot strictly greater than any I have used or heard of.
    pub fn next_ballot(&self) -> Ballot {
        Ballot::new(self.counter.fetch_add(1, Ordering::SeqCst) + 1, self.id)
    }

    /// Remember a ballot heard from an acceptor so that my next ballot
    /// beats it.
    fn observe(&self, ballot: Ballot) {
        self.counter.fetch_max(ballot.counter, Ordering::SeqCst);
    }

    /// Drives one full round (prepare + propose) for `key` across all
    /// `acceptors`, proposing `value` unless phase 1 discovers an already
    /// accepted value, in which case the highest-ballot one is proposed
    /// instead. An adopted value for which `learned` answers true is not
    /// proposed again.
    pub async fn run_round<F, Fut>(
        &self,
        acceptors: &[(ReplicaId, &dyn PaxosPeer)],
        key: &str,
        value: &str,
        learned: F,
    ) -> RoundResult
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = bool>,
    {
        let quorum = quorum_size(self.population);
        let ballot = self.next_ballot();
        pf_debug!(self.me; "enter Prepare phase for key {} bal {}", key, ballot);

        // Phase 1: prepare
        let replies = fan_out(
            acceptors.to_vec(),
            self.fanout_workers,
            self.phase_timeout,
            |acceptor| acceptor.prepare(ballot, key),
        )
        .await;

        let mut prepare_acks = Bitmap::new(self.population, false);
        let mut max_accepted = Ballot::NULL;
        let mut proposal = value.to_string();
        let mut adopted = false;
        for (peer, outcome) in replies {
            match outcome {
                RpcOutcome::Reply(promise) if promise.is_promise() => {
                    if let Err(e) = prepare_acks.set(peer, true) {
                        pf_warn!(self.me; "PrepareReply from unknown peer {}: {}",
                                          peer, e);
                        continue;
                    }
                    if promise.accepted && promise.accepted_ballot > max_accepted
                    {
                        if let Some(accepted_value) = promise.accepted_value {
                            max_accepted = promise.accepted_ballot;
                            adopted = accepted_value != value;
                            proposal = accepted_value;
                        }
                    }
                }
                RpcOutcome::Reply(promise) => {
                    pf_trace!(self.me; "Prepare rejected by {} for key {}: seen {}",
                                       peer, key, promise.highest_seen);
                    self.observe(promise.highest_seen);
                }
                RpcOutcome::Timeout => {
                    pf_warn!(self.me; "Prepare to {} timed out for key {}", peer, key);
                }
                RpcOutcome::Failed(e) => {
                    pf_warn!(self.me; "Prepare to {} failed for key {}: {}",
                                      peer, key, e);
                }
            }
        }

        let promises = prepare_acks.count();
        pf_debug!(self.me; "got {} promises for key {} bal {} (quorum {})",
                           promises, key, ballot, quorum);
        if promises < quorum {
            return RoundResult::NoPromiseQuorum { ballot, promises };
        }
        if adopted {
            if learned(proposal.clone()).await {
                pf_debug!(self.me; "accepted value of bal {} for key {} \
                                    already learned",
                                   max_accepted, key);
                return RoundResult::AlreadyLearned {
                    ballot,
                    accepted: max_accepted,
                    value: proposal,
                };
            }
            pf_debug!(self.me; "adopting accepted value of bal {} for key {}",
                               max_accepted, key);
        }

        // Phase 2: propose
        pf_debug!(self.me; "enter Accept phase for key {} bal {}", key, ballot);
        let replies = fan_out(
            acceptors.to_vec(),
            self.fanout_workers,
            self.phase_timeout,
            |acceptor| acceptor.propose(ballot, key, &proposal),
        )
        .await;

        let mut accept_acks = Bitmap::new(self.population, false);
        for (peer, outcome) in replies {
            match outcome {
                RpcOutcome::Reply(true) => {
                    if let Err(e) = accept_acks.set(peer, true) {
                        pf_warn!(self.me; "AcceptReply from unknown peer {}: {}",
                                          peer, e);
                    }
                }
                RpcOutcome::Reply(false) => {
                    pf_trace!(self.me; "Propose rejected by {} for key {}", peer, key);
                }
                RpcOutcome::Timeout => {
                    pf_warn!(self.me; "Propose to {} timed out for key {}", peer, key);
                }
                RpcOutcome::Failed(e) => {
                    pf_warn!(self.me; "Propose to {} failed for key {}: {}",
                                      peer, key, e);
                }
            }
        }

        let accepts = accept_acks.count();
        pf_debug!(self.me; "got {} accepts for key {} bal {} (quorum {})",
                           accepts, key, ballot, quorum);
        if accepts < quorum {
            return RoundResult::NoAcceptQuorum { ballot, accepts };
        }

        RoundResult::Chosen {
            ballot,
            value: proposal,
            adopted,
        }
    }
}

#[cfg(test)]
mod proposer_tests {
    use super::*;
    use crate::paxos::{Acceptor, OpKind, Promise};
    use crate::utils::TripStoreError;
    use async_trait::async_trait;

    /// Acceptor wrapper that can be told to refuse or to pretend it had
    /// accepted some value before.
    struct TestAcceptor {
        inner: Acceptor,
        refuse: bool,
    }

    impl TestAcceptor {
        fn new(id: u8, refuse: bool) -> Self {
            TestAcceptor {
                inner: Acceptor::new(format!("KVS{}", id), 0.0),
                refuse,
            }
        }
    }

    #[async_trait]
    impl PaxosPeer for TestAcceptor {
        async fn prepare(
            &self,
            ballot: Ballot,
            key: &str,
        ) -> Result<Promise, TripStoreError> {
            if self.refuse {
                return Err(TripStoreError::msg("down"));
            }
            self.inner.prepare(ballot, key).await
        }

        async fn propose(
            &self,
            ballot: Ballot,
            key: &str,
            value: &str,
        ) -> Result<bool, TripStoreError> {
            if self.refuse {
                return Err(TripStoreError::msg("down"));
            }
            self.inner.propose(ballot, key, value).await
        }

        async fn learn(
            &self,
            _ballot: Ballot,
            _key: &str,
            _value: &str,
            _kind: OpKind,
        ) -> Result<String, TripStoreError> {
            Ok(String::new())
        }
    }

    async fn never_learned(_value: String) -> bool {
        false
    }

    fn proposer(id: u8, population: u8) -> Proposer {
        let config = ReplicaConfigPaxos {
            phase_timeout_ms: 500,
            ..Default::default()
        };
        Proposer::new(format!("KVS{}", id), id, population, &config)
    }

    async fn round_with_live(population: u8, live: u8) -> RoundResult {
        let acceptors: Vec<TestAcceptor> = (0..population)
            .map(|id| TestAcceptor::new(id, id >= live))
            .collect();
        let targets: Vec<(ReplicaId, &dyn PaxosPeer)> = acceptors
            .iter()
            .enumerate()
            .map(|(id, a)| (id as ReplicaId, a as &dyn PaxosPeer))
            .collect();
        proposer(0, population).run_round(&targets, "trip", "mine", never_learned).await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quorum_boundaries() {
        for population in [1u8, 3, 5] {
            let majority = population / 2 + 1;
            let result = round_with_live(population, majority).await;
            assert!(
                matches!(result, RoundResult::Chosen { adopted: false, .. }),
                "N={} with {} live should succeed",
                population,
                majority
            );
            let result = round_with_live(population, majority - 1).await;
            assert!(
                matches!(result, RoundResult::NoPromiseQuorum { promises, .. }
                                 if promises == majority - 1),
                "N={} with {} live should fail",
                population,
                majority - 1
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn adopts_highest_accepted() -> Result<(), TripStoreError> {
        let acceptors: Vec<TestAcceptor> =
            (0..3).map(|id| TestAcceptor::new(id, false)).collect();
        // acceptor 1 accepted "stale" under an old ballot, acceptor 2
        // accepted "newer" under a higher one
        acceptors[1].inner.prepare(Ballot::new(1, 1), "trip").await?;
        acceptors[1].inner.propose(Ballot::new(1, 1), "trip", "stale").await?;
        acceptors[2].inner.prepare(Ballot::new(2, 2), "trip").await?;
        acceptors[2].inner.propose(Ballot::new(2, 2), "trip", "newer").await?;

        let targets: Vec<(ReplicaId, &dyn PaxosPeer)> = acceptors
            .iter()
            .enumerate()
            .map(|(id, a)| (id as ReplicaId, a as &dyn PaxosPeer))
            .collect();
        let proposer = proposer(0, 3);
        // make sure my ballot is high enough on the first try
        proposer.observe(Ballot::new(10, 2));
        match proposer.run_round(&targets, "trip", "mine", never_learned).await {
            RoundResult::Chosen { value, adopted, .. } => {
                assert_eq!(value, "newer");
                assert!(adopted);
            }
            other => panic!("unexpected round result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejection_bumps_ballot() -> Result<(), TripStoreError> {
        let acceptors: Vec<TestAcceptor> =
            (0..3).map(|id| TestAcceptor::new(id, false)).collect();
        for a in &acceptors {
            a.inner.prepare(Ballot::new(40, 2), "trip").await?;
        }
        let targets: Vec<(ReplicaId, &dyn PaxosPeer)> = acceptors
            .iter()
            .enumerate()
            .map(|(id, a)| (id as ReplicaId, a as &dyn PaxosPeer))
            .collect();
        let proposer = proposer(0, 3);
        let first = proposer.run_round(&targets, "trip", "mine", never_learned).await;
        assert!(matches!(first, RoundResult::NoPromiseQuorum { promises: 0, .. }));
        let second = proposer.run_round(&targets, "trip", "mine", never_learned).await;
        match second {
            RoundResult::Chosen { ballot, value, .. } => {
                assert!(ballot > Ballot::new(40, 2));
                assert_eq!(value, "mine");
            }
            other => panic!("unexpected round result {:?}", other),
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn learned_value_not_reproposed() -> Result<(), TripStoreError> {
        let acceptors: Vec<TestAcceptor> =
            (0..3).map(|id| TestAcceptor::new(id, false)).collect();
        acceptors[1].inner.prepare(Ballot::new(1, 1), "trip").await?;
        acceptors[1].inner.propose(Ballot::new(1, 1), "trip", "done").await?;

        let targets: Vec<(ReplicaId, &dyn PaxosPeer)> = acceptors
            .iter()
            .enumerate()
            .map(|(id, a)| (id as ReplicaId, a as &dyn PaxosPeer))
            .collect();
        let proposer = proposer(0, 3);
        proposer.observe(Ballot::new(5, 1));
        let result = proposer
            .run_round(&targets, "trip", "mine", |value| async move {
                value == "done"
            })
            .await;
        match result {
            RoundResult::AlreadyLearned {
                accepted, value, ..
            } => {
                assert_eq!(accepted, Ballot::new(1, 1));
                assert_eq!(value, "done");
            }
            other => panic!("unexpected round result {:?}", other),
        }
        // phase 2 never ran, so nobody accepted under the new ballot
        let promise = acceptors[0].inner.promise_of("trip").await.unwrap();
        assert!(!promise.accepted);
        Ok(())
    }

    #[test]
    fn ballots_strictly_increase() {
        let proposer = proposer(3, 5);
        let a = proposer.next_ballot();
        let b = proposer.next_ballot();
        assert!(a < b);
        assert_eq!(a.node, 3);
    }
}
