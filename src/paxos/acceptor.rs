//! Paxos -- acceptor role.

use std::collections::HashMap;

use super::{Ballot, Promise, PromiseStatus};

use crate::utils::TripStoreError;

use rand::Rng;

use tokio::sync::Mutex;

/// Acceptor state of one replica: a map from key -> `Promise`.
pub struct Acceptor {
    /// Node name used as logging prefix.
    me: String,

    /// Per-key Paxos bookkeeping.
    promises: Mutex<HashMap<String, Promise>>,

    /// Probability of dropping an incoming call.
    drop_rate: f64,
}

impl Acceptor {
    /// Creates a new acceptor with no keys in flight.
    pub fn new(me: impl ToString, drop_rate: f64) -> Self {
        Acceptor {
            me: me.to_string(),
            promises: Mutex::new(HashMap::new()),
            drop_rate,
        }
    }

    /// Simulated failure of this acceptor for one call.
    fn dropped(&self) -> bool {
        self.drop_rate > 0.0 && rand::thread_rng().gen_bool(self.drop_rate)
    }

    /// Handler of a phase 1 prepare. Rejects if `ballot` is not higher than
    /// every ballot seen so far for `key`; otherwise promises and echoes any
    /// previously accepted value back.
    pub async fn prepare(
        &self,
        ballot: Ballot,
        key: &str,
    ) -> Result<Promise, TripStoreError> {
        if self.dropped() {
            pf_warn!(self.me; "dropping Prepare for key {} bal {}", key, ballot);
            return Err(TripStoreError::msg("acceptor failed"));
        }
        pf_trace!(self.me; "received Prepare for key {} bal {}", key, ballot);

        let mut promises = self.promises.lock().await;
        let promise = promises
            .entry(key.to_string())
            .or_insert_with(Promise::fresh);

        if ballot <= promise.highest_seen {
            pf_debug!(self.me; "rejecting Prepare for key {} bal {} <= {}",
                               key, ballot, promise.highest_seen);
            return Ok(Promise::rejected(promise.highest_seen));
        }

        promise.highest_seen = ballot;
        if !promise.accepted {
            promise.status = PromiseStatus::Promised;
        }
        pf_trace!(self.me; "promised key {} bal {}: {:?}", key, ballot, promise);

        Ok(promise.clone())
    }

    /// Handler of a phase 2 propose. Accepts only if a promise exists for
    /// `key` and `ballot` is exactly the highest ballot promised.
    pub async fn propose(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
    ) -> Result<bool, TripStoreError> {
        if self.dropped() {
            pf_warn!(self.me; "dropping Propose for key {} bal {}", key, ballot);
            return Err(TripStoreError::msg("acceptor failed"));
        }
        pf_trace!(self.me; "received Propose for key {} bal {}", key, ballot);

        let mut promises = self.promises.lock().await;
        let promise = match promises.get_mut(key) {
            Some(promise) => promise,
            None => {
                pf_debug!(self.me; "rejecting Propose for key {}: no promise", key);
                return Ok(false);
            }
        };

        if ballot != promise.highest_seen {
            pf_debug!(self.me; "rejecting Propose for key {} bal {} != {}",
                               key, ballot, promise.highest_seen);
            return Ok(false);
        }

        promise.status = PromiseStatus::Accepted;
        promise.accepted = true;
        promise.accepted_ballot = ballot;
        promise.accepted_value = Some(value.to_string());
        pf_debug!(self.me; "accepted key {} bal {}", key, ballot);

        Ok(true)
    }

    /// Drops the bookkeeping of `key` once a value chosen under `ballot`
    /// has been learned. A promise made to a newer round survives; only an
    /// accepted value no newer than `ballot` is forgotten then.
    pub async fn clear(&self, key: &str, ballot: Ballot) {
        let mut promises = self.promises.lock().await;
        let promise = match promises.get_mut(key) {
            Some(promise) => promise,
            None => return,
        };

        if promise.highest_seen <= ballot {
            promises.remove(key);
        } else if promise.accepted && promise.accepted_ballot <= ballot {
            pf_debug!(self.me; "key {} learned at bal {}, keeping promise {}",
                               key, ballot, promise.highest_seen);
            let highest_seen = promise.highest_seen;
            *promise = Promise {
                highest_seen,
                ..Promise::fresh()
            };
        }
    }

    /// Snapshot copy of the bookkeeping of `key`, if any.
    pub async fn promise_of(&self, key: &str) -> Option<Promise> {
        self.promises.lock().await.get(key).cloned()
    }
}
