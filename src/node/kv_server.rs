//! Itinerary store replica: Paxos proposer, acceptor and learner over the
//! replicated `KeyValueStore`, plus the client-facing operation entry.

use std::sync::{Arc, OnceLock};

use crate::kvstore::{Itinerary, KeyValueStore, KvCommand, KvOperation, PaxosValue};
use crate::paxos::{
    Acceptor, Ballot, OpKind, Promise, Proposer, ReplicaConfigPaxos, RoundResult,
};
use crate::server::{
    fan_out, kv_server_name, PaxosPeer, Registry, ReplicaId, RpcOutcome,
};
use crate::userdb::UserDirectory;
use crate::utils::TripStoreError;

use async_trait::async_trait;

use rand::Rng;

use tokio::time::{self, Duration};

/// Reply when an operation could not be agreed upon.
pub const FAILED: &str = "Failed";

/// Maximum length of an itinerary text field.
const MAX_FIELD_LEN: usize = 100;

/// Itinerary store server replica.
pub struct KvServer {
    /// My replica ID.
    id: ReplicaId,

    /// Registry name, used as logging prefix.
    name: String,

    /// Total number of replicas in cluster.
    population: u8,

    /// Configuration parameters struct.
    config: ReplicaConfigPaxos,

    acceptor: Acceptor,

    proposer: Proposer,

    store: KeyValueStore,

    /// Stubs of all other replicas, set once by `connect_with_all_servers()`.
    peers: OnceLock<Vec<(ReplicaId, Arc<dyn PaxosPeer>)>>,
}

impl KvServer {
    /// Creates a new replica over the co-located user directory.
    pub fn new(
        id: ReplicaId,
        population: u8,
        directory: Arc<UserDirectory>,
        config: ReplicaConfigPaxos,
    ) -> Result<Self, TripStoreError> {
        let name = kv_server_name(id);
        if population == 0 || id >= population {
            return logged_err!(name; "invalid id {} in population {}",
                                     id, population);
        }

        Ok(KvServer {
            id,
            population,
            acceptor: Acceptor::new(&name, config.drop_rate),
            proposer: Proposer::new(&name, id, population, &config),
            store: KeyValueStore::new(&name, directory),
            config,
            peers: OnceLock::new(),
            name,
        })
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The local itinerary store.
    pub fn store(&self) -> &KeyValueStore {
        &self.store
    }

    /// One-time peer discovery: looks up replicas `KVS0..KVS<n-1>` other
    /// than myself in `registry`.
    pub fn connect_with_all_servers(
        &self,
        n: u8,
        registry: &dyn Registry,
    ) -> Result<(), TripStoreError> {
        if self.peers.get().is_some() {
            return logged_err!(self.name; "already connected with other servers");
        }
        if n != self.population {
            return logged_err!(self.name; "asked to connect with {} servers \
                                           but population is {}",
                                          n, self.population);
        }

        let mut peers = Vec::with_capacity(n as usize - 1);
        for peer in (0..n).filter(|&p| p != self.id) {
            peers.push((peer, registry.lookup_paxos(&kv_server_name(peer))?));
        }
        if self.peers.set(peers).is_err() {
            return logged_err!(self.name; "already connected with other servers");
        }

        pf_info!(self.name; "connected with {} peers", n - 1);
        Ok(())
    }

    /// Client entry: parses a `OP|arg...` message and either serves it
    /// locally or drives it through Paxos.
    pub async fn execute_operation(&self, message: &str, actor: &str) -> String {
        pf_debug!(self.name; "message from client {}: {}", actor, message);
        let op = match KvOperation::parse(message) {
            Ok(op) => op,
            Err(reply) => {
                pf_debug!(self.name; "invalid message: {}", reply);
                return reply;
            }
        };

        let result = match op {
            KvOperation::Put => "Enter Itinerary Details".into(),
            KvOperation::Get { id } => self.store.get(&id, actor).await,
            KvOperation::ListCreated => self.store.list_created(actor).await,
            KvOperation::ListCollab => self.store.list_collab(actor).await,
            KvOperation::Delete { id } => {
                self.propose_command(&id, actor, KvCommand::Delete).await
            }
            KvOperation::Edit { id } => {
                self.propose_command(&id, actor, KvCommand::Edit).await
            }
            KvOperation::Share { id, sharee } => {
                self.propose_command(&id, actor, KvCommand::Share { sharee })
                    .await
            }
        };

        pf_debug!(self.name; "reply to client {}: {}", actor, result);
        result
    }

    /// Client entry: creates an itinerary from its JSON `payload`, or edits
    /// the one named by its `prev_id` if its `version` is at least 1.
    /// Returns the itinerary id on success.
    pub async fn put_itinerary(&self, payload: &str, actor: &str) -> String {
        let mut itinerary: Itinerary = match serde_json::from_str(payload) {
            Ok(itinerary) => itinerary,
            Err(e) => {
                pf_debug!(self.name; "undecodable itinerary from {}: {}", actor, e);
                return "Invalid itinerary details".into();
            }
        };
        let fields = [
            &itinerary.name,
            &itinerary.location,
            &itinerary.start_date,
            &itinerary.end_date,
        ];
        if fields.iter().any(|f| f.is_empty() || f.len() > MAX_FIELD_LEN) {
            return "Invalid itinerary details".into();
        }

        let key = match &itinerary.prev_id {
            Some(prev_id) if itinerary.is_edit() => prev_id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        itinerary.id = key.clone();
        pf_debug!(self.name; "itinerary '{}' from {} under key {}",
                             itinerary.name, actor, key);

        self.propose_command(&key, actor, KvCommand::Insert { itinerary })
            .await
    }

    /// Wraps `command` into a Paxos value and drives it for `key`.
    async fn propose_command(
        &self,
        key: &str,
        actor: &str,
        command: KvCommand,
    ) -> String {
        let kind = command.kind();
        match PaxosValue::new(actor, command).encode() {
            Ok(value) => self.start_paxos(kind, key, &value).await,
            Err(e) => {
                pf_error!(self.name; "error encoding value for key {}: {}", key, e);
                FAILED.into()
            }
        }
    }

    /// Proposer entry: drives up to `max_retries` Paxos rounds until my
    /// `value` is chosen for `key`. When a round ends up choosing an earlier
    /// accepted value instead, that value is learned and my own is retried.
    /// An earlier value already applied here is only learned again at every
    /// replica, never proposed anew. Returns the result of applying my
    /// value, or `FAILED`.
    pub async fn start_paxos(&self, kind: OpKind, key: &str, value: &str) -> String {
        let peers = match self.peers.get() {
            Some(peers) => peers,
            None => {
                pf_error!(self.name; "not connected with other servers yet");
                return FAILED.into();
            }
        };
        let mut acceptors: Vec<(ReplicaId, &dyn PaxosPeer)> =
            vec![(self.id, self as &dyn PaxosPeer)];
        acceptors.extend(peers.iter().map(|(id, peer)| (*id, peer.as_ref())));

        for attempt in 1..=self.config.max_retries {
            pf_debug!(self.name; "Paxos try {} for {} on key {}", attempt, kind, key);
            let round = self
                .proposer
                .run_round(&acceptors, key, value, |adopted| async move {
                    match PaxosValue::decode(&adopted) {
                        Ok(adopted) => {
                            self.store.was_applied(&adopted.request_id).await
                        }
                        Err(_) => false,
                    }
                })
                .await;
            match round {
                RoundResult::Chosen {
                    value: chosen,
                    adopted: false,
                    ballot,
                } => {
                    pf_debug!(self.name; "consensus reached for key {} bal {}",
                                         key, ballot);
                    let result = self.learn_value(ballot, key, &chosen, kind).await;
                    self.broadcast_learn(ballot, key, chosen, kind);
                    return result;
                }

                RoundResult::Chosen {
                    value: chosen,
                    adopted: true,
                    ballot,
                } => {
                    let chosen_kind = value_kind(&chosen, kind);
                    pf_info!(self.name; "completed earlier {} on key {} bal {}, \
                                         retrying own value",
                                        chosen_kind, key, ballot);
                    self.learn_value(ballot, key, &chosen, chosen_kind).await;
                    self.broadcast_learn(ballot, key, chosen, chosen_kind);
                }

                RoundResult::AlreadyLearned {
                    ballot,
                    accepted,
                    value: learned,
                } => {
                    let learned_kind = value_kind(&learned, kind);
                    pf_info!(self.name; "earlier {} on key {} bal {} already learned, \
                                         relearning before bal {}",
                                        learned_kind, key, accepted, ballot);
                    self.learn_value(accepted, key, &learned, learned_kind).await;
                    self.learn_everywhere(accepted, key, &learned, learned_kind)
                        .await;
                    self.backoff().await;
                }

                RoundResult::NoPromiseQuorum { ballot, promises } => {
                    pf_warn!(self.name; "Paxos try {} failed for key {} bal {}: \
                                         {} promises",
                                        attempt, key, ballot, promises);
                    self.backoff().await;
                }

                RoundResult::NoAcceptQuorum { ballot, accepts } => {
                    pf_warn!(self.name; "Paxos try {} failed for key {} bal {}: \
                                         {} accepts",
                                        attempt, key, ballot, accepts);
                    self.backoff().await;
                }
            }
        }

        pf_error!(self.name; "consensus not reached for key {} after {} tries",
                             key, self.config.max_retries);
        FAILED.into()
    }

    /// Randomized pause between failed rounds so that dueling proposers
    /// stop preempting each other.
    async fn backoff(&self) {
        if self.config.retry_backoff_ms > 0 {
            let ms = rand::thread_rng().gen_range(0..=self.config.retry_backoff_ms);
            time::sleep(Duration::from_millis(ms)).await;
        }
    }

    /// Best-effort learn of a value chosen under `ballot` at every other
    /// replica. Not awaited by the client-facing call.
    fn broadcast_learn(&self, ballot: Ballot, key: &str, value: String, kind: OpKind) {
        let peers = match self.peers.get() {
            Some(peers) => peers.clone(),
            None => return,
        };
        let me = self.name.clone();
        let workers = self.config.fanout_workers;
        let timeout = Duration::from_millis(self.config.phase_timeout_ms);
        let key = key.to_string();

        tokio::spawn(async move {
            learn_at(&me, &peers, workers, timeout, ballot, &key, &value, kind)
                .await;
        });
    }

    /// Learn of a value chosen under `ballot` at every other replica,
    /// returning once each has answered or timed out.
    async fn learn_everywhere(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
        kind: OpKind,
    ) {
        if let Some(peers) = self.peers.get() {
            let timeout = Duration::from_millis(self.config.phase_timeout_ms);
            learn_at(
                &self.name,
                peers,
                self.config.fanout_workers,
                timeout,
                ballot,
                key,
                value,
                kind,
            )
            .await;
        }
    }

    /// Applies a value chosen under `ballot` locally and clears the key's
    /// acceptor state up to that ballot.
    async fn learn_value(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
        kind: OpKind,
    ) -> String {
        pf_debug!(self.name; "learning {} for key {}", kind, key);
        let result = match PaxosValue::decode(value) {
            Ok(value) if value.command.kind() == kind => {
                self.store.apply(key, &value).await
            }
            Ok(value) => {
                pf_warn!(self.name; "learned {} value under kind {} for key {}",
                                    value.command.kind(), kind, key);
                "Invalid value".into()
            }
            Err(e) => {
                pf_warn!(self.name; "undecodable learned value for key {}: {}",
                                    key, e);
                "Invalid value".into()
            }
        };
        self.acceptor.clear(key, ballot).await;
        result
    }
}

/// Kind of the command carried in an encoded Paxos value.
fn value_kind(value: &str, fallback: OpKind) -> OpKind {
    PaxosValue::decode(value)
        .map(|v| v.command.kind())
        .unwrap_or(fallback)
}

/// Fans a learn out to `peers` and logs the ones not delivered.
#[allow(clippy::too_many_arguments)]
async fn learn_at(
    me: &str,
    peers: &[(ReplicaId, Arc<dyn PaxosPeer>)],
    workers: usize,
    timeout: Duration,
    ballot: Ballot,
    key: &str,
    value: &str,
    kind: OpKind,
) {
    let targets: Vec<(ReplicaId, &dyn PaxosPeer)> =
        peers.iter().map(|(id, peer)| (*id, peer.as_ref())).collect();
    let outcomes = fan_out(targets, workers, timeout, |peer| {
        peer.learn(ballot, key, value, kind)
    })
    .await;
    for (peer, outcome) in outcomes {
        if !matches!(outcome, RpcOutcome::Reply(_)) {
            pf_warn!(me; "learn of key {} at {} not delivered: {:?}",
                         key, peer, outcome);
        }
    }
}

#[async_trait]
impl PaxosPeer for KvServer {
    async fn prepare(
        &self,
        ballot: Ballot,
        key: &str,
    ) -> Result<Promise, TripStoreError> {
        self.acceptor.prepare(ballot, key).await
    }

    async fn propose(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
    ) -> Result<bool, TripStoreError> {
        self.acceptor.propose(ballot, key, value).await
    }

    async fn learn(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
        kind: OpKind,
    ) -> Result<String, TripStoreError> {
        Ok(self.learn_value(ballot, key, value, kind).await)
    }
}
