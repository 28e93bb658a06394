//! User directory replica: 2PC coordinator and participant over the
//! replicated `UserDirectory`, plus the client-facing account entries.

use std::sync::{Arc, OnceLock};

use crate::server::{
    call_with_timeout, userdb_server_name, Registry, ReplicaId, RpcOutcome,
    TwoPcPeer,
};
use crate::twopc::{Coordinator, Participant, ReplicaConfigTwoPc};
use crate::userdb::{DirectoryOp, UserDirectory};
use crate::utils::TripStoreError;

use async_trait::async_trait;

use tokio::time::Duration;

use super::FAILED;

/// User directory server replica.
pub struct UserDbServer {
    /// My replica ID.
    id: ReplicaId,

    /// Registry name, used as logging prefix.
    name: String,

    /// Total number of replicas in cluster.
    population: u8,

    /// Timeout of a single commit acknowledgement call.
    ack_timeout: Duration,

    directory: Arc<UserDirectory>,

    participant: Participant,

    coordinator: Arc<Coordinator>,

    /// Stubs of all other replicas, set once by `connect_with_all_servers()`.
    peers: OnceLock<Vec<(ReplicaId, Arc<dyn TwoPcPeer>)>>,
}

impl UserDbServer {
    /// Creates a new replica, recovering live transactions from its
    /// transaction log.
    pub async fn new_and_setup(
        id: ReplicaId,
        population: u8,
        directory: Arc<UserDirectory>,
        config: ReplicaConfigTwoPc,
    ) -> Result<Self, TripStoreError> {
        let name = userdb_server_name(id);
        if population == 0 || id >= population {
            return logged_err!(name; "invalid id {} in population {}",
                                     id, population);
        }

        let participant = Participant::new_and_setup(&name, &config).await?;
        Ok(UserDbServer {
            id,
            population,
            ack_timeout: Duration::from_millis(config.commit_ack_timeout_ms),
            directory,
            participant,
            coordinator: Arc::new(Coordinator::new(&name, &config)),
            peers: OnceLock::new(),
            name,
        })
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The local user directory.
    pub fn directory(&self) -> &Arc<UserDirectory> {
        &self.directory
    }

    /// The local participant state.
    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    /// One-time peer discovery: looks up replicas `UserDB2PC0..<n-1>` other
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
            peers.push((peer, registry.lookup_twopc(&userdb_server_name(peer))?));
        }
        if self.peers.set(peers).is_err() {
            return logged_err!(self.name; "already connected with other servers");
        }

        pf_info!(self.name; "connected with {} peers", n - 1);
        Ok(())
    }

    /// Client entry: signs up with `name|email|password`.
    pub async fn sign_up(&self, info: &str) -> String {
        pf_debug!(self.name; "signup info from client: {}", info);
        match DirectoryOp::parse_signup(info) {
            Ok(op) => self.start_2pc(&op).await,
            Err(reply) => reply,
        }
    }

    /// Client entry: logs in with `email|password`.
    pub async fn login(&self, info: &str) -> String {
        pf_debug!(self.name; "login info from client: {}", info);
        match DirectoryOp::parse_login(info) {
            Ok(op) => self.start_2pc(&op).await,
            Err(reply) => reply,
        }
    }

    /// Client entry: logs out the user with this email.
    pub async fn logout(&self, email: &str) -> String {
        pf_debug!(self.name; "logout from client: {}", email);
        self.start_2pc(&DirectoryOp::Logout {
            email: email.into(),
        })
        .await
    }

    /// Is the user with this email logged in, per my replica?
    pub async fn is_logged_in(&self, email: &str) -> bool {
        self.directory.is_logged_in(email).await
    }

    /// Coordinator entry: replicates `op` atomically to every replica.
    /// Returns the result of applying it locally, or `FAILED` if any
    /// participant voted no (or did not vote in time) or the local commit
    /// failed, in which case every participant has been told to abort.
    pub async fn start_2pc(&self, op: &DirectoryOp) -> String {
        let peers = match self.peers.get() {
            Some(peers) => peers,
            None => {
                pf_error!(self.name; "not connected with other servers yet");
                return FAILED.into();
            }
        };
        let txn = uuid::Uuid::new_v4().to_string();
        let tokens = op.to_tokens();

        let mut participants: Vec<(ReplicaId, &dyn TwoPcPeer)> =
            vec![(self.id, self as &dyn TwoPcPeer)];
        participants.extend(peers.iter().map(|(id, peer)| (*id, peer.as_ref())));

        if !self
            .coordinator
            .collect_votes(&participants, &txn, &tokens, self.id)
            .await
        {
            self.coordinator.broadcast_abort(&participants, &txn).await;
            pf_debug!(self.name; "txn {} for {} aborted", txn, op);
            return FAILED.into();
        }

        pf_debug!(self.name; "txn {}: starting commits", txn);
        let result = match self
            .coordinator
            .commit_locally(self, &participants, &txn)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                pf_debug!(self.name; "txn {} for {} aborted", txn, op);
                return FAILED.into();
            }
        };

        let others = peers.clone();
        let coordinator = self.coordinator.clone();
        let population = self.population;
        tokio::spawn(async move {
            let targets: Vec<(ReplicaId, &dyn TwoPcPeer)> =
                others.iter().map(|(id, peer)| (*id, peer.as_ref())).collect();
            coordinator.broadcast_commit(&targets, &txn).await;
            coordinator.await_acks(&txn, population).await;
        });

        result
    }

    /// Reports a finished commit to the transaction's coordinator.
    async fn notify_coordinator(&self, txn: &str, coordinator: ReplicaId) {
        if coordinator == self.id {
            if !self.coordinator.acks().record(txn).await {
                pf_debug!(self.name; "txn {}: own ack no longer awaited", txn);
            }
            return;
        }
        let peer = self
            .peers
            .get()
            .and_then(|peers| peers.iter().find(|(id, _)| *id == coordinator));
        match peer {
            Some((_, peer)) => {
                let outcome =
                    call_with_timeout(peer.have_committed(txn), self.ack_timeout)
                        .await;
                if !matches!(outcome, RpcOutcome::Reply(())) {
                    pf_warn!(self.name; "txn {}: ack to {} not delivered: {:?}",
                                        txn, coordinator, outcome);
                }
            }
            None => {
                pf_warn!(self.name; "txn {}: unknown coordinator {}", txn, coordinator);
            }
        }
    }
}

#[async_trait]
impl TwoPcPeer for UserDbServer {
    async fn can_commit(
        &self,
        txn: &str,
        op: &[String],
        coordinator: ReplicaId,
    ) -> Result<bool, TripStoreError> {
        self.participant.can_commit(txn, op, coordinator).await
    }

    async fn do_commit(&self, txn: &str) -> Result<String, TripStoreError> {
        let (op, coordinator) = match self.participant.begin_commit(txn).await? {
            Some(prepared) => prepared,
            None => return Ok("Transaction Not Found".into()),
        };
        let result = self.directory.apply(&op).await;
        if let Err(e) = self.participant.finish_commit(txn).await {
            // applied already, so the commit itself stands
            pf_error!(self.name; "txn {}: error logging commit: {}", txn, e);
        }
        self.notify_coordinator(txn, coordinator).await;
        Ok(result)
    }

    async fn have_committed(&self, txn: &str) -> Result<(), TripStoreError> {
        if self.coordinator.acks().record(txn).await {
            pf_trace!(self.name; "txn {}: commit ack received", txn);
        } else {
            pf_debug!(self.name; "txn {}: ignoring ack no longer awaited", txn);
        }
        Ok(())
    }

    async fn abort_transaction(&self, txn: &str) -> Result<(), TripStoreError> {
        self.participant.abort(txn).await
    }
}
