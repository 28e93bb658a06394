//! Name -> peer stub resolution used by `connect_with_all_servers()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::paxos::{Ballot, OpKind, Promise};
use crate::server::{PaxosPeer, ReplicaId, TwoPcPeer};
use crate::utils::TripStoreError;

use async_trait::async_trait;

/// Resolves registry names (`KVS<i>`, `UserDB2PC<i>`) to peer stubs.
pub trait Registry: Send + Sync {
    /// Looks up the itinerary store replica bound under `name`.
    fn lookup_paxos(&self, name: &str)
        -> Result<Arc<dyn PaxosPeer>, TripStoreError>;

    /// Looks up the user directory replica bound under `name`.
    fn lookup_twopc(&self, name: &str)
        -> Result<Arc<dyn TwoPcPeer>, TripStoreError>;
}

/// Registry binding of one in-process server.
struct Binding<T: ?Sized> {
    target: Weak<T>,

    /// Cleared to simulate a network partition from this server.
    reachable: Arc<AtomicBool>,
}

/// In-process registry. Holds weak handles only, so that servers holding
/// each other's stubs never keep each other alive; calls to a dropped or
/// unreachable server fail like a lost connection.
#[derive(Default)]
pub struct LocalRegistry {
    paxos: Mutex<HashMap<String, Binding<dyn PaxosPeer>>>,
    twopc: Mutex<HashMap<String, Binding<dyn TwoPcPeer>>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds an itinerary store replica under `name`.
    pub fn bind_paxos(
        &self,
        name: &str,
        server: Arc<dyn PaxosPeer>,
    ) -> Result<(), TripStoreError> {
        let mut paxos = self.paxos.lock()?;
        paxos.insert(
            name.into(),
            Binding {
                target: Arc::downgrade(&server),
                reachable: Arc::new(AtomicBool::new(true)),
            },
        );
        Ok(())
    }

    /// Binds a user directory replica under `name`.
    pub fn bind_twopc(
        &self,
        name: &str,
        server: Arc<dyn TwoPcPeer>,
    ) -> Result<(), TripStoreError> {
        let mut twopc = self.twopc.lock()?;
        twopc.insert(
            name.into(),
            Binding {
                target: Arc::downgrade(&server),
                reachable: Arc::new(AtomicBool::new(true)),
            },
        );
        Ok(())
    }

    /// Makes every server bound under `name` (un)reachable to stubs.
    pub fn set_reachable(
        &self,
        name: &str,
        reachable: bool,
    ) -> Result<(), TripStoreError> {
        if let Some(binding) = self.paxos.lock()?.get(name) {
            binding.reachable.store(reachable, Ordering::SeqCst);
        }
        if let Some(binding) = self.twopc.lock()?.get(name) {
            binding.reachable.store(reachable, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Registry for LocalRegistry {
    fn lookup_paxos(
        &self,
        name: &str,
    ) -> Result<Arc<dyn PaxosPeer>, TripStoreError> {
        let paxos = self.paxos.lock()?;
        let binding = paxos
            .get(name)
            .ok_or_else(|| TripStoreError(format!("'{}' not bound", name)))?;
        Ok(Arc::new(LocalStub {
            name: name.into(),
            target: binding.target.clone(),
            reachable: binding.reachable.clone(),
        }))
    }

    fn lookup_twopc(
        &self,
        name: &str,
    ) -> Result<Arc<dyn TwoPcPeer>, TripStoreError> {
        let twopc = self.twopc.lock()?;
        let binding = twopc
            .get(name)
            .ok_or_else(|| TripStoreError(format!("'{}' not bound", name)))?;
        Ok(Arc::new(LocalStub {
            name: name.into(),
            target: binding.target.clone(),
            reachable: binding.reachable.clone(),
        }))
    }
}

/// Stub forwarding calls to an in-process server.
struct LocalStub<T: ?Sized> {
    name: String,
    target: Weak<T>,
    reachable: Arc<AtomicBool>,
}

impl<T: ?Sized> LocalStub<T> {
    fn target(&self) -> Result<Arc<T>, TripStoreError> {
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(TripStoreError(format!("'{}' unreachable", self.name)));
        }
        self.target
            .upgrade()
            .ok_or_else(|| TripStoreError(format!("'{}' is gone", self.name)))
    }
}

#[async_trait]
impl PaxosPeer for LocalStub<dyn PaxosPeer> {
    async fn prepare(
        &self,
        ballot: Ballot,
        key: &str,
    ) -> Result<Promise, TripStoreError> {
        self.target()?.prepare(ballot, key).await
    }

    async fn propose(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
    ) -> Result<bool, TripStoreError> {
        self.target()?.propose(ballot, key, value).await
    }

    async fn learn(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
        kind: OpKind,
    ) -> Result<String, TripStoreError> {
        self.target()?.learn(ballot, key, value, kind).await
    }
}

#[async_trait]
impl TwoPcPeer for LocalStub<dyn TwoPcPeer> {
    async fn can_commit(
        &self,
        txn: &str,
        op: &[String],
        coordinator: ReplicaId,
    ) -> Result<bool, TripStoreError> {
        self.target()?.can_commit(txn, op, coordinator).await
    }

    async fn do_commit(&self, txn: &str) -> Result<String, TripStoreError> {
        self.target()?.do_commit(txn).await
    }

    async fn have_committed(&self, txn: &str) -> Result<(), TripStoreError> {
        self.target()?.have_committed(txn).await
    }

    async fn abort_transaction(
        &self,
        txn: &str,
    ) -> Result<(), TripStoreError> {
        self.target()?.abort_transaction(txn).await
    }
}
