//! Server replicas composed from the protocol roles they play, and the
//! per-process node bundling them over one shared user directory.

mod kv_server;
mod userdb_server;

use std::sync::Arc;

use crate::paxos::ReplicaConfigPaxos;
use crate::server::{kv_server_name, userdb_server_name, LocalRegistry, Registry, ReplicaId};
use crate::twopc::ReplicaConfigTwoPc;
use crate::userdb::UserDirectory;
use crate::utils::TripStoreError;

pub use kv_server::{KvServer, FAILED};
pub use userdb_server::UserDbServer;

/// One server process: an itinerary store replica and a user directory
/// replica sharing the same directory state.
#[derive(Clone)]
pub struct Node {
    pub kv: Arc<KvServer>,
    pub userdb: Arc<UserDbServer>,
}

impl Node {
    /// Creates both replicas of node `id`.
    pub async fn new_and_setup(
        id: ReplicaId,
        population: u8,
        paxos_config: ReplicaConfigPaxos,
        twopc_config: ReplicaConfigTwoPc,
    ) -> Result<Self, TripStoreError> {
        let directory = Arc::new(UserDirectory::new(userdb_server_name(id)));
        let kv = Arc::new(KvServer::new(
            id,
            population,
            directory.clone(),
            paxos_config,
        )?);
        let userdb = Arc::new(
            UserDbServer::new_and_setup(id, population, directory, twopc_config)
                .await?,
        );
        Ok(Node { kv, userdb })
    }

    pub fn id(&self) -> ReplicaId {
        self.kv.id()
    }

    /// Binds both replicas in an in-process registry.
    pub fn bind_local(&self, registry: &LocalRegistry) -> Result<(), TripStoreError> {
        registry.bind_paxos(&kv_server_name(self.id()), self.kv.clone())?;
        registry.bind_twopc(&userdb_server_name(self.id()), self.userdb.clone())?;
        Ok(())
    }

    /// Peer discovery for both replicas.
    pub fn connect_with_all_servers(
        &self,
        n: u8,
        registry: &dyn Registry,
    ) -> Result<(), TripStoreError> {
        self.kv.connect_with_all_servers(n, registry)?;
        self.userdb.connect_with_all_servers(n, registry)
    }
}
