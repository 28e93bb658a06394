//! TripStore: a replicated travel-itinerary store and user directory.
//!
//! Itinerary mutations are agreed upon through single-decree Paxos per key;
//! user directory updates are replicated to every node through two-phase
//! commit backed by a durable transaction log.

#[macro_use]
pub mod utils;

pub mod client;
pub mod kvstore;
pub mod node;
pub mod paxos;
pub mod server;
pub mod twopc;
pub mod userdb;

pub use crate::utils::{logger_init, quorum_size, TripStoreError};

pub use crate::node::{KvServer, Node, UserDbServer, FAILED};
pub use crate::paxos::ReplicaConfigPaxos;
pub use crate::twopc::ReplicaConfigTwoPc;

pub use crate::server::{
    serve_api, serve_peer_rpcs, LocalRegistry, Registry, ReplicaId,
    TcpRegistry,
};

pub use crate::client::ClientApiStub;
