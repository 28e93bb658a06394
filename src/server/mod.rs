//! Replica identity, peer RPC capability traits, name registries, and the
//! TCP transport carrying peer and client calls.

mod registry;
mod replica;
mod rpc;
mod transport;

pub use registry::{LocalRegistry, Registry};
pub use replica::{kv_server_name, userdb_server_name, ReplicaId};
pub use rpc::{call_with_timeout, fan_out, PaxosPeer, RpcOutcome, TwoPcPeer};
pub use transport::{
    serve_api, serve_peer_rpcs, ApiReply, ApiRequest, PeerReply, PeerRequest,
    RemotePeer, TcpRegistry,
};
