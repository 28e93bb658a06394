//! TCP transport: peer-to-peer and client API messages, server loops, and
//! remote peer stubs. Every call uses its own connection carrying exactly
//! one length-prefixed request frame and one reply frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::node::Node;
use crate::paxos::{Ballot, OpKind, Promise};
use crate::server::{
    kv_server_name, userdb_server_name, PaxosPeer, Registry, ReplicaId, TwoPcPeer,
};
use crate::utils::{
    read_frame, tcp_connect_with_retry, write_frame, TripStoreError,
};

use async_trait::async_trait;

use serde::{Deserialize, Serialize};

use tokio::net::{TcpListener, TcpStream};

/// Request from one replica to another.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerRequest {
    Prepare {
        ballot: Ballot,
        key: String,
    },
    Propose {
        ballot: Ballot,
        key: String,
        value: String,
    },
    Learn {
        ballot: Ballot,
        key: String,
        value: String,
        kind: OpKind,
    },
    CanCommit {
        txn: String,
        op: Vec<String>,
        coordinator: ReplicaId,
    },
    DoCommit {
        txn: String,
    },
    HaveCommitted {
        txn: String,
    },
    AbortTransaction {
        txn: String,
    },
}

/// Reply to a `PeerRequest`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum PeerReply {
    Promise(Promise),
    Accepted(bool),
    Learned(String),
    Vote(bool),
    Committed(String),
    Ack,
    Error(String),
}

/// Request from a client.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiRequest {
    ExecuteOperation { message: String, actor: String },
    PutItinerary { payload: String, actor: String },
    SignUp { info: String },
    Login { info: String },
    Logout { email: String },
    IsLoggedIn { email: String },
}

/// Reply to an `ApiRequest`.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum ApiReply {
    Text(String),
    Flag(bool),
}

/// Accepts peer connections forever, serving each on its own task.
pub async fn serve_peer_rpcs(
    listener: TcpListener,
    node: Node,
) -> Result<(), TripStoreError> {
    let me = kv_server_name(node.id());
    pf_info!(me; "accepting peer connections on {}", listener.local_addr()?);
    loop {
        let (mut conn, addr) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            let me = kv_server_name(node.id());
            if let Err(e) = serve_peer_conn(&mut conn, &node).await {
                pf_warn!(me; "error serving peer {}: {}", addr, e);
            }
        });
    }
}

async fn serve_peer_conn(
    conn: &mut TcpStream,
    node: &Node,
) -> Result<(), TripStoreError> {
    let req: PeerRequest = read_frame(conn).await?;
    let result = match req {
        PeerRequest::Prepare { ballot, key } => {
            node.kv.prepare(ballot, &key).await.map(PeerReply::Promise)
        }
        PeerRequest::Propose { ballot, key, value } => node
            .kv
            .propose(ballot, &key, &value)
            .await
            .map(PeerReply::Accepted),
        PeerRequest::Learn {
            ballot,
            key,
            value,
            kind,
        } => node
            .kv
            .learn(ballot, &key, &value, kind)
            .await
            .map(PeerReply::Learned),
        PeerRequest::CanCommit {
            txn,
            op,
            coordinator,
        } => node
            .userdb
            .can_commit(&txn, &op, coordinator)
            .await
            .map(PeerReply::Vote),
        PeerRequest::DoCommit { txn } => {
            node.userdb.do_commit(&txn).await.map(PeerReply::Committed)
        }
        PeerRequest::HaveCommitted { txn } => {
            node.userdb.have_committed(&txn).await.map(|_| PeerReply::Ack)
        }
        PeerRequest::AbortTransaction { txn } => node
            .userdb
            .abort_transaction(&txn)
            .await
            .map(|_| PeerReply::Ack),
    };

    let reply = result.unwrap_or_else(|e| PeerReply::Error(e.to_string()));
    write_frame(conn, &reply).await
}

/// Accepts client connections forever, serving each on its own task.
pub async fn serve_api(
    listener: TcpListener,
    node: Node,
) -> Result<(), TripStoreError> {
    let me = kv_server_name(node.id());
    pf_info!(me; "accepting client connections on {}", listener.local_addr()?);
    loop {
        let (mut conn, addr) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            let me = kv_server_name(node.id());
            if let Err(e) = serve_api_conn(&mut conn, &node).await {
                pf_warn!(me; "error serving client {}: {}", addr, e);
            }
        });
    }
}

async fn serve_api_conn(
    conn: &mut TcpStream,
    node: &Node,
) -> Result<(), TripStoreError> {
    let req: ApiRequest = read_frame(conn).await?;
    let reply = match req {
        ApiRequest::ExecuteOperation { message, actor } => {
            ApiReply::Text(node.kv.execute_operation(&message, &actor).await)
        }
        ApiRequest::PutItinerary { payload, actor } => {
            ApiReply::Text(node.kv.put_itinerary(&payload, &actor).await)
        }
        ApiRequest::SignUp { info } => {
            ApiReply::Text(node.userdb.sign_up(&info).await)
        }
        ApiRequest::Login { info } => ApiReply::Text(node.userdb.login(&info).await),
        ApiRequest::Logout { email } => {
            ApiReply::Text(node.userdb.logout(&email).await)
        }
        ApiRequest::IsLoggedIn { email } => {
            ApiReply::Flag(node.userdb.is_logged_in(&email).await)
        }
    };
    write_frame(conn, &reply).await
}

/// Stub of a remote node's peer listener, serving both its itinerary store
/// and user directory replicas.
pub struct RemotePeer {
    name: String,
    addr: SocketAddr,
}

impl RemotePeer {
    pub fn new(name: impl ToString, addr: SocketAddr) -> Self {
        RemotePeer {
            name: name.to_string(),
            addr,
        }
    }

    /// Issues one request on a fresh connection.
    async fn call(&self, req: &PeerRequest) -> Result<PeerReply, TripStoreError> {
        let mut conn = tcp_connect_with_retry(self.addr, 0).await?;
        write_frame(&mut conn, req).await?;
        let reply: PeerReply = read_frame(&mut conn).await?;
        match reply {
            PeerReply::Error(e) => Err(TripStoreError(e)),
            reply => Ok(reply),
        }
    }

    fn unexpected(&self, reply: PeerReply) -> TripStoreError {
        TripStoreError(format!("unexpected reply from {}: {:?}", self.name, reply))
    }
}

#[async_trait]
impl PaxosPeer for RemotePeer {
    async fn prepare(
        &self,
        ballot: Ballot,
        key: &str,
    ) -> Result<Promise, TripStoreError> {
        let req = PeerRequest::Prepare {
            ballot,
            key: key.into(),
        };
        match self.call(&req).await? {
            PeerReply::Promise(promise) => Ok(promise),
            reply => Err(self.unexpected(reply)),
        }
    }

    async fn propose(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
    ) -> Result<bool, TripStoreError> {
        let req = PeerRequest::Propose {
            ballot,
            key: key.into(),
            value: value.into(),
        };
        match self.call(&req).await? {
            PeerReply::Accepted(accepted) => Ok(accepted),
            reply => Err(self.unexpected(reply)),
        }
    }

    async fn learn(
        &self,
        ballot: Ballot,
        key: &str,
        value: &str,
        kind: OpKind,
    ) -> Result<String, TripStoreError> {
        let req = PeerRequest::Learn {
            ballot,
            key: key.into(),
            value: value.into(),
            kind,
        };
        match self.call(&req).await? {
            PeerReply::Learned(result) => Ok(result),
            reply => Err(self.unexpected(reply)),
        }
    }
}

#[async_trait]
impl TwoPcPeer for RemotePeer {
    async fn can_commit(
        &self,
        txn: &str,
        op: &[String],
        coordinator: ReplicaId,
    ) -> Result<bool, TripStoreError> {
        let req = PeerRequest::CanCommit {
            txn: txn.into(),
            op: op.to_vec(),
            coordinator,
        };
        match self.call(&req).await? {
            PeerReply::Vote(vote) => Ok(vote),
            reply => Err(self.unexpected(reply)),
        }
    }

    async fn do_commit(&self, txn: &str) -> Result<String, TripStoreError> {
        match self.call(&PeerRequest::DoCommit { txn: txn.into() }).await? {
            PeerReply::Committed(result) => Ok(result),
            reply => Err(self.unexpected(reply)),
        }
    }

    async fn have_committed(&self, txn: &str) -> Result<(), TripStoreError> {
        match self
            .call(&PeerRequest::HaveCommitted { txn: txn.into() })
            .await?
        {
            PeerReply::Ack => Ok(()),
            reply => Err(self.unexpected(reply)),
        }
    }

    async fn abort_transaction(&self, txn: &str) -> Result<(), TripStoreError> {
        match self
            .call(&PeerRequest::AbortTransaction { txn: txn.into() })
            .await?
        {
            PeerReply::Ack => Ok(()),
            reply => Err(self.unexpected(reply)),
        }
    }
}

/// Registry resolving `KVS<i>` and `UserDB2PC<i>` to the peer listener
/// address of node `i`.
pub struct TcpRegistry {
    addrs: HashMap<String, SocketAddr>,
}

impl TcpRegistry {
    /// `peer_addrs[i]` is the peer listener address of node `i`.
    pub fn new(peer_addrs: &[SocketAddr]) -> Self {
        let mut addrs = HashMap::new();
        for (id, addr) in peer_addrs.iter().enumerate() {
            addrs.insert(kv_server_name(id as ReplicaId), *addr);
            addrs.insert(userdb_server_name(id as ReplicaId), *addr);
        }
        TcpRegistry { addrs }
    }

    fn lookup(&self, name: &str) -> Result<RemotePeer, TripStoreError> {
        match self.addrs.get(name) {
            Some(addr) => Ok(RemotePeer::new(name, *addr)),
            None => Err(TripStoreError(format!("'{}' not bound", name))),
        }
    }
}

impl Registry for TcpRegistry {
    fn lookup_paxos(
        &self,
        name: &str,
    ) -> Result<Arc<dyn PaxosPeer>, TripStoreError> {
        Ok(Arc::new(self.lookup(name)?))
    }

    fn lookup_twopc(
        &self,
        name: &str,
    ) -> Result<Arc<dyn TwoPcPeer>, TripStoreError> {
        Ok(Arc::new(self.lookup(name)?))
    }
}
