//! Multi-replica scenarios over the in-process registry and over TCP.

use std::collections::BTreeSet;
use std::net::SocketAddr;

use tripstore::kvstore::{KvCommand, PaxosValue};
use tripstore::paxos::{Ballot, OpKind};
use tripstore::server::{PaxosPeer, TwoPcPeer};
use tripstore::userdb::DirectoryOp;
use tripstore::utils::tcp_bind_with_retry;
use tripstore::{
    serve_api, serve_peer_rpcs, ClientApiStub, LocalRegistry, Node,
    ReplicaConfigPaxos, ReplicaConfigTwoPc, TcpRegistry, TripStoreError,
    FAILED,
};

use tempfile::TempDir;

use tokio::time::{self, Duration};

const ANN: &str = "ann@x.com";
const BOB: &str = "bob@x.com";
const CAT: &str = "cat@x.com";

fn paris() -> String {
    r#"{"name":"Paris Trip","location":"Paris","start_date":"2024-05-01",
        "end_date":"2024-05-07","description":"museums"}"#
        .into()
}

fn configs(
    dir: &TempDir,
    id: u8,
) -> (ReplicaConfigPaxos, ReplicaConfigTwoPc) {
    let paxos = ReplicaConfigPaxos {
        phase_timeout_ms: 500,
        retry_backoff_ms: 20,
        ..Default::default()
    };
    let twopc = ReplicaConfigTwoPc {
        vote_timeout_ms: 1000,
        commit_ack_timeout_ms: 1000,
        conflict_wait_ms: 200,
        txn_log_path: dir
            .path()
            .join(format!("txnlog.{}", id))
            .to_string_lossy()
            .into(),
        ..Default::default()
    };
    (paxos, twopc)
}

async fn local_cluster(
    dir: &TempDir,
    population: u8,
) -> Result<(LocalRegistry, Vec<Node>), TripStoreError> {
    let registry = LocalRegistry::new();
    let mut nodes = vec![];
    for id in 0..population {
        let (paxos, twopc) = configs(dir, id);
        let node = Node::new_and_setup(id, population, paxos, twopc).await?;
        node.bind_local(&registry)?;
        nodes.push(node);
    }
    for node in &nodes {
        node.connect_with_all_servers(population, &registry)?;
    }
    Ok((registry, nodes))
}

/// Polls `check` on every node until it holds everywhere or time runs out.
async fn everywhere<F, Fut>(nodes: &[Node], check: F) -> bool
where
    F: Fn(Node) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        let mut all = true;
        for node in nodes {
            if !check(node.clone()).await {
                all = false;
                break;
            }
        }
        if all {
            return true;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    false
}

async fn sign_up_all(nodes: &[Node], emails: &[&str]) -> Result<(), TripStoreError> {
    for email in emails {
        let info = format!("{}|{}|pw", email, email);
        assert_eq!(nodes[0].userdb.sign_up(&info).await, "User Created");
    }
    let emails: Vec<String> = emails.iter().map(|e| e.to_string()).collect();
    let replicated = everywhere(nodes, |node| {
        let emails = emails.clone();
        async move {
            for email in &emails {
                if !node.userdb.directory().contains(email).await {
                    return false;
                }
            }
            true
        }
    })
    .await;
    if replicated {
        Ok(())
    } else {
        Err(TripStoreError::msg("sign-ups never reached every replica"))
    }
}

async fn sharees_at(node: &Node, id: &str) -> BTreeSet<String> {
    node.kv
        .store()
        .itinerary(id)
        .await
        .map(|it| it.sharees.into_iter().collect())
        .unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn put_visible_at_every_replica() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let (_registry, nodes) = local_cluster(&dir, 3).await?;
    sign_up_all(&nodes, &[ANN]).await?;

    let id = nodes[1].kv.put_itinerary(&paris(), ANN).await;
    assert!(uuid::Uuid::parse_str(&id).is_ok(), "got '{}'", id);

    let key = id.clone();
    assert!(
        everywhere(&nodes, |node| {
            let key = key.clone();
            async move { node.kv.store().itinerary(&key).await.is_some() }
        })
        .await
    );
    for node in &nodes {
        let reply = node.kv.execute_operation(&format!("GET|{}", id), ANN).await;
        assert!(reply.contains("Created by: ann@x.com"), "got '{}'", reply);
        assert_eq!(
            node.kv.execute_operation("LIST|CREATED", ANN).await,
            format!("{{{}=[]}}", id)
        );
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn share_by_non_owner_denied() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let (_registry, nodes) = local_cluster(&dir, 3).await?;
    sign_up_all(&nodes, &[ANN, BOB, CAT]).await?;

    let id = nodes[0].kv.put_itinerary(&paris(), ANN).await;
    assert_eq!(
        nodes[1]
            .kv
            .execute_operation(&format!("SHARE|{}|{}", id, BOB), ANN)
            .await,
        "Itinerary Successfully Shared"
    );

    // a sharee may read but not re-share
    let reply = nodes[2]
        .kv
        .execute_operation(&format!("SHARE|{}|{}", id, CAT), BOB)
        .await;
    assert!(reply.starts_with("You're not the Owner"), "got '{}'", reply);

    let key = id.clone();
    assert!(
        everywhere(&nodes, |node| {
            let key = key.clone();
            async move {
                sharees_at(&node, &key).await
                    == BTreeSet::from([BOB.to_string()])
            }
        })
        .await
    );
    assert_eq!(
        nodes[2].kv.execute_operation("LIST|COLLAB", BOB).await,
        format!("[{}]", id)
    );
    assert_eq!(
        nodes[2].kv.execute_operation("LIST|COLLAB", CAT).await,
        "[]"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_shares_converge() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let (_registry, nodes) = local_cluster(&dir, 3).await?;
    sign_up_all(&nodes, &[ANN, BOB, CAT]).await?;
    let id = nodes[0].kv.put_itinerary(&paris(), ANN).await;

    // two proposers race on the same key from different replicas
    let (kv1, kv2) = (nodes[1].kv.clone(), nodes[2].kv.clone());
    let (msg1, msg2) = (
        format!("SHARE|{}|{}", id, BOB),
        format!("SHARE|{}|{}", id, CAT),
    );
    let (r1, r2) = tokio::join!(
        async move { kv1.execute_operation(&msg1, ANN).await },
        async move { kv2.execute_operation(&msg2, ANN).await },
    );

    let mut expected = BTreeSet::new();
    if r1 == "Itinerary Successfully Shared" {
        expected.insert(BOB.to_string());
    }
    if r2 == "Itinerary Successfully Shared" {
        expected.insert(CAT.to_string());
    }
    let key = id.clone();
    let want = expected.clone();
    assert!(
        everywhere(&nodes, |node| {
            let (key, want) = (key.clone(), want.clone());
            async move { sharees_at(&node, &key).await.is_superset(&want) }
        })
        .await
    );

    // late learns of adopted values settle, then every replica agrees
    time::sleep(Duration::from_millis(300)).await;
    let first = sharees_at(&nodes[0], &id).await;
    for node in &nodes[1..] {
        assert_eq!(sharees_at(node, &id).await, first);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repeated_learn_applies_once() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let (_registry, nodes) = local_cluster(&dir, 1).await?;
    sign_up_all(&nodes, &[ANN, BOB]).await?;
    let kv = &nodes[0].kv;
    let id = kv.put_itinerary(&paris(), ANN).await;

    let share = PaxosValue::new(
        ANN,
        KvCommand::Share {
            sharee: BOB.into(),
        },
    )
    .encode()?;
    let ballot = Ballot::new(100, 0);
    let first = kv.learn(ballot, &id, &share, OpKind::Share).await?;
    let second = kv.learn(ballot, &id, &share, OpKind::Share).await?;
    assert_eq!(first, "Itinerary Successfully Shared");
    assert_eq!(second, first);
    assert_eq!(sharees_at(&nodes[0], &id).await.len(), 1);

    let delete = PaxosValue::new(ANN, KvCommand::Delete).encode()?;
    assert_eq!(kv.learn(ballot, &id, &delete, OpKind::Delete).await?, "Deleted");
    assert_eq!(kv.learn(ballot, &id, &delete, OpKind::Delete).await?, "Deleted");
    assert_eq!(kv.store().count().await, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn no_vote_aborts_everywhere() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let (_registry, nodes) = local_cluster(&dir, 3).await?;

    // a prepared transaction on replica 2 holds the key past the conflict
    // wait, so replica 2 votes no
    let tokens = DirectoryOp::SignUp {
        name: "Ann".into(),
        email: ANN.into(),
        password: "other".into(),
    }
    .to_tokens();
    assert!(nodes[2].userdb.can_commit("blocker", &tokens, 2).await?);

    assert_eq!(nodes[0].userdb.sign_up("Ann|ann@x.com|pw").await, FAILED);
    for node in &nodes {
        assert!(!node.userdb.directory().contains(ANN).await);
    }
    assert_eq!(nodes[0].userdb.participant().num_live().await, 0);
    assert_eq!(nodes[1].userdb.participant().num_live().await, 0);
    assert_eq!(nodes[2].userdb.participant().num_live().await, 1);

    nodes[2].userdb.abort_transaction("blocker").await?;
    assert_eq!(
        nodes[0].userdb.sign_up("Ann|ann@x.com|pw").await,
        "User Created"
    );
    assert!(
        everywhere(&nodes, |node| async move {
            node.userdb.is_logged_in(ANN).await
        })
        .await
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_signups_single_winner() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let (_registry, nodes) = local_cluster(&dir, 3).await?;

    let (db0, db2) = (nodes[0].userdb.clone(), nodes[2].userdb.clone());
    let (r0, r2) = tokio::join!(
        async move { db0.sign_up("Ann|ann@x.com|pw0").await },
        async move { db2.sign_up("Ann|ann@x.com|pw2").await },
    );
    let created = [&r0, &r2]
        .iter()
        .filter(|r| r.as_str() == "User Created")
        .count();
    assert!(created <= 1, "got '{}' and '{}'", r0, r2);

    if created == 1 {
        // every replica holds the winner's password
        let password = if r0 == "User Created" { "pw0" } else { "pw2" };
        assert!(
            everywhere(&nodes, |node| async move {
                node.userdb
                    .directory()
                    .user(ANN)
                    .await
                    .map(|u| u.password == password)
                    .unwrap_or(false)
            })
            .await
        );
    } else {
        for node in &nodes {
            assert!(!node.userdb.directory().contains(ANN).await);
        }
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn recovered_txn_blocks_key() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let tokens = DirectoryOp::SignUp {
        name: "Ann".into(),
        email: ANN.into(),
        password: "pw".into(),
    }
    .to_tokens();
    {
        let (_registry, nodes) = local_cluster(&dir, 1).await?;
        assert!(nodes[0].userdb.can_commit("t-crash", &tokens, 0).await?);
    } // replica "crashes" with a prepared txn in its log

    let (_registry, nodes) = local_cluster(&dir, 1).await?;
    assert_eq!(nodes[0].userdb.participant().num_live().await, 1);
    assert_eq!(nodes[0].userdb.sign_up("Ann|ann@x.com|pw").await, FAILED);

    nodes[0].userdb.abort_transaction("t-crash").await?;
    assert_eq!(nodes[0].userdb.sign_up("Ann|ann@x.com|pw").await, "User Created");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tcp_cluster_end_to_end() -> Result<(), TripStoreError> {
    let dir = tempfile::tempdir()?;
    let population = 3;
    let any: SocketAddr = "127.0.0.1:0".parse()?;

    let mut peer_listeners = vec![];
    let mut api_listeners = vec![];
    for _ in 0..population {
        peer_listeners.push(tcp_bind_with_retry(any, 0).await?);
        api_listeners.push(tcp_bind_with_retry(any, 0).await?);
    }
    let peer_addrs = peer_listeners
        .iter()
        .map(|l| l.local_addr())
        .collect::<Result<Vec<_>, _>>()?;
    let api_addrs = api_listeners
        .iter()
        .map(|l| l.local_addr())
        .collect::<Result<Vec<_>, _>>()?;

    let registry = TcpRegistry::new(&peer_addrs);
    let mut nodes = vec![];
    for (id, (peer_listener, api_listener)) in
        peer_listeners.into_iter().zip(api_listeners).enumerate()
    {
        let (paxos, twopc) = configs(&dir, id as u8);
        let node =
            Node::new_and_setup(id as u8, population, paxos, twopc).await?;
        node.connect_with_all_servers(population, &registry)?;
        tokio::spawn(serve_peer_rpcs(peer_listener, node.clone()));
        tokio::spawn(serve_api(api_listener, node.clone()));
        nodes.push(node);
    }

    let ann = ClientApiStub::new(ANN, api_addrs[0]);
    let bob = ClientApiStub::new(BOB, api_addrs[2]);
    assert_eq!(ann.sign_up("Ann|ann@x.com|pw").await?, "User Created");
    assert_eq!(bob.sign_up("Bob|bob@x.com|pw").await?, "User Created");
    assert!(
        everywhere(&nodes, |node| async move {
            node.userdb.directory().contains(ANN).await
                && node.userdb.directory().contains(BOB).await
        })
        .await
    );

    assert_eq!(ann.execute_operation("PUT").await?, "Enter Itinerary Details");
    let id = ann.put_itinerary(&paris()).await?;
    assert!(uuid::Uuid::parse_str(&id).is_ok(), "got '{}'", id);
    assert_eq!(
        ann.execute_operation(&format!("SHARE|{}|{}", id, BOB)).await?,
        "Itinerary Successfully Shared"
    );

    let key = id.clone();
    assert!(
        everywhere(&nodes, |node| {
            let key = key.clone();
            async move { sharees_at(&node, &key).await.contains(BOB) }
        })
        .await
    );
    let reply = bob.execute_operation(&format!("GET|{}", id)).await?;
    assert!(reply.contains("Name: Paris Trip"), "got '{}'", reply);

    assert_eq!(bob.logout().await?, "User Successfully Logged Out!");
    assert!(
        everywhere(&nodes, |node| async move {
            !node.userdb.is_logged_in(BOB).await
        })
        .await
    );
    assert!(!bob.is_logged_in().await?);
    Ok(())
}
