//! End-to-end behaviour of real nodes over loopback TCP.

use std::sync::Arc;
use std::time::Duration;

use chatmesh::core::{Entity, EntityKind, PeerState};
use chatmesh::store::{FileStore, SqliteStore};
use chatmesh::{Node, NodeConfig};
use chatmesh_testkit::{fast_config, sample_dataset, wait_until, EntityFactory, TestNetwork};

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test(flavor = "multi_thread")]
async fn test_join_registers_both_sides() {
    let net = TestNetwork::empty(2).await.unwrap();
    let (a, b) = (&net.node(0).node, &net.node(1).node);

    b.join(a.local_address()).await.unwrap();

    let on_b = b.registry().find_by_address(a.local_address()).unwrap();
    assert_eq!(on_b.id, a.local_id());
    assert_eq!(on_b.state, PeerState::Online);

    let on_a = a.registry().find_by_address(b.local_address()).unwrap();
    assert_eq!(on_a.state, PeerState::Online);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_peer_list_and_push_spread_membership() {
    let net = TestNetwork::empty(3).await.unwrap();
    net.join_all().await.unwrap();
    let (b, c) = (&net.node(1).node, &net.node(2).node);

    // C pulled B from the seed's list.
    assert!(c.registry().find_by_address(b.local_address()).is_some());
    // B learns about C through the seed's push.
    let learned = wait_until(WAIT, || async { b.registry().find_by_address(c.local_address()).is_some() }).await;
    assert!(learned);

    for member in [b, c] {
        assert!(!member.registry().list_all().iter().any(|p| &p.address == member.local_address()));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_empty_replica_converges_after_join() {
    let data = sample_dataset(1, 12);
    let net = TestNetwork::start(vec![data.clone(), Vec::new()]).await.unwrap();
    net.join_all().await.unwrap();

    let fresh = net.node(1);
    let converged = wait_until(WAIT, || async {
        let _ = fresh.node.sync().force().await;
        fresh.entities(EntityKind::Message).await.len() == 12
    })
    .await;
    assert!(converged);

    for kind in EntityKind::SYNC_ORDER {
        assert_eq!(fresh.entities(kind).await, net.node(0).entities(kind).await, "{kind}");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_conflicting_edit_resolves_to_earlier_version() {
    let factory = EntityFactory::new(7);
    let alice = factory.user("alice");
    let general = factory.channel("general", &alice);
    let original = factory.message(&general, &alice, "see you at 5", 1_000);
    let mut edited = original.clone();
    edited.content = "see you at 6".into();
    edited.sent_at += 500;

    let net = TestNetwork::start(vec![
        vec![Entity::Message(original.clone())],
        vec![Entity::Message(edited)],
    ])
    .await
    .unwrap();
    net.join_all().await.unwrap();

    let expected = vec![Entity::Message(original)];
    let settled = wait_until(WAIT, || async {
        let _ = net.node(1).node.sync().force().await;
        net.node(1).entities(EntityKind::Message).await == expected
    })
    .await;
    assert!(settled);
    assert_eq!(net.node(0).entities(EntityKind::Message).await, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_payload_follows_metadata() {
    let net = TestNetwork::empty(2).await.unwrap();
    let (file, payload) = EntityFactory::new(3).file("minutes.pdf", b"%PDF-1.7 minutes");
    net.node(0).node.save_file(file.clone(), payload.clone()).await.unwrap();
    net.join_all().await.unwrap();

    let receiver = net.node(1);
    let fetched = wait_until(WAIT, || async {
        let _ = receiver.node.sync().force().await;
        receiver.store.has_payload(&file.id).await.unwrap_or(false)
    })
    .await;
    assert!(fetched);
    assert_eq!(receiver.store.fetch_payload(&file.id).await.unwrap(), Some(payload));
    assert_eq!(receiver.entities(EntityKind::File).await, vec![Entity::File(file)]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_local_write_replicates() {
    let net = TestNetwork::empty(2).await.unwrap();
    net.join_all().await.unwrap();

    let factory = EntityFactory::new(5);
    let bob = factory.user("bob");
    net.node(1).node.save_entity(&Entity::User(bob.clone())).await.unwrap();

    let replicated = wait_until(WAIT, || async {
        let _ = net.node(0).node.sync().force().await;
        net.node(0).entities(EntityKind::User).await == vec![Entity::User(bob.clone())]
    })
    .await;
    assert!(replicated);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_peer_goes_offline() {
    let net = TestNetwork::empty(2).await.unwrap();
    net.join_all().await.unwrap();
    let (a, b) = (&net.node(0).node, &net.node(1).node);
    let b_id = b.local_id();

    b.shutdown();

    let offline = wait_until(WAIT, || async {
        a.registry().get(&b_id).map(|p| p.state) == Some(PeerState::Offline)
    })
    .await;
    assert!(offline);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sqlite_node_remembers_peers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("node.db");
    let net = TestNetwork::empty(1).await.unwrap();
    let seed = net.node(0).node.local_address().clone();

    let config = NodeConfig {
        seeds: vec![seed.to_string()],
        ..fast_config()
    };
    let first = Node::start(config, Arc::new(SqliteStore::open(&path).unwrap())).await.unwrap();
    assert!(first.registry().find_by_address(&seed).is_some());
    // Registry writes go through on a background task.
    tokio::time::sleep(Duration::from_millis(200)).await;
    first.shutdown();
    drop(first);

    let restarted = Node::start(fast_config(), Arc::new(SqliteStore::open(&path).unwrap()))
        .await
        .unwrap();
    assert!(restarted.registry().find_by_address(&seed).is_some());
    let rejoined = wait_until(WAIT, || async {
        restarted.registry().find_by_address(&seed).map(|p| p.state) == Some(PeerState::Online)
    })
    .await;
    assert!(rejoined);
    restarted.shutdown();
}
