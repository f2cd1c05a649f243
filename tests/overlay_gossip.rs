//! Integration tests for peer discovery: the Version handshake, address
//! anti-entropy, epidemic propagation, and CA registration.

mod common;

use std::time::Duration;

use common::{peer_up, test_config, Router};
use huddle::{crypto, Address, AddressRecord, Config};

#[tokio::test]
async fn mutual_handshake_confirms_both_peers() {
    let router = Router::new();
    let a = router.spawn_node("a:1");
    let b = router.spawn_node("b:2");

    peer_up(&a, &b).await;

    assert!(a.peer_table().contains("b:2"));
    assert!(b.peer_table().contains("a:1"));
    assert!(a.address_book().contains("b:2"));
    assert!(b.address_book().contains("a:1"));
}

#[tokio::test]
async fn repeated_handshakes_do_not_duplicate_state() {
    let router = Router::new();
    let a = router.spawn_node("a:1");
    let b = router.spawn_node("b:2");

    peer_up(&a, &b).await;
    for _ in 0..5 {
        a.connect("b:2").await.expect("dispatch task must not panic");
    }

    assert_eq!(a.peer_table().len(), 1);
    assert_eq!(b.peer_table().len(), 1);
    assert_eq!(a.address_book().len(), 1);
    assert_eq!(b.address_book().len(), 1);
}

#[tokio::test]
async fn protocol_mismatch_is_silently_dropped() {
    let router = Router::new();
    let a = router.spawn_node("a:1");
    let b = router.spawn_node_with_config(
        "b:2",
        Config {
            protocol_version: 7,
            ..test_config()
        },
    );

    a.connect("b:2").await.expect("dispatch task must not panic");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(b.peer_table().is_empty(), "mismatched sender must not become a peer");
    assert!(b.address_book().is_empty(), "mismatched sender must leave no address");
    assert!(a.peer_table().is_empty(), "no reciprocal handshake must arrive");
}

#[tokio::test]
async fn gossiped_address_spreads_epidemically_with_original_stamp() {
    let router = Router::new();
    let x = router.spawn_node("x:1");
    let y = router.spawn_node("y:2");
    peer_up(&x, &y).await;

    // Only Y learns about Z, an unreachable third party, with a fixed
    // observation stamp. Y stores it and, having learned something new,
    // forwards the batch to a sample of its peers, which is X.
    y.handle_send_addresses(vec![AddressRecord {
        location: "z:3".into(),
        last_seen: 42,
    }]);

    common::wait_for("z to reach x via gossip", || x.address_book().contains("z:3")).await;
    assert_eq!(
        x.address_book().get("z:3").unwrap().last_seen,
        42,
        "the original stamp must survive the relay through y"
    );
    assert!(
        !x.peer_table().contains("z:3"),
        "an unreachable address must never be promoted to a peer"
    );
}

#[tokio::test]
async fn merge_keeps_the_newest_stamp_regardless_of_order() {
    let router = Router::new();
    let x = router.spawn_node("x:1");

    let record = |last_seen| {
        vec![AddressRecord {
            location: "w:9".into(),
            last_seen,
        }]
    };

    x.handle_send_addresses(record(10));
    x.handle_send_addresses(record(5));
    assert_eq!(x.address_book().get("w:9").unwrap().last_seen, 10);

    x.handle_send_addresses(record(20));
    assert_eq!(x.address_book().get("w:9").unwrap().last_seen, 20);
}

#[tokio::test]
async fn announce_self_refreshes_peer_stamps() {
    let router = Router::new();
    let a = router.spawn_node("a:1");
    let b = router.spawn_node("b:2");
    peer_up(&a, &b).await;

    // Age b artificially on a's side; the announcement must out-date it.
    a.peer_table().update_last_seen("b:2", 1).unwrap();
    a.address_book().update_last_seen("b:2", 1).unwrap();

    b.announce_self();

    common::wait_for("a to refresh b's stamp", || {
        a.peer_table().get("b:2").unwrap().last_seen > 1
    })
    .await;
    assert!(a.address_book().get("b:2").unwrap().last_seen > 1);
}

#[tokio::test]
async fn pull_addresses_merges_the_remote_book() {
    let router = Router::new();
    let x = router.spawn_node("x:1");
    let y = router.spawn_node("y:2");
    peer_up(&x, &y).await;

    y.address_book().add(Address::new("z:9", 7)).unwrap();

    x.pull_addresses("y:2").await.expect("pull must succeed");
    assert_eq!(x.address_book().get("z:9").unwrap().last_seen, 7);
}

#[tokio::test]
async fn ca_registration_stores_a_verified_certificate() {
    let router = Router::new();
    let a = router.spawn_node("a:1");
    let ca = router.spawn_node("ca:1");
    peer_up(&a, &ca).await;

    assert!(a.identity().certificate().is_none());

    a.register_with_ca("ca:1")
        .expect("ca is peered")
        .await
        .expect("registration task must not panic");

    let certificate = a
        .identity()
        .certificate()
        .expect("verified certificate must be stored");
    let ca_key = a.peer_table().get("ca:1").unwrap().public_key;
    assert!(
        crypto::verify(&ca_key, a.identity().public_key_pem(), &certificate),
        "stored certificate must verify against the CA's known key"
    );
}

#[tokio::test]
async fn registration_requires_a_peered_ca() {
    let router = Router::new();
    let a = router.spawn_node("a:1");
    assert!(a.register_with_ca("stranger:1").is_err());
    assert!(a.identity().certificate().is_none());
}
