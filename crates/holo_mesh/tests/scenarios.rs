mod common;

use std::collections::BTreeSet;

use common::{open_node, wait_until, CONVERGE_TIMEOUT};
use holo_mesh::cluster::{NodeState, Origin};
use holo_mesh::storage::MemEngine;
use holo_mesh::transport::mem::MemNetwork;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bootstrap_without_peers_becomes_node_one() {
    let net = MemNetwork::new();
    let node = open_node(&net, common::config(0, &[]), MemEngine::shared()).await;
    assert_eq!(node.id(), 1);
    assert_eq!(node.cluster().origin(), Origin::Bootstrapped);
    let nodes = node.cluster().nodes();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[&1].state, NodeState::Healthy);
    node.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn second_node_joins_as_node_two() {
    let net = MemNetwork::new();
    let a = open_node(&net, common::config(0, &[]), MemEngine::shared()).await;
    let b = open_node(&net, common::config(1, &[0]), MemEngine::shared()).await;
    assert_eq!(a.id(), 1);
    assert_eq!(b.id(), 2);
    assert_eq!(b.cluster().key(), a.cluster().key());
    let both = [a, b];
    assert!(wait_until(CONVERGE_TIMEOUT, || common::all_know(&both, 2)).await);
    common::close_all(both.into()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_get_distinct_ids() {
    let net = MemNetwork::new();
    let seed = open_node(&net, common::config(0, &[]), MemEngine::shared()).await;

    let joins: Vec<_> = (1..10)
        .map(|i| {
            let net = net.clone();
            tokio::spawn(async move {
                open_node(&net, common::config(i, &[0]), MemEngine::shared()).await
            })
        })
        .collect();
    let mut nodes = vec![seed];
    for join in joins {
        nodes.push(join.await.unwrap());
    }

    let ids: BTreeSet<_> = nodes.iter().map(|n| n.id()).collect();
    assert_eq!(ids.len(), 10);
    assert!(wait_until(CONVERGE_TIMEOUT, || common::all_know(&nodes, 10)).await);
    common::close_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_with_default_lease_is_readable_elsewhere() {
    let net = MemNetwork::new();
    let nodes = common::cluster(&net, 2).await;
    nodes[0].kv().set("greeting", "hello").await.unwrap();
    let digest = nodes[0].kv().digest(b"greeting").unwrap().unwrap();
    assert_eq!(digest.leaseholder, nodes[0].id());

    assert!(
        wait_until(CONVERGE_TIMEOUT, || {
            nodes[1].kv().get(b"greeting").unwrap() == Some(b"hello".to_vec())
        })
        .await
    );
    common::close_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_leased_to_a_peer_comes_back() {
    let net = MemNetwork::new();
    let nodes = common::cluster(&net, 2).await;
    let remote = nodes[1].id();
    nodes[0]
        .kv()
        .set_with_lease("owned", "by-two", remote)
        .await
        .unwrap();
    // The leaseholder applied it synchronously.
    assert_eq!(
        nodes[1].kv().get(b"owned").unwrap(),
        Some(b"by-two".to_vec())
    );
    assert!(
        wait_until(CONVERGE_TIMEOUT, || {
            nodes[0].kv().get(b"owned").unwrap() == Some(b"by-two".to_vec())
        })
        .await
    );
    let digest = nodes[0].kv().digest(b"owned").unwrap().unwrap();
    assert_eq!(digest.leaseholder, remote);
    common::close_all(nodes).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_bumps_generation_and_wins_over_old_record() {
    let net = MemNetwork::new();
    let a = open_node(&net, common::config(0, &[]), MemEngine::shared()).await;
    let engine = MemEngine::shared();
    let b = open_node(&net, common::config(1, &[0]), engine.clone()).await;
    let id = b.id();
    let before = b.cluster().host().unwrap().heartbeat;
    b.close().await.unwrap();
    assert!(
        wait_until(CONVERGE_TIMEOUT, || {
            a.cluster().node(id).map(|n| n.state) == Some(NodeState::Left)
        })
        .await
    );

    let b = open_node(&net, common::config(1, &[0]), engine).await;
    assert_eq!(b.cluster().origin(), Origin::Restarted);
    assert_eq!(b.id(), id);
    let after = b.cluster().host().unwrap().heartbeat;
    assert_eq!(after.generation, before.generation + 1);
    assert!(after.is_newer_than(&before));

    assert!(
        wait_until(CONVERGE_TIMEOUT, || {
            a.cluster().node(id).map_or(false, |n| {
                n.state == NodeState::Healthy && n.heartbeat.generation == before.generation + 1
            })
        })
        .await
    );
    common::close_all(vec![a, b]).await;
}
