//! Shared helpers for in-process cluster tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use holo_mesh::cluster::Address;
use holo_mesh::storage::{Engine, MemEngine};
use holo_mesh::transport::mem::MemNetwork;
use holo_mesh::{Node, NodeConfig};

/// Upper bound for anything that converges through gossip.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(20);

/// Poll `f` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if f() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn addr(i: usize) -> String {
    format!("node-{i}")
}

pub fn config(i: usize, peers: &[usize]) -> NodeConfig {
    NodeConfig::new(addr(i))
        .with_peers(peers.iter().map(|p| Address::from(addr(*p))))
        .fast()
}

pub async fn open_node(net: &MemNetwork, cfg: NodeConfig, engine: Arc<dyn Engine>) -> Node {
    let transport = net.endpoint(cfg.address.clone());
    Node::open(cfg, engine, transport)
        .await
        .expect("open node")
}

/// Bootstrap node 0 and join `n - 1` more through it, one after another.
pub async fn cluster(net: &MemNetwork, n: usize) -> Vec<Node> {
    cluster_with(net, n, |_| {}).await
}

pub async fn cluster_with(
    net: &MemNetwork,
    n: usize,
    tweak: impl Fn(&mut NodeConfig),
) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(n);
    for i in 0..n {
        let peers: Vec<usize> = if i == 0 { vec![] } else { vec![0] };
        let mut cfg = config(i, &peers);
        tweak(&mut cfg);
        nodes.push(open_node(net, cfg, MemEngine::shared()).await);
    }
    assert!(
        wait_until(CONVERGE_TIMEOUT, || all_know(&nodes, n)).await,
        "membership did not converge"
    );
    nodes
}

/// Does every node know `n` members?
pub fn all_know(nodes: &[Node], n: usize) -> bool {
    nodes.iter().all(|node| node.cluster().nodes().len() == n)
}

pub async fn close_all(nodes: Vec<Node>) {
    for node in nodes {
        node.close().await.expect("close node");
    }
}
