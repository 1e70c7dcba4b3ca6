//! Push-pull membership anti-entropy.
//!
//! One round between initiator A and peer B:
//! 1. A bumps its own heartbeat and sends `Sync` with a digest of every node.
//! 2. B answers `Ack`: full records where B is fresher or A never mentioned
//!    the node, digests where B is missing the node or staler.
//! 3. A merges the records and sends `Ack2` with its copy of every node B
//!    asked for, if A's copy is at least as recent as what B reported.
//! 4. B merges `Ack2`.
//!
//! No lock is held across the network calls: each step snapshots the
//! directory, talks to the peer, then merges.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::directory::Directory;
use super::types::{Address, DigestMap, NodeMap};
use crate::error::Error;
use crate::message::{Request, Response};
use crate::transport::Transport;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub digests: DigestMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckMessage {
    pub nodes: NodeMap,
    pub digests: DigestMap,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack2Message {
    pub nodes: NodeMap,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GossipMessage {
    Sync(SyncMessage),
    Ack(AckMessage),
    Ack2(Ack2Message),
}

pub struct Gossip {
    directory: Arc<Directory>,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl Gossip {
    pub fn new(
        directory: Arc<Directory>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            directory,
            transport,
            request_timeout,
        }
    }

    /// Run one round against a random healthy peer. No-op without peers.
    pub async fn gossip_once(&self) -> anyhow::Result<()> {
        let peer = self.directory.read_state(|state| {
            state
                .healthy_peers()
                .choose(&mut rand::thread_rng())
                .map(|node| node.address.clone())
        });
        match peer {
            Some(addr) => self.gossip_once_with(&addr).await,
            None => Ok(()),
        }
    }

    /// Run one round against an explicit address.
    pub async fn gossip_once_with(&self, addr: &Address) -> anyhow::Result<()> {
        self.directory.update_host(|_| {});
        let sync = SyncMessage {
            digests: self.directory.read_state(|state| state.digests()),
        };

        let resp = self
            .exchange(addr, GossipMessage::Sync(sync))
            .await?
            .into_gossip()?;
        let ack = match resp {
            GossipMessage::Ack(ack) => ack,
            other => {
                return Err(Error::Protocol(format!(
                    "expected gossip ack from {addr}, got {}",
                    other.kind()
                ))
                .into())
            }
        };

        let ack2 = self.process_ack(ack);
        self.exchange(addr, GossipMessage::Ack2(ack2))
            .await?
            .into_ack()
            .with_context(|| format!("ack2 to {addr}"))
    }

    /// Server side: answer a sync, or merge an ack2.
    pub fn handle(&self, msg: GossipMessage) -> anyhow::Result<Response> {
        match msg {
            GossipMessage::Sync(sync) => Ok(Response::Gossip(GossipMessage::Ack(
                self.process_sync(sync),
            ))),
            GossipMessage::Ack2(ack2) => {
                self.directory.merge(ack2.nodes.into_values());
                Ok(Response::Ack)
            }
            GossipMessage::Ack(_) => {
                Err(Error::Protocol("gossip ack is only valid as a response".into()).into())
            }
        }
    }

    fn process_sync(&self, sync: SyncMessage) -> AckMessage {
        self.directory.read_state(|state| {
            let mut ack = AckMessage::default();
            for (id, remote) in &sync.digests {
                match state.nodes.get(id) {
                    Some(local) if local.heartbeat.is_newer_than(remote) => {
                        ack.nodes.insert(*id, local.clone());
                    }
                    Some(local) if local.heartbeat.is_older_than(remote) => {
                        ack.digests.insert(*id, local.heartbeat);
                    }
                    Some(_) => {}
                    None => {
                        ack.digests.insert(*id, Default::default());
                    }
                }
            }
            for (id, node) in &state.nodes {
                if !sync.digests.contains_key(id) {
                    ack.nodes.insert(*id, node.clone());
                }
            }
            ack
        })
    }

    fn process_ack(&self, ack: AckMessage) -> Ack2Message {
        self.directory.merge(ack.nodes.into_values());
        self.directory.read_state(|state| {
            let nodes = ack
                .digests
                .iter()
                .filter_map(|(id, remote)| {
                    let local = state.nodes.get(id)?;
                    (!local.heartbeat.is_older_than(remote)).then(|| (*id, local.clone()))
                })
                .collect();
            Ack2Message { nodes }
        })
    }

    async fn exchange(&self, addr: &Address, msg: GossipMessage) -> anyhow::Result<Response> {
        tokio::time::timeout(
            self.request_timeout,
            self.transport.send(addr, Request::Gossip(msg)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("gossip with {addr} timed out"))?
    }

    /// Gossip every `interval` until `shutdown` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = self.gossip_once() => {
                        if let Err(err) = res {
                            tracing::debug!(error = ?err, "membership gossip round failed");
                        }
                    }
                }
            }
        })
    }
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            GossipMessage::Sync(_) => "sync",
            GossipMessage::Ack(_) => "ack",
            GossipMessage::Ack2(_) => "ack2",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{ClusterState, Heartbeat, Node, NodeId, NodeState};
    use crate::transport::mem::MemNetwork;
    use crate::transport::Handler;
    use async_trait::async_trait;

    struct GossipHandler(Arc<Gossip>);

    #[async_trait]
    impl Handler for GossipHandler {
        async fn handle(&self, req: Request) -> anyhow::Result<Response> {
            match req {
                Request::Gossip(msg) => self.0.handle(msg),
                other => anyhow::bail!("unexpected {}", other.kind()),
            }
        }
    }

    fn addr(id: NodeId) -> Address {
        Address::new(format!("node-{id}"))
    }

    fn peer(net: &MemNetwork, id: NodeId, known: &[NodeId]) -> (Arc<Directory>, Arc<Gossip>) {
        let mut state = ClusterState {
            host_id: id,
            ..ClusterState::default()
        };
        for other in known.iter().copied().chain([id]) {
            state.nodes.insert(other, Node::new(other, addr(other)));
        }
        let directory = Arc::new(Directory::with_state(state));
        let transport = net.endpoint(addr(id));
        let gossip = Arc::new(Gossip::new(
            directory.clone(),
            transport.clone(),
            Duration::from_secs(1),
        ));
        transport
            .bind(Arc::new(GossipHandler(gossip.clone())))
            .unwrap();
        (directory, gossip)
    }

    #[test]
    fn sync_answer_splits_fresh_and_stale_records() {
        let net = MemNetwork::new();
        let (dir, gossip) = peer(&net, 1, &[]);
        let mut fresh = Node::new(2, addr(2));
        fresh.heartbeat = Heartbeat::new(1, 9);
        let mut stale = Node::new(3, addr(3));
        stale.heartbeat = Heartbeat::new(1, 1);
        dir.set(fresh);
        dir.set(stale);
        dir.set(Node::new(5, addr(5)));

        let mut digests = DigestMap::new();
        digests.insert(1, Heartbeat::default());
        digests.insert(2, Heartbeat::new(1, 3));
        digests.insert(3, Heartbeat::new(1, 4));
        digests.insert(4, Heartbeat::new(0, 7));
        let ack = gossip.process_sync(SyncMessage { digests });

        assert_eq!(ack.nodes.keys().copied().collect::<Vec<_>>(), vec![2, 5]);
        assert_eq!(ack.digests.get(&3), Some(&Heartbeat::new(1, 1)));
        assert_eq!(ack.digests.get(&4), Some(&Heartbeat::default()));
        assert!(!ack.digests.contains_key(&1));
    }

    #[tokio::test]
    async fn one_round_converges_a_pair() {
        let net = MemNetwork::new();
        let (dir_a, gossip_a) = peer(&net, 1, &[2]);
        let (dir_b, _) = peer(&net, 2, &[3]);
        dir_b.set(Node::new(3, addr(3)));

        gossip_a.gossip_once_with(&addr(2)).await.unwrap();

        let ids = |dir: &Directory| dir.read_state(|s| s.nodes.keys().copied().collect::<Vec<_>>());
        assert_eq!(ids(dir_a.as_ref()), vec![1, 2, 3]);
        assert_eq!(ids(dir_b.as_ref()), vec![1, 2, 3]);
        assert_eq!(dir_b.get(1).unwrap().heartbeat, Heartbeat::new(0, 1));
    }

    #[tokio::test]
    async fn no_healthy_peer_is_a_noop() {
        let net = MemNetwork::new();
        let (dir, gossip) = peer(&net, 1, &[2]);
        let mut dead = dir.get(2).unwrap();
        dead.state = NodeState::Dead;
        dir.set(dead);
        gossip.gossip_once().await.unwrap();
        assert_eq!(dir.host().unwrap().heartbeat, Heartbeat::default());
    }

    #[tokio::test]
    async fn stray_ack_is_rejected() {
        let net = MemNetwork::new();
        let (_, gossip) = peer(&net, 1, &[]);
        let err = gossip
            .handle(GossipMessage::Ack(AckMessage::default()))
            .unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Protocol(_))));
    }
}
