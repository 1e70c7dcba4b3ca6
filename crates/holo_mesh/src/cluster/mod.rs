//! Cluster membership: directory, gossip and id assignment behind one facade.
//!
//! `Cluster::open` picks one of three paths:
//! - restart: a snapshot exists, the host keeps its id and bumps its generation;
//! - bootstrap: no snapshot and no peers, the host becomes node 1 of a new cluster;
//! - join: no snapshot, the host pledges to the seed peers for an id, then
//!   gossips with every seed once.
//!
//! After opening, membership gossip and snapshot flushing run as background
//! tasks until `close`.

pub mod directory;
pub mod gossip;
pub mod pledge;
pub mod types;

use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use self::directory::Directory;
pub use self::types::{Address, ClusterState, Heartbeat, Node, NodeId, NodeMap, NodeState};

use self::gossip::Gossip;
use self::pledge::{Arbiter, KnownNodes, PledgeRequest, PledgeResponse};
use crate::config::ClusterConfig;
use crate::error::Error;
use crate::message::{Request, Response};
use crate::storage::{Engine, CLUSTER_STATE_KEY};
use crate::transport::Transport;

/// How the host came to be part of the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Restarted,
    Bootstrapped,
    Joined,
}

pub struct Cluster {
    directory: Arc<Directory>,
    gossip: Arc<Gossip>,
    arbiter: Arbiter,
    engine: Arc<dyn Engine>,
    cfg: ClusterConfig,
    origin: Origin,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Cluster {
    pub async fn open(
        address: Address,
        peers: &[Address],
        cfg: ClusterConfig,
        engine: Arc<dyn Engine>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let shutdown = CancellationToken::new();
        let (state, origin) = match engine
            .get(CLUSTER_STATE_KEY)
            .context("load cluster snapshot")?
        {
            Some(bytes) => {
                let state = restart(directory::decode_state(&bytes)?, &address)?;
                (state, Origin::Restarted)
            }
            None if peers.is_empty() => (bootstrap(&address), Origin::Bootstrapped),
            None => {
                let state = join(&address, peers, &cfg, transport.as_ref(), &shutdown).await?;
                (state, Origin::Joined)
            }
        };
        let host = state.host().cloned().context("cluster state has no host")?;
        tracing::info!(
            id = host.id,
            generation = host.heartbeat.generation,
            key = %state.key,
            ?origin,
            "cluster opened"
        );

        let directory = Arc::new(Directory::with_state(state));
        let gossip = Arc::new(Gossip::new(
            directory.clone(),
            transport.clone(),
            cfg.request_timeout,
        ));
        let arbiter = Arbiter::new(
            transport,
            known_nodes(directory.clone()),
            cfg.clone(),
            directory.key(),
        );
        let cluster = Self {
            directory,
            gossip,
            arbiter,
            engine,
            cfg,
            origin,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        };
        cluster.flush()?;

        for peer in peers {
            if let Err(err) = cluster.gossip.gossip_once_with(peer).await {
                tracing::warn!(peer = %peer, error = ?err, "seed gossip failed");
            }
        }
        cluster.start();
        Ok(cluster)
    }

    fn start(&self) {
        let (tx, rx) = watch::channel(());
        self.directory.observe(move |_| {
            tx.send_replace(());
        });
        let flush = tokio::spawn(flush_loop(
            self.directory.clone(),
            self.engine.clone(),
            rx,
            self.cfg.flush_interval,
            self.shutdown.clone(),
        ));
        let gossip = self
            .gossip
            .clone()
            .spawn(self.cfg.gossip_interval, self.shutdown.clone());
        self.tasks.lock().unwrap().extend([flush, gossip]);
    }

    pub async fn handle(&self, req: Request) -> anyhow::Result<Response> {
        match req {
            Request::Gossip(msg) => self.gossip.handle(msg),
            Request::Pledge(req) => {
                let joiner = match &req {
                    PledgeRequest::Assign { address } => Some(address.clone()),
                    PledgeRequest::Propose { .. } => None,
                };
                let resp = self.arbiter.handle(req).await;
                // Count the new node before it gossips so later proposals
                // from here start above it.
                if let (PledgeResponse::Assigned { id, .. }, Some(address)) = (&resp, joiner) {
                    self.directory.merge([Node::new(*id, address)]);
                }
                Ok(Response::Pledge(resp))
            }
            other => Err(Error::Protocol(format!("cluster cannot handle {}", other.kind())).into()),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn key(&self) -> Uuid {
        self.directory.key()
    }

    pub fn host_id(&self) -> NodeId {
        self.directory.host_id()
    }

    pub fn host(&self) -> Option<Node> {
        self.directory.host()
    }

    pub fn node(&self, id: NodeId) -> Option<Node> {
        self.directory.get(id)
    }

    /// Copy of every known node.
    pub fn nodes(&self) -> NodeMap {
        self.directory.read_state(|state| state.nodes.clone())
    }

    /// Healthy nodes other than the host.
    pub fn healthy_peers(&self) -> Vec<Node> {
        self.directory
            .read_state(|state| state.healthy_peers().cloned().collect())
    }

    /// Nodes eligible to arbitrate.
    pub fn candidates(&self) -> NodeMap {
        self.directory.read_state(|state| {
            state
                .nodes
                .iter()
                .filter(|(_, node)| node.state != NodeState::Left)
                .map(|(id, node)| (*id, node.clone()))
                .collect()
        })
    }

    /// Run one membership gossip round now.
    pub async fn gossip_once(&self) -> anyhow::Result<()> {
        self.gossip.gossip_once().await
    }

    /// Write the current snapshot to the engine.
    pub fn flush(&self) -> anyhow::Result<()> {
        write_snapshot(&self.directory, self.engine.as_ref())
    }

    /// Leave the cluster and stop background tasks.
    ///
    /// The host is marked `Left` and gossiped once so peers stop picking it.
    /// The final snapshot is written after the tasks exit.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.directory.update_host(|host| host.state = NodeState::Left);
        if let Err(err) = self.gossip.gossip_once().await {
            tracing::debug!(error = ?err, "leave gossip failed");
        }
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "cluster task panicked");
            }
        }
        self.flush()
    }
}

fn known_nodes(directory: Arc<Directory>) -> KnownNodes {
    Arc::new(move || directory.read_state(|state| state.nodes.clone()))
}

fn restart(mut state: ClusterState, address: &Address) -> anyhow::Result<ClusterState> {
    let host_id = state.host_id;
    let host = state
        .nodes
        .get_mut(&host_id)
        .with_context(|| format!("snapshot has no record for host {host_id}"))?;
    host.heartbeat = host.heartbeat.restarted();
    host.state = NodeState::Healthy;
    host.address = address.clone();
    Ok(state)
}

fn bootstrap(address: &Address) -> ClusterState {
    let host = Node::new(1, address.clone());
    ClusterState {
        key: Uuid::new_v4(),
        host_id: host.id,
        nodes: [(host.id, host)].into_iter().collect(),
    }
}

async fn join(
    address: &Address,
    peers: &[Address],
    cfg: &ClusterConfig,
    transport: &dyn Transport,
    shutdown: &CancellationToken,
) -> anyhow::Result<ClusterState> {
    let cancel = shutdown.child_token();
    let timer = cfg.join_timeout.map(|limit| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            cancel.cancel();
        })
    });
    let res = pledge::pledge(transport, address, peers, cfg, &cancel).await;
    if let Some(timer) = timer {
        timer.abort();
    }
    let (id, key) = res.context("join cluster")?;
    let host = Node::new(id, address.clone());
    Ok(ClusterState {
        key,
        host_id: id,
        nodes: [(id, host)].into_iter().collect(),
    })
}

fn write_snapshot(directory: &Directory, engine: &dyn Engine) -> anyhow::Result<()> {
    let bytes = directory::encode_state(&directory.copy_state())?;
    engine
        .set(CLUSTER_STATE_KEY, &bytes)
        .context("write cluster snapshot")
}

async fn flush_loop(
    directory: Arc<Directory>,
    engine: Arc<dyn Engine>,
    mut changed: watch::Receiver<()>,
    interval: std::time::Duration,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = changed.changed() => if res.is_err() { break },
        }
        if let Err(err) = write_snapshot(&directory, engine.as_ref()) {
            tracing::warn!(error = ?err, "cluster snapshot flush failed");
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
