//! Membership data model shared by the directory, gossip and pledge layers.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cluster-unique node identifier, assigned once through a pledge.
pub type NodeId = u64;

/// Network address a node is reachable at.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<std::net::SocketAddr> for Address {
    fn from(value: std::net::SocketAddr) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    Healthy,
    Suspect,
    Dead,
    Left,
}

/// Freshness marker of a node record.
///
/// Field order matters: the derived ordering compares `generation` first and
/// then `version`, so a greater heartbeat is always the more recent record.
/// A restart bumps the generation and resets the version, which still sorts
/// after every heartbeat of the previous generation.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Heartbeat {
    pub generation: u32,
    pub version: u32,
}

impl Heartbeat {
    pub const fn new(generation: u32, version: u32) -> Self {
        Self {
            generation,
            version,
        }
    }

    /// Is this heartbeat strictly more recent than `other`?
    pub fn is_newer_than(&self, other: &Heartbeat) -> bool {
        self > other
    }

    /// Is this heartbeat strictly staler than `other`?
    pub fn is_older_than(&self, other: &Heartbeat) -> bool {
        self < other
    }

    /// Heartbeat after one local mutation. An exhausted version rolls over
    /// into the next generation.
    pub fn bumped(self) -> Self {
        match self.version.checked_add(1) {
            Some(version) => Self {
                generation: self.generation,
                version,
            },
            None => self.restarted(),
        }
    }

    /// Heartbeat of the next process incarnation.
    pub fn restarted(self) -> Self {
        Self {
            generation: self.generation.saturating_add(1),
            version: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub address: Address,
    pub state: NodeState,
    pub heartbeat: Heartbeat,
}

impl Node {
    pub fn new(id: NodeId, address: impl Into<Address>) -> Self {
        Self {
            id,
            address: address.into(),
            state: NodeState::Healthy,
            heartbeat: Heartbeat::default(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state == NodeState::Healthy
    }

    pub fn digest(&self) -> Digest {
        Digest {
            id: self.id,
            heartbeat: self.heartbeat,
        }
    }
}

/// Compact node summary exchanged in the first gossip phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    pub id: NodeId,
    pub heartbeat: Heartbeat,
}

pub type NodeMap = BTreeMap<NodeId, Node>;
pub type DigestMap = BTreeMap<NodeId, Heartbeat>;

/// Root membership aggregate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub key: Uuid,
    /// Id of the local node; 0 until a pledge or bootstrap assigns one.
    pub host_id: NodeId,
    pub nodes: NodeMap,
}

impl ClusterState {
    pub fn host(&self) -> Option<&Node> {
        self.nodes.get(&self.host_id)
    }

    /// Digests of every known node.
    pub fn digests(&self) -> DigestMap {
        self.nodes
            .values()
            .map(|node| (node.id, node.heartbeat))
            .collect()
    }

    /// Healthy nodes other than the host.
    pub fn healthy_peers(&self) -> impl Iterator<Item = &Node> {
        let host_id = self.host_id;
        self.nodes
            .values()
            .filter(move |node| node.id != host_id && node.is_healthy())
    }

    pub fn max_id(&self) -> NodeId {
        self.nodes.keys().next_back().copied().unwrap_or(0)
    }
}
