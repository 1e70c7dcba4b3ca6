//! Runtime configuration for cluster membership, KV replication and nodes.

use std::time::Duration;

use crate::cluster::Address;

/// Membership gossip and pledge tuning.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Interval between periodic membership gossip rounds.
    pub gossip_interval: Duration,
    /// First retry delay used by a pledging node.
    pub pledge_base_interval: Duration,
    /// Geometric growth applied to the pledge retry delay per attempt.
    pub pledge_retry_scale: f64,
    /// Upper bound on the pledge retry delay (jitter excluded).
    pub pledge_max_interval: Duration,
    /// Maximum proposal rounds a responsible runs for one pledge.
    pub max_proposals: usize,
    /// Timeout for one jury consult.
    pub quorum_timeout: Duration,
    /// Timeout for any single request/response exchange.
    pub request_timeout: Duration,
    /// Give up joining after this long. `None` retries until closed.
    pub join_timeout: Option<Duration>,
    /// Minimum spacing between cluster snapshot writes.
    pub flush_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(1),
            pledge_base_interval: Duration::from_secs(1),
            pledge_retry_scale: 1.5,
            pledge_max_interval: Duration::from_secs(30),
            max_proposals: 10,
            quorum_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(2),
            join_timeout: None,
            flush_interval: Duration::from_secs(1),
        }
    }
}

impl ClusterConfig {
    /// Retry delay before pledge attempt `attempt` (0-based), without jitter.
    pub fn pledge_backoff(&self, attempt: u32) -> Duration {
        let scale = self.pledge_retry_scale.max(1.0).powi(attempt.min(64) as i32);
        let scaled = self.pledge_base_interval.as_secs_f64() * scale;
        Duration::from_secs_f64(scaled.min(self.pledge_max_interval.as_secs_f64()))
    }
}

/// KV replication tuning.
#[derive(Clone, Debug)]
pub struct KvConfig {
    /// Interval between outgoing KV gossip pushes.
    pub gossip_interval: Duration,
    /// Feedback count after which a staged operation is considered recovered.
    pub recovery_threshold: u32,
    /// Timeout for batch, feedback and lease-forward exchanges.
    pub request_timeout: Duration,
    /// Upper bound on the encoded operations in one gossip batch. A push
    /// larger than this is split across several requests.
    pub max_batch_bytes: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            gossip_interval: Duration::from_secs(1),
            recovery_threshold: 5,
            request_timeout: Duration::from_secs(2),
            max_batch_bytes: 1 << 20,
        }
    }
}

/// Everything needed to open a node.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Address this node is reachable at.
    pub address: Address,
    /// Seed peers contacted when joining. Empty means bootstrap.
    pub peers: Vec<Address>,
    pub cluster: ClusterConfig,
    pub kv: KvConfig,
}

impl NodeConfig {
    pub fn new(address: impl Into<Address>) -> Self {
        Self {
            address: address.into(),
            peers: Vec::new(),
            cluster: ClusterConfig::default(),
            kv: KvConfig::default(),
        }
    }

    pub fn with_peers(mut self, peers: impl IntoIterator<Item = Address>) -> Self {
        self.peers = peers.into_iter().collect();
        self
    }

    /// Shrink every interval for in-process clusters.
    pub fn fast(mut self) -> Self {
        let tick = Duration::from_millis(20);
        self.cluster.gossip_interval = tick;
        self.cluster.pledge_base_interval = tick;
        self.cluster.pledge_max_interval = Duration::from_millis(200);
        self.cluster.quorum_timeout = Duration::from_millis(250);
        self.cluster.request_timeout = Duration::from_millis(500);
        self.cluster.flush_interval = tick;
        self.kv.gossip_interval = tick;
        self.kv.request_timeout = Duration::from_millis(500);
        self
    }
}
