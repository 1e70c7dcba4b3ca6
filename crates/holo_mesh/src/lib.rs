//! Self-organizing cluster substrate.
//!
//! Nodes discover each other through push-pull gossip, obtain unique ids
//! through a leaderless quorum pledge, and replicate a leased key-value store
//! with last-writer-wins versions and bounded epidemic retransmission.
//! `Node` wires both layers onto one `Transport` and one storage `Engine`.

pub mod cluster;
pub mod config;
pub mod error;
pub mod kv;
pub mod message;
pub mod node;
pub mod storage;
pub mod transport;

pub use cluster::{Address, Cluster, NodeId};
pub use config::{ClusterConfig, KvConfig, NodeConfig};
pub use error::Error;
pub use kv::Kv;
pub use node::Node;
