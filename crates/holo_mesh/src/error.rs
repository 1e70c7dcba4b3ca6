//! Errors callers need to tell apart.
//!
//! Everything else travels as plain `anyhow::Error` with context attached.
//! These variants are wrapped in `anyhow::Error` as well and recovered with
//! `err.downcast_ref::<Error>()`.

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Error {
    /// Fewer healthy candidates than the quorum needs.
    #[error("quorum unreachable: {healthy} healthy candidates, quorum is {quorum}")]
    QuorumUnreachable { healthy: usize, quorum: usize },

    /// Every proposal round was rejected by at least one juror.
    #[error("no proposal approved after {attempts} attempts")]
    ProposalsExhausted { attempts: usize },

    /// A juror refused a proposed node id.
    #[error("proposal for node id {0} rejected")]
    ProposalRejected(NodeId),

    /// A write named a leaseholder different from the one on record.
    #[error("lease for key {key:?} is held by node {held} and cannot move to node {requested}")]
    LeaseNotTransferable {
        key: String,
        held: NodeId,
        requested: NodeId,
    },

    #[error("key not found")]
    KeyNotFound,

    /// The node has not finished opening yet.
    #[error("node not ready")]
    NotReady,

    #[error("operation cancelled")]
    Cancelled,

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// A peer replied with a message of the wrong kind.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Error reported by a peer's handler.
    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    /// Find a typed error anywhere in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&Error> {
        err.chain().find_map(|cause| cause.downcast_ref::<Error>())
    }
}
