//! Wire messages exchanged between nodes.
//!
//! Every message is an explicitly tagged variant; receivers never infer a
//! message kind from which fields happen to be populated.

use serde::{Deserialize, Serialize};

use crate::cluster::gossip::GossipMessage;
use crate::cluster::pledge::{PledgeRequest, PledgeResponse};
use crate::error::Error;
use crate::kv::types::{Batch, Feedback};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Membership anti-entropy (sync or ack2).
    Gossip(GossipMessage),
    /// Node id assignment or a vote on a proposed id.
    Pledge(PledgeRequest),
    /// Push of infected KV operations; answered with the receiver's own set.
    Batch(Batch),
    /// Digests of operations a peer has processed.
    Feedback(Feedback),
    /// Writes handed to their leaseholder; answered with the operations it
    /// accepted.
    LeaseForward(Batch),
}

impl Request {
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Gossip(_) => "gossip",
            Request::Pledge(_) => "pledge",
            Request::Batch(_) => "batch",
            Request::Feedback(_) => "feedback",
            Request::LeaseForward(_) => "lease_forward",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Gossip(GossipMessage),
    Pledge(PledgeResponse),
    Batch(Batch),
    /// Empty acknowledgement for one-way messages.
    Ack,
    /// Handler failure reported by the peer.
    Error(String),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Gossip(_) => "gossip",
            Response::Pledge(_) => "pledge",
            Response::Batch(_) => "batch",
            Response::Ack => "ack",
            Response::Error(_) => "error",
        }
    }

    pub fn into_gossip(self) -> anyhow::Result<GossipMessage> {
        match self {
            Response::Gossip(msg) => Ok(msg),
            other => Err(other.unexpected("gossip")),
        }
    }

    pub fn into_pledge(self) -> anyhow::Result<PledgeResponse> {
        match self {
            Response::Pledge(resp) => Ok(resp),
            other => Err(other.unexpected("pledge")),
        }
    }

    pub fn into_batch(self) -> anyhow::Result<Batch> {
        match self {
            Response::Batch(batch) => Ok(batch),
            other => Err(other.unexpected("batch")),
        }
    }

    pub fn into_ack(self) -> anyhow::Result<()> {
        match self {
            Response::Ack => Ok(()),
            other => Err(other.unexpected("ack")),
        }
    }

    fn unexpected(self, wanted: &str) -> anyhow::Error {
        match self {
            Response::Error(message) => Error::Remote(message).into(),
            other => Error::Protocol(format!("expected {wanted} response, got {}", other.kind()))
                .into(),
        }
    }
}

/// Binary encoding used by network bindings.
pub fn encode<T: Serialize>(msg: &T) -> anyhow::Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::gossip::SyncMessage;

    #[test]
    fn error_responses_surface_as_remote_errors() {
        let err = Response::Error("boom".into()).into_ack().unwrap_err();
        assert_eq!(Error::find(&err), Some(&Error::Remote("boom".into())));
    }

    #[test]
    fn mismatched_responses_are_protocol_errors() {
        let err = Response::Ack.into_batch().unwrap_err();
        assert!(matches!(Error::find(&err), Some(Error::Protocol(_))));
    }

    #[test]
    fn requests_survive_binary_encoding() {
        let req = Request::Gossip(GossipMessage::Sync(SyncMessage::default()));
        let bytes = encode(&req).unwrap();
        assert_eq!(decode::<Request>(&bytes).unwrap(), req);
    }
}
