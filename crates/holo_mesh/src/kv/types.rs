//! Replication unit of the KV layer and its compact digest.

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

/// Leaseholder value meaning "not specified by the writer".
pub const NO_LEASEHOLDER: NodeId = 0;

/// Encoded size of an operation apart from its key and value bytes.
const OPERATION_OVERHEAD: usize = 36;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    #[default]
    Set,
    Delete,
}

/// One write as it travels through the pipeline.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub variant: Variant,
    /// Stamped by the leaseholder; 0 until assigned.
    pub version: u64,
    pub leaseholder: NodeId,
}

impl Operation {
    pub fn set(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            variant: Variant::Set,
            ..Default::default()
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            variant: Variant::Delete,
            ..Default::default()
        }
    }

    pub fn with_leaseholder(mut self, leaseholder: NodeId) -> Self {
        self.leaseholder = leaseholder;
        self
    }

    pub fn digest(&self) -> Digest {
        Digest {
            key: self.key.clone(),
            version: self.version,
            leaseholder: self.leaseholder,
            variant: self.variant,
        }
    }

    /// Bytes this operation takes inside an encoded batch.
    pub fn wire_size(&self) -> usize {
        self.key.len() + self.value.len() + OPERATION_OVERHEAD
    }

    /// Does this operation win over the state summarised by `current`?
    pub fn supersedes(&self, current: &Digest) -> bool {
        (self.version, self.leaseholder) > (current.version, current.leaseholder)
    }
}

/// Compact operation summary, also the persisted conflict-resolution record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub key: Vec<u8>,
    pub version: u64,
    pub leaseholder: NodeId,
    pub variant: Variant,
}

impl Digest {
    /// Storage form. The key is implied by where the record lives.
    pub fn encode_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + 8 + 1);
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&self.leaseholder.to_be_bytes());
        out.push(match self.variant {
            Variant::Set => 0,
            Variant::Delete => 1,
        });
        out
    }

    pub fn decode_record(key: &[u8], data: &[u8]) -> anyhow::Result<Self> {
        let mut offset = 0usize;
        let version = read_u64(data, &mut offset)?;
        let leaseholder = read_u64(data, &mut offset)?;
        let variant = match read_u8(data, &mut offset)? {
            0 => Variant::Set,
            1 => Variant::Delete,
            other => anyhow::bail!("unknown digest variant {other}"),
        };
        anyhow::ensure!(offset == data.len(), "trailing bytes in digest record");
        Ok(Self {
            key: key.to_vec(),
            version,
            leaseholder,
            variant,
        })
    }
}

/// Operations headed to, or exchanged with, one peer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub sender: NodeId,
    pub operations: Vec<Operation>,
}

/// Digests of operations a peer has run through its filter.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Feedback {
    pub sender: NodeId,
    pub digests: Vec<Digest>,
}

fn read_u8(data: &[u8], offset: &mut usize) -> anyhow::Result<u8> {
    anyhow::ensure!(*offset < data.len(), "short u8");
    let out = data[*offset];
    *offset += 1;
    Ok(out)
}

fn read_u64(data: &[u8], offset: &mut usize) -> anyhow::Result<u64> {
    anyhow::ensure!(*offset + 8 <= data.len(), "short u64");
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[*offset..*offset + 8]);
    *offset += 8;
    Ok(u64::from_be_bytes(buf))
}
