//! Epidemic propagation of applied writes.
//!
//! Every applied operation is staged as infected. The emitter pushes the whole
//! infected set to one random healthy peer per tick, and the peer answers with
//! its own infected set. Whoever filters a batch reports the digests back to
//! the sender as feedback. Once an operation has been reported more than
//! `recovery_threshold` times it is recovered and no longer pushed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::seq::{IteratorRandom, SliceRandom};

use super::types::{Batch, Digest, Feedback, Operation};
use crate::cluster::{Address, Directory, NodeId};
use crate::error::Error;
use crate::message::Request;
use crate::transport::Transport;

struct Staged {
    op: Operation,
    feedback: u32,
}

/// Infected operations, one per key.
pub struct Outgoing {
    entries: Mutex<HashMap<Vec<u8>, Staged>>,
    recovery_threshold: u32,
}

impl Outgoing {
    pub fn new(recovery_threshold: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            recovery_threshold,
        }
    }

    /// Stage `op` unless a newer operation for its key is already staged.
    pub fn stage(&self, op: Operation) {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&op.key) {
            Some(staged) if !op.supersedes(&staged.op.digest()) => {}
            _ => {
                entries.insert(op.key.clone(), Staged { op, feedback: 0 });
            }
        }
    }

    /// Copy of every infected operation.
    pub fn infected(&self) -> Vec<Operation> {
        self.entries
            .lock()
            .unwrap()
            .values()
            .map(|staged| staged.op.clone())
            .collect()
    }

    /// Infected operations split into batches of at most `max_bytes`. An
    /// operation larger than the limit travels alone.
    pub fn batches(&self, max_bytes: usize) -> Vec<Vec<Operation>> {
        split(self.infected(), max_bytes)
    }

    /// Random infected operations that fit in `max_bytes`.
    pub fn sample(&self, max_bytes: usize) -> Vec<Operation> {
        let mut ops = self.infected();
        ops.shuffle(&mut rand::thread_rng());
        split(ops, max_bytes).into_iter().next().unwrap_or_default()
    }

    /// Count feedback for staged operations. Returns how many recovered.
    pub fn observe(&self, digests: &[Digest]) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let mut recovered = 0;
        for digest in digests {
            let Some(staged) = entries.get_mut(&digest.key) else {
                continue;
            };
            if staged.op.version != digest.version || staged.op.leaseholder != digest.leaseholder {
                continue;
            }
            staged.feedback += 1;
            if staged.feedback > self.recovery_threshold {
                entries.remove(&digest.key);
                recovered += 1;
            }
        }
        recovered
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn split(ops: Vec<Operation>, max_bytes: usize) -> Vec<Vec<Operation>> {
    let mut batches: Vec<Vec<Operation>> = Vec::new();
    let mut size = 0;
    for op in ops {
        let len = op.wire_size();
        match batches.last_mut() {
            Some(batch) if size + len <= max_bytes => {
                size += len;
                batch.push(op);
            }
            _ => {
                size = len;
                batches.push(vec![op]);
            }
        }
    }
    batches
}

/// Network side of KV gossip.
pub struct KvGossip {
    host_id: NodeId,
    directory: Arc<Directory>,
    transport: Arc<dyn Transport>,
    request_timeout: Duration,
}

impl KvGossip {
    pub fn new(
        host_id: NodeId,
        directory: Arc<Directory>,
        transport: Arc<dyn Transport>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            host_id,
            directory,
            transport,
            request_timeout,
        }
    }

    pub fn random_peer(&self) -> Option<Address> {
        self.directory.read_state(|state| {
            state
                .healthy_peers()
                .choose(&mut rand::thread_rng())
                .map(|node| node.address.clone())
        })
    }

    /// Push `operations` to `peer` and return its infected set.
    pub async fn push(&self, peer: &Address, operations: Vec<Operation>) -> anyhow::Result<Batch> {
        let batch = Batch {
            sender: self.host_id,
            operations,
        };
        tokio::time::timeout(
            self.request_timeout,
            self.transport.send(peer, Request::Batch(batch)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("kv push to {peer} timed out"))??
        .into_batch()
    }

    /// Hand `operations` to their leaseholder and wait for it to apply them.
    /// Returns the operations the leaseholder accepted, as stamped.
    pub async fn forward(
        &self,
        leaseholder: NodeId,
        operations: Vec<Operation>,
    ) -> anyhow::Result<Batch> {
        let node = self
            .directory
            .get(leaseholder)
            .ok_or(Error::UnknownNode(leaseholder))?;
        let batch = Batch {
            sender: self.host_id,
            operations,
        };
        tokio::time::timeout(
            self.request_timeout,
            self.transport.send(&node.address, Request::LeaseForward(batch)),
        )
        .await
        .map_err(|_| anyhow::anyhow!("lease forward to node {leaseholder} timed out"))??
        .into_batch()
    }

    /// Report `digests` to `sender` in the background.
    pub fn feedback(&self, sender: NodeId, digests: Vec<Digest>) {
        if digests.is_empty() || sender == self.host_id {
            return;
        }
        let Some(node) = self.directory.get(sender) else {
            tracing::debug!(sender, "feedback target unknown");
            return;
        };
        let transport = self.transport.clone();
        let timeout = self.request_timeout;
        let feedback = Feedback {
            sender: self.host_id,
            digests,
        };
        tokio::spawn(async move {
            let res = tokio::time::timeout(
                timeout,
                transport.send(&node.address, Request::Feedback(feedback)),
            )
            .await;
            match res {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::debug!(sender, error = ?err, "feedback delivery failed"),
                Err(_) => tracing::debug!(sender, "feedback delivery timed out"),
            }
        });
    }
}
