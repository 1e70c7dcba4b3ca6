//! Version stamping and last-writer-wins filtering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Context;

use super::types::{Digest, Operation, Variant};
use crate::storage::{digest_key, Engine, WriteBatch, VERSION_COUNTER_KEY};

/// Persisted digest of `key`, if any write for it was ever applied.
pub fn stored_digest(engine: &dyn Engine, key: &[u8]) -> anyhow::Result<Option<Digest>> {
    match engine.get(&digest_key(key)).context("read digest")? {
        Some(bytes) => Ok(Some(Digest::decode_record(key, &bytes)?)),
        None => Ok(None),
    }
}

/// Stamps operations from the durable per-node counter.
pub struct VersionAssigner {
    engine: Arc<dyn Engine>,
}

impl VersionAssigner {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Give `ops` consecutive fresh versions with one counter increment.
    pub fn assign(&self, ops: &mut [Operation]) -> anyhow::Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let n = ops.len() as u64;
        let last = self
            .engine
            .increment(VERSION_COUNTER_KEY, n)
            .context("advance version counter")?;
        let first = last - n + 1;
        for (i, op) in ops.iter_mut().enumerate() {
            op.version = first + i as u64;
        }
        Ok(())
    }
}

/// Result of running a batch through the filter.
#[derive(Debug, Default)]
pub struct Outcome {
    pub accepted: Vec<Operation>,
    pub rejected: Vec<Operation>,
}

impl Outcome {
    /// Digests of every operation, accepted or not.
    pub fn digests(&self) -> Vec<Digest> {
        self.accepted
            .iter()
            .chain(&self.rejected)
            .map(Operation::digest)
            .collect()
    }
}

/// Accepts an operation only if it beats the stored digest for its key, and
/// persists accepted operations with their digests in one batch.
pub struct VersionFilter {
    engine: Arc<dyn Engine>,
    apply_lock: Mutex<()>,
}

impl VersionFilter {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            apply_lock: Mutex::new(()),
        }
    }

    pub fn apply(&self, ops: Vec<Operation>) -> anyhow::Result<Outcome> {
        let _guard = self.apply_lock.lock().unwrap();
        let mut outcome = Outcome::default();
        let mut latest: HashMap<Vec<u8>, Digest> = HashMap::new();
        for op in ops {
            let current = match latest.get(&op.key) {
                Some(digest) => Some(digest.clone()),
                None => stored_digest(self.engine.as_ref(), &op.key)?,
            };
            let accept = match &current {
                Some(current) => op.supersedes(current),
                None => true,
            };
            if accept {
                latest.insert(op.key.clone(), op.digest());
                outcome.accepted.push(op);
            } else {
                outcome.rejected.push(op);
            }
        }

        if !outcome.accepted.is_empty() {
            let mut batch = WriteBatch::new();
            for op in &outcome.accepted {
                match op.variant {
                    Variant::Set => batch.set(op.key.clone(), op.value.clone()),
                    Variant::Delete => batch.delete(op.key.clone()),
                }
                batch.set(digest_key(&op.key), op.digest().encode_record());
            }
            self.engine.commit(batch).context("persist accepted operations")?;
        }
        Ok(outcome)
    }
}
