//! Durable byte-keyed storage used as backing store.
//!
//! The replication layer only needs point reads/writes, all-or-nothing
//! batches and one atomically incremented counter. `MemEngine` keeps
//! everything in a map (tests, embedders); `FjallEngine` persists to disk.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use fjall::{Keyspace, PartitionCreateOptions, PersistMode};

/// Prefix shared by every key the mesh reserves for itself.
pub const RESERVED_PREFIX: &[u8] = b"\0holo/";
/// Key under which the cluster snapshot is stored.
pub const CLUSTER_STATE_KEY: &[u8] = b"\0holo/cluster/state";
/// Key of the process-wide KV version counter.
pub const VERSION_COUNTER_KEY: &[u8] = b"\0holo/kv/version";
/// Prefix of the per-key digest namespace.
pub const DIGEST_PREFIX: &[u8] = b"\0holo/kv/digest/";

/// True for keys in the reserved namespace.
pub fn is_reserved(key: &[u8]) -> bool {
    key.starts_with(RESERVED_PREFIX)
}

/// Key that holds the digest companion record of `key`.
pub fn digest_key(key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DIGEST_PREFIX.len() + key.len());
    out.extend_from_slice(DIGEST_PREFIX);
    out.extend_from_slice(key);
    out
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Ordered set of writes applied atomically.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Set {
            key: key.into(),
            value: value.into(),
        });
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub trait Engine: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;
    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()>;
    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;
    /// Apply every write in `batch` or none of them.
    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()>;
    /// Atomically add `delta` to the counter at `key` and return the new value.
    fn increment(&self, key: &[u8], delta: u64) -> anyhow::Result<u64>;
}

/// In-memory engine.
#[derive(Default)]
pub struct MemEngine {
    inner: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn Engine> {
        Arc::new(Self::new())
    }
}

impl Engine for MemEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.read().unwrap().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.inner.write().unwrap().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.inner.write().unwrap().remove(key);
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        let mut guard = self.inner.write().unwrap();
        for op in batch.ops {
            match op {
                WriteOp::Set { key, value } => {
                    guard.insert(key, value);
                }
                WriteOp::Delete { key } => {
                    guard.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn increment(&self, key: &[u8], delta: u64) -> anyhow::Result<u64> {
        let mut guard = self.inner.write().unwrap();
        let current = match guard.get(key) {
            Some(bytes) => decode_counter(bytes)?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .context("version counter overflow")?;
        guard.insert(key.to_vec(), next.to_be_bytes().to_vec());
        Ok(next)
    }
}

/// fjall-backed engine storing everything in one partition.
pub struct FjallEngine {
    keyspace: Keyspace,
    data: fjall::PartitionHandle,
    counter_lock: Mutex<()>,
}

impl FjallEngine {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let keyspace = fjall::Config::new(path.as_ref())
            .open()
            .context("open fjall keyspace")?;
        Self::with_keyspace(keyspace)
    }

    pub fn with_keyspace(keyspace: Keyspace) -> anyhow::Result<Self> {
        let data = keyspace
            .open_partition("mesh", PartitionCreateOptions::default())
            .context("open mesh partition")?;
        Ok(Self {
            keyspace,
            data,
            counter_lock: Mutex::new(()),
        })
    }

    /// Flush the journal to disk.
    pub fn persist(&self) -> anyhow::Result<()> {
        self.keyspace
            .persist(PersistMode::SyncAll)
            .context("persist fjall keyspace")
    }
}

impl Engine for FjallEngine {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        let value = self.data.get(key).context("fjall read")?;
        Ok(value.map(|slice| slice.to_vec()))
    }

    fn set(&self, key: &[u8], value: &[u8]) -> anyhow::Result<()> {
        self.data
            .insert(key.to_vec(), value.to_vec())
            .context("fjall write")
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.data.remove(key.to_vec()).context("fjall delete")
    }

    fn commit(&self, batch: WriteBatch) -> anyhow::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut out = self.keyspace.batch();
        for op in batch.ops {
            match op {
                WriteOp::Set { key, value } => out.insert(&self.data, key, value),
                WriteOp::Delete { key } => out.remove(&self.data, key),
            }
        }
        out.commit().context("fjall batch commit")
    }

    fn increment(&self, key: &[u8], delta: u64) -> anyhow::Result<u64> {
        let _guard = self.counter_lock.lock().unwrap();
        let current = match self.data.get(key).context("fjall counter read")? {
            Some(bytes) => decode_counter(&bytes)?,
            None => 0,
        };
        let next = current
            .checked_add(delta)
            .context("version counter overflow")?;
        self.data
            .insert(key.to_vec(), next.to_be_bytes().to_vec())
            .context("fjall counter write")?;
        Ok(next)
    }
}

fn decode_counter(bytes: &[u8]) -> anyhow::Result<u64> {
    anyhow::ensure!(bytes.len() == 8, "counter record must be 8 bytes, got {}", bytes.len());
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(buf))
}
