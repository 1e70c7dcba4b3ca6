//! Leaseholder assignment for writes.

use std::sync::Arc;

use super::types::{Operation, Variant, NO_LEASEHOLDER};
use super::version::stored_digest;
use crate::cluster::NodeId;
use crate::error::Error;
use crate::storage::Engine;

pub struct LeaseAllocator {
    engine: Arc<dyn Engine>,
    host_id: NodeId,
}

impl LeaseAllocator {
    pub fn new(engine: Arc<dyn Engine>, host_id: NodeId) -> Self {
        Self { engine, host_id }
    }

    /// Fill in or validate `op.leaseholder` against the lease on record.
    ///
    /// A key keeps its first leaseholder forever. Without a record the writer
    /// may name one; otherwise a set defaults to the local host and a delete
    /// has nothing to act on.
    pub fn allocate(&self, op: &mut Operation) -> anyhow::Result<()> {
        match stored_digest(self.engine.as_ref(), &op.key)? {
            Some(digest) if op.leaseholder == NO_LEASEHOLDER => {
                op.leaseholder = digest.leaseholder;
            }
            Some(digest) if op.leaseholder != digest.leaseholder => {
                return Err(Error::LeaseNotTransferable {
                    key: String::from_utf8_lossy(&op.key).into_owned(),
                    held: digest.leaseholder,
                    requested: op.leaseholder,
                }
                .into());
            }
            Some(_) => {}
            None if op.leaseholder != NO_LEASEHOLDER => {}
            None => match op.variant {
                Variant::Set => op.leaseholder = self.host_id,
                Variant::Delete => return Err(Error::KeyNotFound.into()),
            },
        }
        Ok(())
    }
}
