//! Replicated key-value store.
//!
//! Write path: lease allocation, then either a lease-forward to a remote
//! leaseholder or, locally, version assignment, filtering, persistence and
//! staging for gossip. Remote batches enter at the filter and produce
//! feedback for their sender whatever the outcome.

pub mod gossip;
pub mod lease;
pub mod types;
pub mod version;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use self::types::{Batch, Digest, Feedback, Operation, Variant, NO_LEASEHOLDER};

use self::gossip::{KvGossip, Outgoing};
use self::lease::LeaseAllocator;
use self::version::{Outcome, VersionAssigner, VersionFilter};
use crate::cluster::{Directory, NodeId};
use crate::config::KvConfig;
use crate::error::Error;
use crate::message::{Request, Response};
use crate::storage::{is_reserved, Engine};
use crate::transport::Transport;

pub struct Kv {
    host_id: NodeId,
    engine: Arc<dyn Engine>,
    lease: LeaseAllocator,
    assigner: VersionAssigner,
    filter: VersionFilter,
    outgoing: Outgoing,
    gossip: KvGossip,
    cfg: KvConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Kv {
    /// Build the pipeline for `host_id` and start the gossip emitter.
    pub fn open(
        host_id: NodeId,
        engine: Arc<dyn Engine>,
        directory: Arc<Directory>,
        transport: Arc<dyn Transport>,
        cfg: KvConfig,
    ) -> Arc<Self> {
        let kv = Arc::new(Self {
            host_id,
            lease: LeaseAllocator::new(engine.clone(), host_id),
            assigner: VersionAssigner::new(engine.clone()),
            filter: VersionFilter::new(engine.clone()),
            outgoing: Outgoing::new(cfg.recovery_threshold),
            gossip: KvGossip::new(host_id, directory, transport, cfg.request_timeout),
            engine,
            cfg,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        let emitter = tokio::spawn(emit_loop(kv.clone()));
        kv.tasks.lock().unwrap().push(emitter);
        kv
    }

    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        check_key(key)?;
        self.engine.get(key)
    }

    /// Persisted digest of `key`.
    pub fn digest(&self, key: &[u8]) -> anyhow::Result<Option<Digest>> {
        check_key(key)?;
        version::stored_digest(self.engine.as_ref(), key)
    }

    pub async fn set(&self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        self.commit(vec![Operation::set(key, value)]).await
    }

    pub async fn set_with_lease(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        leaseholder: NodeId,
    ) -> anyhow::Result<()> {
        self.commit(vec![Operation::set(key, value).with_leaseholder(leaseholder)])
            .await
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> anyhow::Result<()> {
        self.commit(vec![Operation::delete(key)]).await
    }

    /// Commit `ops`, grouped by leaseholder.
    ///
    /// The local group is applied atomically. Remote groups are forwarded to
    /// their leaseholders one after another, and what each leaseholder
    /// accepted is applied here too so the lease is on record locally. A
    /// failure stops the commit but does not undo groups already applied.
    pub async fn commit(&self, ops: Vec<Operation>) -> anyhow::Result<()> {
        let mut groups: BTreeMap<NodeId, Vec<Operation>> = BTreeMap::new();
        for mut op in ops {
            check_key(&op.key)?;
            self.lease.allocate(&mut op)?;
            groups.entry(op.leaseholder).or_default().push(op);
        }
        if let Some(local) = groups.remove(&self.host_id) {
            self.originate(local)?;
        }
        for (leaseholder, ops) in groups {
            let applied = self.gossip.forward(leaseholder, ops).await?;
            self.absorb(applied)?;
        }
        Ok(())
    }

    /// Stamp, filter, persist and stage operations this node leases.
    fn originate(&self, mut ops: Vec<Operation>) -> anyhow::Result<Outcome> {
        self.assigner.assign(&mut ops)?;
        let outcome = self.filter.apply(ops)?;
        for op in &outcome.rejected {
            tracing::debug!(
                key = %String::from_utf8_lossy(&op.key),
                version = op.version,
                "local write superseded by a newer record"
            );
        }
        self.stage(&outcome);
        Ok(outcome)
    }

    /// Filter a batch from `sender`, then report every digest back to it.
    fn absorb(&self, batch: Batch) -> anyhow::Result<Outcome> {
        let outcome = self.filter.apply(batch.operations)?;
        self.stage(&outcome);
        self.gossip.feedback(batch.sender, outcome.digests());
        Ok(outcome)
    }

    fn stage(&self, outcome: &Outcome) {
        for op in &outcome.accepted {
            self.outgoing.stage(op.clone());
        }
    }

    pub async fn handle(&self, req: Request) -> anyhow::Result<Response> {
        match req {
            Request::Batch(batch) => {
                let reply = Batch {
                    sender: self.host_id,
                    operations: self.outgoing.sample(self.cfg.max_batch_bytes),
                };
                self.absorb(batch)?;
                Ok(Response::Batch(reply))
            }
            Request::Feedback(feedback) => {
                let recovered = self.outgoing.observe(&feedback.digests);
                if recovered > 0 {
                    tracing::trace!(sender = feedback.sender, recovered, "operations recovered");
                }
                Ok(Response::Ack)
            }
            Request::LeaseForward(batch) => {
                let mut ops = batch.operations;
                for op in &mut ops {
                    if op.leaseholder != self.host_id {
                        return Err(Error::Protocol(format!(
                            "node {} received a write leased to node {}",
                            self.host_id, op.leaseholder
                        ))
                        .into());
                    }
                    check_key(&op.key)?;
                    self.lease.allocate(op)?;
                }
                let outcome = self.originate(ops)?;
                Ok(Response::Batch(Batch {
                    sender: self.host_id,
                    operations: outcome.accepted,
                }))
            }
            other => Err(Error::Protocol(format!("kv cannot handle {}", other.kind())).into()),
        }
    }

    /// Push the infected set to one random healthy peer, in size-bounded
    /// batches, and absorb each reply. An empty set still pulls once.
    pub async fn gossip_once(&self) -> anyhow::Result<()> {
        let Some(peer) = self.gossip.random_peer() else {
            return Ok(());
        };
        let mut batches = self.outgoing.batches(self.cfg.max_batch_bytes);
        if batches.is_empty() {
            batches.push(Vec::new());
        }
        for operations in batches {
            let reply = self.gossip.push(&peer, operations).await?;
            self.absorb(reply)?;
        }
        Ok(())
    }

    /// Operations still being gossiped.
    pub fn infected(&self) -> Vec<Operation> {
        self.outgoing.infected()
    }

    pub fn host_id(&self) -> NodeId {
        self.host_id
    }

    pub async fn close(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = ?err, "kv task panicked");
            }
        }
    }
}

fn check_key(key: &[u8]) -> anyhow::Result<()> {
    anyhow::ensure!(!key.is_empty(), "empty key");
    anyhow::ensure!(!is_reserved(key), "key is in the reserved namespace");
    Ok(())
}

async fn emit_loop(kv: Arc<Kv>) {
    let mut ticker = tokio::time::interval(kv.cfg.gossip_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = kv.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        tokio::select! {
            _ = kv.shutdown.cancelled() => break,
            res = kv.gossip_once() => {
                if let Err(err) = res {
                    tracing::debug!(error = ?err, "kv gossip round failed");
                }
            }
        }
    }
}
