//! Versioned node directory.
//!
//! The directory owns the single `ClusterState` of a process. Readers get
//! copies (or a borrowed view for the duration of a closure); writers replace
//! the state under the lock and then notify observers with the new state.
//! Nothing outside this module can hold on to the inner map.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::{ClusterState, Node, NodeId};

type Observer = Arc<dyn Fn(&ClusterState) + Send + Sync>;

#[derive(Default)]
pub struct Directory {
    state: RwLock<ClusterState>,
    observers: Mutex<Vec<Observer>>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ClusterState) -> Self {
        Self {
            state: RwLock::new(state),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Register a callback run after every state change.
    pub fn observe(&self, observer: impl Fn(&ClusterState) + Send + Sync + 'static) {
        self.observers.lock().unwrap().push(Arc::new(observer));
    }

    pub fn get(&self, id: NodeId) -> Option<Node> {
        self.state.read().unwrap().nodes.get(&id).cloned()
    }

    /// Overwrite the record for `node.id`.
    pub fn set(&self, node: Node) {
        self.update(|state| {
            state.nodes.insert(node.id, node);
            true
        });
    }

    /// Apply every node whose heartbeat is strictly more recent than ours.
    ///
    /// Returns the number of records that changed.
    pub fn merge(&self, group: impl IntoIterator<Item = Node>) -> usize {
        let mut changed = 0;
        self.update(|state| {
            for node in group {
                let newer = match state.nodes.get(&node.id) {
                    Some(existing) => node.heartbeat.is_newer_than(&existing.heartbeat),
                    None => true,
                };
                if newer {
                    state.nodes.insert(node.id, node);
                    changed += 1;
                }
            }
            changed > 0
        });
        changed
    }

    /// Record `node` as the local host.
    pub fn set_host(&self, node: Node) {
        self.update(|state| {
            state.host_id = node.id;
            state.nodes.insert(node.id, node);
            true
        });
    }

    pub fn host(&self) -> Option<Node> {
        let state = self.state.read().unwrap();
        state.host().cloned()
    }

    pub fn host_id(&self) -> NodeId {
        self.state.read().unwrap().host_id
    }

    pub fn key(&self) -> Uuid {
        self.state.read().unwrap().key
    }

    /// Mutate the host record and bump its heartbeat version.
    pub fn update_host(&self, f: impl FnOnce(&mut Node)) -> Option<Node> {
        let mut out = None;
        self.update(|state| {
            let host_id = state.host_id;
            let Some(host) = state.nodes.get_mut(&host_id) else {
                return false;
            };
            f(host);
            host.heartbeat = host.heartbeat.bumped();
            out = Some(host.clone());
            true
        });
        out
    }

    /// True once a host has been assigned.
    pub fn valid(&self) -> bool {
        let state = self.state.read().unwrap();
        state.host_id != 0 && state.nodes.contains_key(&state.host_id)
    }

    /// Deep copy of the current state, safe to keep.
    pub fn copy_state(&self) -> ClusterState {
        self.state.read().unwrap().clone()
    }

    /// Borrow the current state for the duration of `f`.
    ///
    /// `f` must not call back into the directory.
    pub fn read_state<R>(&self, f: impl FnOnce(&ClusterState) -> R) -> R {
        let state = self.state.read().unwrap();
        f(&state)
    }

    /// Replace the whole state.
    pub fn set_state(&self, next: ClusterState) {
        self.update(move |state| {
            *state = next;
            true
        });
    }

    fn update(&self, f: impl FnOnce(&mut ClusterState) -> bool) {
        let snapshot = {
            let mut state = self.state.write().unwrap();
            if !f(&mut state) {
                return;
            }
            state.clone()
        };
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer(&snapshot);
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    key: Uuid,
    host_id: NodeId,
}

/// Serialize a state as a header followed by one record per node.
pub fn encode_state(state: &ClusterState) -> anyhow::Result<Vec<u8>> {
    let mut out = serde_json::to_vec(&SnapshotHeader {
        key: state.key,
        host_id: state.host_id,
    })
    .context("encode cluster snapshot header")?;
    for node in state.nodes.values() {
        out.push(b'\n');
        serde_json::to_writer(&mut out, node).context("encode cluster snapshot node")?;
    }
    Ok(out)
}

/// Decode a snapshot written by [`encode_state`], reading nodes until the end.
pub fn decode_state(data: &[u8]) -> anyhow::Result<ClusterState> {
    let mut stream = serde_json::Deserializer::from_slice(data).into_iter::<serde_json::Value>();
    let header = stream
        .next()
        .context("cluster snapshot is empty")?
        .context("decode cluster snapshot header")?;
    let header: SnapshotHeader =
        serde_json::from_value(header).context("decode cluster snapshot header")?;
    let mut state = ClusterState {
        key: header.key,
        host_id: header.host_id,
        nodes: Default::default(),
    };
    for value in stream {
        let node: Node = serde_json::from_value(value.context("decode cluster snapshot node")?)
            .context("decode cluster snapshot node")?;
        state.nodes.insert(node.id, node);
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cluster::types::{Heartbeat, NodeState};

    fn node(id: NodeId, generation: u32, version: u32) -> Node {
        let mut node = Node::new(id, format!("node-{id}"));
        node.heartbeat = Heartbeat::new(generation, version);
        node
    }

    #[test]
    fn merge_only_applies_strictly_newer_records() {
        let dir = Directory::new();
        dir.set(node(1, 1, 5));

        let mut stale = node(1, 1, 4);
        stale.state = NodeState::Dead;
        let mut equal = node(1, 1, 5);
        equal.state = NodeState::Dead;
        assert_eq!(dir.merge([stale, equal]), 0);
        assert_eq!(dir.get(1).unwrap().state, NodeState::Healthy);
        assert_eq!(dir.get(1).unwrap().heartbeat, Heartbeat::new(1, 5));

        assert_eq!(dir.merge([node(1, 2, 0), node(2, 0, 0)]), 2);
        assert_eq!(dir.get(1).unwrap().heartbeat, Heartbeat::new(2, 0));
        assert!(dir.get(2).is_some());
    }

    #[test]
    fn copies_are_detached_from_the_directory() {
        let dir = Directory::new();
        dir.set_host(node(1, 0, 0));
        let mut copy = dir.copy_state();
        copy.nodes.clear();
        assert!(dir.valid());
        assert_eq!(dir.read_state(|s| s.nodes.len()), 1);
    }

    #[test]
    fn observers_see_every_change() {
        let dir = Directory::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        dir.observe(move |state| {
            assert!(!state.nodes.is_empty());
            seen.fetch_add(1, Ordering::SeqCst);
        });
        dir.set_host(node(1, 0, 0));
        dir.update_host(|host| host.state = NodeState::Suspect);
        // Stale merges change nothing and notify nobody.
        dir.merge([node(1, 0, 0)]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(dir.host().unwrap().heartbeat, Heartbeat::new(0, 1));
    }

    #[test]
    fn snapshot_roundtrip_keeps_host_and_nodes() {
        let mut state = ClusterState {
            key: Uuid::new_v4(),
            host_id: 2,
            nodes: Default::default(),
        };
        for id in 1..=3 {
            state.nodes.insert(id, node(id, 1, id as u32));
        }
        let decoded = decode_state(&encode_state(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn snapshot_without_nodes_decodes_empty() {
        let state = ClusterState::default();
        let decoded = decode_state(&encode_state(&state).unwrap()).unwrap();
        assert!(decoded.nodes.is_empty());
        assert!(decode_state(b"").is_err());
    }
}
