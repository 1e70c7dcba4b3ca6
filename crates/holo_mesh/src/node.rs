//! One mesh node: cluster membership and KV replication behind one transport.
//!
//! The router is bound before the cluster opens so a bootstrapping node can
//! answer its own jury requests. Until both layers are installed it answers
//! `Error::NotReady`.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use crate::cluster::{Address, Cluster, NodeId};
use crate::config::NodeConfig;
use crate::error::Error;
use crate::kv::Kv;
use crate::message::{Request, Response};
use crate::storage::Engine;
use crate::transport::{Handler, Transport};

#[derive(Default)]
struct Router {
    cluster: OnceLock<Arc<Cluster>>,
    kv: OnceLock<Arc<Kv>>,
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, req: Request) -> anyhow::Result<Response> {
        match req {
            Request::Gossip(_) | Request::Pledge(_) => {
                let cluster = self.cluster.get().ok_or(Error::NotReady)?;
                cluster.handle(req).await
            }
            Request::Batch(_) | Request::Feedback(_) | Request::LeaseForward(_) => {
                let kv = self.kv.get().ok_or(Error::NotReady)?;
                kv.handle(req).await
            }
        }
    }
}

pub struct Node {
    cluster: Arc<Cluster>,
    kv: Arc<Kv>,
    transport: Arc<dyn Transport>,
}

impl Node {
    pub async fn open(
        cfg: NodeConfig,
        engine: Arc<dyn Engine>,
        transport: Arc<dyn Transport>,
    ) -> anyhow::Result<Self> {
        let router = Arc::new(Router::default());
        transport.bind(router.clone())?;

        let cluster = match Cluster::open(
            cfg.address.clone(),
            &cfg.peers,
            cfg.cluster.clone(),
            engine.clone(),
            transport.clone(),
        )
        .await
        {
            Ok(cluster) => Arc::new(cluster),
            Err(err) => {
                transport.unbind();
                return Err(err);
            }
        };
        let _ = router.cluster.set(cluster.clone());

        let kv = Kv::open(
            cluster.host_id(),
            engine,
            cluster.directory().clone(),
            transport.clone(),
            cfg.kv,
        );
        let _ = router.kv.set(kv.clone());

        Ok(Self {
            cluster,
            kv,
            transport,
        })
    }

    pub fn id(&self) -> NodeId {
        self.cluster.host_id()
    }

    pub fn address(&self) -> &Address {
        self.transport.address()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn kv(&self) -> &Arc<Kv> {
        &self.kv
    }

    /// Leave the cluster, stop every background task and stop serving.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.kv.close().await;
        let res = self.cluster.close().await;
        self.transport.unbind();
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemEngine;
    use crate::transport::mem::MemNetwork;

    #[tokio::test]
    async fn router_answers_not_ready_until_opened() {
        let router = Router::default();
        let err = router
            .handle(Request::Feedback(Default::default()))
            .await
            .unwrap_err();
        assert_eq!(Error::find(&err), Some(&Error::NotReady));
    }

    #[tokio::test]
    async fn failed_join_releases_the_address() {
        let net = MemNetwork::new();
        let mut cfg = NodeConfig::new("b").with_peers([Address::from("a")]).fast();
        cfg.cluster.join_timeout = Some(std::time::Duration::from_millis(100));
        let res = Node::open(cfg, MemEngine::shared(), net.endpoint("b")).await;
        assert!(res.is_err());
        assert!(!net.is_bound(&Address::from("b")));
    }

    #[tokio::test]
    async fn single_node_serves_reads_and_writes() {
        let net = MemNetwork::new();
        let node = Node::open(NodeConfig::new("a").fast(), MemEngine::shared(), net.endpoint("a"))
            .await
            .unwrap();
        assert_eq!(node.id(), 1);
        node.kv().set("k", "v").await.unwrap();
        assert_eq!(node.kv().get(b"k").unwrap(), Some(b"v".to_vec()));
        node.close().await.unwrap();
        assert!(!net.is_bound(node.address()));
    }
}
