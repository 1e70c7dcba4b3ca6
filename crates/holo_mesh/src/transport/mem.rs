//! In-process network.
//!
//! Requests are delivered by calling the target's handler directly, so
//! dropping the sending future also cancels the remote handling. Links can be
//! cut in both directions to model partitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::{Handler, Transport};
use crate::cluster::Address;
use crate::message::{Request, Response};

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<Address, Arc<dyn Handler>>,
    cut: HashSet<(Address, Address)>,
}

/// Shared in-memory network.
#[derive(Clone, Default)]
pub struct MemNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Endpoint reachable at `address`.
    pub fn endpoint(&self, address: impl Into<Address>) -> Arc<MemTransport> {
        Arc::new(MemTransport {
            network: self.clone(),
            address: address.into(),
        })
    }

    /// Cut the link between `a` and `b` in both directions.
    pub fn partition(&self, a: impl Into<Address>, b: impl Into<Address>) {
        let (a, b) = (a.into(), b.into());
        let mut state = self.state.write().unwrap();
        state.cut.insert((a.clone(), b.clone()));
        state.cut.insert((b, a));
    }

    pub fn heal(&self, a: impl Into<Address>, b: impl Into<Address>) {
        let (a, b) = (a.into(), b.into());
        let mut state = self.state.write().unwrap();
        state.cut.remove(&(a.clone(), b.clone()));
        state.cut.remove(&(b, a));
    }

    pub fn is_bound(&self, address: &Address) -> bool {
        self.state.read().unwrap().handlers.contains_key(address)
    }

    fn route(&self, from: &Address, to: &Address) -> anyhow::Result<Arc<dyn Handler>> {
        let state = self.state.read().unwrap();
        if state.cut.contains(&(from.clone(), to.clone())) {
            anyhow::bail!("link {from} -> {to} is partitioned");
        }
        state
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no endpoint bound at {to}"))
    }
}

pub struct MemTransport {
    network: MemNetwork,
    address: Address,
}

#[async_trait]
impl Transport for MemTransport {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn send(&self, target: &Address, req: Request) -> anyhow::Result<Response> {
        let handler = self.network.route(&self.address, target)?;
        handler.handle(req).await
    }

    fn bind(&self, handler: Arc<dyn Handler>) -> anyhow::Result<()> {
        let mut state = self.network.state.write().unwrap();
        state.handlers.insert(self.address.clone(), handler);
        Ok(())
    }

    fn unbind(&self) {
        let mut state = self.network.state.write().unwrap();
        state.handlers.remove(&self.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, req: Request) -> anyhow::Result<Response> {
            match req {
                Request::Feedback(_) => Ok(Response::Ack),
                other => Ok(Response::Error(other.kind().to_string())),
            }
        }
    }

    fn feedback() -> Request {
        Request::Feedback(Default::default())
    }

    #[tokio::test]
    async fn delivers_to_bound_handlers_only() {
        let net = MemNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        assert!(a.send(b.address(), feedback()).await.is_err());

        b.bind(Arc::new(Echo)).unwrap();
        assert_eq!(a.send(b.address(), feedback()).await.unwrap(), Response::Ack);

        b.unbind();
        assert!(!net.is_bound(b.address()));
        assert!(a.send(b.address(), feedback()).await.is_err());
    }

    #[tokio::test]
    async fn partitions_cut_both_directions() {
        let net = MemNetwork::new();
        let a = net.endpoint("a");
        let b = net.endpoint("b");
        a.bind(Arc::new(Echo)).unwrap();
        b.bind(Arc::new(Echo)).unwrap();

        net.partition("a", "b");
        assert!(a.send(b.address(), feedback()).await.is_err());
        assert!(b.send(a.address(), feedback()).await.is_err());

        net.heal("a", "b");
        assert!(a.send(b.address(), feedback()).await.is_ok());
    }
}
