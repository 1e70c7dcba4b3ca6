//! Request/response transport seam.
//!
//! The cluster and KV layers are transport-agnostic: they only need to send a
//! `Request` to an address and get a `Response` back, and to register one
//! handler for inbound requests. `mem` provides an in-process network,
//! `tcp` a tokio TCP binding.

pub mod mem;
pub mod tcp;

use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::Address;
use crate::message::{Request, Response};

/// Server side of the transport.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request) -> anyhow::Result<Response>;
}

/// Client side of the transport, bound to one local address.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Address peers use to reach this endpoint.
    fn address(&self) -> &Address;

    /// Deliver `req` to `target` at most once and wait for its response.
    async fn send(&self, target: &Address, req: Request) -> anyhow::Result<Response>;

    /// Route inbound requests to `handler`, replacing any previous one.
    fn bind(&self, handler: Arc<dyn Handler>) -> anyhow::Result<()>;

    /// Stop accepting inbound requests.
    fn unbind(&self);
}
