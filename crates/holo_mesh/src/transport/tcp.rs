//! TCP binding: one length-delimited bincode frame per message.
//!
//! Each `send` opens a short-lived connection, writes the request frame and
//! waits for exactly one response frame. The server side accepts connections
//! until `unbind` and answers every request frame on a connection in order.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::{Handler, Transport};
use crate::cluster::Address;
use crate::error::Error;
use crate::message::{self, Request, Response};

/// Largest frame either side accepts. KV batches are bounded well below this.
pub const MAX_FRAME_LENGTH: usize = 64 << 20;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub struct TcpTransport {
    address: Address,
    timeout: Duration,
    listener: Mutex<Option<TcpListener>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    /// Listen on `addr`. Inbound requests are served once a handler is bound.
    pub async fn listen(addr: &str, timeout: Duration) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind {addr}"))?;
        let address = Address::from(listener.local_addr().context("listener address")?);
        Ok(Self {
            address,
            timeout,
            listener: Mutex::new(Some(listener)),
            shutdown: CancellationToken::new(),
        })
    }

    async fn call(&self, target: &Address, req: Request) -> anyhow::Result<Response> {
        let stream = TcpStream::connect(target.as_str())
            .await
            .with_context(|| format!("connect {target}"))?;
        stream.set_nodelay(true).ok();
        let mut framed = Framed::new(stream, codec());
        framed
            .send(Bytes::from(message::encode(&req)?))
            .await
            .with_context(|| format!("send {} to {target}", req.kind()))?;
        let frame = framed
            .next()
            .await
            .with_context(|| format!("{target} closed the connection"))?
            .with_context(|| format!("read response from {target}"))?;
        match message::decode::<Response>(&frame)? {
            Response::Error(message) => Err(Error::Remote(message).into()),
            resp => Ok(resp),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn send(&self, target: &Address, req: Request) -> anyhow::Result<Response> {
        tokio::time::timeout(self.timeout, self.call(target, req))
            .await
            .map_err(|_| anyhow::anyhow!("request to {target} timed out after {:?}", self.timeout))?
    }

    fn bind(&self, handler: Arc<dyn Handler>) -> anyhow::Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap()
            .take()
            .context("tcp listener already bound")?;
        let shutdown = self.shutdown.clone();
        tokio::spawn(accept_loop(listener, handler, shutdown));
        Ok(())
    }

    fn unbind(&self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(listener: TcpListener, handler: Arc<dyn Handler>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_conn(stream, handler, shutdown).await {
                            tracing::debug!(peer = %peer, error = ?err, "mesh connection closed");
                        }
                    });
                }
                Err(err) => tracing::warn!(error = ?err, "failed to accept mesh connection"),
            },
        }
    }
}

async fn serve_conn(
    stream: TcpStream,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    stream.set_nodelay(true).ok();
    let mut framed = Framed::new(stream, codec());
    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            frame = framed.next() => match frame {
                Some(frame) => frame.context("read request frame")?,
                None => return Ok(()),
            },
        };
        let resp = match message::decode::<Request>(&frame) {
            Ok(req) => match handler.handle(req).await {
                Ok(resp) => resp,
                Err(err) => Response::Error(format!("{err:#}")),
            },
            Err(err) => Response::Error(format!("malformed request: {err:#}")),
        };
        framed
            .send(Bytes::from(message::encode(&resp)?))
            .await
            .context("write response frame")?;
    }
}
