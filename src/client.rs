//! Client side of a connection: one multiplexed TCP stream per client.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::{lookup_host, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{framed, FramedStream, RpcConfig, RpcError, RpcRequest, RpcResponse};

#[derive(Default)]
struct PendingState {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<RpcResponse>>,
}

/// Calls waiting for a reply, keyed by request id.
#[derive(Default)]
struct PendingCalls {
    inner: Mutex<PendingState>,
}

impl PendingCalls {
    fn lock(&self) -> MutexGuard<'_, PendingState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, id: u64) -> Result<oneshot::Receiver<RpcResponse>, RpcError> {
        let mut state = self.lock();
        if state.closed {
            return Err(RpcError::ConnectionError("connection closed".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.insert(id, tx);
        Ok(rx)
    }

    fn forget(&self, id: u64) {
        self.lock().waiters.remove(&id);
    }

    fn complete(&self, response: RpcResponse) {
        let waiter = self.lock().waiters.remove(&response.id());
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(id = response.id(), "discarding reply for abandoned call"),
        }
    }

    /// Fails every outstanding call and refuses new ones.
    fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.waiters.clear();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

pub struct RpcClient {
    writer: tokio::sync::Mutex<SplitSink<FramedStream, Bytes>>,
    pending: Arc<PendingCalls>,
    reader: JoinHandle<()>,
    peer_addr: SocketAddr,
    config: RpcConfig,
    next_id: AtomicU64,
}

impl RpcClient {
    /// Opens a connection to `connect_addr`.
    ///
    /// Fails with [`RpcError::ConnectionError`] if nothing accepts the
    /// connection within [`RpcConfig::connect_timeout`].
    pub async fn connect(connect_addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        let stream = match time::timeout(config.connect_timeout, TcpStream::connect(connect_addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(RpcError::ConnectionError(format!(
                    "failed to connect to {connect_addr}: {e}"
                )))
            }
            Err(_) => {
                return Err(RpcError::ConnectionError(format!(
                    "timed out connecting to {connect_addr}"
                )))
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        let (sink, frames) = framed(stream, config.max_frame_size).split();
        let pending = Arc::new(PendingCalls::default());
        let reader = tokio::spawn(read_replies(frames, pending.clone(), connect_addr));
        debug!(peer = %connect_addr, "connected");

        Ok(Self {
            writer: tokio::sync::Mutex::new(sink),
            pending,
            reader,
            peer_addr: connect_addr,
            config,
            next_id: AtomicU64::new(1),
        })
    }

    /// Resolves `target` (`host:port`) and connects to the first address that answers.
    pub async fn connect_to(target: &str, config: RpcConfig) -> Result<Self, RpcError> {
        let addrs = lookup_host(target)
            .await
            .map_err(|e| RpcError::ConnectionError(format!("failed to resolve {target}: {e}")))?;

        let mut last_error = None;
        for addr in addrs {
            match Self::connect(addr, config.clone()).await {
                Ok(client) => return Ok(client),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            RpcError::ConnectionError(format!("{target} did not resolve to any address"))
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// False once the server has closed the connection.
    pub fn is_connected(&self) -> bool {
        !self.pending.is_closed()
    }

    /// Calls `method` with the configured default timeout.
    pub async fn call(&self, method: &str, params: Vec<u8>) -> Result<Vec<u8>, RpcError> {
        self.call_with_timeout(method, params, self.config.default_call_timeout)
            .await
    }

    /// Sends one call and waits at most `timeout` for its reply.
    ///
    /// The timeout is also sent to the server, which abandons the call once
    /// it expires.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        params: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = RpcRequest::new(id, method.to_string(), params).with_timeout(timeout);
        let request_data = bincode::serialize(&request)?;
        let reply = self.pending.register(id)?;

        let exchange = async {
            {
                let mut writer = self.writer.lock().await;
                writer
                    .send(Bytes::from(request_data))
                    .await
                    .map_err(|e| RpcError::ConnectionError(e.to_string()))?;
            }
            reply.await.map_err(|_| {
                RpcError::ConnectionError("connection closed before reply".to_string())
            })
        };

        match time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => response.into_result(),
            Ok(Err(e)) => {
                self.pending.forget(id);
                Err(e)
            }
            Err(_) => {
                self.pending.forget(id);
                debug!(id, method, "call timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Encodes `request`, calls `method` and decodes the reply.
    pub async fn call_typed<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let params = bincode::serialize(request)?;
        let reply = self.call(method, params).await?;
        Ok(bincode::deserialize(&reply)?)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_replies(
    mut frames: SplitStream<FramedStream>,
    pending: Arc<PendingCalls>,
    peer: SocketAddr,
) {
    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(%peer, error = %e, "read error, closing connection");
                break;
            }
        };
        match bincode::deserialize::<RpcResponse>(&bytes) {
            Ok(response) => pending.complete(response),
            Err(e) => warn!(%peer, error = %e, "received malformed reply"),
        }
    }
    debug!(%peer, "connection closed by server");
    pending.close();
}
