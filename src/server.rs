//! Connection acceptor and server lifecycle.
//!
//! A server moves through `Unbound → Bound → Serving → Draining → Stopped`.
//! While serving, every accepted connection gets a reader task that decodes
//! calls and a writer task that serializes replies back onto the socket.
//! Each call runs on its own task once it holds a worker permit, so at most
//! [`RpcConfig::max_concurrent_calls`] handlers execute at any moment.

use std::{
    future::Future,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures_util::{stream::SplitSink, FutureExt, SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, mpsc::OwnedPermit, watch, OwnedSemaphorePermit, Semaphore},
    time,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    context::CallContext,
    framed,
    registry::{DispatchRegistry, Handler},
    FramedStream, RpcConfig, RpcError, RpcRequest, RpcResponse, Status,
};

const REPLY_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    /// Constructed, no listener yet.
    Unbound,
    /// Listener open, not accepting calls.
    Bound,
    Serving,
    /// No new calls are read; in-flight calls are finishing or being cancelled.
    Draining,
    /// Terminal. A fresh server has to be constructed to serve again.
    Stopped,
}

struct Shared {
    state: watch::Sender<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Cancelled when shutdown begins; stops the accept loop and connection readers.
    accepting: CancellationToken,
    /// Parent of every call's token; cancelled to abort in-flight calls.
    force: CancellationToken,
    tracker: TaskTracker,
    stop_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    fn transition(&self, from: &[ServerState], to: ServerState) -> bool {
        self.state.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn local_addr(&self) -> MutexGuard<'_, Option<SocketAddr>> {
        self.local_addr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RpcServer {
    config: Arc<RpcConfig>,
    registry: DispatchRegistry,
    listener: Option<TcpListener>,
    shared: Arc<Shared>,
}

impl RpcServer {
    pub fn new(config: RpcConfig) -> Self {
        Self::with_registry(config, DispatchRegistry::new())
    }

    pub fn with_registry(config: RpcConfig, registry: DispatchRegistry) -> Self {
        let (state, _) = watch::channel(ServerState::Unbound);
        Self {
            config: Arc::new(config),
            registry,
            listener: None,
            shared: Arc::new(Shared {
                state,
                local_addr: Mutex::new(None),
                accepting: CancellationToken::new(),
                force: CancellationToken::new(),
                tracker: TaskTracker::new(),
                stop_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Registers a raw handler. Fails once the server has started serving.
    pub fn register<F, Fut>(&mut self, method: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(CallContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
    {
        self.ensure_registry_open()?;
        self.registry.register(method, handler)
    }

    pub fn register_typed<Req, Resp, F, Fut>(
        &mut self,
        method: &str,
        handler: F,
    ) -> Result<(), RpcError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RpcError>> + Send + 'static,
    {
        self.ensure_registry_open()?;
        self.registry.register_typed(method, handler)
    }

    fn ensure_registry_open(&self) -> Result<(), RpcError> {
        match self.state() {
            ServerState::Unbound | ServerState::Bound => Ok(()),
            _ => Err(RpcError::RegistryFrozen),
        }
    }

    pub fn registry(&self) -> &DispatchRegistry {
        &self.registry
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr()
    }

    /// A cloneable handle for stopping or awaiting the server from other tasks.
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
            signal_grace: self.config.shutdown_grace_period,
        }
    }

    /// Opens the listener on the configured address without serving yet.
    pub async fn bind(&mut self) -> Result<SocketAddr, RpcError> {
        match self.state() {
            ServerState::Unbound => {}
            ServerState::Bound => {
                return self.local_addr().ok_or_else(|| {
                    RpcError::InvalidState("bound server has no local address".to_string())
                })
            }
            state => {
                return Err(RpcError::InvalidState(format!(
                    "cannot bind a server that is {state:?}"
                )))
            }
        }
        self.config.validate()?;

        let listener = TcpListener::bind(self.config.bind_address.as_str())
            .await
            .map_err(|source| RpcError::BindError {
                addr: self.config.bind_address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        *self.shared.local_addr() = Some(local_addr);
        if !self
            .shared
            .transition(&[ServerState::Unbound], ServerState::Bound)
        {
            return Err(RpcError::InvalidState(
                "server was stopped while binding".to_string(),
            ));
        }
        self.listener = Some(listener);
        debug!(%local_addr, "listener bound");
        Ok(local_addr)
    }

    /// Binds if necessary and starts accepting calls in the background.
    ///
    /// Handling happens on spawned tasks; this returns as soon as the accept
    /// loop is running. Use [`RpcServer::await_termination`] to block.
    pub async fn start(&mut self) -> Result<SocketAddr, RpcError> {
        if self.state() == ServerState::Unbound {
            self.bind().await?;
        }
        let listener = match (self.state(), self.listener.take()) {
            (ServerState::Bound, Some(listener)) => listener,
            (state, _) => {
                return Err(RpcError::InvalidState(format!(
                    "cannot start a server that is {state:?}"
                )))
            }
        };
        let local_addr = listener.local_addr()?;

        if !self
            .shared
            .transition(&[ServerState::Bound], ServerState::Serving)
        {
            return Err(RpcError::InvalidState(
                "server was stopped before it started serving".to_string(),
            ));
        }

        let acceptor = Acceptor {
            registry: Arc::new(self.registry.clone()),
            workers: Arc::new(Semaphore::new(self.config.max_concurrent_calls)),
            config: self.config.clone(),
            shared: self.shared.clone(),
        };
        self.shared.tracker.spawn(acceptor.run(listener));

        println!("RPC server listening on {local_addr}");
        Ok(local_addr)
    }

    /// Starts the server and blocks until it is stopped or interrupted.
    pub async fn serve(mut self) -> Result<(), RpcError> {
        self.start().await?;
        self.await_termination().await;
        Ok(())
    }

    pub async fn stop(&self, grace: Duration) {
        self.handle().stop(grace).await
    }

    pub async fn await_termination(&self) {
        self.handle().await_termination().await
    }
}

#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
    signal_grace: Duration,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr()
    }

    /// Stops accepting connections and calls, then drains in-flight calls.
    ///
    /// With a zero `grace` in-flight calls are cancelled right away; otherwise
    /// they get up to `grace` to finish before being cancelled. Returns once the
    /// listener is closed and every connection task has exited. Calling it on
    /// a server that is already stopped does nothing.
    pub async fn stop(&self, grace: Duration) {
        let _guard = self.shared.stop_lock.lock().await;
        let shared = &self.shared;

        if shared.transition(
            &[ServerState::Unbound, ServerState::Bound],
            ServerState::Stopped,
        ) {
            shared.accepting.cancel();
            shared.force.cancel();
            debug!("server stopped before serving");
            return;
        }
        if !shared.transition(&[ServerState::Serving], ServerState::Draining) {
            return;
        }

        info!(grace_ms = grace.as_millis() as u64, "draining server");
        shared.accepting.cancel();
        shared.tracker.close();

        if grace.is_zero() {
            shared.force.cancel();
        } else if time::timeout(grace, shared.tracker.wait()).await.is_err() {
            warn!(
                tasks = shared.tracker.len(),
                "grace period elapsed, cancelling in-flight calls"
            );
            shared.force.cancel();
        }
        shared.tracker.wait().await;

        shared.transition(&[ServerState::Draining], ServerState::Stopped);
        info!("server stopped");
    }

    /// Resolves once the server has reached [`ServerState::Stopped`].
    pub async fn stopped(&self) {
        let mut state = self.shared.state.subscribe();
        // The sender lives in `shared`, which this handle keeps alive.
        let _ = state.wait_for(|s| *s == ServerState::Stopped).await;
    }

    /// Blocks until the server is stopped elsewhere or Ctrl-C is received.
    ///
    /// On Ctrl-C the server is stopped with the configured
    /// [`RpcConfig::shutdown_grace_period`].
    pub async fn await_termination(&self) {
        let stopped = self.stopped();
        tokio::pin!(stopped);

        tokio::select! {
            _ = &mut stopped => {}
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    info!("termination signal received");
                    self.stop(self.signal_grace).await;
                }
                Err(e) => {
                    warn!(error = %e, "unable to listen for termination signal");
                    stopped.await;
                }
            }
        }
    }
}

#[derive(Clone)]
struct Acceptor {
    registry: Arc<DispatchRegistry>,
    config: Arc<RpcConfig>,
    workers: Arc<Semaphore>,
    shared: Arc<Shared>,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shared.accepting.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(self.config.tcp_nodelay) {
                        debug!(%peer, error = %e, "failed to set TCP_NODELAY");
                    }
                    debug!(%peer, "accepted connection");
                    self.shared
                        .tracker
                        .spawn(self.clone().serve_connection(stream, peer));
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    // Persistent errors (fd exhaustion) would otherwise spin.
                    time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        debug!("listener closed");
    }

    async fn serve_connection(self, stream: TcpStream, peer: SocketAddr) {
        let (sink, mut frames) = framed(stream, self.config.max_frame_size).split();
        let (replies, outgoing) = mpsc::channel(REPLY_QUEUE_DEPTH);
        self.shared.tracker.spawn(write_replies(
            sink,
            outgoing,
            peer,
            self.config.max_frame_size,
            self.shared.force.clone(),
        ));

        loop {
            let frame = tokio::select! {
                _ = self.shared.accepting.cancelled() => break,
                frame = frames.next() => frame,
            };
            let bytes = match frame {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "closing connection after read error");
                    break;
                }
                None => break,
            };

            // Every call owns a reply slot before it runs, so a peer that stops
            // reading stalls only its own reader.
            let slot = tokio::select! {
                _ = self.shared.accepting.cancelled() => break,
                slot = replies.clone().reserve_owned() => match slot {
                    Ok(slot) => slot,
                    Err(_) => break,
                },
            };

            let request = match bincode::deserialize::<RpcRequest>(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    warn!(%peer, error = %e, "received malformed request");
                    if let Ok(id) = bincode::deserialize::<u64>(&bytes) {
                        slot.send(RpcResponse::error(id, Status::InvalidRequest, e.to_string()));
                    }
                    continue;
                }
            };

            let permit = tokio::select! {
                _ = self.shared.accepting.cancelled() => {
                    slot.send(RpcResponse::error(
                        request.id(),
                        Status::Cancelled,
                        "server is shutting down",
                    ));
                    break;
                }
                permit = self.workers.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.shared
                .tracker
                .spawn(self.clone().run_call(request, peer, slot, permit));
        }
        debug!(%peer, "connection reader finished");
    }

    async fn run_call(
        self,
        request: RpcRequest,
        peer: SocketAddr,
        slot: OwnedPermit<RpcResponse>,
        permit: OwnedSemaphorePermit,
    ) {
        let (id, method, params, timeout) = request.into_parts();
        let reply = match self.registry.resolve(&method) {
            Ok(handler) => {
                let deadline = timeout.map(|timeout| Instant::now() + timeout);
                let ctx = CallContext::for_call(
                    id,
                    method.as_str(),
                    peer,
                    deadline,
                    self.shared.force.child_token(),
                );
                execute(handler, ctx, params).await
            }
            Err(e) => {
                debug!(%peer, %method, "call for unknown method");
                RpcResponse::from_result(id, Err(e))
            }
        };
        drop(permit);

        // Never waits: the slot was reserved before the call was dispatched.
        slot.send(reply);
    }
}

/// Runs one handler invocation to a reply, whatever happens to it.
async fn execute(handler: Handler, ctx: CallContext, params: Vec<u8>) -> RpcResponse {
    let id = ctx.id();
    let call = AssertUnwindSafe(handler(ctx.clone(), params)).catch_unwind();
    let expired = async {
        match ctx.deadline() {
            Some(deadline) => time::sleep_until(time::Instant::from_std(deadline)).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        outcome = call => match outcome {
            Ok(result) => RpcResponse::from_result(id, result),
            Err(_) => {
                warn!(method = ctx.method(), id, "handler panicked");
                RpcResponse::error(id, Status::Internal, "handler panicked")
            }
        },
        _ = ctx.cancelled() => {
            RpcResponse::error(id, Status::Cancelled, "call cancelled by server shutdown")
        }
        _ = expired => {
            ctx.cancel();
            RpcResponse::error(id, Status::DeadlineExceeded, "deadline exceeded")
        }
    }
}

async fn write_replies(
    mut sink: SplitSink<FramedStream, Bytes>,
    mut outgoing: mpsc::Receiver<RpcResponse>,
    peer: SocketAddr,
    max_frame_size: usize,
    force: CancellationToken,
) {
    while let Some(reply) = outgoing.recv().await {
        let mut data = match bincode::serialize(&reply) {
            Ok(data) => data,
            Err(e) => {
                warn!(%peer, error = %e, "failed to encode reply");
                continue;
            }
        };
        if data.len() > max_frame_size {
            warn!(%peer, id = reply.id(), size = data.len(), "reply exceeds frame limit");
            let too_large = RpcResponse::error(reply.id(), Status::Internal, "reply too large");
            data = match bincode::serialize(&too_large) {
                Ok(data) => data,
                Err(_) => continue,
            };
        }
        // A peer that stops reading can stall the socket indefinitely; once
        // calls are being cancelled the connection is abandoned instead.
        let written = tokio::select! {
            biased;
            written = sink.send(Bytes::from(data)) => written,
            _ = force.cancelled() => {
                debug!(%peer, "dropping connection with unwritten replies");
                return;
            }
        };
        if let Err(e) = written {
            debug!(%peer, error = %e, "failed to write reply");
            break;
        }
    }
    tokio::select! {
        biased;
        _ = sink.close() => {}
        _ = force.cancelled() => {}
    }
}
