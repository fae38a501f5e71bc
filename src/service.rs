//! The `EmiService`: message types, the `Start` handler and a typed client.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{CallContext, RpcClient, RpcConfig, RpcError, RpcServer};

pub const START_METHOD: &str = "EmiService.Start";
pub const STOP_METHOD: &str = "EmiService.Stop";

/// Command sent when a caller does not supply one.
pub const DEFAULT_COMMAND: &str = "RUN2";

/// Status reported by a successful `Start`.
pub const STATUS_STARTED: i32 = 0;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub command: String,
}

impl StartRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StartResponse {
    pub status: i32,
    pub message: String,
}

impl StartResponse {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StopRequest {
    pub command: String,
}

impl StopRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct StopResponse {
    pub status: i32,
    pub message: String,
}

impl StopResponse {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// Server-side implementation of the service.
#[async_trait]
pub trait EmiService: Send + Sync + 'static {
    async fn start(&self, ctx: CallContext, request: StartRequest)
        -> Result<StartResponse, RpcError>;
}

/// Acknowledges every command with `"Started: <command>"`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEmiService;

#[async_trait]
impl EmiService for DefaultEmiService {
    async fn start(
        &self,
        _ctx: CallContext,
        request: StartRequest,
    ) -> Result<StartResponse, RpcError> {
        Ok(started(&request))
    }
}

pub fn started(request: &StartRequest) -> StartResponse {
    StartResponse::new(STATUS_STARTED, format!("Started: {}", request.command))
}

/// Registers every method of `service` on `server`.
///
/// Only `Start` is served; `Stop` calls against such a server fail with
/// [`RpcError::UnknownMethod`].
pub fn add_emi_service<S: EmiService>(server: &mut RpcServer, service: S) -> Result<(), RpcError> {
    let service = Arc::new(service);
    server.register_typed(START_METHOD, move |ctx, request: StartRequest| {
        let service = service.clone();
        async move { service.start(ctx, request).await }
    })
}

/// Typed client for the service.
pub struct EmiServiceClient {
    inner: RpcClient,
}

impl EmiServiceClient {
    pub async fn connect(addr: SocketAddr, config: RpcConfig) -> Result<Self, RpcError> {
        Ok(Self::from_client(RpcClient::connect(addr, config).await?))
    }

    pub async fn connect_to(target: &str, config: RpcConfig) -> Result<Self, RpcError> {
        Ok(Self::from_client(RpcClient::connect_to(target, config).await?))
    }

    pub fn from_client(inner: RpcClient) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &RpcClient {
        &self.inner
    }

    pub async fn start(&self, request: StartRequest) -> Result<StartResponse, RpcError> {
        self.inner.call_typed(START_METHOD, &request).await
    }

    pub async fn stop(&self, request: StopRequest) -> Result<StopResponse, RpcError> {
        self.inner.call_typed(STOP_METHOD, &request).await
    }
}
