use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::warn;

pub mod client;
pub mod context;
pub mod registry;
pub mod server;
pub mod service;

pub use client::RpcClient;
pub use context::CallContext;
pub use registry::{DispatchRegistry, Handler};
pub use server::{RpcServer, ServerHandle, ServerState};

pub mod runtime {
    //! The runtime the server demo runs on.
    use std::{io, thread};

    use tokio::runtime::{Builder, Runtime};

    pub const SERVER_THREADS_ENV: &str = "EMIRPC_SERVER_THREADS";
    pub const WORKER_THREAD_NAME: &str = "emirpc-worker";

    /// `EMIRPC_SERVER_THREADS` when set and valid, otherwise one thread per CPU.
    pub fn server_worker_threads() -> usize {
        crate::positive_from_env(SERVER_THREADS_ENV)
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, |n| n.get()))
    }

    pub fn build_server_runtime() -> io::Result<Runtime> {
        Builder::new_multi_thread()
            .worker_threads(server_worker_threads())
            .thread_name(WORKER_THREAD_NAME)
            .enable_all()
            .build()
    }
}

#[cfg(not(test))]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(test)]
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Bind address used when nothing else is configured; the tutorial's port.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:50051";

/// Number of calls the server runs at once, matching a ten-thread pool.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 10;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Failed to bind {addr}: {source}")]
    BindError {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Request timeout")]
    Timeout,

    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Method already registered: {0}")]
    DuplicateMethod(String),

    /// A handler rejected the call; the string is sent back to the caller.
    #[error("Application error: {0}")]
    Application(String),

    #[error("Remote error ({status}): {message}")]
    RemoteError { status: Status, message: String },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Handlers cannot be registered after the server has started")]
    RegistryFrozen,

    #[error("Invalid server state: {0}")]
    InvalidState(String),
}

/// Outcome of a call as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Ok,
    UnknownMethod,
    InvalidRequest,
    ApplicationError,
    DeadlineExceeded,
    Cancelled,
    Internal,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// Maps a server-side failure onto the status reported to the caller.
    pub fn from_error(error: &RpcError) -> Self {
        match error {
            RpcError::UnknownMethod(_) => Status::UnknownMethod,
            RpcError::SerializationError(_) => Status::InvalidRequest,
            RpcError::Application(_) => Status::ApplicationError,
            RpcError::Timeout => Status::DeadlineExceeded,
            RpcError::RemoteError { status, .. } => *status,
            _ => Status::Internal,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Ok => "ok",
            Status::UnknownMethod => "unknown method",
            Status::InvalidRequest => "invalid request",
            Status::ApplicationError => "application error",
            Status::DeadlineExceeded => "deadline exceeded",
            Status::Cancelled => "cancelled",
            Status::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcRequest {
    id: u64,
    method: String,
    params: Vec<u8>,
    timeout_ms: Option<u64>,
}

impl RpcRequest {
    pub fn new(id: u64, method: String, params: Vec<u8>) -> Self {
        Self {
            id,
            method,
            params,
            timeout_ms: None,
        }
    }

    /// Asks the server to give up on the call once `timeout` has passed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn params(&self) -> &[u8] {
        &self.params
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn into_parts(self) -> (u64, String, Vec<u8>, Option<Duration>) {
        let timeout = self.timeout();
        (self.id, self.method, self.params, timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcResponse {
    id: u64,
    status: Status,
    payload: Vec<u8>,
    message: Option<String>,
}

impl RpcResponse {
    pub fn new(id: u64, status: Status, payload: Vec<u8>, message: Option<String>) -> Self {
        Self {
            id,
            status,
            payload,
            message,
        }
    }

    pub fn ok(id: u64, payload: Vec<u8>) -> Self {
        Self::new(id, Status::Ok, payload, None)
    }

    pub fn error(id: u64, status: Status, message: impl Into<String>) -> Self {
        Self::new(id, status, Vec::new(), Some(message.into()))
    }

    pub fn from_result(id: u64, result: Result<Vec<u8>, RpcError>) -> Self {
        match result {
            Ok(data) => Self::ok(id, data),
            Err(e) => {
                let status = Status::from_error(&e);
                let message = match e {
                    RpcError::UnknownMethod(method) => method,
                    RpcError::Application(detail) => detail,
                    RpcError::RemoteError { message, .. } => message,
                    other => other.to_string(),
                };
                Self::error(id, status, message)
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Turns a reply back into the caller-facing result.
    pub fn into_result(self) -> Result<Vec<u8>, RpcError> {
        let message = self.message.unwrap_or_default();
        match self.status {
            Status::Ok => Ok(self.payload),
            Status::UnknownMethod => Err(RpcError::UnknownMethod(message)),
            status => Err(RpcError::RemoteError { status, message }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub bind_address: String,

    /// Upper bound on calls executing at the same time across all connections.
    pub max_concurrent_calls: usize,

    pub max_frame_size: usize,

    pub default_call_timeout: Duration,

    pub connect_timeout: Duration,

    /// Grace period used when a termination signal stops the server.
    pub shutdown_grace_period: Duration,

    pub tcp_nodelay: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ADDRESS)
    }
}

impl RpcConfig {
    pub const BIND_ADDRESS_ENV: &'static str = "EMIRPC_BIND_ADDRESS";
    pub const MAX_CONCURRENT_CALLS_ENV: &'static str = "EMIRPC_MAX_CONCURRENT_CALLS";
    pub const CALL_TIMEOUT_MS_ENV: &'static str = "EMIRPC_CALL_TIMEOUT_MS";

    pub fn new(bind_address: impl Into<String>) -> Self {
        Self {
            bind_address: bind_address.into(),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            default_call_timeout: DEFAULT_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            shutdown_grace_period: Duration::from_secs(5),
            tcp_nodelay: true,
        }
    }

    /// Defaults overridden by any `EMIRPC_*` variables that are set and valid.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var(Self::BIND_ADDRESS_ENV) {
            config.bind_address = addr;
        }
        if let Some(calls) = positive_from_env(Self::MAX_CONCURRENT_CALLS_ENV) {
            config.max_concurrent_calls = calls;
        }
        if let Some(ms) = positive_from_env(Self::CALL_TIMEOUT_MS_ENV) {
            config.default_call_timeout = Duration::from_millis(ms as u64);
        }
        config
    }

    pub fn with_bind_address(mut self, bind_address: impl Into<String>) -> Self {
        self.bind_address = bind_address.into();
        self
    }

    pub fn with_max_concurrent_calls(mut self, max: usize) -> Self {
        self.max_concurrent_calls = max;
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    pub fn with_default_call_timeout(mut self, timeout: Duration) -> Self {
        self.default_call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace_period(mut self, grace: Duration) -> Self {
        self.shutdown_grace_period = grace;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn validate(&self) -> Result<(), RpcError> {
        if self.max_concurrent_calls == 0 {
            return Err(RpcError::ConfigError(
                "max_concurrent_calls must be positive".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(RpcError::ConfigError(
                "max_frame_size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_positive(raw: &str) -> Option<usize> {
    let value = raw.trim().parse::<usize>().ok()?;
    (value > 0).then_some(value)
}

/// Reads a positive integer override, logging and ignoring anything else.
fn positive_from_env(key: &str) -> Option<usize> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse_positive(&raw);
    if parsed.is_none() {
        warn!(key, value = %raw, "ignoring invalid environment override");
    }
    parsed
}

pub(crate) type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Wraps a socket in the length-delimited framing shared by client and server.
pub(crate) fn framed(stream: TcpStream, max_frame_size: usize) -> FramedStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_size)
        .new_codec();
    Framed::new(stream, codec)
}

#[cfg(test)]
mod rpc_response_tests {
    use super::*;

    #[test]
    fn from_result_success() {
        let resp = RpcResponse::from_result(7, Ok(b"done".to_vec()));
        assert_eq!(resp.id(), 7);
        assert_eq!(resp.status(), Status::Ok);
        assert_eq!(resp.payload(), b"done");
        assert!(resp.message().is_none());
    }

    #[test]
    fn from_result_application_error_keeps_handler_detail() {
        let resp = RpcResponse::from_result(3, Err(RpcError::Application("disk full".into())));
        assert_eq!(resp.status(), Status::ApplicationError);
        assert_eq!(resp.message(), Some("disk full"));
        assert!(resp.payload().is_empty());
    }

    #[test]
    fn from_result_unknown_method_round_trips_to_caller_error() {
        let resp = RpcResponse::from_result(1, Err(RpcError::UnknownMethod("nope".into())));
        assert_eq!(resp.status(), Status::UnknownMethod);
        match resp.into_result() {
            Err(RpcError::UnknownMethod(m)) => assert_eq!(m, "nope"),
            other => panic!("expected UnknownMethod, got {:?}", other),
        }
    }

    #[test]
    fn into_result_surfaces_remote_status() {
        let resp = RpcResponse::error(9, Status::Cancelled, "shutting down");
        match resp.into_result() {
            Err(RpcError::RemoteError { status, message }) => {
                assert_eq!(status, Status::Cancelled);
                assert_eq!(message, "shutting down");
            }
            other => panic!("expected RemoteError, got {:?}", other),
        }
    }

    #[test]
    fn undecodable_params_map_to_invalid_request() {
        let err = bincode::deserialize::<String>(&[0xff]).unwrap_err();
        assert_eq!(
            Status::from_error(&RpcError::SerializationError(err)),
            Status::InvalidRequest
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment overrides are process-wide; serialize the tests touching them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[test]
    fn test_parse_positive() {
        assert_eq!(parse_positive("8"), Some(8));
        assert_eq!(parse_positive(" 4 "), Some(4));
        assert_eq!(parse_positive("0"), None);
        assert_eq!(parse_positive("-1"), None);
        assert_eq!(parse_positive("abc"), None);
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _guard = env_lock();
        std::env::set_var(RpcConfig::BIND_ADDRESS_ENV, "127.0.0.1:6000");
        std::env::set_var(RpcConfig::MAX_CONCURRENT_CALLS_ENV, "3");
        std::env::set_var(RpcConfig::CALL_TIMEOUT_MS_ENV, "1500");

        let config = RpcConfig::from_env();

        std::env::remove_var(RpcConfig::BIND_ADDRESS_ENV);
        std::env::remove_var(RpcConfig::MAX_CONCURRENT_CALLS_ENV);
        std::env::remove_var(RpcConfig::CALL_TIMEOUT_MS_ENV);

        assert_eq!(config.bind_address, "127.0.0.1:6000");
        assert_eq!(config.max_concurrent_calls, 3);
        assert_eq!(config.default_call_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_from_env_ignores_invalid_values() {
        let _guard = env_lock();
        std::env::remove_var(RpcConfig::BIND_ADDRESS_ENV);
        std::env::set_var(RpcConfig::MAX_CONCURRENT_CALLS_ENV, "0");
        std::env::set_var(RpcConfig::CALL_TIMEOUT_MS_ENV, "soon");

        let config = RpcConfig::from_env();

        std::env::remove_var(RpcConfig::MAX_CONCURRENT_CALLS_ENV);
        std::env::remove_var(RpcConfig::CALL_TIMEOUT_MS_ENV);

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.max_concurrent_calls, DEFAULT_MAX_CONCURRENT_CALLS);
        assert_eq!(config.default_call_timeout, DEFAULT_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_runtime_uses_thread_override() {
        let _guard = env_lock();
        std::env::set_var(runtime::SERVER_THREADS_ENV, "2");
        let threads = runtime::server_worker_threads();
        let rt = runtime::build_server_runtime();
        std::env::remove_var(runtime::SERVER_THREADS_ENV);

        assert_eq!(threads, 2);
        let rt = rt.unwrap();
        let name = rt.block_on(async {
            tokio::spawn(async { std::thread::current().name().map(str::to_owned) })
                .await
                .unwrap()
        });
        assert_eq!(name.as_deref(), Some(runtime::WORKER_THREAD_NAME));
    }

    #[test]
    fn test_server_runtime_falls_back_to_cpu_count() {
        let _guard = env_lock();
        std::env::set_var(runtime::SERVER_THREADS_ENV, "many");
        let threads = runtime::server_worker_threads();
        std::env::remove_var(runtime::SERVER_THREADS_ENV);

        assert!(threads >= 1);
    }

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::new("127.0.0.1:8080")
            .with_max_concurrent_calls(4)
            .with_max_frame_size(1024)
            .with_default_call_timeout(Duration::from_secs(9))
            .with_connect_timeout(Duration::from_millis(250))
            .with_shutdown_grace_period(Duration::from_secs(1))
            .with_tcp_nodelay(false);

        assert_eq!(config.bind_address, "127.0.0.1:8080");
        assert_eq!(config.max_concurrent_calls, 4);
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.default_call_timeout, Duration::from_secs(9));
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.shutdown_grace_period, Duration::from_secs(1));
        assert!(!config.tcp_nodelay);
    }

    #[test]
    fn test_config_defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.max_concurrent_calls, 10);
        assert_eq!(config.default_call_timeout, DEFAULT_TIMEOUT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = RpcConfig::default().with_max_concurrent_calls(0);
        assert!(matches!(config.validate(), Err(RpcError::ConfigError(_))));

        let config = RpcConfig::default().with_max_frame_size(0);
        assert!(matches!(config.validate(), Err(RpcError::ConfigError(_))));
    }

    #[test]
    fn test_request_accessors() {
        let req = RpcRequest::new(42, "EmiService.Start".into(), vec![1, 2, 3])
            .with_timeout(Duration::from_millis(1500));
        assert_eq!(req.id(), 42);
        assert_eq!(req.method(), "EmiService.Start");
        assert_eq!(req.params(), &[1, 2, 3]);
        assert_eq!(req.timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_request_serialization() {
        let req = RpcRequest::new(5, "echo".into(), b"hi".to_vec());
        let bytes = bincode::serialize(&req).unwrap();
        let decoded: RpcRequest = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, req);
        // The id leads the encoding so it can be read back from a damaged frame.
        assert_eq!(bincode::deserialize::<u64>(&bytes).unwrap(), 5);
    }

    #[test]
    fn test_error_display_formats() {
        assert_eq!(RpcError::Timeout.to_string(), "Request timeout");
        assert_eq!(
            RpcError::UnknownMethod("x".into()).to_string(),
            "Unknown method: x"
        );
        assert_eq!(
            RpcError::RemoteError {
                status: Status::ApplicationError,
                message: "bad".into()
            }
            .to_string(),
            "Remote error (application error): bad"
        );
    }
}
