//! Method-name to handler lookup.
//!
//! The registry is filled while the server is being set up and handed to the
//! workers behind an `Arc` once it starts; from then on it is only read.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};

use crate::{context::CallContext, RpcError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A registered method implementation operating on encoded params.
pub type Handler =
    Arc<dyn Fn(CallContext, Vec<u8>) -> BoxFuture<Result<Vec<u8>, RpcError>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct DispatchRegistry {
    handlers: HashMap<String, Handler>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `handler` to `method`.
    ///
    /// A name can be bound once; a second registration fails with
    /// [`RpcError::DuplicateMethod`] and leaves the first binding in place.
    pub fn register<F, Fut>(&mut self, method: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(CallContext, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, RpcError>> + Send + 'static,
    {
        if self.handlers.contains_key(method) {
            return Err(RpcError::DuplicateMethod(method.to_string()));
        }
        let boxed: Handler = Arc::new(move |ctx: CallContext, params: Vec<u8>| {
            Box::pin(handler(ctx, params)) as BoxFuture<Result<Vec<u8>, RpcError>>
        });
        self.handlers.insert(method.to_string(), boxed);
        Ok(())
    }

    /// Binds a handler working on decoded request and response types.
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
        let handler = Arc::new(handler);
        self.register(method, move |ctx, params: Vec<u8>| {
            let handler = handler.clone();
            async move {
                let request: Req = bincode::deserialize(&params)?;
                let response = handler(ctx, request).await?;
                Ok(bincode::serialize(&response)?)
            }
        })
    }

    pub fn resolve(&self, method: &str) -> Result<Handler, RpcError> {
        self.handlers
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::UnknownMethod(method.to_string()))
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for DispatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}
