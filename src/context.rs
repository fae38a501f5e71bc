//! Per-call context handed to handlers.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio_util::sync::CancellationToken;

/// Metadata and cancellation signal for a single call.
///
/// The server creates one context per accepted call and drops it once the
/// response has been produced. Handlers that do long-running work should
/// watch [`CallContext::cancelled`] so they stop when the call is abandoned,
/// either because its deadline passed or because the server is shutting down.
#[derive(Debug, Clone)]
pub struct CallContext {
    id: u64,
    method: Arc<str>,
    peer_addr: Option<SocketAddr>,
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl CallContext {
    /// Creates a detached context, useful when invoking handlers directly.
    pub fn new(id: u64, method: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            method: method.into(),
            peer_addr: None,
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    pub(crate) fn for_call(
        id: u64,
        method: impl Into<Arc<str>>,
        peer_addr: SocketAddr,
        deadline: Option<Instant>,
        token: CancellationToken,
    ) -> Self {
        Self {
            id,
            method: method.into(),
            peer_addr: Some(peer_addr),
            deadline,
            token,
        }
    }

    pub fn with_peer_addr(mut self, peer_addr: SocketAddr) -> Self {
        self.peer_addr = Some(peer_addr);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.method
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the call has been cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_context_has_no_peer_or_deadline() {
        let ctx = CallContext::new(3, "EmiService.Start");
        assert_eq!(ctx.id(), 3);
        assert_eq!(ctx.method(), "EmiService.Start");
        assert!(ctx.peer_addr().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let ctx = CallContext::new(1, "m").with_deadline(Instant::now() - Duration::from_secs(1));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));

        let ctx = CallContext::new(1, "m").with_deadline(Instant::now() + Duration::from_secs(60));
        assert!(ctx.remaining().unwrap() > Duration::from_secs(50));
    }

    #[tokio::test]
    async fn cancellation_is_visible_through_clones() {
        let ctx = CallContext::new(1, "m");
        let observer = ctx.clone();
        let waiter = tokio::spawn(async move { observer.cancelled().await });

        ctx.cancel();
        waiter.await.unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn parent_token_cancels_call() {
        let parent = CancellationToken::new();
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let ctx = CallContext::for_call(8, "m", addr, None, parent.child_token());
        assert_eq!(ctx.peer_addr(), Some(addr));

        parent.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
    }
}
