//! Seams between the dispatcher and the network.
//!
//! [`TransportFactory`] builds connection handles; [`EngineConnection`] is the
//! handle the dispatcher caches per mode and drives through one of three call
//! shapes. The HTTP implementation lives in [`crate::http`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::model::{ReplyEntry, Request, RowEvent};

/// Lifetime control requested when a handle is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionScope {
    /// Lives until replaced.
    Unscoped,
    /// Turns stale once the duration has elapsed since construction.
    Deadline(Duration),
    /// Lives until its control handle is cancelled.
    Cancellable,
}

/// Idempotent cancellation signal.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Token cancelled together with this handle, but cancellable on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }
}

/// A freshly built handle together with its control signal.
pub struct Connected {
    pub connection: Arc<dyn EngineConnection>,
    pub control: CancelHandle,
}

/// A connection handle bound to one server address.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    /// `Some` once the handle has failed terminally and must not be reused.
    fn err(&self) -> Option<TransportError>;

    /// Push query. Sends every event to `events` until the response ends,
    /// `cancel` fires or the receiver goes away.
    async fn query(
        &self,
        request: &Request,
        events: mpsc::Sender<RowEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError>;

    /// Query that returns what arrived before the response ended or
    /// `timeout` elapsed.
    async fn limit_query(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Vec<RowEvent>, TransportError>;

    /// Statement answered by a composite reply.
    async fn execute(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReplyEntry>, TransportError>;
}

pub trait TransportFactory: Send + Sync {
    fn connect(&self, endpoint: &str, scope: ConnectionScope) -> Result<Connected, TransportError>;

    fn new_connection(&self, endpoint: &str) -> Result<Connected, TransportError> {
        self.connect(endpoint, ConnectionScope::Unscoped)
    }

    fn new_connection_with_deadline(
        &self,
        endpoint: &str,
        deadline: Duration,
    ) -> Result<Connected, TransportError> {
        self.connect(endpoint, ConnectionScope::Deadline(deadline))
    }

    fn new_connection_with_cancel(&self, endpoint: &str) -> Result<Connected, TransportError> {
        self.connect(endpoint, ConnectionScope::Cancellable)
    }
}
