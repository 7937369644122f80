//! Per-mode cached connection holders.
//!
//! Each slot keeps at most one handle. The slot mutex is held while a
//! replacement is built, so concurrent callers on an empty or stale slot end
//! up sharing a single new handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::classify::Mode;
use crate::error::TransportError;
use crate::transport::{CancelHandle, ConnectionScope, Connected, EngineConnection, TransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Empty,
    Live,
    Stale,
}

/// Shared view of a cached handle handed to a single call.
#[derive(Clone)]
pub(crate) struct SlotLease {
    pub(crate) connection: Arc<dyn EngineConnection>,
    pub(crate) control: CancelHandle,
    retired: Arc<AtomicBool>,
}

impl SlotLease {
    /// Make the next `acquire` on the owning slot build a new handle. Has no
    /// effect once the slot has already moved on to another handle.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }
}

struct CachedConnection {
    endpoint: String,
    scope: ConnectionScope,
    connection: Arc<dyn EngineConnection>,
    control: CancelHandle,
    retired: Arc<AtomicBool>,
    created_at: Instant,
}

impl CachedConnection {
    /// Why this handle cannot serve a call for `endpoint`/`scope`, if at all.
    fn staleness(&self, endpoint: &str, scope: ConnectionScope) -> Option<String> {
        if let Some(err) = self.connection.err() {
            return Some(format!("handle failed: {err}"));
        }
        if self.retired.load(Ordering::SeqCst) {
            return Some("handle retired by its last call".to_string());
        }
        if self.endpoint != endpoint {
            return Some(format!("endpoint changed from {}", self.endpoint));
        }
        if self.scope != scope {
            return Some(format!("scope changed from {:?}", self.scope));
        }
        None
    }

    fn lease(&self) -> SlotLease {
        SlotLease {
            connection: self.connection.clone(),
            control: self.control.clone(),
            retired: self.retired.clone(),
        }
    }

    fn is_stale(&self) -> bool {
        self.connection.err().is_some() || self.retired.load(Ordering::SeqCst)
    }
}

pub(crate) struct ConnectionSlot {
    mode: Mode,
    cached: Mutex<Option<CachedConnection>>,
}

impl ConnectionSlot {
    pub(crate) fn new(mode: Mode) -> Self {
        Self {
            mode,
            cached: Mutex::new(None),
        }
    }

    /// Reuse the cached handle if it is live, otherwise build and store a
    /// replacement.
    pub(crate) fn acquire(
        &self,
        factory: &dyn TransportFactory,
        endpoint: &str,
        scope: ConnectionScope,
    ) -> Result<SlotLease, TransportError> {
        let mut cached = self.lock();

        if let Some(existing) = cached.as_ref() {
            match existing.staleness(endpoint, scope) {
                None => {
                    debug!(
                        slot = %self.mode,
                        age_ms = existing.created_at.elapsed().as_millis() as u64,
                        "reusing cached connection"
                    );
                    return Ok(existing.lease());
                }
                Some(reason) => {
                    info!(slot = %self.mode, %reason, "discarding stale connection");
                    existing.control.cancel();
                    *cached = None;
                }
            }
        }

        let Connected {
            connection,
            control,
        } = match scope {
            ConnectionScope::Unscoped => factory.new_connection(endpoint)?,
            ConnectionScope::Deadline(deadline) => {
                factory.new_connection_with_deadline(endpoint, deadline)?
            }
            ConnectionScope::Cancellable => factory.new_connection_with_cancel(endpoint)?,
        };
        info!(slot = %self.mode, endpoint, ?scope, "created connection");

        let entry = CachedConnection {
            endpoint: endpoint.to_string(),
            scope,
            connection,
            control,
            retired: Arc::new(AtomicBool::new(false)),
            created_at: Instant::now(),
        };
        let lease = entry.lease();
        *cached = Some(entry);
        Ok(lease)
    }

    pub(crate) fn state(&self) -> SlotState {
        match self.lock().as_ref() {
            None => SlotState::Empty,
            Some(entry) if entry.is_stale() => SlotState::Stale,
            Some(_) => SlotState::Live,
        }
    }

    /// Drop the cached handle and cancel its control signal.
    pub(crate) fn clear(&self) {
        if let Some(entry) = self.lock().take() {
            entry.control.cancel();
            debug!(slot = %self.mode, "cleared cached connection");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<CachedConnection>> {
        self.cached
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
