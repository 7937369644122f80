//! Request dispatch and cached-connection lifecycle.
//!
//! A [`Dispatcher`] classifies each request, picks the slot for its mode,
//! drives the matching call shape on the slot's handle and emits the
//! normalized output to its sink.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use ksql_client::{DispatchConfig, Dispatcher, Request};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DispatchConfig::default();
//! let dispatcher = Dispatcher::http(&config);
//!
//! dispatcher
//!     .dispatch(&Request::new("SHOW topics;"), &config.endpoint, Duration::ZERO)
//!     .await?;
//!
//! let stream = dispatcher
//!     .dispatch(&Request::new("SELECT * FROM pageviews EMIT CHANGES;"), &config.endpoint, Duration::ZERO)
//!     .await?
//!     .expect("select without timeout streams");
//! tokio::time::sleep(Duration::from_secs(5)).await;
//! stream.cancel();
//! let outcome = stream.join().await?;
//! println!("{} rows", outcome.records);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::{classify, Mode};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result, TransportError};
use crate::http::HttpTransportFactory;
use crate::model::{Request, RowEvent};
use crate::render::{render_event, render_reply};
use crate::sink::{LogSink, OutputSink};
use crate::slot::{ConnectionSlot, SlotLease, SlotState};
use crate::timing::CallTimer;
use crate::transport::{ConnectionScope, TransportFactory};

/// The three cached-connection slots, one per mode.
pub struct DispatcherState {
    admin: ConnectionSlot,
    bounded: ConnectionSlot,
    streaming: ConnectionSlot,
}

impl DispatcherState {
    pub fn new() -> Self {
        Self {
            admin: ConnectionSlot::new(Mode::Admin),
            bounded: ConnectionSlot::new(Mode::BoundedQuery),
            streaming: ConnectionSlot::new(Mode::StreamingQuery),
        }
    }

    fn slot(&self, mode: Mode) -> &ConnectionSlot {
        match mode {
            Mode::Admin => &self.admin,
            Mode::BoundedQuery => &self.bounded,
            Mode::StreamingQuery => &self.streaming,
        }
    }

    pub fn slot_state(&self, mode: Mode) -> SlotState {
        self.slot(mode).state()
    }

    /// Drop every cached handle, cancelling their control signals.
    pub fn close(&self) {
        self.admin.clear();
        self.bounded.clear();
        self.streaming.clear();
    }
}

impl Default for DispatcherState {
    fn default() -> Self {
        Self::new()
    }
}

struct DispatcherInner {
    factory: Arc<dyn TransportFactory>,
    sink: Arc<dyn OutputSink>,
    state: DispatcherState,
    slow_threshold: Duration,
    admin_timeout: Option<Duration>,
    stream_buffer: usize,
}

/// Routes requests to the remote engine over per-mode cached connections.
///
/// Cloning is cheap; clones share the same slots and sink.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Dispatcher with default settings.
    pub fn new(factory: Arc<dyn TransportFactory>, sink: Arc<dyn OutputSink>) -> Self {
        Self::with_config(factory, sink, &DispatchConfig::default())
    }

    pub fn with_config(
        factory: Arc<dyn TransportFactory>,
        sink: Arc<dyn OutputSink>,
        config: &DispatchConfig,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                factory,
                sink,
                state: DispatcherState::new(),
                slow_threshold: config.slow_call_threshold(),
                admin_timeout: config.admin_timeout(),
                stream_buffer: config.stream_buffer.max(1),
            }),
        }
    }

    /// HTTP transport with records written to the log.
    pub fn http(config: &DispatchConfig) -> Self {
        Self::with_config(
            Arc::new(HttpTransportFactory::from_config(config)),
            Arc::new(LogSink),
            config,
        )
    }

    pub fn state(&self) -> &DispatcherState {
        &self.inner.state
    }

    pub fn slot_state(&self, mode: Mode) -> SlotState {
        self.inner.state.slot_state(mode)
    }

    /// Drop all cached handles. Running streams are cancelled with them.
    pub fn close(&self) {
        self.inner.state.close();
    }

    /// Classify `request` and run it against `endpoint`.
    ///
    /// A zero `timeout` turns a query into a push query that keeps running in
    /// the background; its handle is returned. Every other mode completes
    /// before returning `Ok(None)`.
    #[instrument(skip(self, request))]
    pub async fn dispatch(
        &self,
        request: &Request,
        endpoint: &str,
        timeout: Duration,
    ) -> Result<Option<StreamHandle>> {
        let mut timer = CallTimer::start(self.inner.slow_threshold);
        let mode = classify(request.ksql(), timeout)?;
        timer.set_mode(mode);
        debug!(%mode, "classified request");

        match mode {
            Mode::Admin => self.run_admin(request, endpoint).await.map(|()| None),
            Mode::BoundedQuery => self
                .run_bounded(request, endpoint, timeout)
                .await
                .map(|()| None),
            Mode::StreamingQuery => self.start_stream(request, endpoint).map(Some),
        }
    }

    fn acquire(&self, mode: Mode, endpoint: &str, scope: ConnectionScope) -> Result<SlotLease> {
        self.inner
            .state
            .slot(mode)
            .acquire(self.inner.factory.as_ref(), endpoint, scope)
            .map_err(|e| DispatchError::transport(mode, e))
    }

    async fn run_admin(&self, request: &Request, endpoint: &str) -> Result<()> {
        let lease = self.acquire(Mode::Admin, endpoint, ConnectionScope::Unscoped)?;
        let entries = lease
            .connection
            .execute(request, self.inner.admin_timeout)
            .await
            .map_err(|e| DispatchError::transport(Mode::Admin, e))?;

        if entries.is_empty() {
            warn!(
                statement = request.ksql(),
                endpoint, "empty reply to administrative statement; check the endpoint"
            );
        }
        let records = render_reply(entries);
        let emitted = records.len();
        for record in records {
            self.inner.sink.emit(record);
        }
        debug!(records = emitted, "administrative reply emitted");
        Ok(())
    }

    async fn run_bounded(&self, request: &Request, endpoint: &str, timeout: Duration) -> Result<()> {
        let lease = self.acquire(
            Mode::BoundedQuery,
            endpoint,
            ConnectionScope::Deadline(timeout),
        )?;
        let rows = lease
            .connection
            .limit_query(request, timeout)
            .await
            .map_err(|e| DispatchError::transport(Mode::BoundedQuery, e))?;

        let emitted = rows.len();
        for row in rows {
            self.inner.sink.emit(render_event(row));
        }
        debug!(records = emitted, "bounded query emitted");
        Ok(())
    }

    fn start_stream(&self, request: &Request, endpoint: &str) -> Result<StreamHandle> {
        let lease = self.acquire(Mode::StreamingQuery, endpoint, ConnectionScope::Cancellable)?;
        let cancel = lease.control.child_token();
        let (events_tx, events_rx) = mpsc::channel(self.inner.stream_buffer);

        let producer = tokio::spawn(produce(
            lease.clone(),
            request.clone(),
            events_tx,
            cancel.clone(),
        ));
        let consumer = tokio::spawn(consume(
            events_rx,
            cancel.clone(),
            self.inner.sink.clone(),
            producer,
            lease,
        ));
        info!(statement = request.ksql(), "streaming query started");

        Ok(StreamHandle {
            cancel,
            task: Some(consumer),
        })
    }
}

/// Why a stream stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamExit {
    /// The handle was cancelled.
    Cancelled,
    /// The producer finished or failed and the channel closed.
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub exit: StreamExit,
    /// Records emitted to the sink.
    pub records: usize,
    /// Producer failure. It has already been emitted in-band as a status
    /// record.
    pub error: Option<TransportError>,
}

/// Control over a running push query.
///
/// Dropping the handle cancels the stream.
pub struct StreamHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<StreamOutcome>>,
}

impl StreamHandle {
    /// Stop the stream. Safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the consumer task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Token that cancels this stream, for use from another task.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the consumer to exit. Without a prior [`cancel`](Self::cancel)
    /// this only returns once the producer closes the stream.
    pub async fn join(mut self) -> Result<StreamOutcome> {
        let task = self
            .task
            .take()
            .ok_or_else(|| DispatchError::Spawn("stream already joined".to_string()))?;
        task.await
            .map_err(|e| DispatchError::Spawn(format!("consumer task failed: {e}")))
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
        }
    }
}

/// Runs the push query and reports its failure in-band before the channel
/// closes.
async fn produce(
    lease: SlotLease,
    request: Request,
    events: mpsc::Sender<RowEvent>,
    cancel: CancellationToken,
) -> std::result::Result<(), TransportError> {
    let result = lease
        .connection
        .query(&request, events.clone(), cancel.clone())
        .await;
    match &result {
        Ok(()) => debug!("streaming query producer finished"),
        Err(TransportError::Cancelled) => debug!("streaming query cancelled"),
        Err(err) => {
            warn!(error = %err, "streaming query failed");
            if !cancel.is_cancelled() {
                let _ = events.send(RowEvent::error(err.to_string())).await;
            }
        }
    }
    result
}

enum ConsumerState {
    Receiving,
    Stopped(StreamExit),
}

async fn consume(
    mut events: mpsc::Receiver<RowEvent>,
    cancel: CancellationToken,
    sink: Arc<dyn OutputSink>,
    producer: JoinHandle<std::result::Result<(), TransportError>>,
    lease: SlotLease,
) -> StreamOutcome {
    let started = Instant::now();
    let mut records = 0usize;
    let mut state = ConsumerState::Receiving;

    let exit = loop {
        state = match state {
            ConsumerState::Stopped(exit) => break exit,
            ConsumerState::Receiving => tokio::select! {
                biased;
                _ = cancel.cancelled() => ConsumerState::Stopped(StreamExit::Cancelled),
                event = events.recv() => match event {
                    Some(event) => {
                        sink.emit(render_event(event));
                        records += 1;
                        ConsumerState::Receiving
                    }
                    None => ConsumerState::Stopped(StreamExit::Closed),
                },
            },
        };
    };
    drop(events);

    let error = match exit {
        StreamExit::Cancelled => {
            producer.abort();
            None
        }
        StreamExit::Closed => {
            // A closed push query leaves nothing to reuse on this handle.
            lease.retire();
            match producer.await {
                Ok(result) => result.err(),
                Err(e) => Some(TransportError::Request(format!("producer task failed: {e}"))),
            }
        }
    };

    info!(
        exit = ?exit,
        records,
        elapsed_secs = %format!("{:.4}", started.elapsed().as_secs_f64()),
        "streaming query finished"
    );
    StreamOutcome {
        exit,
        records,
        error,
    }
}
