//! Destinations for dispatched output records.

use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::info;

use crate::render::OutputRecord;

/// Consumer of [`OutputRecord`]s. Called from the streaming consumer task, so
/// implementations must be shareable across threads.
pub trait OutputSink: Send + Sync {
    fn emit(&self, record: OutputRecord);
}

/// Writes each record as an `info` log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl OutputSink for LogSink {
    fn emit(&self, record: OutputRecord) {
        info!(target: "ksql_client::output", "{record}");
    }
}

/// Buffers records in memory until drained.
#[derive(Debug, Default)]
pub struct CollectingSink {
    records: Mutex<Vec<OutputRecord>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of everything emitted so far.
    pub fn snapshot(&self) -> Vec<OutputRecord> {
        self.lock().clone()
    }

    /// Take everything emitted so far, leaving the sink empty.
    pub fn drain(&self) -> Vec<OutputRecord> {
        std::mem::take(&mut *self.lock())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<OutputRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl OutputSink for CollectingSink {
    fn emit(&self, record: OutputRecord) {
        self.lock().push(record);
    }
}

/// Forwards records to a channel; records are dropped once the receiver is
/// gone.
impl OutputSink for mpsc::UnboundedSender<OutputRecord> {
    fn emit(&self, record: OutputRecord) {
        let _ = self.send(record);
    }
}
