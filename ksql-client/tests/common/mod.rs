#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ksql_client::{
    CancelHandle, CollectingSink, ConnectionScope, Connected, Dispatcher, EngineConnection,
    ReplyEntry, Request, RowEvent, TopicInfo, TransportError, TransportFactory,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const ENDPOINT: &str = "http://ksql.test:8088";

/// What a push query does after its scripted events are sent.
#[derive(Debug, Clone, Default)]
pub enum StreamEnd {
    #[default]
    Hang,
    Close,
    Fail(TransportError),
}

/// Canned replies shared by every connection a [`ScriptedFactory`] builds.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub stream_events: Vec<RowEvent>,
    pub stream_end: StreamEnd,
    pub bounded_rows: Vec<RowEvent>,
    pub bounded_error: Option<TransportError>,
    pub admin_reply: Vec<ReplyEntry>,
    pub admin_error: Option<TransportError>,
}

#[derive(Debug, Default)]
pub struct ScriptedConnection {
    script: Script,
    pub failed: AtomicBool,
    /// Set once a push query returns or its future is dropped.
    pub stream_stopped: AtomicBool,
    pub calls: AtomicUsize,
}

impl ScriptedConnection {
    pub fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EngineConnection for ScriptedConnection {
    fn err(&self) -> Option<TransportError> {
        self.failed.load(Ordering::SeqCst).then(|| TransportError::Connect {
            endpoint: ENDPOINT.to_string(),
            message: "connection reset".to_string(),
        })
    }

    async fn query(
        &self,
        _request: &Request,
        events: mpsc::Sender<RowEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _stopped = SetOnDrop(&self.stream_stopped);
        for event in self.script.stream_events.clone() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                sent = events.send(event) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
        match &self.script.stream_end {
            StreamEnd::Hang => {
                cancel.cancelled().await;
                Err(TransportError::Cancelled)
            }
            StreamEnd::Close => Ok(()),
            StreamEnd::Fail(err) => Err(err.clone()),
        }
    }

    async fn limit_query(
        &self,
        _request: &Request,
        _timeout: Duration,
    ) -> Result<Vec<RowEvent>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script.bounded_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.script.bounded_rows.clone()),
        }
    }

    async fn execute(
        &self,
        _request: &Request,
        _timeout: Option<Duration>,
    ) -> Result<Vec<ReplyEntry>, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script.admin_error {
            Some(err) => Err(err.clone()),
            None => Ok(self.script.admin_reply.clone()),
        }
    }
}

struct SetOnDrop<'a>(&'a AtomicBool);

impl Drop for SetOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Counts handle construction per scope and keeps every handle it built.
#[derive(Default)]
pub struct ScriptedFactory {
    script: Script,
    connect_delay: Duration,
    pub built: Mutex<Vec<(ConnectionScope, Arc<ScriptedConnection>)>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Sleep inside `connect`, widening the window for racing callers.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn connects(&self) -> usize {
        self.built.lock().unwrap().len()
    }

    pub fn connects_with(&self, pred: impl Fn(&ConnectionScope) -> bool) -> usize {
        self.built
            .lock()
            .unwrap()
            .iter()
            .filter(|(scope, _)| pred(scope))
            .count()
    }

    pub fn connection(&self, idx: usize) -> Arc<ScriptedConnection> {
        self.built.lock().unwrap()[idx].1.clone()
    }
}

impl TransportFactory for ScriptedFactory {
    fn connect(&self, _endpoint: &str, scope: ConnectionScope) -> Result<Connected, TransportError> {
        if !self.connect_delay.is_zero() {
            std::thread::sleep(self.connect_delay);
        }
        let connection = Arc::new(ScriptedConnection {
            script: self.script.clone(),
            ..ScriptedConnection::default()
        });
        self.built.lock().unwrap().push((scope, connection.clone()));
        Ok(Connected {
            connection,
            control: CancelHandle::new(),
        })
    }
}

pub fn dispatcher(factory: Arc<ScriptedFactory>) -> (Dispatcher, Arc<CollectingSink>) {
    let sink = Arc::new(CollectingSink::new());
    (Dispatcher::new(factory, sink.clone()), sink)
}

pub fn user_row(id: i64) -> RowEvent {
    RowEvent::from_columns(vec![json!(id), json!(format!("user_{id}")), json!(id * 10)])
}

pub fn topics_reply(names: &[&str]) -> Vec<ReplyEntry> {
    vec![ReplyEntry {
        kind: Some("kafka_topics".to_string()),
        statement_text: Some("SHOW topics;".to_string()),
        topics: Some(
            names
                .iter()
                .map(|name| TopicInfo {
                    name: name.to_string(),
                    registered: true,
                    consumer_count: 1,
                    consumer_group_count: 1,
                })
                .collect(),
        ),
        ..ReplyEntry::default()
    }]
}

/// Poll `cond` until it holds or `limit` elapses.
pub async fn wait_for(limit: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
