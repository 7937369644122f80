//! ksqlDB REST transport.
//!
//! Statements go to `POST /ksql` and come back as one JSON array. Queries go
//! to `POST /query` and come back as a chunked body with one JSON object per
//! line, optionally wrapped in JSON array framing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::DispatchConfig;
use crate::error::TransportError;
use crate::model::{ReplyEntry, Request, RowEvent};
use crate::transport::{CancelHandle, ConnectionScope, Connected, EngineConnection, TransportFactory};

const KSQL_MEDIA_TYPE: &str = "application/vnd.ksql.v1+json";

/// Builds one [`HttpConnection`] per call, each with its own HTTP client.
#[derive(Debug, Clone)]
pub struct HttpTransportFactory {
    connect_timeout: Duration,
}

impl HttpTransportFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(config.connect_timeout())
    }
}

impl Default for HttpTransportFactory {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl TransportFactory for HttpTransportFactory {
    fn connect(&self, endpoint: &str, scope: ConnectionScope) -> Result<Connected, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .build()
            .map_err(|e| TransportError::Connect {
                endpoint: endpoint.to_string(),
                message: e.to_string(),
            })?;
        let deadline = match scope {
            ConnectionScope::Deadline(limit) => {
                Instant::now().checked_add(limit).map(|at| (at, limit))
            }
            ConnectionScope::Unscoped | ConnectionScope::Cancellable => None,
        };
        let control = CancelHandle::new();
        let connection = HttpConnection {
            base_url: endpoint.trim_end_matches('/').to_string(),
            client,
            control: control.clone(),
            deadline,
            failure: Mutex::new(None),
        };
        Ok(Connected {
            connection: Arc::new(connection),
            control,
        })
    }
}

pub struct HttpConnection {
    base_url: String,
    client: reqwest::Client,
    control: CancelHandle,
    deadline: Option<(Instant, Duration)>,
    failure: Mutex<Option<TransportError>>,
}

impl HttpConnection {
    /// Failures that rule out any further request on this handle. An expired
    /// handle deadline is not one of them: it only stops the slot from
    /// handing the handle out again.
    fn unusable(&self) -> Option<TransportError> {
        if self.control.is_cancelled() {
            return Some(TransportError::Cancelled);
        }
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_failure(&self, err: &TransportError) {
        if err.is_terminal() {
            let mut failure = self
                .failure
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            failure.get_or_insert_with(|| err.clone());
        }
    }

    fn request_error(&self, err: reqwest::Error) -> TransportError {
        let mapped = if err.is_connect() {
            TransportError::Connect {
                endpoint: self.base_url.clone(),
                message: err.to_string(),
            }
        } else if err.is_timeout() {
            TransportError::Request(format!("timed out: {err}"))
        } else {
            TransportError::Request(err.to_string())
        };
        self.record_failure(&mapped);
        mapped
    }

    async fn post(
        &self,
        path: &str,
        request: &Request,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, TransportError> {
        if let Some(err) = self.unusable() {
            return Err(err);
        }
        let url = format!("{}/{}", self.base_url, path);
        let mut builder = self
            .client
            .post(&url)
            .header(ACCEPT, KSQL_MEDIA_TYPE)
            .header(CONTENT_TYPE, KSQL_MEDIA_TYPE)
            .json(request);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        let started = std::time::Instant::now();
        debug!(%url, "sending request");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = builder.send() => result.map_err(|e| self.request_error(e))?,
        };
        let status = response.status();
        debug!(
            %url,
            status = status.as_u16(),
            duration_ms = started.elapsed().as_millis() as u64,
            "response received"
        );

        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    debug!(%url, error = %err, "failed to read error body");
                    String::new()
                }
            };
            let message = server_message(&body);
            warn!(%url, status = status.as_u16(), %message, "server rejected request");
            return Err(TransportError::Server {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl EngineConnection for HttpConnection {
    fn err(&self) -> Option<TransportError> {
        if let Some(err) = self.unusable() {
            return Some(err);
        }
        match self.deadline {
            Some((at, limit)) if Instant::now() >= at => {
                Some(TransportError::DeadlineExceeded(limit))
            }
            _ => None,
        }
    }

    #[instrument(skip(self, request, events, cancel))]
    async fn query(
        &self,
        request: &Request,
        events: mpsc::Sender<RowEvent>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let response = self.post("query", request, None, &cancel).await?;
        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = RowEventDecoder::default();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("push query cancelled");
                    return Ok(());
                }
                chunk = body.next() => chunk,
            };
            let (batch, done) = match chunk {
                Some(Ok(bytes)) => (decoder.push(&bytes)?, false),
                Some(Err(err)) => return Err(self.request_error(err)),
                None => (decoder.finish()?.into_iter().collect(), true),
            };
            for event in batch {
                if !forward(&events, event, &cancel).await {
                    return Ok(());
                }
            }
            if done {
                debug!("push query response ended");
                return Ok(());
            }
        }
    }

    #[instrument(skip(self, request))]
    async fn limit_query(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<Vec<RowEvent>, TransportError> {
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| TransportError::Request(format!("timeout {timeout:?} overflows")))?;
        let cancel = self.control.token();

        let response = tokio::time::timeout_at(deadline, self.post("query", request, None, cancel))
            .await
            .map_err(|_| TransportError::DeadlineExceeded(timeout))??;
        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = RowEventDecoder::default();
        let mut rows = Vec::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                chunk = tokio::time::timeout_at(deadline, body.next()) => chunk,
            };
            match chunk {
                Err(_) => {
                    debug!(rows = rows.len(), "query reached its time limit");
                    break;
                }
                Ok(Some(Ok(bytes))) => rows.extend(decoder.push(&bytes)?),
                Ok(Some(Err(err))) => return Err(self.request_error(err)),
                Ok(None) => {
                    rows.extend(decoder.finish()?);
                    break;
                }
            }
        }
        Ok(rows)
    }

    #[instrument(skip(self, request))]
    async fn execute(
        &self,
        request: &Request,
        timeout: Option<Duration>,
    ) -> Result<Vec<ReplyEntry>, TransportError> {
        let response = self
            .post("ksql", request, timeout, self.control.token())
            .await?;
        let body = response.bytes().await.map_err(|e| self.request_error(e))?;
        serde_json::from_slice(&body)
            .map_err(|e| TransportError::Decode(format!("composite reply: {e}")))
    }
}

/// Send one event, giving up if the stream is cancelled or the receiver
/// is gone.
async fn forward(
    events: &mpsc::Sender<RowEvent>,
    event: RowEvent,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = events.send(event) => sent.is_ok(),
    }
}

/// Splits a chunked `/query` body into [`RowEvent`]s.
///
/// Blank keep-alive lines and header-only objects are skipped; JSON array
/// framing (`[`, `,`, `]`) around each line is tolerated.
#[derive(Debug, Default)]
pub struct RowEventDecoder {
    buffer: Vec<u8>,
}

impl RowEventDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<RowEvent>, TransportError> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(event) = decode_line(&line)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// Decode whatever is left once the body has ended.
    pub fn finish(&mut self) -> Result<Option<RowEvent>, TransportError> {
        let rest = std::mem::take(&mut self.buffer);
        decode_line(&rest)
    }
}

fn decode_line(line: &[u8]) -> Result<Option<RowEvent>, TransportError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| TransportError::Decode(format!("non UTF-8 line: {e}")))?;
    let mut text = text.trim();
    text = text.strip_prefix('[').unwrap_or(text).trim();
    text = text.strip_suffix(']').unwrap_or(text).trim();
    text = text.strip_prefix(',').unwrap_or(text).trim();
    text = text.strip_suffix(',').unwrap_or(text).trim();
    if text.is_empty() {
        return Ok(None);
    }
    let event: RowEvent = serde_json::from_str(text)
        .map_err(|e| TransportError::Decode(format!("{e} in line {text:?}")))?;
    Ok((!event.is_empty()).then_some(event))
}

/// Error bodies are `{"@type": ..., "error_code": ..., "message": ...}`.
fn server_message(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "empty response body".to_string();
    }
    serde_json::from_str::<Value>(trimmed)
        .ok()
        .and_then(|value| value.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| trimmed.to_string())
}
