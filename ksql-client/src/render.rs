//! Normalization of engine responses into [`OutputRecord`]s.

use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::model::{ReplyEntry, RowEvent, StreamInfo, TableInfo, TopicInfo};

/// Dynamic type of a rendered column value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Null,
    Bool,
    Integer,
    Float,
    String,
    Array,
    Object,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedValue {
    pub text: String,
    pub kind: ValueKind,
}

/// The unit the dispatcher hands to its sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputRecord {
    Row {
        values: Vec<RenderedValue>,
        /// Error and final text attached to the row, joined by a space.
        annotation: Option<String>,
    },
    Topic(TopicInfo),
    Stream(StreamInfo),
    Table(TableInfo),
    Status { message: String },
}

impl OutputRecord {
    pub fn status(message: impl Into<String>) -> Self {
        OutputRecord::Status {
            message: message.into(),
        }
    }

    pub fn is_status(&self) -> bool {
        matches!(self, OutputRecord::Status { .. })
    }
}

impl fmt::Display for OutputRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputRecord::Row { values, annotation } => {
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(" | ")?;
                    }
                    write!(f, "{} ({})", value.text, value.kind.as_str())?;
                }
                if let Some(annotation) = annotation {
                    write!(f, " : {annotation}")?;
                }
                Ok(())
            }
            OutputRecord::Topic(topic) => write!(
                f,
                "Topic {}, registered: {}, consumers: {}, group consumers: {}",
                topic.name, topic.registered, topic.consumer_count, topic.consumer_group_count
            ),
            OutputRecord::Stream(stream) => write!(
                f,
                "Stream {}, topic: {}, format: {}",
                stream.name, stream.topic, stream.format
            ),
            OutputRecord::Table(table) => write!(
                f,
                "Table {}, topic: {}, format: {}, windowed: {}",
                table.name, table.topic, table.format, table.is_windowed
            ),
            OutputRecord::Status { message } => write!(f, "MSG: {message}"),
        }
    }
}

/// Render a JSON column value.
///
/// Strings are rendered without quotes; nested values as compact JSON;
/// null as `NULL`.
pub fn render_value(value: &Value) -> RenderedValue {
    let (text, kind) = match value {
        Value::Null => ("NULL".to_string(), ValueKind::Null),
        Value::Bool(b) => (b.to_string(), ValueKind::Bool),
        Value::Number(n) if n.is_f64() => (n.to_string(), ValueKind::Float),
        Value::Number(n) => (n.to_string(), ValueKind::Integer),
        Value::String(s) => (s.clone(), ValueKind::String),
        Value::Array(_) => (value.to_string(), ValueKind::Array),
        Value::Object(_) => (value.to_string(), ValueKind::Object),
    };
    RenderedValue { text, kind }
}

/// One record per event: a row when present, otherwise a status line.
pub fn render_event(event: RowEvent) -> OutputRecord {
    let RowEvent {
        row,
        error_message,
        final_message,
    } = event;

    match row {
        Some(row) => OutputRecord::Row {
            values: row.columns.iter().map(render_value).collect(),
            annotation: join_messages([
                row.error_message.as_deref(),
                row.final_message.as_deref(),
                error_message.as_deref(),
                final_message.as_deref(),
            ]),
        },
        None => OutputRecord::status(
            join_messages([final_message.as_deref(), error_message.as_deref()])
                .unwrap_or_default(),
        ),
    }
}

/// Flatten a composite reply. Entries with neither listing nor message
/// contribute nothing.
pub fn render_reply(entries: Vec<ReplyEntry>) -> Vec<OutputRecord> {
    let mut records = Vec::new();
    for entry in entries {
        let message = entry.status_message().map(str::to_string);
        if let Some(topics) = entry.topics {
            records.extend(topics.into_iter().map(OutputRecord::Topic));
        }
        if let Some(streams) = entry.streams {
            records.extend(streams.into_iter().map(OutputRecord::Stream));
        }
        if let Some(tables) = entry.tables {
            records.extend(tables.into_iter().map(OutputRecord::Table));
        }
        if let Some(message) = message {
            records.push(OutputRecord::status(message));
        }
    }
    records
}

fn join_messages<'a>(parts: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    let joined = parts
        .into_iter()
        .flatten()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}
