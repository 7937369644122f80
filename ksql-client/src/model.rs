//! Request and response shapes exchanged with the ksqlDB REST API.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A statement plus optional `streamsProperties` overrides.
///
/// Immutable once built; the dispatcher only ever borrows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    ksql: String,
    #[serde(
        rename = "streamsProperties",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    streams_properties: BTreeMap<String, String>,
}

impl Request {
    pub fn new(ksql: impl Into<String>) -> Self {
        Self {
            ksql: ksql.into(),
            streams_properties: BTreeMap::new(),
        }
    }

    /// Add a property override. A repeated key keeps the last value.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.streams_properties.insert(key.into(), value.into());
        self
    }

    pub fn with_properties<I, K, V>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in properties {
            self.streams_properties.insert(key.into(), value.into());
        }
        self
    }

    pub fn ksql(&self) -> &str {
        &self.ksql
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.streams_properties
    }
}

/// Structured row carried by a query response line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Row {
    #[serde(default)]
    pub columns: Vec<Value>,
    #[serde(
        default,
        deserialize_with = "engine_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
    #[serde(
        default,
        deserialize_with = "engine_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub final_message: Option<String>,
}

/// One line of a `/query` response, used by both bounded and streaming calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<Row>,
    #[serde(
        default,
        deserialize_with = "engine_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub error_message: Option<String>,
    #[serde(
        default,
        deserialize_with = "engine_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub final_message: Option<String>,
}

impl RowEvent {
    pub fn from_columns(columns: Vec<Value>) -> Self {
        Self {
            row: Some(Row {
                columns,
                ..Row::default()
            }),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn finished(message: impl Into<String>) -> Self {
        Self {
            final_message: Some(message.into()),
            ..Self::default()
        }
    }

    /// True for lines with nothing to render (headers, keep-alives).
    pub fn is_empty(&self) -> bool {
        self.row.is_none() && self.error_message.is_none() && self.final_message.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicInfo {
    pub name: String,
    #[serde(default)]
    pub registered: bool,
    #[serde(default, alias = "consumers")]
    pub consumer_count: u32,
    #[serde(default, alias = "groupConsumers")]
    pub consumer_group_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, alias = "valueFormat")]
    pub format: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default, alias = "valueFormat")]
    pub format: String,
    #[serde(default, alias = "windowed")]
    pub is_windowed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
}

/// One element of a `/ksql` composite reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEntry {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topics: Option<Vec<TopicInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<Vec<StreamInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tables: Option<Vec<TableInfo>>,
    #[serde(
        default,
        deserialize_with = "engine_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_status: Option<CommandStatus>,
}

impl ReplyEntry {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Plain status text, falling back to `commandStatus.message`.
    pub fn status_message(&self) -> Option<&str> {
        self.message
            .as_deref()
            .or_else(|| self.command_status.as_ref().map(|s| s.message.as_str()))
            .filter(|message| !message.is_empty())
    }
}

/// The engine reports messages either as plain strings or as
/// `{"@type": ..., "message": ...}` objects.
fn engine_message<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| match value {
        Value::Null => None,
        Value::String(text) => Some(text),
        Value::Object(map) => Some(
            map.get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| Value::Object(map).to_string()),
        ),
        other => Some(other.to_string()),
    }))
}
