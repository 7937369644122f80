//! Request classification.
//!
//! Picks the transport mode from the first keyword of the statement text and
//! the caller's timeout. No parsing beyond that first token is attempted.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::ClassificationError;

/// Keywords routed to the query endpoint. Everything else is a statement.
const QUERY_KEYWORDS: &[&str] = &["select"];

/// Minimum trimmed length before a request is classified: the width of
/// `select` plus one delimiter.
pub const PROBE_WINDOW: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// One-shot statement (`SHOW`, `CREATE`, `DROP`, ...) answered by a
    /// composite reply.
    Admin,
    /// Query limited by the caller's timeout, answered by a finite row batch.
    BoundedQuery,
    /// Push query that runs until cancelled.
    StreamingQuery,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Admin => "admin statement",
            Mode::BoundedQuery => "bounded query",
            Mode::StreamingQuery => "streaming query",
        }
    }

    pub fn is_query(&self) -> bool {
        !matches!(self, Mode::Admin)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a request. A zero `timeout` selects streaming for queries.
pub fn classify(ksql: &str, timeout: Duration) -> Result<Mode, ClassificationError> {
    let trimmed = ksql.trim_start();
    if trimmed.is_empty() {
        return Err(ClassificationError::Empty);
    }
    let len = trimmed.chars().count();
    if len < PROBE_WINDOW {
        return Err(ClassificationError::TooShort {
            len,
            min: PROBE_WINDOW,
        });
    }

    let keyword_len = trimmed
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(trimmed.len());
    let keyword = &trimmed[..keyword_len];
    let is_query = QUERY_KEYWORDS
        .iter()
        .any(|candidate| keyword.eq_ignore_ascii_case(candidate));

    Ok(match (is_query, timeout.is_zero()) {
        (false, _) => Mode::Admin,
        (true, true) => Mode::StreamingQuery,
        (true, false) => Mode::BoundedQuery,
    })
}
