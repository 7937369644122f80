use std::time::Duration;

use thiserror::Error;

use crate::classify::Mode;

/// Rejected before any connection is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassificationError {
    #[error("request text is empty")]
    Empty,
    #[error("request text too short to classify ({len} chars, need at least {min})")]
    TooShort { len: usize, min: usize },
}

/// Failure reported by a connection handle or while building one.
///
/// Cloneable so a handle can keep reporting the same terminal failure from
/// [`EngineConnection::err`](crate::transport::EngineConnection::err).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },
    #[error("request failed: {0}")]
    Request(String),
    #[error("server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    #[error("connection cancelled")]
    Cancelled,
}

impl TransportError {
    /// Terminal errors poison the handle that produced them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransportError::Connect { .. }
                | TransportError::DeadlineExceeded(_)
                | TransportError::Cancelled
        )
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("cannot classify request: {0}")]
    Classification(#[from] ClassificationError),
    #[error("{mode} failed: {source}")]
    Transport {
        mode: Mode,
        #[source]
        source: TransportError,
    },
    #[error("stream task failed: {0}")]
    Spawn(String),
}

impl DispatchError {
    pub(crate) fn transport(mode: Mode, source: TransportError) -> Self {
        DispatchError::Transport { mode, source }
    }

    /// Mode the failing call was routed to, if classification succeeded.
    pub fn mode(&self) -> Option<Mode> {
        match self {
            DispatchError::Transport { mode, .. } => Some(*mode),
            _ => None,
        }
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_failure_message_names_the_mode() {
        let err = DispatchError::transport(
            Mode::BoundedQuery,
            TransportError::Request("connection reset".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "bounded query failed: request failed: connection reset"
        );
        assert_eq!(err.mode(), Some(Mode::BoundedQuery));
    }

    #[test]
    fn classification_errors_carry_no_mode() {
        let err = DispatchError::from(ClassificationError::Empty);
        assert!(err.mode().is_none());
    }

    #[test]
    fn server_errors_do_not_poison_the_handle() {
        let err = TransportError::Server {
            status: 400,
            message: "line 1:1: mismatched input".to_string(),
        };
        assert!(!err.is_terminal());
        assert!(TransportError::Cancelled.is_terminal());
    }
}
