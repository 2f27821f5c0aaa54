//! # Error Taxonomy
//!
//! Every failure the exchange engine can report is classified here. The
//! transport collaborator reports a completion code plus a numeric reason
//! code; the exchange layer wraps those into [`ExchangeError`] values tagged
//! with the operation and queue that failed, so callers can tell an
//! infrastructure problem from a test-data problem without parsing strings.
//!
//! ## Classes
//!
//! - **Transient connection** (`SSL_INITIALIZATION_ERROR`): retried inside
//!   the connection manager and only surfaced once the retry budget is spent
//! - **Fatal connection**: any other connect failure
//! - **No message available**: not an error at this layer; transports report
//!   it as `Ok(None)` from `get`
//! - **Put / get / property failure**: any other reason code
//! - **Content**: reply body mismatch or a request without a reply destination

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::exchange::DrainTally;

/// Completion code attached to every transport call result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionCode {
    Ok,
    Warning,
    Failed,
}

impl CompletionCode {
    /// Numeric value as reported by queue managers.
    pub fn code(self) -> i32 {
        match self {
            CompletionCode::Ok => 0,
            CompletionCode::Warning => 1,
            CompletionCode::Failed => 2,
        }
    }
}

impl fmt::Display for CompletionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Numeric reason code explaining a non-OK completion.
///
/// Only the codes this crate reacts to, or that the bundled loopback queue
/// manager produces, have named constants; any other value is carried
/// through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReasonCode(pub u32);

impl ReasonCode {
    pub const NONE: ReasonCode = ReasonCode(0);
    pub const CONNECTION_BROKEN: ReasonCode = ReasonCode(2009);
    pub const HCONN_ERROR: ReasonCode = ReasonCode(2018);
    pub const HOBJ_ERROR: ReasonCode = ReasonCode(2019);
    pub const NO_MSG_AVAILABLE: ReasonCode = ReasonCode(2033);
    pub const NOT_AUTHORIZED: ReasonCode = ReasonCode(2035);
    pub const NOT_OPEN_FOR_INPUT: ReasonCode = ReasonCode(2037);
    pub const NOT_OPEN_FOR_OUTPUT: ReasonCode = ReasonCode(2039);
    pub const OBJECT_IN_USE: ReasonCode = ReasonCode(2042);
    pub const Q_MGR_NAME_ERROR: ReasonCode = ReasonCode(2058);
    pub const Q_MGR_NOT_AVAILABLE: ReasonCode = ReasonCode(2059);
    pub const TRUNCATED_MSG_FAILED: ReasonCode = ReasonCode(2080);
    pub const UNKNOWN_OBJECT_NAME: ReasonCode = ReasonCode(2085);
    pub const Q_MGR_QUIESCING: ReasonCode = ReasonCode(2161);
    pub const SSL_INITIALIZATION_ERROR: ReasonCode = ReasonCode(2393);
    pub const PROPERTY_NAME_ERROR: ReasonCode = ReasonCode(2442);
    pub const HMSG_ERROR: ReasonCode = ReasonCode(2460);

    /// Symbolic name for the well-known codes.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NONE => "NONE",
            Self::CONNECTION_BROKEN => "CONNECTION_BROKEN",
            Self::HCONN_ERROR => "HCONN_ERROR",
            Self::HOBJ_ERROR => "HOBJ_ERROR",
            Self::NO_MSG_AVAILABLE => "NO_MSG_AVAILABLE",
            Self::NOT_AUTHORIZED => "NOT_AUTHORIZED",
            Self::NOT_OPEN_FOR_INPUT => "NOT_OPEN_FOR_INPUT",
            Self::NOT_OPEN_FOR_OUTPUT => "NOT_OPEN_FOR_OUTPUT",
            Self::OBJECT_IN_USE => "OBJECT_IN_USE",
            Self::Q_MGR_NAME_ERROR => "Q_MGR_NAME_ERROR",
            Self::Q_MGR_NOT_AVAILABLE => "Q_MGR_NOT_AVAILABLE",
            Self::TRUNCATED_MSG_FAILED => "TRUNCATED_MSG_FAILED",
            Self::UNKNOWN_OBJECT_NAME => "UNKNOWN_OBJECT_NAME",
            Self::Q_MGR_QUIESCING => "Q_MGR_QUIESCING",
            Self::SSL_INITIALIZATION_ERROR => "SSL_INITIALIZATION_ERROR",
            Self::PROPERTY_NAME_ERROR => "PROPERTY_NAME_ERROR",
            Self::HMSG_ERROR => "HMSG_ERROR",
            _ => return None,
        };
        Some(name)
    }

    /// Whether a connect failing with this reason should be retried.
    pub fn is_transient_connect_failure(self) -> bool {
        self == Self::SSL_INITIALIZATION_ERROR
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{} ({})", name, self.0),
            None => write!(f, "{}", self.0),
        }
    }
}

/// Failure reported by a [`QueueTransport`](crate::transport::QueueTransport) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("completion code {completion}, reason {reason}")]
pub struct TransportError {
    pub completion: CompletionCode,
    pub reason: ReasonCode,
}

impl TransportError {
    /// A failed completion with the given reason.
    pub fn failed(reason: ReasonCode) -> Self {
        Self {
            completion: CompletionCode::Failed,
            reason,
        }
    }
}

/// Transport call that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Connect,
    Disconnect,
    Open,
    Close,
    Put,
    Get,
    CreatePropertyHandle,
    SetProperty,
    ReleasePropertyHandle,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Connect => "connect",
            Operation::Disconnect => "disconnect",
            Operation::Open => "open",
            Operation::Close => "close",
            Operation::Put => "put",
            Operation::Get => "get",
            Operation::CreatePropertyHandle => "create property handle",
            Operation::SetProperty => "set property",
            Operation::ReleasePropertyHandle => "release property handle",
        };
        f.write_str(name)
    }
}

/// Errors returned by exchange operations.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("failed to connect to queue manager '{queue_manager}': {source}")]
    Connection {
        queue_manager: String,
        #[source]
        source: TransportError,
    },

    #[error("gave up connecting to queue manager '{queue_manager}' after {attempts} attempts: {source}")]
    ConnectRetriesExhausted {
        queue_manager: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("{operation} failed on queue '{queue}': {source}")]
    Queue {
        operation: Operation,
        queue: String,
        #[source]
        source: TransportError,
    },

    #[error("{operation} failed for message property '{property}': {source}")]
    Property {
        operation: Operation,
        property: String,
        #[source]
        source: TransportError,
    },

    #[error("{operation} failed: {source}")]
    Transport {
        operation: Operation,
        #[source]
        source: TransportError,
    },

    #[error("unexpected reply content: expected {expected:?}, received {actual:?}")]
    ContentMismatch { expected: String, actual: String },

    #[error("message taken from '{queue}' has no reply destination")]
    MissingReplyQueue { queue: String },

    #[error("invalid correlation id '{value}': {reason}")]
    InvalidCorrelationId { value: String, reason: String },

    #[error("invalid queue name '{0}'")]
    InvalidQueueName(String),

    #[error("deadline expired before {operation} could complete")]
    DeadlineExceeded { operation: Operation },

    #[error("exchange client has been shut down")]
    Closed,
}

impl ExchangeError {
    /// Status code reported to scripted callers for this failure.
    ///
    /// `2` flags a content problem (wrong reply body, malformed request);
    /// `1` covers every infrastructure failure.
    pub fn status_code(&self) -> i32 {
        if self.is_content_error() {
            2
        } else {
            1
        }
    }

    /// True for errors caused by message content rather than the transport.
    pub fn is_content_error(&self) -> bool {
        matches!(
            self,
            ExchangeError::ContentMismatch { .. } | ExchangeError::MissingReplyQueue { .. }
        )
    }

    /// Reason code of the underlying transport failure, if there is one.
    pub fn reason(&self) -> Option<ReasonCode> {
        match self {
            ExchangeError::Connection { source, .. }
            | ExchangeError::ConnectRetriesExhausted { source, .. }
            | ExchangeError::Queue { source, .. }
            | ExchangeError::Property { source, .. }
            | ExchangeError::Transport { source, .. } => Some(source.reason),
            _ => None,
        }
    }

    pub(crate) fn queue(operation: Operation, queue: &str, source: TransportError) -> Self {
        ExchangeError::Queue {
            operation,
            queue: queue.to_string(),
            source,
        }
    }
}

/// A drain that stopped on a fatal error, with the counts gathered so far.
#[derive(Debug, Error)]
#[error("drain of '{queue}' aborted after {} messages: {source}", .tally.consumed)]
pub struct DrainError {
    pub queue: String,
    pub tally: DrainTally,
    #[source]
    pub source: ExchangeError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_code_display() {
        assert_eq!(ReasonCode::NO_MSG_AVAILABLE.to_string(), "NO_MSG_AVAILABLE (2033)");
        assert_eq!(ReasonCode(9999).to_string(), "9999");
    }

    #[test]
    fn test_only_tls_initialization_is_transient() {
        assert!(ReasonCode::SSL_INITIALIZATION_ERROR.is_transient_connect_failure());
        assert!(!ReasonCode::Q_MGR_NOT_AVAILABLE.is_transient_connect_failure());
        assert!(!ReasonCode::NOT_AUTHORIZED.is_transient_connect_failure());
    }

    #[test]
    fn test_status_codes() {
        let mismatch = ExchangeError::ContentMismatch {
            expected: "a".into(),
            actual: "b".into(),
        };
        assert_eq!(mismatch.status_code(), 2);
        assert!(mismatch.reason().is_none());

        let get_failure = ExchangeError::queue(
            Operation::Get,
            "DEV.QUEUE.2",
            TransportError::failed(ReasonCode::CONNECTION_BROKEN),
        );
        assert_eq!(get_failure.status_code(), 1);
        assert_eq!(get_failure.reason(), Some(ReasonCode::CONNECTION_BROKEN));
        assert_eq!(
            get_failure.to_string(),
            "get failed on queue 'DEV.QUEUE.2': completion code 2, reason CONNECTION_BROKEN (2009)"
        );
    }

    #[test]
    fn test_drain_error_keeps_partial_tally() {
        let err = DrainError {
            queue: "DEV.QUEUE.3".into(),
            tally: DrainTally {
                consumed: 4,
                matched: 3,
                unmatched: 1,
            },
            source: ExchangeError::Closed,
        };
        assert_eq!(err.tally.consumed, 4);
        assert!(err.to_string().starts_with("drain of 'DEV.QUEUE.3' aborted after 4 messages"));
    }
}
