//! Error codes passed to [`EventListener::on_event_error`](crate::listener::EventListener::on_event_error).
//!
//! These codes classify polling failures for listeners without exposing the
//! poller's internal state machine. They serialize as `SCREAMING_SNAKE_CASE`
//! strings to match the server's JSON error format.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes reported through the event listener error path.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// A network-level failure occurred while popping events. The poller
    /// retries after a backoff delay.
    NetworkError,
    /// The server rejected the pop request with a non-retryable error.
    /// The poller still retries after a backoff delay; only the
    /// classification differs.
    ServerError,
    /// An individual event in a batch was missing required fields and was
    /// skipped. The rest of the batch is unaffected.
    MalformedEvent,
    /// An unexpected internal fault (a panicking listener or transport) was
    /// contained by the poller.
    InternalError,
    /// The poller for this domain is shutting down.
    Canceled,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::NetworkError => {
                "A network error occurred while polling for events. Polling will retry automatically."
            }
            Self::ServerError => {
                "The server rejected the event pop request. Polling will retry automatically."
            }
            Self::MalformedEvent => {
                "The server returned an event missing required fields. The event was skipped."
            }
            Self::InternalError => {
                "An internal error occurred during event dispatch. Polling continues."
            }
            Self::Canceled => "Event polling for this domain is shutting down.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}
