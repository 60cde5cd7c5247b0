//! Error types for the Cloudpop client.
//!
//! Only parameter validation is surfaced through [`CloudpopError`]:
//! asynchronous faults (transport failures, malformed events, contained
//! panics, termination) reach listeners through
//! [`EventListener::on_event_error`](crate::listener::EventListener::on_event_error)
//! with an [`ErrorCode`](crate::error_codes::ErrorCode) instead.

use thiserror::Error;

/// Errors returned synchronously by registry calls.
#[derive(Debug, Error)]
pub enum CloudpopError {
    /// A caller-supplied parameter was invalid (e.g. an empty domain).
    #[error("bad parameter: {0}")]
    BadParameter(String),
}

/// A specialized [`Result`] type for Cloudpop client operations.
pub type Result<T> = std::result::Result<T, CloudpopError>;
