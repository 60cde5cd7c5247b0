//! Transport abstraction for popping queued domain events.
//!
//! The [`EventTransport`] trait defines the single network primitive the
//! polling subsystem consumes: retrieve-and-remove the next batch of queued
//! events for a domain. Everything else about the backend (endpoints,
//! authentication, connection management) lives behind this seam.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use cloudpop_client::transport::{EventTransport, TransportError};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl EventTransport for MyTransport {
//!     async fn pop_events(
//!         &self,
//!         domain: &str,
//!     ) -> Result<Vec<serde_json::Value>, TransportError> {
//!         // Issue the pop request for `domain` and return the raw event
//!         // objects. An empty Vec means no events were queued.
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;
use thiserror::Error;

/// A failure reported by an [`EventTransport`] pop call.
///
/// The `retryable` flag classifies the failure: network-level problems
/// (timeouts, connection resets) are retryable, while server-side rejections
/// (bad credentials, unknown domain) are not. The poller retries in both
/// cases; the classification only affects the [`ErrorCode`](crate::ErrorCode)
/// reported to listeners.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TransportError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the failure is transient (network) or a server rejection.
    pub retryable: bool,
}

impl TransportError {
    /// A transient network-level failure.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A non-retryable server-side rejection.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// The network primitive for retrieving queued domain events.
///
/// Implementors issue one "pop" request per call, removing the returned
/// events from the server-side queue for `domain`. A call may block until
/// events arrive (long-poll) or return an empty batch immediately; the
/// poller handles pacing either way.
///
/// # Object Safety
///
/// This trait is object-safe; the registry stores it as
/// `Arc<dyn EventTransport>` shared by every domain poller.
///
/// # Cancel Safety
///
/// [`pop_events`](EventTransport::pop_events) **MUST** be cancel-safe: the
/// poller awaits it inside `tokio::select!` together with its stop signal,
/// and drops the in-flight future on shutdown. Events already removed from
/// the server queue by a cancelled call may be lost; this only happens
/// during teardown.
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Pop the next batch of queued events for `domain`.
    ///
    /// Returns the raw event objects in server order. The batch may be
    /// empty. Event shape is opaque to the transport; the poller extracts
    /// the required fields and skips malformed entries.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] classified as retryable (network) or
    /// non-retryable (server rejection).
    async fn pop_events(&self, domain: &str) -> Result<Vec<serde_json::Value>, TransportError>;
}
