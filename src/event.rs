//! Typed view of a popped domain event.
//!
//! The server's batch/event JSON shape is treated as opaque except for the
//! envelope fields extracted here. The free-form `event` body is whatever
//! the pushing client supplied.

use serde::{Deserialize, Serialize};

/// One event popped from a domain queue.
///
/// Parsed per item from the raw batch returned by the transport. A batch
/// entry that fails to parse is the malformed-payload case: it is logged,
/// reported once via `on_event_error`, and skipped without affecting the
/// rest of the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Server-assigned event id.
    pub id: String,
    /// Gamer id of the user who pushed the event.
    pub user: String,
    /// Display name of the pushing user, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form event body as supplied to the push call.
    pub event: serde_json::Value,
}
