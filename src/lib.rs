//! # Cloudpop Client
//!
//! Transport-agnostic Rust client for the Cloudpop event-domain polling
//! protocol.
//!
//! The Cloudpop backend queues events per named *domain* (a pub/sub topic).
//! This crate keeps one background polling task open per domain with
//! registered listeners, repeatedly pops queued events over a caller-supplied
//! [`EventTransport`], and fans each event out to every registered
//! [`EventListener`] in server order.
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`EventTransport`] trait for any backend
//! - **One poller per domain** — spawned on first listener, stopped on last
//! - **Suspend/resume** — pause all polling while the host app is backgrounded
//! - **Resilient** — transport errors back off and retry; malformed events
//!   and panicking listeners are contained, never fatal
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! let registry = EventRegistry::new(Arc::new(my_transport));
//! registry.register_event_listener("private", Arc::new(MyListener))?;
//! // ...
//! registry.terminate_all().await;
//! ```

pub mod error;
pub mod error_codes;
pub mod event;
pub mod listener;
pub mod poller;
pub mod registry;
pub mod transport;

// Re-export primary types for ergonomic imports.
pub use error::CloudpopError;
pub use error_codes::ErrorCode;
pub use event::DomainEvent;
pub use listener::EventListener;
pub use poller::{BackoffPolicy, PollerConfig};
pub use registry::EventRegistry;
pub use transport::{EventTransport, TransportError};

/// The default event domain, reserved for system notifications.
pub const PRIVATE_DOMAIN: &str = "private";
