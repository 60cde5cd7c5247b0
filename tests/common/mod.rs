#![allow(dead_code)]
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Shared test utilities for Cloudpop client integration tests.
//!
//! Provides a scriptable counting [`MockTransport`], panicking and gated
//! transport variants, plus recording and panicking [`EventListener`]
//! implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cloudpop_client::{
    BackoffPolicy, DomainEvent, ErrorCode, EventListener, EventTransport, PollerConfig,
    TransportError,
};
use serde_json::Value;
use tokio::sync::Notify;

// ── MockTransport ───────────────────────────────────────────────────

/// A scriptable mock transport.
///
/// Each `pop_events` call consumes the next scripted step for its domain,
/// or returns an empty batch when that domain's script is exhausted (the
/// real server behaves the same way for a drained queue). Steps can be
/// pushed at any time, so tests can feed events to an already-running
/// poller. Every call increments `pop_count`.
pub struct MockTransport {
    steps: Mutex<HashMap<String, VecDeque<Result<Vec<Value>, TransportError>>>>,
    pub pop_count: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(HashMap::new()),
            pop_count: AtomicUsize::new(0),
        })
    }

    /// Queue a successful batch of raw event values for `domain`.
    pub fn push_batch(&self, domain: &str, events: Vec<Value>) {
        self.steps
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .push_back(Ok(events));
    }

    /// Queue a transport error for `domain`.
    pub fn push_error(&self, domain: &str, error: TransportError) {
        self.steps
            .lock()
            .unwrap()
            .entry(domain.to_string())
            .or_default()
            .push_back(Err(error));
    }

    pub fn pops(&self) -> usize {
        self.pop_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventTransport for MockTransport {
    async fn pop_events(&self, domain: &str) -> Result<Vec<Value>, TransportError> {
        self.pop_count.fetch_add(1, Ordering::SeqCst);
        let step = self
            .steps
            .lock()
            .unwrap()
            .get_mut(domain)
            .and_then(VecDeque::pop_front);
        step.unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ── Faulty and gated transports ─────────────────────────────────────

/// Panics on every pop call.
pub struct PanickingTransport;

#[async_trait]
impl EventTransport for PanickingTransport {
    async fn pop_events(&self, _domain: &str) -> Result<Vec<Value>, TransportError> {
        panic!("transport failure injected by test");
    }
}

/// Parks every pop call until released, so tests control exactly when a
/// poll is in flight and when it completes.
pub struct GatedTransport {
    release: Notify,
    batches: Mutex<VecDeque<Vec<Value>>>,
    started: AtomicUsize,
}

impl GatedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Notify::new(),
            batches: Mutex::new(VecDeque::new()),
            started: AtomicUsize::new(0),
        })
    }

    /// Queue the batch returned by the next released pop.
    pub fn push_batch(&self, events: Vec<Value>) {
        self.batches.lock().unwrap().push_back(events);
    }

    /// Let one parked (or the next) pop call complete.
    pub fn release_one(&self) {
        self.release.notify_one();
    }

    /// Number of pop calls that have started, released or not.
    pub fn pops_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventTransport for GatedTransport {
    async fn pop_events(&self, _domain: &str) -> Result<Vec<Value>, TransportError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }
}

// ── Listeners ───────────────────────────────────────────────────────

/// Records every callback it receives.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<(String, DomainEvent)>>,
    pub errors: Mutex<Vec<(ErrorCode, String, Value)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<(String, DomainEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<(ErrorCode, String, Value)> {
        self.errors.lock().unwrap().clone()
    }

    /// Event ids in delivery order.
    pub fn event_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .map(|(_, event)| event.id)
            .collect()
    }
}

impl EventListener for RecordingListener {
    fn on_event_received(&self, domain: &str, event: &DomainEvent) {
        self.events
            .lock()
            .unwrap()
            .push((domain.to_string(), event.clone()));
    }

    fn on_event_error(&self, code: ErrorCode, domain: &str, detail: &Value) {
        self.errors
            .lock()
            .unwrap()
            .push((code, domain.to_string(), detail.clone()));
    }
}

/// Panics on every delivered event; records error callbacks.
#[derive(Default)]
pub struct PanickingListener {
    pub errors: Mutex<Vec<ErrorCode>>,
}

impl PanickingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl EventListener for PanickingListener {
    fn on_event_received(&self, _domain: &str, _event: &DomainEvent) {
        panic!("listener failure injected by test");
    }

    fn on_event_error(&self, code: ErrorCode, _domain: &str, _detail: &Value) {
        self.errors.lock().unwrap().push(code);
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Poller tunables shrunk for fast tests.
pub fn test_config() -> PollerConfig {
    PollerConfig::new()
        .with_poll_delay(Duration::from_millis(20))
        .with_backoff(BackoffPolicy {
            first: Duration::from_millis(10),
            max: Duration::from_millis(40),
            factor: 2.0,
        })
        .with_shutdown_timeout(Duration::from_millis(500))
}

/// A well-formed raw event as the server would return it.
pub fn raw_event(id: &str) -> Value {
    serde_json::json!({
        "id": id,
        "user": "gamer_42",
        "name": "Alice",
        "event": { "message": format!("hello from {id}") },
    })
}

/// Poll `condition` every few milliseconds until it holds or `timeout`
/// expires. Returns whether the condition held.
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
