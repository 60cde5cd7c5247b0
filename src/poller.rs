//! Per-domain background polling task.
//!
//! Each active domain owns one spawned task running [`PollLoop::run`]. The
//! loop repeatedly pops a batch from the transport and dispatches it to the
//! domain's listeners, honoring the registry's suspend/network gate at the
//! top of every iteration and a stop handshake at every suspension point.
//!
//! Lifecycle handshake: the registry flips a poller to `Stopping` when its
//! last listener is unregistered; the task confirms the stop by moving to
//! `Stopped` and removing its own table entry, both under the table lock.
//! Re-registering before the task confirms simply flips the state back to
//! `Running` — the pending stop is cancelled and no duplicate poller can
//! appear.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error_codes::ErrorCode;
use crate::event::DomainEvent;
use crate::listener::{EventListener, ListenerSet};
use crate::transport::EventTransport;

// ── Tunables ────────────────────────────────────────────────────────

/// Default delay between polls after an empty batch.
const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(2);

/// Default timeout for joining poller tasks at terminate time.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Retry backoff policy applied after transport errors.
///
/// The delay for attempt `n` is `first × factor^n`, clamped to `max`. The
/// attempt counter resets on the first successful pop.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cloudpop_client::BackoffPolicy;
///
/// let backoff = BackoffPolicy {
///     first: Duration::from_millis(500),
///     max: Duration::from_secs(30),
///     factor: 2.0,
/// };
/// assert_eq!(backoff.delay(0), Duration::from_millis(500));
/// assert_eq!(backoff.delay(1), Duration::from_secs(1));
/// assert_eq!(backoff.delay(30), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0`).
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay for the given retry attempt (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.factor.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.first.as_millis() as f64 * factor;
        if !millis.is_finite() || millis >= self.max.as_millis() as f64 {
            return self.max;
        }
        Duration::from_millis(millis as u64).min(self.max)
    }
}

/// Tunables for domain pollers.
///
/// Supplied to [`EventRegistry::with_config`](crate::registry::EventRegistry::with_config);
/// one config applies to every domain.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use cloudpop_client::PollerConfig;
///
/// let config = PollerConfig::new()
///     .with_poll_delay(Duration::from_secs(5))
///     .with_shutdown_timeout(Duration::from_secs(2));
/// assert_eq!(config.poll_delay, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Delay between polls after an empty batch. A non-empty batch is
    /// followed by an immediate re-poll.
    ///
    /// Defaults to **2 seconds**.
    pub poll_delay: Duration,
    /// Backoff policy applied after transport errors.
    pub backoff: BackoffPolicy,
    /// How long [`terminate_all`](crate::registry::EventRegistry::terminate_all)
    /// waits for each poller task before aborting it.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_delay: DEFAULT_POLL_DELAY,
            backoff: BackoffPolicy::default(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl PollerConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the delay between polls after an empty batch.
    #[must_use]
    pub fn with_poll_delay(mut self, delay: Duration) -> Self {
        self.poll_delay = delay;
        self
    }

    /// Set the retry backoff policy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the per-task join timeout used at terminate time.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Lifecycle ───────────────────────────────────────────────────────

/// Poller lifecycle as observed by the registry and the task.
///
/// Transitions: `Running → Stopping` (registry, on last unregister or
/// terminate), `Stopping → Running` (registry, cancelling a pending stop),
/// `Stopping → Stopped` (the task itself, confirming exit). All transitions
/// happen with the table lock held, so they are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Running,
    Stopping,
    Stopped,
}

/// Process-wide pause gate shared by every poller.
///
/// Pollers pause while the application is suspended or the network is
/// reported down; both flags are carried on one `watch` channel so a change
/// to either wakes every paused poller.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GateState {
    pub(crate) suspended: bool,
    pub(crate) network_up: bool,
}

impl GateState {
    pub(crate) fn open() -> Self {
        Self {
            suspended: false,
            network_up: true,
        }
    }

    pub(crate) fn blocked(&self) -> bool {
        self.suspended || !self.network_up
    }
}

// ── Table entry ─────────────────────────────────────────────────────

/// Registry table entry for one domain's poller.
pub(crate) struct DomainPoller {
    pub(crate) listeners: Arc<ListenerSet>,
    pub(crate) lifecycle: Arc<Mutex<Lifecycle>>,
    /// Wakes the task out of any blocking wait so it re-checks its state.
    pub(crate) wake: watch::Sender<()>,
    pub(crate) handle: JoinHandle<()>,
}

/// Domain → poller table shared between the registry and its tasks.
pub(crate) type PollerTable = Arc<Mutex<HashMap<String, DomainPoller>>>;

pub(crate) fn lock_poisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Spawn the polling task for `domain` and return its table entry.
///
/// The task starts in `Running` (it pauses immediately if the gate is
/// already closed) and holds only a `Weak` reference to the table so a
/// dropped registry never leaks through its tasks.
pub(crate) fn spawn_poller(
    domain: String,
    transport: Arc<dyn EventTransport>,
    listeners: Arc<ListenerSet>,
    config: PollerConfig,
    table: Weak<Mutex<HashMap<String, DomainPoller>>>,
    gate_rx: watch::Receiver<GateState>,
) -> DomainPoller {
    let lifecycle = Arc::new(Mutex::new(Lifecycle::Running));
    let (wake_tx, wake_rx) = watch::channel(());

    let poll_loop = PollLoop {
        domain,
        transport,
        listeners: Arc::clone(&listeners),
        lifecycle: Arc::clone(&lifecycle),
        table,
        config,
    };
    let handle = tokio::spawn(poll_loop.run(wake_rx, gate_rx));

    DomainPoller {
        listeners,
        lifecycle,
        wake: wake_tx,
        handle,
    }
}

// ── Poll loop ───────────────────────────────────────────────────────

struct PollLoop {
    domain: String,
    transport: Arc<dyn EventTransport>,
    listeners: Arc<ListenerSet>,
    lifecycle: Arc<Mutex<Lifecycle>>,
    table: Weak<Mutex<HashMap<String, DomainPoller>>>,
    config: PollerConfig,
}

impl PollLoop {
    /// The per-domain polling loop.
    ///
    /// Suspension points (pause wait, inter-poll delay, backoff delay, the
    /// pop call itself) all race against the wake channel, so a stop signal
    /// is observed promptly and teardown is bounded.
    async fn run(self, mut wake_rx: watch::Receiver<()>, mut gate_rx: watch::Receiver<GateState>) {
        debug!(domain = %self.domain, "event poller started");
        let mut attempt: u32 = 0;

        loop {
            if self.confirm_stop() {
                break;
            }

            // Pause gate, checked only between iterations — an already
            // fetched batch is always dispatched before pausing.
            if gate_rx.borrow().blocked() {
                debug!(domain = %self.domain, "event poller paused");
                loop {
                    tokio::select! {
                        _ = gate_rx.changed() => {}
                        _ = wake_rx.changed() => {}
                    }
                    if self.confirm_stop() {
                        debug!(domain = %self.domain, "event poller stopped while paused");
                        return;
                    }
                    if !gate_rx.borrow().blocked() {
                        break;
                    }
                }
                debug!(domain = %self.domain, "event poller resumed");
                continue;
            }

            // Pop one batch, racing the wake channel so a stop signal can
            // cancel the in-flight call. Suspend does not cancel it: the
            // gate is only consulted at the top of the next iteration. The
            // call is wrapped so a panicking transport is contained and
            // reported like any other transport fault instead of killing
            // the task and leaving a stale table entry behind.
            let outcome = tokio::select! {
                res = AssertUnwindSafe(self.transport.pop_events(&self.domain)).catch_unwind() => res,
                _ = wake_rx.changed() => continue,
            };
            let popped = match outcome {
                Ok(res) => res,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(
                        domain = %self.domain,
                        error = message,
                        "transport panicked during event pop"
                    );
                    let detail = serde_json::json!({
                        "error": "transport panicked during event pop",
                        "panic": message,
                    });
                    for listener in self.listeners.snapshot() {
                        self.deliver_error(&listener, ErrorCode::InternalError, &detail);
                    }
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wake_rx.changed() => {}
                    }
                    continue;
                }
            };

            match popped {
                Ok(batch) => {
                    attempt = 0;
                    if batch.is_empty() {
                        tokio::select! {
                            _ = sleep(self.config.poll_delay) => {}
                            _ = wake_rx.changed() => {}
                        }
                    } else {
                        self.dispatch(batch);
                    }
                }
                Err(err) => {
                    let code = if err.retryable {
                        ErrorCode::NetworkError
                    } else {
                        ErrorCode::ServerError
                    };
                    warn!(
                        domain = %self.domain,
                        error = %err.message,
                        retryable = err.retryable,
                        "event pop failed"
                    );
                    let detail = serde_json::json!({
                        "error": err.message,
                        "retryable": err.retryable,
                    });
                    for listener in self.listeners.snapshot() {
                        self.deliver_error(&listener, code, &detail);
                    }
                    let delay = self.config.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = wake_rx.changed() => {}
                    }
                }
            }
        }

        debug!(domain = %self.domain, "event poller stopped");
    }

    /// Deliver one batch to the current listener snapshot, one event at a
    /// time, in server order. Malformed entries are skipped and reported;
    /// the rest of the batch is unaffected.
    fn dispatch(&self, batch: Vec<serde_json::Value>) {
        let listeners = self.listeners.snapshot();
        debug!(
            domain = %self.domain,
            events = batch.len(),
            listeners = listeners.len(),
            "dispatching event batch"
        );
        for raw in batch {
            match serde_json::from_value::<DomainEvent>(raw.clone()) {
                Ok(event) => {
                    for listener in &listeners {
                        self.deliver_event(listener, &event);
                    }
                }
                Err(err) => {
                    warn!(
                        domain = %self.domain,
                        error = %err,
                        "skipping malformed event payload"
                    );
                    for listener in &listeners {
                        self.deliver_error(listener, ErrorCode::MalformedEvent, &raw);
                    }
                }
            }
        }
    }

    /// Invoke `on_event_received`, containing listener panics so one faulty
    /// listener cannot kill the domain's poller.
    fn deliver_event(&self, listener: &Arc<dyn EventListener>, event: &DomainEvent) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            listener.on_event_received(&self.domain, event);
        }));
        if outcome.is_err() {
            error!(
                domain = %self.domain,
                event_id = %event.id,
                "listener panicked during event dispatch"
            );
            let detail = serde_json::json!({
                "error": "listener panicked during event dispatch",
                "event_id": event.id,
            });
            self.deliver_error(listener, ErrorCode::InternalError, &detail);
        }
    }

    /// Invoke `on_event_error`, containing listener panics.
    fn deliver_error(
        &self,
        listener: &Arc<dyn EventListener>,
        code: ErrorCode,
        detail: &serde_json::Value,
    ) {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            listener.on_event_error(code, &self.domain, detail);
        }));
        if outcome.is_err() {
            error!(domain = %self.domain, "listener panicked during error dispatch");
        }
    }

    /// Stop handshake. Locks the table and then the lifecycle (the same
    /// order the registry uses), so a pending stop and its cancellation
    /// cannot interleave. Confirming a stop removes this poller's own table
    /// entry, guaranteeing the table never holds a stopped poller.
    fn confirm_stop(&self) -> bool {
        let Some(table) = self.table.upgrade() else {
            // Registry dropped; nothing left to clean up.
            return true;
        };
        let mut table = lock_poisoned(&table);
        let mut lifecycle = lock_poisoned(&self.lifecycle);
        match *lifecycle {
            Lifecycle::Running => false,
            Lifecycle::Stopping => {
                *lifecycle = Lifecycle::Stopped;
                drop(lifecycle);
                // Remove only our own entry; terminate_all may have drained
                // the table already.
                let ours = table
                    .get(&self.domain)
                    .is_some_and(|p| Arc::ptr_eq(&p.lifecycle, &self.lifecycle));
                if ours {
                    table.remove(&self.domain);
                }
                true
            }
            Lifecycle::Stopped => true,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn backoff_first_attempt_uses_first_delay() {
        let backoff = BackoffPolicy::default();
        assert_eq!(backoff.delay(0), Duration::from_millis(500));
    }

    #[test]
    fn backoff_grows_by_factor() {
        let backoff = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
    }

    #[test]
    fn backoff_is_clamped_to_max() {
        let backoff = BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
        };
        assert_eq!(backoff.delay(30), Duration::from_secs(10));
        // Large enough to overflow the float math — still clamped.
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn backoff_constant_factor_keeps_first_delay() {
        let backoff = BackoffPolicy {
            first: Duration::from_millis(250),
            max: Duration::from_secs(10),
            factor: 1.0,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(250));
        assert_eq!(backoff.delay(5), Duration::from_millis(250));
    }

    #[test]
    fn config_defaults() {
        let config = PollerConfig::default();
        assert_eq!(config.poll_delay, Duration::from_secs(2));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_builder_methods() {
        let config = PollerConfig::new()
            .with_poll_delay(Duration::from_millis(10))
            .with_shutdown_timeout(Duration::from_millis(100))
            .with_backoff(BackoffPolicy {
                first: Duration::from_millis(1),
                max: Duration::from_millis(5),
                factor: 1.5,
            });
        assert_eq!(config.poll_delay, Duration::from_millis(10));
        assert_eq!(config.shutdown_timeout, Duration::from_millis(100));
        assert_eq!(config.backoff.max, Duration::from_millis(5));
    }

    #[test]
    fn gate_state_blocked() {
        let open = GateState::open();
        assert!(!open.blocked());
        let suspended = GateState {
            suspended: true,
            network_up: true,
        };
        assert!(suspended.blocked());
        let offline = GateState {
            suspended: false,
            network_up: false,
        };
        assert!(offline.blocked());
    }
}
