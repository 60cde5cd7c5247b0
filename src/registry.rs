//! Domain → poller registry and the suspend/resume surface.
//!
//! [`EventRegistry`] is the owned top-level object of the polling subsystem:
//! construct one per session and keep it alive for the session's lifetime.
//! Registering the first listener for a domain spawns that domain's polling
//! task; unregistering the last one stops it. All domains pause together on
//! [`suspend`](EventRegistry::suspend) (or a network-down report) and resume
//! together on [`resume`](EventRegistry::resume).
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = EventRegistry::new(transport);
//! registry.register_event_listener("private", Arc::clone(&listener))?;
//! // ... events now flow to listener.on_event_received("private", ...)
//! registry.unregister_event_listener("private", &listener);
//! registry.terminate_all().await;
//! ```

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{CloudpopError, Result};
use crate::error_codes::ErrorCode;
use crate::listener::{EventListener, ListenerSet};
use crate::poller::{
    lock_poisoned, spawn_poller, DomainPoller, GateState, Lifecycle, PollerConfig, PollerTable,
};
use crate::transport::EventTransport;

/// Registry of per-domain event pollers.
///
/// One polling task runs per domain with at least one registered listener.
/// A poller exists in the table iff its listener set is non-empty, except
/// during the transient stop window — and the table entry is only removed
/// once the task has actually exited, so no orphaned entry can linger.
///
/// Unregistering the last listener of a domain stops only that domain's
/// poller; other domains are unaffected. [`terminate_all`](Self::terminate_all)
/// stops everything and waits until quiescent.
pub struct EventRegistry {
    transport: Arc<dyn EventTransport>,
    config: PollerConfig,
    table: PollerTable,
    /// Suspend/network gate broadcast to every poller.
    gate: watch::Sender<GateState>,
}

impl EventRegistry {
    /// Create a registry with default [`PollerConfig`] tunables.
    pub fn new(transport: Arc<dyn EventTransport>) -> Self {
        Self::with_config(transport, PollerConfig::default())
    }

    /// Create a registry with explicit tunables.
    pub fn with_config(transport: Arc<dyn EventTransport>, config: PollerConfig) -> Self {
        let (gate, _) = watch::channel(GateState::open());
        Self {
            transport,
            config,
            table: Arc::new(Mutex::new(HashMap::new())),
            gate,
        }
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register `listener` for `domain`, spawning the domain's poller if
    /// this is its first listener.
    ///
    /// Idempotent per handle: registering an already-registered listener is
    /// a no-op. If the domain's poller has a stop pending (its last
    /// listener was just unregistered and the task has not yet exited), the
    /// pending stop is cancelled and the same poller keeps running.
    ///
    /// # Errors
    ///
    /// Returns [`CloudpopError::BadParameter`] if `domain` is empty. The
    /// error is surfaced synchronously; nothing reaches a background task.
    pub fn register_event_listener(
        &self,
        domain: &str,
        listener: Arc<dyn EventListener>,
    ) -> Result<()> {
        if domain.is_empty() {
            return Err(CloudpopError::BadParameter(
                "event domain must not be empty".into(),
            ));
        }

        let mut table = lock_poisoned(&self.table);
        if let Some(poller) = table.get(domain) {
            // A task that died without confirming a stop can never clean up
            // its own entry; replace it below like a Stopped one.
            if poller.handle.is_finished() {
                warn!(domain, "poller task is dead; recreating");
            } else {
                let mut lifecycle = lock_poisoned(&poller.lifecycle);
                match *lifecycle {
                    Lifecycle::Running => {
                        drop(lifecycle);
                        poller.listeners.add(&listener);
                        return Ok(());
                    }
                    Lifecycle::Stopping => {
                        // The task has not confirmed the stop yet (confirmation
                        // happens under the table lock we hold), so flipping
                        // back to Running deterministically cancels it.
                        *lifecycle = Lifecycle::Running;
                        drop(lifecycle);
                        poller.listeners.add(&listener);
                        let _ = poller.wake.send(());
                        debug!(domain, "cancelled pending poller stop");
                        return Ok(());
                    }
                    // A stopped task removes its entry under the table lock,
                    // so this arm is unreachable; recreate defensively.
                    Lifecycle::Stopped => {
                        drop(lifecycle);
                    }
                }
            }
        }

        let listeners = match table.remove(domain) {
            // Stale entry (dead task, or the Stopped arm above): carry the
            // surviving listener set over to the fresh poller.
            Some(stale) => Arc::clone(&stale.listeners),
            None => Arc::new(ListenerSet::new()),
        };
        listeners.add(&listener);

        debug!(domain, "starting event poller");
        let poller = spawn_poller(
            domain.to_string(),
            Arc::clone(&self.transport),
            listeners,
            self.config.clone(),
            Arc::downgrade(&self.table),
            self.gate.subscribe(),
        );
        table.insert(domain.to_string(), poller);
        Ok(())
    }

    /// Unregister `listener` from `domain`, releasing the registry's
    /// retained reference. No-op if not registered.
    ///
    /// If this removes the domain's last listener, the poller is signalled
    /// to stop and this call returns immediately; the task exits after
    /// finishing any in-flight dispatch and removes its own table entry.
    pub fn unregister_event_listener(&self, domain: &str, listener: &Arc<dyn EventListener>) {
        let mut table = lock_poisoned(&self.table);
        let Some(poller) = table.get(domain) else {
            return;
        };
        poller.listeners.remove(listener);
        if poller.handle.is_finished() {
            // A dead task can never confirm a stop; drop its entry here.
            warn!(domain, "poller task is dead; removing its entry");
            table.remove(domain);
            return;
        }
        if poller.listeners.is_empty() {
            let mut lifecycle = lock_poisoned(&poller.lifecycle);
            if *lifecycle == Lifecycle::Running {
                *lifecycle = Lifecycle::Stopping;
                drop(lifecycle);
                let _ = poller.wake.send(());
                debug!(domain, "last listener removed, stopping event poller");
            }
        }
    }

    // ── Suspend / resume ────────────────────────────────────────────

    /// Pause all domain pollers before their next network pop.
    ///
    /// Lazy: a poller mid-dispatch finishes the batch first, and an
    /// in-flight pop call is not interrupted — it completes and its batch
    /// is dispatched normally before the poller pauses. Idempotent.
    pub fn suspend(&self) {
        self.gate.send_modify(|g| g.suspended = true);
        debug!("event polling suspended");
    }

    /// Resume all paused pollers immediately. Idempotent.
    pub fn resume(&self) {
        self.gate.send_modify(|g| g.suspended = false);
        debug!("event polling resumed");
    }

    /// Report network availability. While the network is down, pollers
    /// pause exactly as under [`suspend`](Self::suspend); the two gates are
    /// independent and polling resumes only when both are open.
    pub fn set_network_state(&self, up: bool) {
        self.gate.send_modify(|g| g.network_up = up);
        debug!(network_up = up, "network state changed");
    }

    /// Returns `true` while the registry is suspended.
    pub fn is_suspended(&self) -> bool {
        self.gate.borrow().suspended
    }

    // ── Introspection ───────────────────────────────────────────────

    /// Domains that currently have a live poller (including ones with a
    /// stop pending whose task has not yet exited).
    pub fn active_domains(&self) -> Vec<String> {
        lock_poisoned(&self.table).keys().cloned().collect()
    }

    /// Number of listeners currently registered for `domain`.
    pub fn listener_count(&self, domain: &str) -> usize {
        lock_poisoned(&self.table)
            .get(domain)
            .map_or(0, |p| p.listeners.len())
    }

    // ── Termination ─────────────────────────────────────────────────

    /// Stop every poller and wait until all their tasks have exited.
    ///
    /// Each task is given the configured shutdown timeout to observe the
    /// stop signal; a task that does not exit in time is aborted so
    /// termination is bounded. Every remaining listener is notified with
    /// [`ErrorCode::Canceled`] and its retained reference is released.
    /// Call once at session shutdown.
    pub async fn terminate_all(&self) {
        let drained: Vec<(String, DomainPoller)> = {
            let mut table = lock_poisoned(&self.table);
            table.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!(pollers = drained.len(), "terminating all event pollers");

        for (_, poller) in &drained {
            let mut lifecycle = lock_poisoned(&poller.lifecycle);
            if *lifecycle == Lifecycle::Running {
                *lifecycle = Lifecycle::Stopping;
            }
            drop(lifecycle);
            let _ = poller.wake.send(());
        }

        for (domain, mut poller) in drained {
            match tokio::time::timeout(self.config.shutdown_timeout, &mut poller.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!(domain = %domain, "poller task terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!(domain = %domain, "poller did not exit within timeout; aborting task");
                    poller.handle.abort();
                    if let Err(join_err) = poller.handle.await {
                        debug!(domain = %domain, "poller task aborted: {join_err}");
                    }
                }
            }
            // Tell the remaining listeners their domain is gone, then
            // release the retained references exactly once.
            let detail = serde_json::json!({ "error": "event polling terminated" });
            for listener in poller.listeners.snapshot() {
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    listener.on_event_error(ErrorCode::Canceled, &domain, &detail);
                }));
                if outcome.is_err() {
                    warn!(domain = %domain, "listener panicked during cancel notification");
                }
            }
            poller.listeners.clear();
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("active_domains", &self.active_domains())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

impl Drop for EventRegistry {
    fn drop(&mut self) {
        // `Drop` is synchronous, so a graceful join is impossible here;
        // abort any still-running tasks instead. Their wake channels and
        // the weak table reference die with us, so nothing detaches.
        let mut table = lock_poisoned(&self.table);
        for (_, poller) in table.drain() {
            poller.handle.abort();
        }
    }
}
