//! Event listener capability and the per-domain listener set.
//!
//! Listeners are registered as `Arc<dyn EventListener>` shared-ownership
//! handles: the registry retains one reference for as long as the listener
//! is registered in a domain, and releases it exactly once at unregistration
//! (explicit, or as part of [`terminate_all`](crate::registry::EventRegistry::terminate_all)).
//! The caller keeps its own reference and may drop it independently.

use std::sync::{Arc, Mutex};

use crate::error_codes::ErrorCode;
use crate::event::DomainEvent;

/// Caller-supplied capability invoked on event arrival or polling error.
///
/// Callbacks are invoked synchronously from the domain's polling task, one
/// event at a time, in server order. Keep them short — a long-running
/// callback delays every subsequent delivery for that domain.
///
/// A listener may be registered in multiple domains simultaneously; the
/// `domain` argument identifies which queue produced the call.
pub trait EventListener: Send + Sync {
    /// Called once per delivered event.
    fn on_event_received(&self, domain: &str, event: &DomainEvent);

    /// Called when polling for the domain hits an error: transport failures
    /// (polling retries automatically), malformed events (skipped), or
    /// contained internal faults. `detail` carries the error payload —
    /// for malformed events, the raw rejected value.
    fn on_event_error(&self, code: ErrorCode, domain: &str, detail: &serde_json::Value);
}

/// Per-domain set of registered listeners, keyed by `Arc` identity.
///
/// Owned by exactly one domain poller and mutated only through its own
/// internal lock, so listener churn on one domain never serializes behind
/// another domain's dispatch.
#[derive(Default)]
pub(crate) struct ListenerSet {
    inner: Mutex<Vec<Arc<dyn EventListener>>>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a listener. Idempotent: re-adding an already-present handle is a
    /// no-op and does not double-retain. Returns `false` if already present.
    pub(crate) fn add(&self, listener: &Arc<dyn EventListener>) -> bool {
        let mut inner = self.lock();
        if inner.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        inner.push(Arc::clone(listener));
        true
    }

    /// Remove a listener, releasing the retained reference. Idempotent:
    /// removing an absent handle is a no-op. Returns `true` if removed.
    pub(crate) fn remove(&self, listener: &Arc<dyn EventListener>) -> bool {
        let mut inner = self.lock();
        let before = inner.len();
        inner.retain(|l| !Arc::ptr_eq(l, listener));
        inner.len() != before
    }

    /// Stable ordered copy of the current listeners, in registration order.
    ///
    /// Dispatch iterates the snapshot, so concurrent add/remove never
    /// affects an in-flight batch: a listener added mid-dispatch joins from
    /// the next batch, a listener removed mid-dispatch may still see the
    /// in-flight one.
    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn EventListener>> {
        self.lock().clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every retained listener reference. Used at terminate time.
    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn EventListener>>> {
        // Listener callbacks run outside this lock, so a poisoned guard can
        // only mean a panic in our own bookkeeping; recover the inner value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    struct NullListener;

    impl EventListener for NullListener {
        fn on_event_received(&self, _domain: &str, _event: &DomainEvent) {}
        fn on_event_error(&self, _code: ErrorCode, _domain: &str, _detail: &serde_json::Value) {}
    }

    fn listener() -> Arc<dyn EventListener> {
        Arc::new(NullListener)
    }

    #[test]
    fn add_is_idempotent() {
        let set = ListenerSet::new();
        let l = listener();
        assert!(set.add(&l));
        assert!(!set.add(&l));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let set = ListenerSet::new();
        let l = listener();
        set.add(&l);
        assert!(set.remove(&l));
        assert!(!set.remove(&l));
        assert!(set.is_empty());
    }

    #[test]
    fn distinct_handles_are_distinct_entries() {
        let set = ListenerSet::new();
        let a = listener();
        let b = listener();
        set.add(&a);
        set.add(&b);
        assert_eq!(set.len(), 2);
        set.remove(&a);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let set = ListenerSet::new();
        let a = listener();
        let b = listener();
        set.add(&a);
        set.add(&b);
        let snap = set.snapshot();
        assert_eq!(snap.len(), 2);
        assert!(Arc::ptr_eq(&snap[0], &a));
        assert!(Arc::ptr_eq(&snap[1], &b));
    }

    #[test]
    fn snapshot_is_unaffected_by_later_mutation() {
        let set = ListenerSet::new();
        let a = listener();
        set.add(&a);
        let snap = set.snapshot();
        set.remove(&a);
        assert!(set.is_empty());
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn clear_drops_retained_references() {
        let set = ListenerSet::new();
        let a = listener();
        set.add(&a);
        set.clear();
        assert!(set.is_empty());
        // Our handle is now the only remaining reference.
        assert_eq!(Arc::strong_count(&a), 1);
    }
}
