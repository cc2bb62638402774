//! Coordination store abstraction
//!
//! A store holds string keys bound optionally to leases, lists keys under a
//! prefix and streams PUT/DELETE changes under a prefix to subscribers.

use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

/// Identifier of a lease granted by the store
pub type LeaseId = i64;

/// One key and its value
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Put,
    Delete,
}

/// A change under a watched prefix.
///
/// PUT events carry the new key-value in `kv`; DELETE events carry the
/// deleted key-value in `prev_kv`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub kv: Option<KeyValue>,
    pub prev_kv: Option<KeyValue>,
}

impl WatchEvent {
    pub fn put(kv: KeyValue) -> Self {
        Self {
            kind: EventKind::Put,
            kv: Some(kv),
            prev_kv: None,
        }
    }

    pub fn delete(prev_kv: KeyValue) -> Self {
        Self {
            kind: EventKind::Delete,
            kv: None,
            prev_kv: Some(prev_kv),
        }
    }
}

/// Item delivered on a subscription; errors do not end the feed
pub type WatchItem = Result<WatchEvent>;

/// Runs a cancel action at most once, explicitly or when dropped
pub struct CancelHandle {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancelHandle {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Run the cancel action if it has not run yet
    pub fn cancel(&self) {
        let action = self
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Live change feed for a prefix; dropping it ends the watch
#[derive(Debug)]
pub struct Subscription {
    pub events: mpsc::UnboundedReceiver<WatchItem>,
    pub handle: CancelHandle,
}

/// A lease kept alive by the store until cancelled or dropped.
///
/// Cancelling stops renewal; keys bound to the lease disappear once its TTL
/// runs out.
#[derive(Debug)]
pub struct Lease {
    id: LeaseId,
    handle: CancelHandle,
}

impl Lease {
    pub fn new(id: LeaseId, handle: CancelHandle) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    /// Stop renewing the lease
    pub fn cancel(&self) {
        self.handle.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.handle.is_cancelled()
    }
}

/// Distributed coordination store used for registration and discovery
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write `key`, bound to `lease` when given
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()>;

    /// Delete `key`; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// All key-values under `prefix`, ordered by key
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Subscribe to changes under `prefix`
    async fn watch(&self, prefix: &str) -> Result<Subscription>;

    /// Grant a lease with `ttl` and keep renewing it in the background
    async fn lease_keep_alive(&self, ttl: Duration) -> Result<Lease>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cancel_handle_runs_once() {
        let runs = Arc::new(AtomicUsize::new(0));
        let handle = {
            let runs = runs.clone();
            CancelHandle::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
        drop(handle);

        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_handle_runs_on_drop() {
        let runs = Arc::new(AtomicUsize::new(0));
        {
            let runs = runs.clone();
            let _handle = CancelHandle::new(move || {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watch_event_constructors() {
        let put = WatchEvent::put(KeyValue::new("svcA/1", "10.0.0.1:9000"));
        assert_eq!(put.kind, EventKind::Put);
        assert!(put.prev_kv.is_none());

        let delete = WatchEvent::delete(KeyValue::new("svcA/1", "10.0.0.1:9000"));
        assert_eq!(delete.kind, EventKind::Delete);
        assert!(delete.kv.is_none());
    }
}
