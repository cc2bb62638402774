//! In-process coordination store
//!
//! Keeps etcd's observable semantics for the operations discovery needs:
//! ordered prefix listing, prefix watches delivering previous key-values on
//! delete, and leases whose keys vanish once renewal stops and the TTL runs
//! out. Used for single-process deployments and tests.

use crate::store::{
    CancelHandle, CoordinationStore, KeyValue, Lease, LeaseId, Subscription, WatchEvent, WatchItem,
};
use crate::{DiscoveryError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::debug;

/// How often expired leases are reaped
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest interval between lease renewals
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// In-memory coordination store; clones share the same data
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Entry>,
    leases: HashMap<LeaseId, LeaseState>,
    watchers: HashMap<u64, Watcher>,
    next_lease: LeaseId,
    next_watcher: u64,
    sweeper_running: bool,
}

struct Entry {
    value: String,
    lease: Option<LeaseId>,
}

struct LeaseState {
    ttl: Duration,
    deadline: Instant,
}

struct Watcher {
    prefix: String,
    sender: mpsc::UnboundedSender<WatchItem>,
}

impl MemoryState {
    fn notify(&mut self, event: WatchEvent) {
        let key = match event.kv.as_ref().or(event.prev_kv.as_ref()) {
            Some(kv) => kv.key.clone(),
            None => return,
        };

        self.watchers.retain(|_, watcher| {
            if !key.starts_with(&watcher.prefix) {
                return true;
            }
            watcher.sender.send(Ok(event.clone())).is_ok()
        });
    }

    fn remove_entry(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.notify(WatchEvent::delete(KeyValue::new(key, entry.value)));
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            self.leases.remove(&id);
            let keys: Vec<String> = self
                .entries
                .iter()
                .filter(|(_, entry)| entry.lease == Some(id))
                .map(|(key, _)| key.clone())
                .collect();

            debug!("Lease {} expired, removing {} keys", id, keys.len());
            for key in keys {
                self.remove_entry(&key);
            }
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `item` to every live subscription, whatever its prefix.
    ///
    /// Lets callers feed faulty events to watchers.
    pub fn inject(&self, item: WatchItem) {
        self.lock()
            .watchers
            .retain(|_, watcher| watcher.sender.send(item.clone()).is_ok());
    }

    /// Number of live subscriptions
    pub fn watcher_count(&self) -> usize {
        self.lock().watchers.len()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        lock_state(&self.inner)
    }

    // Locks the state after reaping leases that ran out
    fn lock_current(&self) -> MutexGuard<'_, MemoryState> {
        let mut state = self.lock();
        state.expire_leases(Instant::now());
        state
    }

    fn ensure_sweeper(&self, state: &mut MemoryState) {
        if state.sweeper_running {
            return;
        }
        state.sweeper_running = true;

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                time::sleep(SWEEP_INTERVAL).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                lock_state(&inner).expire_leases(Instant::now());
            }
        });
    }
}

fn lock_state(inner: &Mutex<MemoryState>) -> MutexGuard<'_, MemoryState> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn renew_lease(weak: Weak<Mutex<MemoryState>>, id: LeaseId, interval: Duration) {
    loop {
        time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        let mut state = lock_state(&inner);
        match state.leases.get_mut(&id) {
            Some(lease) => lease.deadline = Instant::now() + lease.ttl,
            None => break,
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut state = self.lock_current();
        if let Some(id) = lease {
            if !state.leases.contains_key(&id) {
                return Err(DiscoveryError::Store(format!("lease {} not found", id)));
            }
        }

        state.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                lease,
            },
        );
        state.notify(WatchEvent::put(KeyValue::new(key, value)));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock_current().remove_entry(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let state = self.lock_current();
        Ok(state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| KeyValue::new(key.as_str(), entry.value.as_str()))
            .collect())
    }

    async fn watch(&self, prefix: &str) -> Result<Subscription> {
        let (sender, events) = mpsc::unbounded_channel();
        let id = {
            let mut state = self.lock_current();
            let id = state.next_watcher;
            state.next_watcher += 1;
            state.watchers.insert(
                id,
                Watcher {
                    prefix: prefix.to_string(),
                    sender,
                },
            );
            self.ensure_sweeper(&mut state);
            id
        };

        let weak = Arc::downgrade(&self.inner);
        let handle = CancelHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                lock_state(&inner).watchers.remove(&id);
            }
        });

        Ok(Subscription { events, handle })
    }

    async fn lease_keep_alive(&self, ttl: Duration) -> Result<Lease> {
        let id = {
            let mut state = self.lock_current();
            state.next_lease += 1;
            let id = state.next_lease;
            state.leases.insert(
                id,
                LeaseState {
                    ttl,
                    deadline: Instant::now() + ttl,
                },
            );
            self.ensure_sweeper(&mut state);
            id
        };

        let interval = (ttl / 3).max(MIN_RENEW_INTERVAL);
        let renewal = tokio::spawn(renew_lease(Arc::downgrade(&self.inner), id, interval));

        Ok(Lease::new(id, CancelHandle::new(move || renewal.abort())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EventKind;

    #[tokio::test]
    async fn test_list_returns_prefix_in_key_order() {
        let store = MemoryStore::new();
        store.put("/service/b/1", "b1", None).await.unwrap();
        store.put("/service/a/2", "a2", None).await.unwrap();
        store.put("/service/a/1", "a1", None).await.unwrap();
        store.put("/other/x", "x", None).await.unwrap();

        let listed = store.list("/service/").await.unwrap();
        let keys: Vec<&str> = listed.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/service/a/1", "/service/a/2", "/service/b/1"]);
    }

    #[tokio::test]
    async fn test_watch_delivers_put_and_delete() {
        let store = MemoryStore::new();
        store.put("/service/a/1", "10.0.0.1:9000", None).await.unwrap();
        let mut subscription = store.watch("/service").await.unwrap();

        store.put("/service/a/2", "10.0.0.2:9000", None).await.unwrap();
        store.put("/elsewhere/1", "ignored", None).await.unwrap();
        store.delete("/service/a/1").await.unwrap();

        let put = subscription.events.recv().await.unwrap().unwrap();
        assert_eq!(put, WatchEvent::put(KeyValue::new("/service/a/2", "10.0.0.2:9000")));

        let delete = subscription.events.recv().await.unwrap().unwrap();
        assert_eq!(delete.kind, EventKind::Delete);
        assert_eq!(
            delete.prev_kv,
            Some(KeyValue::new("/service/a/1", "10.0.0.1:9000"))
        );
    }

    #[tokio::test]
    async fn test_delete_missing_key_succeeds() {
        let store = MemoryStore::new();
        assert!(store.delete("/service/a/1").await.is_ok());
    }

    #[tokio::test]
    async fn test_cancelled_watch_is_removed() {
        let store = MemoryStore::new();
        let subscription = store.watch("/service").await.unwrap();
        assert_eq!(store.watcher_count(), 1);

        subscription.handle.cancel();
        assert_eq!(store.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemoryStore::new();
        let result = store.put("/service/a/1", "a1", Some(42)).await;
        assert!(matches!(result, Err(DiscoveryError::Store(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_lease_keeps_key() {
        let store = MemoryStore::new();
        let lease = store.lease_keep_alive(Duration::from_secs(1)).await.unwrap();
        store.put("/service/a/1", "a1", Some(lease.id())).await.unwrap();

        time::sleep(Duration::from_secs(5)).await;

        assert_eq!(store.list("/service").await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_lease_expires_key() {
        let store = MemoryStore::new();
        let mut subscription = store.watch("/service").await.unwrap();
        let lease = store.lease_keep_alive(Duration::from_secs(1)).await.unwrap();
        store.put("/service/a/1", "a1", Some(lease.id())).await.unwrap();

        lease.cancel();
        time::sleep(Duration::from_secs(2)).await;

        assert!(store.list("/service").await.unwrap().is_empty());

        let put = subscription.events.recv().await.unwrap().unwrap();
        assert_eq!(put.kind, EventKind::Put);
        let delete = subscription.events.recv().await.unwrap().unwrap();
        assert_eq!(delete, WatchEvent::delete(KeyValue::new("/service/a/1", "a1")));
    }

    #[tokio::test]
    async fn test_inject_reaches_every_watcher() {
        let store = MemoryStore::new();
        let mut first = store.watch("/service/a").await.unwrap();
        let mut second = store.watch("/service/b").await.unwrap();

        store.inject(Err(DiscoveryError::Watch("broken".to_string())));

        assert!(first.events.recv().await.unwrap().is_err());
        assert!(second.events.recv().await.unwrap().is_err());
    }
}
