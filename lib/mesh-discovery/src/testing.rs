//! Store doubles for unit tests

use crate::store::{CancelHandle, CoordinationStore, KeyValue, Lease, LeaseId, Subscription};
use crate::{DiscoveryError, MemoryStore, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Wraps a [`MemoryStore`], failing the operations it is told to fail
#[derive(Clone, Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub fail_list: bool,
    pub fail_put: bool,
    /// Feed one error and then close every subscription
    pub dead_feed: bool,
}

impl FailingStore {
    pub fn failing_list() -> Self {
        Self {
            fail_list: true,
            ..Self::default()
        }
    }

    pub fn failing_put() -> Self {
        Self {
            fail_put: true,
            ..Self::default()
        }
    }

    pub fn dead_feed() -> Self {
        Self {
            dead_feed: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl CoordinationStore for FailingStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        if self.fail_put {
            return Err(DiscoveryError::Store("quorum lost".to_string()));
        }
        self.inner.put(key, value, lease).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        if self.fail_list {
            return Err(DiscoveryError::Store("store unavailable".to_string()));
        }
        self.inner.list(prefix).await
    }

    async fn watch(&self, prefix: &str) -> Result<Subscription> {
        if self.dead_feed {
            let (sender, events) = mpsc::unbounded_channel();
            let _ = sender.send(Err(DiscoveryError::Watch("stream reset".to_string())));
            return Ok(Subscription {
                events,
                handle: CancelHandle::new(|| {}),
            });
        }
        self.inner.watch(prefix).await
    }

    async fn lease_keep_alive(&self, ttl: Duration) -> Result<Lease> {
        self.inner.lease_keep_alive(ttl).await
    }
}
