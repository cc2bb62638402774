//! Self-registration under a renewable lease

use crate::store::{CoordinationStore, Lease, LeaseId};
use crate::{DiscoveryError, Result};
use mesh_core::instance_key;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info_span, Span};
use uuid::Uuid;

/// Lease TTL used when none is configured
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(3);

/// Publishes this process's address so other nodes can discover it.
///
/// Every key written through the client is bound to one lease that the store
/// renews in the background. Cancelling or dropping the client stops renewal
/// and the keys expire within the lease TTL.
pub struct RegistrationClient {
    store: Arc<dyn CoordinationStore>,
    lease: Lease,
    span: Span,
}

impl RegistrationClient {
    /// Acquire a lease with `ttl` from `store`
    pub async fn new(store: Arc<dyn CoordinationStore>, ttl: Duration) -> Result<Self> {
        let lease = store.lease_keep_alive(ttl).await?;
        let span = info_span!("registration", lease = lease.id());
        debug!(parent: &span, "Acquired lease {} with ttl {:?}", lease.id(), ttl);
        Ok(Self { store, lease, span })
    }

    /// Replace the logging context of this client
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease.id()
    }

    /// Publish `key -> address` bound to the lease.
    ///
    /// Failures are returned as-is; retrying is left to the caller.
    pub async fn register(&self, key: &str, address: &str) -> Result<()> {
        if self.lease.is_cancelled() {
            return Err(DiscoveryError::Registration {
                key: key.to_string(),
                reason: format!("lease {} was cancelled", self.lease.id()),
            });
        }

        match self.store.put(key, address, Some(self.lease.id())).await {
            Ok(()) => {
                debug!(parent: &self.span, "Registered {} -> {}", key, address);
                Ok(())
            }
            Err(e) => {
                error!(parent: &self.span, "Failed to register {}: {}", key, e);
                Err(DiscoveryError::Registration {
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Register one instance of `service_name` under a fresh discriminator.
    /// Returns the discovery key used.
    pub async fn register_instance(&self, service_name: &str, address: &str) -> Result<String> {
        let key = instance_key(service_name, &Uuid::new_v4().to_string());
        self.register(&key, address).await?;
        Ok(key)
    }

    /// Stop renewing the lease
    pub fn cancel(&self) {
        if !self.lease.is_cancelled() {
            debug!(parent: &self.span, "Cancelling lease {}", self.lease.id());
            self.lease.cancel();
        }
    }
}

impl Drop for RegistrationClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FailingStore;
    use crate::MemoryStore;
    use mesh_core::service_name_of;
    use tokio::time;

    #[tokio::test]
    async fn test_register_publishes_key() {
        let store = Arc::new(MemoryStore::new());
        let client = RegistrationClient::new(store.clone(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        client
            .register("/service/echo/1", "10.0.0.1:9000")
            .await
            .unwrap();

        let listed = store.list("/service/echo").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].value, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_register_instance_uses_service_prefix() {
        let store = Arc::new(MemoryStore::new());
        let client = RegistrationClient::new(store.clone(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        let key = client
            .register_instance("/service/echo", "10.0.0.1:9000")
            .await
            .unwrap();

        assert_eq!(service_name_of(&key), "/service/echo");
        assert_eq!(store.list("/service/echo/").await.unwrap()[0].key, key);
    }

    #[tokio::test]
    async fn test_register_after_cancel_fails() {
        let store = Arc::new(MemoryStore::new());
        let client = RegistrationClient::new(store, DEFAULT_LEASE_TTL).await.unwrap();
        client.cancel();

        let result = client.register("/service/echo/1", "10.0.0.1:9000").await;
        assert!(matches!(result, Err(DiscoveryError::Registration { .. })));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_registration_error() {
        let store = Arc::new(FailingStore::failing_put());
        let client = RegistrationClient::new(store.clone(), DEFAULT_LEASE_TTL)
            .await
            .unwrap();

        let result = client.register("/service/echo/1", "10.0.0.1:9000").await;

        match result {
            Err(DiscoveryError::Registration { key, reason }) => {
                assert_eq!(key, "/service/echo/1");
                assert!(reason.contains("quorum lost"), "unexpected reason: {}", reason);
            }
            other => panic!("expected a registration error, got {:?}", other),
        }
        assert!(store.inner.list("/service/echo").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_expires_registration() {
        let store = Arc::new(MemoryStore::new());
        let client = RegistrationClient::new(store.clone(), Duration::from_secs(1))
            .await
            .unwrap();
        client
            .register("/service/echo/1", "10.0.0.1:9000")
            .await
            .unwrap();

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.list("/service/echo").await.unwrap().len(), 1);

        drop(client);
        time::sleep(Duration::from_secs(2)).await;

        assert!(store.list("/service/echo").await.unwrap().is_empty());
    }
}
