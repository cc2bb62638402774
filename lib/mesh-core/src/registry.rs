//! Service registry mapping service names to connection pools

use crate::metrics::{EVENT_OFFLINE, EVENT_ONLINE};
use crate::{
    service_name_of, ChannelOptions, ConnectionFactory, ConnectionPool, CoreError, PoolMetrics,
    Result,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info_span, warn, Span};

/// Receives membership changes produced by service discovery
pub trait MembershipListener: Send + Sync {
    /// A node was published under `discovery_key` with `address`
    fn node_online(&self, discovery_key: &str, address: &str);

    /// The node published under `discovery_key` with `address` went away
    fn node_offline(&self, discovery_key: &str, address: &str);
}

/// ServiceRegistry maintains a connection pool for every service this
/// process has declared interest in
pub struct ServiceRegistry<F: ConnectionFactory> {
    factory: F,
    options: ChannelOptions,
    state: RwLock<RegistryState<F::Connection>>,
    metrics: PoolMetrics,
    span: Span,
}

struct RegistryState<C> {
    interests: HashSet<String>,
    pools: HashMap<String, Arc<ConnectionPool<C>>>,
}

impl<F: ConnectionFactory> ServiceRegistry<F> {
    /// Create a registry whose pools build connections with `factory`
    pub fn new(factory: F, options: ChannelOptions) -> Self {
        Self {
            factory,
            options,
            state: RwLock::new(RegistryState {
                interests: HashSet::new(),
                pools: HashMap::new(),
            }),
            metrics: PoolMetrics::default(),
            span: info_span!("registry"),
        }
    }

    /// Replace the logging context; pools created later log beneath it
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Record registry and pool activity into shared metrics
    pub fn with_metrics(mut self, metrics: PoolMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Metrics shared by this registry and its pools
    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Declare interest in a service.
    ///
    /// Notifications for a service are only honored after it was declared;
    /// earlier ones are dropped, not buffered.
    pub fn declare_interest(&self, service_name: &str) {
        let inserted = self.write().interests.insert(service_name.to_string());
        if inserted {
            let _enter = self.span.enter();
            debug!("Declared interest in service {}", service_name);
        }
    }

    /// Whether interest in `service_name` was declared
    pub fn is_interested(&self, service_name: &str) -> bool {
        self.read().interests.contains(service_name)
    }

    /// Handle a node coming online
    pub fn on_node_online(&self, discovery_key: &str, address: &str) {
        let _enter = self.span.enter();
        let service_name = service_name_of(discovery_key);

        let pool = {
            let mut state = self.write();
            if !state.interests.contains(service_name) {
                debug!("Service {}-{} came online but is not of interest", service_name, address);
                self.metrics.record_ignored();
                return;
            }

            state
                .pools
                .entry(service_name.to_string())
                .or_insert_with(|| Arc::new(self.new_pool(service_name)))
                .clone()
        };

        self.metrics.record_event(service_name, EVENT_ONLINE);
        if pool.add(address, &self.factory) {
            debug!("Service {} gained node {}", service_name, address);
        }
    }

    /// Handle a node going offline
    pub fn on_node_offline(&self, discovery_key: &str, address: &str) {
        let _enter = self.span.enter();
        let service_name = service_name_of(discovery_key);

        let pool = {
            let state = self.read();
            if !state.interests.contains(service_name) {
                debug!("Service {}-{} went offline but is not of interest", service_name, address);
                self.metrics.record_ignored();
                return;
            }

            match state.pools.get(service_name) {
                Some(pool) => pool.clone(),
                None => {
                    warn!("No pool found for service {} while removing node {}", service_name, address);
                    return;
                }
            }
        };

        self.metrics.record_event(service_name, EVENT_OFFLINE);
        if pool.remove(address) {
            debug!("Service {} lost node {}", service_name, address);
        }
    }

    /// Select a connection for `service_name` in round-robin order
    pub fn select(&self, service_name: &str) -> Result<F::Connection> {
        let pool = self.pool(service_name).ok_or_else(|| {
            let _enter = self.span.enter();
            warn!("No node currently provides service {}", service_name);
            CoreError::ServiceNotFound(service_name.to_string())
        })?;

        pool.select()
            .ok_or_else(|| CoreError::NoEndpoint(service_name.to_string()))
    }

    /// Get the pool for a service, if any node of it was ever seen
    pub fn pool(&self, service_name: &str) -> Option<Arc<ConnectionPool<F::Connection>>> {
        self.read().pools.get(service_name).cloned()
    }

    /// Snapshot of every pooled service and its addresses, sorted by name
    pub fn services(&self) -> Vec<(String, Vec<String>)> {
        let pools: Vec<_> = self
            .read()
            .pools
            .iter()
            .map(|(name, pool)| (name.clone(), pool.clone()))
            .collect();

        // Pool locks are taken only after the registry lock is released
        let mut services: Vec<_> = pools
            .into_iter()
            .map(|(name, pool)| (name, pool.addresses()))
            .collect();
        services.sort_by(|a, b| a.0.cmp(&b.0));
        services
    }

    fn new_pool(&self, service_name: &str) -> ConnectionPool<F::Connection> {
        let span = info_span!(parent: &self.span, "pool", service = %service_name);
        ConnectionPool::new(service_name, self.options.clone())
            .with_span(span)
            .with_metrics(self.metrics.clone())
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState<F::Connection>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState<F::Connection>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<F: ConnectionFactory> MembershipListener for ServiceRegistry<F> {
    fn node_online(&self, discovery_key: &str, address: &str) {
        self.on_node_online(discovery_key, address);
    }

    fn node_offline(&self, discovery_key: &str, address: &str) {
        self.on_node_offline(discovery_key, address);
    }
}
