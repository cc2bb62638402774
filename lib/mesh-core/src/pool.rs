//! Round-robin connection pool for a single service
//!
//! The ordered address list, the address-to-connection map and the rotation
//! cursor live behind one mutex. Selection reads the current size and advances
//! the cursor inside that critical section, so a concurrent removal can never
//! leave the cursor pointing past the end of the list.

use crate::{ChannelOptions, ConnectionFactory, PoolMetrics};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info_span, warn, Span};

/// Connection pool for one service
pub struct ConnectionPool<C> {
    service_name: String,
    options: ChannelOptions,
    state: Mutex<PoolState<C>>,
    metrics: PoolMetrics,
    span: Span,
}

struct PoolState<C> {
    addresses: Vec<String>,
    by_address: HashMap<String, C>,
    // Index of the address due for the next selection
    cursor: usize,
}

impl<C: Clone> PoolState<C> {
    fn insert(&mut self, address: &str, connection: C) -> bool {
        let replaced = self
            .by_address
            .insert(address.to_string(), connection)
            .is_some();
        if !replaced {
            self.addresses.push(address.to_string());
        }
        replaced
    }

    fn remove(&mut self, address: &str) -> Option<C> {
        let connection = self.by_address.remove(address)?;
        if let Some(index) = self.addresses.iter().position(|a| a == address) {
            self.addresses.remove(index);
            if index < self.cursor {
                self.cursor -= 1;
            }
            if self.cursor >= self.addresses.len() {
                self.cursor = 0;
            }
        }
        Some(connection)
    }

    fn next(&mut self) -> Option<C> {
        if self.addresses.is_empty() {
            return None;
        }

        let index = self.cursor % self.addresses.len();
        self.cursor = (index + 1) % self.addresses.len();
        self.by_address.get(&self.addresses[index]).cloned()
    }
}

impl<C: Clone> ConnectionPool<C> {
    /// Create an empty pool for `service_name`
    pub fn new(service_name: impl Into<String>, options: ChannelOptions) -> Self {
        let service_name = service_name.into();
        let span = info_span!("pool", service = %service_name);
        Self {
            service_name,
            options,
            state: Mutex::new(PoolState {
                addresses: Vec::new(),
                by_address: HashMap::new(),
                cursor: 0,
            }),
            metrics: PoolMetrics::default(),
            span,
        }
    }

    /// Replace the logging context of this pool
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Record pool activity into shared metrics
    pub fn with_metrics(mut self, metrics: PoolMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Name of the service this pool serves
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Options every connection of this pool is built with
    pub fn options(&self) -> &ChannelOptions {
        &self.options
    }

    /// Add a node, building its connection with `factory`.
    ///
    /// A node that is already pooled keeps its place in the rotation and has
    /// its connection replaced. Returns false if the connection could not be
    /// built, in which case the pool is left unchanged.
    pub fn add<F>(&self, address: &str, factory: &F) -> bool
    where
        F: ConnectionFactory<Connection = C>,
    {
        let _enter = self.span.enter();

        // Connections are built outside the lock
        let connection = match factory.connect(address, &self.options) {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to create connection for {}-{}: {}", self.service_name, address, e);
                self.metrics.record_connection_error(&self.service_name);
                return false;
            }
        };

        let mut state = self.lock();
        if state.insert(address, connection) {
            debug!("Replaced connection for {}-{}", self.service_name, address);
        } else {
            debug!("Added node {}-{}", self.service_name, address);
        }
        // Gauge is set under the lock
        self.metrics
            .record_members(&self.service_name, state.addresses.len());
        true
    }

    /// Remove a node. Returns false if the node was not pooled.
    pub fn remove(&self, address: &str) -> bool {
        let _enter = self.span.enter();

        let removed = {
            let mut state = self.lock();
            let removed = state.remove(address).is_some();
            if removed {
                self.metrics
                    .record_members(&self.service_name, state.addresses.len());
            }
            removed
        };

        if !removed {
            warn!("Node {}-{} not found while removing connection", self.service_name, address);
            return false;
        }

        debug!("Removed node {}-{}", self.service_name, address);
        true
    }

    /// Select the next connection in round-robin order.
    ///
    /// Returns `None` immediately when the pool has no members.
    pub fn select(&self) -> Option<C> {
        let selected = self.lock().next();

        if selected.is_none() {
            let _enter = self.span.enter();
            warn!("No node currently provides service {}", self.service_name);
        }

        self.metrics
            .record_selection(&self.service_name, selected.is_some());
        selected
    }

    /// Number of pooled nodes
    pub fn len(&self) -> usize {
        self.lock().addresses.len()
    }

    /// Whether the pool has no members
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `address` is pooled
    pub fn contains(&self, address: &str) -> bool {
        self.lock().by_address.contains_key(address)
    }

    /// Pooled addresses in rotation order
    pub fn addresses(&self) -> Vec<String> {
        self.lock().addresses.clone()
    }

    // Mutations never panic midway, so a poisoned state is still consistent
    fn lock(&self) -> MutexGuard<'_, PoolState<C>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
