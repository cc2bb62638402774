//! Prometheus metrics for service pools

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Membership event label for a node coming online
pub const EVENT_ONLINE: &str = "online";
/// Membership event label for a node going offline
pub const EVENT_OFFLINE: &str = "offline";
/// Membership event label for a notification dropped by the interest filter
pub const EVENT_IGNORED: &str = "ignored";
/// Service label shared by every notification dropped by the interest filter
pub const UNDECLARED_SERVICE: &str = "undeclared";

/// Prometheus metrics collector for endpoint selection and pool membership
#[derive(Clone)]
pub struct PoolMetrics {
    /// Successful endpoint selections
    pub endpoint_selections_total: IntCounterVec,
    /// Selections that found no endpoint
    pub endpoint_misses_total: IntCounterVec,
    /// Current number of pooled endpoints
    pub pool_members: IntGaugeVec,
    /// Discovery notifications seen by the registry
    pub membership_events_total: IntCounterVec,
    /// Connections that could not be constructed
    pub connection_errors_total: IntCounterVec,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl PoolMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let endpoint_selections_total = IntCounterVec::new(
            Opts::new(
                "mesh_endpoint_selections_total",
                "Endpoints handed out to callers",
            ),
            &["service"],
        )?;

        let endpoint_misses_total = IntCounterVec::new(
            Opts::new(
                "mesh_endpoint_misses_total",
                "Selections that found no available endpoint",
            ),
            &["service"],
        )?;

        let pool_members = IntGaugeVec::new(
            Opts::new("mesh_pool_members", "Endpoints currently pooled per service"),
            &["service"],
        )?;

        let membership_events_total = IntCounterVec::new(
            Opts::new(
                "mesh_membership_events_total",
                "Membership notifications received from discovery",
            ),
            &["service", "event"],
        )?;

        let connection_errors_total = IntCounterVec::new(
            Opts::new(
                "mesh_connection_errors_total",
                "Endpoint connections that failed to construct",
            ),
            &["service"],
        )?;

        registry.register(Box::new(endpoint_selections_total.clone()))?;
        registry.register(Box::new(endpoint_misses_total.clone()))?;
        registry.register(Box::new(pool_members.clone()))?;
        registry.register(Box::new(membership_events_total.clone()))?;
        registry.register(Box::new(connection_errors_total.clone()))?;

        Ok(Self {
            endpoint_selections_total,
            endpoint_misses_total,
            pool_members,
            membership_events_total,
            connection_errors_total,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub(crate) fn record_selection(&self, service: &str, hit: bool) {
        if hit {
            self.endpoint_selections_total
                .with_label_values(&[service])
                .inc();
        } else {
            self.endpoint_misses_total.with_label_values(&[service]).inc();
        }
    }

    pub(crate) fn record_event(&self, service: &str, event: &str) {
        self.membership_events_total
            .with_label_values(&[service, event])
            .inc();
    }

    pub(crate) fn record_ignored(&self) {
        self.record_event(UNDECLARED_SERVICE, EVENT_IGNORED);
    }

    pub(crate) fn record_members(&self, service: &str, members: usize) {
        self.pool_members
            .with_label_values(&[service])
            .set(members as i64);
    }

    pub(crate) fn record_connection_error(&self, service: &str) {
        self.connection_errors_total
            .with_label_values(&[service])
            .inc();
    }
}

impl Default for PoolMetrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default PoolMetrics")
    }
}
