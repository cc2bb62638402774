//! Core service pool functionality
//!
//! This library provides:
//! - Per-service connection pools with round-robin endpoint selection
//! - A service registry driven by discovery membership notifications
//! - The transport seam used to build connections to discovered nodes

pub mod connection;
pub mod endpoint;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod registry;

pub use connection::{ChannelOptions, ConnectionFactory};
pub use endpoint::{instance_key, service_name_of};
pub use error::{ConnectionError, CoreError, Result};
pub use metrics::PoolMetrics;
pub use pool::ConnectionPool;
pub use registry::{MembershipListener, ServiceRegistry};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
