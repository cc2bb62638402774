//! Service registration and discovery over a coordination store
//!
//! This library provides:
//! - The coordination store abstraction, with etcd and in-process backends
//! - Self-registration of a node under a renewable lease
//! - Discovery that replays a prefix snapshot and follows its change feed

pub mod discovery;
pub mod error;
pub mod memory;
pub mod registration;
pub mod store;

#[cfg(feature = "etcd")]
pub mod client;

#[cfg(test)]
pub(crate) mod testing;

pub use discovery::{classify, DiscoveryClient, DiscoveryState, Notification};
pub use error::{DiscoveryError, Result};
pub use memory::MemoryStore;
pub use registration::{RegistrationClient, DEFAULT_LEASE_TTL};
pub use store::{
    CancelHandle, CoordinationStore, EventKind, KeyValue, Lease, LeaseId, Subscription,
    WatchEvent, WatchItem,
};

#[cfg(feature = "etcd")]
pub use client::EtcdStore;
