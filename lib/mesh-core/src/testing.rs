//! Shared helpers for unit tests

use crate::{ChannelOptions, ConnectionError, ConnectionFactory};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

#[derive(Clone, Debug)]
pub struct TestConnection {
    pub address: String,
    pub id: usize,
}

/// Hands out numbered connections and refuses a configured set of addresses
#[derive(Default)]
pub struct TestFactory {
    created: AtomicUsize,
    rejected: HashSet<String>,
}

impl TestFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(addresses: &[&str]) -> Self {
        Self {
            created: AtomicUsize::new(0),
            rejected: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl ConnectionFactory for TestFactory {
    type Connection = TestConnection;

    fn connect(
        &self,
        address: &str,
        _options: &ChannelOptions,
    ) -> Result<TestConnection, ConnectionError> {
        if self.rejected.contains(address) {
            return Err(ConnectionError::InvalidAddress {
                address: address.to_string(),
                reason: "rejected by test factory".to_string(),
            });
        }
        Ok(TestConnection {
            address: address.to_string(),
            id: self.created.fetch_add(1, Ordering::SeqCst),
        })
    }
}

/// Records every event's level and message
#[derive(Clone, Default)]
pub struct CaptureLayer {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl CaptureLayer {
    pub fn events(&self) -> Vec<(Level, String)> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.events()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}
