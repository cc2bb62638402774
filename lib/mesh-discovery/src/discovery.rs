//! Service discovery over a watched key prefix
//!
//! On start the client subscribes to the prefix, replays the current listing
//! as online notifications in key order, then forwards every change from the
//! feed to a [`MembershipListener`]. The subscription is opened before the
//! listing is read so no change that lands in between is lost; a change seen
//! both in the listing and on the feed is applied twice, which the listener
//! tolerates.

use crate::store::{
    CancelHandle, CoordinationStore, EventKind, Subscription, WatchEvent, WatchItem,
};
use crate::{DiscoveryError, Result};
use mesh_core::MembershipListener;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, Instrument, Span};

/// Lifecycle of a [`DiscoveryClient`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiscoveryState {
    Initializing,
    SnapshotLoaded,
    Watching,
    Cancelled,
}

/// Membership change derived from a watch event
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    Online { key: String, address: String },
    Offline { key: String, address: String },
}

/// Translate a watch event into a membership change.
///
/// A delete carries no new value, so the node it removes is taken from the
/// previous key-value.
pub fn classify(event: WatchEvent) -> Result<Notification> {
    match event.kind {
        EventKind::Put => event
            .kv
            .map(|kv| Notification::Online {
                key: kv.key,
                address: kv.value,
            })
            .ok_or_else(|| DiscoveryError::MalformedEvent("put event without key-value".to_string())),
        EventKind::Delete => event
            .prev_kv
            .map(|kv| Notification::Offline {
                key: kv.key,
                address: kv.value,
            })
            .ok_or_else(|| {
                DiscoveryError::MalformedEvent("delete event without previous key-value".to_string())
            }),
    }
}

/// Keeps a [`MembershipListener`] in sync with the nodes under a prefix
pub struct DiscoveryClient {
    prefix: String,
    state: Arc<Mutex<DiscoveryState>>,
    subscription: CancelHandle,
    handler: JoinHandle<()>,
    span: Span,
}

impl DiscoveryClient {
    /// Start discovering nodes under `prefix`
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        prefix: &str,
        listener: Arc<dyn MembershipListener>,
    ) -> Result<Self> {
        let span = info_span!("discovery", prefix = %prefix);
        Self::start_with_span(store, prefix, listener, span).await
    }

    /// Start discovering nodes under `prefix`, logging into `span`
    pub async fn start_with_span(
        store: Arc<dyn CoordinationStore>,
        prefix: &str,
        listener: Arc<dyn MembershipListener>,
        span: Span,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(DiscoveryState::Initializing));

        let Subscription { events, handle } = match store.watch(prefix).await {
            Ok(subscription) => subscription,
            Err(e) => {
                error!(parent: &span, "Failed to watch {}: {}", prefix, e);
                return Err(e);
            }
        };

        match store.list(prefix).await {
            Ok(listing) => {
                debug!(parent: &span, "Replaying {} existing nodes under {}", listing.len(), prefix);
                for kv in listing {
                    listener.node_online(&kv.key, &kv.value);
                }
            }
            // Keep going with whatever the feed brings
            Err(e) => error!(parent: &span, "Failed to list services under {}: {}", prefix, e),
        }
        set_state(&state, DiscoveryState::SnapshotLoaded);

        let handler = tokio::spawn(
            handle_events(prefix.to_string(), events, listener, state.clone())
                .instrument(span.clone()),
        );
        set_state(&state, DiscoveryState::Watching);
        info!(parent: &span, "Watching {} for membership changes", prefix);

        Ok(Self {
            prefix: prefix.to_string(),
            state,
            subscription: handle,
            handler,
            span,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn state(&self) -> DiscoveryState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop watching. No notification is delivered after this returns,
    /// except one that was already being delivered.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == DiscoveryState::Cancelled {
                return;
            }
            *state = DiscoveryState::Cancelled;
        }

        self.subscription.cancel();
        self.handler.abort();
        debug!(parent: &self.span, "Stopped watching {}", self.prefix);
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn set_state(state: &Mutex<DiscoveryState>, next: DiscoveryState) {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state != DiscoveryState::Cancelled {
        *state = next;
    }
}

fn is_cancelled(state: &Mutex<DiscoveryState>) -> bool {
    *state.lock().unwrap_or_else(PoisonError::into_inner) == DiscoveryState::Cancelled
}

async fn handle_events(
    prefix: String,
    mut events: mpsc::UnboundedReceiver<WatchItem>,
    listener: Arc<dyn MembershipListener>,
    state: Arc<Mutex<DiscoveryState>>,
) {
    while let Some(item) = events.recv().await {
        if is_cancelled(&state) {
            break;
        }

        match item.and_then(classify) {
            Ok(Notification::Online { key, address }) => {
                debug!("Node online: {}-{}", key, address);
                listener.node_online(&key, &address);
            }
            Ok(Notification::Offline { key, address }) => {
                debug!("Node offline: {}-{}", key, address);
                listener.node_offline(&key, &address);
            }
            Err(e) => error!("Received a bad watch event: {}", e),
        }
    }

    if is_cancelled(&state) {
        debug!("Watch feed on {} ended", prefix);
    } else {
        error!("Watch feed on {} closed, membership changes are no longer delivered", prefix);
    }
}
