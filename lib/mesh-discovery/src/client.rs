//! etcd v3 coordination store

use crate::store::{
    CancelHandle, CoordinationStore, EventKind, KeyValue, Lease, LeaseId, Subscription, WatchEvent,
    WatchItem,
};
use crate::{DiscoveryError, Result};
use async_trait::async_trait;
use etcd_client::{
    Client, EventType, GetOptions, LeaseKeepAliveStream, LeaseKeeper, PutOptions, SortOrder,
    SortTarget, WatchOptions, WatchResponse, WatchStream, Watcher,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

const RETRY_INITIAL: Duration = Duration::from_millis(100);
const RETRY_MAX: Duration = Duration::from_secs(5);

/// EtcdStore wraps the etcd client for registration and discovery
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect to an etcd cluster
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let client = Client::connect(endpoints, None).await?;
        debug!("Connected to etcd at {:?}", endpoints);
        Ok(Self { client })
    }

    /// Get the underlying etcd client
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

/// Exponential delay between reconnection attempts
#[derive(Debug)]
struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: RETRY_INITIAL,
        }
    }

    /// Delay before the next attempt; doubles up to the cap
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(RETRY_MAX);
        delay
    }

    fn reset(&mut self) {
        self.current = RETRY_INITIAL;
    }
}

/// Where a watch resumes after its stream is lost
#[derive(Debug, Default, PartialEq, Eq)]
struct WatchCursor {
    next_revision: i64,
}

impl WatchCursor {
    fn observe(&mut self, response: &WatchResponse) {
        if let Some(header) = response.header() {
            self.advance(header.revision());
        }
        // A compacted watch resumes from the oldest revision still kept
        if response.compact_revision() > 0 {
            self.next_revision = response.compact_revision();
        }
    }

    fn advance(&mut self, revision: i64) {
        if revision > 0 {
            self.next_revision = self.next_revision.max(revision + 1);
        }
    }

    fn options(&self) -> WatchOptions {
        let options = WatchOptions::new().with_prefix().with_prev_key();
        if self.next_revision > 0 {
            options.with_start_revision(self.next_revision)
        } else {
            options
        }
    }
}

/// Renewal deadline of a lease as last confirmed by the server
#[derive(Debug)]
struct LeaseDeadline {
    expires_at: Instant,
}

impl LeaseDeadline {
    fn new(ttl: Duration) -> Self {
        Self {
            expires_at: Instant::now() + ttl,
        }
    }

    fn renewed(&mut self, ttl_secs: i64) {
        self.expires_at = Instant::now() + Duration::from_secs(ttl_secs.max(0) as u64);
    }

    fn is_lost(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

fn convert_kv(kv: &etcd_client::KeyValue) -> Result<KeyValue> {
    let key = kv
        .key_str()
        .map_err(|e| DiscoveryError::MalformedEvent(format!("non UTF-8 key: {}", e)))?;
    let value = kv
        .value_str()
        .map_err(|e| DiscoveryError::MalformedEvent(format!("non UTF-8 value of {}: {}", key, e)))?;
    Ok(KeyValue::new(key, value))
}

fn convert_event(event: &etcd_client::Event) -> WatchItem {
    let kind = match event.event_type() {
        EventType::Put => EventKind::Put,
        EventType::Delete => EventKind::Delete,
    };

    Ok(WatchEvent {
        kind,
        kv: event.kv().map(convert_kv).transpose()?,
        prev_kv: event.prev_kv().map(convert_kv).transpose()?,
    })
}

/// Forward watch responses to `sender`, reopening the watch whenever the
/// stream fails. Every failure is also sent down the feed.
async fn pump_watch(
    mut client: Client,
    prefix: String,
    (mut watcher, mut stream): (Watcher, WatchStream),
    sender: mpsc::UnboundedSender<WatchItem>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut cursor = WatchCursor::default();
    let mut backoff = Backoff::new();

    loop {
        let failure = tokio::select! {
            _ = &mut cancel_rx => {
                if let Err(e) = watcher.cancel().await {
                    debug!("Failed to cancel watch on {}: {}", prefix, e);
                }
                return;
            }
            message = stream.message() => match message {
                Ok(Some(response)) => {
                    cursor.observe(&response);
                    if response.canceled() {
                        DiscoveryError::Watch(format!(
                            "watch on {} cancelled by server: {}",
                            prefix,
                            response.cancel_reason()
                        ))
                    } else {
                        backoff.reset();
                        for event in response.events() {
                            if sender.send(convert_event(event)).is_err() {
                                return;
                            }
                        }
                        continue;
                    }
                }
                Ok(None) => DiscoveryError::Watch(format!("watch stream on {} closed", prefix)),
                Err(e) => e.into(),
            }
        };

        warn!("Watch on {} failed, reconnecting: {}", prefix, failure);
        if sender.send(Err(failure)).is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = &mut cancel_rx => return,
                _ = time::sleep(backoff.next_delay()) => {}
            }

            match client.watch(prefix.as_str(), Some(cursor.options())).await {
                Ok(reopened) => {
                    (watcher, stream) = reopened;
                    info!("Watch on {} resumed at revision {}", prefix, cursor.next_revision);
                    break;
                }
                Err(e) => warn!("Failed to reopen watch on {}: {}", prefix, e),
            }
        }
    }
}

/// Renew lease `id` every `interval` until cancelled or the lease is lost.
/// A broken keep-alive stream is reopened with backoff while the lease is
/// still alive on the server.
async fn renew_lease(
    mut client: Client,
    id: LeaseId,
    ttl: Duration,
    interval: Duration,
    (mut keeper, mut responses): (LeaseKeeper, LeaseKeepAliveStream),
    mut cancel_rx: oneshot::Receiver<()>,
) {
    let mut ticker = time::interval(interval);
    let mut deadline = LeaseDeadline::new(ttl);
    let mut backoff = Backoff::new();

    loop {
        let broken = tokio::select! {
            _ = &mut cancel_rx => {
                debug!("Stopped renewing lease {}", id);
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = keeper.keep_alive().await {
                    warn!("Failed to send renewal for lease {}: {}", id, e);
                }
                false
            }
            response = responses.message() => match response {
                Ok(Some(response)) if response.ttl() > 0 => {
                    deadline.renewed(response.ttl());
                    backoff.reset();
                    false
                }
                Ok(Some(_)) => {
                    error!("Lease {} expired before renewal", id);
                    return;
                }
                Ok(None) => {
                    warn!("Lease {} keep-alive stream closed", id);
                    true
                }
                Err(e) => {
                    warn!("Lease {} keep-alive stream failed: {}", id, e);
                    true
                }
            }
        };

        if broken {
            loop {
                if deadline.is_lost() {
                    error!("Lease {} lost, registrations under it will expire", id);
                    return;
                }
                tokio::select! {
                    _ = &mut cancel_rx => return,
                    _ = time::sleep(backoff.next_delay()) => {}
                }
                match client.lease_keep_alive(id).await {
                    Ok(reopened) => {
                        (keeper, responses) = reopened;
                        info!("Keep-alive for lease {} reopened", id);
                        break;
                    }
                    Err(e) => warn!("Failed to reopen keep-alive for lease {}: {}", id, e),
                }
            }
        }

        if deadline.is_lost() {
            error!("Lease {} lost, registrations under it will expire", id);
            return;
        }
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn put(&self, key: &str, value: &str, lease: Option<LeaseId>) -> Result<()> {
        let mut client = self.client.clone();
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        client.put(key, value, options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        let mut client = self.client.clone();
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend);
        let response = client.get(prefix, Some(options)).await?;
        response.kvs().iter().map(convert_kv).collect()
    }

    async fn watch(&self, prefix: &str) -> Result<Subscription> {
        let mut client = self.client.clone();
        let opened = client
            .watch(prefix, Some(WatchCursor::default().options()))
            .await?;

        let (sender, events) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(pump_watch(
            client,
            prefix.to_string(),
            opened,
            sender,
            cancel_rx,
        ));

        let handle = CancelHandle::new(move || {
            let _ = cancel_tx.send(());
        });
        Ok(Subscription { events, handle })
    }

    async fn lease_keep_alive(&self, ttl: Duration) -> Result<Lease> {
        let mut client = self.client.clone();
        let granted = client.lease_grant(ttl.as_secs().max(1) as i64, None).await?;
        let id = granted.id();
        let opened = client.lease_keep_alive(id).await?;

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let interval = (ttl / 3).max(Duration::from_millis(500));
        tokio::spawn(renew_lease(client, id, ttl, interval, opened, cancel_rx));

        let handle = CancelHandle::new(move || {
            let _ = cancel_tx.send(());
        });
        Ok(Lease::new(id, handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), RETRY_MAX);

        backoff.reset();
        assert_eq!(backoff.next_delay(), RETRY_INITIAL);
    }

    #[test]
    fn test_watch_cursor_resumes_after_last_revision() {
        let mut cursor = WatchCursor::default();
        assert_eq!(cursor.next_revision, 0);

        cursor.advance(41);
        assert_eq!(cursor.next_revision, 42);

        // Older headers never move the cursor back
        cursor.advance(10);
        assert_eq!(cursor.next_revision, 42);

        cursor.advance(0);
        assert_eq!(cursor.next_revision, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_deadline_tracks_server_ttl() {
        let mut deadline = LeaseDeadline::new(Duration::from_secs(3));
        assert!(!deadline.is_lost());

        time::sleep(Duration::from_secs(2)).await;
        deadline.renewed(3);

        time::sleep(Duration::from_secs(2)).await;
        assert!(!deadline.is_lost());

        time::sleep(Duration::from_secs(1)).await;
        assert!(deadline.is_lost());
    }
}
