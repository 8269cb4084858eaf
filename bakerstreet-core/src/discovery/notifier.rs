//! Change notifier
//!
//! Fans out entry mutations to watchers of a service. Each subscriber owns a
//! bounded queue; publishing never blocks, and a subscriber that falls behind
//! is told so with a `Dropped` marker instead of silently losing events.

use dashmap::DashMap;
use futures::Stream;
use serde::{Deserialize, Serialize};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use super::entry::ServiceEntry;

/// Handle of a single subscription
pub type SubscriberId = u64;

/// Default per-subscriber queue depth
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Updated,
}

/// A single entry mutation. For `Removed` the entry carries the version
/// assigned to the removal itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entry: ServiceEntry,
}

impl ChangeEvent {
    #[must_use]
    pub const fn added(entry: ServiceEntry) -> Self {
        Self { kind: ChangeKind::Added, entry }
    }

    #[must_use]
    pub const fn updated(entry: ServiceEntry) -> Self {
        Self { kind: ChangeKind::Updated, entry }
    }

    #[must_use]
    pub const fn removed(entry: ServiceEntry) -> Self {
        Self { kind: ChangeKind::Removed, entry }
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.entry.version
    }

    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self.kind {
            ChangeKind::Added => "added",
            ChangeKind::Removed => "removed",
            ChangeKind::Updated => "updated",
        }
    }
}

/// What a watcher receives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchItem {
    Event(ChangeEvent),
    /// The subscriber's queue overflowed; `missed` events never reached it,
    /// counting both the skipped ones and the discarded backlog.
    /// The watcher must re-snapshot before trusting its view again.
    Dropped { missed: u64 },
}

/// Overflow bookkeeping shared by a subscriber and its publisher side.
/// Both fields change together under one lock.
#[derive(Debug, Default)]
struct LagState {
    lagged: bool,
    missed: u64,
}

struct Subscriber {
    id: SubscriberId,
    sender: mpsc::Sender<ChangeEvent>,
    lag: Arc<Mutex<LagState>>,
}

/// Publish/subscribe hub keyed by service name
#[derive(Clone)]
pub struct ChangeNotifier {
    /// Map of service_name -> subscribers
    services: Arc<DashMap<String, Vec<Subscriber>>>,
    next_id: Arc<AtomicU64>,
    buffer: usize,
}

impl ChangeNotifier {
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            services: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            buffer: buffer.max(1),
        }
    }

    /// Subscribe to future changes of one service.
    ///
    /// The subscription is released when the returned guard is dropped.
    pub fn subscribe(&self, service_name: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let lag = Arc::new(Mutex::new(LagState::default()));

        self.services
            .entry(service_name.to_string())
            .or_default()
            .push(Subscriber {
                id,
                sender: tx,
                lag: lag.clone(),
            });

        info!(service = %service_name, subscriber_id = id, "Watcher subscribed");

        Subscription {
            id,
            service_name: service_name.to_string(),
            receiver: rx,
            lag,
            notifier: self.clone(),
        }
    }

    fn unsubscribe(&self, service_name: &str, id: SubscriberId) {
        let mut found = false;
        if let Some(mut subscribers) = self.services.get_mut(service_name) {
            let before = subscribers.len();
            subscribers.retain(|sub| sub.id != id);
            found = subscribers.len() != before;
        }
        self.services
            .remove_if(service_name, |_, subscribers| subscribers.is_empty());

        if found {
            info!(service = %service_name, subscriber_id = id, "Watcher unsubscribed");
        } else {
            debug!(service = %service_name, subscriber_id = id, "Subscription already released");
        }
    }

    /// Deliver an event to every subscriber of the entry's service.
    ///
    /// Returns the number of subscribers that were handed the event.
    pub fn publish(&self, event: &ChangeEvent) -> usize {
        let service_name = event.entry.service_name.as_str();
        let mut delivered = 0;
        let mut closed = Vec::new();

        if let Some(subscribers) = self.services.get(service_name) {
            for subscriber in subscribers.iter() {
                // Held across try_send so a concurrent drain cannot slip in
                // between the lag check and the count.
                let mut lag = subscriber.lag.lock();
                if lag.lagged {
                    lag.missed += 1;
                    continue;
                }

                match subscriber.sender.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        lag.lagged = true;
                        lag.missed += 1;
                        warn!(
                            service = %service_name,
                            subscriber_id = subscriber.id,
                            buffer = self.buffer,
                            "Watcher queue overflowed, signalling drop"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }

        for id in closed {
            self.unsubscribe(service_name, id);
        }

        delivered
    }

    /// Disconnect every subscriber; their streams end after draining.
    pub fn close_all(&self) {
        let count = self.subscriber_count_total();
        self.services.clear();
        if count > 0 {
            info!(subscribers = count, "Closed all watcher subscriptions");
        }
    }

    /// Number of subscribers watching a service
    #[must_use]
    pub fn subscriber_count(&self, service_name: &str) -> usize {
        self.services
            .get(service_name)
            .map_or(0, |subscribers| subscribers.len())
    }

    #[must_use]
    pub fn subscriber_count_total(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }

    /// Number of services with at least one watcher
    #[must_use]
    pub fn watched_service_count(&self) -> usize {
        self.services.len()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

/// Scoped subscription to one service's changes
pub struct Subscription {
    id: SubscriberId,
    service_name: String,
    receiver: mpsc::Receiver<ChangeEvent>,
    lag: Arc<Mutex<LagState>>,
    notifier: ChangeNotifier,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Wait for the next item. `None` once the notifier has closed.
    pub async fn recv(&mut self) -> Option<WatchItem> {
        if let Some(dropped) = self.take_dropped() {
            return Some(dropped);
        }
        self.receiver.recv().await.map(WatchItem::Event)
    }

    /// Non-blocking variant of [`Self::recv`]
    pub fn try_recv(&mut self) -> Option<WatchItem> {
        if let Some(dropped) = self.take_dropped() {
            return Some(dropped);
        }
        self.receiver.try_recv().ok().map(WatchItem::Event)
    }

    /// Once lagged, the queued backlog predates the gap and is superseded
    /// by the re-snapshot the watcher has to take.
    fn take_dropped(&mut self) -> Option<WatchItem> {
        let mut lag = self.lag.lock();
        if !lag.lagged {
            return None;
        }
        let mut discarded = 0;
        while self.receiver.try_recv().is_ok() {
            discarded += 1;
        }
        let missed = std::mem::take(&mut lag.missed) + discarded;
        lag.lagged = false;
        Some(WatchItem::Dropped { missed })
    }

    pub fn into_stream(self) -> impl Stream<Item = WatchItem> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.recv().await.map(|item| (item, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.notifier.unsubscribe(&self.service_name, self.id);
    }
}
