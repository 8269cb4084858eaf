//! Registry facade
//!
//! Wires the entry store, liveness manager, resolver, gateway and notifier
//! together behind the operations agents and clients use.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::clock::{SharedClock, SystemClock};
use super::entry::ServiceEntry;
use super::entry_store::EntryStore;
use super::gateway::{Registration, RegistrationGateway, RegistrationRequest};
use super::liveness::{LivenessManager, SweepReport};
use super::notifier::{ChangeEvent, ChangeNotifier, Subscription, WatchItem};
use super::resolver::{QueryResolver, Resolution, SelectionPolicy};
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

/// Counters for the stats endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub services: usize,
    pub entries: usize,
    pub subscribers: usize,
    pub store_version: u64,
}

pub struct Registry {
    config: RegistryConfig,
    clock: SharedClock,
    store: Arc<EntryStore>,
    liveness: Arc<LivenessManager>,
    resolver: QueryResolver,
    gateway: RegistrationGateway,
}

impl Registry {
    /// Build a registry on the wall clock
    pub fn new(config: RegistryConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RegistryConfig, clock: SharedClock) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| Error::Configuration(errors.join("; ")))?;

        let store = Arc::new(EntryStore::new(ChangeNotifier::new(config.subscriber_buffer)));
        let liveness = Arc::new(LivenessManager::new(
            store.clone(),
            clock.clone(),
            config.sweep_interval(),
        ));
        let resolver = QueryResolver::new(store.clone(), clock.clone());
        let gateway = RegistrationGateway::new(store.clone(), liveness.clone(), clock.clone(), config.clone());

        Ok(Self {
            config,
            clock,
            store,
            liveness,
            resolver,
            gateway,
        })
    }

    /// Start the background liveness sweep
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.liveness.start()
    }

    /// Stop sweeping and end every open watch
    pub fn shutdown(&self) {
        self.liveness.shutdown();
        self.store.notifier().close_all();
        tracing::info!("Registry shut down");
    }

    pub fn register(&self, request: RegistrationRequest) -> Result<Registration> {
        self.gateway.register(request)
    }

    pub fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<u64> {
        self.gateway.heartbeat(service_name, instance_id)
    }

    pub fn deregister(&self, service_name: &str, instance_id: &str) -> Result<ServiceEntry> {
        self.gateway.deregister(service_name, instance_id)
    }

    #[must_use]
    pub fn resolve(&self, service_name: &str, policy: &SelectionPolicy) -> Resolution {
        self.resolver.resolve(service_name, policy)
    }

    /// Watch one service: the current live entries plus every later change.
    ///
    /// The subscription is opened before the snapshot is taken, and events
    /// already reflected in the snapshot are skipped, so each change is seen
    /// exactly once.
    #[must_use]
    pub fn watch(&self, service_name: &str) -> Watch {
        let subscription = self.store.notifier().subscribe(service_name);
        let mut watch = Watch {
            service_name: service_name.to_string(),
            initial: Vec::new(),
            store_version: 0,
            subscription,
            store: self.store.clone(),
            clock: self.clock.clone(),
        };
        watch.resync();
        tracing::debug!(
            service = %service_name,
            initial = watch.initial.len(),
            store_version = watch.store_version,
            "Watch opened"
        );
        watch
    }

    #[must_use]
    pub fn list_services(&self) -> Vec<String> {
        self.store.list_services()
    }

    /// Run one sweep pass immediately
    pub fn sweep(&self) -> SweepReport {
        self.liveness.sweep()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            services: self.store.list_services().len(),
            entries: self.store.len(),
            subscribers: self.store.notifier().subscriber_count_total(),
            store_version: self.store.store_version(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<EntryStore> {
        &self.store
    }
}

/// Open watch on one service
pub struct Watch {
    service_name: String,
    initial: Vec<ServiceEntry>,
    store_version: u64,
    subscription: Subscription,
    store: Arc<EntryStore>,
    clock: SharedClock,
}

impl Watch {
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Live entries at the time the watch was opened or last resynced
    #[must_use]
    pub fn initial(&self) -> &[ServiceEntry] {
        &self.initial
    }

    /// Store version of the snapshot behind [`Self::initial`]
    #[must_use]
    pub const fn store_version(&self) -> u64 {
        self.store_version
    }

    /// Replace the initial view with a fresh snapshot.
    ///
    /// Call after [`WatchItem::Dropped`] to recover a consistent view.
    pub fn resync(&mut self) -> &[ServiceEntry] {
        let snapshot = self.store.snapshot_service(&self.service_name);
        let now = self.clock.now();
        self.initial = snapshot
            .entries
            .into_iter()
            .filter(|entry| entry.is_live_at(now))
            .collect();
        self.store_version = snapshot.store_version;
        &self.initial
    }

    /// Next change not already covered by the snapshot. `None` once the
    /// registry shuts down.
    pub async fn next(&mut self) -> Option<WatchItem> {
        loop {
            match self.subscription.recv().await? {
                WatchItem::Event(event) if event.version() <= self.store_version => continue,
                item => return Some(item),
            }
        }
    }

    /// Non-blocking variant of [`Self::next`]
    pub fn try_next(&mut self) -> Option<WatchItem> {
        loop {
            match self.subscription.try_recv()? {
                WatchItem::Event(event) if event.version() <= self.store_version => continue,
                item => return Some(item),
            }
        }
    }

    /// Stream of changes that resyncs itself after a gap.
    ///
    /// After a `Dropped` item, the stream yields `Added` events for the
    /// fresh snapshot so consumers can rebuild their view.
    pub fn into_stream(self) -> impl Stream<Item = WatchItem> + Send + 'static {
        futures::stream::unfold(
            (self, std::collections::VecDeque::<WatchItem>::new()),
            |(mut watch, mut pending)| async move {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (watch, pending)));
                }
                let item = watch.next().await?;
                if let WatchItem::Dropped { missed } = &item {
                    tracing::debug!(service = %watch.service_name, missed, "Watcher lagged, resyncing");
                    pending.extend(
                        watch
                            .resync()
                            .iter()
                            .cloned()
                            .map(|entry| WatchItem::Event(ChangeEvent::added(entry))),
                    );
                }
                Some((item, (watch, pending)))
            },
        )
    }
}
