//! Liveness manager
//!
//! Renews entries on heartbeat and periodically sweeps the store for entries
//! whose TTL elapsed. Expirations go through the same versioned `remove` as
//! deregistration, so watchers see a uniform `Removed` event whatever the
//! cause, and a heartbeat racing an expiration loses or wins by version.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::clock::SharedClock;
use super::entry::ServiceEntry;
use super::entry_store::EntryStore;
use crate::error::{Error, Result};

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub expired: usize,
    /// Expirations that lost a race with a concurrent mutation
    pub conflicts: usize,
}

pub struct LivenessManager {
    store: Arc<EntryStore>,
    clock: SharedClock,
    sweep_interval: Duration,
    cancel_token: CancellationToken,
}

impl LivenessManager {
    #[must_use]
    pub fn new(store: Arc<EntryStore>, clock: SharedClock, sweep_interval: Duration) -> Self {
        Self {
            store,
            clock,
            sweep_interval,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Extend an entry's heartbeat to now.
    ///
    /// Fails with `NotFound` if the entry is gone or already dead; the agent
    /// must re-register rather than revive it.
    pub fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<u64> {
        let entry = self.store.get(service_name, instance_id)?;
        let expected = entry.version;
        self.renew(entry, expected)
    }

    /// Heartbeat against a version the caller already holds
    pub fn heartbeat_at(&self, service_name: &str, instance_id: &str, expected_version: u64) -> Result<u64> {
        let entry = self.store.get(service_name, instance_id)?;
        self.renew(entry, expected_version)
    }

    fn renew(&self, entry: ServiceEntry, expected_version: u64) -> Result<u64> {
        let now = self.clock.now();
        let key = entry.key();

        if !entry.is_live_at(now) {
            match self.store.remove(&key.service_name, &key.instance_id, Some(entry.version)) {
                Ok(removed) => tracing::info!(
                    service = %key.service_name,
                    instance_id = %key.instance_id,
                    version = removed.version,
                    last_heartbeat_at = %entry.last_heartbeat_at,
                    "Entry expired on late heartbeat"
                ),
                Err(e) => tracing::debug!(key = %key, error = %e, "Late heartbeat found entry already changing"),
            }
            return Err(Error::NotFound(format!("{key} has expired")));
        }

        let mut renewed = entry;
        renewed.last_heartbeat_at = now;
        let outcome = self.store.upsert(renewed, Some(expected_version))?;

        tracing::trace!(key = %key, version = outcome.version, "Heartbeat renewed");
        Ok(outcome.version)
    }

    /// Expire every dead entry, one key at a time.
    pub fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        for key in self.store.keys() {
            report.scanned += 1;

            // Removed since the key list was taken
            let Ok(entry) = self.store.get_by_key(&key) else {
                continue;
            };

            if entry.is_live_at(self.clock.now()) {
                continue;
            }

            match self.store.remove(&key.service_name, &key.instance_id, Some(entry.version)) {
                Ok(removed) => {
                    report.expired += 1;
                    tracing::info!(
                        service = %key.service_name,
                        instance_id = %key.instance_id,
                        version = removed.version,
                        last_heartbeat_at = %entry.last_heartbeat_at,
                        ttl_secs = entry.ttl_secs,
                        "Entry expired: heartbeat TTL elapsed"
                    );
                }
                Err(Error::Conflict { .. }) => {
                    report.conflicts += 1;
                    tracing::debug!(key = %key, "Expiration lost to a concurrent mutation, re-checking next sweep");
                }
                Err(e) => {
                    tracing::debug!(key = %key, error = %e, "Entry vanished during sweep");
                }
            }
        }

        report
    }

    /// Start the periodic sweep.
    ///
    /// Returns the `JoinHandle` so the caller can detect panics or task completion.
    /// Use `shutdown()` to stop the loop.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();
        let mut timer = interval(self.sweep_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(interval_ms = self.sweep_interval.as_millis() as u64, "Liveness sweep started");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel_token.cancelled() => {
                        tracing::info!("Liveness sweep shutting down");
                        return;
                    }
                    _ = timer.tick() => {
                        let report = manager.sweep();
                        if report.expired > 0 || report.conflicts > 0 {
                            tracing::debug!(
                                scanned = report.scanned,
                                expired = report.expired,
                                conflicts = report.conflicts,
                                "Sweep pass complete"
                            );
                        }
                    }
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}
