//! Entry store: the authoritative table of registered service endpoints
//!
//! Per-key mutations are serialized by the key's map lock and checked
//! against an optional expected version. Versions come from one store-wide
//! sequence, so every mutation can be ordered against a snapshot's
//! `store_version`. Change events are published while the key is still
//! locked, which keeps each subscriber's per-key order identical to the
//! store's.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use super::entry::{EntryKey, ServiceEntry};
use super::notifier::{ChangeEvent, ChangeNotifier};
use crate::error::{Error, Result};

/// Result of a successful upsert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub version: u64,
    /// `true` if the key did not exist before
    pub created: bool,
    pub entry: ServiceEntry,
}

/// Point-in-time view of the store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub entries: Vec<ServiceEntry>,
    /// Highest version applied when the snapshot was taken
    pub store_version: u64,
}

pub struct EntryStore {
    entries: DashMap<EntryKey, ServiceEntry>,
    /// service_name -> instance ids, maintained under the entry's key lock
    services: DashMap<String, BTreeSet<String>>,
    sequence: AtomicU64,
    /// Mutations hold it shared, snapshots exclusively
    commit_gate: RwLock<()>,
    notifier: ChangeNotifier,
}

impl EntryStore {
    #[must_use]
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self {
            entries: DashMap::new(),
            services: DashMap::new(),
            sequence: AtomicU64::new(0),
            commit_gate: RwLock::new(()),
            notifier,
        }
    }

    fn next_version(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Insert or replace an entry by key.
    ///
    /// With `expected_version`, the write only applies if the stored entry
    /// still carries that version. `registered_at` of an existing entry is
    /// kept; `version` is always assigned here.
    pub fn upsert(&self, entry: ServiceEntry, expected_version: Option<u64>) -> Result<UpsertOutcome> {
        let _gate = self.commit_gate.read();
        let key = entry.key();

        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let current = occupied.get();
                if let Some(expected) = expected_version {
                    if current.version != expected {
                        return Err(Error::Conflict {
                            key: key.to_string(),
                            expected,
                            actual: Some(current.version),
                        });
                    }
                }

                let mut entry = entry;
                entry.registered_at = current.registered_at;
                entry.version = self.next_version();
                occupied.insert(entry.clone());

                self.notifier.publish(&ChangeEvent::updated(entry.clone()));
                trace!(key = %key, version = entry.version, "Entry updated");

                Ok(UpsertOutcome {
                    version: entry.version,
                    created: false,
                    entry,
                })
            }
            MapEntry::Vacant(vacant) => {
                if let Some(expected) = expected_version {
                    return Err(Error::Conflict {
                        key: key.to_string(),
                        expected,
                        actual: None,
                    });
                }

                let mut entry = entry;
                entry.version = self.next_version();
                let inserted = vacant.insert(entry.clone());

                self.services
                    .entry(key.service_name.clone())
                    .or_default()
                    .insert(key.instance_id.clone());
                self.notifier.publish(&ChangeEvent::added(entry.clone()));
                drop(inserted);

                trace!(key = %key, version = entry.version, "Entry added");

                Ok(UpsertOutcome {
                    version: entry.version,
                    created: true,
                    entry,
                })
            }
        }
    }

    pub fn get(&self, service_name: &str, instance_id: &str) -> Result<ServiceEntry> {
        self.get_by_key(&EntryKey::new(service_name, instance_id))
    }

    pub fn get_by_key(&self, key: &EntryKey) -> Result<ServiceEntry> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(key.to_string()))
    }

    /// All entries of one service, live or not, ordered by instance id
    #[must_use]
    pub fn list(&self, service_name: &str) -> Vec<ServiceEntry> {
        let instance_ids: Vec<String> = self
            .services
            .get(service_name)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();

        instance_ids
            .into_iter()
            .filter_map(|instance_id| {
                self.entries
                    .get(&EntryKey::new(service_name, instance_id))
                    .map(|entry| entry.value().clone())
            })
            .collect()
    }

    /// Remove an entry, optionally guarded by its expected version.
    ///
    /// Returns the removed entry carrying the version assigned to the removal.
    pub fn remove(
        &self,
        service_name: &str,
        instance_id: &str,
        expected_version: Option<u64>,
    ) -> Result<ServiceEntry> {
        let _gate = self.commit_gate.read();
        let key = EntryKey::new(service_name, instance_id);

        match self.entries.entry(key.clone()) {
            MapEntry::Occupied(occupied) => {
                let current = occupied.get();
                if let Some(expected) = expected_version {
                    if current.version != expected {
                        return Err(Error::Conflict {
                            key: key.to_string(),
                            expected,
                            actual: Some(current.version),
                        });
                    }
                }

                let mut removed = current.clone();
                removed.version = self.next_version();

                if let Some(mut ids) = self.services.get_mut(service_name) {
                    ids.remove(instance_id);
                }
                self.services.remove_if(service_name, |_, ids| ids.is_empty());
                self.notifier.publish(&ChangeEvent::removed(removed.clone()));
                occupied.remove();

                trace!(key = %key, version = removed.version, "Entry removed");
                Ok(removed)
            }
            MapEntry::Vacant(_) => match expected_version {
                Some(expected) => Err(Error::Conflict {
                    key: key.to_string(),
                    expected,
                    actual: None,
                }),
                None => Err(Error::NotFound(key.to_string())),
            },
        }
    }

    /// Consistent point-in-time copy of the whole store
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let _gate = self.commit_gate.write();
        let mut entries: Vec<ServiceEntry> =
            self.entries.iter().map(|entry| entry.value().clone()).collect();
        entries.sort_by(|a, b| {
            (&a.service_name, &a.instance_id).cmp(&(&b.service_name, &b.instance_id))
        });

        Snapshot {
            entries,
            store_version: self.sequence.load(Ordering::SeqCst),
        }
    }

    /// Consistent point-in-time copy of one service
    #[must_use]
    pub fn snapshot_service(&self, service_name: &str) -> Snapshot {
        let _gate = self.commit_gate.write();
        Snapshot {
            entries: self.list(service_name),
            store_version: self.sequence.load(Ordering::SeqCst),
        }
    }

    /// Read of one service that never waits on the commit gate.
    ///
    /// Each entry is internally consistent, but entries are read one key at a
    /// time, so the result is not a cut across keys. `store_version` is the
    /// sequence observed before the read began. Use [`Self::snapshot_service`]
    /// when events must be ordered against the result.
    #[must_use]
    pub fn read_service(&self, service_name: &str) -> Snapshot {
        let store_version = self.sequence.load(Ordering::SeqCst);
        Snapshot {
            entries: self.list(service_name),
            store_version,
        }
    }

    /// Keys of every entry, copied so callers can iterate without holding locks
    #[must_use]
    pub fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Names of every service with at least one entry, sorted
    #[must_use]
    pub fn list_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.iter().map(|s| s.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn store_version(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    /// Holds the gate the way a mutation in progress does
    #[cfg(test)]
    pub(crate) fn mutation_in_flight(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.commit_gate.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::notifier::{ChangeKind, WatchItem};
    use chrono::Utc;
    use std::sync::Arc;

    fn store() -> EntryStore {
        EntryStore::new(ChangeNotifier::new(64))
    }

    fn entry(instance: &str) -> ServiceEntry {
        ServiceEntry::new("checkout", instance, "10.0.0.1:9000", 10, Utc::now())
    }

    #[test]
    fn test_read_service_does_not_wait_for_mutations() {
        let store = Arc::new(store());
        store.upsert(entry("i1"), None).unwrap();
        store.upsert(entry("i2"), None).unwrap();

        let gate = store.mutation_in_flight();
        let (tx, rx) = std::sync::mpsc::channel();
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                tx.send(store.read_service("checkout")).unwrap();
            })
        };

        let read = rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("read blocked behind an in-flight mutation");
        assert_eq!(read.entries.len(), 2);
        assert_eq!(read.store_version, 2);

        drop(gate);
        reader.join().unwrap();
    }

    #[test]
    fn test_upsert_assigns_increasing_versions() {
        let store = store();

        let first = store.upsert(entry("i1"), None).unwrap();
        assert!(first.created);
        assert_eq!(first.version, 1);

        let second = store.upsert(entry("i1"), Some(first.version)).unwrap();
        assert!(!second.created);
        assert!(second.version > first.version);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_preserves_registered_at() {
        let store = store();
        let original = store.upsert(entry("i1"), None).unwrap().entry;

        let mut replacement = entry("i1");
        replacement.registered_at = original.registered_at + chrono::TimeDelta::seconds(30);
        let updated = store.upsert(replacement, None).unwrap().entry;

        assert_eq!(updated.registered_at, original.registered_at);
    }

    #[test]
    fn test_stale_expected_version_conflicts() {
        let store = store();
        let v1 = store.upsert(entry("i1"), None).unwrap().version;
        store.upsert(entry("i1"), Some(v1)).unwrap();

        let err = store.upsert(entry("i1"), Some(v1)).unwrap_err();
        assert!(err.is_conflict());

        let err = store.remove("checkout", "i1", Some(v1)).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_versioned_write_to_missing_key_conflicts() {
        let store = store();
        let err = store.upsert(entry("ghost"), Some(3)).unwrap_err();
        assert_eq!(
            err,
            Error::Conflict {
                key: "checkout/ghost".to_string(),
                expected: 3,
                actual: None,
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_get_and_remove() {
        let store = store();
        assert!(store.get("checkout", "i1").unwrap_err().is_not_found());

        let version = store.upsert(entry("i1"), None).unwrap().version;
        assert_eq!(store.get("checkout", "i1").unwrap().version, version);

        let removed = store.remove("checkout", "i1", Some(version)).unwrap();
        assert!(removed.version > version);
        assert!(store.get("checkout", "i1").unwrap_err().is_not_found());
        assert!(store.remove("checkout", "i1", None).unwrap_err().is_not_found());
        assert!(store.list_services().is_empty());
    }

    #[test]
    fn test_list_and_services_index() {
        let store = store();
        store.upsert(entry("i2"), None).unwrap();
        store.upsert(entry("i1"), None).unwrap();
        store
            .upsert(ServiceEntry::new("billing", "b1", "10.0.0.2:80", 10, Utc::now()), None)
            .unwrap();

        let ids: Vec<String> = store.list("checkout").into_iter().map(|e| e.instance_id).collect();
        assert_eq!(ids, vec!["i1", "i2"]);
        assert_eq!(store.list_services(), vec!["billing", "checkout"]);
        assert!(store.list("unknown").is_empty());
    }

    #[test]
    fn test_snapshot_reports_store_version() {
        let store = store();
        store.upsert(entry("i1"), None).unwrap();
        let last = store.upsert(entry("i2"), None).unwrap().version;

        let snapshot = store.snapshot();
        assert_eq!(snapshot.entries.len(), 2);
        assert_eq!(snapshot.store_version, last);
        assert!(snapshot.entries.iter().all(|e| e.version <= snapshot.store_version));

        let service = store.snapshot_service("checkout");
        assert_eq!(service.entries.len(), 2);
        assert_eq!(service.store_version, last);
    }

    #[test]
    fn test_mutations_publish_events_in_order() {
        let store = store();
        let mut sub = store.notifier().subscribe("checkout");

        let v1 = store.upsert(entry("i1"), None).unwrap().version;
        let v2 = store.upsert(entry("i1"), Some(v1)).unwrap().version;
        let removed = store.remove("checkout", "i1", Some(v2)).unwrap();

        let mut seen = Vec::new();
        while let Some(WatchItem::Event(ev)) = sub.try_recv() {
            seen.push((ev.kind, ev.version()));
        }
        assert_eq!(
            seen,
            vec![
                (ChangeKind::Added, v1),
                (ChangeKind::Updated, v2),
                (ChangeKind::Removed, removed.version),
            ]
        );
    }

    #[test]
    fn test_concurrent_versioned_upserts_one_wins() {
        let store = Arc::new(store());
        let version = store.upsert(entry("i1"), None).unwrap().version;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.upsert(entry("i1"), Some(version)))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| r.as_ref().is_err_and(Error::is_conflict))
            .count();

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 7);
    }
}
