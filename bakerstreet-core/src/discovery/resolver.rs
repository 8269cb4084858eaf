//! Query resolution
//!
//! Answers "who provides service X" from a consistent snapshot, filtered to
//! entries live at the moment of the read, then narrowed by a selection
//! policy.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::clock::SharedClock;
use super::entry::ServiceEntry;
use super::entry_store::EntryStore;
use crate::error::{Error, Result};

/// Metadata key read by [`SelectionPolicy::Weighted`] unless overridden
pub const DEFAULT_WEIGHT_KEY: &str = "weight";
/// Metadata key read by [`SelectionPolicy::LeastLoaded`] unless overridden
pub const DEFAULT_LOAD_KEY: &str = "connections";

/// How to narrow the live entries of a service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Every live entry, ordered by instance id
    #[default]
    All,
    /// `count` entries sampled uniformly
    Random {
        count: usize,
        #[serde(default)]
        seed: Option<u64>,
    },
    /// `count` entries sampled without replacement, proportionally to the
    /// numeric metadata value under `weight_key`
    Weighted {
        count: usize,
        #[serde(default)]
        seed: Option<u64>,
        #[serde(default = "default_weight_key")]
        weight_key: String,
    },
    /// The `count` entries reporting the smallest load under `load_key`
    LeastLoaded {
        count: usize,
        #[serde(default = "default_load_key")]
        load_key: String,
    },
}

fn default_weight_key() -> String {
    DEFAULT_WEIGHT_KEY.to_string()
}

fn default_load_key() -> String {
    DEFAULT_LOAD_KEY.to_string()
}

impl SelectionPolicy {
    /// Build a policy from loosely typed parameters (query strings, CLI flags).
    ///
    /// `count` defaults to 1 and `key` to the policy's default metadata key.
    pub fn from_parts(name: &str, count: Option<usize>, seed: Option<u64>, key: Option<String>) -> Result<Self> {
        let count = count.unwrap_or(1);
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "" | "all" => Ok(Self::All),
            "random" => Ok(Self::Random { count, seed }),
            "weighted" => Ok(Self::Weighted {
                count,
                seed,
                weight_key: key.unwrap_or_else(default_weight_key),
            }),
            "least_loaded" => Ok(Self::LeastLoaded {
                count,
                load_key: key.unwrap_or_else(default_load_key),
            }),
            other => Err(Error::Validation(format!(
                "unknown selection policy '{other}' (expected all, random, weighted or least_loaded)"
            ))),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Random { .. } => "random",
            Self::Weighted { .. } => "weighted",
            Self::LeastLoaded { .. } => "least_loaded",
        }
    }

    /// Apply the policy. Deterministic for a given input and seed.
    #[must_use]
    pub fn select(&self, mut entries: Vec<ServiceEntry>) -> Vec<ServiceEntry> {
        entries.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        match self {
            Self::All => entries,
            Self::Random { count, seed } => {
                let count = (*count).min(entries.len());
                let mut rng = seeded_rng(*seed);
                let (chosen, _) = entries.partial_shuffle(&mut rng, count);
                chosen.to_vec()
            }
            Self::Weighted { count, seed, weight_key } => {
                // Efraimidis-Spirakis: key = ln(u) / w, keep the largest keys
                let mut rng = seeded_rng(*seed);
                let mut keyed: Vec<(f64, ServiceEntry)> = entries
                    .into_iter()
                    .filter_map(|entry| {
                        let u: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
                        let weight = weight_of(&entry, weight_key);
                        (weight > 0.0).then(|| (u.ln() / weight, entry))
                    })
                    .collect();
                keyed.sort_by(|a, b| b.0.total_cmp(&a.0));
                keyed.into_iter().take(*count).map(|(_, entry)| entry).collect()
            }
            Self::LeastLoaded { count, load_key } => {
                entries.sort_by_cached_key(|entry| {
                    let load = entry
                        .metadata
                        .get(load_key)
                        .and_then(|v| v.trim().parse::<u64>().ok());
                    (load.is_none(), load.unwrap_or(0), entry.instance_id.clone())
                });
                entries.truncate(*count);
                entries
            }
        }
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64)
}

/// Missing or unparsable weights count as 1; negative weights as 0.
fn weight_of(entry: &ServiceEntry, weight_key: &str) -> f64 {
    match entry.metadata.get(weight_key).map(|v| v.trim().parse::<f64>()) {
        Some(Ok(weight)) if weight.is_finite() => weight.max(0.0),
        _ => 1.0,
    }
}

/// Answer to a resolve call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub service_name: String,
    pub entries: Vec<ServiceEntry>,
    /// Store version observed when the read began
    pub store_version: u64,
}

pub struct QueryResolver {
    store: Arc<EntryStore>,
    clock: SharedClock,
}

impl QueryResolver {
    #[must_use]
    pub fn new(store: Arc<EntryStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// Resolve a service. An unknown service and one with no live instance
    /// both yield an empty answer.
    #[must_use]
    pub fn resolve(&self, service_name: &str, policy: &SelectionPolicy) -> Resolution {
        let snapshot = self.store.read_service(service_name);
        let now = self.clock.now();
        let total = snapshot.entries.len();

        let live: Vec<ServiceEntry> = snapshot
            .entries
            .into_iter()
            .filter(|entry| entry.is_live_at(now))
            .collect();

        if live.len() < total {
            tracing::trace!(
                service = %service_name,
                filtered = total - live.len(),
                "Dead entries awaiting sweep filtered from resolve"
            );
        }

        Resolution {
            service_name: service_name.to_string(),
            entries: policy.select(live),
            store_version: snapshot.store_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::clock::{Clock, ManualClock};
    use crate::discovery::notifier::ChangeNotifier;
    use std::time::Duration;

    fn entries(n: usize) -> Vec<ServiceEntry> {
        (0..n)
            .map(|i| {
                ServiceEntry::new("checkout", format!("i{i}"), "10.0.0.1:9000", 10, chrono::Utc::now())
            })
            .collect()
    }

    fn ids(entries: &[ServiceEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.instance_id.as_str()).collect()
    }

    #[test]
    fn test_all_is_sorted() {
        let mut input = entries(3);
        input.reverse();
        assert_eq!(ids(&SelectionPolicy::All.select(input)), vec!["i0", "i1", "i2"]);
    }

    #[test]
    fn test_random_is_deterministic_with_seed() {
        let policy = SelectionPolicy::Random { count: 3, seed: Some(42) };
        let first = policy.select(entries(10));
        let mut shuffled = entries(10);
        shuffled.reverse();
        let second = policy.select(shuffled);

        assert_eq!(first.len(), 3);
        assert_eq!(ids(&first), ids(&second));
    }

    #[test]
    fn test_random_count_larger_than_population() {
        let policy = SelectionPolicy::Random { count: 5, seed: None };
        assert_eq!(policy.select(entries(2)).len(), 2);
        assert!(policy.select(Vec::new()).is_empty());
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let mut input = entries(3);
        input[0].metadata.insert("weight".into(), "0".into());
        input[1].metadata.insert("weight".into(), "not-a-number".into());
        input[2].metadata.insert("weight".into(), "5".into());

        let policy = SelectionPolicy::Weighted {
            count: 3,
            seed: Some(7),
            weight_key: DEFAULT_WEIGHT_KEY.to_string(),
        };
        let chosen = policy.select(input);

        assert_eq!(chosen.len(), 2);
        assert!(chosen.iter().all(|e| e.instance_id != "i0"));
    }

    #[test]
    fn test_weighted_prefers_heavy_entries() {
        let mut input = entries(2);
        input[0].metadata.insert("weight".into(), "1".into());
        input[1].metadata.insert("weight".into(), "1000".into());

        let heavy_first = (0..200)
            .filter(|seed| {
                let policy = SelectionPolicy::Weighted {
                    count: 1,
                    seed: Some(*seed),
                    weight_key: DEFAULT_WEIGHT_KEY.to_string(),
                };
                policy.select(input.clone())[0].instance_id == "i1"
            })
            .count();

        assert!(heavy_first > 180, "heavy entry chosen {heavy_first}/200 times");
    }

    #[test]
    fn test_least_loaded_orders_by_load() {
        let mut input = entries(4);
        input[0].metadata.insert("connections".into(), "40".into());
        input[1].metadata.insert("connections".into(), "3".into());
        input[3].metadata.insert("connections".into(), "3".into());

        let policy = SelectionPolicy::LeastLoaded {
            count: 4,
            load_key: DEFAULT_LOAD_KEY.to_string(),
        };
        // Ties broken by instance id, missing load last
        assert_eq!(ids(&policy.select(input)), vec!["i1", "i3", "i0", "i2"]);
    }

    #[test]
    fn test_from_parts() {
        assert_eq!(SelectionPolicy::from_parts("all", None, None, None).unwrap(), SelectionPolicy::All);
        assert_eq!(
            SelectionPolicy::from_parts("least-loaded", Some(2), None, None).unwrap(),
            SelectionPolicy::LeastLoaded { count: 2, load_key: "connections".to_string() }
        );
        assert_eq!(
            SelectionPolicy::from_parts("Random", None, Some(9), None).unwrap(),
            SelectionPolicy::Random { count: 1, seed: Some(9) }
        );
        assert!(matches!(
            SelectionPolicy::from_parts("round-robin", None, None, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_policy_deserialization() {
        let policy: SelectionPolicy =
            serde_json::from_str(r#"{"policy":"weighted","count":2}"#).unwrap();
        assert_eq!(
            policy,
            SelectionPolicy::Weighted { count: 2, seed: None, weight_key: "weight".to_string() }
        );
    }

    #[test]
    fn test_resolve_filters_dead_entries_before_sweep() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(EntryStore::new(ChangeNotifier::new(8)));
        let resolver = QueryResolver::new(store.clone(), Arc::new(clock.clone()));

        store
            .upsert(ServiceEntry::new("checkout", "short", "10.0.0.1:9000", 5, clock.now()), None)
            .unwrap();
        store
            .upsert(ServiceEntry::new("checkout", "long", "10.0.0.2:9000", 60, clock.now()), None)
            .unwrap();

        clock.advance(Duration::from_secs(5));
        let resolution = resolver.resolve("checkout", &SelectionPolicy::All);

        assert_eq!(ids(&resolution.entries), vec!["long"]);
        assert_eq!(resolution.store_version, store.store_version());
        // Resolve never mutates
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_resolve_runs_alongside_mutations() {
        let clock = ManualClock::starting_now();
        let store = Arc::new(EntryStore::new(ChangeNotifier::new(8)));
        let resolver = Arc::new(QueryResolver::new(store.clone(), Arc::new(clock.clone())));
        store
            .upsert(ServiceEntry::new("checkout", "i1", "10.0.0.1:9000", 30, clock.now()), None)
            .unwrap();

        let gate = store.mutation_in_flight();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = {
            let resolver = resolver.clone();
            std::thread::spawn(move || {
                tx.send(resolver.resolve("checkout", &SelectionPolicy::All)).unwrap();
            })
        };

        let resolution = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("resolve waited for the commit gate");
        assert_eq!(ids(&resolution.entries), vec!["i1"]);

        drop(gate);
        handle.join().unwrap();
    }

    #[test]
    fn test_resolve_unknown_service_is_empty() {
        let store = Arc::new(EntryStore::new(ChangeNotifier::new(8)));
        let resolver = QueryResolver::new(store, Arc::new(ManualClock::starting_now()));
        let resolution = resolver.resolve("nobody", &SelectionPolicy::All);
        assert!(resolution.entries.is_empty());
        assert_eq!(resolution.store_version, 0);
    }
}
