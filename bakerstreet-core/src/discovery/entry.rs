//! Service entry model

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Unique key of an entry: `(service_name, instance_id)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryKey {
    pub service_name: String,
    pub instance_id: String,
}

impl EntryKey {
    #[must_use]
    pub fn new(service_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
        }
    }
}

impl fmt::Display for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service_name, self.instance_id)
    }
}

/// One registered instance of one named service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub service_name: String,
    pub instance_id: String,
    /// `host:port` or an absolute URI
    pub address: String,
    /// Opaque tags (version, region, weight, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Maximum silence before the entry is considered dead
    pub ttl_secs: u64,
    /// Assigned by the store, bumped on every mutation
    #[serde(default)]
    pub version: u64,
}

impl ServiceEntry {
    #[must_use]
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        address: impl Into<String>,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            address: address.into(),
            metadata: HashMap::new(),
            registered_at: now,
            last_heartbeat_at: now,
            ttl_secs,
            version: 0,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.service_name.clone(), self.instance_id.clone())
    }

    #[must_use]
    pub fn ttl(&self) -> TimeDelta {
        i64::try_from(self.ttl_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }

    /// First instant at which the entry is dead, absent a heartbeat
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .checked_add_signed(self.ttl())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Live iff `now - last_heartbeat_at < ttl`
    #[must_use]
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ttl_secs: u64) -> ServiceEntry {
        ServiceEntry::new("checkout", "i1", "10.0.0.1:9000", ttl_secs, Utc::now())
    }

    #[test]
    fn test_liveness_boundary() {
        let entry = entry(10);
        let start = entry.last_heartbeat_at;

        assert!(entry.is_live_at(start));
        assert!(entry.is_live_at(start + TimeDelta::milliseconds(9_999)));
        // Exactly ttl of silence is already dead
        assert!(!entry.is_live_at(start + TimeDelta::seconds(10)));
        assert!(!entry.is_live_at(start + TimeDelta::seconds(11)));
    }

    #[test]
    fn test_huge_ttl_does_not_overflow() {
        let entry = entry(u64::MAX);
        assert_eq!(entry.expires_at(), DateTime::<Utc>::MAX_UTC);
        assert!(entry.is_live_at(Utc::now()));
    }

    #[test]
    fn test_key_display() {
        let entry = entry(10).with_metadata("region", "eu-west-1");
        assert_eq!(entry.key().to_string(), "checkout/i1");
        assert_eq!(entry.metadata.get("region").map(String::as_str), Some("eu-west-1"));
    }

    #[test]
    fn test_entry_serialization() {
        let entry = entry(30).with_metadata("weight", "5");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"ttl_secs\":30"));

        let decoded: ServiceEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, entry);
    }
}
