//! Registration gateway
//!
//! Validates and normalizes registration requests before they reach the
//! entry store, and owns the bounded retry policy for version conflicts.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use super::clock::SharedClock;
use super::entry::ServiceEntry;
use super::entry_store::EntryStore;
use super::liveness::LivenessManager;
use crate::config::RegistryConfig;
use crate::error::{Error, Result};

/// Maximum length of a service name or instance id
pub const NAME_MAX: usize = 253;
/// Maximum number of metadata tags per entry
pub const METADATA_MAX_ENTRIES: usize = 64;

/// Incoming registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub service_name: String,
    /// Generated when absent
    #[serde(default)]
    pub instance_id: Option<String>,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Falls back to the configured default
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl RegistrationRequest {
    #[must_use]
    pub fn new(service_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            address: address.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    #[must_use]
    pub const fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = Some(ttl_secs);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub service_name: String,
    pub instance_id: String,
    pub version: u64,
    /// `false` when an existing live entry was refreshed
    pub created: bool,
    pub ttl_secs: u64,
}

pub struct RegistrationGateway {
    store: Arc<EntryStore>,
    liveness: Arc<LivenessManager>,
    clock: SharedClock,
    config: RegistryConfig,
}

impl RegistrationGateway {
    #[must_use]
    pub fn new(
        store: Arc<EntryStore>,
        liveness: Arc<LivenessManager>,
        clock: SharedClock,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            liveness,
            clock,
            config,
        }
    }

    /// Register an instance, or refresh it if it is already live.
    pub fn register(&self, request: RegistrationRequest) -> Result<Registration> {
        let template = self.validate(request)?;
        let service_name = template.service_name.clone();
        let instance_id = template.instance_id.clone();

        let outcome = self.with_retries("register", || {
            let now = self.clock.now();
            let mut entry = template.clone();
            entry.registered_at = now;
            entry.last_heartbeat_at = now;

            let expected = match self.store.get(&service_name, &instance_id) {
                Ok(existing) if existing.is_live_at(now) => Some(existing.version),
                Ok(existing) => {
                    // Dead but not yet swept: expire it so this is a fresh registration
                    self.store
                        .remove(&service_name, &instance_id, Some(existing.version))?;
                    None
                }
                Err(Error::NotFound(_)) => None,
                Err(e) => return Err(e),
            };

            self.store.upsert(entry, expected)
        })?;

        tracing::info!(
            service = %service_name,
            instance_id = %instance_id,
            address = %outcome.entry.address,
            version = outcome.version,
            created = outcome.created,
            "Instance registered"
        );

        Ok(Registration {
            service_name,
            instance_id,
            version: outcome.version,
            created: outcome.created,
            ttl_secs: outcome.entry.ttl_secs,
        })
    }

    /// Renew an instance's heartbeat, absorbing a bounded number of conflicts
    pub fn heartbeat(&self, service_name: &str, instance_id: &str) -> Result<u64> {
        let result = self.with_retries("heartbeat", || self.liveness.heartbeat(service_name, instance_id));
        if let Err(Error::NotFound(_)) = &result {
            tracing::debug!(
                service = %service_name,
                instance_id = %instance_id,
                "Heartbeat for unknown or expired instance, agent must re-register"
            );
        }
        result
    }

    /// Remove an instance through the versioned removal path
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> Result<ServiceEntry> {
        let removed = self.with_retries("deregister", || {
            let current = self.store.get(service_name, instance_id)?;
            self.store.remove(service_name, instance_id, Some(current.version))
        })?;

        tracing::info!(
            service = %service_name,
            instance_id = %instance_id,
            version = removed.version,
            "Instance deregistered"
        );
        Ok(removed)
    }

    fn with_retries<T>(&self, operation: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(err) if err.is_conflict() && attempt < self.config.heartbeat_retries => {
                    attempt += 1;
                    tracing::debug!(operation, attempt, error = %err, "Retrying after version conflict");
                }
                result => return result,
            }
        }
    }

    /// Check and normalize a request into an entry template
    pub fn validate(&self, request: RegistrationRequest) -> Result<ServiceEntry> {
        let service_name = validate_name("service_name", &request.service_name)?;
        let instance_id = match request.instance_id.as_deref() {
            Some(id) => validate_name("instance_id", id)?,
            None => nanoid::nanoid!(12),
        };
        let address = validate_address(&request.address)?;

        let ttl_secs = request.ttl_secs.unwrap_or(self.config.default_ttl_secs);
        if ttl_secs < self.config.min_ttl_secs || ttl_secs > self.config.max_ttl_secs {
            return Err(Error::Validation(format!(
                "ttl_secs must be between {} and {}, got {ttl_secs}",
                self.config.min_ttl_secs, self.config.max_ttl_secs
            )));
        }

        if request.metadata.len() > METADATA_MAX_ENTRIES {
            return Err(Error::Validation(format!(
                "at most {METADATA_MAX_ENTRIES} metadata entries are allowed"
            )));
        }
        if request.metadata.keys().any(|k| k.trim().is_empty()) {
            return Err(Error::Validation("metadata keys must not be empty".to_string()));
        }

        let mut entry = ServiceEntry::new(service_name, instance_id, address, ttl_secs, self.clock.now());
        entry.metadata = request.metadata;
        Ok(entry)
    }
}

fn validate_name(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    if value.len() > NAME_MAX {
        return Err(Error::Validation(format!("{field} exceeds {NAME_MAX} characters")));
    }
    if let Some(bad) = value
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
    {
        return Err(Error::Validation(format!("{field} contains invalid character '{bad}'")));
    }
    Ok(value.to_string())
}

/// Accepts `host:port`, `[v6]:port` or an absolute URI with a host.
fn validate_address(address: &str) -> Result<String> {
    let address = address.trim();
    let invalid = |reason: &str| Error::Validation(format!("address '{address}' {reason}"));

    if address.is_empty() {
        return Err(Error::Validation("address must not be empty".to_string()));
    }

    if address.contains("://") {
        let url = url::Url::parse(address).map_err(|e| invalid(&format!("is not a valid URI: {e}")))?;
        if url.host_str().is_none_or(str::is_empty) {
            return Err(invalid("has no host"));
        }
        return Ok(address.to_string());
    }

    if address.parse::<SocketAddr>().is_ok() {
        return Ok(address.to_string());
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("must be host:port or a URI"))?;
    match port.parse::<u16>() {
        Ok(p) if p > 0 => {}
        _ => return Err(invalid("has an invalid port")),
    }
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    if !host_ok {
        return Err(invalid("has an invalid host"));
    }

    Ok(address.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::clock::{Clock, ManualClock};
    use crate::discovery::notifier::ChangeNotifier;
    use std::time::Duration;

    struct Fixture {
        clock: ManualClock,
        store: Arc<EntryStore>,
        gateway: RegistrationGateway,
    }

    fn fixture() -> Fixture {
        let clock = ManualClock::starting_now();
        let shared: SharedClock = Arc::new(clock.clone());
        let store = Arc::new(EntryStore::new(ChangeNotifier::new(64)));
        let liveness = Arc::new(LivenessManager::new(store.clone(), shared.clone(), Duration::from_secs(1)));
        let gateway = RegistrationGateway::new(store.clone(), liveness, shared, RegistryConfig::default());
        Fixture { clock, store, gateway }
    }

    #[test]
    fn test_register_generates_instance_id() {
        let f = fixture();
        let registration = f
            .gateway
            .register(RegistrationRequest::new("checkout", "10.0.0.1:9000"))
            .unwrap();

        assert!(registration.created);
        assert_eq!(registration.instance_id.len(), 12);
        assert_eq!(registration.ttl_secs, RegistryConfig::default().default_ttl_secs);
        assert!(f.store.get("checkout", &registration.instance_id).is_ok());
    }

    #[test]
    fn test_reregistration_refreshes_instead_of_duplicating() {
        let f = fixture();
        let request = RegistrationRequest::new("checkout", "10.0.0.1:9000")
            .with_instance_id("i1")
            .with_ttl_secs(10);

        let first = f.gateway.register(request.clone()).unwrap();
        f.clock.advance(Duration::from_secs(5));
        let second = f
            .gateway
            .register(request.with_metadata("version", "2.0"))
            .unwrap();

        assert!(!second.created);
        assert!(second.version > first.version);
        assert_eq!(f.store.len(), 1);

        let stored = f.store.get("checkout", "i1").unwrap();
        assert_eq!(stored.metadata.get("version").map(String::as_str), Some("2.0"));
        assert_eq!(stored.last_heartbeat_at, f.clock.now());
        assert!(stored.registered_at < stored.last_heartbeat_at);
    }

    #[test]
    fn test_reregistration_of_dead_entry_is_fresh() {
        let f = fixture();
        let request = RegistrationRequest::new("checkout", "10.0.0.1:9000")
            .with_instance_id("i1")
            .with_ttl_secs(10);

        f.gateway.register(request.clone()).unwrap();
        f.clock.advance(Duration::from_secs(15));
        let again = f.gateway.register(request).unwrap();

        assert!(again.created);
        let stored = f.store.get("checkout", "i1").unwrap();
        assert_eq!(stored.registered_at, stored.last_heartbeat_at);
    }

    #[test]
    fn test_validation_rejects_bad_requests() {
        let f = fixture();
        let cases = [
            RegistrationRequest::new("", "10.0.0.1:9000"),
            RegistrationRequest::new("check out", "10.0.0.1:9000"),
            RegistrationRequest::new("checkout", "10.0.0.1:9000").with_instance_id("   "),
            RegistrationRequest::new("checkout", ""),
            RegistrationRequest::new("checkout", "10.0.0.1"),
            RegistrationRequest::new("checkout", "10.0.0.1:0"),
            RegistrationRequest::new("checkout", "10.0.0.1:99999"),
            RegistrationRequest::new("checkout", "bad host:80"),
            RegistrationRequest::new("checkout", "http://"),
            RegistrationRequest::new("checkout", "10.0.0.1:9000").with_ttl_secs(0),
            RegistrationRequest::new("checkout", "10.0.0.1:9000").with_ttl_secs(1_000_000),
            RegistrationRequest::new("checkout", "10.0.0.1:9000").with_metadata(" ", "x"),
        ];

        for request in cases {
            let err = f.gateway.register(request.clone()).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{request:?} gave {err:?}");
        }
        assert!(f.store.is_empty());
    }

    #[test]
    fn test_validation_accepts_address_forms() {
        for address in ["10.0.0.1:9000", "[::1]:9000", "checkout.internal:443", "grpc://10.0.0.1:50051", "https://checkout.example.com/api"] {
            assert!(validate_address(address).is_ok(), "{address} should be valid");
        }
    }

    #[test]
    fn test_heartbeat_and_deregister() {
        let f = fixture();
        let registration = f
            .gateway
            .register(RegistrationRequest::new("checkout", "10.0.0.1:9000").with_instance_id("i1"))
            .unwrap();

        let version = f.gateway.heartbeat("checkout", "i1").unwrap();
        assert!(version > registration.version);

        let removed = f.gateway.deregister("checkout", "i1").unwrap();
        assert!(removed.version > version);
        assert!(f.gateway.heartbeat("checkout", "i1").unwrap_err().is_not_found());
        assert!(f.gateway.deregister("checkout", "i1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_retries_are_bounded() {
        let f = fixture();
        let mut calls = 0;
        let result: Result<()> = f.gateway.with_retries("test", || {
            calls += 1;
            Err(Error::Conflict { key: "k".into(), expected: 1, actual: Some(2) })
        });

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls, RegistryConfig::default().heartbeat_retries + 1);
    }
}
