//! Wire types shared by the HTTP handlers and the client

use bakerstreet_core::discovery::ServiceEntry;
use bakerstreet_core::{ChangeEvent, RegistrationRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of `POST /api/v1/services/{service}/instances`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub address: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl RegisterBody {
    #[must_use]
    pub fn into_request(self, service_name: impl Into<String>) -> RegistrationRequest {
        RegistrationRequest {
            service_name: service_name.into(),
            instance_id: self.instance_id,
            address: self.address,
            metadata: self.metadata,
            ttl_secs: self.ttl_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub service_name: String,
    pub instance_id: String,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeregisterResponse {
    pub service_name: String,
    pub instance_id: String,
    /// Version assigned to the removal
    pub version: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesResponse {
    pub services: Vec<String>,
}

/// Query string of the resolve endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Metadata key read by weighted and least-loaded selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub service_name: String,
    pub policy: String,
    pub store_version: u64,
    pub entries: Vec<ServiceEntry>,
}

/// First event of a watch stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSnapshot {
    pub service_name: String,
    pub store_version: u64,
    pub entries: Vec<ServiceEntry>,
}

/// Payload of a `dropped` watch event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DroppedNotice {
    pub missed: u64,
}

/// One decoded event of a watch stream, keyed by its SSE event name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum WatchEvent {
    Snapshot(WatchSnapshot),
    Change(ChangeEvent),
    /// The stream lagged; resynced entries follow as `added` changes
    Dropped(DroppedNotice),
}

/// Error response JSON structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub status: u16,
}
