//! Core of the Baker Street service registry: entry store, liveness,
//! resolution, registration and change notification.

pub mod config;
pub mod discovery;
pub mod error;
pub mod logging;

pub use config::{Config, LoggingConfig, RegistryConfig, ServerConfig};
pub use discovery::{
    ChangeEvent, ChangeKind, Registration, RegistrationRequest, Registry, RegistryStats, Resolution,
    SelectionPolicy, ServiceEntry, Watch, WatchItem,
};
pub use error::{Error, Result};
