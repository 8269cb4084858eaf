//! Service registration, liveness and discovery

pub mod clock;
pub mod entry;
pub mod entry_store;
pub mod gateway;
pub mod liveness;
pub mod notifier;
pub mod registry;
pub mod resolver;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use entry::{EntryKey, ServiceEntry};
pub use entry_store::{EntryStore, Snapshot, UpsertOutcome};
pub use gateway::{Registration, RegistrationGateway, RegistrationRequest};
pub use liveness::{LivenessManager, SweepReport};
pub use notifier::{ChangeEvent, ChangeKind, ChangeNotifier, Subscription, WatchItem};
pub use registry::{Registry, RegistryStats, Watch};
pub use resolver::{QueryResolver, Resolution, SelectionPolicy};
