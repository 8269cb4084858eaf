// Baker Street API Library
//
// HTTP surface of the registry daemon and the client agents use to reach it

pub mod client;
pub mod http;
pub mod models;

pub use client::{ClientError, RegistryClient};
pub use http::{create_router, AppState};
