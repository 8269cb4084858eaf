// Module: http
// HTTP/JSON API of the registry daemon

pub mod discovery;
pub mod error;
pub mod health;
pub mod registration;

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use bakerstreet_core::Registry;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// Build the daemon's router
pub fn create_router(registry: Arc<Registry>) -> Router {
    let state = AppState { registry };

    Router::new()
        .merge(health::create_health_router())
        .route("/api/v1/services", get(discovery::list_services))
        .route("/api/v1/stats", get(discovery::stats))
        .route("/api/v1/services/{service}", get(discovery::resolve))
        .route("/api/v1/services/{service}/watch", get(discovery::watch))
        .route(
            "/api/v1/services/{service}/instances",
            post(registration::register),
        )
        .route(
            "/api/v1/services/{service}/instances/{instance}",
            delete(registration::deregister),
        )
        .route(
            "/api/v1/services/{service}/instances/{instance}/heartbeat",
            put(registration::heartbeat),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
