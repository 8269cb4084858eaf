//! Client-facing endpoints: list, stats, resolve and watch

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use bakerstreet_core::{RegistryStats, SelectionPolicy, WatchItem};
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;

use super::{AppResult, AppState};
use crate::models::{DroppedNotice, ResolveQuery, ResolveResponse, ServicesResponse, WatchSnapshot};

const WATCH_KEEP_ALIVE: Duration = Duration::from_secs(15);

pub async fn list_services(State(state): State<AppState>) -> Json<ServicesResponse> {
    Json(ServicesResponse {
        services: state.registry.list_services(),
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<RegistryStats> {
    Json(state.registry.stats())
}

/// Resolve live instances, e.g. `?policy=random&count=2&seed=7`
pub async fn resolve(
    State(state): State<AppState>,
    Path(service): Path<String>,
    query: Result<Query<ResolveQuery>, QueryRejection>,
) -> AppResult<Json<ResolveResponse>> {
    let Query(query) = query?;
    let policy = SelectionPolicy::from_parts(
        query.policy.as_deref().unwrap_or("all"),
        query.count,
        query.seed,
        query.key,
    )?;

    let resolution = state.registry.resolve(&service, &policy);
    tracing::debug!(
        service = %service,
        policy = policy.name(),
        returned = resolution.entries.len(),
        "Resolved service"
    );

    Ok(Json(ResolveResponse {
        service_name: resolution.service_name,
        policy: policy.name().to_string(),
        store_version: resolution.store_version,
        entries: resolution.entries,
    }))
}

/// Server-sent events: one `snapshot`, then `change` events, with a
/// `dropped` marker (followed by the resynced entries) if the client lags.
pub async fn watch(
    State(state): State<AppState>,
    Path(service): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let watch = state.registry.watch(&service);
    let snapshot = WatchSnapshot {
        service_name: service,
        store_version: watch.store_version(),
        entries: watch.initial().to_vec(),
    };

    let first = stream::once(async move { sse_event("snapshot", &snapshot) });
    let changes = watch.into_stream().map(|item| match item {
        WatchItem::Event(event) => sse_event("change", &event),
        WatchItem::Dropped { missed } => sse_event("dropped", &DroppedNotice { missed }),
    });

    Sse::new(first.chain(changes).map(Ok)).keep_alive(
        KeepAlive::new()
            .interval(WATCH_KEEP_ALIVE)
            .text("ping"),
    )
}

fn sse_event<T: Serialize>(name: &str, data: &T) -> Event {
    Event::default().event(name).json_data(data).unwrap_or_else(|e| {
        tracing::error!(event = name, error = %e, "Failed to encode watch event");
        Event::default().event("error").data("encoding failed")
    })
}
