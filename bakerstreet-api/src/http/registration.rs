//! Agent-facing endpoints: register, heartbeat, deregister

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use bakerstreet_core::Registration;

use super::{AppResult, AppState};
use crate::models::{DeregisterResponse, HeartbeatResponse, RegisterBody};

/// Register an instance. 201 when the entry is new, 200 when an existing
/// live entry was refreshed.
pub async fn register(
    State(state): State<AppState>,
    Path(service): Path<String>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> AppResult<(StatusCode, Json<Registration>)> {
    let Json(body) = payload?;
    let registration = state.registry.register(body.into_request(service))?;

    let status = if registration.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(registration)))
}

pub async fn heartbeat(
    State(state): State<AppState>,
    Path((service, instance)): Path<(String, String)>,
) -> AppResult<Json<HeartbeatResponse>> {
    let version = state.registry.heartbeat(&service, &instance)?;

    Ok(Json(HeartbeatResponse {
        service_name: service,
        instance_id: instance,
        version,
    }))
}

pub async fn deregister(
    State(state): State<AppState>,
    Path((service, instance)): Path<(String, String)>,
) -> AppResult<Json<DeregisterResponse>> {
    let removed = state.registry.deregister(&service, &instance)?;

    Ok(Json(DeregisterResponse {
        service_name: removed.service_name,
        instance_id: removed.instance_id,
        version: removed.version,
    }))
}
