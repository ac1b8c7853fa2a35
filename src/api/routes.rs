//! API route definitions.

use std::collections::{BTreeMap, HashMap};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::state::AppState;
use crate::detect::{ScanError, ScanOutcome};
use crate::runtime::RuntimeError;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/detections", get(list_detections))
        .route("/detections/{id}", get(get_detection))
        .route("/scan/{container_id}", post(scan_container))
        .route("/stats", get(stats))
        .route("/history/{server_identifier}", get(history))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let scanner = state.status.snapshot().await;
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "scanner": scanner,
        },
        "meta": {
            "timestamp": Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

async fn list_detections(State(state): State<AppState>) -> Json<Value> {
    let detections = state.store.list().await;
    Json(json!({ "data": detections, "meta": { "total": detections.len() } }))
}

async fn get_detection(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let Ok(id) = Uuid::parse_str(&id) else {
        return error(StatusCode::BAD_REQUEST, format!("invalid detection id: {}", id));
    };
    match state.store.get(id).await {
        Some(detection) => Json(json!({ "data": detection })).into_response(),
        None => error(StatusCode::NOT_FOUND, "detection not found"),
    }
}

async fn scan_container(
    State(state): State<AppState>,
    Path(container_id): Path<String>,
) -> Response {
    info!(container = %container_id, "on-demand scan requested");
    match state.engine.scan_container(&container_id).await {
        Ok(ScanOutcome::Detected(detection)) => Json(json!({
            "data": detection,
            "meta": { "outcome": "detected" }
        }))
        .into_response(),
        Ok(ScanOutcome::Clean { volume_id }) => Json(json!({
            "data": null,
            "meta": { "outcome": "clean", "volumeId": volume_id }
        }))
        .into_response(),
        Ok(ScanOutcome::Skipped {
            volume_id,
            last_flagged_at,
        }) => Json(json!({
            "data": null,
            "meta": {
                "outcome": "skipped",
                "volumeId": volume_id,
                "lastFlaggedAt": last_flagged_at
            }
        }))
        .into_response(),
        Ok(ScanOutcome::Cancelled { volume_id }) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "data": null,
                "meta": { "outcome": "cancelled", "volumeId": volume_id }
            })),
        )
            .into_response(),
        Err(e) => {
            warn!(container = %container_id, error = %e, "on-demand scan failed");
            let status = match &e {
                ScanError::Runtime(RuntimeError::NotFound(_)) => StatusCode::NOT_FOUND,
                ScanError::NoStorageMount { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                ScanError::Runtime(_) => StatusCode::BAD_GATEWAY,
            };
            error(status, e.to_string())
        }
    }
}

async fn stats(State(state): State<AppState>) -> Json<Value> {
    let stats = state.store.stats(Utc::now()).await;

    let mut per_volume: HashMap<String, usize> = HashMap::new();
    for detection in state.store.list().await {
        *per_volume.entry(detection.volume_id).or_insert(0) += 1;
    }

    let mut by_node: BTreeMap<String, usize> = BTreeMap::new();
    for (volume_id, count) in per_volume {
        let node = node_name(&state, &volume_id).await;
        *by_node.entry(node).or_insert(0) += count;
    }

    Json(json!({
        "data": {
            "total": stats.total,
            "recent24h": stats.recent_24h,
            "byType": stats.by_type,
            "byNode": by_node,
        },
        "meta": { "timestamp": Utc::now().to_rfc3339() }
    }))
}

async fn node_name(state: &AppState, volume_id: &str) -> String {
    const UNKNOWN: &str = "unknown";
    let Some(platform) = &state.platform else {
        return UNKNOWN.to_string();
    };
    let server = match platform.server_by_volume_uuid(volume_id).await {
        Ok(Some(server)) => server,
        Ok(None) => return UNKNOWN.to_string(),
        Err(e) => {
            warn!(volume = volume_id, error = %e, "server lookup failed for stats");
            return UNKNOWN.to_string();
        }
    };
    match platform.node_by_id(server.node).await {
        Ok(node) => node.name,
        Err(e) => {
            warn!(node_id = server.node, error = %e, "node lookup failed for stats");
            UNKNOWN.to_string()
        }
    }
}

async fn history(
    State(state): State<AppState>,
    Path(server_identifier): Path<String>,
) -> Json<Value> {
    let detections = state.store.by_volume(&server_identifier).await;
    Json(json!({
        "data": detections,
        "meta": { "total": detections.len(), "server": server_identifier }
    }))
}
