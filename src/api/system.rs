use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use super::error::ApiError;
use crate::db::AppStatus;
use crate::runtime::RuntimeInfo;
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub version: String,
    pub runtime_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime: Option<RuntimeInfo>,
    pub total_apps: usize,
    pub running_apps: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub building_app: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub image_bytes: i64,
    pub build_log_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortsInfo {
    pub range_start: u16,
    pub range_end: u16,
    pub used: Vec<u16>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneResult {
    pub reclaimed_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearLogsResult {
    pub cleared: usize,
}

/// GET /api/v1/system/info
///
/// Runtime details are omitted rather than failing the request when the
/// daemon is unreachable.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Result<Json<SystemInfo>, ApiError> {
    let apps = state.manager.list().await?;
    let running_apps = apps
        .iter()
        .filter(|app| app.status == AppStatus::Running)
        .count();

    let runtime = match state.manager.runtime().info().await {
        Ok(info) => Some(info),
        Err(e) => {
            tracing::debug!("Runtime info unavailable: {:#}", e);
            None
        }
    };

    Ok(Json(SystemInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        runtime_available: runtime.is_some(),
        runtime,
        total_apps: apps.len(),
        running_apps,
        building_app: state.manager.builds().current_app(),
    }))
}

/// GET /api/v1/system/storage
pub async fn storage(State(state): State<Arc<AppState>>) -> Result<Json<StorageInfo>, ApiError> {
    let apps = state.manager.list().await?;
    let image_bytes: i64 = apps.iter().map(|app| app.image_size.max(0)).sum();
    let build_log_bytes = state.manager.builds().logs_size().await?;

    Ok(Json(StorageInfo {
        image_bytes,
        build_log_bytes,
    }))
}

/// GET /api/v1/system/ports
pub async fn ports(State(state): State<Arc<AppState>>) -> Result<Json<PortsInfo>, ApiError> {
    let ports = state.manager.ports();
    let (range_start, range_end) = ports.range();
    let used = ports.used_ports().await?;

    Ok(Json(PortsInfo {
        range_start,
        range_end,
        used,
    }))
}

/// POST /api/v1/system/prune
pub async fn prune_images(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PruneResult>, ApiError> {
    let reclaimed_bytes = state
        .manager
        .runtime()
        .prune_images()
        .await
        .map_err(crate::engine::EngineError::Runtime)?;

    tracing::info!(reclaimed_bytes, "Pruned dangling images");
    Ok(Json(PruneResult { reclaimed_bytes }))
}

/// DELETE /api/v1/system/logs
pub async fn clear_logs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ClearLogsResult>, ApiError> {
    let cleared = state.manager.builds().clear_all_logs().await?;
    Ok(Json(ClearLogsResult { cleared }))
}
