use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};

use super::error::ApiError;
use super::validation::{
    validate_clone_request, validate_configure_request, validate_create_request,
};
use crate::db::{
    App, AppResponse, CloneRequest, CloneResult, ConfigureAppRequest, CreateAppRequest,
    UpdateCheckResult,
};
use crate::engine::{EngineError, EngineResult};
use crate::runtime::LogLine;
use crate::AppState;

const DEFAULT_LOG_TAIL: usize = 100;
const MAX_LOG_TAIL: usize = 10_000;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct Accepted {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

/// A token that cancels itself after `timeout`, or when the returned guard
/// is dropped.
fn deadline(timeout: Duration) -> (CancellationToken, DropGuard) {
    let token = CancellationToken::new();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => {
                if !timer.is_cancelled() {
                    tracing::warn!("Background build exceeded {:?}, cancelling", timeout);
                    timer.cancel();
                }
            }
            _ = timer.cancelled() => {}
        }
    });
    let guard = token.clone().drop_guard();
    (token, guard)
}

/// Run a build detached from the request, bounded by the configured timeout.
pub(super) fn launch_build(state: Arc<AppState>, app_id: String) -> JoinHandle<EngineResult<App>> {
    tokio::spawn(async move {
        let (cancel, _guard) = deadline(state.config.build.timeout());
        let result = state.manager.build(&app_id, &cancel).await;
        if let Err(e) = &result {
            tracing::warn!(app_id = %app_id, "Background build failed: {}", e);
        }
        result
    })
}

fn launch_pull(state: Arc<AppState>, app_id: String) {
    tokio::spawn(async move {
        let (cancel, _guard) = deadline(state.config.build.timeout());
        match state.manager.pull_and_rebuild(&app_id, &cancel).await {
            Ok(app) => {
                tracing::info!(app_id = %app_id, status = %app.status, "Pull and rebuild finished")
            }
            Err(e) => tracing::warn!(app_id = %app_id, "Pull and rebuild failed: {}", e),
        }
    });
}

/// Build then start a freshly created app. Failures stay in the app status.
fn launch_first_deploy(state: Arc<AppState>, app_id: String) {
    tokio::spawn(async move {
        let (cancel, _guard) = deadline(state.config.build.timeout());
        if let Err(e) = state.manager.build(&app_id, &cancel).await {
            tracing::warn!(app_id = %app_id, "Initial build failed: {}", e);
            return;
        }
        if let Err(e) = state.manager.start(&app_id).await {
            tracing::warn!(app_id = %app_id, "Initial start failed: {}", e);
        }
    });
}

fn reject_if_building(state: &AppState) -> Result<(), ApiError> {
    if state.manager.builds().is_building() {
        return Err(EngineError::BuildInProgress.into());
    }
    Ok(())
}

/// GET /api/v1/apps
pub async fn list_apps(State(state): State<Arc<AppState>>) -> Result<Json<Vec<App>>, ApiError> {
    Ok(Json(state.manager.list().await?))
}

/// POST /api/v1/apps/clone
pub async fn clone_app(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CloneRequest>,
) -> Result<Json<CloneResult>, ApiError> {
    validate_clone_request(&req.repo_url, req.branch.as_deref())?;
    let result = state
        .manager
        .clone_and_validate(req.repo_url.trim(), req.branch.as_deref())
        .await?;
    Ok(Json(result))
}

/// POST /api/v1/apps
pub async fn create_app(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAppRequest>,
) -> Result<(StatusCode, Json<App>), ApiError> {
    validate_create_request(&req)?;
    let auto_start = req.auto_start;
    let app = state.manager.create(req).await?;

    if auto_start {
        launch_first_deploy(state.clone(), app.id.clone());
    }
    Ok((StatusCode::CREATED, Json(app)))
}

/// GET /api/v1/apps/:id
pub async fn get_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<AppResponse>, ApiError> {
    Ok(Json(state.manager.details(&id).await?))
}

/// PUT /api/v1/apps/:id
pub async fn update_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ConfigureAppRequest>,
) -> Result<Json<App>, ApiError> {
    validate_configure_request(&req)?;
    Ok(Json(state.manager.update(&id, req).await?))
}

/// DELETE /api/v1/apps/:id
pub async fn delete_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/apps/:id/build
pub async fn build_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    state.manager.get(&id).await?;
    reject_if_building(&state)?;
    drop(launch_build(state.clone(), id));
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            message: "Build started".to_string(),
        }),
    ))
}

/// POST /api/v1/apps/:id/build/cancel
pub async fn cancel_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.manager.cancel_build(&id),
    })
}

/// POST /api/v1/apps/:id/start
pub async fn start_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    Ok(Json(state.manager.start(&id).await?))
}

/// POST /api/v1/apps/:id/stop
pub async fn stop_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    Ok(Json(state.manager.stop(&id).await?))
}

/// POST /api/v1/apps/:id/restart
pub async fn restart_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<App>, ApiError> {
    Ok(Json(state.manager.restart(&id).await?))
}

/// POST /api/v1/apps/:id/pull
pub async fn pull_app(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    state.manager.get(&id).await?;
    reject_if_building(&state)?;
    launch_pull(state.clone(), id);
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            message: "Pull and rebuild started".to_string(),
        }),
    ))
}

/// GET /api/v1/apps/:id/check-update
pub async fn check_update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<UpdateCheckResult>, ApiError> {
    Ok(Json(state.manager.check_update(&id).await?))
}

/// GET /api/v1/apps/:id/logs?tail=N
pub async fn container_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogLine>>, ApiError> {
    let tail = query.tail.unwrap_or(DEFAULT_LOG_TAIL).clamp(1, MAX_LOG_TAIL);
    let lines = state.manager.container_logs(&id, tail).await?;
    Ok(Json(lines.collect().await))
}

/// GET /api/v1/apps/:id/build-logs
pub async fn build_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<String, ApiError> {
    state.manager.get(&id).await?;
    state
        .manager
        .builds()
        .read_log(&id)
        .await?
        .ok_or_else(|| ApiError::not_found("No build log for this app"))
}

/// DELETE /api/v1/apps/:id/logs
pub async fn clear_build_log(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.manager.get(&id).await?;
    state.manager.builds().clear_log(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
