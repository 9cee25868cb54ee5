mod apps;
pub mod auth;
pub mod error;
mod system;
pub mod validation;
mod ws;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Auth routes (public)
    let auth_routes = Router::new()
        .route("/login", post(auth::login))
        .route("/logout", post(auth::logout))
        .route("/check", get(auth::check));

    // Protected API routes. WebSocket clients authenticate with `?token=`.
    let api_routes = Router::new()
        .route("/auth/password", put(auth::change_password))
        // Apps
        .route("/apps", get(apps::list_apps))
        .route("/apps", post(apps::create_app))
        .route("/apps/clone", post(apps::clone_app))
        .route("/apps/:id", get(apps::get_app))
        .route("/apps/:id", put(apps::update_app))
        .route("/apps/:id", delete(apps::delete_app))
        // Lifecycle
        .route("/apps/:id/build", post(apps::build_app))
        .route("/apps/:id/build/cancel", post(apps::cancel_build))
        .route("/apps/:id/build/stream", get(ws::build_stream_ws))
        .route("/apps/:id/start", post(apps::start_app))
        .route("/apps/:id/stop", post(apps::stop_app))
        .route("/apps/:id/restart", post(apps::restart_app))
        .route("/apps/:id/pull", post(apps::pull_app))
        .route("/apps/:id/check-update", get(apps::check_update))
        // Logs
        .route("/apps/:id/logs", get(apps::container_logs))
        .route("/apps/:id/logs", delete(apps::clear_build_log))
        .route("/apps/:id/logs/stream", get(ws::container_logs_ws))
        .route("/apps/:id/build-logs", get(apps::build_logs))
        // System
        .route("/system/info", get(system::system_info))
        .route("/system/storage", get(system::storage))
        .route("/system/ports", get(system::ports))
        .route("/system/prune", post(system::prune_images))
        .route("/system/logs", delete(system::clear_logs))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let v1 = Router::new()
        .route("/health", get(health_check))
        .nest("/auth", auth_routes)
        .merge(api_routes);

    Router::new()
        .nest("/api/v1", v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
