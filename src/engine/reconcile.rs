use chrono::Utc;
use serde::Serialize;

use super::EngineResult;
use crate::db::{App, AppStatus, AppStore};
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub corrected: usize,
    pub failed: usize,
}

/// Bring every persisted app in line with what the container runtime
/// reports. The runtime is treated as authoritative.
pub async fn reconcile(
    store: &AppStore,
    runtime: &dyn ContainerRuntime,
) -> EngineResult<ReconcileReport> {
    let apps = store.list().await?;
    let mut report = ReconcileReport::default();

    for mut app in apps {
        report.checked += 1;
        let before = (app.status, app.container_id.clone());

        observe(&mut app, runtime).await;

        let changed = before != (app.status, app.container_id.clone());
        if changed {
            app.updated_at = Utc::now();
            report.corrected += 1;
            tracing::info!(
                app_id = %app.id,
                slug = %app.slug,
                from = %before.0,
                to = %app.status,
                "Reconciled app status"
            );
        }

        if let Err(e) = store.update(&app).await {
            report.failed += 1;
            tracing::error!(app_id = %app.id, "Failed to persist reconciled state: {}", e);
        }
    }

    tracing::info!(
        checked = report.checked,
        corrected = report.corrected,
        failed = report.failed,
        "Reconciliation complete"
    );
    Ok(report)
}

async fn observe(app: &mut App, runtime: &dyn ContainerRuntime) {
    if app.container().is_none() && !app.container_name.is_empty() {
        match runtime.find_by_name(&app.container_name).await {
            Ok(Some(found)) => {
                tracing::info!(app_id = %app.id, container_id = %found.id, "Adopted container by name");
                app.container_id = Some(found.id);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(app_id = %app.id, "Container lookup failed: {:#}", e);
            }
        }
    }

    let Some(container) = app.container().map(str::to_string) else {
        app.container_id = None;
        if matches!(app.status, AppStatus::Running | AppStatus::Starting) {
            app.status = AppStatus::Stopped;
        }
        return;
    };

    match runtime.inspect(&container).await {
        Ok(info) => {
            app.status = if info.running {
                AppStatus::Running
            } else {
                AppStatus::Stopped
            };
        }
        Err(e) => {
            tracing::debug!(app_id = %app.id, container_id = %container, "Container gone: {:#}", e);
            app.container_id = None;
            app.status = AppStatus::Stopped;
        }
    }
}
