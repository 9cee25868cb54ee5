//! App lifecycle orchestration.
//!
//! Every public operation holds the app's lock for its whole duration, so
//! operations on one app are linearizable. Composite operations (restart,
//! pull-and-rebuild) call the `*_locked` steps under a single acquisition.

use chrono::Utc;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use super::onboarding::{self, DEFAULT_INTERNAL_PORT};
use super::{
    format_duration, reconcile, BuildPipeline, BuildProgress, EngineError, EngineResult,
    PortAllocator, ProgressHub, ReconcileReport,
};
use crate::db::{
    short_commit, App, AppResponse, AppStatus, AppStore, CloneResult, ConfigureAppRequest,
    CreateAppRequest, UpdateCheckResult,
};
use crate::git::SourceControl;
use crate::runtime::{is_not_found, ContainerRuntime, LogLineStream, RunConfig};

const DEFAULT_BRANCH: &str = "main";

#[derive(Default)]
struct AppLocks {
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl AppLocks {
    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(key.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    fn forget(&self, key: &str) {
        self.locks.remove(key);
    }
}

pub struct AppManager {
    store: AppStore,
    runtime: Arc<dyn ContainerRuntime>,
    source: Arc<dyn SourceControl>,
    builds: Arc<BuildPipeline>,
    ports: Arc<PortAllocator>,
    progress: Arc<ProgressHub>,
    repos_dir: PathBuf,
    locks: AppLocks,
}

impl AppManager {
    pub fn new(
        store: AppStore,
        runtime: Arc<dyn ContainerRuntime>,
        source: Arc<dyn SourceControl>,
        builds: Arc<BuildPipeline>,
        ports: Arc<PortAllocator>,
        progress: Arc<ProgressHub>,
        repos_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            runtime,
            source,
            builds,
            ports,
            progress,
            repos_dir,
            locks: AppLocks::default(),
        }
    }

    pub fn builds(&self) -> &BuildPipeline {
        &self.builds
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    pub fn repo_path(&self, slug: &str) -> PathBuf {
        self.repos_dir.join(slug)
    }

    pub fn subscribe(&self, app_id: &str) -> broadcast::Receiver<BuildProgress> {
        self.progress.subscribe(app_id)
    }

    // --- queries ---

    pub async fn list(&self) -> EngineResult<Vec<App>> {
        Ok(self.store.list().await?)
    }

    pub async fn get(&self, id: &str) -> EngineResult<App> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| EngineError::AppNotFound(id.to_string()))
    }

    /// App with its container uptime when running.
    pub async fn details(&self, id: &str) -> EngineResult<AppResponse> {
        let app = self.get(id).await?;
        let uptime = self.uptime(&app).await;
        Ok(AppResponse { app, uptime })
    }

    async fn uptime(&self, app: &App) -> Option<String> {
        if !app.is_running() {
            return None;
        }
        let info = self.runtime.inspect(app.container()?).await.ok()?;
        let started = info.started_at?;
        Some(format_uptime(Utc::now() - started))
    }

    pub async fn check_update(&self, id: &str) -> EngineResult<UpdateCheckResult> {
        let _guard = self.locks.acquire(id).await;
        let app = self.get(id).await?;
        let repo = self.repo_path(&app.slug);

        let local = self
            .source
            .head_commit(&repo)
            .await
            .map_err(EngineError::SourceControl)?;
        let remote = self
            .source
            .remote_commit(&repo, &app.branch)
            .await
            .map_err(EngineError::SourceControl)?;

        Ok(UpdateCheckResult {
            local_commit: short_commit(&local),
            remote_commit: short_commit(&remote),
            has_update: local.trim() != remote.trim(),
        })
    }

    pub async fn container_logs(&self, id: &str, tail: usize) -> EngineResult<LogLineStream> {
        let container = self.live_container_id(id).await?;
        self.runtime
            .logs(&container, tail)
            .await
            .map_err(|e| runtime_error(e, &container))
    }

    pub async fn follow_container_logs(&self, id: &str) -> EngineResult<LogLineStream> {
        let container = self.live_container_id(id).await?;
        self.runtime
            .logs_stream(&container)
            .await
            .map_err(|e| runtime_error(e, &container))
    }

    async fn live_container_id(&self, id: &str) -> EngineResult<String> {
        let app = self.get(id).await?;
        if let Some(container) = app.container() {
            return Ok(container.to_string());
        }
        match self.runtime.find_by_name(&app.container_name).await {
            Ok(Some(info)) => Ok(info.id),
            Ok(None) => Err(EngineError::ContainerNotFound(app.container_name)),
            Err(e) => Err(EngineError::Runtime(e)),
        }
    }

    // --- onboarding ---

    /// Clone the repository and report what was found, without creating an app.
    pub async fn clone_and_validate(
        &self,
        repo_url: &str,
        branch: Option<&str>,
    ) -> EngineResult<CloneResult> {
        let (repo_name, slug) = parse_slug(repo_url)?;
        let _guard = self.locks.acquire(&slug_lock(&slug)).await;
        self.ensure_unique_slug(&slug).await?;

        let branch = branch.filter(|b| !b.is_empty()).unwrap_or(DEFAULT_BRANCH);
        let mut result = self.clone_tree(repo_url, branch, &slug, &repo_name).await?;
        result.suggested_port = self.ports.suggest().await?;
        Ok(result)
    }

    /// Clone, validate and persist a new app in `stopped`.
    pub async fn create(&self, req: CreateAppRequest) -> EngineResult<App> {
        let repo_url = req.repo_url.trim().to_string();
        let (repo_name, slug) = parse_slug(&repo_url)?;
        let _guard = self.locks.acquire(&slug_lock(&slug)).await;
        self.ensure_unique_slug(&slug).await?;

        let branch = req
            .branch
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BRANCH.to_string());
        let clone = self.clone_tree(&repo_url, &branch, &slug, &repo_name).await?;
        let repo = self.repo_path(&slug);

        let config = req.config;
        if let Some(dockerfile) = &config.dockerfile_path {
            if !repo.join(dockerfile).is_file() {
                self.discard_tree(&repo).await;
                return Err(EngineError::Validation(format!(
                    "Dockerfile not found at {}",
                    dockerfile
                )));
            }
        }

        let external_port = match self.assign_port(config.external_port).await {
            Ok(port) => port,
            Err(e) => {
                self.discard_tree(&repo).await;
                return Err(e);
            }
        };

        let commit = match self.source.head_commit(&repo).await {
            Ok(hash) => Some(short_commit(&hash)),
            Err(e) => {
                tracing::warn!(slug = %slug, "Could not read HEAD of new clone: {:#}", e);
                None
            }
        };

        let manifest = clone.manifest.unwrap_or_default();
        let mut env = manifest.env;
        env.extend(config.env.unwrap_or_default());

        let now = Utc::now();
        let app = App {
            id: uuid::Uuid::new_v4().to_string(),
            name: config.name.unwrap_or(clone.name),
            slug: slug.clone(),
            description: config.description.unwrap_or(clone.description),
            repo_url,
            branch,
            last_commit: commit,
            last_pulled: Some(now),
            dockerfile_path: config.dockerfile_path.unwrap_or(clone.dockerfile_path),
            build_context: config.build_context.unwrap_or_else(|| ".".to_string()),
            build_args: config.build_args.unwrap_or_default(),
            image_name: format!("{}:latest", slug),
            container_name: slug.clone(),
            internal_port: config
                .internal_port
                .or(manifest.default_port)
                .unwrap_or(DEFAULT_INTERNAL_PORT),
            external_port,
            restart_policy: config.restart_policy.unwrap_or_default(),
            env,
            volumes: config.volumes.unwrap_or(manifest.volumes),
            status: AppStatus::Stopped,
            container_id: None,
            last_build: None,
            last_build_duration: None,
            last_build_success: false,
            image_size: 0,
            created_at: now,
            updated_at: now,
        };

        let inserted = self.store.insert(&app).await;
        self.ports.release(external_port).await;
        if let Err(e) = inserted {
            self.discard_tree(&repo).await;
            return Err(e.into());
        }

        tracing::info!(app_id = %app.id, slug = %slug, port = external_port, "Created app");
        Ok(app)
    }

    /// Apply configuration changes. Takes effect on the next start.
    pub async fn update(&self, id: &str, config: ConfigureAppRequest) -> EngineResult<App> {
        let _guard = self.locks.acquire(id).await;
        let mut app = self.get(id).await?;

        let mut reserved = None;
        if let Some(port) = config.external_port {
            if port != app.external_port {
                let (start, end) = self.ports.range();
                if !self.ports.in_range(port) {
                    return Err(EngineError::Validation(format!(
                        "Port {} is outside the managed range {}-{}",
                        port, start, end
                    )));
                }
                if !self.ports.try_reserve(port, Some(&app.id)).await? {
                    return Err(EngineError::PortUnavailable(port));
                }
                app.external_port = port;
                reserved = Some(port);
            }
        }

        if let Some(name) = config.name {
            app.name = name;
        }
        if let Some(description) = config.description {
            app.description = description;
        }
        if let Some(port) = config.internal_port {
            app.internal_port = port;
        }
        if let Some(env) = config.env {
            app.env = env;
        }
        if let Some(args) = config.build_args {
            app.build_args = args;
        }
        if let Some(volumes) = config.volumes {
            app.volumes = volumes;
        }
        if let Some(policy) = config.restart_policy {
            app.restart_policy = policy;
        }
        if let Some(path) = config.dockerfile_path {
            app.dockerfile_path = path;
        }
        if let Some(context) = config.build_context {
            app.build_context = context;
        }

        let saved = self.save(&mut app).await;
        if let Some(port) = reserved {
            self.ports.release(port).await;
        }
        saved?;
        Ok(app)
    }

    // --- lifecycle ---

    pub async fn build(&self, id: &str, cancel: &CancellationToken) -> EngineResult<App> {
        let _guard = self.locks.acquire(id).await;
        self.build_locked(id, cancel).await
    }

    pub async fn start(&self, id: &str) -> EngineResult<App> {
        let _guard = self.locks.acquire(id).await;
        self.start_locked(id).await
    }

    pub async fn stop(&self, id: &str) -> EngineResult<App> {
        let _guard = self.locks.acquire(id).await;
        self.stop_locked(id).await
    }

    pub async fn restart(&self, id: &str) -> EngineResult<App> {
        let _guard = self.locks.acquire(id).await;
        if let Err(e) = self.stop_locked(id).await {
            if matches!(e, EngineError::AppNotFound(_)) {
                return Err(e);
            }
            tracing::warn!(app_id = %id, "Stop before restart failed: {}", e);
        }
        self.start_locked(id).await
    }

    /// Pull the branch tip and rebuild; restart afterwards only if the app
    /// was running. A pull or build failure ends the chain.
    pub async fn pull_and_rebuild(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<App> {
        let _guard = self.locks.acquire(id).await;
        if self.builds.is_building() {
            return Err(EngineError::BuildInProgress);
        }

        let was_running = self.get(id).await?.is_running();
        if was_running {
            self.stop_locked(id).await?;
        }

        let mut app = self.get(id).await?;
        let repo = self.repo_path(&app.slug);
        let commit = self
            .source
            .pull(&repo, &app.branch)
            .await
            .map_err(EngineError::SourceControl)?;

        app.last_commit = Some(short_commit(&commit));
        app.last_pulled = Some(Utc::now());
        self.save(&mut app).await?;
        tracing::info!(app_id = %id, commit = %short_commit(&commit), "Pulled latest source");

        let app = self.build_locked(id, cancel).await?;
        if was_running {
            self.start_locked(id).await
        } else {
            Ok(app)
        }
    }

    /// Tear down the container, image, working tree and build log, then
    /// delete the record. Only the record deletion can fail the call.
    pub async fn delete(&self, id: &str) -> EngineResult<()> {
        if self.builds.cancel_app(id) {
            tracing::info!(app_id = %id, "Cancelled in-flight build of deleted app");
        }
        let guard = self.locks.acquire(id).await;
        let app = self.get(id).await?;

        if let Some(container) = app.container() {
            self.discard_container(container).await;
        }
        match self.runtime.find_by_name(&app.container_name).await {
            Ok(Some(info)) => self.discard_container(&info.id).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(app_id = %id, "Container lookup failed: {:#}", e),
        }
        if let Err(e) = self.runtime.remove_image(&app.image_name).await {
            tracing::debug!(app_id = %id, "Image removal skipped: {:#}", e);
        }
        self.discard_tree(&self.repo_path(&app.slug)).await;
        if let Err(e) = self.builds.clear_log(id).await {
            tracing::warn!(app_id = %id, "Failed to remove build log: {}", e);
        }

        if !self.store.delete(id).await? {
            return Err(EngineError::AppNotFound(id.to_string()));
        }

        self.progress.remove(id);
        drop(guard);
        self.locks.forget(id);
        tracing::info!(app_id = %id, slug = %app.slug, "Deleted app");
        Ok(())
    }

    pub fn cancel_build(&self, id: &str) -> bool {
        self.builds.cancel_app(id)
    }

    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        reconcile(&self.store, self.runtime.as_ref()).await
    }

    // --- steps run under the app lock ---

    async fn build_locked(&self, id: &str, cancel: &CancellationToken) -> EngineResult<App> {
        let mut app = self.get(id).await?;
        // Claim the slot first so a rejected build changes nothing.
        let ticket = self.builds.try_begin(&app.id, cancel)?;

        // A container left running would contradict the stopped outcome.
        if app.is_running() {
            if let Err(e) = self.stop_container(&app).await {
                drop(ticket);
                return Err(self.fail(&mut app, AppStatus::Error, e).await);
            }
        }

        app.status = AppStatus::Building;
        self.save(&mut app).await?;

        let repo = self.repo_path(&app.slug);
        let started_at = Utc::now();
        let started = Instant::now();
        let result = self
            .builds
            .run(ticket, &app, &repo, Some(self.progress.sender(&app.id)))
            .await;

        app.last_build = Some(started_at);
        match result {
            Ok(report) => {
                app.status = AppStatus::Stopped;
                app.last_build_success = true;
                app.last_build_duration = Some(report.duration());
                app.image_size = match self.runtime.image_size(&app.image_name).await {
                    Ok(size) => size,
                    Err(e) => {
                        tracing::warn!(app_id = %id, "Could not read image size: {:#}", e);
                        app.image_size
                    }
                };
                self.save(&mut app).await?;
                Ok(app)
            }
            Err(e) => {
                app.last_build_success = false;
                app.last_build_duration = Some(format_duration(started.elapsed()));
                Err(self.fail(&mut app, AppStatus::BuildFailed, e).await)
            }
        }
    }

    async fn start_locked(&self, id: &str) -> EngineResult<App> {
        let mut app = self.get(id).await?;
        match self.launch(&mut app).await {
            Ok(()) => {
                app.status = AppStatus::Running;
                self.save(&mut app).await?;
                tracing::info!(app_id = %id, port = app.external_port, "App running");
                Ok(app)
            }
            Err(e) => Err(self.fail(&mut app, AppStatus::Error, e).await),
        }
    }

    async fn launch(&self, app: &mut App) -> EngineResult<()> {
        // Orphans under our name would block the create.
        match self.runtime.find_by_name(&app.container_name).await {
            Ok(Some(existing)) => self.discard_container(&existing.id).await,
            Ok(None) => {}
            Err(e) => return Err(EngineError::Runtime(e)),
        }
        if let Some(stale) = app.container().map(str::to_string) {
            self.discard_container(&stale).await;
        }
        app.container_id = None;

        if !self
            .ports
            .is_available(app.external_port, Some(&app.id))
            .await?
        {
            let port = self
                .ports
                .find_next_available(app.external_port, Some(&app.id))
                .await?;
            tracing::warn!(
                app_id = %app.id,
                old_port = app.external_port,
                new_port = port,
                "Port no longer available, reassigning"
            );
            app.external_port = port;
            let saved = self.save(app).await;
            self.ports.release(port).await;
            saved?;
        }

        let config = RunConfig {
            image: app.image_name.clone(),
            name: app.container_name.clone(),
            internal_port: app.internal_port,
            external_port: app.external_port,
            env: app.env.clone(),
            binds: app.volumes.clone(),
            restart_policy: app.restart_policy,
        };
        let container = self
            .runtime
            .create(&config)
            .await
            .map_err(EngineError::Runtime)?;

        app.container_id = Some(container.clone());
        app.status = AppStatus::Starting;
        self.save(app).await?;

        self.runtime
            .start(&container)
            .await
            .map_err(|e| runtime_error(e, &container))
    }

    async fn stop_locked(&self, id: &str) -> EngineResult<App> {
        let mut app = self.get(id).await?;
        match self.stop_container(&app).await {
            Ok(()) => {
                app.status = AppStatus::Stopped;
                self.save(&mut app).await?;
                Ok(app)
            }
            Err(e) => Err(self.fail(&mut app, AppStatus::Error, e).await),
        }
    }

    /// Stop by recorded id, falling back to a lookup by name. A container
    /// that does not exist counts as stopped.
    async fn stop_container(&self, app: &App) -> EngineResult<()> {
        if let Some(container) = app.container() {
            match self.runtime.stop(container).await {
                Ok(()) => return Ok(()),
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    tracing::debug!(app_id = %app.id, "Stop by id failed: {:#}", e);
                }
            }
        }

        let found = self
            .runtime
            .find_by_name(&app.container_name)
            .await
            .map_err(EngineError::Runtime)?;
        match found {
            None => Ok(()),
            Some(info) => match self.runtime.stop(&info.id).await {
                Ok(()) => Ok(()),
                Err(e) if is_not_found(&e) => Ok(()),
                Err(e) => Err(EngineError::Runtime(e)),
            },
        }
    }

    // --- helpers ---

    async fn save(&self, app: &mut App) -> EngineResult<()> {
        app.updated_at = Utc::now();
        match self.store.update(app).await {
            Ok(()) => Ok(()),
            Err(sqlx::Error::RowNotFound) => Err(EngineError::AppNotFound(app.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist `status` for a failed step and hand the error back.
    async fn fail(&self, app: &mut App, status: AppStatus, err: EngineError) -> EngineError {
        app.status = status;
        if let Err(save_err) = self.save(app).await {
            tracing::error!(app_id = %app.id, "Failed to record {} status: {}", status, save_err);
        }
        tracing::warn!(app_id = %app.id, status = %status, "Operation failed: {}", err);
        err
    }

    async fn ensure_unique_slug(&self, slug: &str) -> EngineResult<()> {
        if self.store.get_by_slug(slug).await?.is_some() {
            return Err(EngineError::DuplicateSlug(slug.to_string()));
        }
        Ok(())
    }

    async fn clone_tree(
        &self,
        repo_url: &str,
        branch: &str,
        slug: &str,
        repo_name: &str,
    ) -> EngineResult<CloneResult> {
        let dest = self.repo_path(slug);
        tracing::info!(slug = %slug, branch = %branch, "Cloning {}", repo_url);
        self.source
            .clone_repo(repo_url, branch, &dest)
            .await
            .map_err(EngineError::SourceControl)?;

        let Some(dockerfile_path) = onboarding::detect_dockerfile(&dest) else {
            self.discard_tree(&dest).await;
            return Err(EngineError::Validation(
                "no Dockerfile found in repository".to_string(),
            ));
        };

        let manifest = onboarding::read_manifest(&dest);
        let name = manifest
            .as_ref()
            .and_then(|m| m.name.clone())
            .unwrap_or_else(|| repo_name.to_string());
        let description = manifest
            .as_ref()
            .and_then(|m| m.description.clone())
            .unwrap_or_default();

        Ok(CloneResult {
            slug: slug.to_string(),
            name,
            description,
            dockerfile_path,
            suggested_port: 0,
            manifest,
        })
    }

    async fn assign_port(&self, requested: Option<u16>) -> EngineResult<u16> {
        if let Some(port) = requested {
            if self.ports.try_reserve(port, None).await? {
                return Ok(port);
            }
            tracing::info!(port, "Requested port unavailable, allocating another");
        }
        self.ports.allocate(None).await
    }

    async fn discard_container(&self, container: &str) {
        if let Err(e) = self.runtime.stop(container).await {
            if !is_not_found(&e) {
                tracing::debug!(container_id = %container, "Stop failed: {:#}", e);
            }
        }
        if let Err(e) = self.runtime.remove(container).await {
            if !is_not_found(&e) {
                tracing::warn!(container_id = %container, "Remove failed: {:#}", e);
            }
        }
    }

    async fn discard_tree(&self, path: &std::path::Path) {
        if let Err(e) = self.source.remove_tree(path).await {
            tracing::warn!("Failed to remove {}: {:#}", path.display(), e);
        }
    }
}

fn slug_lock(slug: &str) -> String {
    format!("slug:{}", slug)
}

fn parse_slug(repo_url: &str) -> EngineResult<(String, String)> {
    let repo = onboarding::parse_repo_url(repo_url)
        .ok_or_else(|| EngineError::Validation(format!("Invalid repository URL: {}", repo_url)))?;
    let slug = repo.slug().ok_or_else(|| {
        EngineError::Validation(format!("Cannot derive an app name from {}", repo_url))
    })?;
    Ok((repo.name, slug))
}

fn runtime_error(err: anyhow::Error, container: &str) -> EngineError {
    if is_not_found(&err) {
        EngineError::ContainerNotFound(container.to_string())
    } else {
        EngineError::Runtime(err)
    }
}

/// `Xd Yh`, `Xh Ym` or `Xm`.
pub fn format_uptime(uptime: chrono::Duration) -> String {
    let minutes = uptime.num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);
    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_app, BuildBehavior, Harness};
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::net::TcpListener;
    use std::time::Duration;

    fn create_request(url: &str) -> CreateAppRequest {
        CreateAppRequest {
            repo_url: url.to_string(),
            branch: None,
            config: ConfigureAppRequest::default(),
            auto_start: false,
        }
    }

    async fn running_app(h: &Harness, id: &str, slug: &str, port: u16) -> App {
        h.seed(&sample_app(id, slug, port)).await;
        h.manager
            .build(id, &CancellationToken::new())
            .await
            .unwrap();
        h.manager.start(id).await.unwrap()
    }

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(chrono::Duration::seconds(30)), "0m");
        assert_eq!(format_uptime(chrono::Duration::minutes(42)), "42m");
        assert_eq!(format_uptime(chrono::Duration::minutes(125)), "2h 5m");
        assert_eq!(format_uptime(chrono::Duration::hours(50)), "2d 2h");
    }

    #[tokio::test]
    async fn test_create_applies_defaults_and_manifest() {
        let h = Harness::new(42001, 42003).await;
        h.source.set_manifest(
            r#"{"name":"Notes","defaultPort":8080,"env":{"MODE":"prod","LEVEL":"info"}}"#,
        );

        let mut req = create_request("https://github.com/someone/Notes-Server.git");
        req.config.env = Some(HashMap::from([("LEVEL".to_string(), "debug".to_string())]));
        let app = h.manager.create(req).await.unwrap();

        assert_eq!(app.slug, "notes-server");
        assert_eq!(app.name, "Notes");
        assert_eq!(app.branch, "main");
        assert_eq!(app.internal_port, 8080);
        assert_eq!(app.external_port, 42001);
        assert_eq!(app.image_name, "notes-server:latest");
        assert_eq!(app.container_name, "notes-server");
        assert_eq!(app.dockerfile_path, "./Dockerfile");
        assert_eq!(app.status, AppStatus::Stopped);
        assert_eq!(app.last_commit.as_deref(), Some("11111111"));
        assert_eq!(app.env.get("MODE").map(String::as_str), Some("prod"));
        assert_eq!(app.env.get("LEVEL").map(String::as_str), Some("debug"));
        assert!(h.manager.repo_path("notes-server").join("Dockerfile").is_file());

        let second = h
            .manager
            .create(create_request("https://github.com/someone/other"))
            .await
            .unwrap();
        assert_eq!(second.external_port, 42002);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_slug_before_cloning() {
        let h = Harness::new(42011, 42013).await;
        let first = h
            .manager
            .create(create_request("https://github.com/a/blog"))
            .await
            .unwrap();
        assert_eq!(first.internal_port, DEFAULT_INTERNAL_PORT);
        assert_eq!(first.restart_policy, crate::db::RestartPolicy::UnlessStopped);

        let err = h
            .manager
            .create(create_request("https://github.com/b/Blog.git"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateSlug(ref s) if s == "blog"));
        assert_eq!(h.source.clones(), 1);
        assert_eq!(h.manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_without_dockerfile_removes_clone() {
        let h = Harness::new(42021, 42022).await;
        h.source.set_with_dockerfile(false);

        let err = h
            .manager
            .create(create_request("https://github.com/a/docs"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(ref m) if m.contains("no Dockerfile")));
        assert!(!h.manager.repo_path("docs").exists());
        assert!(h.manager.list().await.unwrap().is_empty());

        let err = h
            .manager
            .create(create_request("not a repository"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }


    #[tokio::test]
    async fn test_create_clone_failure_writes_nothing() {
        let h = Harness::new(42251, 42252).await;
        h.source.set_fail_clone(true);

        let err = h
            .manager
            .create(create_request("https://github.com/a/ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceControl(_)));
        assert!(h.manager.list().await.unwrap().is_empty());
        assert!(!h.manager.repo_path("ghost").exists());
        assert!(h.manager.ports().used_ports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_honours_requested_port() {
        let h = Harness::new(42031, 42033).await;
        let mut req = create_request("https://github.com/a/api");
        req.config.external_port = Some(42033);
        assert_eq!(h.manager.create(req).await.unwrap().external_port, 42033);

        // Taken or out of range falls back to allocation
        let mut req = create_request("https://github.com/a/web");
        req.config.external_port = Some(42033);
        assert_eq!(h.manager.create(req).await.unwrap().external_port, 42031);
    }

    #[tokio::test]
    async fn test_clone_preview_does_not_reserve_or_persist() {
        let h = Harness::new(42041, 42042).await;
        h.source.set_manifest(r#"{"description":"A wiki"}"#);

        let preview = h
            .manager
            .clone_and_validate("git@github.com:a/wiki.git", None)
            .await
            .unwrap();
        assert_eq!(preview.slug, "wiki");
        assert_eq!(preview.name, "wiki");
        assert_eq!(preview.description, "A wiki");
        assert_eq!(preview.suggested_port, 42041);
        assert!(h.manager.list().await.unwrap().is_empty());

        let app = h
            .manager
            .create(create_request("git@github.com:a/wiki.git"))
            .await
            .unwrap();
        assert_eq!(app.external_port, 42041);
    }

    #[tokio::test]
    async fn test_update_validates_port_changes() {
        let h = Harness::new(42051, 42053).await;
        h.seed(&sample_app("a1", "one", 42051)).await;
        h.seed(&sample_app("a2", "two", 42052)).await;

        let cfg = |port| ConfigureAppRequest {
            external_port: Some(port),
            ..Default::default()
        };
        assert!(matches!(
            h.manager.update("a1", cfg(80)).await,
            Err(EngineError::Validation(_))
        ));
        assert!(matches!(
            h.manager.update("a1", cfg(42052)).await,
            Err(EngineError::PortUnavailable(42052))
        ));

        let app = h
            .manager
            .update(
                "a1",
                ConfigureAppRequest {
                    external_port: Some(42053),
                    name: Some("Renamed".into()),
                    volumes: Some(vec!["/srv/one:/data".into()]),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(app.external_port, 42053);
        assert_eq!(app.name, "Renamed");
        assert_eq!(h.app("a1").await.volumes, vec!["/srv/one:/data".to_string()]);

        // Keeping its own port is not a conflict
        assert!(h.manager.update("a1", cfg(42053)).await.is_ok());
        assert!(matches!(
            h.manager.update("missing", cfg(42053)).await,
            Err(EngineError::AppNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_build_success_records_metadata() {
        let h = Harness::new(42061, 42062).await;
        h.seed(&sample_app("a1", "one", 42061)).await;

        let app = h.manager.build("a1", &CancellationToken::new()).await.unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
        assert!(app.last_build_success);
        assert!(app.last_build.is_some());
        assert!(app.last_build_duration.is_some());
        assert_eq!(app.image_size, 4096);
        assert_eq!(h.app("a1").await.status, AppStatus::Stopped);
    }

    #[tokio::test]
    async fn test_failed_build_sets_build_failed() {
        let h = Harness::new(42071, 42072).await;
        h.seed(&sample_app("a1", "one", 42071)).await;
        h.runtime
            .set_build_behavior(BuildBehavior::Fail("COPY failed".into()));

        let err = h
            .manager
            .build("a1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));

        let app = h.app("a1").await;
        assert_eq!(app.status, AppStatus::BuildFailed);
        assert!(!app.last_build_success);
        assert!(app.last_build.is_some());
    }

    #[tokio::test]
    async fn test_rebuild_of_running_app_lands_stopped() {
        let h = Harness::new(42081, 42082).await;
        let running = running_app(&h, "a1", "one", 42081).await;
        assert_eq!(running.status, AppStatus::Running);

        let app = h.manager.build("a1", &CancellationToken::new()).await.unwrap();
        assert_eq!(app.status, AppStatus::Stopped);

        let container = h.runtime.container(running.container().unwrap()).unwrap();
        assert!(!container.running);
    }


    #[tokio::test]
    async fn test_build_aborts_when_running_container_cannot_stop() {
        let h = Harness::new(42261, 42262).await;
        let before = running_app(&h, "a1", "one", 42261).await;
        h.runtime.set_fail_stop(true);

        let err = h
            .manager
            .build("a1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));

        let app = h.app("a1").await;
        assert_eq!(app.status, AppStatus::Error);
        assert!(h.runtime.container(before.container().unwrap()).unwrap().running);
        assert_eq!(h.runtime.built_images().len(), 1);
        assert!(!h.manager.builds().is_building());
    }

    #[tokio::test]
    async fn test_concurrent_builds_are_rejected_without_side_effects() {
        let h = Harness::new(42091, 42092).await;
        h.seed(&sample_app("a1", "one", 42091)).await;
        h.seed(&sample_app("a2", "two", 42092)).await;
        h.runtime.set_build_behavior(BuildBehavior::Block);

        let first = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.build("a1", &CancellationToken::new()).await }
        });
        h.runtime.wait_for_build_start().await;
        assert_eq!(h.app("a1").await.status, AppStatus::Building);

        let err = h
            .manager
            .build("a2", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BuildInProgress));
        assert_eq!(h.app("a2").await.status, AppStatus::Stopped);

        h.runtime.release_builds();
        first.await.unwrap().unwrap();

        h.runtime.set_build_behavior(BuildBehavior::Succeed);
        h.manager
            .build("a2", &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_container_is_idempotent() {
        let h = Harness::new(42101, 42102).await;
        let mut app = sample_app("a1", "one", 42101);
        app.status = AppStatus::Error;
        h.seed(&app).await;

        let app = h.manager.stop("a1").await.unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
        let app = h.manager.stop("a1").await.unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stop_falls_back_to_container_name() {
        let h = Harness::new(42111, 42112).await;
        let mut app = sample_app("a1", "one", 42111);
        app.status = AppStatus::Running;
        app.container_id = Some("stale".into());
        h.seed(&app).await;
        let live = h.runtime.add_container("one", true);

        assert_eq!(h.manager.stop("a1").await.unwrap().status, AppStatus::Stopped);
        assert!(!h.runtime.container(&live).unwrap().running);
    }

    #[tokio::test]
    async fn test_stop_failure_is_recorded() {
        let h = Harness::new(42121, 42122).await;
        running_app(&h, "a1", "one", 42121).await;
        h.runtime.set_fail_stop(true);

        let err = h.manager.stop("a1").await.unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));
        assert_eq!(h.app("a1").await.status, AppStatus::Error);
    }


    #[tokio::test]
    async fn test_stop_after_container_vanished() {
        let h = Harness::new(42271, 42272).await;
        let before = running_app(&h, "a1", "one", 42271).await;
        h.runtime.remove_container_externally(before.container().unwrap());

        let app = h.manager.stop("a1").await.unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
        assert!(h.runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_start_reassigns_occupied_port() {
        let h = Harness::new(42131, 42133).await;
        h.seed(&sample_app("a1", "one", 42131)).await;
        let _squatter = TcpListener::bind(("127.0.0.1", 42131)).unwrap();

        let app = h.manager.start("a1").await.unwrap();
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.external_port, 42132);
        assert_eq!(h.app("a1").await.external_port, 42132);

        let container = h.runtime.container(app.container().unwrap()).unwrap();
        assert_eq!(container.config.external_port, 42132);
        assert!(container.running);
    }

    #[tokio::test]
    async fn test_start_replaces_orphaned_container() {
        let h = Harness::new(42141, 42142).await;
        h.seed(&sample_app("a1", "one", 42141)).await;
        let orphan = h.runtime.add_container("one", true);

        let app = h.manager.start("a1").await.unwrap();
        assert!(h.runtime.container(&orphan).is_none());
        assert_ne!(app.container().unwrap(), orphan);
        assert_eq!(h.runtime.containers().len(), 1);
    }

    #[tokio::test]
    async fn test_start_failures_set_error() {
        let h = Harness::new(42151, 42152).await;
        h.seed(&sample_app("a1", "one", 42151)).await;

        h.runtime.set_fail_create(true);
        assert!(h.manager.start("a1").await.is_err());
        let app = h.app("a1").await;
        assert_eq!(app.status, AppStatus::Error);
        assert!(app.container_id.is_none());

        h.runtime.set_fail_create(false);
        h.runtime.set_fail_start(true);
        assert!(h.manager.start("a1").await.is_err());
        let app = h.app("a1").await;
        assert_eq!(app.status, AppStatus::Error);
        assert!(app.container_id.is_some());
    }

    #[tokio::test]
    async fn test_restart_ignores_stop_failure() {
        let h = Harness::new(42161, 42162).await;
        let before = running_app(&h, "a1", "one", 42161).await;
        h.runtime.set_fail_stop(true);

        let app = h.manager.restart("a1").await.unwrap();
        assert_eq!(app.status, AppStatus::Running);
        assert_ne!(app.container_id, before.container_id);
    }

    #[tokio::test]
    async fn test_pull_failure_stops_without_restart() {
        let h = Harness::new(42171, 42172).await;
        let before = running_app(&h, "a1", "one", 42171).await;
        h.source.set_fail_pull(true);

        let err = h
            .manager
            .pull_and_rebuild("a1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SourceControl(_)));

        let app = h.app("a1").await;
        assert_eq!(app.status, AppStatus::Stopped);
        assert!(!h.runtime.container(before.container().unwrap()).unwrap().running);
        assert_eq!(h.runtime.built_images().len(), 1);
    }


    #[tokio::test]
    async fn test_pull_aborts_when_running_container_cannot_stop() {
        let h = Harness::new(42281, 42282).await;
        let before = running_app(&h, "a1", "one", 42281).await;
        h.runtime.set_fail_stop(true);
        h.source.set_remote("3333333333333333333333333333333333333333");

        let err = h
            .manager
            .pull_and_rebuild("a1", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Runtime(_)));

        let app = h.app("a1").await;
        assert_eq!(app.status, AppStatus::Error);
        assert_ne!(app.last_commit.as_deref(), Some("33333333"));
        assert!(h.runtime.container(before.container().unwrap()).unwrap().running);
        assert_eq!(h.runtime.built_images().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_and_rebuild_restarts_running_app() {
        let h = Harness::new(42181, 42182).await;
        running_app(&h, "a1", "one", 42181).await;
        h.source.set_remote("2222222222222222222222222222222222222222");

        let app = h
            .manager
            .pull_and_rebuild("a1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(app.status, AppStatus::Running);
        assert_eq!(app.last_commit.as_deref(), Some("22222222"));
        assert!(app.last_pulled.is_some());
        assert_eq!(h.runtime.built_images().len(), 2);
    }

    #[tokio::test]
    async fn test_pull_and_rebuild_of_stopped_app_stays_stopped() {
        let h = Harness::new(42191, 42192).await;
        h.seed(&sample_app("a1", "one", 42191)).await;

        let app = h
            .manager
            .pull_and_rebuild("a1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(app.status, AppStatus::Stopped);
        assert!(h.runtime.containers().is_empty());
    }

    #[tokio::test]
    async fn test_check_update_compares_short_hashes() {
        let h = Harness::new(42201, 42202).await;
        h.seed(&sample_app("a1", "one", 42201)).await;

        let same = h.manager.check_update("a1").await.unwrap();
        assert!(!same.has_update);
        assert_eq!(same.local_commit, "11111111");

        h.source.set_remote("abcdef0123456789abcdef0123456789abcdef01");
        let diff = h.manager.check_update("a1").await.unwrap();
        assert!(diff.has_update);
        assert_eq!(diff.remote_commit, "abcdef01");

        h.source.set_fail_pull(true);
        assert!(matches!(
            h.manager.check_update("a1").await,
            Err(EngineError::SourceControl(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_tears_down_everything() {
        let h = Harness::new(42211, 42212).await;
        let app = running_app(&h, "a1", "one", 42211).await;
        let log = h.manager.builds().log_path("a1");
        assert!(log.exists());

        h.manager.delete("a1").await.unwrap();

        assert!(h.runtime.container(app.container().unwrap()).is_none());
        assert_eq!(h.runtime.removed_images(), vec!["one:latest".to_string()]);
        assert!(!h.manager.repo_path("one").exists());
        assert!(!log.exists());
        assert!(h.store.get("a1").await.unwrap().is_none());

        assert!(matches!(
            h.manager.delete("a1").await,
            Err(EngineError::AppNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_cancels_in_flight_build() {
        let h = Harness::new(42221, 42222).await;
        h.seed(&sample_app("a1", "one", 42221)).await;
        h.runtime.set_build_behavior(BuildBehavior::Block);

        let build = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.build("a1", &CancellationToken::new()).await }
        });
        h.runtime.wait_for_build_start().await;

        h.manager.delete("a1").await.unwrap();
        assert!(build.await.unwrap().is_err());
        assert!(h.store.get("a1").await.unwrap().is_none());
        assert!(!h.manager.builds().is_building());
    }

    #[tokio::test]
    async fn test_operations_on_one_app_are_serialized() {
        let h = Harness::new(42231, 42232).await;
        h.seed(&sample_app("a1", "one", 42231)).await;
        h.runtime.set_build_behavior(BuildBehavior::Block);

        let build = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.build("a1", &CancellationToken::new()).await }
        });
        h.runtime.wait_for_build_start().await;

        let stop = tokio::spawn({
            let manager = h.manager.clone();
            async move { manager.stop("a1").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stop.is_finished());
        assert_eq!(h.app("a1").await.status, AppStatus::Building);

        h.runtime.release_builds();
        build.await.unwrap().unwrap();
        assert_eq!(stop.await.unwrap().unwrap().status, AppStatus::Stopped);
    }

    #[tokio::test]
    async fn test_details_and_container_logs() {
        let h = Harness::new(42241, 42242).await;
        h.seed(&sample_app("a2", "idle", 42242)).await;
        running_app(&h, "a1", "one", 42241).await;

        let details = h.manager.details("a1").await.unwrap();
        assert_eq!(details.uptime.as_deref(), Some("1h 30m"));
        assert!(h.manager.details("a2").await.unwrap().uptime.is_none());

        let lines: Vec<_> = h
            .manager
            .container_logs("a1", 100)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "one listening");

        assert!(matches!(
            h.manager.container_logs("a2", 100).await,
            Err(EngineError::ContainerNotFound(_))
        ));
    }
}
