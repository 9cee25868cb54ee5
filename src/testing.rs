//! In-memory collaborators and fixtures shared by unit tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::PortsConfig;
use crate::db::{init_memory, App, AppStatus, AppStore, DbPool, RestartPolicy};
use crate::engine::{AppManager, BuildPipeline, LogSink, PortAllocator, ProgressHub};
use crate::git::SourceControl;
use crate::runtime::{
    BuildContext, ContainerInfo, ContainerNotFound, ContainerRuntime, LogLine, LogLineStream,
    LogStream, RunConfig, RuntimeInfo,
};

pub fn sample_app(id: &str, slug: &str, port: u16) -> App {
    let now = Utc::now();
    App {
        id: id.to_string(),
        name: slug.to_string(),
        slug: slug.to_string(),
        description: String::new(),
        repo_url: format!("https://github.com/owner/{}", slug),
        branch: "main".to_string(),
        last_commit: None,
        last_pulled: None,
        dockerfile_path: "./Dockerfile".to_string(),
        build_context: ".".to_string(),
        build_args: HashMap::new(),
        image_name: format!("{}:latest", slug),
        container_name: slug.to_string(),
        internal_port: 80,
        external_port: port,
        restart_policy: RestartPolicy::UnlessStopped,
        env: HashMap::new(),
        volumes: Vec::new(),
        status: AppStatus::Stopped,
        container_id: None,
        last_build: None,
        last_build_duration: None,
        last_build_success: false,
        image_size: 0,
        created_at: now,
        updated_at: now,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildBehavior {
    Succeed,
    Fail(String),
    /// Wait for `release_builds` or cancellation.
    Block,
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub config: RunConfig,
    pub running: bool,
}

struct RuntimeState {
    next_id: u32,
    build_behavior: BuildBehavior,
    built: Vec<String>,
    containers: HashMap<String, FakeContainer>,
    removed_images: Vec<String>,
    fail_create: bool,
    fail_start: bool,
    fail_stop: bool,
}

pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    build_started: Notify,
    build_release: Notify,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState {
                next_id: 0,
                build_behavior: BuildBehavior::Succeed,
                built: Vec::new(),
                containers: HashMap::new(),
                removed_images: Vec::new(),
                fail_create: false,
                fail_start: false,
                fail_stop: false,
            }),
            build_started: Notify::new(),
            build_release: Notify::new(),
        }
    }

    pub fn set_build_behavior(&self, behavior: BuildBehavior) {
        self.state.lock().build_behavior = behavior;
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.state.lock().fail_create = fail;
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.state.lock().fail_start = fail;
    }

    pub fn set_fail_stop(&self, fail: bool) {
        self.state.lock().fail_stop = fail;
    }

    pub fn built_images(&self) -> Vec<String> {
        self.state.lock().built.clone()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state.lock().removed_images.clone()
    }

    pub async fn wait_for_build_start(&self) {
        self.build_started.notified().await;
    }

    pub fn release_builds(&self) {
        self.build_release.notify_one();
    }

    /// Simulate a container created outside the controller.
    pub fn add_container(&self, name: &str, running: bool) -> String {
        let mut state = self.state.lock();
        let id = Self::next_id(&mut state);
        let config = RunConfig {
            image: format!("{}:latest", name),
            name: name.to_string(),
            internal_port: 80,
            external_port: 0,
            env: HashMap::new(),
            binds: Vec::new(),
            restart_policy: RestartPolicy::No,
        };
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                config,
                running,
            },
        );
        id
    }

    pub fn container(&self, id: &str) -> Option<FakeContainer> {
        self.state.lock().containers.get(id).cloned()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state.lock().containers.values().cloned().collect()
    }

    pub fn remove_container_externally(&self, id: &str) {
        self.state.lock().containers.remove(id);
    }

    fn next_id(state: &mut RuntimeState) -> String {
        state.next_id += 1;
        format!("c{:04}", state.next_id)
    }

    fn info_of(container: &FakeContainer) -> ContainerInfo {
        ContainerInfo {
            id: container.id.clone(),
            name: container.config.name.clone(),
            running: container.running,
            started_at: container
                .running
                .then(|| Utc::now() - chrono::Duration::minutes(90)),
        }
    }

    fn lines(&self, id: &str) -> Result<LogLineStream> {
        let state = self.state.lock();
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| ContainerNotFound(id.to_string()))?;
        let lines = vec![
            LogLine {
                timestamp: Utc::now().to_rfc3339(),
                message: format!("{} listening", container.config.name),
                stream: LogStream::Stdout,
            },
            LogLine {
                timestamp: Utc::now().to_rfc3339(),
                message: "warming cache".to_string(),
                stream: LogStream::Stderr,
            },
        ];
        Ok(futures::stream::iter(lines).boxed())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn info(&self) -> Result<RuntimeInfo> {
        let state = self.state.lock();
        Ok(RuntimeInfo {
            name: "fake".to_string(),
            version: "1.0".to_string(),
            containers: state.containers.len() as i64,
            containers_running: state.containers.values().filter(|c| c.running).count() as i64,
            images: state.built.len() as i64,
            memory_total: 0,
        })
    }

    async fn build(
        &self,
        ctx: &BuildContext,
        output: &mut dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        output.append(b"Step 1/1 : FROM scratch\n")?;
        let behavior = self.state.lock().build_behavior.clone();
        self.build_started.notify_one();

        match behavior {
            BuildBehavior::Succeed => {}
            BuildBehavior::Fail(message) => anyhow::bail!(message),
            BuildBehavior::Block => {
                tokio::select! {
                    _ = self.build_release.notified() => {}
                    _ = cancel.cancelled() => anyhow::bail!("Build cancelled"),
                }
            }
        }

        self.state.lock().built.push(ctx.tag.clone());
        Ok(())
    }

    async fn create(&self, config: &RunConfig) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_create {
            anyhow::bail!("image {} not found", config.image);
        }
        if state.containers.values().any(|c| c.config.name == config.name) {
            anyhow::bail!("container name {} is already in use", config.name);
        }
        let id = Self::next_id(&mut state);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                config: config.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_start {
            anyhow::bail!("port is already allocated");
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerNotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_stop {
            anyhow::bail!("daemon timed out");
        }
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| ContainerNotFound(container_id.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        self.state
            .lock()
            .containers
            .remove(container_id)
            .map(|_| ())
            .ok_or_else(|| ContainerNotFound(container_id.to_string()).into())
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let state = self.state.lock();
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| ContainerNotFound(container_id.to_string()))?;
        Ok(Self::info_of(container))
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let state = self.state.lock();
        Ok(state
            .containers
            .values()
            .find(|c| c.config.name == name)
            .map(Self::info_of))
    }

    async fn logs(&self, container_id: &str, _tail: usize) -> Result<LogLineStream> {
        self.lines(container_id)
    }

    async fn logs_stream(&self, container_id: &str) -> Result<LogLineStream> {
        self.lines(container_id)
    }

    async fn image_size(&self, image: &str) -> Result<i64> {
        let state = self.state.lock();
        Ok(if state.built.iter().any(|i| i == image) {
            4096
        } else {
            0
        })
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.built.retain(|i| i != image);
        state.removed_images.push(image.to_string());
        Ok(())
    }

    async fn prune_images(&self) -> Result<u64> {
        Ok(1024)
    }
}

struct SourceState {
    head: String,
    remote: String,
    fail_clone: bool,
    fail_pull: bool,
    with_dockerfile: bool,
    manifest: Option<String>,
    clones: usize,
}

/// Source control double that fabricates a working tree on clone.
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SourceState {
                head: "1111111111111111111111111111111111111111".to_string(),
                remote: "1111111111111111111111111111111111111111".to_string(),
                fail_clone: false,
                fail_pull: false,
                with_dockerfile: true,
                manifest: None,
                clones: 0,
            }),
        }
    }

    pub fn set_remote(&self, commit: &str) {
        self.state.lock().remote = commit.to_string();
    }

    pub fn set_fail_clone(&self, fail: bool) {
        self.state.lock().fail_clone = fail;
    }

    pub fn set_fail_pull(&self, fail: bool) {
        self.state.lock().fail_pull = fail;
    }

    pub fn set_with_dockerfile(&self, present: bool) {
        self.state.lock().with_dockerfile = present;
    }

    pub fn set_manifest(&self, json: &str) {
        self.state.lock().manifest = Some(json.to_string());
    }

    pub fn clones(&self) -> usize {
        self.state.lock().clones
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn clone_repo(&self, url: &str, _branch: &str, dest: &Path) -> Result<()> {
        let (with_dockerfile, manifest) = {
            let mut state = self.state.lock();
            if state.fail_clone {
                anyhow::bail!("git clone failed: repository {} not found", url);
            }
            state.clones += 1;
            (state.with_dockerfile, state.manifest.clone())
        };

        if dest.exists() {
            std::fs::remove_dir_all(dest)?;
        }
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("README.md"), "demo")?;
        if with_dockerfile {
            std::fs::write(dest.join("Dockerfile"), "FROM scratch\n")?;
        }
        if let Some(manifest) = manifest {
            std::fs::write(dest.join(crate::engine::onboarding::MANIFEST_FILE), manifest)?;
        }
        Ok(())
    }

    async fn pull(&self, _repo: &Path, _branch: &str) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_pull {
            anyhow::bail!("git fetch failed: network unreachable");
        }
        state.head = state.remote.clone();
        Ok(state.head.clone())
    }

    async fn head_commit(&self, _repo: &Path) -> Result<String> {
        Ok(self.state.lock().head.clone())
    }

    async fn remote_commit(&self, _repo: &Path, _branch: &str) -> Result<String> {
        let state = self.state.lock();
        if state.fail_pull {
            anyhow::bail!("git fetch failed: network unreachable");
        }
        Ok(state.remote.clone())
    }

    async fn remove_tree(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

/// An `AppManager` wired to fakes, an in-memory database and a scratch
/// directory, allocating from `start..=end` on the loopback interface.
pub struct Harness {
    pub manager: Arc<AppManager>,
    pub runtime: Arc<FakeRuntime>,
    pub source: Arc<FakeSource>,
    pub store: AppStore,
    pub pool: DbPool,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new(start: u16, end: u16) -> Self {
        let dir = TempDir::new().unwrap();
        let pool = init_memory().await;
        let store = AppStore::new(pool.clone());
        let runtime = Arc::new(FakeRuntime::new());
        let source = Arc::new(FakeSource::new());
        let ports = PortsConfig {
            range_start: start,
            range_end: end,
            probe_host: "127.0.0.1".to_string(),
            reservation_secs: 60,
        };

        let manager = AppManager::new(
            store.clone(),
            runtime.clone(),
            source.clone(),
            Arc::new(BuildPipeline::new(runtime.clone(), dir.path().join("logs"))),
            Arc::new(PortAllocator::new(store.clone(), &ports)),
            Arc::new(ProgressHub::new(64)),
            dir.path().join("repos"),
        );

        Self {
            manager: Arc::new(manager),
            runtime,
            source,
            store,
            pool,
            dir,
        }
    }

    /// Persist `app` with a working tree in place.
    pub async fn seed(&self, app: &App) {
        let repo = self.manager.repo_path(&app.slug);
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("Dockerfile"), "FROM scratch\n").unwrap();
        self.store.insert(app).await.unwrap();
    }

    pub async fn app(&self, id: &str) -> App {
        self.store.get(id).await.unwrap().unwrap()
    }
}
