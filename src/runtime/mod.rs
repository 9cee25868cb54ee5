mod docker;

pub use docker::DockerRuntime;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::RuntimeConfig;
use crate::db::RestartPolicy;
use crate::engine::LogSink;

#[derive(Debug, Clone)]
pub struct BuildContext {
    /// Directory sent to the builder as the build context.
    pub path: PathBuf,
    /// Dockerfile location; may lie outside `path`.
    pub dockerfile: PathBuf,
    pub tag: String,
    pub build_args: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: String,
    pub name: String,
    pub internal_port: u16,
    pub external_port: u16,
    pub env: HashMap<String, String>,
    pub binds: Vec<String>,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: String,
    pub message: String,
    pub stream: LogStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInfo {
    pub name: String,
    pub version: String,
    pub containers: i64,
    pub containers_running: i64,
    pub images: i64,
    pub memory_total: i64,
}

pub type LogLineStream = Pin<Box<dyn Stream<Item = LogLine> + Send>>;

/// Raised by runtimes when the referenced container does not exist.
#[derive(Debug, thiserror::Error)]
#[error("container not found: {0}")]
pub struct ContainerNotFound(pub String);

pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ContainerNotFound>().is_some()
}

/// Raised by [`NoopRuntime`] for every operation that needs a daemon.
#[derive(Debug, thiserror::Error)]
#[error("No container runtime available")]
pub struct RuntimeUnavailable;

pub fn is_unavailable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<RuntimeUnavailable>().is_some()
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &'static str;
    async fn is_available(&self) -> bool;
    async fn info(&self) -> Result<RuntimeInfo>;
    /// Build an image, writing every chunk of builder output to `output`.
    /// Returns an error promptly once `cancel` fires.
    async fn build(
        &self,
        ctx: &BuildContext,
        output: &mut dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<()>;
    /// Create (but do not start) a container, returning its id.
    async fn create(&self, config: &RunConfig) -> Result<String>;
    async fn start(&self, container_id: &str) -> Result<()>;
    /// Stopping an already stopped container succeeds.
    async fn stop(&self, container_id: &str) -> Result<()>;
    async fn remove(&self, container_id: &str) -> Result<()>;
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo>;
    /// Exact name match across running and stopped containers.
    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerInfo>>;
    async fn logs(&self, container_id: &str, tail: usize) -> Result<LogLineStream>;
    async fn logs_stream(&self, container_id: &str) -> Result<LogLineStream>;
    async fn image_size(&self, image: &str) -> Result<i64>;
    async fn remove_image(&self, image: &str) -> Result<()>;
    /// Prune dangling images, returns bytes reclaimed
    async fn prune_images(&self) -> Result<u64>;
}

/// A no-op runtime used when no container runtime is available
pub struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    fn name(&self) -> &'static str {
        "none"
    }
    async fn is_available(&self) -> bool {
        false
    }
    async fn info(&self) -> Result<RuntimeInfo> {
        Err(RuntimeUnavailable.into())
    }
    async fn build(
        &self,
        _ctx: &BuildContext,
        _output: &mut dyn LogSink,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Err(RuntimeUnavailable.into())
    }
    async fn create(&self, _config: &RunConfig) -> Result<String> {
        Err(RuntimeUnavailable.into())
    }
    async fn start(&self, _container_id: &str) -> Result<()> {
        Err(RuntimeUnavailable.into())
    }
    async fn stop(&self, _container_id: &str) -> Result<()> {
        Err(RuntimeUnavailable.into())
    }
    async fn remove(&self, _container_id: &str) -> Result<()> {
        Err(RuntimeUnavailable.into())
    }
    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        Err(ContainerNotFound(container_id.to_string()).into())
    }
    async fn find_by_name(&self, _name: &str) -> Result<Option<ContainerInfo>> {
        Ok(None)
    }
    async fn logs(&self, _container_id: &str, _tail: usize) -> Result<LogLineStream> {
        Err(RuntimeUnavailable.into())
    }
    async fn logs_stream(&self, _container_id: &str) -> Result<LogLineStream> {
        Err(RuntimeUnavailable.into())
    }
    async fn image_size(&self, _image: &str) -> Result<i64> {
        Ok(0)
    }
    async fn remove_image(&self, _image: &str) -> Result<()> {
        Err(RuntimeUnavailable.into())
    }
    async fn prune_images(&self) -> Result<u64> {
        Err(RuntimeUnavailable.into())
    }
}

pub async fn detect_runtime(config: &RuntimeConfig) -> Arc<dyn ContainerRuntime> {
    match DockerRuntime::new(config.docker_socket.as_deref()) {
        Ok(docker) if docker.is_available().await => {
            tracing::info!("Connected to Docker runtime");
            Arc::new(docker)
        }
        Ok(_) => {
            tracing::warn!("Docker is not responding. Builds and containers will not work until it is reachable.");
            Arc::new(NoopRuntime)
        }
        Err(e) => {
            tracing::warn!("Failed to connect to Docker: {}. Builds and containers will not work.", e);
            Arc::new(NoopRuntime)
        }
    }
}
