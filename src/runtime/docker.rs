use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{BuildImageOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::service::{HostConfig, PortBinding, RestartPolicyNameEnum};
use bollard::Docker;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{
    BuildContext, ContainerInfo, ContainerNotFound, ContainerRuntime, LogLine, LogLineStream,
    LogStream, RunConfig, RuntimeInfo,
};
use crate::db::RestartPolicy;
use crate::engine::LogSink;

/// Archive name for a Dockerfile that lives outside the build context.
const EXTERNAL_DOCKERFILE: &str = ".dockhand.Dockerfile";

/// Seconds a container gets to exit before it is killed.
const STOP_TIMEOUT_SECS: i64 = 30;

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    pub fn new(socket: Option<&str>) -> Result<Self> {
        let client = match socket {
            Some(socket) if !socket.starts_with("npipe://") && !socket.starts_with("tcp://") => {
                Docker::connect_with_socket(socket, 120, bollard::API_DEFAULT_VERSION)?
            }
            _ => Docker::connect_with_local_defaults()?,
        };

        Ok(Self { client })
    }

    fn logs_options(follow: bool, tail: usize) -> LogsOptions<String> {
        LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            timestamps: true,
            tail: tail.to_string(),
            ..Default::default()
        }
    }

    fn log_lines(&self, container_id: &str, options: LogsOptions<String>) -> LogLineStream {
        let stream = self.client.logs(container_id, Some(options));
        let mapped = stream.filter_map(|result| async move {
            match result {
                Ok(output) => parse_log_output(output),
                Err(e) => {
                    tracing::warn!("Error reading container log: {}", e);
                    None
                }
            }
        });
        Box::pin(mapped)
    }
}

/// Maps daemon 404 responses onto [`ContainerNotFound`] so callers can tell
/// a missing container from a failing daemon.
fn container_error(err: BollardError, container_id: &str, action: &str) -> anyhow::Error {
    match err {
        BollardError::DockerResponseServerError {
            status_code: 404, ..
        } => anyhow::Error::new(ContainerNotFound(container_id.to_string())),
        other => anyhow::Error::new(other).context(format!("Failed to {} container", action)),
    }
}

fn parse_log_output(output: LogOutput) -> Option<LogLine> {
    let (stream, message) = match output {
        LogOutput::StdOut { message } => (LogStream::Stdout, message),
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        _ => return None,
    };
    let text = String::from_utf8_lossy(&message);
    // Docker prefixes each line with "2024-01-01T00:00:00.000000000Z "
    let (timestamp, body) = match text.split_once(' ') {
        Some((ts, rest)) if ts.len() > 20 && ts.as_bytes().get(4) == Some(&b'-') => {
            (ts.to_string(), rest)
        }
        _ => (Utc::now().to_rfc3339(), text.as_ref()),
    };
    Some(LogLine {
        timestamp,
        message: body.trim_end().to_string(),
        stream,
    })
}

/// Tar the build context. A Dockerfile outside the context is added under
/// [`EXTERNAL_DOCKERFILE`]. Returns the archive and the Dockerfile's name
/// inside it.
fn archive_context(context: &Path, dockerfile: &Path) -> Result<(Vec<u8>, String)> {
    let mut builder = tar::Builder::new(Vec::new());
    builder
        .append_dir_all(".", context)
        .with_context(|| format!("Failed to archive build context {}", context.display()))?;

    let name = match dockerfile.strip_prefix(context) {
        Ok(relative) => relative.to_string_lossy().replace('\\', "/"),
        Err(_) => {
            builder
                .append_path_with_name(dockerfile, EXTERNAL_DOCKERFILE)
                .with_context(|| format!("Failed to add {}", dockerfile.display()))?;
            EXTERNAL_DOCKERFILE.to_string()
        }
    };

    Ok((builder.into_inner()?, name))
}

fn write_output(output: &mut dyn LogSink, text: &str) {
    if let Err(e) = output.append(text.as_bytes()) {
        tracing::warn!("Failed to record build output: {}", e);
    }
}

fn restart_policy(policy: RestartPolicy) -> bollard::service::RestartPolicy {
    let (name, retries) = match policy {
        RestartPolicy::Always => (RestartPolicyNameEnum::ALWAYS, None),
        RestartPolicy::UnlessStopped => (RestartPolicyNameEnum::UNLESS_STOPPED, None),
        RestartPolicy::OnFailure => (RestartPolicyNameEnum::ON_FAILURE, Some(3)),
        RestartPolicy::No => (RestartPolicyNameEnum::NO, None),
    };
    bollard::service::RestartPolicy {
        name: Some(name),
        maximum_retry_count: retries,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &'static str {
        "Docker"
    }

    async fn is_available(&self) -> bool {
        self.client.ping().await.is_ok()
    }

    async fn info(&self) -> Result<RuntimeInfo> {
        let info = self
            .client
            .info()
            .await
            .context("Failed to query Docker info")?;
        Ok(RuntimeInfo {
            name: self.name().to_string(),
            version: info.server_version.unwrap_or_default(),
            containers: info.containers.unwrap_or(0),
            containers_running: info.containers_running.unwrap_or(0),
            images: info.images.unwrap_or(0),
            memory_total: info.mem_total.unwrap_or(0),
        })
    }

    async fn build(
        &self,
        ctx: &BuildContext,
        output: &mut dyn LogSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let context = ctx.path.clone();
        let dockerfile = ctx.dockerfile.clone();
        let (tar_data, dockerfile_name) =
            tokio::task::spawn_blocking(move || archive_context(&context, &dockerfile))
                .await
                .context("Build context archiver panicked")??;

        let build_args: HashMap<&str, &str> = ctx
            .build_args
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let options = BuildImageOptions {
            dockerfile: dockerfile_name.as_str(),
            t: ctx.tag.as_str(),
            rm: true,
            forcerm: true,
            buildargs: build_args,
            ..Default::default()
        };

        let mut stream = self
            .client
            .build_image(options, None, Some(Bytes::from(tar_data)));

        loop {
            // Dropping the stream aborts the request, which cancels the daemon-side build.
            let next = tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("Build cancelled"),
                next = stream.next() => next,
            };
            let Some(result) = next else { break };

            let info = result.map_err(|e| anyhow::anyhow!("Build failed: {}", e))?;
            if let Some(text) = info.stream {
                write_output(output, &text);
            }
            if let Some(status) = info.status {
                write_output(output, &format!("{}\n", status));
            }
            if let Some(error) = info.error {
                anyhow::bail!("Build error: {}", error.trim());
            }
        }

        Ok(())
    }

    async fn create(&self, config: &RunConfig) -> Result<String> {
        let env: Vec<String> = config
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let port_key = format!("{}/tcp", config.internal_port);
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(config.external_port.to_string()),
            }]),
        );
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let binds = if config.binds.is_empty() {
            None
        } else {
            Some(config.binds.clone())
        };

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds,
            restart_policy: Some(restart_policy(config.restart_policy)),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: config.name.as_str(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create container: {}", e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %config.name, "Docker: {}", warning);
        }

        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.client
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| container_error(e, container_id, "start"))
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let options = StopContainerOptions {
            t: STOP_TIMEOUT_SECS,
        };
        match self.client.stop_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(container_error(e, container_id, "stop")),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| container_error(e, container_id, "remove"))
    }

    async fn inspect(&self, container_id: &str) -> Result<ContainerInfo> {
        let info = self
            .client
            .inspect_container(container_id, None)
            .await
            .map_err(|e| container_error(e, container_id, "inspect"))?;

        let running = info
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let started_at = info
            .state
            .as_ref()
            .and_then(|s| s.started_at.as_deref())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
            .filter(|_| running);

        Ok(ContainerInfo {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string(),
            running,
            started_at,
        })
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .context("Failed to list containers")?;

        // The name filter is a substring match, so confirm the exact name.
        let wanted = format!("/{}", name);
        let found = containers.into_iter().find(|c| {
            c.names
                .as_ref()
                .map(|names| names.iter().any(|n| *n == wanted))
                .unwrap_or(false)
        });

        Ok(found.map(|c| ContainerInfo {
            id: c.id.unwrap_or_default(),
            name: name.to_string(),
            running: c
                .state
                .map(|s| s.eq_ignore_ascii_case("running"))
                .unwrap_or(false),
            started_at: None,
        }))
    }

    async fn logs(&self, container_id: &str, tail: usize) -> Result<LogLineStream> {
        Ok(self.log_lines(container_id, Self::logs_options(false, tail)))
    }

    async fn logs_stream(&self, container_id: &str) -> Result<LogLineStream> {
        Ok(self.log_lines(container_id, Self::logs_options(true, 100)))
    }

    async fn image_size(&self, image: &str) -> Result<i64> {
        let inspect = self
            .client
            .inspect_image(image)
            .await
            .with_context(|| format!("Failed to inspect image {}", image))?;
        Ok(inspect.size.unwrap_or(0))
    }

    async fn remove_image(&self, image: &str) -> Result<()> {
        let options = RemoveImageOptions {
            force: true,
            noprune: false,
        };
        self.client
            .remove_image(image, Some(options), None)
            .await
            .with_context(|| format!("Failed to remove image {}", image))?;
        Ok(())
    }

    async fn prune_images(&self) -> Result<u64> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);

        let response = self
            .client
            .prune_images(Some(PruneImagesOptions::<String> { filters }))
            .await
            .context("Failed to prune images")?;

        Ok(response.space_reclaimed.unwrap_or(0).max(0) as u64)
    }
}
