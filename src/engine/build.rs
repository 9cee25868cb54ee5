use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::{
    ChannelSink, EngineError, EngineResult, FanOut, FileSink, LogSink, ProgressEvent,
    ProgressSender,
};
use crate::db::App;
use crate::runtime::{BuildContext, ContainerRuntime};

/// Outcome of a successful build.
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub elapsed: Duration,
}

impl BuildReport {
    pub fn duration(&self) -> String {
        format_duration(self.elapsed)
    }
}

#[derive(Default)]
struct BuildSlot {
    app_id: Option<String>,
    cancel: Option<CancellationToken>,
}

/// Claim on the pipeline's single build slot. Dropping it frees the slot.
pub struct BuildTicket<'a> {
    pipeline: &'a BuildPipeline,
    cancel: CancellationToken,
}

impl Drop for BuildTicket<'_> {
    fn drop(&mut self) {
        *self.pipeline.slot.lock() = BuildSlot::default();
    }
}

/// Runs at most one image build at a time and keeps a log file per app.
pub struct BuildPipeline {
    runtime: Arc<dyn ContainerRuntime>,
    logs_dir: PathBuf,
    slot: Mutex<BuildSlot>,
}

impl BuildPipeline {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, logs_dir: PathBuf) -> Self {
        Self {
            runtime,
            logs_dir,
            slot: Mutex::new(BuildSlot::default()),
        }
    }

    /// Atomically claim the build slot, or fail with `BuildInProgress`.
    /// The build's cancellation handle is a child of `parent`.
    pub fn try_begin(
        &self,
        app_id: &str,
        parent: &CancellationToken,
    ) -> EngineResult<BuildTicket<'_>> {
        let mut slot = self.slot.lock();
        if slot.app_id.is_some() {
            return Err(EngineError::BuildInProgress);
        }
        let cancel = parent.child_token();
        slot.app_id = Some(app_id.to_string());
        slot.cancel = Some(cancel.clone());
        Ok(BuildTicket {
            pipeline: self,
            cancel,
        })
    }

    /// Claim the slot and build `app` from its working tree at `repo_path`.
    pub async fn build(
        &self,
        app: &App,
        repo_path: &Path,
        progress: Option<ProgressSender>,
        cancel: &CancellationToken,
    ) -> EngineResult<BuildReport> {
        let ticket = self.try_begin(&app.id, cancel)?;
        self.run(ticket, app, repo_path, progress).await
    }

    /// Run a build on a slot already claimed with [`try_begin`](Self::try_begin).
    pub async fn run(
        &self,
        ticket: BuildTicket<'_>,
        app: &App,
        repo_path: &Path,
        progress: Option<ProgressSender>,
    ) -> EngineResult<BuildReport> {
        let started = Instant::now();
        let log_path = self.log_path(&app.id);

        let file = match FileSink::create(&log_path) {
            Ok(file) => file,
            Err(e) => {
                if let Some(progress) = &progress {
                    progress.send(ProgressEvent::Complete {
                        success: false,
                        error: Some(format!("Failed to create build log: {}", e)),
                        duration: None,
                    });
                }
                return Err(e.into());
            }
        };

        let mut sinks: Vec<Box<dyn LogSink>> = vec![Box::new(file)];
        if let Some(progress) = &progress {
            sinks.push(Box::new(ChannelSink::new(progress.clone())));
        }
        let mut output = FanOut::new(sinks);

        let ctx = BuildContext {
            path: repo_path.join(&app.build_context),
            dockerfile: repo_path.join(&app.dockerfile_path),
            tag: app.image_name.clone(),
            build_args: app.build_args.clone(),
        };

        let preamble = format!(
            "Starting build for {}\nContext: {}\nDockerfile: {}\nImage: {}\n\n",
            app.name, app.build_context, app.dockerfile_path, app.image_name
        );
        record(&mut output, progress.as_ref(), &preamble);

        tracing::info!(app_id = %app.id, image = %app.image_name, "Building image");
        let result = self.runtime.build(&ctx, &mut output, &ticket.cancel).await;
        let elapsed = started.elapsed();

        match result {
            Ok(()) => {
                let duration = format_duration(elapsed);
                record(
                    &mut output,
                    progress.as_ref(),
                    &format!("\n\nBuild completed successfully in {}\n", duration),
                );
                if let Some(progress) = &progress {
                    progress.send(ProgressEvent::Complete {
                        success: true,
                        error: None,
                        duration: Some(duration.clone()),
                    });
                }
                tracing::info!(app_id = %app.id, duration = %duration, "Build succeeded");
                Ok(BuildReport { elapsed })
            }
            Err(e) => {
                let message = format!("{:#}", e);
                record(
                    &mut output,
                    progress.as_ref(),
                    &format!("\n\nBuild failed: {}\n", message),
                );
                if let Some(progress) = &progress {
                    progress.send(ProgressEvent::Complete {
                        success: false,
                        error: Some(message.clone()),
                        duration: None,
                    });
                }
                tracing::warn!(app_id = %app.id, error = %message, "Build failed");
                Err(EngineError::Runtime(e))
            }
        }
    }

    /// Cancel the in-flight build, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match &self.slot.lock().cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the in-flight build only when it belongs to `app_id`.
    pub fn cancel_app(&self, app_id: &str) -> bool {
        let slot = self.slot.lock();
        match (&slot.app_id, &slot.cancel) {
            (Some(current), Some(token)) if current == app_id => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_building(&self) -> bool {
        self.slot.lock().app_id.is_some()
    }

    pub fn current_app(&self) -> Option<String> {
        self.slot.lock().app_id.clone()
    }

    pub fn log_path(&self, app_id: &str) -> PathBuf {
        self.logs_dir.join(format!("build-{}.log", app_id))
    }

    /// Persisted log of the app's most recent build.
    pub async fn read_log(&self, app_id: &str) -> EngineResult<Option<String>> {
        match tokio::fs::read_to_string(self.log_path(app_id)).await {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn clear_log(&self, app_id: &str) -> EngineResult<()> {
        match tokio::fs::remove_file(self.log_path(app_id)).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// Remove every build log, returning how many were deleted.
    pub async fn clear_all_logs(&self) -> EngineResult<usize> {
        let mut removed = 0;
        for path in self.log_files().await? {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Total bytes used by build logs.
    pub async fn logs_size(&self) -> EngineResult<u64> {
        let mut total = 0;
        for path in self.log_files().await? {
            total += tokio::fs::metadata(&path).await?.len();
        }
        Ok(total)
    }

    async fn log_files(&self) -> EngineResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.logs_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("build-") && name.ends_with(".log") {
                files.push(entry.path());
            }
        }
        Ok(files)
    }
}

/// Write `text` to the build output. A log write failure is reported to
/// observers but does not abort the build.
fn record(output: &mut FanOut, progress: Option<&ProgressSender>, text: &str) {
    if let Err(e) = output.append(text.as_bytes()) {
        tracing::warn!("Failed to write build log: {}", e);
        if let Some(progress) = progress {
            progress.send(ProgressEvent::Error {
                text: format!("Failed to write build log: {}", e),
            });
        }
    }
}

/// Whole-second duration in the form `1h2m3s`, `4m5s` or `6s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = (duration.as_millis() + 500) / 1000;
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}
