//! Application models and DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a managed app.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AppStatus {
    Stopped,
    Building,
    BuildFailed,
    Starting,
    Running,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Building => "building",
            Self::BuildFailed => "build-failed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for AppStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "building" => Self::Building,
            "build-failed" => Self::BuildFailed,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "error" => Self::Error,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    Always,
    #[default]
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
            Self::UnlessStopped => "unless-stopped",
            Self::OnFailure => "on-failure",
        }
    }
}

impl std::fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for RestartPolicy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "no" => Self::No,
            "always" => Self::Always,
            "on-failure" => Self::OnFailure,
            _ => Self::UnlessStopped,
        }
    }
}

/// A managed application: source repository, build recipe, runtime settings
/// and the last observed state of its container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct App {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: String,

    pub repo_url: String,
    pub branch: String,
    pub last_commit: Option<String>,
    pub last_pulled: Option<DateTime<Utc>>,

    /// Relative to the repository root, e.g. `./Dockerfile`.
    pub dockerfile_path: String,
    pub build_context: String,
    pub build_args: HashMap<String, String>,

    pub image_name: String,
    pub container_name: String,
    pub internal_port: u16,
    pub external_port: u16,
    pub restart_policy: RestartPolicy,
    pub env: HashMap<String, String>,
    /// `host:container` bind specs, kept in the order they were given.
    pub volumes: Vec<String>,

    pub status: AppStatus,
    pub container_id: Option<String>,
    pub last_build: Option<DateTime<Utc>>,
    pub last_build_duration: Option<String>,
    pub last_build_success: bool,
    pub image_size: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    pub fn is_running(&self) -> bool {
        self.status == AppStatus::Running
    }

    /// Container id, treating an empty string as absent.
    pub fn container(&self) -> Option<&str> {
        self.container_id.as_deref().filter(|id| !id.is_empty())
    }
}

/// App plus fields computed at read time.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppResponse {
    #[serde(flatten)]
    pub app: App,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<String>,
}

/// Optional overrides supplied when creating or reconfiguring an app.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigureAppRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub internal_port: Option<u16>,
    pub external_port: Option<u16>,
    pub env: Option<HashMap<String, String>>,
    pub build_args: Option<HashMap<String, String>>,
    pub volumes: Option<Vec<String>>,
    pub restart_policy: Option<RestartPolicy>,
    pub dockerfile_path: Option<String>,
    pub build_context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAppRequest {
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub config: ConfigureAppRequest,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
}

fn default_auto_start() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneRequest {
    pub repo_url: String,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Optional `dockhand.json` file at the repository root.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppManifest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_port: Option<u16>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// What a fresh clone revealed about a repository.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneResult {
    pub slug: String,
    pub name: String,
    pub description: String,
    pub dockerfile_path: String,
    pub manifest: Option<AppManifest>,
    pub suggested_port: u16,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCheckResult {
    pub local_commit: String,
    pub remote_commit: String,
    pub has_update: bool,
}

/// Shorten a commit hash to the 8-character form shown to operators.
pub fn short_commit(hash: &str) -> String {
    hash.trim().chars().take(8).collect()
}
