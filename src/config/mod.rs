use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ports: PortsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
            data_dir: default_data_dir(),
            static_dir: default_static_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    13000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("./static")
}

/// The managed host port range handed out to app containers.
#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    #[serde(default = "default_range_start")]
    pub range_start: u16,
    #[serde(default = "default_range_end")]
    pub range_end: u16,
    /// Address the allocator binds when probing whether a port is free.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    #[serde(default = "default_reservation_secs")]
    pub reservation_secs: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            range_start: default_range_start(),
            range_end: default_range_end(),
            probe_host: default_probe_host(),
            reservation_secs: default_reservation_secs(),
        }
    }
}

impl PortsConfig {
    pub fn contains(&self, port: u16) -> bool {
        port >= self.range_start && port <= self.range_end
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_secs)
    }
}

fn default_range_start() -> u16 {
    13001
}

fn default_range_end() -> u16 {
    13999
}

fn default_probe_host() -> String {
    "0.0.0.0".to_string()
}

fn default_reservation_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RuntimeConfig {
    /// Docker socket path. Falls back to the platform default when unset.
    #[serde(default)]
    pub docker_socket: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    #[serde(default = "default_build_timeout")]
    pub timeout_minutes: u64,
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_build_timeout(),
            progress_buffer: default_progress_buffer(),
        }
    }
}

impl BuildConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes * 60)
    }
}

fn default_build_timeout() -> u64 {
    30
}

fn default_progress_buffer() -> usize {
    100
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_session_ttl_hours")]
    pub session_ttl_hours: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_session_ttl_hours(),
        }
    }
}

fn default_session_ttl_hours() -> i64 {
    24 * 7
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&content).with_context(|| "Failed to parse configuration file")?
        } else {
            info!("No config file found, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let ports = &self.ports;
        if ports.range_start == 0 || ports.range_end == 0 {
            bail!("Port range bounds must be non-zero");
        }
        if ports.range_start > ports.range_end {
            bail!(
                "Invalid port range: {} is greater than {}",
                ports.range_start,
                ports.range_end
            );
        }
        if ports.contains(self.server.port) {
            bail!(
                "Server port {} lies inside the managed range {}-{}",
                self.server.port,
                ports.range_start,
                ports.range_end
            );
        }
        Ok(())
    }

    pub fn repos_dir(&self) -> PathBuf {
        self.server.data_dir.join("repos")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.server.data_dir.join("logs")
    }

    pub fn database_path(&self) -> PathBuf {
        self.server.data_dir.join("dockhand.db")
    }

    pub fn password_path(&self) -> PathBuf {
        self.server.data_dir.join("password.hash")
    }
}
