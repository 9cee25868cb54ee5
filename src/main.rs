use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::services::{ServeDir, ServeFile};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dockhand::config::Config;
use dockhand::db::{AppStore, SessionStore};
use dockhand::engine::{AppManager, BuildPipeline, PortAllocator, ProgressHub};
use dockhand::git::GitCli;
use dockhand::runtime::detect_runtime;
use dockhand::AppState;

#[derive(Parser, Debug)]
#[command(name = "dockhand")]
#[command(author, version, about = "Build and run Dockerfile repositories on one host", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "dockhand.toml", env = "DOCKHAND_CONFIG")]
    config: PathBuf,

    /// Override log level
    #[arg(short, long, env = "DOCKHAND_LOG_LEVEL")]
    log_level: Option<String>,

    /// Override the API listen port
    #[arg(short, long, env = "DOCKHAND_PORT")]
    port: Option<u16>,

    /// Override the data directory
    #[arg(long, env = "DOCKHAND_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(data_dir) = cli.data_dir {
        config.server.data_dir = data_dir;
    }
    config.validate()?;

    let log_level = cli
        .log_level
        .as_ref()
        .unwrap_or(&config.logging.level)
        .clone();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Dockhand v{}", env!("CARGO_PKG_VERSION"));

    for dir in [
        config.server.data_dir.clone(),
        config.repos_dir(),
        config.logs_dir(),
    ] {
        std::fs::create_dir_all(&dir)?;
    }

    let db = dockhand::db::init(&config.database_path()).await?;

    if let Some(password) = dockhand::api::auth::ensure_password(&config.password_path()).await? {
        tracing::warn!(
            "Generated operator password: {} (change it from the dashboard)",
            password
        );
    }
    let purged = SessionStore::new(db.clone()).purge_expired().await?;
    if purged > 0 {
        tracing::info!("Removed {} expired sessions", purged);
    }

    let runtime = detect_runtime(&config.runtime).await;

    let store = AppStore::new(db.clone());
    let manager = Arc::new(AppManager::new(
        store.clone(),
        runtime.clone(),
        Arc::new(GitCli::new()),
        Arc::new(BuildPipeline::new(runtime.clone(), config.logs_dir())),
        Arc::new(PortAllocator::new(store, &config.ports)),
        Arc::new(ProgressHub::new(config.build.progress_buffer)),
        config.repos_dir(),
    ));

    let report = dockhand::startup::run_startup_checks(&config, &db, runtime.as_ref()).await;
    if !report.all_critical_passed {
        bail!("Startup checks failed: {}", report.summary);
    }

    if runtime.is_available().await {
        match manager.reconcile().await {
            Ok(report) => tracing::info!(
                checked = report.checked,
                corrected = report.corrected,
                failed = report.failed,
                "Reconciled app state with the container runtime"
            ),
            Err(e) => tracing::error!("State reconciliation failed: {}", e),
        }
    } else {
        tracing::warn!("Skipping state reconciliation: no container runtime available");
    }

    let state = Arc::new(AppState::new(config.clone(), db, manager));
    let api_router = dockhand::api::create_router(state);

    // Dashboard assets with SPA fallback
    let static_dir = config.server.static_dir.clone();
    let index_file = static_dir.join("index.html");
    let serve_static = ServeDir::new(&static_dir).not_found_service(ServeFile::new(&index_file));

    let app = axum::Router::new()
        .merge(api_router)
        .fallback_service(serve_static);

    let api_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&api_addr).await?;
    tracing::info!("API server listening on http://{}", api_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
