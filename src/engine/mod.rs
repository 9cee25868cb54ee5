mod build;
mod manager;
pub mod onboarding;
mod ports;
mod progress;
mod reconcile;
mod sink;

pub use build::*;
pub use manager::*;
pub use ports::*;
pub use progress::*;
pub use reconcile::*;
pub use sink::*;

use thiserror::Error;

/// Errors raised by the lifecycle engine. The API layer maps each variant to
/// a distinct response class.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("A build is already in progress")]
    BuildInProgress,

    #[error("No ports available in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("Port {0} is not available")]
    PortUnavailable(u16),

    #[error("An app with slug '{0}' already exists")]
    DuplicateSlug(String),

    #[error("{0}")]
    Validation(String),

    #[error("Container runtime error: {0:#}")]
    Runtime(anyhow::Error),

    #[error("Source control error: {0:#}")]
    SourceControl(anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
