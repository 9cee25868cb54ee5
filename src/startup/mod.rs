//! Startup self-checks module
//!
//! Verifies the environment before the server starts accepting requests:
//! - Database connectivity
//! - Data directories exist and are writable
//! - Container runtime availability
//! - `git` on PATH

use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::git::GitCli;
use crate::runtime::ContainerRuntime;
use crate::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Failure aborts startup
    Critical,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    fn new(
        name: impl Into<String>,
        passed: bool,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed,
            severity,
            message: message.into(),
            details: None,
        }
    }

    pub fn ok(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, true, Severity::Warning, message)
    }

    pub fn critical(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, false, Severity::Critical, message)
    }

    pub fn warning(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(name, false, Severity::Warning, message)
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn is_blocking(&self) -> bool {
        !self.passed && self.severity == Severity::Critical
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    pub checks: Vec<CheckResult>,
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let blocking = checks.iter().filter(|c| c.is_blocking()).count();
        let all_critical_passed = blocking == 0;
        let all_passed = checks.iter().all(|c| c.passed);

        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {} startup checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} warnings)",
                passed,
                total,
                total - passed
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, blocking
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }
}

pub async fn run_startup_checks(
    config: &Config,
    db: &DbPool,
    runtime: &dyn ContainerRuntime,
) -> StartupCheckReport {
    info!("Running startup self-checks...");

    let checks = vec![
        check_database_connectivity(db).await,
        check_directory_writability(&config.server.data_dir),
        check_directory_writability(&config.repos_dir()),
        check_directory_writability(&config.logs_dir()),
        check_container_runtime(runtime).await,
        check_git(&GitCli::new()).await,
    ];

    let report = StartupCheckReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(check = %check.name, message = %check.message, "Startup check PASSED");
        } else if check.is_blocking() {
            error!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (CRITICAL)"
            );
        } else {
            warn!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (non-critical)"
            );
        }
    }

    info!(summary = %report.summary, "Startup checks completed");
    report
}

async fn check_database_connectivity(db: &DbPool) -> CheckResult {
    match sqlx::query("SELECT 1").fetch_one(db).await {
        Ok(_) => CheckResult::ok("database", "Database connection successful"),
        Err(e) => CheckResult::critical("database", "Database query failed")
            .with_details(e.to_string()),
    }
}

fn check_directory_writability(dir: &Path) -> CheckResult {
    let name = format!("writable:{}", dir.display());
    let probe = dir.join(".dockhand_write_test");

    match std::fs::write(&probe, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            CheckResult::ok(name, "Directory is writable")
        }
        Err(e) => CheckResult::critical(name, "Directory is not writable")
            .with_details(format!("{}: {}", dir.display(), e)),
    }
}

/// Missing runtime is a warning: the dashboard still serves, lifecycle
/// operations fail with 503 until the daemon appears.
async fn check_container_runtime(runtime: &dyn ContainerRuntime) -> CheckResult {
    if runtime.is_available().await {
        let check = CheckResult::ok(
            "container_runtime",
            format!("{} runtime available", runtime.name()),
        );
        match runtime.info().await {
            Ok(info) => check.with_details(format!("{} {}", info.name, info.version)),
            Err(_) => check,
        }
    } else {
        CheckResult::warning("container_runtime", "No container runtime available")
            .with_details("Install or start Docker to enable builds")
    }
}

async fn check_git(git: &GitCli) -> CheckResult {
    if git.is_available().await {
        CheckResult::ok("git", "git found on PATH")
    } else {
        CheckResult::warning("git", "git not found on PATH")
            .with_details("Cloning and pulling repositories will fail")
    }
}
