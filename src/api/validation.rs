//! Input validation for API requests.
//!
//! Field checks return `Result<(), String>`; the request-level helpers
//! collect them into a single `ApiError` via `ValidationErrorBuilder`.

use lazy_static::lazy_static;
use regex::Regex;

use super::error::{ApiError, ValidationErrorBuilder};
use crate::db::{ConfigureAppRequest, CreateAppRequest};

lazy_static! {
    /// Regex for validating HTTP/HTTPS Git URLs
    static ref GIT_HTTP_URL_REGEX: Regex = Regex::new(
        r"^https?://[a-zA-Z0-9][-a-zA-Z0-9]*(\.[a-zA-Z0-9][-a-zA-Z0-9]*)*(:\d+)?(/[-a-zA-Z0-9_%&=+@~.]+)*/?$"
    ).unwrap();

    /// Regex for validating SSH Git URLs
    static ref GIT_SSH_URL_REGEX: Regex = Regex::new(
        r"^(git@[a-zA-Z0-9][-a-zA-Z0-9]*(\.[a-zA-Z0-9][-a-zA-Z0-9]*)*:[-a-zA-Z0-9_./]+\.git|ssh://[a-zA-Z0-9@][-a-zA-Z0-9@.]*(:\d+)?(/[-a-zA-Z0-9_.]+)+\.git)$"
    ).unwrap();

    static ref BRANCH_REGEX: Regex = Regex::new(
        r"^[a-zA-Z0-9]([a-zA-Z0-9._/-]*[a-zA-Z0-9])?$"
    ).unwrap();

    static ref ENV_KEY_REGEX: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap();
}

/// Validate a Git URL (HTTP/HTTPS or SSH format)
pub fn validate_git_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err("Repository URL is required".to_string());
    }

    if url.len() > 2048 {
        return Err("Repository URL is too long (max 2048 characters)".to_string());
    }

    if (url.starts_with("http://") || url.starts_with("https://"))
        && GIT_HTTP_URL_REGEX.is_match(url)
    {
        return Ok(());
    }

    if (url.starts_with("git@") || url.starts_with("ssh://")) && GIT_SSH_URL_REGEX.is_match(url)
    {
        return Ok(());
    }

    Err("Invalid repository URL. Must be an HTTP(S) or SSH git URL".to_string())
}

pub fn validate_branch(branch: &str) -> Result<(), String> {
    if branch.is_empty() {
        return Err("Branch name is required".to_string());
    }

    if branch.len() > 255 {
        return Err("Branch name is too long (max 255 characters)".to_string());
    }

    if !BRANCH_REGEX.is_match(branch) {
        return Err("Invalid branch name format".to_string());
    }

    if branch.contains("..") {
        return Err("Branch name cannot contain '..'".to_string());
    }

    Ok(())
}

/// A path inside the cloned repository: relative, no parent traversal.
pub fn validate_repo_path(path: &str, what: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err(format!("{} is required", what));
    }

    if path.len() > 512 {
        return Err(format!("{} is too long (max 512 characters)", what));
    }

    if path.split(['/', '\\']).any(|part| part == "..") {
        return Err(format!("{} cannot contain '..'", what));
    }

    if path.starts_with('/') || path.starts_with('\\') {
        return Err(format!("{} must be relative to the repository", what));
    }

    Ok(())
}

pub fn validate_port(port: u16) -> Result<(), String> {
    if port == 0 {
        return Err("Port must be between 1 and 65535".to_string());
    }
    Ok(())
}

pub fn validate_env_key(key: &str) -> Result<(), String> {
    if !ENV_KEY_REGEX.is_match(key) {
        return Err(format!("Invalid variable name: {}", key));
    }
    Ok(())
}

/// `host:container` or `host:container:mode` with absolute paths.
pub fn validate_volume(spec: &str) -> Result<(), String> {
    let parts: Vec<&str> = spec.split(':').collect();
    let (host, container) = match parts.as_slice() {
        [host, container] => (*host, *container),
        [host, container, mode] => {
            if !matches!(*mode, "ro" | "rw") {
                return Err(format!("Invalid volume mode in '{}': use ro or rw", spec));
            }
            (*host, *container)
        }
        _ => return Err(format!("Invalid volume '{}': expected host:container", spec)),
    };

    if !host.starts_with('/') || !container.starts_with('/') {
        return Err(format!("Volume '{}' must use absolute paths", spec));
    }
    Ok(())
}

pub fn validate_create_request(req: &CreateAppRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();

    if let Err(e) = validate_git_url(req.repo_url.trim()) {
        errors.add("repoUrl", e);
    }
    if let Some(branch) = &req.branch {
        if let Err(e) = validate_branch(branch) {
            errors.add("branch", e);
        }
    }
    collect_config_errors(&req.config, &mut errors);

    errors.finish()
}

pub fn validate_clone_request(repo_url: &str, branch: Option<&str>) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_git_url(repo_url.trim()) {
        errors.add("repoUrl", e);
    }
    if let Some(Err(e)) = branch.map(validate_branch) {
        errors.add("branch", e);
    }
    errors.finish()
}

pub fn validate_configure_request(config: &ConfigureAppRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    collect_config_errors(config, &mut errors);
    errors.finish()
}

fn collect_config_errors(config: &ConfigureAppRequest, errors: &mut ValidationErrorBuilder) {
    if let Some(name) = &config.name {
        if name.trim().is_empty() {
            errors.add("name", "Name cannot be empty");
        } else if name.len() > 100 {
            errors.add("name", "Name is too long (max 100 characters)");
        }
    }
    for (field, port) in [
        ("internalPort", config.internal_port),
        ("externalPort", config.external_port),
    ] {
        if let Some(Err(e)) = port.map(validate_port) {
            errors.add(field, e);
        }
    }
    if let Some(Err(e)) = config
        .dockerfile_path
        .as_deref()
        .map(|p| validate_repo_path(p, "Dockerfile path"))
    {
        errors.add("dockerfilePath", e);
    }
    if let Some(Err(e)) = config
        .build_context
        .as_deref()
        .map(|p| validate_repo_path(p, "Build context"))
    {
        errors.add("buildContext", e);
    }
    for key in config.env.iter().flat_map(|env| env.keys()) {
        if let Err(e) = validate_env_key(key) {
            errors.add("env", e);
        }
    }
    for key in config.build_args.iter().flat_map(|args| args.keys()) {
        if let Err(e) = validate_env_key(key) {
            errors.add("buildArgs", e);
        }
    }
    for spec in config.volumes.iter().flatten() {
        if let Err(e) = validate_volume(spec) {
            errors.add("volumes", e);
        }
    }
}
