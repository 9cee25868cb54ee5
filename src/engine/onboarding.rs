//! Repository inspection for new apps: naming, Dockerfile discovery and the
//! optional `dockhand.json` manifest.

use lazy_static::lazy_static;
use regex::Regex;
use std::path::Path;

use crate::db::AppManifest;

pub const MANIFEST_FILE: &str = "dockhand.json";
pub const DEFAULT_INTERNAL_PORT: u16 = 80;

const DOCKERFILE_CANDIDATES: &[&str] = &["Dockerfile", "dockerfile", "docker/Dockerfile"];

lazy_static! {
    // https://host/owner/name(.git), ssh://git@host/owner/name, git@host:owner/name.git
    static ref REPO_URL: Regex = Regex::new(
        r"^(?:(?:https?|ssh|git)://)?(?:[^@/\s]+@)?[^/:\s]+(?::\d+)?[/:]([^/\s]+)/([^/\s]+?)(?:\.git)?/?$"
    )
    .unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Lowercase `[a-z0-9_.-]` form of the repository name, usable as a
    /// container name and image repository.
    pub fn slug(&self) -> Option<String> {
        let mut slug = String::with_capacity(self.name.len());
        for c in self.name.chars().flat_map(char::to_lowercase) {
            let c = if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            };
            if !(c == '-' && slug.ends_with('-')) {
                slug.push(c);
            }
        }
        let slug = slug
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .to_string();
        if slug.is_empty() {
            None
        } else {
            Some(slug)
        }
    }
}

pub fn parse_repo_url(url: &str) -> Option<RepoRef> {
    let caps = REPO_URL.captures(url.trim())?;
    Some(RepoRef {
        owner: caps[1].to_string(),
        name: caps[2].to_string(),
    })
}

/// First Dockerfile found, as a `./`-prefixed path relative to the repo root.
pub fn detect_dockerfile(repo: &Path) -> Option<String> {
    DOCKERFILE_CANDIDATES
        .iter()
        .find(|candidate| repo.join(candidate).is_file())
        .map(|candidate| format!("./{}", candidate))
}

/// Reads the manifest if present. A malformed manifest is logged and ignored.
pub fn read_manifest(repo: &Path) -> Option<AppManifest> {
    let path = repo.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            tracing::warn!("Ignoring malformed {}: {}", path.display(), e);
            None
        }
    }
}
